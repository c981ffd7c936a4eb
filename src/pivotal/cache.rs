use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

use crate::config::CacheConfig;
use crate::model::Pivotal;

/// Keys remembered for ticket checks after their invalidation.
const INVALIDATION_LOG_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    House(String),
    Group(String),
}

impl CacheKey {
    pub fn source_id(&self) -> &str {
        match self {
            CacheKey::House(id) | CacheKey::Group(id) => id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            CacheKey::House(_) => "house",
            CacheKey::Group(_) => "group",
        }
    }
}

/// Proof that a reader started before any later invalidation of its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

struct Entry {
    value: Pivotal,
    stored_at: Instant,
}

struct Inner {
    entries: LruCache<CacheKey, Entry>,
    /// Generation of the latest invalidation per key.
    invalidated: LruCache<CacheKey, u64>,
    /// Tickets below this may predate an invalidation that fell out of the log.
    floor: u64,
    generation: u64,
}

/// Process-wide memo of committed pivotal values. The lock is never held
/// across I/O.
pub struct PivotalCache {
    inner: Mutex<Inner>,
    ttl: Option<Duration>,
}

impl Default for PivotalCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl PivotalCache {
    pub fn new(config: &CacheConfig) -> Self {
        let entries = match config.max_entries {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        let log_cap = NonZeroUsize::new(INVALIDATION_LOG_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries,
                invalidated: LruCache::new(log_cap),
                floor: 0,
                generation: 0,
            }),
            ttl: config.ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn find(&self, key: &CacheKey) -> Option<Pivotal> {
        let mut inner = self.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) => self
                .ttl
                .is_some_and(|ttl| entry.stored_at.elapsed() >= ttl),
            None => {
                debug!(target: "homebills", event = "pivotal_cache_miss", kind = key.kind(), source_id = %key.source_id());
                return None;
            }
        };
        if expired {
            inner.entries.pop(key);
            debug!(target: "homebills", event = "pivotal_cache_expired", kind = key.kind(), source_id = %key.source_id());
            return None;
        }
        debug!(target: "homebills", event = "pivotal_cache_hit", kind = key.kind(), source_id = %key.source_id());
        inner.entries.peek(key).map(|entry| entry.value.clone())
    }

    /// Insert or overwrite.
    pub fn add(&self, key: CacheKey, value: Pivotal) {
        let mut inner = self.lock();
        Self::put(&mut inner, key, value);
    }

    pub fn invalidate(&self, key: &CacheKey) {
        let mut inner = self.lock();
        inner.generation += 1;
        let generation = inner.generation;
        let removed = inner.entries.pop(key).is_some();
        if let Some((evicted, evicted_gen)) = inner.invalidated.push(key.clone(), generation) {
            if &evicted != key {
                inner.floor = inner.floor.max(evicted_gen);
            }
        }
        debug!(
            target: "homebills",
            event = "pivotal_cache_invalidate",
            kind = key.kind(),
            source_id = %key.source_id(),
            removed
        );
    }

    /// Take before reading the store; pass to [`PivotalCache::add_if_current`].
    /// Tickets are global generations, checked per key on publication.
    pub fn ticket(&self) -> Ticket {
        Ticket(self.lock().generation)
    }

    /// Publishes `value` unless `key` was invalidated after `ticket` was
    /// taken. Returns whether the value was stored.
    pub fn add_if_current(&self, key: CacheKey, ticket: Ticket, value: Pivotal) -> bool {
        let mut inner = self.lock();
        let stale = ticket.0 < inner.floor
            || inner
                .invalidated
                .peek(&key)
                .is_some_and(|generation| *generation > ticket.0);
        if stale {
            debug!(
                target: "homebills",
                event = "pivotal_cache_publish_skipped",
                kind = key.kind(),
                source_id = %key.source_id()
            );
            return false;
        }
        Self::put(&mut inner, key, value);
        true
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn put(inner: &mut Inner, key: CacheKey, value: Pivotal) {
        let entry = Entry {
            value,
            stored_at: Instant::now(),
        };
        if let Some((evicted, _)) = inner.entries.push(key.clone(), entry) {
            if evicted != key {
                debug!(
                    target: "homebills",
                    event = "pivotal_cache_evict",
                    kind = evicted.kind(),
                    source_id = %evicted.source_id()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pivotal(income: f64) -> Pivotal {
        let mut p = Pivotal::new();
        p.add_income(income);
        p
    }

    fn house(id: &str) -> CacheKey {
        CacheKey::House(id.to_string())
    }

    #[test]
    fn add_find_invalidate() {
        let cache = PivotalCache::default();
        assert!(cache.find(&house("h1")).is_none());

        cache.add(house("h1"), pivotal(10.0));
        assert_eq!(cache.find(&house("h1")).map(|p| p.income), Some(10.0));

        cache.add(house("h1"), pivotal(20.0));
        assert_eq!(cache.find(&house("h1")).map(|p| p.income), Some(20.0));

        cache.invalidate(&house("h1"));
        assert!(cache.find(&house("h1")).is_none());
        // Idempotent.
        cache.invalidate(&house("h1"));
    }

    #[test]
    fn house_and_group_keys_do_not_collide() {
        let cache = PivotalCache::default();
        cache.add(CacheKey::House("x".into()), pivotal(1.0));
        cache.add(CacheKey::Group("x".into()), pivotal(2.0));
        cache.invalidate(&CacheKey::House("x".into()));
        assert_eq!(
            cache.find(&CacheKey::Group("x".into())).map(|p| p.income),
            Some(2.0)
        );
    }

    #[test]
    fn lru_bound_evicts_least_recent() {
        let cache = PivotalCache::new(&CacheConfig {
            max_entries: NonZeroUsize::new(2),
            ttl: None,
        });
        cache.add(house("a"), pivotal(1.0));
        cache.add(house("b"), pivotal(2.0));
        assert!(cache.find(&house("a")).is_some());
        cache.add(house("c"), pivotal(3.0));
        assert_eq!(cache.len(), 2);
        assert!(cache.find(&house("b")).is_none());
        assert!(cache.find(&house("a")).is_some());
        assert!(cache.find(&house("c")).is_some());
    }

    #[test]
    fn ttl_expires_entries() {
        let cache = PivotalCache::new(&CacheConfig {
            max_entries: None,
            ttl: Some(Duration::from_millis(20)),
        });
        cache.add(house("a"), pivotal(1.0));
        assert!(cache.find(&house("a")).is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.find(&house("a")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn ticket_rejects_publication_after_invalidation() {
        let cache = PivotalCache::default();
        let ticket = cache.ticket();
        cache.invalidate(&house("h1"));
        assert!(!cache.add_if_current(house("h1"), ticket, pivotal(1.0)));
        assert!(cache.find(&house("h1")).is_none());

        let fresh = cache.ticket();
        assert!(cache.add_if_current(house("h1"), fresh, pivotal(2.0)));
        assert_eq!(cache.find(&house("h1")).map(|p| p.income), Some(2.0));
    }

    #[test]
    fn invalidating_another_key_keeps_ticket_valid() {
        let cache = PivotalCache::default();
        let ticket = cache.ticket();
        cache.invalidate(&house("h2"));
        assert!(cache.add_if_current(house("h1"), ticket, pivotal(1.0)));
    }

    #[test]
    fn overflowing_the_log_raises_the_floor() {
        let cache = PivotalCache::default();
        let old = cache.ticket();
        for i in 0..=INVALIDATION_LOG_CAPACITY {
            cache.invalidate(&house(&format!("other-{i}")));
        }
        assert!(!cache.add_if_current(house("h0"), old, pivotal(1.0)));
        let fresh = cache.ticket();
        assert!(cache.add_if_current(house("h0"), fresh, pivotal(1.0)));
    }
}
