//! Per-house and per-group financial roll-ups: storage, cache, full
//! recompute, incremental refresh and the write-side invalidation hook.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::AppConfig;
use crate::AppResult;

pub mod cache;
pub mod calculator;
pub mod invalidation;
pub mod repo;
pub mod service;

pub use cache::{CacheKey, PivotalCache, Ticket};
pub use calculator::PivotalCalculator;
pub use invalidation::PivotalInvalidator;
pub use repo::{
    GroupPivotalRepository, HousePivotalRepository, PivotalColumn, PivotalRepository,
    StoredPivotal,
};
pub use service::PivotalService;

/// How often a pool-bound operation is re-run after a transient store error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            backoff: Duration::ZERO,
        }
    }
}

impl From<&AppConfig> for RetryPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            retries: config.recompute_retries,
            backoff: config.retry_backoff,
        }
    }
}

/// Linear backoff: the n-th retry sleeps `n * backoff`.
pub(crate) async fn retry_transient<R, F, Fut>(
    policy: RetryPolicy,
    operation: &'static str,
    source_id: &str,
    mut attempt: F,
) -> AppResult<R>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<R>>,
{
    let mut retried = 0u32;
    loop {
        match attempt().await {
            Err(err) if err.is_transient() && retried < policy.retries => {
                retried += 1;
                warn!(
                    target: "homebills",
                    event = "pivotal_retry",
                    operation,
                    source_id = %source_id,
                    attempt = retried,
                    error = %err
                );
                tokio::time::sleep(policy.backoff * retried).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::STORE_TRANSIENT;
    use crate::AppError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn transient_errors_are_retried_up_to_the_limit() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            retries: 2,
            backoff: Duration::from_millis(1),
        };
        let result: AppResult<()> = retry_transient(policy, "test", "h1", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::new(STORE_TRANSIENT, "busy"))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: AppResult<()> = retry_transient(RetryPolicy::from(&AppConfig::default()), "test", "h1", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::house_not_found("h1"))
        })
        .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_after_a_transient_failure() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            retries: 3,
            backoff: Duration::ZERO,
        };
        let value = retry_transient(policy, "test", "h1", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AppError::new("Sqlite/5", "database is locked"))
            } else {
                Ok(7)
            }
        })
        .await
        .expect("second attempt succeeds");
        assert_eq!(value, 7);
    }
}
