use std::env;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const ENV_DB_PATH: &str = "HOMEBILLS_DB_PATH";
pub const ENV_CACHE_MAX_ENTRIES: &str = "HOMEBILLS_CACHE_MAX_ENTRIES";
pub const ENV_CACHE_TTL_SECS: &str = "HOMEBILLS_CACHE_TTL_SECS";
pub const ENV_RECOMPUTE_RETRIES: &str = "HOMEBILLS_RECOMPUTE_RETRIES";
pub const ENV_RETRY_BACKOFF_MS: &str = "HOMEBILLS_RETRY_BACKOFF_MS";
pub const ENV_WATERMARK_GUARD_MS: &str = "HOMEBILLS_WATERMARK_GUARD_MS";

const DEFAULT_RECOMPUTE_RETRIES: u32 = 3;
const HARD_MAX_RECOMPUTE_RETRIES: u32 = 10;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 50;
const DEFAULT_WATERMARK_GUARD_MS: u64 = 1;
const HARD_MAX_WATERMARK_GUARD_MS: u64 = 1_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    NotAnInteger { var: &'static str, value: String },
    #[error("could not determine a data directory for the database")]
    NoDataDir,
}

/// Options for the in-memory pivotal cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheConfig {
    /// Upper bound on retained keys, LRU eviction. `None` is unlimited.
    pub max_entries: Option<NonZeroUsize>,
    /// Entries older than this are treated as misses. `None` disables expiry.
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub db_path: Option<PathBuf>,
    pub cache: CacheConfig,
    pub recompute_retries: u32,
    pub retry_backoff: Duration,
    /// Added to a stored watermark before it is used as the lower bound of an
    /// incremental query.
    pub watermark_guard: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            cache: CacheConfig::default(),
            recompute_retries: DEFAULT_RECOMPUTE_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            watermark_guard: Duration::from_millis(DEFAULT_WATERMARK_GUARD_MS),
        }
    }
}

impl AppConfig {
    /// Load from the process environment. Malformed values are logged and the
    /// default is kept.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AppConfig::default();
        let read = |var: &'static str| -> Option<u64> {
            let raw = lookup(var)?;
            match parse_u64(var, &raw) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!(
                        target: "homebills",
                        event = "config_value_invalid",
                        var,
                        value = %raw,
                        error = %err
                    );
                    None
                }
            }
        };

        let max_entries = read(ENV_CACHE_MAX_ENTRIES)
            .and_then(|value| usize::try_from(value).ok())
            .and_then(NonZeroUsize::new);

        let ttl = read(ENV_CACHE_TTL_SECS)
            .filter(|value| *value > 0)
            .map(Duration::from_secs);

        let recompute_retries = read(ENV_RECOMPUTE_RETRIES)
            .map(|value| value.min(u64::from(HARD_MAX_RECOMPUTE_RETRIES)) as u32)
            .unwrap_or(defaults.recompute_retries);

        let retry_backoff = read(ENV_RETRY_BACKOFF_MS)
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_backoff);

        let watermark_guard = read(ENV_WATERMARK_GUARD_MS)
            .map(|value| {
                if value > HARD_MAX_WATERMARK_GUARD_MS {
                    tracing::warn!(
                        target: "homebills",
                        event = "config_value_clamped",
                        var = ENV_WATERMARK_GUARD_MS,
                        value,
                        max = HARD_MAX_WATERMARK_GUARD_MS
                    );
                }
                Duration::from_millis(value.min(HARD_MAX_WATERMARK_GUARD_MS))
            })
            .unwrap_or(defaults.watermark_guard);

        Self {
            db_path: lookup(ENV_DB_PATH)
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
            cache: CacheConfig { max_entries, ttl },
            recompute_retries,
            retry_backoff,
            watermark_guard,
        }
    }

    /// Explicit path, or `<data_dir>/homebills/homebills.sqlite3`.
    pub fn resolve_db_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.db_path {
            return Ok(path.clone());
        }
        let base = dirs::data_dir().ok_or(ConfigError::NoDataDir)?;
        Ok(base.join("homebills").join("homebills.sqlite3"))
    }
}

fn parse_u64(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::NotAnInteger {
            var,
            value: raw.to_string(),
        })
}
