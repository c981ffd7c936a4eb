use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const ENV_LOG: &str = "HOMEBILLS_LOG";
pub const ENV_LOG_DIR: &str = "HOMEBILLS_LOG_DIR";
const DEFAULT_FILTER: &str = "homebills=info,sqlx=warn";
const LOG_FILE_PREFIX: &str = "homebills.log";

/// Install the JSON subscriber on stderr, plus a daily-rotated file sink when
/// `HOMEBILLS_LOG_DIR` is set. Keep the returned guard alive for the life of
/// the process so buffered file lines are flushed. Safe to call twice.
pub fn init() -> Option<WorkerGuard> {
    let _ = tracing_log::LogTracer::init();

    let filter = EnvFilter::try_new(
        std::env::var(ENV_LOG).unwrap_or_else(|_| DEFAULT_FILTER.into()),
    )
    .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let stderr_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_timer(UtcTime::rfc_3339())
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}

fn log_dir() -> Option<PathBuf> {
    std::env::var_os(ENV_LOG_DIR)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}
