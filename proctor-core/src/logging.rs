//! Logging for proctor-sync
//!
//! Logs go to `$XDG_STATE_HOME/proctor-sync/proctor-sync.log.YYYY-MM-DD`,
//! one file per UTC day. Event payloads are never logged; only ids, types
//! and counts.

use crate::config::{Config, LoggingConfig};
use chrono::{NaiveDate, Utc};
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

const LOG_PREFIX: &str = "proctor-sync.log";
const FALLBACK_LEVEL: &str = "info";

/// Initialize the logging system
///
/// - Daily-rotated file in the XDG state directory, keeping `max_files`
/// - Level from `RUST_LOG`, else the config level
/// - Warnings mirrored to stderr when `stderr` is set
pub fn init(config: &LoggingConfig) -> crate::error::Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .max_log_files(config.max_files.max(1))
        .build(&log_dir)
        .map_err(|e| crate::error::Error::Config(format!("failed to create log appender: {}", e)))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let (filter, rejected_level) = build_filter(&config.level);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    let stderr_layer = config.stderr.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .with_filter(LevelFilter::WARN)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    if let Some(level) = rejected_level {
        tracing::warn!(level = %level, "Invalid log level in config, using {}", FALLBACK_LEVEL);
    }
    tracing::info!(
        log_file = %log_file_in(&log_dir, Utc::now().date_naive()).display(),
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// `RUST_LOG` wins over the config level. An unparsable config level falls
/// back to `info` and is returned so it can be reported once logging is up.
fn build_filter(level: &str) -> (EnvFilter, Option<String>) {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return (filter, None);
    }
    match EnvFilter::try_new(level) {
        Ok(filter) => (filter, None),
        Err(_) => (EnvFilter::new(FALLBACK_LEVEL), Some(level.to_string())),
    }
}

/// Initialize logging for tests (logs to the test writer)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Keeps the background writer alive; dropping it flushes pending lines.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// File the appender writes to on `date`
fn log_file_in(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("{}.{}", LOG_PREFIX, date.format("%Y-%m-%d")))
}

/// Today's log file
pub fn log_file_path() -> PathBuf {
    log_file_in(&Config::state_dir(), Utc::now().date_naive())
}
