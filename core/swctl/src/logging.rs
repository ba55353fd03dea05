//! File logging for swctl.
//!
//! stdout carries command output, so logs go to a daily file under
//! `~/.coachly/logs`. The returned guard flushes the writer on drop.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "swctl.log";

pub fn init() -> Option<WorkerGuard> {
    let log_dir = sw_core::default_log_dir().ok()?;
    fs_err::create_dir_all(&log_dir).ok()?;

    let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}
