//! Server logging via tracing.
//!
//! File layer writes JSON with daily rotation under the log root;
//! stdout gets the human format. The returned guard keeps the
//! non-blocking writer alive for the process lifetime.

use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Initialize the global subscriber. Returns the appender guard.
pub fn init(log_level: &str, log_dir: &Path, stdout: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let env_filter = EnvFilter::builder()
        .with_default_directive(log_level.parse()?)
        .from_env_lossy();

    let file_appender = rolling::daily(log_dir, "server.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    if stdout {
        let stdout_filter = EnvFilter::builder()
            .with_default_directive(log_level.parse()?)
            .from_env_lossy();
        let stdout_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_target(false)
            .with_filter(stdout_filter);

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stdout_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(file_layer).init();
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        // A second global init in the same process fails; only assert the
        // directory side effect.
        let _ = init("info", &log_dir, false);
        assert!(log_dir.exists());
    }
}
