//! Tracing subscriber setup
//!
//! Human-readable output on stderr by default. With a log file, output goes
//! to that file as JSON lines through a non-blocking writer. `RUST_LOG`
//! overrides the configured level.

use anyhow::{Context, Result};
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Build the level filter, letting `RUST_LOG` win over `level`
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber
///
/// The returned guard flushes the file writer on drop and must live as
/// long as the process.
pub fn init_logging(level: &str, logfile: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(level);

    let Some(logfile) = logfile else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .context("failed to install tracing subscriber")?;
        return Ok(None);
    };

    let dir = logfile
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = logfile
        .file_name()
        .with_context(|| format!("log file {} has no file name", logfile.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer),
        )
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(Some(guard))
}
