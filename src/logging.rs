//! Process-wide tracing setup.
//!
//! Writes to stdout and to a daily log file under `<base>/logs`. The filter
//! defaults to `info` and honours `RUST_LOG`.

use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::paths::AppPaths;
use crate::{EngineError, Result};

const LOG_FILE_PREFIX: &str = "mediafetch.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Subsequent calls are no-ops.
pub fn init(paths: &AppPaths) -> Result<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let log_dir = paths.logs_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .map_err(|e| EngineError::Logging(e.to_string()))?;

    let _ = LOG_GUARD.set(guard);
    tracing::info!(log_dir = %log_dir.display(), "logging initialized");
    Ok(())
}
