//! Tracing setup.
//!
//! Logs go to a daily-rotated file when a log directory is configured and to
//! stderr otherwise. `RUST_LOG` overrides the configured level. Initializing
//! more than once is a no-op.

use color_eyre::{eyre::eyre, Result};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

const LOG_FILE_NAME: &str = "txsync.log";

/// Keeps the file writer flushing for the lifetime of the process.
static LOG_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

pub fn init(config: &LogConfig) -> Result<()> {
  if LOG_GUARD.get().is_some() {
    return Ok(());
  }

  let level = normalize_level(&config.level)?;
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

  let guard = match &config.dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

      Some(guard)
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

      None
    }
  };

  let _ = LOG_GUARD.set(guard);
  tracing::info!(version = env!("CARGO_PKG_VERSION"), level, "Logging initialized");

  Ok(())
}

fn normalize_level(level: &str) -> Result<&'static str> {
  match level.trim().to_ascii_lowercase().as_str() {
    "trace" => Ok("trace"),
    "debug" => Ok("debug"),
    "info" => Ok("info"),
    "warn" | "warning" => Ok("warn"),
    "error" => Ok("error"),
    other => Err(eyre!(
      "Unsupported log level '{}'; expected trace, debug, info, warn or error",
      other
    )),
  }
}
