use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::ReplicationConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub store: StoreConfig,
  /// Remote store to keep in sync with; no replication when unset
  pub remote: Option<RemoteConfig>,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  /// Local database file (defaults to $XDG_DATA_HOME/txsync/ledger.db)
  pub path: Option<PathBuf>,
}

impl StoreConfig {
  /// The configured path, or the default location under the data directory.
  pub fn resolved_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("txsync").join("ledger.db"))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Database file of the remote store
  pub path: PathBuf,
  /// Keep replicating after catching up
  #[serde(default = "default_true")]
  pub live: bool,
  /// Retry with backoff when replication fails
  #[serde(default = "default_true")]
  pub retry: bool,
  #[serde(default = "default_initial_backoff_ms")]
  pub initial_backoff_ms: u64,
  #[serde(default = "default_max_backoff_ms")]
  pub max_backoff_ms: u64,
}

/// Lower bound on the retry delay so a persistent failure never spins.
const MIN_BACKOFF_MS: u64 = 10;

impl RemoteConfig {
  pub fn replication(&self) -> ReplicationConfig {
    let initial_backoff_ms = self.initial_backoff_ms.max(MIN_BACKOFF_MS);
    ReplicationConfig {
      live: self.live,
      retry: self.retry,
      initial_backoff: Duration::from_millis(initial_backoff_ms),
      max_backoff: Duration::from_millis(self.max_backoff_ms.max(initial_backoff_ms)),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// trace, debug, info, warn or error; RUST_LOG takes precedence
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write daily-rotated log files here instead of stderr
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      dir: None,
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_initial_backoff_ms() -> u64 {
  1_000
}

fn default_max_backoff_ms() -> u64 {
  60_000
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./txsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/txsync/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("txsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("txsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file is valid and means "all defaults"
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }
}
