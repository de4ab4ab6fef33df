use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::TtlClass;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
  /// Database file (defaults to $XDG_DATA_HOME/apicache/cache.db)
  pub db_path: Option<PathBuf>,
  pub ttl: TtlConfig,
  /// Cache entry cap enforced by eviction
  pub max_items: usize,
  /// Soft cap for the offline write queue; the oldest write is dropped past it
  pub max_queue_items: usize,
  pub cleanup_interval_ms: u64,
  /// Failed replays before a queued write is dead-lettered (0 = retry forever)
  pub max_replay_attempts: u32,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      db_path: None,
      ttl: TtlConfig::default(),
      max_items: 500,
      max_queue_items: 100,
      cleanup_interval_ms: 900_000,
      max_replay_attempts: 5,
    }
  }
}

/// Durations behind each TTL class, in seconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TtlConfig {
  pub short_secs: u64,
  pub medium_secs: u64,
  pub long_secs: u64,
}

impl Default for TtlConfig {
  fn default() -> Self {
    Self {
      short_secs: 5 * 60,
      medium_secs: 30 * 60,
      long_secs: 24 * 60 * 60,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./apicache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/apicache/config.yaml
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("apicache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("apicache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    // An empty document means "all defaults"
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Reject settings that would break the entry invariants or spin the scheduler.
  pub fn validate(&self) -> Result<()> {
    if self.max_items == 0 {
      return Err(eyre!("max_items must be greater than zero"));
    }
    if self.max_queue_items == 0 {
      return Err(eyre!("max_queue_items must be greater than zero"));
    }
    if self.cleanup_interval_ms == 0 {
      return Err(eyre!("cleanup_interval_ms must be greater than zero"));
    }
    if self.ttl.short_secs == 0 || self.ttl.medium_secs == 0 || self.ttl.long_secs == 0 {
      return Err(eyre!("TTL durations must be greater than zero"));
    }
    Ok(())
  }

  pub fn ttl_for(&self, class: TtlClass) -> Duration {
    let secs = match class {
      TtlClass::Short => self.ttl.short_secs,
      TtlClass::Medium => self.ttl.medium_secs,
      TtlClass::Long => self.ttl.long_secs,
    };
    Duration::from_secs(secs)
  }

  pub fn cleanup_interval(&self) -> Duration {
    Duration::from_millis(self.cleanup_interval_ms)
  }
}
