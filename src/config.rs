use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::strategy::WarmingStrategy;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
  pub stores: StoresConfig,
  pub engine: EngineConfig,
  /// Defaults applied to optimistic mutations
  pub mutations: MutationConfig,
  pub offline: OfflineConfig,
  pub logging: LoggingConfig,
}

/// Bounds for a single cache store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StoreConfig {
  pub max_size_bytes: usize,
  pub max_entries: usize,
  pub default_ttl_ms: u64,
  /// Interval of the expiry sweep; 0 disables it
  pub gc_interval_ms: u64,
}

impl StoreConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_millis(self.default_ttl_ms)
  }

  pub fn gc_interval(&self) -> Option<Duration> {
    (self.gc_interval_ms > 0).then(|| Duration::from_millis(self.gc_interval_ms))
  }
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      max_size_bytes: 50 * 1024 * 1024,
      max_entries: 1000,
      default_ttl_ms: 5 * 60 * 1000,
      gc_interval_ms: 60 * 1000,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoresConfig {
  pub general: StoreConfig,
  pub images: StoreConfig,
  pub api: StoreConfig,
  pub user: StoreConfig,
}

impl Default for StoresConfig {
  fn default() -> Self {
    Self {
      general: StoreConfig::default(),
      images: StoreConfig {
        max_size_bytes: 100 * 1024 * 1024,
        max_entries: 500,
        default_ttl_ms: 30 * 60 * 1000,
        gc_interval_ms: 5 * 60 * 1000,
      },
      api: StoreConfig {
        max_size_bytes: 20 * 1024 * 1024,
        max_entries: 2000,
        default_ttl_ms: 2 * 60 * 1000,
        gc_interval_ms: 30 * 1000,
      },
      user: StoreConfig {
        max_size_bytes: 10 * 1024 * 1024,
        max_entries: 500,
        default_ttl_ms: 10 * 60 * 1000,
        gc_interval_ms: 2 * 60 * 1000,
      },
    }
  }
}

/// Strategy engine settings, mostly cache warming.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
  pub warming_enabled: bool,
  pub warming_interval_ms: u64,
  pub warming_strategy: WarmingStrategy,
  pub warming_threshold: f64,
  pub max_warming_batch_size: usize,
}

impl EngineConfig {
  pub fn warming_interval(&self) -> Duration {
    Duration::from_millis(self.warming_interval_ms)
  }
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      warming_enabled: true,
      warming_interval_ms: 5 * 60 * 1000,
      warming_strategy: WarmingStrategy::Smart,
      warming_threshold: 3.0,
      max_warming_batch_size: 10,
    }
  }
}

/// Timeout, retry and rollback policy for one optimistic mutation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MutationConfig {
  pub timeout_ms: u64,
  pub max_retries: u32,
  pub retry_on_failure: bool,
  pub rollback_on_error: bool,
  /// TTL for speculative cache entries; the store default applies when unset
  pub ttl_ms: Option<u64>,
}

impl MutationConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }

  pub fn ttl(&self) -> Option<Duration> {
    self.ttl_ms.map(Duration::from_millis)
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout_ms = timeout.as_millis() as u64;
    self
  }

  pub fn with_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self.retry_on_failure = max_retries > 0;
    self
  }

  pub fn with_rollback(mut self, rollback_on_error: bool) -> Self {
    self.rollback_on_error = rollback_on_error;
    self
  }
}

impl Default for MutationConfig {
  fn default() -> Self {
    Self {
      timeout_ms: 10_000,
      max_retries: 3,
      retry_on_failure: true,
      rollback_on_error: true,
      ttl_ms: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct OfflineConfig {
  /// SQLite file for the offline queue; queued operations stay in memory when unset
  pub database_path: Option<PathBuf>,
  pub sync_interval_ms: u64,
  /// Replay attempts before a queued operation is reported as failed
  pub max_attempts: u32,
}

impl OfflineConfig {
  pub fn sync_interval(&self) -> Duration {
    Duration::from_millis(self.sync_interval_ms)
  }
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self {
      database_path: None,
      sync_interval_ms: 30_000,
      max_attempts: 5,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
  pub level: String,
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Resolve and load the configuration.
  ///
  /// An explicit path must exist. Otherwise `./optistore.yaml` and then
  /// `$XDG_CONFIG_HOME/optistore/config.yaml` are tried, and the built-in
  /// defaults apply when neither is present.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = match explicit_path {
      Some(p) if !p.exists() => return Err(eyre!("Config file not found: {}", p.display())),
      Some(p) => Some(p.to_path_buf()),
      None => Self::search_paths().into_iter().find(|p| p.exists()),
    };
    let Some(path) = path else {
      return Ok(Self::default());
    };

    let contents = std::fs::read_to_string(&path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::from_yaml(&contents).map_err(|e| eyre!("{} in {}", e, path.display()))
  }

  fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("optistore.yaml")];
    paths.extend(dirs::config_dir().map(|dir| dir.join("optistore").join("config.yaml")));
    paths
  }

  pub fn from_yaml(contents: &str) -> crate::Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| crate::Error::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> crate::Result<()> {
    for (name, store) in [
      ("general", &self.stores.general),
      ("images", &self.stores.images),
      ("api", &self.stores.api),
      ("user", &self.stores.user),
    ] {
      if store.max_entries == 0 || store.max_size_bytes == 0 {
        return Err(crate::Error::Config(format!(
          "store '{}' must allow at least one entry and one byte",
          name
        )));
      }
    }
    if self.engine.warming_enabled && self.engine.warming_interval_ms == 0 {
      return Err(crate::Error::Config(
        "warming_interval_ms must be positive when warming is enabled".to_string(),
      ));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_yaml_fills_defaults() {
    let config = Config::from_yaml(
      r#"
stores:
  images:
    max_size_bytes: 1024
    max_entries: 4
    default_ttl_ms: 1000
    gc_interval_ms: 0
engine:
  warming_strategy: conservative
mutations:
  max_retries: 1
"#,
    )
    .unwrap();

    assert_eq!(config.stores.images.max_entries, 4);
    assert_eq!(config.stores.images.gc_interval(), None);
    assert_eq!(config.stores.general, StoreConfig::default());
    assert_eq!(config.engine.warming_strategy, WarmingStrategy::Conservative);
    assert_eq!(config.engine.max_warming_batch_size, 10);
    assert_eq!(config.mutations.max_retries, 1);
    assert!(config.mutations.rollback_on_error);
  }

  #[test]
  fn test_unknown_strategy_rejected() {
    let err = Config::from_yaml("engine:\n  warming_strategy: eager\n").unwrap_err();
    assert!(matches!(err, crate::Error::Config(_)));
  }

  #[test]
  fn test_zero_capacity_rejected() {
    let err = Config::from_yaml(
      "stores:\n  api:\n    max_size_bytes: 0\n    max_entries: 1\n    default_ttl_ms: 1\n    gc_interval_ms: 0\n",
    )
    .unwrap_err();
    assert!(matches!(err, crate::Error::Config(_)));
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/optistore.yaml"))).is_err());
  }

  #[test]
  fn test_load_explicit_file_validates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("optistore.yaml");

    std::fs::write(&path, "mutations:\n  timeout_ms: 250\n").unwrap();
    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.mutations.timeout(), Duration::from_millis(250));

    std::fs::write(&path, "engine:\n  warming_interval_ms: 0\n").unwrap();
    let err = Config::load(Some(&path)).unwrap_err().to_string();
    assert!(err.contains("warming_interval_ms"));
    assert!(err.contains("optistore.yaml"));
  }
}
