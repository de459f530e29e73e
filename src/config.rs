use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dashboard::AggregateOptions;
use crate::sync::SyncOptions;

/// Environment variable that supplies or overrides the endpoint URL.
pub const ENDPOINT_ENV: &str = "SPENDSYNC_ENDPOINT";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub dashboard: DashboardConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Spreadsheet web app URL
  pub endpoint: String,
  /// Endpoint accepts `action: "update"` as an upsert
  #[serde(default)]
  pub native_update: bool,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database path (defaults to the platform data directory)
  pub path: Option<PathBuf>,
  /// Keep everything in memory; nothing survives the process
  #[serde(default)]
  pub in_memory: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub read_ttl_secs: u64,
  pub mirror_ttl_secs: u64,
  pub dashboard_ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      read_ttl_secs: 300,
      mirror_ttl_secs: 600,
      dashboard_ttl_secs: 3600,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub interval_secs: u64,
  pub throttle_interval_ms: u64,
  pub retry_base_secs: u64,
  pub retry_max_secs: u64,
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: 300,
      throttle_interval_ms: 500,
      retry_base_secs: 30,
      retry_max_secs: 1800,
      probe_interval_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
  pub lookback_months: u32,
  pub lookback_quarters: u32,
  pub moving_average_window: u32,
}

impl Default for DashboardConfig {
  fn default() -> Self {
    let defaults = AggregateOptions::default();
    Self {
      lookback_months: defaults.lookback_months,
      lookback_quarters: defaults.lookback_quarters,
      moving_average_window: defaults.moving_average_window,
    }
  }
}

fn default_request_timeout() -> u64 {
  30
}

fn secs(s: u64) -> chrono::Duration {
  let s = i64::try_from(s).unwrap_or(i64::MAX).min(i64::MAX / 1000);
  chrono::Duration::seconds(s)
}

impl Config {
  /// Load configuration.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./spendsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/spendsync/config.yaml
  /// 4. Defaults, if SPENDSYNC_ENDPOINT is set
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

    let endpoint_override = std::env::var(ENDPOINT_ENV).ok();

    let mut config = match (path, endpoint_override.as_deref()) {
      (Some(p), _) => Self::load_from_path(&p)?,
      (None, Some(endpoint)) => Self::with_endpoint(endpoint),
      (None, None) => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/spendsync/config.yaml\n\
           or set {} to the endpoint URL.",
          ENDPOINT_ENV
        ))
      }
    };

    if let Some(endpoint) = endpoint_override {
      config.remote.endpoint = endpoint;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("spendsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("spendsync").join("config.yaml");
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
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Default configuration pointing at `endpoint`.
  pub fn with_endpoint(endpoint: &str) -> Self {
    Self {
      remote: RemoteConfig {
        endpoint: endpoint.to_string(),
        native_update: false,
        request_timeout_secs: default_request_timeout(),
      },
      storage: StorageConfig::default(),
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      dashboard: DashboardConfig::default(),
    }
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.remote.endpoint)
      .map_err(|e| eyre!("Invalid endpoint URL '{}': {}", self.remote.endpoint, e))?;
    Ok(())
  }

  pub fn read_ttl(&self) -> chrono::Duration {
    secs(self.cache.read_ttl_secs)
  }

  pub fn mirror_ttl(&self) -> chrono::Duration {
    secs(self.cache.mirror_ttl_secs)
  }

  pub fn dashboard_ttl(&self) -> chrono::Duration {
    secs(self.cache.dashboard_ttl_secs)
  }

  pub fn throttle_interval(&self) -> Duration {
    Duration::from_millis(self.sync.throttle_interval_ms)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.sync.probe_interval_secs.max(1))
  }

  pub fn sync_options(&self) -> SyncOptions {
    SyncOptions {
      interval: Duration::from_secs(self.sync.interval_secs.max(1)),
      retry_base: Duration::from_secs(self.sync.retry_base_secs),
      retry_max: Duration::from_secs(self.sync.retry_max_secs),
      native_update: self.remote.native_update,
    }
  }

  pub fn aggregate_options(&self) -> AggregateOptions {
    AggregateOptions {
      lookback_months: self.dashboard.lookback_months,
      lookback_quarters: self.dashboard.lookback_quarters,
      moving_average_window: self.dashboard.moving_average_window,
    }
  }
}
