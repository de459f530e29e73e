//! Sync bookkeeping persisted under the settings key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::kv::{KeyValueStore, SETTINGS_KEY};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
  /// Last drain that applied at least one operation
  #[serde(default)]
  pub last_sync_at: Option<DateTime<Utc>>,
  /// Last successful remote pull
  #[serde(default)]
  pub last_pull_at: Option<DateTime<Utc>>,
}

impl SyncSettings {
  /// Load settings, falling back to defaults on any failure.
  pub async fn load<S: KeyValueStore>(kv: &S) -> Self {
    match kv.get(SETTINGS_KEY).await {
      Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
        warn!(error = %e, "Stored settings are unreadable, using defaults");
        Self::default()
      }),
      Ok(None) => Self::default(),
      Err(e) => {
        warn!(error = %e, "Failed to read settings");
        Self::default()
      }
    }
  }

  /// Read-modify-write a settings change. Failures are logged.
  pub async fn update<S: KeyValueStore>(kv: &S, change: impl FnOnce(&mut SyncSettings)) {
    let mut settings = Self::load(kv).await;
    change(&mut settings);

    match serde_json::to_string(&settings) {
      Ok(json) => {
        if let Err(e) = kv.set(SETTINGS_KEY, json).await {
          warn!(error = %e, "Failed to persist settings");
        }
      }
      Err(e) => warn!(error = %e, "Failed to serialize settings"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;

  #[tokio::test]
  async fn test_update_preserves_other_fields() {
    let kv = MemoryStore::new();
    let pulled = Utc::now();

    SyncSettings::update(&kv, |s| s.last_pull_at = Some(pulled)).await;
    SyncSettings::update(&kv, |s| s.last_sync_at = Some(pulled)).await;

    let settings = SyncSettings::load(&kv).await;
    assert_eq!(settings.last_pull_at, Some(pulled));
    assert_eq!(settings.last_sync_at, Some(pulled));
  }
}
