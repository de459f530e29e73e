//! Persistent key-value storage trait and its SQLite and in-memory backends.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Key holding the canonical record list.
pub const RECORDS_KEY: &str = "records";
/// Key holding the mirror of the last known-good read.
pub const MIRROR_KEY: &str = "records_mirror";
/// Key holding the pending operation queue.
pub const QUEUE_KEY: &str = "pending_ops";
/// Key holding the persisted dashboard snapshot.
pub const DASHBOARD_KEY: &str = "dashboard_snapshot";
/// Key holding sync bookkeeping.
pub const SETTINGS_KEY: &str = "settings";

/// Durable async storage of JSON blobs under string keys.
///
/// Each `set` replaces the whole value atomically.
pub trait KeyValueStore: Send + Sync + 'static {
  /// Read the value stored under `key`, if any.
  fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

  /// Replace the value stored under `key`.
  fn set(&self, key: &str, value: String) -> impl Future<Output = Result<()>> + Send;
}

/// Store that keeps everything in process memory.
/// Used when persistence is disabled in the config.
#[derive(Default)]
pub struct MemoryStore {
  values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryStore {
  async fn get(&self, key: &str) -> Result<Option<String>> {
    let values = self
      .values
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(values.get(key).cloned())
  }

  async fn set(&self, key: &str, value: String) -> Result<()> {
    let mut values = self
      .values
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    values.insert(key.to_string(), value);
    Ok(())
  }
}

/// SQLite-backed key-value store.
pub struct SqliteStore {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("spendsync").join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(())
  }
}

const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStore for SqliteStore {
  async fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = Arc::clone(&self.conn);
    let key = key.to_string();

    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      conn
        .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
          row.get(0)
        })
        .optional()
        .map_err(|e| eyre!("Failed to read key {}: {}", key, e))
    })
    .await
    .map_err(|e| eyre!("Storage task failed: {}", e))?
  }

  async fn set(&self, key: &str, value: String) -> Result<()> {
    let conn = Arc::clone(&self.conn);
    let key = key.to_string();

    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      conn
        .execute(
          "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
          params![key, value],
        )
        .map_err(|e| eyre!("Failed to write key {}: {}", key, e))?;
      Ok(())
    })
    .await
    .map_err(|e| eyre!("Storage task failed: {}", e))?
  }
}
