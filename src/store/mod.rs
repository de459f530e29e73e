//! Durable local state: the key-value store and everything layered on it.
//!
//! - `kv` is the persistence seam (SQLite or in-memory)
//! - `records` is the canonical record list with its read caches
//! - `settings` holds sync bookkeeping

mod entry;
pub mod kv;
mod records;
mod settings;

pub use kv::{KeyValueStore, MemoryStore, SqliteStore};
pub use records::{Mutation, RecordStore};
pub use settings::SyncSettings;
