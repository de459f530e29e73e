//! Local record store fronted by an in-memory read cache and a persisted mirror.
//!
//! Reads go through three tiers, freshest first:
//! 1. In-memory read cache (short TTL)
//! 2. Mirror cache persisted alongside the records (freshness-gated)
//! 3. The canonical record list in the key-value store
//!
//! Concurrent cold reads share a single in-flight load.

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::model::Record;

use super::entry::CacheEntry;
use super::kv::{KeyValueStore, MIRROR_KEY, RECORDS_KEY};

type SharedLoad = Shared<BoxFuture<'static, Vec<Record>>>;

/// A change to the record set.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
  Add(Record),
  Update { old_id: String, record: Record },
  Delete(String),
}

impl Mutation {
  /// Apply to `records`, returning whether anything changed.
  fn apply(self, records: &mut Vec<Record>) -> bool {
    match self {
      Mutation::Add(record) => {
        match records.iter_mut().find(|r| r.id == record.id) {
          Some(existing) => *existing = record,
          None => records.push(record),
        }
        true
      }
      Mutation::Update { old_id, record } => match records.iter_mut().find(|r| r.id == old_id) {
        Some(existing) => {
          *existing = record;
          true
        }
        None => false,
      },
      Mutation::Delete(id) => {
        let before = records.len();
        records.retain(|r| r.id != id);
        records.len() != before
      }
    }
  }
}

#[derive(Default)]
struct ReadState {
  memory: Option<CacheEntry<Vec<Record>>>,
  in_flight: Option<SharedLoad>,
  /// Bumped by every write so a load that raced a write does not clobber it.
  revision: u64,
}

/// Canonical record list with read-through caching.
pub struct RecordStore<S: KeyValueStore> {
  kv: Arc<S>,
  state: Arc<Mutex<ReadState>>,
  read_ttl: Duration,
  mirror_ttl: Duration,
}

impl<S: KeyValueStore> RecordStore<S> {
  pub fn new(kv: Arc<S>) -> Self {
    Self {
      kv,
      state: Arc::new(Mutex::new(ReadState::default())),
      read_ttl: Duration::minutes(5),
      mirror_ttl: Duration::minutes(10),
    }
  }

  /// Set the in-memory cache TTL.
  pub fn with_read_ttl(mut self, ttl: Duration) -> Self {
    self.read_ttl = ttl;
    self
  }

  /// Set the mirror cache TTL.
  pub fn with_mirror_ttl(mut self, ttl: Duration) -> Self {
    self.mirror_ttl = ttl;
    self
  }

  fn lock_state(&self) -> MutexGuard<'_, ReadState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Current record set. Never fails: storage errors degrade to an empty list.
  pub async fn records(&self) -> Vec<Record> {
    let load = {
      let mut state = self.lock_state();
      match &state.in_flight {
        Some(load) => load.clone(),
        None => {
          if let Some(entry) = &state.memory {
            if entry.is_fresh(self.read_ttl) {
              return entry.data.clone();
            }
          }

          let load = load_records(
            Arc::clone(&self.kv),
            Arc::clone(&self.state),
            self.mirror_ttl,
            state.revision,
          )
          .boxed()
          .shared();
          state.in_flight = Some(load.clone());
          load
        }
      }
    };

    load.await
  }

  /// Look up a single record by id.
  pub async fn find(&self, id: &str) -> Option<Record> {
    self.records().await.into_iter().find(|r| r.id == id)
  }

  /// Apply a mutation to the read cache, then persist it.
  ///
  /// Returns `false` when the mutation had nothing to act on (unknown id).
  pub async fn mutate(&self, mutation: Mutation) -> bool {
    let loaded = self.records().await;

    let snapshot = {
      let mut state = self.lock_state();
      let entry = state.memory.get_or_insert_with(|| CacheEntry::now(loaded));
      if !mutation.apply(&mut entry.data) {
        return false;
      }
      entry.captured_at = Utc::now();
      let snapshot = entry.data.clone();
      state.revision += 1;
      snapshot
    };

    self.persist(&snapshot).await;
    true
  }

  /// Replace the whole record set (used after a remote pull).
  pub async fn replace_all(&self, records: Vec<Record>) {
    {
      let mut state = self.lock_state();
      state.memory = Some(CacheEntry::now(records.clone()));
      state.revision += 1;
    }
    self.persist(&records).await;
  }

  /// Drop the in-memory and mirror caches so the next read hits the record list.
  pub async fn invalidate(&self) {
    {
      let mut state = self.lock_state();
      state.memory = None;
      state.revision += 1;
    }

    if let Err(e) = self.kv.set(MIRROR_KEY, "null".to_string()).await {
      warn!(error = %e, "Failed to clear mirror cache");
    }
  }

  async fn persist(&self, records: &[Record]) {
    match serde_json::to_string(records) {
      Ok(json) => {
        if let Err(e) = self.kv.set(RECORDS_KEY, json).await {
          warn!(error = %e, "Failed to persist records");
        }
      }
      Err(e) => warn!(error = %e, "Failed to serialize records"),
    }
    write_mirror(&*self.kv, records).await;
  }
}

/// The single-flight body of a cold read.
async fn load_records<S: KeyValueStore>(
  kv: Arc<S>,
  state: Arc<Mutex<ReadState>>,
  mirror_ttl: Duration,
  started_at: u64,
) -> Vec<Record> {
  let records = match read_mirror(&*kv).await {
    Some(entry) if entry.is_fresh(mirror_ttl) => {
      debug!(count = entry.data.len(), "Hydrating read cache from mirror");
      entry.data
    }
    _ => {
      let records = read_local(&*kv).await;
      let revision = state.lock().unwrap_or_else(PoisonError::into_inner).revision;
      if revision == started_at {
        write_mirror(&*kv, &records).await;
      } else {
        debug!("Records changed during load, leaving mirror alone");
      }
      records
    }
  };

  let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
  state.in_flight = None;

  if state.revision != started_at {
    if let Some(entry) = &state.memory {
      return entry.data.clone();
    }
  }

  state.memory = Some(CacheEntry::now(records.clone()));
  records
}

async fn read_local<S: KeyValueStore>(kv: &S) -> Vec<Record> {
  match kv.get(RECORDS_KEY).await {
    Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
      warn!(error = %e, "Stored records are unreadable, starting empty");
      Vec::new()
    }),
    Ok(None) => Vec::new(),
    Err(e) => {
      warn!(error = %e, "Failed to read records");
      Vec::new()
    }
  }
}

async fn read_mirror<S: KeyValueStore>(kv: &S) -> Option<CacheEntry<Vec<Record>>> {
  match kv.get(MIRROR_KEY).await {
    Ok(Some(json)) => serde_json::from_str::<Option<CacheEntry<Vec<Record>>>>(&json)
      .ok()
      .flatten(),
    Ok(None) => None,
    Err(e) => {
      warn!(error = %e, "Failed to read mirror cache");
      None
    }
  }
}

async fn write_mirror<S: KeyValueStore>(kv: &S, records: &[Record]) {
  let entry = CacheEntry::now(records);
  match serde_json::to_string(&entry) {
    Ok(json) => {
      if let Err(e) = kv.set(MIRROR_KEY, json).await {
        warn!(error = %e, "Failed to persist mirror cache");
      }
    }
    Err(e) => warn!(error = %e, "Failed to serialize mirror cache"),
  }
}
