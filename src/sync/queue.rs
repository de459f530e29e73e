//! Durable, ordered queue of mutations awaiting remote application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

use crate::model::Record;
use crate::store::kv::{KeyValueStore, QUEUE_KEY};

/// What a pending operation should do remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Intent {
  Add {
    record: Record,
  },
  /// Both phases of an update live in one entry. `delete_applied` records that
  /// the delete half already reached the endpoint.
  Update {
    #[serde(rename = "oldId")]
    old_id: String,
    record: Record,
    #[serde(rename = "deleteApplied", default)]
    delete_applied: bool,
  },
  Delete {
    id: String,
  },
}

impl Intent {
  pub fn action(&self) -> &'static str {
    match self {
      Intent::Add { .. } => "add",
      Intent::Update { .. } => "update",
      Intent::Delete { .. } => "delete",
    }
  }

  /// The record id whose remote state this intent changes.
  pub fn record_id(&self) -> &str {
    match self {
      Intent::Add { record } => &record.id,
      Intent::Update { old_id, .. } => old_id,
      Intent::Delete { id } => id,
    }
  }
}

/// A queued mutation intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
  /// Stable per-operation id, also used as the idempotency key
  pub op_id: String,
  pub intent: Intent,
  pub enqueued_at: DateTime<Utc>,
  #[serde(default)]
  pub attempts: u32,
  #[serde(default)]
  pub next_attempt_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub last_error: Option<String>,
}

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl PendingOperation {
  pub fn new(intent: Intent) -> Self {
    let enqueued_at = Utc::now();
    let op_id = operation_id(&intent, enqueued_at);
    Self {
      op_id,
      intent,
      enqueued_at,
      attempts: 0,
      next_attempt_at: None,
      last_error: None,
    }
  }

  /// Whether backoff allows an attempt at `now`.
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at.map_or(true, |at| at <= now)
  }
}

fn operation_id(intent: &Intent, enqueued_at: DateTime<Utc>) -> String {
  let mut hasher = Sha256::new();
  hasher.update(intent.action().as_bytes());
  hasher.update(b":");
  hasher.update(intent.record_id().as_bytes());
  hasher.update(b":");
  hasher.update(
    enqueued_at
      .timestamp_nanos_opt()
      .unwrap_or_default()
      .to_le_bytes(),
  );
  hasher.update(SEQUENCE.fetch_add(1, Ordering::Relaxed).to_le_bytes());
  let digest = hex::encode(hasher.finalize());
  digest[..32].to_string()
}

/// In-memory mirror of the queue plus its durable copy.
///
/// Every persist writes the whole list in one `set`, so the stored queue is
/// always some complete snapshot.
pub struct PendingQueue<S: KeyValueStore> {
  kv: Arc<S>,
  ops: Mutex<Vec<PendingOperation>>,
  /// Serializes persists so the last write carries the latest snapshot.
  persist_lock: tokio::sync::Mutex<()>,
}

impl<S: KeyValueStore> PendingQueue<S> {
  /// Load the queue from storage. Unreadable state starts an empty queue.
  pub async fn load(kv: Arc<S>) -> Self {
    let ops = match kv.get(QUEUE_KEY).await {
      Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
        warn!(error = %e, "Stored queue is unreadable, starting empty");
        Vec::new()
      }),
      Ok(None) => Vec::new(),
      Err(e) => {
        warn!(error = %e, "Failed to read pending queue");
        Vec::new()
      }
    };

    Self {
      kv,
      ops: Mutex::new(ops),
      persist_lock: tokio::sync::Mutex::new(()),
    }
  }

  fn lock_ops(&self) -> MutexGuard<'_, Vec<PendingOperation>> {
    self.ops.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Append and persist. Returns the new queue length.
  pub async fn push(&self, op: PendingOperation) -> usize {
    let len = {
      let mut ops = self.lock_ops();
      ops.push(op);
      ops.len()
    };
    self.persist().await;
    len
  }

  /// Copy of the queue in FIFO order.
  pub fn snapshot(&self) -> Vec<PendingOperation> {
    self.lock_ops().clone()
  }

  pub fn len(&self) -> usize {
    self.lock_ops().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock_ops().is_empty()
  }

  /// Apply the outcome of a drain pass: drop completed operations, replace
  /// retried ones with their updated bookkeeping, keep anything enqueued
  /// meanwhile, then persist the result in one write.
  pub async fn commit(
    &self,
    completed: &HashSet<String>,
    mut retried: HashMap<String, PendingOperation>,
  ) -> usize {
    let len = {
      let mut ops = self.lock_ops();
      ops.retain(|op| !completed.contains(&op.op_id));
      for op in ops.iter_mut() {
        if let Some(updated) = retried.remove(&op.op_id) {
          *op = updated;
        }
      }
      ops.len()
    };
    self.persist().await;
    len
  }

  async fn persist(&self) {
    let _guard = self.persist_lock.lock().await;
    let ops = self.snapshot();
    let json = match serde_json::to_string(&ops) {
      Ok(json) => json,
      Err(e) => {
        warn!(error = %e, "Failed to serialize pending queue");
        return;
      }
    };

    if let Err(e) = self.kv.set(QUEUE_KEY, json).await {
      warn!(error = %e, "Failed to persist pending queue");
    }
  }
}
