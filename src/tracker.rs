//! The tracker service: the one object UI-side consumers talk to.
//!
//! It wraps the record store, the dashboard cache and the sync engine and
//! exposes the same read/write API regardless of connectivity. Writes apply
//! locally and return at once; remote application happens in the background.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::dashboard::{AggregateSnapshot, DashboardCache};
use crate::event::EventBus;
use crate::model::{validate_record, Record, RecordDraft, RecordPatch};
use crate::remote::{RemoteEndpoint, RemoteError};
use crate::store::{KeyValueStore, Mutation, RecordStore, SyncSettings};
use crate::sync::{DrainReport, Intent, PendingOperation, Priority, SyncEngine, Throttle};

/// Failures surfaced to callers. Sync and storage problems never show up here.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrackerError {
  #[error("invalid record: {0}")]
  Validation(String),
  #[error("no record with id {0}")]
  NotFound(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
  Updated(Record),
  /// The edit changed nothing; nothing was written or queued
  Unchanged(Record),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
  Refreshed { records: usize },
  /// Local writes are still queued; pulling would overwrite them
  SkippedPending { pending: usize },
  Failed(RemoteError),
}

pub struct Tracker<S: KeyValueStore, R: RemoteEndpoint> {
  kv: Arc<S>,
  records: RecordStore<S>,
  dashboard: DashboardCache<S>,
  sync: Arc<SyncEngine<S, R>>,
  remote: Arc<R>,
  throttle: Throttle,
}

impl<S: KeyValueStore, R: RemoteEndpoint> Tracker<S, R> {
  /// Wire up the service. Spawns the outbound request worker, so it must run
  /// inside a tokio runtime.
  pub async fn new(
    kv: Arc<S>,
    remote: Arc<R>,
    connectivity: &ConnectivityMonitor,
    events: EventBus,
    config: &Config,
  ) -> Self {
    let throttle = Throttle::new(config.throttle_interval());
    let records = RecordStore::new(Arc::clone(&kv))
      .with_read_ttl(config.read_ttl())
      .with_mirror_ttl(config.mirror_ttl());
    let dashboard =
      DashboardCache::new(Arc::clone(&kv), config.aggregate_options()).with_ttl(config.dashboard_ttl());
    let sync = SyncEngine::new(
      Arc::clone(&kv),
      Arc::clone(&remote),
      throttle.clone(),
      connectivity.watch(),
      events,
      config.sync_options(),
    )
    .await;

    Self {
      kv,
      records,
      dashboard,
      sync: Arc::new(sync),
      remote,
      throttle,
    }
  }

  /// The sync engine, for running its wake loop.
  pub fn engine(&self) -> Arc<SyncEngine<S, R>> {
    Arc::clone(&self.sync)
  }

  pub async fn records(&self) -> Vec<Record> {
    self.records.records().await
  }

  pub async fn find(&self, id: &str) -> Option<Record> {
    self.records.find(id).await
  }

  /// Create a record locally and queue it for the endpoint.
  pub async fn add(&self, draft: RecordDraft) -> Result<Record, TrackerError> {
    draft.validate().map_err(TrackerError::Validation)?;

    let record = draft.into_record(Uuid::new_v4().to_string(), Utc::now());
    self.records.mutate(Mutation::Add(record.clone())).await;
    self
      .sync
      .enqueue(Intent::Add {
        record: record.clone(),
      })
      .await;

    info!(id = %record.id, category = %record.category, "Record added");
    Ok(record)
  }

  /// Edit a record locally and queue the change.
  pub async fn update(&self, id: &str, patch: RecordPatch) -> Result<UpdateOutcome, TrackerError> {
    let existing = self
      .records
      .find(id)
      .await
      .ok_or_else(|| TrackerError::NotFound(id.to_string()))?;

    let updated = patch.apply_to(&existing);
    validate_record(&updated).map_err(TrackerError::Validation)?;
    if updated == existing {
      return Ok(UpdateOutcome::Unchanged(existing));
    }

    let applied = self
      .records
      .mutate(Mutation::Update {
        old_id: id.to_string(),
        record: updated.clone(),
      })
      .await;
    if !applied {
      // Deleted between the lookup and the write
      return Err(TrackerError::NotFound(id.to_string()));
    }

    self
      .sync
      .enqueue(Intent::Update {
        old_id: id.to_string(),
        record: updated.clone(),
        delete_applied: false,
      })
      .await;

    info!(id, "Record updated");
    Ok(UpdateOutcome::Updated(updated))
  }

  /// Remove a record locally and queue the delete.
  pub async fn delete(&self, id: &str) -> Result<Record, TrackerError> {
    let existing = self
      .records
      .find(id)
      .await
      .ok_or_else(|| TrackerError::NotFound(id.to_string()))?;

    if !self.records.mutate(Mutation::Delete(id.to_string())).await {
      return Err(TrackerError::NotFound(id.to_string()));
    }
    self
      .sync
      .enqueue(Intent::Delete { id: id.to_string() })
      .await;

    info!(id, "Record deleted");
    Ok(existing)
  }

  /// Dashboard rollups for the current record set.
  pub async fn dashboard(&self) -> AggregateSnapshot {
    let records = self.records.records().await;
    self.dashboard.snapshot(&records).await
  }

  pub fn pending(&self) -> Vec<PendingOperation> {
    self.sync.pending()
  }

  /// Drain the pending queue now.
  pub async fn sync_now(&self) -> DrainReport {
    self.sync.drain().await
  }

  /// Replace local records with the endpoint's rows, unless local writes
  /// are still waiting to be applied.
  pub async fn pull(&self) -> PullOutcome {
    if self.sync.has_pending() {
      return PullOutcome::SkippedPending {
        pending: self.sync.pending().len(),
      };
    }

    let remote = Arc::clone(&self.remote);
    let fetched = self
      .throttle
      .submit(Priority::High, move || async move { remote.fetch_rows().await })
      .await;

    let rows = match fetched {
      Ok(Ok(rows)) => rows,
      Ok(Err(e)) => {
        warn!(error = %e, "Remote pull failed");
        return PullOutcome::Failed(e);
      }
      Err(e) => return PullOutcome::Failed(RemoteError::Network(e.to_string())),
    };

    // A write may have been queued while the fetch was in flight
    if self.sync.has_pending() {
      return PullOutcome::SkippedPending {
        pending: self.sync.pending().len(),
      };
    }

    let count = rows.len();
    self.records.replace_all(rows).await;
    SyncSettings::update(&*self.kv, |s| s.last_pull_at = Some(Utc::now())).await;

    info!(records = count, "Pulled records from endpoint");
    PullOutcome::Refreshed { records: count }
  }

  /// Drop the read caches so the next read goes to the record list.
  pub async fn invalidate_cache(&self) {
    self.records.invalidate().await;
  }

  pub async fn settings(&self) -> SyncSettings {
    SyncSettings::load(&*self.kv).await
  }

  /// Outbound calls waiting for the throttle.
  pub fn outbound_queued(&self) -> usize {
    self.throttle.queued()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::Connectivity;
  use crate::testing::{record, CountingStore, FakeRemote};

  struct Harness {
    remote: Arc<FakeRemote>,
    monitor: ConnectivityMonitor,
    tracker: Tracker<CountingStore, FakeRemote>,
  }

  async fn harness() -> Harness {
    let kv = Arc::new(CountingStore::new());
    let remote = Arc::new(FakeRemote::new());
    let events = EventBus::default();
    let monitor = ConnectivityMonitor::new(Connectivity::Online, events.clone());
    let mut config = Config::with_endpoint("https://example.com/exec");
    config.sync.throttle_interval_ms = 0;
    config.sync.retry_base_secs = 0;

    let tracker = Tracker::new(kv, Arc::clone(&remote), &monitor, events, &config).await;
    Harness {
      remote,
      monitor,
      tracker,
    }
  }

  fn food(amount: f64) -> RecordDraft {
    RecordDraft {
      date: "2026-10-18".to_string(),
      category: "Food".to_string(),
      item: "Groceries".to_string(),
      amount,
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn test_invalid_add_touches_nothing() {
    let h = harness().await;

    let result = h
      .tracker
      .add(RecordDraft {
        category: String::new(),
        ..food(10.0)
      })
      .await;

    assert!(matches!(result, Err(TrackerError::Validation(_))));
    assert!(h.tracker.records().await.is_empty());
    assert!(h.tracker.pending().is_empty());
  }

  #[tokio::test]
  async fn test_offline_add_is_visible_and_queued() {
    let h = harness().await;
    h.monitor.set(Connectivity::Offline);

    let added = h.tracker.add(food(500.0)).await.unwrap();

    let records = h.tracker.records().await;
    assert_eq!(records, vec![added.clone()]);
    let pending = h.tracker.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].intent, Intent::Add { record: added });

    h.monitor.set(Connectivity::Online);
    let report = h.tracker.sync_now().await;
    assert_eq!(report.applied, 1);
    assert!(h.tracker.pending().is_empty());
  }

  #[tokio::test]
  async fn test_unchanged_update_is_a_noop() {
    let h = harness().await;
    let added = h.tracker.add(food(10.0)).await.unwrap();
    h.tracker.sync_now().await;

    let outcome = h
      .tracker
      .update(&added.id, RecordPatch::default())
      .await
      .unwrap();

    assert_eq!(outcome, UpdateOutcome::Unchanged(added));
    assert!(h.tracker.pending().is_empty());
  }

  #[tokio::test]
  async fn test_update_queues_single_entry() {
    let h = harness().await;
    let added = h.tracker.add(food(10.0)).await.unwrap();
    h.tracker.sync_now().await;

    let patch = RecordPatch {
      amount: Some(25.0),
      ..Default::default()
    };
    let outcome = h.tracker.update(&added.id, patch).await.unwrap();

    let UpdateOutcome::Updated(updated) = outcome else {
      panic!("expected an update");
    };
    assert_eq!(h.tracker.find(&added.id).await, Some(updated.clone()));
    let pending = h.tracker.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(
      pending[0].intent,
      Intent::Update {
        old_id: added.id.clone(),
        record: updated,
        delete_applied: false,
      }
    );
  }

  #[tokio::test]
  async fn test_invalid_patch_is_rejected() {
    let h = harness().await;
    let added = h.tracker.add(food(10.0)).await.unwrap();

    let patch = RecordPatch {
      date: Some("someday".to_string()),
      ..Default::default()
    };
    let result = h.tracker.update(&added.id, patch).await;

    assert!(matches!(result, Err(TrackerError::Validation(_))));
    assert_eq!(h.tracker.find(&added.id).await, Some(added));
  }

  #[tokio::test]
  async fn test_unknown_ids_are_not_found() {
    let h = harness().await;

    assert_eq!(
      h.tracker.delete("ghost").await,
      Err(TrackerError::NotFound("ghost".to_string()))
    );
    assert!(matches!(
      h.tracker.update("ghost", RecordPatch::default()).await,
      Err(TrackerError::NotFound(_))
    ));
    assert!(h.tracker.pending().is_empty());
  }

  #[tokio::test]
  async fn test_dashboard_follows_mutations() {
    let h = harness().await;
    h.tracker.add(food(10.0)).await.unwrap();
    let before = h.tracker.dashboard().await;

    h.tracker.add(food(5.0)).await.unwrap();
    let after = h.tracker.dashboard().await;

    assert_eq!(before.record_count, 1);
    assert_eq!(after.record_count, 2);
    assert_eq!(after.grand_total, 15.0);
  }

  #[tokio::test]
  async fn test_pull_skipped_while_writes_pending() {
    let h = harness().await;
    h.monitor.set(Connectivity::Offline);
    h.tracker.add(food(10.0)).await.unwrap();

    assert_eq!(
      h.tracker.pull().await,
      PullOutcome::SkippedPending { pending: 1 }
    );
    assert_eq!(h.remote.fetches(), 0);
  }

  #[tokio::test]
  async fn test_pull_replaces_records() {
    let h = harness().await;
    h.remote
      .set_rows(vec![record("r1", "Food", 1.0), record("r2", "Rent", 2.0)]);

    assert_eq!(
      h.tracker.pull().await,
      PullOutcome::Refreshed { records: 2 }
    );
    assert_eq!(h.tracker.records().await.len(), 2);
    assert!(h.tracker.settings().await.last_pull_at.is_some());
  }

  #[tokio::test]
  async fn test_pull_failure_keeps_local_records() {
    let h = harness().await;
    let added = h.tracker.add(food(10.0)).await.unwrap();
    h.tracker.sync_now().await;
    h.remote.set_reachable(false);

    assert!(matches!(h.tracker.pull().await, PullOutcome::Failed(_)));
    assert_eq!(h.tracker.records().await, vec![added]);
  }
}
