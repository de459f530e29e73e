//! Drains the pending queue against the remote endpoint.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::connectivity::Connectivity;
use crate::event::{EventBus, SyncEvent};
use crate::remote::{RemoteEndpoint, RemoteError, WriteRequest};
use crate::store::{KeyValueStore, SyncSettings};

use super::queue::{Intent, PendingOperation, PendingQueue};
use super::throttle::{Priority, Throttle};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct SyncOptions {
  /// Period of the background drain timer
  pub interval: Duration,
  /// First retry delay after a failure
  pub retry_base: Duration,
  /// Upper bound on the retry delay
  pub retry_max: Duration,
  /// Send updates as a single `update` write instead of delete + add
  pub native_update: bool,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(5 * 60),
      retry_base: Duration::from_secs(30),
      retry_max: Duration::from_secs(30 * 60),
      native_update: false,
    }
  }
}

/// Summary of one `drain()` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub applied: usize,
  pub failed: usize,
  /// Skipped for backoff or to keep per-record order
  pub deferred: usize,
  /// Queue length once the drain finished
  pub remaining: usize,
  pub passes: usize,
  /// A pass was skipped because the endpoint is unreachable
  pub offline: bool,
  /// Another drain was running; this one was folded into it
  pub coalesced: bool,
}

impl DrainReport {
  fn absorb(&mut self, pass: DrainReport) {
    self.applied += pass.applied;
    self.failed += pass.failed;
    self.deferred += pass.deferred;
    self.passes += 1;
  }
}

enum Attempt {
  Done,
  /// `intent` carries any progress made (the delete half of an update)
  Failed { intent: Intent, error: RemoteError },
}

#[derive(Default)]
struct DrainState {
  running: bool,
  rerun: bool,
  rerun_ignores_backoff: bool,
}

pub struct SyncEngine<S: KeyValueStore, R: RemoteEndpoint> {
  kv: Arc<S>,
  queue: PendingQueue<S>,
  remote: Arc<R>,
  throttle: Throttle,
  connectivity: watch::Receiver<Connectivity>,
  events: EventBus,
  options: SyncOptions,
  drain_state: Mutex<DrainState>,
  wake: Notify,
}

impl<S: KeyValueStore, R: RemoteEndpoint> SyncEngine<S, R> {
  /// Build the engine, loading any queue left over from a previous run.
  pub async fn new(
    kv: Arc<S>,
    remote: Arc<R>,
    throttle: Throttle,
    connectivity: watch::Receiver<Connectivity>,
    events: EventBus,
    options: SyncOptions,
  ) -> Self {
    let queue = PendingQueue::load(Arc::clone(&kv)).await;
    if !queue.is_empty() {
      info!(pending = queue.len(), "Loaded pending operations");
    }

    Self {
      kv,
      queue,
      remote,
      throttle,
      connectivity,
      events,
      options,
      drain_state: Mutex::new(DrainState::default()),
      wake: Notify::new(),
    }
  }

  /// Queue an intent and wake the drain loop. Never fails; a persistence
  /// error is logged and the operation stays queued in memory.
  pub async fn enqueue(&self, intent: Intent) -> PendingOperation {
    let op = PendingOperation::new(intent);
    let pending = self.queue.push(op.clone()).await;

    info!(op_id = %op.op_id, action = op.intent.action(), pending, "Queued operation");
    self.events.publish(SyncEvent::QueueChanged { pending });
    self.wake.notify_one();

    op
  }

  /// Operations still waiting, in FIFO order.
  pub fn pending(&self) -> Vec<PendingOperation> {
    self.queue.snapshot()
  }

  pub fn has_pending(&self) -> bool {
    !self.queue.is_empty()
  }

  fn lock_drain(&self) -> MutexGuard<'_, DrainState> {
    self
      .drain_state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn is_offline(&self) -> bool {
    *self.connectivity.borrow() == Connectivity::Offline
  }

  /// Attempt every queued operation once.
  ///
  /// If a drain is already running this returns immediately with
  /// `coalesced` set, and the running drain makes one more pass when it finishes.
  pub async fn drain(&self) -> DrainReport {
    self.drain_with(false).await
  }

  async fn drain_with(&self, ignore_backoff: bool) -> DrainReport {
    {
      let mut state = self.lock_drain();
      if state.running {
        state.rerun = true;
        state.rerun_ignores_backoff |= ignore_backoff;
        return DrainReport {
          coalesced: true,
          remaining: self.queue.len(),
          ..Default::default()
        };
      }
      state.running = true;
    }

    let mut report = DrainReport::default();
    let mut ignore_backoff = ignore_backoff;

    loop {
      if self.is_offline() {
        debug!("Offline, skipping drain pass");
        report.offline = true;
      } else {
        let pass = self.drain_pass(ignore_backoff).await;
        report.absorb(pass);
      }

      let again = {
        let mut state = self.lock_drain();
        if state.rerun {
          state.rerun = false;
          ignore_backoff = std::mem::take(&mut state.rerun_ignores_backoff);
          true
        } else {
          state.running = false;
          false
        }
      };
      if !again {
        break;
      }
    }

    report.remaining = self.queue.len();
    if report.applied > 0 {
      SyncSettings::update(&*self.kv, |s| s.last_sync_at = Some(Utc::now())).await;
      self.events.publish(SyncEvent::QueueChanged {
        pending: report.remaining,
      });
    }

    info!(
      applied = report.applied,
      failed = report.failed,
      deferred = report.deferred,
      remaining = report.remaining,
      "Drain finished"
    );
    self.events.publish(SyncEvent::DrainFinished(report.clone()));
    report
  }

  async fn drain_pass(&self, ignore_backoff: bool) -> DrainReport {
    let now = Utc::now();
    let mut report = DrainReport::default();
    let mut completed = HashSet::new();
    let mut retried = HashMap::new();
    // Records with an earlier operation still outstanding in this pass
    let mut blocked: HashSet<String> = HashSet::new();

    for op in self.queue.snapshot() {
      let touched = touched_ids(&op.intent);
      let is_blocked = touched.iter().any(|id| blocked.contains(id));
      if is_blocked || (!ignore_backoff && !op.is_due(now)) {
        blocked.extend(touched);
        report.deferred += 1;
        continue;
      }

      match self.apply(&op).await {
        Attempt::Done => {
          debug!(op_id = %op.op_id, action = op.intent.action(), "Operation applied");
          completed.insert(op.op_id.clone());
          report.applied += 1;
        }
        Attempt::Failed { intent, error } => {
          let mut updated = op.clone();
          updated.intent = intent;
          updated.attempts += 1;
          updated.last_error = Some(error.to_string());
          let delay = retry_delay(
            updated.attempts,
            &updated.op_id,
            self.options.retry_base,
            self.options.retry_max,
          );
          updated.next_attempt_at =
            Some(now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::days(1)));

          warn!(
            op_id = %op.op_id,
            action = op.intent.action(),
            attempts = updated.attempts,
            error = %error,
            "Operation failed, will retry"
          );
          retried.insert(op.op_id.clone(), updated);
          blocked.extend(touched);
          report.failed += 1;
        }
      }
    }

    report.remaining = self.queue.commit(&completed, retried).await;
    report
  }

  async fn apply(&self, op: &PendingOperation) -> Attempt {
    let key = &op.op_id;
    let result = match &op.intent {
      Intent::Add { record } => self.post(WriteRequest::add(record, key.clone())).await,
      Intent::Delete { id } => self.post(WriteRequest::delete(id, key.clone())).await,
      Intent::Update { record, .. } if self.options.native_update => {
        self.post(WriteRequest::update(record, key.clone())).await
      }
      Intent::Update {
        old_id,
        record,
        delete_applied,
      } => {
        if !delete_applied {
          if let Err(error) = self
            .post(WriteRequest::delete(old_id, format!("{}:delete", key)))
            .await
          {
            return Attempt::Failed {
              intent: op.intent.clone(),
              error,
            };
          }
        }

        return match self
          .post(WriteRequest::add(record, format!("{}:add", key)))
          .await
        {
          Ok(()) => Attempt::Done,
          Err(error) => Attempt::Failed {
            intent: Intent::Update {
              old_id: old_id.clone(),
              record: record.clone(),
              delete_applied: true,
            },
            error,
          },
        };
      }
    };

    match result {
      Ok(()) => Attempt::Done,
      Err(error) => Attempt::Failed {
        intent: op.intent.clone(),
        error,
      },
    }
  }

  async fn post(&self, request: WriteRequest) -> Result<(), RemoteError> {
    let remote = Arc::clone(&self.remote);
    self
      .throttle
      .submit(Priority::Low, move || async move { remote.send(request).await })
      .await
      .map_err(|e| RemoteError::Network(e.to_string()))?
  }

  /// Drain on enqueue, on a fixed period and when connectivity comes back.
  ///
  /// Wake-ups that arrive mid-drain collapse into one follow-up drain.
  pub async fn run(self: Arc<Self>) {
    let mut connectivity = self.connectivity.clone();
    let mut last = *connectivity.borrow_and_update();
    let mut ticker = tokio::time::interval(self.options.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = self.wake.notified() => {
          self.drain().await;
        }
        _ = ticker.tick() => {
          self.drain().await;
        }
        changed = connectivity.changed() => {
          if changed.is_err() {
            debug!("Connectivity source gone, stopping drain loop");
            return;
          }
          let current = *connectivity.borrow_and_update();
          let reconnected = last == Connectivity::Offline && current == Connectivity::Online;
          last = current;
          if reconnected {
            info!("Back online, draining pending operations");
            self.drain_with(true).await;
          }
        }
      }
    }
  }
}

fn touched_ids(intent: &Intent) -> Vec<String> {
  match intent {
    Intent::Update { old_id, record, .. } if *old_id != record.id => {
      vec![old_id.clone(), record.id.clone()]
    }
    other => vec![other.record_id().to_string()],
  }
}

/// Exponential backoff with a cap, plus up to 25% jitter derived from the op id
/// so clients retrying the same failure do not line up.
pub fn retry_delay(attempts: u32, op_id: &str, base: Duration, max: Duration) -> Duration {
  let exponent = attempts.saturating_sub(1).min(20);
  let delay = base.saturating_mul(1u32 << exponent).min(max);

  let seed = op_id
    .get(..4)
    .and_then(|h| u16::from_str_radix(h, 16).ok())
    .unwrap_or(0);
  let jitter = delay.mul_f64(f64::from(seed) / f64::from(u16::MAX) * 0.25);

  delay + jitter
}
