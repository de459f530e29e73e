//! Single-worker, rate-limited serializer for outbound calls.
//!
//! Every remote call goes through one [`Throttle`]. A single worker task runs
//! one call at a time, in FIFO order within a priority class, and enforces a
//! minimum interval between the starts of any two calls.
//!
//! ```ignore
//! let throttle = Throttle::new(Duration::from_millis(500));
//! let rows = throttle
//!     .submit(Priority::High, move || async move { remote.fetch_rows().await })
//!     .await?;
//! ```

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
  /// User-facing calls
  High,
  /// Background sync
  Low,
}

/// The worker stopped before the call could run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("outbound request worker has stopped")]
pub struct ThrottleClosed;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Queued {
  priority: Priority,
  job: Job,
}

#[derive(Default)]
struct JobQueue {
  jobs: Mutex<VecDeque<Queued>>,
}

impl JobQueue {
  /// Highs go ahead of the first queued low, behind other highs.
  fn push(&self, queued: Queued) {
    let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
    match queued.priority {
      Priority::Low => jobs.push_back(queued),
      Priority::High => {
        let at = jobs
          .iter()
          .position(|q| q.priority == Priority::Low)
          .unwrap_or(jobs.len());
        jobs.insert(at, queued);
      }
    }
  }

  fn pop(&self) -> Option<Queued> {
    self
      .jobs
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .pop_front()
  }

  fn is_empty(&self) -> bool {
    self
      .jobs
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .is_empty()
  }

  fn len(&self) -> usize {
    self
      .jobs
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }
}

/// Handle to the outbound request worker. Clones share the same worker.
#[derive(Clone)]
pub struct Throttle {
  queue: Arc<JobQueue>,
  wake: mpsc::UnboundedSender<()>,
}

impl Throttle {
  /// Spawn the worker. Must be called inside a tokio runtime.
  pub fn new(min_interval: Duration) -> Self {
    let queue = Arc::new(JobQueue::default());
    let (wake, wake_rx) = mpsc::unbounded_channel();

    tokio::spawn(run_worker(Arc::clone(&queue), wake_rx, min_interval));

    Self { queue, wake }
  }

  /// Queue a call. The call is enqueued immediately; the returned future
  /// resolves with its output once the worker has run it.
  pub fn submit<T, F, Fut>(
    &self,
    priority: Priority,
    call: F,
  ) -> impl Future<Output = Result<T, ThrottleClosed>> + Send + 'static
  where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
  {
    let (tx, rx) = oneshot::channel();
    let job: Job = Box::new(move || {
      Box::pin(async move {
        let output = call().await;
        // Caller may have stopped waiting
        let _ = tx.send(output);
      })
    });

    self.queue.push(Queued { priority, job });
    let _ = self.wake.send(());

    async move { rx.await.map_err(|_| ThrottleClosed) }
  }

  /// Calls waiting to start.
  pub fn queued(&self) -> usize {
    self.queue.len()
  }
}

async fn run_worker(
  queue: Arc<JobQueue>,
  mut wake: mpsc::UnboundedReceiver<()>,
  min_interval: Duration,
) {
  let mut last_start: Option<Instant> = None;

  loop {
    while queue.is_empty() {
      if wake.recv().await.is_none() {
        return;
      }
    }

    if let Some(prev) = last_start {
      tokio::time::sleep_until(prev + min_interval).await;
    }

    // Pop after the spacing wait so a high-priority call queued meanwhile goes first
    let Some(next) = queue.pop() else {
      continue;
    };

    last_start = Some(Instant::now());
    (next.job)().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn test_starts_are_spaced() {
    let throttle = Throttle::new(Duration::from_millis(500));
    let starts = Arc::new(Mutex::new(Vec::new()));

    let calls: Vec<_> = (0..5)
      .map(|_| {
        let starts = Arc::clone(&starts);
        throttle.submit(Priority::Low, move || async move {
          starts.lock().unwrap().push(Instant::now());
        })
      })
      .collect();
    for result in futures::future::join_all(calls).await {
      result.unwrap();
    }

    let starts = starts.lock().unwrap();
    assert_eq!(starts.len(), 5);
    for pair in starts.windows(2) {
      assert!(pair[1] - pair[0] >= Duration::from_millis(500));
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_high_priority_jumps_queued_lows() {
    let throttle = Throttle::new(Duration::from_millis(500));
    let order = Arc::new(Mutex::new(Vec::new()));
    let (started_tx, started_rx) = oneshot::channel();

    let log = |name: &'static str| {
      let order = Arc::clone(&order);
      move || async move {
        order.lock().unwrap().push(name);
      }
    };

    let first = {
      let order = Arc::clone(&order);
      throttle.submit(Priority::Low, move || async move {
        order.lock().unwrap().push("low-1");
        let _ = started_tx.send(());
      })
    };
    started_rx.await.unwrap();

    let second = throttle.submit(Priority::Low, log("low-2"));
    let high = throttle.submit(Priority::High, log("high"));
    let third = throttle.submit(Priority::Low, log("low-3"));

    let _ = futures::join!(first, second, high, third);

    assert_eq!(*order.lock().unwrap(), vec!["low-1", "high", "low-2", "low-3"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_highs_stay_fifo_among_themselves() {
    let throttle = Throttle::new(Duration::from_millis(10));
    let order = Arc::new(Mutex::new(Vec::new()));
    let (started_tx, started_rx) = oneshot::channel();

    let blocker = throttle.submit(Priority::Low, move || async move {
      let _ = started_tx.send(());
    });
    started_rx.await.unwrap();

    let calls: Vec<_> = [
      (Priority::Low, "low"),
      (Priority::High, "high-1"),
      (Priority::High, "high-2"),
    ]
    .into_iter()
    .map(|(priority, name)| {
      let order = Arc::clone(&order);
      throttle.submit(priority, move || async move {
        order.lock().unwrap().push(name);
      })
    })
    .collect();

    blocker.await.unwrap();
    futures::future::join_all(calls).await;

    assert_eq!(*order.lock().unwrap(), vec!["high-1", "high-2", "low"]);
  }

  #[tokio::test]
  async fn test_returns_call_output() {
    let throttle = Throttle::new(Duration::ZERO);
    let value = throttle
      .submit(Priority::High, || async { 21 * 2 })
      .await
      .unwrap();
    assert_eq!(value, 42);
  }
}
