use tokio::sync::broadcast;
use tracing::warn;

use crate::connectivity::Connectivity;
use crate::sync::DrainReport;

/// Sync status events
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  /// The endpoint became reachable or unreachable
  ConnectivityChanged(Connectivity),
  /// The pending queue changed size
  QueueChanged { pending: usize },
  /// A drain finished (including coalesced and offline-skipped drains)
  DrainFinished(DrainReport),
}

/// Publish/subscribe hub for sync status.
///
/// Publishing never blocks and never fails; events sent with no subscribers
/// are dropped.
#[derive(Clone)]
pub struct EventBus {
  tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn publish(&self, event: SyncEvent) {
    // Err only means nobody is listening
    let _ = self.tx.send(event);
  }

  pub fn subscribe(&self) -> Subscription {
    Subscription {
      rx: self.tx.subscribe(),
    }
  }

  #[cfg(test)]
  pub fn subscriber_count(&self) -> usize {
    self.tx.receiver_count()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(64)
  }
}

/// A live subscription. Dropping it (or calling `unsubscribe`) detaches it.
pub struct Subscription {
  rx: broadcast::Receiver<SyncEvent>,
}

impl Subscription {
  /// Receive the next event, or `None` once the bus is gone.
  pub async fn next(&mut self) -> Option<SyncEvent> {
    loop {
      match self.rx.recv().await {
        Ok(event) => return Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "Subscriber lagged, events dropped");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Receive an already-published event without waiting.
  #[cfg(test)]
  pub fn try_next(&mut self) -> Option<SyncEvent> {
    loop {
      match self.rx.try_recv() {
        Ok(event) => return Some(event),
        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
        Err(_) => return None,
      }
    }
  }

  pub fn unsubscribe(self) {}
}
