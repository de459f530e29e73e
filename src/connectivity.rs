//! Online/offline tracking for the remote endpoint.

use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::event::{EventBus, SyncEvent};
use crate::remote::RemoteEndpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

/// Holds the current connectivity state and announces transitions.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  tx: watch::Sender<Connectivity>,
  events: EventBus,
}

impl ConnectivityMonitor {
  pub fn new(initial: Connectivity, events: EventBus) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx, events }
  }

  pub fn current(&self) -> Connectivity {
    *self.tx.borrow()
  }

  /// Watch handle for consumers that react to transitions.
  pub fn watch(&self) -> watch::Receiver<Connectivity> {
    self.tx.subscribe()
  }

  /// Record a new state. Only actual transitions notify watchers.
  pub fn set(&self, state: Connectivity) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == state {
        false
      } else {
        *current = state;
        true
      }
    });

    if changed {
      info!(?state, "Connectivity changed");
      self.events.publish(SyncEvent::ConnectivityChanged(state));
    }
  }

  /// Probe the endpoint once and record the result.
  pub async fn probe<R: RemoteEndpoint>(&self, remote: &R) -> Connectivity {
    let state = if remote.ping().await {
      Connectivity::Online
    } else {
      Connectivity::Offline
    };
    self.set(state);
    state
  }

  /// Probe forever at a fixed interval.
  pub async fn run_probe<R: RemoteEndpoint>(&self, remote: &R, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      self.probe(remote).await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::FakeRemote;

  #[test]
  fn test_only_transitions_are_published() {
    let bus = EventBus::default();
    let mut sub = bus.subscribe();
    let monitor = ConnectivityMonitor::new(Connectivity::Online, bus);

    monitor.set(Connectivity::Online);
    monitor.set(Connectivity::Offline);
    monitor.set(Connectivity::Offline);

    assert_eq!(
      sub.try_next(),
      Some(SyncEvent::ConnectivityChanged(Connectivity::Offline))
    );
    assert_eq!(sub.try_next(), None);
  }

  #[tokio::test]
  async fn test_probe_follows_remote() {
    let monitor = ConnectivityMonitor::new(Connectivity::Online, EventBus::default());
    let remote = FakeRemote::new();

    remote.set_reachable(false);
    assert_eq!(monitor.probe(&remote).await, Connectivity::Offline);

    remote.set_reachable(true);
    assert_eq!(monitor.probe(&remote).await, Connectivity::Online);
    assert_eq!(monitor.current(), Connectivity::Online);
  }
}
