//! Test doubles shared across module tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::model::Record;
use crate::remote::api_types::WriteAction;
use crate::remote::{RemoteEndpoint, RemoteError, WriteRequest};
use crate::store::KeyValueStore;

pub fn record(id: &str, category: &str, amount: f64) -> Record {
  Record {
    id: id.to_string(),
    date: "2026-10-01".to_string(),
    category: category.to_string(),
    sub_category: String::new(),
    item: format!("{} item", category),
    amount,
    email: "me@example.com".to_string(),
    shop_name: String::new(),
    payment_mode: "Cash".to_string(),
    labels: Vec::new(),
    timestamp: "2026-10-01T10:00:00+00:00".to_string(),
  }
}

/// In-memory store that counts reads per key and can be made to fail.
#[derive(Default)]
pub struct CountingStore {
  values: Mutex<HashMap<String, String>>,
  reads: Mutex<HashMap<String, usize>>,
  latency: Duration,
  read_latency: Duration,
  fail_reads: AtomicBool,
  fail_writes: AtomicBool,
}

impl CountingStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  /// Slow reads only. The value returned is the one present when the read began.
  pub fn with_read_latency(mut self, latency: Duration) -> Self {
    self.read_latency = latency;
    self
  }

  pub fn seed(&self, key: &str, value: &str) {
    self
      .values
      .lock()
      .unwrap()
      .insert(key.to_string(), value.to_string());
  }

  pub fn value(&self, key: &str) -> Option<String> {
    self.values.lock().unwrap().get(key).cloned()
  }

  pub fn reads(&self, key: &str) -> usize {
    self.reads.lock().unwrap().get(key).copied().unwrap_or(0)
  }

  pub fn fail_reads(&self, fail: bool) {
    self.fail_reads.store(fail, Ordering::SeqCst);
  }

  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }
}

impl KeyValueStore for CountingStore {
  async fn get(&self, key: &str) -> Result<Option<String>> {
    *self
      .reads
      .lock()
      .unwrap()
      .entry(key.to_string())
      .or_default() += 1;
    let issued = self.value(key);
    if !self.read_latency.is_zero() {
      tokio::time::sleep(self.read_latency).await;
    }
    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }
    if self.fail_reads.load(Ordering::SeqCst) {
      return Err(eyre!("disk unavailable"));
    }
    if self.read_latency.is_zero() {
      Ok(self.value(key))
    } else {
      Ok(issued)
    }
  }

  async fn set(&self, key: &str, value: String) -> Result<()> {
    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(eyre!("disk full"));
    }
    self.seed(key, &value);
    Ok(())
  }
}

/// Scriptable endpoint that records every write attempt.
pub struct FakeRemote {
  attempts: Mutex<Vec<(WriteAction, String)>>,
  failing: Mutex<HashSet<(WriteAction, String)>>,
  rows: Mutex<Vec<Record>>,
  fetches: AtomicUsize,
  reachable: AtomicBool,
  latency: Mutex<Duration>,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self {
      attempts: Mutex::new(Vec::new()),
      failing: Mutex::new(HashSet::new()),
      rows: Mutex::new(Vec::new()),
      fetches: AtomicUsize::new(0),
      reachable: AtomicBool::new(true),
      latency: Mutex::new(Duration::ZERO),
    }
  }

  /// Make writes with this action for this id fail until cleared.
  pub fn fail(&self, action: WriteAction, id: &str) {
    self
      .failing
      .lock()
      .unwrap()
      .insert((action, id.to_string()));
  }

  pub fn clear_failures(&self) {
    self.failing.lock().unwrap().clear();
  }

  pub fn attempts(&self) -> Vec<(WriteAction, String)> {
    self.attempts.lock().unwrap().clone()
  }

  pub fn set_rows(&self, rows: Vec<Record>) {
    *self.rows.lock().unwrap() = rows;
  }

  pub fn fetches(&self) -> usize {
    self.fetches.load(Ordering::SeqCst)
  }

  pub fn set_reachable(&self, reachable: bool) {
    self.reachable.store(reachable, Ordering::SeqCst);
  }

  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = latency;
  }

  fn latency(&self) -> Duration {
    *self.latency.lock().unwrap()
  }
}

impl RemoteEndpoint for FakeRemote {
  async fn send(&self, request: WriteRequest) -> Result<(), RemoteError> {
    let latency = self.latency();
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }

    let key = (request.action, request.id.clone());
    self.attempts.lock().unwrap().push(key.clone());

    if !self.reachable.load(Ordering::SeqCst) {
      return Err(RemoteError::Network("unreachable".to_string()));
    }
    if self.failing.lock().unwrap().contains(&key) {
      return Err(RemoteError::Rejected("scripted failure".to_string()));
    }
    Ok(())
  }

  async fn fetch_rows(&self) -> Result<Vec<Record>, RemoteError> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    if !self.reachable.load(Ordering::SeqCst) {
      return Err(RemoteError::Network("unreachable".to_string()));
    }
    Ok(self.rows.lock().unwrap().clone())
  }

  async fn ping(&self) -> bool {
    self.reachable.load(Ordering::SeqCst)
  }
}
