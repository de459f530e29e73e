//! Dashboard rollups derived from the full record set.
//!
//! Snapshots are never patched. A snapshot is reused only while its schema
//! version, age and record fingerprint all still match; otherwise it is
//! recomputed from scratch.

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::model::Record;
use crate::store::kv::{KeyValueStore, DASHBOARD_KEY};

/// Bump whenever `AggregateSnapshot` changes shape or meaning.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodTotal {
  pub period: String,
  pub total: f64,
}

/// Distinct values used to populate filter pickers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterOptions {
  pub categories: BTreeSet<String>,
  pub sub_categories: BTreeSet<String>,
  pub labels: BTreeSet<String>,
  pub emails: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
  pub schema_version: u32,
  pub computed_at: DateTime<Utc>,
  pub record_count: usize,
  pub fingerprint: String,
  pub grand_total: f64,
  /// Calendar month containing `computed_at`
  pub current_period: String,
  pub current_period_total: f64,
  pub category_totals: BTreeMap<String, f64>,
  /// Oldest first, one entry per month in the lookback window
  pub monthly_totals: Vec<PeriodTotal>,
  /// Oldest first, one entry per quarter in the lookback window
  pub quarterly_totals: Vec<PeriodTotal>,
  pub moving_averages: Vec<PeriodTotal>,
  pub filters: FilterOptions,
}

impl AggregateSnapshot {
  /// Whether this snapshot may be served for `records` at `now`.
  pub fn is_usable(
    &self,
    now: DateTime<Utc>,
    ttl: Duration,
    record_count: usize,
    fingerprint: &str,
  ) -> bool {
    self.schema_version == SCHEMA_VERSION
      && now - self.computed_at < ttl
      && self.record_count == record_count
      && self.fingerprint == fingerprint
  }
}

#[derive(Debug, Clone)]
pub struct AggregateOptions {
  pub lookback_months: u32,
  pub lookback_quarters: u32,
  pub moving_average_window: u32,
}

impl Default for AggregateOptions {
  fn default() -> Self {
    Self {
      lookback_months: 12,
      lookback_quarters: 4,
      moving_average_window: 3,
    }
  }
}

fn month_index(year: i32, month0: u32) -> i64 {
  i64::from(year) * 12 + i64::from(month0)
}

fn quarter_index(year: i32, month0: u32) -> i64 {
  i64::from(year) * 4 + i64::from(month0 / 3)
}

fn month_label(index: i64) -> String {
  format!("{:04}-{:02}", index.div_euclid(12), index.rem_euclid(12) + 1)
}

fn quarter_label(index: i64) -> String {
  format!("{:04}-Q{}", index.div_euclid(4), index.rem_euclid(4) + 1)
}

fn hash_record(hasher: &mut Sha256, record: &Record) {
  match serde_json::to_vec(record) {
    Ok(bytes) => hasher.update(&bytes),
    Err(_) => hasher.update(record.id.as_bytes()),
  }
  hasher.update(b"\n");
}

/// Content fingerprint of a record set; changes with any mutation.
pub fn fingerprint(records: &[Record]) -> String {
  let mut hasher = Sha256::new();
  for record in records {
    hash_record(&mut hasher, record);
  }
  hex::encode(hasher.finalize())
}

/// Build a snapshot in one pass over `records`.
pub fn compute(records: &[Record], now: DateTime<Utc>, options: &AggregateOptions) -> AggregateSnapshot {
  let months = i64::from(options.lookback_months.max(1));
  let quarters = i64::from(options.lookback_quarters.max(1));
  let today = now.date_naive();
  let current_month = month_index(today.year(), today.month0());
  let current_quarter = quarter_index(today.year(), today.month0());
  let first_month = current_month - months + 1;
  let first_quarter = current_quarter - quarters + 1;

  let mut monthly = vec![0.0; months as usize];
  let mut quarterly = vec![0.0; quarters as usize];
  let mut grand_total = 0.0;
  let mut category_totals: BTreeMap<String, f64> = BTreeMap::new();
  let mut filters = FilterOptions::default();
  let mut hasher = Sha256::new();

  for record in records {
    hash_record(&mut hasher, record);
    grand_total += record.amount;
    *category_totals.entry(record.category.clone()).or_default() += record.amount;

    if let Some(date) = record.parsed_date() {
      let m = month_index(date.year(), date.month0());
      if (first_month..=current_month).contains(&m) {
        monthly[(m - first_month) as usize] += record.amount;
      }
      let q = quarter_index(date.year(), date.month0());
      if (first_quarter..=current_quarter).contains(&q) {
        quarterly[(q - first_quarter) as usize] += record.amount;
      }
    }

    if !record.category.is_empty() {
      filters.categories.insert(record.category.clone());
    }
    if !record.sub_category.is_empty() {
      filters.sub_categories.insert(record.sub_category.clone());
    }
    if !record.email.is_empty() {
      filters.emails.insert(record.email.clone());
    }
    filters.labels.extend(record.labels.iter().cloned());
  }

  let window = options.moving_average_window as usize;
  let moving_averages = if window == 0 {
    Vec::new()
  } else {
    (window.saturating_sub(1)..monthly.len())
      .map(|i| PeriodTotal {
        period: month_label(first_month + i as i64),
        total: monthly[i + 1 - window..=i].iter().sum::<f64>() / window as f64,
      })
      .collect()
  };

  let monthly_totals = monthly
    .iter()
    .enumerate()
    .map(|(i, total)| PeriodTotal {
      period: month_label(first_month + i as i64),
      total: *total,
    })
    .collect();

  let quarterly_totals = quarterly
    .iter()
    .enumerate()
    .map(|(i, total)| PeriodTotal {
      period: quarter_label(first_quarter + i as i64),
      total: *total,
    })
    .collect();

  AggregateSnapshot {
    schema_version: SCHEMA_VERSION,
    computed_at: now,
    record_count: records.len(),
    fingerprint: hex::encode(hasher.finalize()),
    grand_total,
    current_period: month_label(current_month),
    current_period_total: monthly[monthly.len() - 1],
    category_totals,
    monthly_totals,
    quarterly_totals,
    moving_averages,
    filters,
  }
}

/// Holds the latest snapshot in memory and in the key-value store.
pub struct DashboardCache<S: KeyValueStore> {
  kv: Arc<S>,
  ttl: Duration,
  options: AggregateOptions,
  current: Mutex<Option<AggregateSnapshot>>,
}

impl<S: KeyValueStore> DashboardCache<S> {
  pub fn new(kv: Arc<S>, options: AggregateOptions) -> Self {
    Self {
      kv,
      ttl: Duration::hours(1),
      options,
      current: Mutex::new(None),
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  /// A snapshot valid for `records`, recomputing if the cached one is unusable.
  pub async fn snapshot(&self, records: &[Record]) -> AggregateSnapshot {
    let now = Utc::now();
    let print = fingerprint(records);

    if let Some(cached) = self.cached().await {
      if cached.is_usable(now, self.ttl, records.len(), &print) {
        return cached;
      }
      debug!(
        version = cached.schema_version,
        computed_at = %cached.computed_at,
        "Dashboard snapshot stale, recomputing"
      );
    }

    let snapshot = compute(records, now, &self.options);
    *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());

    match serde_json::to_string(&snapshot) {
      Ok(json) => {
        if let Err(e) = self.kv.set(DASHBOARD_KEY, json).await {
          warn!(error = %e, "Failed to persist dashboard snapshot");
        }
      }
      Err(e) => warn!(error = %e, "Failed to serialize dashboard snapshot"),
    }

    snapshot
  }

  async fn cached(&self) -> Option<AggregateSnapshot> {
    let in_memory = self
      .current
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    if in_memory.is_some() {
      return in_memory;
    }

    match self.kv.get(DASHBOARD_KEY).await {
      // A snapshot from an older schema may not even parse; treat it as absent
      Ok(Some(json)) => serde_json::from_str(&json).ok(),
      Ok(None) => None,
      Err(e) => {
        warn!(error = %e, "Failed to read dashboard snapshot");
        None
      }
    }
  }
}
