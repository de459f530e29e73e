//! Domain types for expense records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A single financial record as stored locally and mirrored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
  pub id: String,
  pub date: String,
  pub category: String,
  #[serde(default)]
  pub sub_category: String,
  pub item: String,
  pub amount: f64,
  #[serde(default)]
  pub email: String,
  #[serde(default)]
  pub shop_name: String,
  #[serde(default)]
  pub payment_mode: String,
  #[serde(default)]
  pub labels: Vec<String>,
  #[serde(default)]
  pub timestamp: String,
}

impl Record {
  /// Parse the record date, accepting the formats the spreadsheet produces.
  pub fn parsed_date(&self) -> Option<NaiveDate> {
    parse_date(&self.date)
  }
}

/// Parse a date in ISO (`2026-10-18`), day-first (`18/10/2026`, `18-10-2026`)
/// or RFC 3339 form.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
  let s = s.trim();
  for fmt in ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d"] {
    if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
      return Some(date);
    }
  }
  DateTime::parse_from_rfc3339(s)
    .ok()
    .map(|dt| dt.date_naive())
}

/// User input for a new record, before an id is assigned.
#[derive(Debug, Clone, Default)]
pub struct RecordDraft {
  pub date: String,
  pub category: String,
  pub sub_category: String,
  pub item: String,
  pub amount: f64,
  pub email: String,
  pub shop_name: String,
  pub payment_mode: String,
  pub labels: Vec<String>,
}

impl RecordDraft {
  /// Check required fields. Runs before any state is touched.
  pub fn validate(&self) -> Result<(), String> {
    validate_fields(&self.date, &self.category, &self.item, self.amount)
  }

  pub fn into_record(self, id: String, now: DateTime<Utc>) -> Record {
    Record {
      id,
      date: self.date.trim().to_string(),
      category: self.category.trim().to_string(),
      sub_category: self.sub_category.trim().to_string(),
      item: self.item.trim().to_string(),
      amount: self.amount,
      email: self.email.trim().to_string(),
      shop_name: self.shop_name.trim().to_string(),
      payment_mode: self.payment_mode.trim().to_string(),
      labels: normalize_labels(self.labels),
      timestamp: now.to_rfc3339(),
    }
  }
}

/// Partial edit of an existing record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
  pub date: Option<String>,
  pub category: Option<String>,
  pub sub_category: Option<String>,
  pub item: Option<String>,
  pub amount: Option<f64>,
  pub email: Option<String>,
  pub shop_name: Option<String>,
  pub payment_mode: Option<String>,
  pub labels: Option<Vec<String>>,
}

impl RecordPatch {
  /// Apply the patch to a copy of `record`. The timestamp is left alone so an
  /// empty patch yields an identical record.
  pub fn apply_to(&self, record: &Record) -> Record {
    let mut updated = record.clone();
    if let Some(v) = &self.date {
      updated.date = v.trim().to_string();
    }
    if let Some(v) = &self.category {
      updated.category = v.trim().to_string();
    }
    if let Some(v) = &self.sub_category {
      updated.sub_category = v.trim().to_string();
    }
    if let Some(v) = &self.item {
      updated.item = v.trim().to_string();
    }
    if let Some(v) = self.amount {
      updated.amount = v;
    }
    if let Some(v) = &self.email {
      updated.email = v.trim().to_string();
    }
    if let Some(v) = &self.shop_name {
      updated.shop_name = v.trim().to_string();
    }
    if let Some(v) = &self.payment_mode {
      updated.payment_mode = v.trim().to_string();
    }
    if let Some(v) = &self.labels {
      updated.labels = normalize_labels(v.clone());
    }
    updated
  }
}

/// Validate the fields every record must carry.
pub fn validate_record(record: &Record) -> Result<(), String> {
  validate_fields(&record.date, &record.category, &record.item, record.amount)
}

fn validate_fields(date: &str, category: &str, item: &str, amount: f64) -> Result<(), String> {
  if date.trim().is_empty() {
    return Err("date is required".to_string());
  }
  if parse_date(date).is_none() {
    return Err(format!("unrecognised date '{}'", date.trim()));
  }
  if category.trim().is_empty() {
    return Err("category is required".to_string());
  }
  if item.trim().is_empty() {
    return Err("item is required".to_string());
  }
  if !amount.is_finite() {
    return Err("amount must be a finite number".to_string());
  }
  Ok(())
}

fn normalize_labels(labels: Vec<String>) -> Vec<String> {
  labels
    .into_iter()
    .map(|l| l.trim().to_string())
    .filter(|l| !l.is_empty())
    .collect()
}
