//! Serde types matching the spreadsheet endpoint's request and response shapes.
//!
//! These are kept separate from the domain types so the wire format (labels as
//! a comma-joined string, loosely named columns) stays out of the rest of the code.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::model::Record;

use super::client::RemoteError;

// ============================================================================
// Write requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
  Add,
  Update,
  Delete,
}

/// Row fields sent with add and update requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowFields {
  pub date: String,
  pub category: String,
  pub sub_category: String,
  pub item: String,
  pub amount: f64,
  pub email: String,
  pub shop_name: String,
  pub payment_mode: String,
  /// Comma-joined, as the sheet stores them.
  pub labels: String,
  pub timestamp: String,
}

impl From<&Record> for RowFields {
  fn from(r: &Record) -> Self {
    Self {
      date: r.date.clone(),
      category: r.category.clone(),
      sub_category: r.sub_category.clone(),
      item: r.item.clone(),
      amount: r.amount,
      email: r.email.clone(),
      shop_name: r.shop_name.clone(),
      payment_mode: r.payment_mode.clone(),
      labels: r.labels.join(","),
      timestamp: r.timestamp.clone(),
    }
  }
}

/// Body of a POST to the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
  pub action: WriteAction,
  pub id: String,
  pub idempotency_key: String,
  #[serde(flatten)]
  pub row: Option<RowFields>,
}

impl WriteRequest {
  pub fn add(record: &Record, idempotency_key: String) -> Self {
    Self {
      action: WriteAction::Add,
      id: record.id.clone(),
      idempotency_key,
      row: Some(record.into()),
    }
  }

  pub fn update(record: &Record, idempotency_key: String) -> Self {
    Self {
      action: WriteAction::Update,
      id: record.id.clone(),
      idempotency_key,
      row: Some(record.into()),
    }
  }

  pub fn delete(id: &str, idempotency_key: String) -> Self {
    Self {
      action: WriteAction::Delete,
      id: id.to_string(),
      idempotency_key,
      row: None,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct WriteResponse {
  pub success: bool,
  #[serde(default)]
  pub message: Option<String>,
}

/// Interpret a write response body. Anything but `{"success": true}` is a failure.
pub fn parse_write_response(body: &str) -> Result<(), RemoteError> {
  let response: WriteResponse = serde_json::from_str(body)
    .map_err(|e| RemoteError::Malformed(format!("write response: {}", e)))?;

  if response.success {
    Ok(())
  } else {
    Err(RemoteError::Rejected(
      response
        .message
        .unwrap_or_else(|| "no message".to_string()),
    ))
  }
}

// ============================================================================
// Row reads
// ============================================================================

// Candidate header spellings, already normalized (lowercase, alphanumerics only).
const ID_KEYS: &[&str] = &["id", "recordid", "expenseid", "uuid"];
const DATE_KEYS: &[&str] = &["date", "expensedate", "transactiondate"];
const CATEGORY_KEYS: &[&str] = &["category", "maincategory"];
const SUB_CATEGORY_KEYS: &[&str] = &["subcategory", "subcat"];
const ITEM_KEYS: &[&str] = &["item", "itemname", "description"];
const AMOUNT_KEYS: &[&str] = &["amount", "amt", "price", "cost"];
const EMAIL_KEYS: &[&str] = &["email", "emailaddress", "useremail"];
const SHOP_KEYS: &[&str] = &["shopname", "shop", "store", "merchant"];
const PAYMENT_KEYS: &[&str] = &["paymentmode", "paymentmethod", "mode"];
const LABEL_KEYS: &[&str] = &["labels", "label", "tags"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "createdat", "time"];

/// Parse a GET response: a bare JSON array of row objects.
///
/// Rows without a usable id are dropped.
pub fn parse_rows(body: &str) -> Result<Vec<Record>, RemoteError> {
  let value: Value = serde_json::from_str(body)
    .map_err(|e| RemoteError::Malformed(format!("rows: {}", e)))?;

  let Value::Array(rows) = value else {
    return Err(RemoteError::Malformed(
      "rows: expected a JSON array".to_string(),
    ));
  };

  let total = rows.len();
  let records: Vec<Record> = rows.iter().filter_map(row_to_record).collect();
  if records.len() != total {
    debug!(dropped = total - records.len(), "Dropped rows without an id");
  }

  Ok(records)
}

fn row_to_record(row: &Value) -> Option<Record> {
  let Value::Object(fields) = row else {
    return None;
  };

  let normalized: Map<String, Value> = fields
    .iter()
    .map(|(k, v)| (normalize_header(k), v.clone()))
    .collect();

  let id = text_field(&normalized, ID_KEYS);
  if id.is_empty() {
    return None;
  }

  Some(Record {
    id,
    date: text_field(&normalized, DATE_KEYS),
    category: text_field(&normalized, CATEGORY_KEYS),
    sub_category: text_field(&normalized, SUB_CATEGORY_KEYS),
    item: text_field(&normalized, ITEM_KEYS),
    amount: lookup(&normalized, AMOUNT_KEYS)
      .and_then(amount_value)
      .unwrap_or(0.0),
    email: text_field(&normalized, EMAIL_KEYS),
    shop_name: text_field(&normalized, SHOP_KEYS),
    payment_mode: text_field(&normalized, PAYMENT_KEYS),
    labels: lookup(&normalized, LABEL_KEYS)
      .map(labels_value)
      .unwrap_or_default(),
    timestamp: text_field(&normalized, TIMESTAMP_KEYS),
  })
}

fn normalize_header(header: &str) -> String {
  header
    .chars()
    .filter(|c| c.is_ascii_alphanumeric())
    .map(|c| c.to_ascii_lowercase())
    .collect()
}

fn lookup<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
  keys
    .iter()
    .filter_map(|k| fields.get(*k))
    .find(|v| !v.is_null())
}

fn text_field(fields: &Map<String, Value>, keys: &[&str]) -> String {
  match lookup(fields, keys) {
    Some(Value::String(s)) => s.trim().to_string(),
    Some(Value::Number(n)) => n.to_string(),
    Some(Value::Bool(b)) => b.to_string(),
    _ => String::new(),
  }
}

fn amount_value(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) if s.trim().is_empty() => None,
    Value::String(s) => {
      let amount = parse_amount(s);
      if amount.is_none() {
        warn!(value = %s, "Unreadable amount, using 0");
      }
      amount
    }
    _ => None,
  }
}

/// Parse sheet-formatted amounts such as "1,200.50", "₹ 300", "Rs. 300" or "-$45".
///
/// Whitespace, thousands separators and one leading currency prefix are
/// dropped; what remains must be a plain number.
fn parse_amount(raw: &str) -> Option<f64> {
  let compact: String = raw
    .chars()
    .filter(|c| !c.is_whitespace() && *c != ',')
    .collect();

  let (negative, rest) = match compact.strip_prefix('-') {
    Some(rest) => (true, rest),
    None => (false, compact.as_str()),
  };

  let number =
    rest.trim_start_matches(|c: char| !c.is_ascii_digit() && !matches!(c, '.' | '-' | '+'));
  let prefix = &rest[..rest.len() - number.len()];
  // "Rs." and friends: a lettered prefix may end in an abbreviation dot
  let number = match prefix.chars().last() {
    Some(c) if c.is_alphabetic() => number.strip_prefix('.').unwrap_or(number),
    _ => number,
  };

  let amount: f64 = number.parse().ok()?;
  if !amount.is_finite() {
    return None;
  }
  Some(if negative { -amount } else { amount })
}

fn labels_value(value: &Value) -> Vec<String> {
  match value {
    Value::String(s) => s
      .split(',')
      .map(str::trim)
      .filter(|l| !l.is_empty())
      .map(String::from)
      .collect(),
    Value::Array(items) => items
      .iter()
      .filter_map(Value::as_str)
      .map(|l| l.trim().to_string())
      .filter(|l| !l.is_empty())
      .collect(),
    _ => Vec::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::record;

  #[test]
  fn test_add_request_joins_labels() {
    let mut r = record("r1", "Food", 500.0);
    r.labels = vec!["work".to_string(), "lunch".to_string()];

    let body = serde_json::to_value(WriteRequest::add(&r, "k1".to_string())).unwrap();

    assert_eq!(body["action"], "add");
    assert_eq!(body["id"], "r1");
    assert_eq!(body["idempotencyKey"], "k1");
    assert_eq!(body["labels"], "work,lunch");
    assert_eq!(body["subCategory"], "");
  }

  #[test]
  fn test_delete_request_has_no_row_fields() {
    let body = serde_json::to_value(WriteRequest::delete("r1", "k2".to_string())).unwrap();
    assert_eq!(body["action"], "delete");
    assert!(body.get("category").is_none());
  }

  #[test]
  fn test_write_response_outcomes() {
    assert!(parse_write_response(r#"{"success": true}"#).is_ok());
    assert_eq!(
      parse_write_response(r#"{"success": false, "message": "sheet locked"}"#),
      Err(RemoteError::Rejected("sheet locked".to_string()))
    );
    assert!(matches!(
      parse_write_response("<html>error</html>"),
      Err(RemoteError::Malformed(_))
    ));
  }

  #[test]
  fn test_rows_match_header_spellings() {
    let body = r#"[
      {"ID": "a", "Date": "2026-10-01", "Category": "Food", "Sub Category": "Lunch",
       "Item Name": "Thali", "Amount": "1,200.50", "Email Address": "me@example.com",
       "Shop": "Cafe", "Payment Method": "UPI", "Tags": "work, team", "Timestamp": 17},
      {"id": "b", "date": "02/10/2026", "category": "Travel", "item": "Bus",
       "amount": 40, "labels": ["commute"]},
      {"id": "c", "amount": "Rs. 300"},
      {"id": "d", "amount": "1e3"},
      {"id": "e", "amount": "300-"},
      {"id": "f", "amount": "-₹ 45.5"}
    ]"#;

    let records = parse_rows(body).unwrap();

    assert_eq!(records.len(), 6);
    assert_eq!(records[0].sub_category, "Lunch");
    assert_eq!(records[0].item, "Thali");
    assert_eq!(records[0].amount, 1200.5);
    assert_eq!(records[0].email, "me@example.com");
    assert_eq!(records[0].payment_mode, "UPI");
    assert_eq!(records[0].labels, vec!["work", "team"]);
    assert_eq!(records[0].timestamp, "17");
    assert_eq!(records[1].amount, 40.0);
    assert_eq!(records[1].labels, vec!["commute"]);
    assert_eq!(records[2].amount, 300.0);
    assert_eq!(records[3].amount, 1000.0);
    // Unparseable amounts fall back to zero rather than a guess
    assert_eq!(records[4].amount, 0.0);
    assert_eq!(records[5].amount, -45.5);
  }

  #[test]
  fn test_rows_without_id_are_dropped() {
    let records = parse_rows(r#"[{"category": "Food"}, {"id": "x"}]"#).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "x");
  }

  #[test]
  fn test_non_array_rows_are_malformed() {
    assert!(matches!(
      parse_rows(r#"{"error": "quota"}"#),
      Err(RemoteError::Malformed(_))
    ));
    assert!(matches!(parse_rows("not json"), Err(RemoteError::Malformed(_))));
  }
}
