//! Timestamped cache entries.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A cached payload together with the moment it was captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
  pub data: T,
  pub captured_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  /// Wrap data captured right now.
  pub fn now(data: T) -> Self {
    Self {
      data,
      captured_at: Utc::now(),
    }
  }

  /// Fresh iff `now - captured_at < ttl`.
  pub fn is_fresh(&self, ttl: Duration) -> bool {
    Utc::now() - self.captured_at < ttl
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fresh_within_ttl() {
    let entry = CacheEntry::now(vec![1, 2, 3]);
    assert!(entry.is_fresh(Duration::minutes(5)));
  }

  #[test]
  fn test_stale_after_ttl() {
    let entry = CacheEntry {
      data: (),
      captured_at: Utc::now() - Duration::minutes(6),
    };
    assert!(!entry.is_fresh(Duration::minutes(5)));
  }

  #[test]
  fn test_zero_ttl_is_never_fresh() {
    let entry = CacheEntry::now("x");
    assert!(!entry.is_fresh(Duration::zero()));
  }
}
