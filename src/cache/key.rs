//! Request parameters and their normalized cache key.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{SyncError, SyncResult};
use crate::store::{DateRange, Granularity};

/// A consumer's request for one client's schedule window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleParams {
  pub client_id: i64,
  /// Calendar date or timestamp; only the date part matters.
  pub start_date: String,
  pub granularity: Granularity,
  #[serde(default)]
  pub force_refresh: bool,
}

impl ScheduleParams {
  pub fn new(client_id: i64, start_date: impl Into<String>, granularity: Granularity) -> Self {
    Self {
      client_id,
      start_date: start_date.into(),
      granularity,
      force_refresh: false,
    }
  }

  pub fn for_date(client_id: i64, start: NaiveDate, granularity: Granularity) -> Self {
    Self::new(client_id, start.format("%Y-%m-%d").to_string(), granularity)
  }

  /// Same request, bypassing the cache.
  pub fn forced(mut self) -> Self {
    self.force_refresh = true;
    self
  }
}

/// Normalized fingerprint of `(client, window start day, granularity)`.
///
/// Requests that differ only in the time of day of their start date map to
/// the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
  client_id: i64,
  window_start: NaiveDate,
  granularity: Granularity,
}

impl RequestKey {
  pub fn new(client_id: i64, window_start: NaiveDate, granularity: Granularity) -> SyncResult<Self> {
    if client_id <= 0 {
      return Err(SyncError::Validation(format!(
        "client id must be a positive integer, got {}",
        client_id
      )));
    }
    Ok(Self {
      client_id,
      window_start,
      granularity,
    })
  }

  /// Validate `params` and build their key. Never touches the network.
  pub fn from_params(params: &ScheduleParams) -> SyncResult<Self> {
    let window_start = normalize_date(&params.start_date)?;
    Self::new(params.client_id, window_start, params.granularity)
  }

  pub fn client_id(&self) -> i64 {
    self.client_id
  }

  pub fn window_start(&self) -> NaiveDate {
    self.window_start
  }

  pub fn granularity(&self) -> Granularity {
    self.granularity
  }

  /// The concrete inclusive window this key covers.
  pub fn range(&self) -> SyncResult<DateRange> {
    DateRange::for_window(self.window_start, self.granularity)
  }

  /// Human readable form, used in logs and cache stats.
  pub fn description(&self) -> String {
    format!(
      "workout-data-{}-{}-{}",
      self.client_id,
      self.window_start.format("%Y-%m-%d"),
      self.granularity
    )
  }

  /// Stable fixed-length hash of the description.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.description().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.description())
  }
}

/// Reduce a date or timestamp string to its calendar day.
///
/// Timestamps with an offset keep the day in their own offset, so
/// `2024-01-01T23:30:00-05:00` is January 1st.
pub fn normalize_date(input: &str) -> SyncResult<NaiveDate> {
  let input = input.trim();
  if input.is_empty() {
    return Err(SyncError::Validation("start date is required".to_string()));
  }

  if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
    return Ok(date);
  }
  if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
    return Ok(ts.date_naive());
  }
  for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
    if let Ok(ts) = NaiveDateTime::parse_from_str(input, format) {
      return Ok(ts.date());
    }
  }

  Err(SyncError::Validation(format!(
    "start date '{}' is not a valid calendar date",
    input
  )))
}
