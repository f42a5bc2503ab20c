use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{SyncError, SyncResult};

use super::classify;

/// Requested window size for a schedule fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
  /// 7 days
  Weekly,
  /// 28 days
  Monthly,
}

impl Granularity {
  pub fn days(self) -> u32 {
    match self {
      Granularity::Weekly => 7,
      Granularity::Monthly => 28,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Granularity::Weekly => "weekly",
      Granularity::Monthly => "monthly",
    }
  }
}

impl fmt::Display for Granularity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Granularity {
  type Err = SyncError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "weekly" | "week" => Ok(Granularity::Weekly),
      "monthly" | "month" => Ok(Granularity::Monthly),
      other => Err(SyncError::Validation(format!(
        "unknown granularity '{}', expected weekly or monthly",
        other
      ))),
    }
  }
}

/// Inclusive, contiguous range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
  pub start: NaiveDate,
  pub end: NaiveDate,
}

impl DateRange {
  /// The concrete window covered by `granularity` starting at `start`.
  pub fn for_window(start: NaiveDate, granularity: Granularity) -> SyncResult<Self> {
    let end = start
      .checked_add_days(Days::new(u64::from(granularity.days()) - 1))
      .ok_or_else(|| SyncError::Validation(format!("date window starting {} overflows", start)))?;
    Ok(Self { start, end })
  }

  pub fn days(&self) -> u32 {
    ((self.end - self.start).num_days() + 1).max(0) as u32
  }

  pub fn contains(&self, date: NaiveDate) -> bool {
    self.start <= date && date <= self.end
  }
}

impl fmt::Display for DateRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} to {}", self.start, self.end)
  }
}

/// Aggregate approval status of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
  NoPlan,
  Draft,
  Approved,
  PartialApproved,
}

/// Where the rows of a window came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
  Generated,
  Template,
  Database,
}

/// One per-day row from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayRecord {
  pub id: i64,
  pub for_date: NaiveDate,
  #[serde(default)]
  pub summary: Option<String>,
  #[serde(default)]
  pub details_json: serde_json::Value,
  /// Committed schedule rows carry no approval flag.
  #[serde(default)]
  pub is_approved: bool,
}

/// What the store returns for exactly one requested window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreWindow {
  pub status: PlanStatus,
  pub source: DataSource,
  /// Draft rows awaiting (or holding) approval
  pub preview: Vec<DayRecord>,
  /// Committed rows
  pub schedule: Vec<DayRecord>,
}

impl StoreWindow {
  /// Build a window from raw rows, classifying it against the expected day count.
  pub fn from_rows(preview: Vec<DayRecord>, schedule: Vec<DayRecord>, expected_days: u32) -> Self {
    let (status, source) = classify::classify_window(&preview, expected_days);
    Self {
      status,
      source,
      preview,
      schedule,
    }
  }
}

/// Status of one 7-day slice of a monthly window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyStatus {
  /// 1-based
  pub week: u32,
  pub status: PlanStatus,
  pub range: DateRange,
}

/// Cached payload for one `(client, window, granularity)` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleResult {
  pub status: PlanStatus,
  pub source: DataSource,
  pub preview: Vec<DayRecord>,
  pub schedule: Vec<DayRecord>,
  pub total_days: u32,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub weekly_breakdown: Vec<WeeklyStatus>,
  pub granularity: Granularity,
  pub date_range: DateRange,
  pub fetched_at: DateTime<Utc>,
}

impl ScheduleResult {
  /// Stamp a store window with the request metadata.
  ///
  /// `date_range` is always the requested window; rows the store returned
  /// outside it are dropped.
  pub fn assemble(
    window: StoreWindow,
    range: DateRange,
    granularity: Granularity,
    fetched_at: DateTime<Utc>,
  ) -> Self {
    let StoreWindow {
      status,
      source,
      preview,
      schedule,
    } = window;

    let before = preview.len();
    let preview = retain_in_range(preview, range, "preview");
    let schedule = retain_in_range(schedule, range, "schedule");
    // Stray rows must not count towards the window's status.
    let (mut status, source) = if preview.len() == before {
      (status, source)
    } else {
      classify::classify_window(&preview, range.days())
    };

    let weekly_breakdown = match granularity {
      Granularity::Monthly if !preview.is_empty() || !schedule.is_empty() => {
        let weeks = classify::weekly_breakdown(range, &preview);
        status = classify::overall_status(&weeks);
        weeks
      }
      _ => Vec::new(),
    };

    Self {
      status,
      source,
      preview,
      schedule,
      total_days: range.days(),
      weekly_breakdown,
      granularity,
      date_range: range,
      fetched_at,
    }
  }

  /// A window with draft rows that are not all approved yet.
  pub fn can_approve(&self) -> bool {
    !self.preview.is_empty() && self.status != PlanStatus::Approved
  }
}

fn retain_in_range(records: Vec<DayRecord>, range: DateRange, table: &str) -> Vec<DayRecord> {
  let before = records.len();
  let kept: Vec<DayRecord> = records
    .into_iter()
    .filter(|r| range.contains(r.for_date))
    .collect();
  if kept.len() != before {
    warn!(
      table,
      dropped = before - kept.len(),
      range = %range,
      "store returned rows outside the requested window"
    );
  }
  kept
}
