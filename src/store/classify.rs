//! Approval-status classification of a window's preview rows.

use chrono::Days;

use super::types::{DataSource, DateRange, DayRecord, PlanStatus, WeeklyStatus};

const WEEKS_PER_MONTH: u32 = 4;

/// Classify a window from its preview rows.
///
/// - no rows: `no_plan` from the database
/// - one approved row per expected day: `approved`
/// - anything else still needs approval: `draft`
pub fn classify_window(preview: &[DayRecord], expected_days: u32) -> (PlanStatus, DataSource) {
  let total = preview.len();
  let approved = preview.iter().filter(|r| r.is_approved).count();

  if total == 0 {
    (PlanStatus::NoPlan, DataSource::Database)
  } else if total == expected_days as usize && approved == total {
    (PlanStatus::Approved, DataSource::Database)
  } else {
    (PlanStatus::Draft, DataSource::Generated)
  }
}

/// Split a 28-day window into four 7-day slices with their own status.
pub fn weekly_breakdown(range: DateRange, preview: &[DayRecord]) -> Vec<WeeklyStatus> {
  (0..WEEKS_PER_MONTH)
    .filter_map(|week| {
      let start = range.start.checked_add_days(Days::new(u64::from(week) * 7))?;
      let end = start.checked_add_days(Days::new(6))?;
      let week_range = DateRange { start, end };

      let rows: Vec<&DayRecord> = preview
        .iter()
        .filter(|r| week_range.contains(r.for_date))
        .collect();

      let status = if rows.is_empty() {
        PlanStatus::NoPlan
      } else if rows.iter().all(|r| r.is_approved) {
        PlanStatus::Approved
      } else {
        PlanStatus::Draft
      };

      Some(WeeklyStatus {
        week: week + 1,
        status,
        range: week_range,
      })
    })
    .collect()
}

/// Fold weekly statuses into the status of the whole month.
pub fn overall_status(weeks: &[WeeklyStatus]) -> PlanStatus {
  let count = |s: PlanStatus| weeks.iter().filter(|w| w.status == s).count();
  let total = weeks.len();

  if total > 0 && count(PlanStatus::Approved) == total {
    PlanStatus::Approved
  } else if count(PlanStatus::Draft) > 0 {
    PlanStatus::Draft
  } else if count(PlanStatus::NoPlan) == total {
    PlanStatus::NoPlan
  } else {
    PlanStatus::PartialApproved
  }
}
