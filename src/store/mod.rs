//! The external schedule store: what the sync service needs from it, the
//! payload it returns, and an HTTP adapter for the hosted store.

mod classify;
mod rest;
mod types;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;

use crate::coordinator::CancelToken;
use crate::error::SyncResult;

pub use classify::{classify_window, overall_status, weekly_breakdown};
pub use rest::{RestStore, StoreConfig};
pub use types::{
  DataSource, DateRange, DayRecord, Granularity, PlanStatus, ScheduleResult, StoreWindow,
  WeeklyStatus,
};

/// Read access to per-day schedule rows.
///
/// Implementations must be idempotent reads, since transient failures are
/// retried, and must stop outstanding network calls once `cancel` fires.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
  /// Rows and their aggregate classification for exactly `range`.
  async fn fetch_window(
    &self,
    client_id: i64,
    range: DateRange,
    cancel: &CancelToken,
  ) -> SyncResult<StoreWindow>;
}
