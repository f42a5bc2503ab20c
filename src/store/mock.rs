//! Scriptable in-memory store for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::types::{DateRange, DayRecord, StoreWindow};
use super::ScheduleStore;
use crate::coordinator::CancelToken;
use crate::error::{SyncError, SyncResult};

/// Answers every fetch with one draft row on the first day of the window.
/// The row summary is `call <n>` so tests can tell responses apart.
#[derive(Default)]
pub(crate) struct MockStore {
  calls: AtomicU32,
  requests: Mutex<Vec<(i64, DateRange)>>,
  failures: Mutex<VecDeque<SyncError>>,
  gates: Mutex<VecDeque<oneshot::Receiver<()>>>,
  delay: Duration,
  ignore_cancel: bool,
}

impl MockStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  /// Keep answering after cancellation, like a store that never checks its token.
  pub fn ignoring_cancellation(mut self) -> Self {
    self.ignore_cancel = true;
    self
  }

  /// The next `count` calls fail with `err` before doing anything else.
  pub fn fail_next(&self, count: usize, err: SyncError) {
    let mut failures = self.failures.lock().unwrap();
    for _ in 0..count {
      failures.push_back(err.clone());
    }
  }

  /// The next call blocks until the returned sender fires (or is dropped).
  pub fn hold_next(&self) -> oneshot::Sender<()> {
    let (tx, rx) = oneshot::channel();
    self.gates.lock().unwrap().push_back(rx);
    tx
  }

  pub fn calls(&self) -> u32 {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn requests(&self) -> Vec<(i64, DateRange)> {
    self.requests.lock().unwrap().clone()
  }

  async fn respond(&self, call: u32, range: DateRange) -> SyncResult<StoreWindow> {
    let gate = self.gates.lock().unwrap().pop_front();
    if let Some(gate) = gate {
      let _ = gate.await;
    }
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }

    let failure = self.failures.lock().unwrap().pop_front();
    if let Some(err) = failure {
      return Err(err);
    }

    let row = DayRecord {
      id: i64::from(call),
      for_date: range.start,
      summary: Some(format!("call {}", call)),
      details_json: serde_json::json!({ "exercises": [] }),
      is_approved: false,
    };
    Ok(StoreWindow::from_rows(vec![row], vec![], range.days()))
  }
}

#[async_trait]
impl ScheduleStore for MockStore {
  async fn fetch_window(
    &self,
    client_id: i64,
    range: DateRange,
    cancel: &CancelToken,
  ) -> SyncResult<StoreWindow> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
    self.requests.lock().unwrap().push((client_id, range));

    if self.ignore_cancel {
      self.respond(call, range).await
    } else {
      cancel.guard(self.respond(call, range)).await?
    }
  }
}
