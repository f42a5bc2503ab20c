//! Poll-driven bridge between a consumer's render loop and the sync service.
//!
//! A `ScheduleQuery` owns one consumer's view of one schedule window: it
//! starts fetches on a background task, hands results back through a channel
//! and keeps the last known data visible while a refetch is loading.
//!
//! ```ignore
//! let mut query = ScheduleQuery::new(service.clone(), params);
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match query.state() {
//!     QueryState::Loading => render_spinner(query.data()),
//!     QueryState::Success(data) => render_plan(data, query.is_stale()),
//!     QueryState::Error(e) => render_error(e, query.data()),
//!     QueryState::Idle => {}
//! }
//! ```

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::ScheduleParams;
use crate::error::{SyncError, SyncResult};
use crate::store::ScheduleResult;
use crate::sync::DataSyncService;

/// The state of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(SyncError),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&SyncError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// One consumer's subscription to a schedule window.
///
/// Dropping the query aborts its background task. The store request it was
/// waiting on is cancelled once no other consumer is waiting on it.
pub struct ScheduleQuery {
  service: DataSyncService,
  params: ScheduleParams,
  state: QueryState<ScheduleResult>,
  last_known: Option<ScheduleResult>,
  receiver: Option<mpsc::UnboundedReceiver<SyncResult<ScheduleResult>>>,
  task: Option<JoinHandle<()>>,
}

impl ScheduleQuery {
  pub fn new(service: DataSyncService, params: ScheduleParams) -> Self {
    Self {
      service,
      params: ScheduleParams {
        force_refresh: false,
        ..params
      },
      state: QueryState::Idle,
      last_known: None,
      receiver: None,
      task: None,
    }
  }

  pub fn params(&self) -> &ScheduleParams {
    &self.params
  }

  pub fn state(&self) -> &QueryState<ScheduleResult> {
    &self.state
  }

  /// Freshest data this query has seen, including while loading or after
  /// an error.
  pub fn data(&self) -> Option<&ScheduleResult> {
    self.state.data().or(self.last_known.as_ref())
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&SyncError> {
    self.state.error()
  }

  /// True when the cached window is missing or past the stale threshold.
  pub fn is_stale(&self) -> bool {
    self.service.is_data_stale(&self.params)
  }

  /// Start fetching unless already loading.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    if self.last_known.is_none() {
      self.last_known = self.service.get_cached_data(&self.params);
    }
    self.start_fetch(self.params.clone());
  }

  /// Fetch again from the store, bypassing the cache and replacing any
  /// fetch this query has pending.
  pub fn refetch(&mut self) {
    self.stop();
    self.start_fetch(self.params.clone().forced());
  }

  /// Drop the cached window, then refetch it.
  pub fn invalidate(&mut self) {
    self.service.invalidate_cache(&self.params);
    self.refetch();
  }

  /// Poll for results from a pending fetch.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    let outcome = match receiver.try_recv() {
      Ok(result) => result,
      Err(mpsc::error::TryRecvError::Empty) => return false,
      Err(mpsc::error::TryRecvError::Disconnected) => Err(SyncError::Cancelled),
    };
    self.receiver = None;
    self.task = None;

    self.state = match outcome {
      Ok(data) => {
        self.last_known = Some(data.clone());
        QueryState::Success(data)
      }
      // Not a failure: keep showing what we had.
      Err(SyncError::Cancelled) => match &self.last_known {
        Some(data) => QueryState::Success(data.clone()),
        None => QueryState::Idle,
      },
      Err(err) => QueryState::Error(err),
    };
    true
  }

  fn start_fetch(&mut self, params: ScheduleParams) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = QueryState::Loading;

    let service = self.service.clone();
    self.task = Some(tokio::spawn(async move {
      let result = service.fetch(&params).await;
      // Receiver may have been dropped
      let _ = tx.send(result);
    }));
  }

  fn stop(&mut self) {
    self.receiver = None;
    if let Some(task) = self.task.take() {
      // Releases this query's claim on the shared request.
      task.abort();
      debug!(client_id = self.params.client_id, start = %self.params.start_date, "abandoned pending schedule fetch");
    }
  }
}

impl Drop for ScheduleQuery {
  fn drop(&mut self) {
    self.stop();
  }
}

impl std::fmt::Debug for ScheduleQuery {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ScheduleQuery")
      .field("params", &self.params)
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}
