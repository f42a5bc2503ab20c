//! Live save/approve workflow for one editable plan.

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::button::ButtonConfig;
use super::table::{self, ApprovalAction, ApprovalState};
use crate::config::ApprovalConfig;
use crate::coordinator::CancelToken;

/// Result reported by a save call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaveOutcome {
  pub success: bool,
}

/// Result reported by a status refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshOutcome {
  /// The saved plan is complete and awaits approval
  pub can_approve: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApproveOutcome {
  pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryInfo {
  pub count: u32,
  pub max_retries: u32,
  pub can_retry: bool,
}

type Listener = Arc<dyn Fn(ApprovalState, ApprovalState, ApprovalAction) + Send + Sync>;

struct Inner {
  state: ApprovalState,
  listeners: Vec<(u64, Listener)>,
  next_listener: u64,
  retry_count: u32,
  pending_retry: Option<CancelToken>,
  /// Set while a retry callback runs; lets one handler resume the busy
  /// state that `RETRY` entered.
  resume_busy: bool,
}

/// Handle returned by [`ApprovalMachine::subscribe`].
pub struct Subscription {
  id: u64,
  inner: Weak<Mutex<Inner>>,
}

impl Subscription {
  pub fn unsubscribe(self) {
    if let Some(inner) = self.inner.upgrade() {
      lock(&inner).listeners.retain(|(id, _)| *id != self.id);
    }
  }
}

/// State machine instance. Clones share the same workflow.
///
/// `dispatch` never panics and never fails loudly: an action that is not
/// allowed from the current state is rejected and reported as `false`.
#[derive(Clone)]
pub struct ApprovalMachine {
  inner: Arc<Mutex<Inner>>,
  max_retries: u32,
  retry_base_delay: Duration,
}

impl ApprovalMachine {
  pub fn new(config: &ApprovalConfig) -> Self {
    debug!(state = %ApprovalState::Hidden, "approval workflow created");
    Self {
      inner: Arc::new(Mutex::new(Inner {
        state: ApprovalState::Hidden,
        listeners: Vec::new(),
        next_listener: 0,
        retry_count: 0,
        pending_retry: None,
        resume_busy: false,
      })),
      max_retries: config.max_retries,
      retry_base_delay: config.retry_base_delay(),
    }
  }

  pub fn state(&self) -> ApprovalState {
    lock(&self.inner).state
  }

  pub fn button_config(&self) -> ButtonConfig {
    ButtonConfig::for_state(self.state())
  }

  pub fn can_transition(&self, action: ApprovalAction) -> bool {
    table::can_transition(self.state(), action)
  }

  /// Call `listener(new, old, action)` after every accepted transition.
  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(ApprovalState, ApprovalState, ApprovalAction) + Send + Sync + 'static,
  {
    let mut inner = lock(&self.inner);
    inner.next_listener += 1;
    let id = inner.next_listener;
    inner.listeners.push((id, Arc::new(listener)));
    Subscription {
      id,
      inner: Arc::downgrade(&self.inner),
    }
  }

  /// Apply `action`. Returns whether the transition happened.
  pub fn dispatch(&self, action: ApprovalAction) -> bool {
    let (old, new, listeners) = {
      let mut inner = lock(&self.inner);
      let old = inner.state;
      let Some(new) = table::next_state(old, action) else {
        warn!(state = %old, %action, "rejected approval transition");
        return false;
      };
      inner.state = new;
      let listeners: Vec<Listener> = inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
      (old, new, listeners)
    };

    debug!(from = %old, to = %new, %action, "approval transition");
    // Outside the lock so listeners may query or dispatch.
    for listener in listeners {
      listener(new, old, action);
    }
    true
  }

  /// Enter `busy` via `start`. Inside a retry callback the machine is
  /// already there, and the first handler to ask may carry on from it.
  fn begin(&self, start: ApprovalAction, busy: ApprovalState) -> bool {
    if self.dispatch(start) {
      return true;
    }
    let mut inner = lock(&self.inner);
    inner.state == busy && std::mem::take(&mut inner.resume_busy)
  }

  /// Save `data` with `save`. Ends in `refreshing` on success and in
  /// `error_stuck` on a negative outcome or an error.
  pub async fn handle_save<D, F, Fut, E>(&self, data: D, save: F) -> bool
  where
    F: FnOnce(D) -> Fut,
    Fut: Future<Output = Result<SaveOutcome, E>>,
    E: Display,
  {
    if !self.begin(ApprovalAction::SaveStart, ApprovalState::Saving) {
      return false;
    }

    match save(data).await {
      Ok(SaveOutcome { success: true }) => self.dispatch(ApprovalAction::SaveSuccess),
      Ok(_) => {
        debug!("save reported failure");
        self.dispatch(ApprovalAction::SaveError);
        false
      }
      Err(err) => {
        warn!(error = %err, "save failed");
        self.dispatch(ApprovalAction::SaveError);
        false
      }
    }
  }

  /// Check the saved plan. Only an explicit `can_approve` enables approval.
  pub async fn handle_refresh<F, Fut, E>(&self, refresh: F) -> bool
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<RefreshOutcome, E>>,
    E: Display,
  {
    if !self.begin(ApprovalAction::RefreshStart, ApprovalState::Refreshing) {
      return false;
    }

    match refresh().await {
      Ok(RefreshOutcome { can_approve: true }) => {
        let moved = self.dispatch(ApprovalAction::RefreshSuccess);
        if moved {
          lock(&self.inner).retry_count = 0;
        }
        moved
      }
      Ok(_) => {
        warn!("refreshed plan is not approvable");
        self.dispatch(ApprovalAction::RefreshError);
        false
      }
      Err(err) => {
        warn!(error = %err, "status refresh failed");
        self.dispatch(ApprovalAction::RefreshError);
        false
      }
    }
  }

  /// Approve the plan. Success completes the workflow (`hidden`).
  pub async fn handle_approve<F, Fut, E>(&self, approve: F) -> bool
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ApproveOutcome, E>>,
    E: Display,
  {
    if !self.dispatch(ApprovalAction::ApproveStart) {
      return false;
    }

    match approve().await {
      Ok(ApproveOutcome { success: true }) => self.dispatch(ApprovalAction::ApproveSuccess),
      Ok(_) => {
        debug!("approve reported failure");
        self.dispatch(ApprovalAction::ApproveError);
        false
      }
      Err(err) => {
        warn!(error = %err, "approve failed");
        self.dispatch(ApprovalAction::ApproveError);
        false
      }
    }
  }

  /// Wait out the next backoff step, re-enter the busy state and run `retry`.
  ///
  /// Attempts are capped at `max_retries` per workflow; past the cap this
  /// returns `false` without doing anything and [`RetryInfo::can_retry`]
  /// reports `false`. [`ApprovalMachine::reset`] and
  /// [`ApprovalMachine::destroy`] abandon a retry that is still waiting.
  pub async fn handle_retry<F, Fut, E>(&self, retry: F) -> bool
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Display,
  {
    let (attempt, token) = {
      let mut inner = lock(&self.inner);
      if inner.retry_count >= self.max_retries {
        warn!(max_retries = self.max_retries, "retry limit reached");
        return false;
      }
      inner.retry_count += 1;
      let token = CancelToken::new();
      if let Some(previous) = inner.pending_retry.replace(token.clone()) {
        previous.cancel();
      }
      (inner.retry_count, token)
    };

    let delay = self.retry_delay(attempt);
    debug!(attempt, max_retries = self.max_retries, ?delay, "retrying approval step");
    if token.guard(tokio::time::sleep(delay)).await.is_err() {
      debug!(attempt, "pending retry abandoned");
      return false;
    }
    {
      // Reset, destroy and newer retries all cancel this token.
      let mut inner = lock(&self.inner);
      if token.is_cancelled() {
        return false;
      }
      inner.pending_retry = None;
    }

    if !self.dispatch(ApprovalAction::Retry) {
      return false;
    }

    lock(&self.inner).resume_busy = true;
    let outcome = retry().await;
    lock(&self.inner).resume_busy = false;

    let succeeded = match outcome {
      Ok(succeeded) => succeeded,
      Err(err) => {
        warn!(attempt, error = %err, "retry failed");
        false
      }
    };
    if !succeeded && self.state() == ApprovalState::Saving {
      self.dispatch(ApprovalAction::SaveError);
    }
    succeeded
  }

  fn retry_delay(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self.retry_base_delay.saturating_mul(factor)
  }

  pub fn retry_info(&self) -> RetryInfo {
    let count = lock(&self.inner).retry_count;
    RetryInfo {
      count,
      max_retries: self.max_retries,
      can_retry: count < self.max_retries,
    }
  }

  /// Abandon any pending retry, zero the retry counter and dispatch `RESET`.
  pub fn reset(&self) -> bool {
    self.clear_retry();
    self.dispatch(ApprovalAction::Reset)
  }

  /// Drop every listener and abandon any pending retry. The state is kept.
  pub fn destroy(&self) {
    self.clear_retry();
    lock(&self.inner).listeners.clear();
  }

  fn clear_retry(&self) {
    let mut inner = lock(&self.inner);
    inner.retry_count = 0;
    if let Some(pending) = inner.pending_retry.take() {
      pending.cancel();
    }
  }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
  inner.lock().unwrap_or_else(PoisonError::into_inner)
}
