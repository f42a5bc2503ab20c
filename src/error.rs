//! Error taxonomy shared by the cache, coordinator, sync service and store adapters.

use std::time::Duration;

use thiserror::Error;

/// Classified failure of a sync operation.
///
/// `Clone` because one failed coordinated operation is delivered to every
/// caller attached to it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// Malformed input (bad client id, unparseable date). Never retried or cached.
  #[error("invalid parameters: {0}")]
  Validation(String),

  /// The operation exceeded its wall-clock ceiling.
  #[error("operation timed out after {0:?}")]
  Timeout(Duration),

  /// Network or transport failure talking to the store.
  #[error("transport error: {0}")]
  Transport(String),

  /// The store explicitly reported that the target does not exist.
  #[error("not found: {0}")]
  NotFound(String),

  /// The store rejected the request (auth, bad filter, constraint...).
  #[error("store rejected request: {0}")]
  Store(String),

  /// Superseded by a newer request or torn down by its consumer.
  #[error("operation cancelled")]
  Cancelled,
}

impl SyncError {
  /// Whether a retry policy may try again after this error.
  pub fn is_transient(&self) -> bool {
    matches!(self, SyncError::Timeout(_) | SyncError::Transport(_))
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, SyncError::Cancelled)
  }
}

pub type SyncResult<T> = Result<T, SyncError>;
