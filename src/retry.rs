//! Bounded exponential backoff for transient store failures.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, warn};

use crate::coordinator::CancelToken;
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Total attempts, including the first one.
  pub max_attempts: u32,
  #[serde(rename = "base_delay_ms", with = "millis")]
  pub base_delay: Duration,
  #[serde(rename = "max_delay_ms", with = "millis")]
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(10),
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `retry` (1-based): base, 2x base, 4x base... capped.
  pub fn delay_for(&self, retry: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry.saturating_sub(1));
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  /// Run `attempt` until it succeeds, fails permanently, or attempts run out.
  ///
  /// Only [`SyncError::is_transient`] failures are retried. Backoff sleeps end
  /// early with [`SyncError::Cancelled`] when `cancel` fires.
  pub async fn run<T, F, Fut>(&self, label: &str, cancel: &CancelToken, mut attempt: F) -> SyncResult<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
  {
    let max_attempts = self.max_attempts.max(1);
    let mut tries = 0;

    loop {
      if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
      }
      tries += 1;

      match attempt().await {
        Ok(value) => return Ok(value),
        Err(err) if err.is_transient() && tries < max_attempts => {
          let delay = self.delay_for(tries);
          warn!(label, attempt = tries, max_attempts, ?delay, error = %err, "transient failure, retrying");
          cancel.guard(tokio::time::sleep(delay)).await?;
        }
        Err(err) => {
          if err.is_transient() {
            error!(label, attempts = tries, error = %err, "giving up after repeated failures");
          }
          return Err(err);
        }
      }
    }
  }
}

mod millis {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer};

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
  where
    D: Deserializer<'de>,
  {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  fn counting_attempt(
    calls: Arc<AtomicU32>,
    failures: u32,
    failure: SyncError,
  ) -> impl FnMut() -> std::future::Ready<SyncResult<u32>> {
    move || {
      let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
      if n <= failures {
        std::future::ready(Err(failure.clone()))
      } else {
        std::future::ready(Ok(n))
      }
    }
  }

  #[test]
  fn test_delay_doubles_and_caps() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(1), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2), Duration::from_secs(2));
    assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    assert_eq!(policy.delay_for(10), Duration::from_secs(10));
  }

  #[tokio::test(start_paused = true)]
  async fn test_succeeds_on_last_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::default();
    let start = tokio::time::Instant::now();

    let result = policy
      .run(
        "fetch",
        &CancelToken::new(),
        counting_attempt(calls.clone(), 2, SyncError::Transport("reset".into())),
      )
      .await;

    assert_eq!(result, Ok(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 1s + 2s of backoff
    assert_eq!(start.elapsed(), Duration::from_secs(3));
  }

  #[tokio::test(start_paused = true)]
  async fn test_exhausted_attempts_reject() {
    let calls = Arc::new(AtomicU32::new(0));
    let result = RetryPolicy::default()
      .run(
        "fetch",
        &CancelToken::new(),
        counting_attempt(calls.clone(), 3, SyncError::Timeout(Duration::from_secs(8))),
      )
      .await;

    assert_eq!(result, Err(SyncError::Timeout(Duration::from_secs(8))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_permanent_errors_are_not_retried() {
    for failure in [
      SyncError::Validation("bad id".into()),
      SyncError::NotFound("client 9".into()),
      SyncError::Store("401".into()),
    ] {
      let calls = Arc::new(AtomicU32::new(0));
      let result = RetryPolicy::default()
        .run(
          "fetch",
          &CancelToken::new(),
          counting_attempt(calls.clone(), 1, failure.clone()),
        )
        .await;
      assert_eq!(result, Err(failure));
      assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_interrupts_backoff() {
    let calls = Arc::new(AtomicU32::new(0));
    let token = CancelToken::new();
    let canceller = token.clone();

    let cancel_soon = async move {
      tokio::time::sleep(Duration::from_millis(500)).await;
      canceller.cancel();
    };
    let policy = RetryPolicy::default();
    let run = policy.run(
      "fetch",
      &token,
      counting_attempt(calls.clone(), 5, SyncError::Transport("down".into())),
    );

    let (result, _) = tokio::join!(run, cancel_soon);
    assert_eq!(result, Err(SyncError::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_deserialize_from_millis() {
    let policy: RetryPolicy = serde_yaml::from_str("max_attempts: 5\nbase_delay_ms: 250\n").unwrap();
    assert_eq!(policy.max_attempts, 5);
    assert_eq!(policy.base_delay, Duration::from_millis(250));
    assert_eq!(policy.max_delay, Duration::from_secs(10));
  }
}
