//! Per-key deduplication and supersession of in-flight fetches.
//!
//! At most one operation runs per key. Each runs on its own task, so its
//! timeout holds whether or not anyone is polling. Callers that arrive while
//! it is in flight attach to it and observe the same outcome; once the last
//! attached caller goes away the operation is cancelled. A superseding
//! request cancels the running one; its late result is dropped instead of
//! being committed, guarded by a per-operation generation number.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

/// Cooperative cancellation signal handed to every coordinated operation.
///
/// Clones observe the same signal. Fetch implementations race their network
/// calls against [`CancelToken::cancelled`] so a superseded request stops
/// promptly.
#[derive(Debug, Clone)]
pub struct CancelToken {
  tx: Arc<watch::Sender<bool>>,
  rx: watch::Receiver<bool>,
}

impl CancelToken {
  pub fn new() -> Self {
    let (tx, rx) = watch::channel(false);
    Self {
      tx: Arc::new(tx),
      rx,
    }
  }

  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves once the token is cancelled.
  pub async fn cancelled(&self) {
    let mut rx = self.rx.clone();
    // The sender lives as long as any clone of this token, so this only
    // returns on cancellation.
    let _ = rx.wait_for(|cancelled| *cancelled).await;
  }

  /// Run `fut` unless the token fires first.
  pub async fn guard<F: Future>(&self, fut: F) -> SyncResult<F::Output> {
    tokio::select! {
      biased;
      _ = self.cancelled() => Err(SyncError::Cancelled),
      out = fut => Ok(out),
    }
  }
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}

/// How a new request relates to one already in flight for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteMode {
  /// Attach to the in-flight operation if there is one.
  Join,
  /// Cancel the in-flight operation and start a new one (forced refresh).
  Supersede,
}

type SharedOp<T> = Shared<BoxFuture<'static, SyncResult<T>>>;

struct InFlight<T> {
  generation: u64,
  token: CancelToken,
  op: SharedOp<T>,
  started: Instant,
  /// Callers currently awaiting `op`
  waiters: usize,
}

type Registry<T> = Arc<Mutex<HashMap<String, InFlight<T>>>>;

fn lock_registry<T>(registry: &Registry<T>) -> MutexGuard<'_, HashMap<String, InFlight<T>>> {
  registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One caller's claim on an in-flight operation.
struct Waiter<T> {
  registry: Registry<T>,
  key: String,
  generation: u64,
}

impl<T> Drop for Waiter<T> {
  fn drop(&mut self) {
    let mut in_flight = lock_registry(&self.registry);
    let last = match in_flight.get_mut(&self.key) {
      Some(entry) if entry.generation == self.generation => {
        entry.waiters = entry.waiters.saturating_sub(1);
        entry.waiters == 0
      }
      // Settled or superseded already.
      _ => return,
    };
    if last {
      if let Some(entry) = in_flight.remove(&self.key) {
        debug!(key = %self.key, generation = self.generation, "no callers left, cancelling request");
        entry.token.cancel();
      }
    }
  }
}

/// A pending operation as seen by [`RequestCoordinator::pending`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
  pub key: String,
  pub generation: u64,
  pub age: Duration,
}

pub struct RequestCoordinator<T> {
  in_flight: Registry<T>,
  next_generation: AtomicU64,
  timeout: Duration,
}

impl<T> RequestCoordinator<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new(timeout: Duration) -> Self {
    Self {
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      next_generation: AtomicU64::new(0),
      timeout,
    }
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  /// Run `operation` for `key`, deduplicated against any in-flight run.
  ///
  /// `commit` is invoked exactly once with the value of an operation that
  /// finishes while still the current one for its key, before any caller
  /// observes the value. Results of superseded or cancelled operations are
  /// never committed; their callers follow the superseding operation if one
  /// is still running, and otherwise get [`SyncError::Cancelled`].
  ///
  /// Dropping the returned future detaches this caller. The operation is
  /// cancelled when no attached caller is left.
  pub async fn execute<F, Fut, C>(
    &self,
    key: &str,
    mode: ExecuteMode,
    operation: F,
    commit: C,
  ) -> SyncResult<T>
  where
    F: FnOnce(CancelToken) -> Fut,
    Fut: Future<Output = SyncResult<T>> + Send + 'static,
    C: FnOnce(&T) + Send + 'static,
  {
    let (mut waiter, mut op) = {
      let mut in_flight = self.lock();
      let existing = match mode {
        ExecuteMode::Join => in_flight.get_mut(key).map(attach),
        ExecuteMode::Supersede => None,
      };
      let (generation, op) = match existing {
        Some((generation, op)) => {
          debug!(key, generation, "attaching to in-flight request");
          (generation, op)
        }
        None => self.start(&mut in_flight, key, operation, commit),
      };
      (self.waiter(key, generation), op)
    };

    loop {
      match op.await {
        Err(SyncError::Cancelled) => {
          let newer = {
            let mut in_flight = self.lock();
            in_flight
              .get_mut(key)
              .filter(|f| f.generation > waiter.generation)
              .map(attach)
          };
          match newer {
            Some((next_generation, next_op)) => {
              debug!(key, from = waiter.generation, to = next_generation, "following superseding request");
              waiter = self.waiter(key, next_generation);
              op = next_op;
            }
            None => return Err(SyncError::Cancelled),
          }
        }
        result => return result,
      }
    }
  }

  fn waiter(&self, key: &str, generation: u64) -> Waiter<T> {
    Waiter {
      registry: Arc::clone(&self.in_flight),
      key: key.to_string(),
      generation,
    }
  }

  fn start<F, Fut, C>(
    &self,
    in_flight: &mut HashMap<String, InFlight<T>>,
    key: &str,
    operation: F,
    commit: C,
  ) -> (u64, SharedOp<T>)
  where
    F: FnOnce(CancelToken) -> Fut,
    Fut: Future<Output = SyncResult<T>> + Send + 'static,
    C: FnOnce(&T) + Send + 'static,
  {
    if let Some(previous) = in_flight.remove(key) {
      debug!(key, superseded = previous.generation, "superseding in-flight request");
      previous.token.cancel();
    }

    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
    let token = CancelToken::new();
    let work = operation(token.clone());

    let registry = Arc::clone(&self.in_flight);
    let op_token = token.clone();
    let owned_key = key.to_string();
    let timeout = self.timeout;

    let settle = async move {
      let outcome = tokio::select! {
        biased;
        _ = op_token.cancelled() => Err(SyncError::Cancelled),
        res = tokio::time::timeout(timeout, work) => match res {
          Ok(result) => result,
          Err(_) => Err(SyncError::Timeout(timeout)),
        },
      };

      // Settle under the registry lock so a superseding request cannot slip
      // in between the generation check and the commit.
      let mut in_flight = lock_registry(&registry);
      let current = in_flight
        .get(&owned_key)
        .is_some_and(|f| f.generation == generation);
      if current {
        in_flight.remove(&owned_key);
      }

      match outcome {
        Ok(value) if current => {
          commit(&value);
          Ok(value)
        }
        Err(err) if current => Err(err),
        Ok(_) => {
          warn!(key = %owned_key, generation, "discarding result of superseded request");
          Err(SyncError::Cancelled)
        }
        Err(_) => Err(SyncError::Cancelled),
      }
    };

    // The registry lock is held until the entry is inserted, so the task
    // cannot settle before it is registered.
    let task = tokio::spawn(settle);
    let op = async move {
      task.await.unwrap_or_else(|err| {
        if err.is_cancelled() {
          Err(SyncError::Cancelled)
        } else {
          Err(SyncError::Store(format!("request task failed: {}", err)))
        }
      })
    }
    .boxed()
    .shared();

    debug!(key, generation, "starting request");
    in_flight.insert(
      key.to_string(),
      InFlight {
        generation,
        token,
        op: op.clone(),
        started: Instant::now(),
        waiters: 1,
      },
    );

    (generation, op)
  }

  /// Cancel the in-flight operation for `key`, if any.
  pub fn cancel(&self, key: &str) -> bool {
    match self.lock().remove(key) {
      Some(entry) => {
        debug!(key, generation = entry.generation, "cancelling request");
        entry.token.cancel();
        true
      }
      None => false,
    }
  }

  pub fn cancel_all(&self) {
    let drained: Vec<InFlight<T>> = self.lock().drain().map(|(_, f)| f).collect();
    if !drained.is_empty() {
      debug!(count = drained.len(), "cancelling all pending requests");
    }
    for entry in drained {
      entry.token.cancel();
    }
  }

  pub fn is_pending(&self, key: &str) -> bool {
    self.lock().contains_key(key)
  }

  pub fn pending(&self) -> Vec<PendingRequest> {
    let now = Instant::now();
    let mut pending: Vec<PendingRequest> = self
      .lock()
      .iter()
      .map(|(key, f)| PendingRequest {
        key: key.clone(),
        generation: f.generation,
        age: now.saturating_duration_since(f.started),
      })
      .collect();
    pending.sort_by(|a, b| a.key.cmp(&b.key));
    pending
  }

  pub fn pending_keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.lock().keys().cloned().collect();
    keys.sort();
    keys
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlight<T>>> {
    lock_registry(&self.in_flight)
  }
}

fn attach<T>(entry: &mut InFlight<T>) -> (u64, SharedOp<T>) {
  entry.waiters += 1;
  (entry.generation, entry.op.clone())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicU32;
  use tokio::sync::oneshot;

  fn coordinator() -> RequestCoordinator<String> {
    RequestCoordinator::new(Duration::from_secs(30))
  }

  #[tokio::test]
  async fn test_concurrent_joins_share_one_operation() {
    let coord = coordinator();
    let calls = Arc::new(AtomicU32::new(0));
    let commits = Arc::new(AtomicU32::new(0));

    let requests = (0..5).map(|_| {
      let calls = calls.clone();
      let commits = commits.clone();
      coord.execute(
        "k",
        ExecuteMode::Join,
        move |_token| async move {
          calls.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(10)).await;
          Ok("value".to_string())
        },
        move |_v: &String| {
          commits.fetch_add(1, Ordering::SeqCst);
        },
      )
    });

    let results = futures::future::join_all(requests).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(commits.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r.as_deref() == Ok("value")));
    assert!(!coord.is_pending("k"));
  }

  #[tokio::test]
  async fn test_failure_reaches_every_attached_caller() {
    let coord = coordinator();
    let requests = (0..3).map(|_| {
      coord.execute(
        "k",
        ExecuteMode::Join,
        |_token| async {
          tokio::time::sleep(Duration::from_millis(5)).await;
          Err(SyncError::Transport("connection reset".into()))
        },
        |_v: &String| panic!("failures must not be committed"),
      )
    });

    let results = futures::future::join_all(requests).await;
    assert!(results
      .iter()
      .all(|r| matches!(r, Err(SyncError::Transport(_)))));
  }

  #[tokio::test]
  async fn test_different_keys_run_independently() {
    let coord = coordinator();
    let calls = Arc::new(AtomicU32::new(0));

    let run = |key: &'static str| {
      let calls = calls.clone();
      coord.execute(
        key,
        ExecuteMode::Join,
        move |_token| async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(key.to_string())
        },
        |_v: &String| {},
      )
    };

    let (a, b) = tokio::join!(run("a"), run("b"));
    assert_eq!(a.unwrap(), "a");
    assert_eq!(b.unwrap(), "b");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_superseded_result_is_never_committed() {
    let coord = coordinator();
    let committed = Arc::new(Mutex::new(Vec::new()));
    let (release_a, gate_a) = oneshot::channel::<()>();

    let commit_a = committed.clone();
    let first = coord.execute(
      "k",
      ExecuteMode::Join,
      move |_token| async move {
        // Ignores its token on purpose; the coordinator still drops the result.
        let _ = gate_a.await;
        Ok("stale".to_string())
      },
      move |v: &String| commit_a.lock().unwrap().push(v.clone()),
    );

    let commit_b = committed.clone();
    let second = async {
      tokio::task::yield_now().await;
      let result = coord
        .execute(
          "k",
          ExecuteMode::Supersede,
          |_token| async { Ok("fresh".to_string()) },
          move |v: &String| commit_b.lock().unwrap().push(v.clone()),
        )
        .await;
      let _ = release_a.send(());
      result
    };

    let (a, b) = tokio::join!(first, second);

    assert_eq!(b.unwrap(), "fresh");
    // Depending on scheduling the first caller either catches the newer
    // request or finds it already settled; it never sees "stale".
    assert!(matches!(a.as_deref(), Err(SyncError::Cancelled) | Ok("fresh")));
    assert_eq!(*committed.lock().unwrap(), vec!["fresh".to_string()]);
  }

  #[tokio::test]
  async fn test_superseded_waiters_follow_newer_request() {
    let coord = coordinator();
    let (release_b, gate_b) = oneshot::channel::<()>();

    let first = coord.execute(
      "k",
      ExecuteMode::Join,
      |token| async move {
        token.cancelled().await;
        Ok("never".to_string())
      },
      |_v: &String| {},
    );

    let second = async {
      tokio::task::yield_now().await;
      coord
        .execute(
          "k",
          ExecuteMode::Supersede,
          |_token| async move {
            let _ = gate_b.await;
            Ok("fresh".to_string())
          },
          |_v: &String| {},
        )
        .await
    };

    let release = async {
      tokio::time::sleep(Duration::from_millis(20)).await;
      let _ = release_b.send(());
    };

    let (a, b, _) = tokio::join!(first, second, release);
    assert_eq!(b.unwrap(), "fresh");
    assert_eq!(a.unwrap(), "fresh");
  }

  #[tokio::test]
  async fn test_cancel_signals_token_and_clears_entry() {
    let coord = coordinator();
    let observed = Arc::new(AtomicU32::new(0));
    let seen = observed.clone();

    let request = coord.execute(
      "k",
      ExecuteMode::Join,
      move |token| async move {
        token.cancelled().await;
        seen.fetch_add(1, Ordering::SeqCst);
        Ok("late".to_string())
      },
      |_v: &String| panic!("cancelled work must not commit"),
    );

    let cancel = async {
      tokio::task::yield_now().await;
      assert!(coord.is_pending("k"));
      assert!(coord.cancel("k"));
    };

    let (result, _) = tokio::join!(request, cancel);
    assert_eq!(result, Err(SyncError::Cancelled));
    assert!(!coord.is_pending("k"));
    assert!(!coord.cancel("k"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_operation_times_out() {
    let coord: RequestCoordinator<String> = RequestCoordinator::new(Duration::from_secs(30));
    let result = coord
      .execute(
        "k",
        ExecuteMode::Join,
        |_token| std::future::pending::<SyncResult<String>>(),
        |_v: &String| {},
      )
      .await;

    assert_eq!(result, Err(SyncError::Timeout(Duration::from_secs(30))));
    assert!(!coord.is_pending("k"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_fires_while_nobody_polls() {
    let coord: RequestCoordinator<String> = RequestCoordinator::new(Duration::from_secs(30));
    let mut request = Box::pin(coord.execute(
      "k",
      ExecuteMode::Join,
      |_token| std::future::pending::<SyncResult<String>>(),
      |_v: &String| {},
    ));
    assert!(futures::poll!(request.as_mut()).is_pending());

    // The caller is still attached but idle.
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!coord.is_pending("k"));
    assert_eq!(request.await, Err(SyncError::Timeout(Duration::from_secs(30))));
  }

  #[tokio::test]
  async fn test_last_caller_leaving_cancels_operation() {
    let coord = coordinator();
    let commits = Arc::new(AtomicU32::new(0));
    let committed = commits.clone();
    let handed_out = Arc::new(Mutex::new(None));
    let slot = handed_out.clone();

    let request = coord.execute(
      "k",
      ExecuteMode::Join,
      move |token: CancelToken| {
        *slot.lock().unwrap() = Some(token.clone());
        async move {
          token.cancelled().await;
          Ok("late".to_string())
        }
      },
      move |_v: &String| {
        committed.fetch_add(1, Ordering::SeqCst);
      },
    );
    assert!(tokio::time::timeout(Duration::from_millis(10), request).await.is_err());

    assert!(!coord.is_pending("k"));
    let token = handed_out.lock().unwrap().clone().unwrap();
    assert!(token.is_cancelled());
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(commits.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_operation_survives_while_a_caller_waits() {
    let coord = coordinator();
    let (release, gate) = oneshot::channel::<()>();

    let first = coord.execute(
      "k",
      ExecuteMode::Join,
      |_token| async move {
        let _ = gate.await;
        Ok("v".to_string())
      },
      |_v: &String| {},
    );
    let second = coord.execute(
      "k",
      ExecuteMode::Join,
      |_token| async { Ok("unused".to_string()) },
      |_v: &String| {},
    );

    let joined = async {
      tokio::task::yield_now().await;
      second.await
    };
    let releaser = async {
      tokio::time::sleep(Duration::from_millis(20)).await;
      assert!(coord.is_pending("k"));
      let _ = release.send(());
    };

    let (abandoned, joined, _) = tokio::join!(
      tokio::time::timeout(Duration::from_millis(10), first),
      joined,
      releaser
    );
    assert!(abandoned.is_err());
    assert_eq!(joined.unwrap(), "v");
    assert!(!coord.is_pending("k"));
  }

  #[tokio::test]
  async fn test_pending_lists_in_flight_keys() {
    let coord = coordinator();
    let (release, gate) = oneshot::channel::<()>();

    let request = coord.execute(
      "k",
      ExecuteMode::Join,
      |_token| async move {
        let _ = gate.await;
        Ok("v".to_string())
      },
      |_v: &String| {},
    );

    let inspect = async {
      tokio::task::yield_now().await;
      let pending = coord.pending();
      assert_eq!(pending.len(), 1);
      assert_eq!(pending[0].key, "k");
      assert_eq!(coord.pending_keys(), vec!["k".to_string()]);
      let _ = release.send(());
    };

    let (result, _) = tokio::join!(request, inspect);
    assert_eq!(result.unwrap(), "v");
    assert!(coord.pending().is_empty());
  }

  #[tokio::test]
  async fn test_cancel_token_guard() {
    let token = CancelToken::new();
    assert_eq!(token.guard(async { 7 }).await, Ok(7));

    token.cancel();
    assert!(token.is_cancelled());
    assert_eq!(
      token.guard(std::future::pending::<()>()).await,
      Err(SyncError::Cancelled)
    );
  }
}
