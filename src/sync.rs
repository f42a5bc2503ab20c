//! Cache-first schedule fetching with deduplicated, retried store calls.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::cache::{CacheEntry, CacheStats, CacheStore, RequestKey, ScheduleParams};
use crate::config::{CacheConfig, SyncConfig};
use crate::coordinator::{ExecuteMode, PendingRequest, RequestCoordinator};
use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;
use crate::store::{ScheduleResult, ScheduleStore};

/// Single entry point for schedule windows.
///
/// Cheap to clone; clones share the cache, the in-flight registry and the
/// store. Build one per composition root (or per test) instead of sharing a
/// process-wide instance.
#[derive(Clone)]
pub struct DataSyncService {
  store: Arc<dyn ScheduleStore>,
  cache: Arc<CacheStore<ScheduleResult>>,
  coordinator: Arc<RequestCoordinator<ScheduleResult>>,
  retry: RetryPolicy,
  ttl: Duration,
  stale_after: Duration,
}

impl DataSyncService {
  /// Create a service around `store`.
  ///
  /// When called inside a tokio runtime the periodic cache sweep starts
  /// immediately; it stops on [`DataSyncService::shutdown`] or once the last
  /// clone is dropped.
  pub fn new(store: Arc<dyn ScheduleStore>, cache: &CacheConfig, sync: &SyncConfig) -> Self {
    let cache_store = Arc::new(CacheStore::new());
    if tokio::runtime::Handle::try_current().is_ok() {
      cache_store.start_sweeper(cache.sweep_interval());
    } else {
      debug!("no tokio runtime, cache sweeper not started");
    }

    Self {
      store,
      cache: cache_store,
      coordinator: Arc::new(RequestCoordinator::new(sync.request_timeout())),
      retry: sync.retry,
      ttl: cache.ttl(),
      stale_after: cache.stale_after(),
    }
  }

  /// Schedule window for `params`, from cache when fresh enough.
  ///
  /// A cached entry past the stale threshold is still returned, and one
  /// background refresh is started for it. Forced requests skip the cache and
  /// supersede any fetch already in flight for the same window.
  pub async fn fetch(&self, params: &ScheduleParams) -> SyncResult<ScheduleResult> {
    let key = RequestKey::from_params(params)?;

    if !params.force_refresh {
      if let Some(entry) = self.cache.get(&key) {
        if entry.is_stale(self.stale_after) {
          debug!(key = %key, age = ?entry.age(), "serving stale entry, refreshing in background");
          self.refresh_in_background(key);
        } else {
          debug!(key = %key, "cache hit");
        }
        return Ok(entry.value);
      }
      debug!(key = %key, "cache miss");
    }

    let mode = if params.force_refresh {
      ExecuteMode::Supersede
    } else {
      ExecuteMode::Join
    };

    match self.fetch_from_store(key, mode).await {
      // Superseded with nothing left to follow: whatever the newer request
      // committed is the answer.
      Err(SyncError::Cancelled) => self
        .cache
        .get(&key)
        .map(|entry| entry.value)
        .ok_or(SyncError::Cancelled),
      result => result,
    }
  }

  async fn fetch_from_store(&self, key: RequestKey, mode: ExecuteMode) -> SyncResult<ScheduleResult> {
    let range = key.range()?;
    let store = Arc::clone(&self.store);
    let cache = Arc::clone(&self.cache);
    let retry = self.retry;
    let ttl = self.ttl;
    let label = key.description();
    let op_key = label.clone();

    self
      .coordinator
      .execute(
        &op_key,
        mode,
        move |cancel| async move {
          let window = retry
            .run(&label, &cancel, || {
              store.fetch_window(key.client_id(), range, &cancel)
            })
            .await?;
          let result = ScheduleResult::assemble(window, range, key.granularity(), Utc::now());
          info!(
            key = %label,
            status = ?result.status,
            preview = result.preview.len(),
            schedule = result.schedule.len(),
            "fetched schedule window"
          );
          Ok(result)
        },
        move |result: &ScheduleResult| cache.set(key, result.clone(), ttl),
      )
      .await
  }

  fn refresh_in_background(&self, key: RequestKey) {
    let service = self.clone();
    tokio::spawn(async move {
      // Another reader may have refreshed it already.
      let still_stale = service
        .cache
        .get(&key)
        .map_or(true, |entry| entry.is_stale(service.stale_after));
      if !still_stale {
        return;
      }
      match service.fetch_from_store(key, ExecuteMode::Join).await {
        Ok(_) | Err(SyncError::Cancelled) => {}
        Err(err) => debug!(key = %key, error = %err, "background refresh failed"),
      }
    });
  }

  /// Last known result for `params`, even if expired but not yet swept.
  /// Never triggers a fetch.
  pub fn get_cached_data(&self, params: &ScheduleParams) -> Option<ScheduleResult> {
    self.cached_entry(params).map(|entry| entry.value)
  }

  pub fn cached_entry(&self, params: &ScheduleParams) -> Option<CacheEntry<ScheduleResult>> {
    let key = RequestKey::from_params(params).ok()?;
    self.cache.peek(&key)
  }

  /// True when there is no usable entry or it is past the stale threshold.
  pub fn is_data_stale(&self, params: &ScheduleParams) -> bool {
    self
      .cached_entry(params)
      .map_or(true, |entry| entry.is_stale(self.stale_after))
  }

  pub fn invalidate_cache(&self, params: &ScheduleParams) -> bool {
    match RequestKey::from_params(params) {
      Ok(key) => self.cache.invalidate(&key),
      Err(_) => false,
    }
  }

  pub fn clear_cache(&self) {
    self.cache.clear();
  }

  pub fn get_cache_stats(&self) -> CacheStats {
    self.cache.stats()
  }

  /// Cancel the in-flight fetch for `params`. Callers waiting on it observe
  /// [`SyncError::Cancelled`] and nothing is cached.
  pub fn cancel(&self, params: &ScheduleParams) -> bool {
    match RequestKey::from_params(params) {
      Ok(key) => self.coordinator.cancel(&key.description()),
      Err(_) => false,
    }
  }

  pub fn is_pending(&self, params: &ScheduleParams) -> bool {
    RequestKey::from_params(params).is_ok_and(|key| self.coordinator.is_pending(&key.description()))
  }

  pub fn pending_requests(&self) -> Vec<PendingRequest> {
    self.coordinator.pending()
  }

  pub fn stale_after(&self) -> Duration {
    self.stale_after
  }

  /// Stop the cache sweep and cancel every in-flight fetch.
  pub fn shutdown(&self) {
    self.coordinator.cancel_all();
    self.cache.shutdown();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::mock::MockStore;
  use crate::store::{Granularity, PlanStatus};

  fn service(store: &Arc<MockStore>) -> DataSyncService {
    DataSyncService::new(store.clone(), &CacheConfig::default(), &SyncConfig::default())
  }

  fn weekly(client: i64, start: &str) -> ScheduleParams {
    ScheduleParams::new(client, start, Granularity::Weekly)
  }

  fn summary(result: &ScheduleResult) -> Option<&str> {
    result.preview.first().and_then(|r| r.summary.as_deref())
  }

  #[tokio::test]
  async fn test_repeat_fetch_within_ttl_hits_cache() {
    let store = Arc::new(MockStore::new());
    let svc = service(&store);
    let params = weekly(123, "2024-01-01");

    let first = svc.fetch(&params).await.unwrap();
    let second = svc.fetch(&params).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(store.calls(), 1);
    assert_eq!(first.granularity, Granularity::Weekly);
    assert_eq!(first.total_days, 7);
    assert_eq!(first.status, PlanStatus::Draft);
  }

  #[tokio::test]
  async fn test_time_of_day_shares_the_cached_window() {
    let store = Arc::new(MockStore::new());
    let svc = service(&store);

    svc.fetch(&weekly(123, "2024-01-01")).await.unwrap();
    svc.fetch(&weekly(123, "2024-01-01T17:45:00")).await.unwrap();
    assert_eq!(store.calls(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_fetches_share_one_store_call() {
    let store = Arc::new(MockStore::new().with_delay(Duration::from_millis(10)));
    let svc = service(&store);
    let params = weekly(123, "2024-01-01");

    let results = futures::future::join_all((0..8).map(|_| svc.fetch(&params))).await;

    assert_eq!(store.calls(), 1);
    assert!(results.iter().all(|r| r.as_ref().map(summary) == Ok(Some("call 1"))));
  }

  #[tokio::test]
  async fn test_invalid_params_never_reach_store() {
    let store = Arc::new(MockStore::new());
    let svc = service(&store);

    for params in [weekly(0, "2024-01-01"), weekly(5, "yesterday")] {
      assert!(matches!(svc.fetch(&params).await, Err(SyncError::Validation(_))));
    }
    assert_eq!(store.calls(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failures_are_retried() {
    let store = Arc::new(MockStore::new());
    store.fail_next(2, SyncError::Transport("connection reset".into()));
    let svc = service(&store);

    let result = svc.fetch(&weekly(123, "2024-01-01")).await.unwrap();
    assert_eq!(store.calls(), 3);
    assert_eq!(summary(&result), Some("call 3"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_exhausted_retries_are_not_cached() {
    let store = Arc::new(MockStore::new());
    store.fail_next(3, SyncError::Timeout(Duration::from_secs(8)));
    let svc = service(&store);
    let params = weekly(123, "2024-01-01");

    assert!(matches!(svc.fetch(&params).await, Err(SyncError::Timeout(_))));
    assert_eq!(store.calls(), 3);
    assert!(svc.get_cached_data(&params).is_none());

    svc.fetch(&params).await.unwrap();
    assert_eq!(store.calls(), 4);
  }

  #[tokio::test]
  async fn test_not_found_is_not_retried() {
    let store = Arc::new(MockStore::new());
    store.fail_next(1, SyncError::NotFound("client 9".into()));
    let svc = service(&store);

    assert!(matches!(
      svc.fetch(&weekly(9, "2024-01-01")).await,
      Err(SyncError::NotFound(_))
    ));
    assert_eq!(store.calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_entry_is_served_and_refreshed_once() {
    let store = Arc::new(MockStore::new());
    let svc = service(&store);
    let params = weekly(123, "2024-01-01");

    svc.fetch(&params).await.unwrap();
    tokio::time::advance(Duration::from_secs(121)).await;
    assert!(svc.is_data_stale(&params));

    let a = svc.fetch(&params).await.unwrap();
    let b = svc.fetch(&params).await.unwrap();
    assert_eq!(summary(&a), Some("call 1"));
    assert_eq!(summary(&b), Some("call 1"));

    // Let the background refresh run.
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(store.calls(), 2);
    assert!(!svc.is_data_stale(&params));
    assert_eq!(summary(&svc.fetch(&params).await.unwrap()), Some("call 2"));
    assert_eq!(store.calls(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_entry_is_never_served() {
    let store = Arc::new(MockStore::new());
    let svc = service(&store);
    let params = weekly(123, "2024-01-01");

    svc.fetch(&params).await.unwrap();
    tokio::time::advance(Duration::from_secs(301)).await;

    let result = svc.fetch(&params).await.unwrap();
    assert_eq!(summary(&result), Some("call 2"));
    assert_eq!(store.calls(), 2);
  }

  #[tokio::test]
  async fn test_force_refresh_bypasses_cache() {
    let store = Arc::new(MockStore::new());
    let svc = service(&store);
    let params = weekly(123, "2024-01-01");

    svc.fetch(&params).await.unwrap();
    let forced = svc.fetch(&params.clone().forced()).await.unwrap();

    assert_eq!(store.calls(), 2);
    assert_eq!(summary(&forced), Some("call 2"));
    assert_eq!(summary(&svc.get_cached_data(&params).unwrap()), Some("call 2"));
  }

  #[tokio::test]
  async fn test_superseded_fetch_never_overwrites_newer_result() {
    let store = Arc::new(MockStore::new().ignoring_cancellation());
    let release_first = store.hold_next();
    let svc = service(&store);
    let params = weekly(123, "2024-01-01");

    let first = svc.fetch(&params);
    let second = async {
      tokio::task::yield_now().await;
      let result = svc.fetch(&params.clone().forced()).await;
      let _ = release_first.send(());
      result
    };

    let (a, b) = tokio::join!(first, second);
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(summary(&b), Some("call 2"));
    assert_eq!(a, b);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(summary(&svc.get_cached_data(&params).unwrap()), Some("call 2"));
  }

  #[tokio::test]
  async fn test_cancelled_fetch_caches_nothing() {
    let store = Arc::new(MockStore::new());
    let _hold = store.hold_next();
    let svc = service(&store);
    let params = weekly(123, "2024-01-01");

    let fetch = svc.fetch(&params);
    let cancel = async {
      tokio::task::yield_now().await;
      assert!(svc.is_pending(&params));
      assert!(svc.cancel(&params));
    };

    let (result, _) = tokio::join!(fetch, cancel);
    assert_eq!(result, Err(SyncError::Cancelled));
    assert!(svc.get_cached_data(&params).is_none());
    assert!(svc.pending_requests().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_abandoned_fetch_is_cancelled_not_reused() {
    let store = Arc::new(MockStore::new());
    let _hold = store.hold_next();
    let svc = service(&store);
    let params = weekly(123, "2024-01-01");

    assert!(tokio::time::timeout(Duration::from_secs(1), svc.fetch(&params))
      .await
      .is_err());
    assert!(!svc.is_pending(&params));

    tokio::time::advance(Duration::from_secs(40)).await;
    let result = svc.fetch(&params).await.unwrap();
    assert_eq!(store.calls(), 2);
    assert_eq!(summary(&result), Some("call 2"));
    assert_eq!(summary(&svc.get_cached_data(&params).unwrap()), Some("call 2"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_times_out() {
    let store = Arc::new(MockStore::new().with_delay(Duration::from_secs(45)));
    let svc = service(&store);

    let result = svc.fetch(&weekly(123, "2024-01-01")).await;
    assert_eq!(result, Err(SyncError::Timeout(Duration::from_secs(30))));
  }

  #[tokio::test]
  async fn test_monthly_window_covers_28_days() {
    let store = Arc::new(MockStore::new());
    let svc = service(&store);

    let result = svc
      .fetch(&ScheduleParams::new(123, "2024-01-01", Granularity::Monthly))
      .await
      .unwrap();

    let (client, range) = store.requests()[0];
    assert_eq!(client, 123);
    assert_eq!(range.days(), 28);
    assert_eq!(result.date_range, range);
    assert_eq!(result.total_days, 28);
    assert_eq!(result.weekly_breakdown.len(), 4);
  }

  #[tokio::test]
  async fn test_auxiliary_cache_calls() {
    let store = Arc::new(MockStore::new());
    let svc = service(&store);
    let a = weekly(1, "2024-01-01");
    let b = weekly(2, "2024-01-01");

    assert!(svc.get_cached_data(&a).is_none());
    assert!(svc.is_data_stale(&a));

    svc.fetch(&a).await.unwrap();
    svc.fetch(&b).await.unwrap();
    assert!(!svc.is_data_stale(&a));

    let stats = svc.get_cache_stats();
    assert_eq!(stats.size, 2);
    assert_eq!(stats.keys[0], "workout-data-1-2024-01-01-weekly");

    assert!(svc.invalidate_cache(&a));
    assert!(svc.get_cached_data(&a).is_none());
    assert!(svc.get_cached_data(&b).is_some());

    svc.clear_cache();
    assert_eq!(svc.get_cache_stats().size, 0);
    svc.shutdown();
  }
}
