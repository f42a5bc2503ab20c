//! In-memory TTL store for fetched schedule windows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::key::RequestKey;
use crate::store::Granularity;

/// A cached value and its freshness metadata.
///
/// Handed out as a snapshot; callers never get a reference into the store.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub value: T,
  pub key: RequestKey,
  /// Wall-clock time the value was stored.
  pub fetched_at: DateTime<Utc>,
  pub ttl: Duration,
  stored_at: Instant,
}

impl<T> CacheEntry<T> {
  pub fn age(&self) -> Duration {
    Instant::now().saturating_duration_since(self.stored_at)
  }

  pub fn is_expired(&self) -> bool {
    self.age() > self.ttl
  }

  /// Old enough to warrant a background refresh.
  pub fn is_stale(&self, stale_after: Duration) -> bool {
    self.age() > stale_after
  }

  pub fn granularity(&self) -> Granularity {
    self.key.granularity()
  }
}

/// Observability snapshot. Never used for correctness decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub size: usize,
  pub keys: Vec<String>,
  pub oldest_entry: Option<DateTime<Utc>>,
  pub newest_entry: Option<DateTime<Utc>>,
}

/// Keyed TTL store. Every mutation replaces or removes a whole entry.
pub struct CacheStore<T> {
  entries: RwLock<HashMap<String, CacheEntry<T>>>,
  sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<T> CacheStore<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
      sweeper: Mutex::new(None),
    }
  }

  /// Non-expired entry for `key`. Pure lookup.
  pub fn get(&self, key: &RequestKey) -> Option<CacheEntry<T>> {
    self
      .read()
      .get(&key.cache_hash())
      .filter(|entry| !entry.is_expired())
      .cloned()
  }

  /// Entry for `key` even if expired, as long as it has not been swept yet.
  pub fn peek(&self, key: &RequestKey) -> Option<CacheEntry<T>> {
    self.read().get(&key.cache_hash()).cloned()
  }

  /// Insert or wholesale replace the entry for `key`.
  pub fn set(&self, key: RequestKey, value: T, ttl: Duration) {
    let entry = CacheEntry {
      value,
      key,
      fetched_at: Utc::now(),
      ttl,
      stored_at: Instant::now(),
    };
    debug!(key = %key, ?ttl, "cache set");
    self.write().insert(key.cache_hash(), entry);
  }

  pub fn invalidate(&self, key: &RequestKey) -> bool {
    let removed = self.write().remove(&key.cache_hash()).is_some();
    if removed {
      debug!(key = %key, "cache invalidated");
    }
    removed
  }

  pub fn clear(&self) {
    let mut entries = self.write();
    let count = entries.len();
    entries.clear();
    info!(count, "cache cleared");
  }

  /// Drop every entry older than its TTL. Returns how many were removed.
  pub fn sweep_expired(&self) -> usize {
    let mut entries = self.write();
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired());
    let removed = before - entries.len();
    if removed > 0 {
      info!(removed, remaining = entries.len(), "swept expired cache entries");
    }
    removed
  }

  pub fn len(&self) -> usize {
    self.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.read().is_empty()
  }

  pub fn stats(&self) -> CacheStats {
    let entries = self.read();
    let mut keys: Vec<String> = entries.values().map(|e| e.key.description()).collect();
    keys.sort();

    CacheStats {
      size: entries.len(),
      keys,
      oldest_entry: entries.values().map(|e| e.fetched_at).min(),
      newest_entry: entries.values().map(|e| e.fetched_at).max(),
    }
  }

  /// Start the periodic sweep on the current tokio runtime.
  ///
  /// The task holds only a weak reference and ends once the store is dropped
  /// or [`CacheStore::shutdown`] is called. Starting again replaces the
  /// previous task.
  pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
    let interval = interval.max(Duration::from_millis(1));
    let store = Arc::downgrade(self);

    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately.
      ticker.tick().await;
      loop {
        ticker.tick().await;
        match store.upgrade() {
          Some(store) => {
            store.sweep_expired();
          }
          None => break,
        }
      }
    });

    let previous = self
      .sweeper
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .replace(handle);
    if let Some(previous) = previous {
      previous.abort();
    }
    debug!(?interval, "cache sweeper started");
  }

  /// Stop the periodic sweep. Entries are kept.
  pub fn shutdown(&self) {
    if let Some(handle) = self
      .sweeper
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      handle.abort();
      debug!("cache sweeper stopped");
    }
  }

  fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry<T>>> {
    self.entries.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry<T>>> {
    self.entries.write().unwrap_or_else(PoisonError::into_inner)
  }
}

impl<T> Default for CacheStore<T>
where
  T: Clone + Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Drop for CacheStore<T> {
  fn drop(&mut self) {
    if let Some(handle) = self
      .sweeper
      .get_mut()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    {
      handle.abort();
    }
  }
}
