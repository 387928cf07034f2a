//! Durable read cache with throttled write-through and stale-while-revalidate.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::key::CacheKey;
use super::storage::DurableStore;
use crate::error::ApiError;
use crate::scheduler::Scheduler;

/// Storage key prefix owned by the cache.
const CACHE_PREFIX: &str = "cache:";

/// Loads the authoritative value for a key.
pub trait CollectionFetcher: Send + Sync {
  fn fetch(&self, key: &CacheKey) -> BoxFuture<'static, Result<Value, ApiError>>;
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// Window within which repeated sets are coalesced into one durable write
  pub persist_throttle: Duration,
  /// Age after which a read reports the entry as stale
  pub default_stale_time: Duration,
  /// Per-resource overrides of `default_stale_time`
  pub stale_times: HashMap<String, Duration>,
  /// Upper bound for a single refetch
  pub fetch_timeout: Duration,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let mut stale_times = HashMap::new();
    stale_times.insert(crate::api::TRANSACTIONS.to_string(), Duration::from_secs(60));
    Self {
      persist_throttle: Duration::from_secs(1),
      default_stale_time: Duration::from_secs(5 * 60),
      stale_times,
      fetch_timeout: Duration::from_secs(15),
    }
  }
}

impl CacheConfig {
  fn stale_time(&self, key: &CacheKey) -> Duration {
    self
      .stale_times
      .get(key.resource())
      .copied()
      .unwrap_or(self.default_stale_time)
  }
}

/// A cached value with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T = Value> {
  pub value: T,
  /// When the value was last fetched from the backend. `None` for values
  /// that only exist locally so far.
  pub fetched_at: Option<DateTime<Utc>>,
  pub is_stale: bool,
  pub epoch: u64,
}

/// On-disk form of a cache entry.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
  key: CacheKey,
  value: Value,
  fetched_at: Option<DateTime<Utc>>,
}

struct Slot {
  entry: Option<CacheEntry>,
  /// Bumped by every invalidation; fetch results for older epochs are dropped
  epoch: u64,
  fetching: bool,
}

impl Slot {
  fn empty() -> Self {
    Self {
      entry: None,
      epoch: 0,
      fetching: false,
    }
  }
}

#[derive(Default)]
struct CacheState {
  slots: HashMap<CacheKey, Slot>,
  dirty: HashSet<CacheKey>,
  flush_scheduled: bool,
}

struct Inner {
  store: Arc<dyn DurableStore>,
  fetcher: Arc<dyn CollectionFetcher>,
  scheduler: Scheduler,
  config: CacheConfig,
  state: Mutex<CacheState>,
}

/// Read-model cache surviving restarts.
///
/// In-memory state is always current; durable writes trail it by at most
/// the throttle window. Entries are only ever replaced or invalidated,
/// never evicted.
#[derive(Clone)]
pub struct DurableCache {
  inner: Arc<Inner>,
}

impl DurableCache {
  pub fn new(
    store: Arc<dyn DurableStore>,
    fetcher: Arc<dyn CollectionFetcher>,
    scheduler: Scheduler,
    config: CacheConfig,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        fetcher,
        scheduler,
        config,
        state: Mutex::new(CacheState::default()),
      }),
    }
  }

  /// Current entry for `key`, with staleness computed from the flag and the
  /// entry's age.
  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    let state = self.inner.state.lock();
    let entry = state.slots.get(key)?.entry.as_ref()?;
    let mut entry = entry.clone();
    entry.is_stale = entry.is_stale || self.is_expired(key, entry.fetched_at);
    Some(entry)
  }

  /// Typed view of an entry's value. Returns `None` when missing or when the
  /// value does not match `T`.
  pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
    let entry = self.get(key)?;
    serde_json::from_value(entry.value).ok()
  }

  fn is_expired(&self, key: &CacheKey, fetched_at: Option<DateTime<Utc>>) -> bool {
    let stale_time = self.inner.config.stale_time(key);
    match fetched_at {
      Some(at) => (Utc::now() - at).to_std().map_or(false, |age| age > stale_time),
      None => true,
    }
  }

  /// Store a freshly obtained value. Visible to readers immediately,
  /// persisted within the throttle window.
  pub fn set(&self, key: &CacheKey, value: Value) {
    let mut state = self.inner.state.lock();
    let slot = state.slots.entry(key.clone()).or_insert_with(Slot::empty);
    slot.entry = Some(CacheEntry {
      value,
      fetched_at: Some(Utc::now()),
      is_stale: false,
      epoch: slot.epoch,
    });
    self.mark_dirty(&mut state, key);
  }

  /// Modify a value in place, keeping its fetch metadata. A missing entry
  /// starts as an empty list that has never been fetched.
  pub fn update<F>(&self, key: &CacheKey, f: F)
  where
    F: FnOnce(&mut Value),
  {
    let mut state = self.inner.state.lock();
    let slot = state.slots.entry(key.clone()).or_insert_with(Slot::empty);
    let epoch = slot.epoch;
    let entry = slot.entry.get_or_insert_with(|| CacheEntry {
      value: Value::Array(Vec::new()),
      fetched_at: None,
      is_stale: true,
      epoch,
    });
    f(&mut entry.value);
    self.mark_dirty(&mut state, key);
  }

  /// Mark `key` stale and refetch it in the background. The stale value
  /// stays readable until the fetch lands.
  pub fn invalidate(&self, key: &CacheKey) {
    let epoch = {
      let mut state = self.inner.state.lock();
      let Some(slot) = state.slots.get_mut(key) else {
        debug!(key = %key, "Invalidate on uncached key ignored");
        return;
      };
      slot.epoch += 1;
      slot.fetching = true;
      if let Some(entry) = slot.entry.as_mut() {
        entry.is_stale = true;
        entry.epoch = slot.epoch;
      }
      slot.epoch
    };

    debug!(key = %key, epoch, "Invalidated");
    self.spawn_fetch(key.clone(), epoch);
  }

  /// Fetch `key` unless a fetch is already running for it.
  pub fn revalidate(&self, key: &CacheKey) {
    let epoch = {
      let mut state = self.inner.state.lock();
      let slot = state.slots.entry(key.clone()).or_insert_with(Slot::empty);
      if slot.fetching {
        return;
      }
      slot.fetching = true;
      slot.epoch
    };

    self.spawn_fetch(key.clone(), epoch);
  }

  pub fn is_fetching(&self, key: &CacheKey) -> bool {
    self
      .inner
      .state
      .lock()
      .slots
      .get(key)
      .map_or(false, |slot| slot.fetching)
  }

  fn spawn_fetch(&self, key: CacheKey, epoch: u64) {
    let cache = self.clone();
    let fetch = self.inner.fetcher.fetch(&key);
    let timeout = self.inner.config.fetch_timeout;
    self.inner.scheduler.spawn(async move {
      let result = tokio::time::timeout(timeout, fetch)
        .await
        .unwrap_or(Err(ApiError::Timeout));
      cache.complete_fetch(&key, epoch, result);
    });
  }

  fn complete_fetch(&self, key: &CacheKey, epoch: u64, result: Result<Value, ApiError>) {
    let mut state = self.inner.state.lock();
    let Some(slot) = state.slots.get_mut(key) else {
      return;
    };
    if slot.epoch != epoch {
      debug!(key = %key, epoch, current = slot.epoch, "Discarding superseded fetch");
      return;
    }
    slot.fetching = false;

    match result {
      Ok(value) => {
        slot.entry = Some(CacheEntry {
          value,
          fetched_at: Some(Utc::now()),
          is_stale: false,
          epoch,
        });
        self.mark_dirty(&mut state, key);
      }
      Err(e) => {
        warn!(key = %key, error = %e, "Refetch failed, keeping stale value");
      }
    }
  }

  fn mark_dirty(&self, state: &mut CacheState, key: &CacheKey) {
    state.dirty.insert(key.clone());
    if state.flush_scheduled {
      return;
    }
    state.flush_scheduled = true;

    let cache = self.clone();
    self
      .inner
      .scheduler
      .defer(self.inner.config.persist_throttle, async move {
        cache.flush();
      });
  }

  /// Write every dirty entry to the store now.
  pub fn flush(&self) {
    let pending: Vec<PersistedEntry> = {
      let mut state = self.inner.state.lock();
      state.flush_scheduled = false;
      let dirty: Vec<CacheKey> = state.dirty.drain().collect();
      dirty
        .into_iter()
        .filter_map(|key| {
          let entry = state.slots.get(&key)?.entry.as_ref()?;
          Some(PersistedEntry {
            value: entry.value.clone(),
            fetched_at: entry.fetched_at,
            key,
          })
        })
        .collect()
    };

    for persisted in pending {
      let storage_key = storage_key(&persisted.key);
      let written = serde_json::to_vec(&persisted)
        .map_err(crate::error::StoreError::from)
        .and_then(|bytes| self.inner.store.set(&storage_key, &bytes));
      if let Err(e) = written {
        warn!(key = %persisted.key, error = %e, "Failed to persist cache entry");
      }
    }
  }

  /// Load persisted entries into memory. Keys already in memory are left
  /// alone, so calling this repeatedly is harmless. Corrupt entries are
  /// deleted; storage errors are logged and yield an empty cache.
  pub fn restore(&self) -> usize {
    let rows = match self.inner.store.scan_prefix(CACHE_PREFIX) {
      Ok(rows) => rows,
      Err(e) => {
        warn!(error = %e, "Cache restore failed, starting empty");
        return 0;
      }
    };

    let mut restored = 0;
    let mut state = self.inner.state.lock();
    for (storage_key, bytes) in rows {
      let persisted: PersistedEntry = match serde_json::from_slice(&bytes) {
        Ok(p) => p,
        Err(e) => {
          warn!(storage_key, error = %e, "Discarding corrupt cache entry");
          if let Err(e) = self.inner.store.delete(&storage_key) {
            warn!(storage_key, error = %e, "Failed to delete corrupt cache entry");
          }
          continue;
        }
      };

      let slot = state
        .slots
        .entry(persisted.key)
        .or_insert_with(Slot::empty);
      if slot.entry.is_none() {
        slot.entry = Some(CacheEntry {
          value: persisted.value,
          fetched_at: persisted.fetched_at,
          is_stale: false,
          epoch: slot.epoch,
        });
        restored += 1;
      }
    }

    info!(restored, "Cache restored");
    restored
  }

  /// Keys holding a value.
  pub fn keys(&self) -> Vec<CacheKey> {
    let state = self.inner.state.lock();
    let mut keys: Vec<CacheKey> = state
      .slots
      .iter()
      .filter(|(_, slot)| slot.entry.is_some())
      .map(|(key, _)| key.clone())
      .collect();
    keys.sort();
    keys
  }

  /// Cached keys belonging to `resource`, whatever their parameters.
  pub fn keys_for_resource(&self, resource: &str) -> Vec<CacheKey> {
    self
      .keys()
      .into_iter()
      .filter(|key| key.resource() == resource)
      .collect()
  }

  /// Cached keys a read would currently report as stale.
  pub fn stale_keys(&self) -> Vec<CacheKey> {
    self
      .keys()
      .into_iter()
      .filter(|key| self.get(key).map_or(false, |entry| entry.is_stale))
      .collect()
  }
}

fn storage_key(key: &CacheKey) -> String {
  format!("{}{}", CACHE_PREFIX, key.cache_hash())
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::cache::MemoryStore;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  /// Fetcher returning queued responses, then a fixed fallback.
  pub(crate) struct StubFetcher {
    pub calls: AtomicUsize,
    pub responses: Mutex<Vec<Result<Value, ApiError>>>,
    pub fallback: Mutex<Value>,
    pub delay: Duration,
  }

  impl StubFetcher {
    pub(crate) fn new(fallback: Value) -> Self {
      Self {
        calls: AtomicUsize::new(0),
        responses: Mutex::new(Vec::new()),
        fallback: Mutex::new(fallback),
        delay: Duration::ZERO,
      }
    }
  }

  impl CollectionFetcher for StubFetcher {
    fn fetch(&self, _key: &CacheKey) -> BoxFuture<'static, Result<Value, ApiError>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let result = {
        let mut responses = self.responses.lock();
        if responses.is_empty() {
          Ok(self.fallback.lock().clone())
        } else {
          responses.remove(0)
        }
      };
      let delay = self.delay;
      Box::pin(async move {
        tokio::time::sleep(delay).await;
        result
      })
    }
  }

  fn config() -> CacheConfig {
    CacheConfig {
      persist_throttle: Duration::from_millis(20),
      ..CacheConfig::default()
    }
  }

  fn cache_with(store: Arc<MemoryStore>, fetcher: Arc<StubFetcher>) -> DurableCache {
    DurableCache::new(store, fetcher, Scheduler::new(), config())
  }

  fn key() -> CacheKey {
    CacheKey::new("transactions").with_param("per_page", "100")
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(60)).await;
  }

  #[tokio::test]
  async fn test_set_is_visible_immediately() {
    let cache = cache_with(Arc::new(MemoryStore::new()), Arc::new(StubFetcher::new(json!([]))));
    cache.set(&key(), json!([{"id": "t1"}]));

    let entry = cache.get(&key()).unwrap();
    assert_eq!(entry.value, json!([{"id": "t1"}]));
    assert!(!entry.is_stale);
    assert!(entry.fetched_at.is_some());
  }

  #[tokio::test]
  async fn test_sets_within_window_are_coalesced() {
    let store = Arc::new(MemoryStore::new());
    let cache = cache_with(store.clone(), Arc::new(StubFetcher::new(json!([]))));

    cache.set(&key(), json!([1]));
    cache.set(&key(), json!([1, 2]));
    cache.set(&key(), json!([1, 2, 3]));
    assert_eq!(store.write_count(), 0);

    settle().await;
    assert_eq!(store.write_count(), 1);

    let bytes = store.get(&storage_key(&key())).unwrap().unwrap();
    let persisted: PersistedEntry = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(persisted.value, json!([1, 2, 3]));
  }

  #[tokio::test]
  async fn test_set_survives_restart() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(StubFetcher::new(json!([])));

    let cache = cache_with(store.clone(), fetcher.clone());
    cache.set(&key(), json!([{"id": "t1"}]));
    settle().await;
    drop(cache);

    let restarted = cache_with(store, fetcher);
    assert_eq!(restarted.restore(), 1);
    assert_eq!(restarted.get(&key()).unwrap().value, json!([{"id": "t1"}]));
  }

  #[tokio::test]
  async fn test_restore_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(StubFetcher::new(json!([])));
    let cache = cache_with(store.clone(), fetcher.clone());
    cache.set(&key(), json!(["a"]));
    cache.set(&CacheKey::new("tags"), json!(["b"]));
    cache.flush();

    let restarted = cache_with(store, fetcher);
    restarted.restore();
    let first: Vec<_> = restarted.keys().into_iter().map(|k| restarted.get(&k)).collect();
    assert_eq!(restarted.restore(), 0);
    let second: Vec<_> = restarted.keys().into_iter().map(|k| restarted.get(&k)).collect();

    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
  }

  #[tokio::test]
  async fn test_restore_discards_corrupt_entries() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(StubFetcher::new(json!([])));
    let cache = cache_with(store.clone(), fetcher.clone());
    cache.set(&key(), json!(["ok"]));
    cache.flush();
    store.set("cache:garbage", b"{not json").unwrap();

    let restarted = cache_with(store.clone(), fetcher);
    assert_eq!(restarted.restore(), 1);
    assert!(!store.contains("cache:garbage"));
    assert_eq!(restarted.get(&key()).unwrap().value, json!(["ok"]));
  }

  #[tokio::test]
  async fn test_invalidate_keeps_stale_value_until_refetch() {
    let fetcher = Arc::new(StubFetcher {
      delay: Duration::from_millis(20),
      ..StubFetcher::new(json!(["fresh"]))
    });
    let cache = cache_with(Arc::new(MemoryStore::new()), fetcher);
    cache.set(&key(), json!(["old"]));

    cache.invalidate(&key());
    let interim = cache.get(&key()).unwrap();
    assert!(interim.is_stale);
    assert_eq!(interim.value, json!(["old"]));
    assert_eq!(interim.epoch, 1);

    settle().await;
    let refreshed = cache.get(&key()).unwrap();
    assert!(!refreshed.is_stale);
    assert_eq!(refreshed.value, json!(["fresh"]));
  }

  #[tokio::test]
  async fn test_superseded_fetch_is_discarded() {
    let fetcher = Arc::new(StubFetcher {
      delay: Duration::from_millis(10),
      ..StubFetcher::new(json!(["second"]))
    });
    fetcher.responses.lock().push(Ok(json!(["first"])));
    let cache = cache_with(Arc::new(MemoryStore::new()), fetcher.clone());
    cache.set(&key(), json!([]));

    cache.invalidate(&key());
    cache.invalidate(&key());
    settle().await;

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    let entry = cache.get(&key()).unwrap();
    assert_eq!(entry.value, json!(["second"]));
    assert_eq!(entry.epoch, 2);
  }

  #[tokio::test]
  async fn test_failed_refetch_keeps_stale_value() {
    let fetcher = Arc::new(StubFetcher::new(json!([])));
    fetcher
      .responses
      .lock()
      .push(Err(ApiError::Network("offline".into())));
    let cache = cache_with(Arc::new(MemoryStore::new()), fetcher);
    cache.set(&key(), json!(["cached"]));

    cache.invalidate(&key());
    settle().await;

    let entry = cache.get(&key()).unwrap();
    assert!(entry.is_stale);
    assert_eq!(entry.value, json!(["cached"]));
    assert!(!cache.is_fetching(&key()));
  }

  #[tokio::test]
  async fn test_revalidate_does_not_stack_fetches() {
    let fetcher = Arc::new(StubFetcher {
      delay: Duration::from_millis(20),
      ..StubFetcher::new(json!(["x"]))
    });
    let cache = cache_with(Arc::new(MemoryStore::new()), fetcher.clone());

    cache.revalidate(&key());
    cache.revalidate(&key());
    settle().await;

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get(&key()).unwrap().value, json!(["x"]));
  }

  struct HangingFetcher;

  impl CollectionFetcher for HangingFetcher {
    fn fetch(&self, _key: &CacheKey) -> BoxFuture<'static, Result<Value, ApiError>> {
      Box::pin(futures::future::pending())
    }
  }

  #[tokio::test]
  async fn test_hung_fetch_times_out_and_allows_revalidation() {
    let config = CacheConfig {
      fetch_timeout: Duration::from_millis(20),
      ..config()
    };
    let cache = DurableCache::new(
      Arc::new(MemoryStore::new()),
      Arc::new(HangingFetcher),
      Scheduler::new(),
      config,
    );
    cache.set(&key(), json!(["cached"]));

    cache.invalidate(&key());
    assert!(cache.is_fetching(&key()));
    settle().await;

    assert!(!cache.is_fetching(&key()));
    let entry = cache.get(&key()).unwrap();
    assert!(entry.is_stale);
    assert_eq!(entry.value, json!(["cached"]));

    cache.revalidate(&key());
    assert!(cache.is_fetching(&key()));
  }

  #[tokio::test]
  async fn test_update_on_missing_key_starts_stale() {
    let cache = cache_with(Arc::new(MemoryStore::new()), Arc::new(StubFetcher::new(json!([]))));
    cache.update(&key(), |value| {
      if let Some(items) = value.as_array_mut() {
        items.push(json!({"id": "local-1"}));
      }
    });

    let entry = cache.get(&key()).unwrap();
    assert!(entry.is_stale);
    assert_eq!(entry.fetched_at, None);
    assert_eq!(entry.value, json!([{"id": "local-1"}]));
  }

  #[tokio::test]
  async fn test_keys_for_resource() {
    let cache = cache_with(Arc::new(MemoryStore::new()), Arc::new(StubFetcher::new(json!([]))));
    cache.set(&key(), json!([]));
    cache.set(&CacheKey::new("transactions").with_param("per_page", "10"), json!([]));
    cache.set(&CacheKey::new("tags"), json!([]));

    assert_eq!(cache.keys_for_resource("transactions").len(), 2);
    assert_eq!(cache.keys_for_resource("accounts").len(), 0);
  }
}
