//! Wires the sync engine together and exposes it to the UI.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::types::CreateTransactionInput;
use crate::api::{self, ApiGateway};
use crate::cache::{CacheConfig, CacheEntry, CacheKey, DurableCache, DurableStore};
use crate::config::{ConfigSource, SyncTuning};
use crate::connectivity::{
  ConnectivityMonitor, ConnectivityState, LinkSignal, MonitorConfig, Subscription,
};
use crate::error::StoreResult;
use crate::projector::{OptimisticProjector, ProjectingFetcher, ProjectionSet};
use crate::queue::{
  MutationHandle, MutationQueue, PendingMutation, RetryPolicy, Settlement, SettlementListener,
};
use crate::scheduler::Scheduler;

/// Timings for every engine component.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
  pub monitor: MonitorConfig,
  pub retry: RetryPolicy,
  pub cache: CacheConfig,
}

impl From<&SyncTuning> for SyncOptions {
  fn from(tuning: &SyncTuning) -> Self {
    Self {
      monitor: tuning.monitor_config(),
      retry: tuning.retry_policy(),
      cache: tuning.cache_config(),
    }
  }
}

/// What the status indicators show.
#[derive(Debug, Clone)]
pub struct SyncSummary {
  pub connectivity: ConnectivityState,
  pub pending: usize,
  pub failed: Vec<PendingMutation>,
}

#[derive(Default)]
struct Batch {
  keys: BTreeSet<CacheKey>,
  scheduled: bool,
}

/// Queue listener: projects accepted mutations and batches invalidations
/// of settled ones.
struct SettlementHub {
  projector: OptimisticProjector,
  cache: DurableCache,
  scheduler: Scheduler,
  batch: Mutex<Batch>,
}

impl SettlementHub {
  /// Collect keys for the next batch. Each key is invalidated once per
  /// batch however many settlements named it.
  fn invalidate_batched(self: &Arc<Self>, keys: Vec<CacheKey>) {
    if keys.is_empty() {
      return;
    }

    let mut batch = self.batch.lock();
    batch.keys.extend(keys);
    if batch.scheduled {
      return;
    }
    batch.scheduled = true;

    let hub = self.clone();
    self.scheduler.spawn(async move {
      tokio::task::yield_now().await;
      hub.flush_batch();
    });
  }

  fn flush_batch(&self) {
    let keys = {
      let mut batch = self.batch.lock();
      batch.scheduled = false;
      std::mem::take(&mut batch.keys)
    };

    debug!(keys = keys.len(), "Invalidating settled keys");
    for key in keys {
      self.cache.invalidate(&key);
    }
  }
}

/// Queue-facing side of the hub.
struct HubListener(Arc<SettlementHub>);

impl SettlementListener for HubListener {
  fn on_accepted(&self, mutation: &PendingMutation) {
    self.0.projector.project(mutation);
  }

  fn on_settled(&self, settlement: &Settlement) {
    debug!(
      id = settlement.mutation.id,
      success = settlement.is_success(),
      "Reconciling settled mutation"
    );
    let keys = self.0.projector.reconcile(settlement);
    self.0.invalidate_batched(keys);
  }
}

/// Owner of the sync engine.
///
/// Built once at startup and passed by handle. `shutdown` stops every
/// background task and flushes the cache.
pub struct SyncCoordinator {
  config: Arc<dyn ConfigSource>,
  cache: DurableCache,
  queue: MutationQueue,
  monitor: ConnectivityMonitor,
  projections: ProjectionSet,
  hub: Arc<SettlementHub>,
  scheduler: Scheduler,
}

impl SyncCoordinator {
  pub fn new(
    store: Arc<dyn DurableStore>,
    gateway: Arc<dyn ApiGateway>,
    config: Arc<dyn ConfigSource>,
    link: Arc<dyn LinkSignal>,
    options: SyncOptions,
  ) -> Self {
    let scheduler = Scheduler::new();
    let projections = ProjectionSet::new();

    let fetcher = Arc::new(ProjectingFetcher::new(gateway.clone(), projections.clone()));
    let cache = DurableCache::new(store.clone(), fetcher, scheduler.clone(), options.cache);
    let monitor = ConnectivityMonitor::new(
      gateway.clone(),
      config.clone(),
      link,
      options.monitor,
      scheduler.clone(),
    );

    let hub = Arc::new(SettlementHub {
      projector: OptimisticProjector::new(cache.clone(), projections.clone()),
      cache: cache.clone(),
      scheduler: scheduler.clone(),
      batch: Mutex::new(Batch::default()),
    });
    let queue = MutationQueue::new(
      store,
      gateway,
      config.clone(),
      monitor.watch(),
      Arc::new(HubListener(hub.clone())),
      scheduler.clone(),
      options.retry,
    );

    Self {
      config,
      cache,
      queue,
      monitor,
      projections,
      hub,
      scheduler,
    }
  }

  /// Restore the cache, resume queued mutations, then start monitoring.
  pub fn bootstrap(&self) {
    let restored = self.cache.restore();
    self.queue.resume_all();
    self.monitor.start();
    self.spawn_online_watcher();

    info!(
      restored,
      pending = self.queue.pending_count(),
      failed = self.queue.failed().len(),
      "Sync engine started"
    );
  }

  /// On every transition to online: resume paused work and refresh stale
  /// reads.
  fn spawn_online_watcher(&self) {
    let mut rx = self.monitor.watch();
    let queue = self.queue.clone();
    let cache = self.cache.clone();
    let config = self.config.clone();

    self.scheduler.spawn(async move {
      let mut was_online = rx.borrow_and_update().is_online();
      while rx.changed().await.is_ok() {
        let online = rx.borrow_and_update().is_online();
        if online && !was_online {
          info!("Back online, resuming sync");
          queue.resume_paused();
          if config.is_configured() {
            for key in cache.stale_keys() {
              cache.revalidate(&key);
            }
            for key in api::reference_keys() {
              if cache.get(&key).is_none() {
                cache.revalidate(&key);
              }
            }
          }
        }
        was_online = online;
      }
    });
  }

  /// Invalidate `keys` once each, batched with other settlements.
  pub fn on_settled(&self, keys: Vec<CacheKey>) {
    self.hub.invalidate_batched(keys);
  }

  pub fn subscribe_to_status<F>(&self, callback: F) -> Subscription
  where
    F: Fn(ConnectivityState) + Send + Sync + 'static,
  {
    self.monitor.subscribe(callback)
  }

  pub fn status(&self) -> ConnectivityState {
    self.monitor.status()
  }

  /// Queue a new transaction. The synthetic record is readable as soon as
  /// this returns.
  pub fn submit(&self, scope: &str, input: &CreateTransactionInput) -> StoreResult<MutationHandle> {
    let payload = serde_json::to_value(input)?;
    self.queue.enqueue(scope, api::CREATE_TRANSACTION, payload)
  }

  /// Cached value for `key`. Stale or missing entries are refetched in the
  /// background when the backend is configured and reachable.
  pub fn read(&self, key: &CacheKey) -> Option<CacheEntry> {
    let entry = self.cache.get(key);
    let needs_fetch = entry.as_ref().map_or(true, |entry| entry.is_stale);
    if needs_fetch && self.config.is_configured() && self.monitor.status().is_online() {
      self.cache.revalidate(key);
    }
    entry
  }

  /// Cached value without triggering a refetch.
  pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
    self.cache.get(key)
  }

  /// Typed variant of [`read`](Self::read).
  pub fn read_as<T: serde::de::DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
    let entry = self.read(key)?;
    serde_json::from_value(entry.value).ok()
  }

  pub fn is_fetching(&self, key: &CacheKey) -> bool {
    self.cache.is_fetching(key)
  }

  /// Whether a record id belongs to a not yet confirmed write.
  pub fn is_local(&self, id: &str) -> bool {
    self.projections.is_local(id)
  }

  pub fn sync_summary(&self) -> SyncSummary {
    SyncSummary {
      connectivity: self.monitor.status(),
      pending: self.queue.pending_count(),
      failed: self.queue.failed(),
    }
  }

  /// Handles for every mutation still waiting to settle, restored ones
  /// included.
  pub fn pending_handles(&self) -> Vec<MutationHandle> {
    self
      .queue
      .pending()
      .iter()
      .filter_map(|mutation| self.queue.handle(mutation.id))
      .collect()
  }

  /// Acknowledge a permanently failed mutation.
  pub fn dismiss(&self, id: u64) -> bool {
    self.queue.dismiss(id)
  }

  /// Invalidate every cached key and re-check connectivity.
  pub fn refresh_all(&self) {
    self.monitor.recheck();
    self.queue.tick();
    for key in self.cache.keys() {
      self.cache.invalidate(&key);
    }
  }

  /// Foreground/background transition of the terminal.
  pub fn set_foreground(&self, foreground: bool) {
    self.monitor.set_foreground(foreground);
  }

  pub fn shutdown(&self) {
    if self.scheduler.is_shutdown() {
      return;
    }
    self.monitor.stop();
    self.scheduler.shutdown();
    self.cache.flush();
    info!(
      pending = self.queue.pending_count(),
      projected = self.projections.len(),
      "Sync engine stopped"
    );
  }
}
