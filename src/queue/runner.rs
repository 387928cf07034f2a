//! The mutation queue: per-scope FIFO execution with retries.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::mutation::{
  MutationEvent, MutationHandle, MutationSnapshot, MutationStatus, PendingMutation, RetryPolicy,
  Settlement, SettlementListener, SettlementOutcome,
};
use super::persist::MutationStore;
use crate::api::ApiGateway;
use crate::cache::DurableStore;
use crate::config::ConfigSource;
use crate::connectivity::ConnectivityState;
use crate::error::{ApiError, StoreResult};
use crate::scheduler::Scheduler;

struct Entry {
  mutation: PendingMutation,
  tx: watch::Sender<MutationSnapshot>,
  /// Set while waiting out a backoff delay
  backoff: Option<CancellationToken>,
}

impl Entry {
  fn new(mutation: PendingMutation) -> Self {
    let (tx, _rx) = watch::channel(MutationSnapshot::of(&mutation));
    Self {
      mutation,
      tx,
      backoff: None,
    }
  }

  fn handle(&self) -> MutationHandle {
    MutationHandle::new(self.mutation.id, self.tx.subscribe())
  }

  /// Apply `event`, returning whether the transition was valid.
  fn transition(&mut self, event: MutationEvent) -> bool {
    match self.mutation.status.apply(event) {
      Ok(next) => {
        self.mutation.status = next;
        true
      }
      Err(e) => {
        error!(id = self.mutation.id, error = %e, "Rejected mutation transition");
        false
      }
    }
  }

  fn publish(&self) {
    self.tx.send_replace(MutationSnapshot::of(&self.mutation));
  }
}

#[derive(Default)]
struct QueueState {
  entries: BTreeMap<u64, Entry>,
  next_id: u64,
  resumed: bool,
}

struct QueueInner {
  store: MutationStore,
  gateway: Arc<dyn ApiGateway>,
  config_source: Arc<dyn ConfigSource>,
  connectivity: watch::Receiver<ConnectivityState>,
  listener: Arc<dyn SettlementListener>,
  scheduler: Scheduler,
  policy: RetryPolicy,
  state: Mutex<QueueState>,
}

/// Durable write queue.
///
/// Mutations are persisted before `enqueue` returns and stay in storage
/// until they succeed or a permanent failure is dismissed. Within a scope at
/// most one mutation is in flight and execution follows id order.
#[derive(Clone)]
pub struct MutationQueue {
  inner: Arc<QueueInner>,
}

impl MutationQueue {
  pub fn new(
    store: Arc<dyn DurableStore>,
    gateway: Arc<dyn ApiGateway>,
    config_source: Arc<dyn ConfigSource>,
    connectivity: watch::Receiver<ConnectivityState>,
    listener: Arc<dyn SettlementListener>,
    scheduler: Scheduler,
    policy: RetryPolicy,
  ) -> Self {
    let store = MutationStore::new(store);
    let next_id = store.load_seq().unwrap_or_else(|e| {
      warn!(error = %e, "Failed to read mutation sequence");
      0
    });

    Self {
      inner: Arc::new(QueueInner {
        store,
        gateway,
        config_source,
        connectivity,
        listener,
        scheduler,
        policy,
        state: Mutex::new(QueueState {
          next_id,
          ..QueueState::default()
        }),
      }),
    }
  }

  fn is_online(&self) -> bool {
    self.inner.connectivity.borrow().is_online()
  }

  /// Queue a write. The mutation is durable once this returns; it starts
  /// paused when connectivity is currently down.
  pub fn enqueue(
    &self,
    scope: impl Into<String>,
    name: impl Into<String>,
    payload: Value,
  ) -> StoreResult<MutationHandle> {
    let status = if self.is_online() {
      MutationStatus::Pending
    } else {
      MutationStatus::Paused
    };

    let (mutation, handle) = {
      let mut state = self.inner.state.lock();
      let mutation = PendingMutation {
        id: state.next_id + 1,
        scope: scope.into(),
        name: name.into(),
        payload,
        created_at: Utc::now(),
        attempt_count: 0,
        status,
        last_error: None,
      };

      self.inner.store.save_seq(mutation.id)?;
      self.inner.store.save(&mutation)?;
      state.next_id = mutation.id;

      let entry = Entry::new(mutation.clone());
      let handle = entry.handle();
      state.entries.insert(mutation.id, entry);
      (mutation, handle)
    };

    info!(
      id = mutation.id,
      scope = %mutation.scope,
      name = %mutation.name,
      status = mutation.status.label(),
      "Mutation queued"
    );
    self.inner.listener.on_accepted(&mutation);
    self.tick();
    Ok(handle)
  }

  fn is_gated(&self, state: &QueueState) -> bool {
    !state.resumed || !self.is_online() || !self.inner.config_source.is_configured()
  }

  /// Dispatch the oldest pending mutation of every idle scope.
  pub fn tick(&self) {
    let dispatched: Vec<PendingMutation> = {
      let mut state = self.inner.state.lock();
      if self.is_gated(&state) {
        return;
      }

      let mut seen_scopes = HashSet::new();
      let mut heads = Vec::new();
      for (id, entry) in state.entries.iter() {
        if !entry.mutation.status.is_live() {
          continue;
        }
        // Only the oldest live mutation of a scope may run.
        if !seen_scopes.insert(entry.mutation.scope.clone()) {
          continue;
        }
        if entry.mutation.status == MutationStatus::Pending && entry.backoff.is_none() {
          heads.push(*id);
        }
      }

      let mut dispatched = Vec::new();
      for id in heads {
        let Some(entry) = state.entries.get_mut(&id) else {
          continue;
        };
        if !entry.transition(MutationEvent::Dispatch) {
          continue;
        }
        self.persist(&entry.mutation);
        entry.publish();
        dispatched.push(entry.mutation.clone());
      }
      dispatched
    };

    for mutation in dispatched {
      let queue = self.clone();
      self.inner.scheduler.spawn(async move {
        queue.execute(mutation).await;
      });
    }
  }

  /// Submit one mutation to the backend and settle it.
  pub async fn execute(&self, mutation: PendingMutation) {
    debug!(id = mutation.id, attempt = mutation.attempt_count + 1, "Executing mutation");
    let call = self
      .inner
      .gateway
      .submit_mutation(&mutation.name, &mutation.payload);
    let result = match tokio::time::timeout(self.inner.policy.request_timeout, call).await {
      Ok(result) => result,
      Err(_) => Err(ApiError::Timeout),
    };

    match result {
      Ok(entity) => self.succeed(mutation.id, entity),
      Err(e) if e.is_retryable() => self.retry_later(mutation.id, e),
      Err(e) => self.fail(mutation.id, e),
    }
  }

  fn succeed(&self, id: u64, entity: Value) {
    let settled = {
      let mut state = self.inner.state.lock();
      let Some(mut entry) = state.entries.remove(&id) else {
        return;
      };
      entry.transition(MutationEvent::Succeed);
      entry.mutation.last_error = None;
      entry.publish();
      if let Err(e) = self.inner.store.delete(id) {
        warn!(id, error = %e, "Failed to delete settled mutation");
      }
      entry.mutation
    };

    info!(id, scope = %settled.scope, "Mutation succeeded");
    self.inner.listener.on_settled(&Settlement {
      mutation: settled,
      outcome: SettlementOutcome::Succeeded(entity),
    });
    self.tick();
  }

  fn retry_later(&self, id: u64, err: ApiError) {
    let delay = {
      let mut state = self.inner.state.lock();
      let Some(entry) = state.entries.get_mut(&id) else {
        return;
      };
      entry.mutation.attempt_count += 1;
      entry.mutation.last_error = Some(err.to_string());

      if self.inner.policy.is_exhausted(entry.mutation.attempt_count) {
        None
      } else if !self.is_online() {
        entry.transition(MutationEvent::Pause);
        self.persist(&entry.mutation);
        entry.publish();
        info!(id, error = %err, "Mutation paused until connectivity returns");
        return;
      } else {
        entry.transition(MutationEvent::RetryLater);
        let delay = self.inner.policy.backoff(entry.mutation.attempt_count);
        let queue = self.clone();
        entry.backoff = Some(self.inner.scheduler.defer(delay, async move {
          queue.end_backoff(id);
        }));
        self.persist(&entry.mutation);
        entry.publish();
        Some((delay, entry.mutation.attempt_count))
      }
    };

    match delay {
      Some((delay, attempt)) => {
        warn!(id, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Mutation will be retried");
      }
      None => self.fail(id, err),
    }
  }

  fn end_backoff(&self, id: u64) {
    if let Some(entry) = self.inner.state.lock().entries.get_mut(&id) {
      entry.backoff = None;
    }
    self.tick();
  }

  fn fail(&self, id: u64, err: ApiError) {
    let failed = {
      let mut state = self.inner.state.lock();
      let Some(entry) = state.entries.get_mut(&id) else {
        return;
      };
      if !entry.transition(MutationEvent::Fail) {
        return;
      }
      entry.mutation.last_error = Some(err.to_string());
      self.persist(&entry.mutation);
      entry.publish();
      entry.mutation.clone()
    };

    warn!(id, status = ?err.status(), error = %err, "Mutation failed permanently");
    self.inner.listener.on_settled(&Settlement {
      mutation: failed,
      outcome: SettlementOutcome::Failed(err),
    });
    self.tick();
  }

  /// Reload persisted mutations after a restart and open the gate.
  ///
  /// Attempt counters start over; in-flight and paused mutations become
  /// pending again while failed ones stay failed.
  pub fn resume_all(&self) {
    let loaded = match self.inner.store.load_all() {
      Ok(loaded) => loaded,
      Err(e) => {
        warn!(error = %e, "Failed to load queued mutations");
        Vec::new()
      }
    };

    let accepted: Vec<PendingMutation> = {
      let mut state = self.inner.state.lock();
      let mut accepted = Vec::new();
      for mutation in loaded {
        state.next_id = state.next_id.max(mutation.id);
        if state.entries.contains_key(&mutation.id) {
          continue;
        }

        let mut entry = Entry::new(mutation);
        entry.mutation.attempt_count = 0;
        if entry.mutation.status.is_live() && entry.transition(MutationEvent::Restart) {
          self.persist(&entry.mutation);
          entry.publish();
          accepted.push(entry.mutation.clone());
        }
        state.entries.insert(entry.mutation.id, entry);
      }
      state.resumed = true;
      accepted
    };

    info!(resumed = accepted.len(), "Mutation queue resumed");
    for mutation in &accepted {
      self.inner.listener.on_accepted(mutation);
    }
    self.tick();
  }

  /// Connectivity came back: paused mutations become pending.
  pub fn resume_paused(&self) {
    {
      let mut state = self.inner.state.lock();
      for entry in state.entries.values_mut() {
        if entry.mutation.status == MutationStatus::Paused
          && entry.transition(MutationEvent::Resume)
        {
          self.persist(&entry.mutation);
          entry.publish();
        }
      }
    }
    self.tick();
  }

  /// Acknowledge a permanently failed mutation and drop it.
  pub fn dismiss(&self, id: u64) -> bool {
    let mut state = self.inner.state.lock();
    let is_failed = state
      .entries
      .get(&id)
      .map_or(false, |entry| entry.mutation.status == MutationStatus::Failed);
    if !is_failed {
      return false;
    }

    state.entries.remove(&id);
    if let Err(e) = self.inner.store.delete(id) {
      warn!(id, error = %e, "Failed to delete dismissed mutation");
    }
    info!(id, "Failed mutation dismissed");
    true
  }

  /// Mutations not yet settled.
  pub fn pending_count(&self) -> usize {
    self
      .inner
      .state
      .lock()
      .entries
      .values()
      .filter(|entry| entry.mutation.status.is_live())
      .count()
  }

  /// Live mutations in id order.
  pub fn pending(&self) -> Vec<PendingMutation> {
    self.collect(|status| status.is_live())
  }

  /// Permanently failed mutations awaiting dismissal.
  pub fn failed(&self) -> Vec<PendingMutation> {
    self.collect(|status| status == MutationStatus::Failed)
  }

  fn collect(&self, filter: impl Fn(MutationStatus) -> bool) -> Vec<PendingMutation> {
    self
      .inner
      .state
      .lock()
      .entries
      .values()
      .filter(|entry| filter(entry.mutation.status))
      .map(|entry| entry.mutation.clone())
      .collect()
  }

  pub fn handle(&self, id: u64) -> Option<MutationHandle> {
    self.inner.state.lock().entries.get(&id).map(Entry::handle)
  }

  fn persist(&self, mutation: &PendingMutation) {
    if let Err(e) = self.inner.store.save(mutation) {
      warn!(id = mutation.id, error = %e, "Failed to persist mutation");
    }
  }
}
