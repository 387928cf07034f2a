//! Optimistic projection of queued writes onto cached collections.
//!
//! Every live `transactions.create` mutation is shown as a synthetic record
//! at the head of the cached transaction lists until it settles. Refetches
//! keep the synthetic records of mutations that are still queued.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::api::types::{
  Account, AccountDetail, Category, CreateTransactionInput, Nature, Tag, Transaction,
};
use crate::api::{self, ApiGateway};
use crate::cache::{CacheKey, CollectionFetcher, DurableCache};
use crate::error::ApiError;
use crate::queue::{PendingMutation, Settlement, SettlementOutcome};

/// A synthetic record standing in for a queued mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticRecord {
  pub mutation_id: u64,
  pub local_id: String,
  pub resource: String,
  pub record: Value,
}

/// Projections shared between the projector and the refetch path.
#[derive(Clone, Default)]
pub struct ProjectionSet {
  records: Arc<Mutex<BTreeMap<u64, OptimisticRecord>>>,
}

impl ProjectionSet {
  pub fn new() -> Self {
    Self::default()
  }

  fn insert(&self, record: OptimisticRecord) {
    self.records.lock().insert(record.mutation_id, record);
  }

  fn remove(&self, mutation_id: u64) -> Option<OptimisticRecord> {
    self.records.lock().remove(&mutation_id)
  }

  pub fn len(&self) -> usize {
    self.records.lock().len()
  }

  /// Whether `id` belongs to a record that only exists locally.
  pub fn is_local(&self, id: &str) -> bool {
    self.records.lock().values().any(|r| r.local_id == id)
  }

  /// Prepend still-pending records of `resource` to a fetched collection,
  /// newest first, skipping ids the collection already holds.
  pub fn overlay(&self, resource: &str, value: Value) -> Value {
    let Value::Array(items) = value else {
      return value;
    };

    let records = self.records.lock();
    let mut merged: Vec<Value> = records
      .values()
      .rev()
      .filter(|r| r.resource == resource)
      .filter(|r| !items.iter().any(|item| item["id"] == r.local_id.as_str()))
      .map(|r| r.record.clone())
      .collect();
    merged.extend(items);
    Value::Array(merged)
  }
}

/// Builds and retires synthetic records in the cache.
#[derive(Clone)]
pub struct OptimisticProjector {
  cache: DurableCache,
  projections: ProjectionSet,
}

impl OptimisticProjector {
  pub fn new(cache: DurableCache, projections: ProjectionSet) -> Self {
    Self { cache, projections }
  }

  /// Cached keys showing records of `resource`, always including its
  /// default list.
  fn target_keys(&self, resource: &str) -> Vec<CacheKey> {
    let mut keys = self.cache.keys_for_resource(resource);
    if resource == api::TRANSACTIONS {
      let default_key = api::transactions_key();
      if !keys.contains(&default_key) {
        keys.push(default_key);
      }
    }
    keys
  }

  /// Insert a synthetic record for `mutation`. Projecting the same mutation
  /// twice leaves a single record.
  pub fn project(&self, mutation: &PendingMutation) {
    if mutation.name != api::CREATE_TRANSACTION {
      debug!(id = mutation.id, name = %mutation.name, "No projection for mutation");
      return;
    }

    let input: CreateTransactionInput = match serde_json::from_value(mutation.payload.clone()) {
      Ok(input) => input,
      Err(e) => {
        warn!(id = mutation.id, error = %e, "Cannot project malformed payload");
        return;
      }
    };

    let transaction = self.provisional_transaction(mutation, &input);
    let record = match serde_json::to_value(&transaction) {
      Ok(record) => record,
      Err(e) => {
        warn!(id = mutation.id, error = %e, "Cannot serialize projection");
        return;
      }
    };

    let local_id = mutation.local_id();
    for key in self.target_keys(api::TRANSACTIONS) {
      let record = record.clone();
      let local_id = local_id.clone();
      self.cache.update(&key, move |value| {
        if let Some(items) = value.as_array_mut() {
          items.retain(|item| item["id"] != local_id.as_str());
          items.insert(0, record);
        }
      });
    }

    self.projections.insert(OptimisticRecord {
      mutation_id: mutation.id,
      local_id,
      resource: api::TRANSACTIONS.to_string(),
      record,
    });
    debug!(id = mutation.id, "Projected mutation");
  }

  /// Retire the projection of a settled mutation and return the keys to
  /// invalidate.
  ///
  /// On success the synthetic record stays until the refetch replaces it; on
  /// permanent failure it is removed right away and nothing is invalidated.
  pub fn reconcile(&self, settlement: &Settlement) -> Vec<CacheKey> {
    let mutation = &settlement.mutation;
    let projection = self.projections.remove(mutation.id);

    match &settlement.outcome {
      SettlementOutcome::Succeeded(_) => match api::mutation_resource(&mutation.name) {
        Some(resource) => self.cache.keys_for_resource(resource),
        None => Vec::new(),
      },
      SettlementOutcome::Failed(_) => {
        if let Some(projection) = projection {
          for key in self.cache.keys_for_resource(&projection.resource) {
            let local_id = projection.local_id.clone();
            self.cache.update(&key, move |value| {
              if let Some(items) = value.as_array_mut() {
                items.retain(|item| item["id"] != local_id.as_str());
              }
            });
          }
          debug!(id = mutation.id, "Rolled back projection");
        }
        Vec::new()
      }
    }
  }

  fn provisional_transaction(
    &self,
    mutation: &PendingMutation,
    input: &CreateTransactionInput,
  ) -> Transaction {
    let accounts: Vec<AccountDetail> = self.cache.get_as(&api::accounts_key()).unwrap_or_default();
    let categories: Vec<Category> = self
      .cache
      .get_as(&api::expense_categories_key())
      .unwrap_or_default();
    let tags: Vec<Tag> = self.cache.get_as(&api::tags_key()).unwrap_or_default();

    let account = accounts.iter().find(|a| a.id == input.account_id);
    let category = input.category_id.as_ref().map(|id| {
      categories
        .iter()
        .find(|c| &c.id == id)
        .cloned()
        .unwrap_or_else(|| Category {
          id: id.clone(),
          ..Category::default()
        })
    });
    let tags = input
      .tag_ids
      .iter()
      .map(|id| {
        tags
          .iter()
          .find(|t| &t.id == id)
          .cloned()
          .unwrap_or_else(|| Tag {
            id: id.clone(),
            ..Tag::default()
          })
      })
      .collect();

    let currency = input
      .currency
      .clone()
      .or_else(|| account.map(|a| a.currency.clone()))
      .unwrap_or_default();
    let created_at = mutation.created_at.to_rfc3339();

    Transaction {
      id: mutation.local_id(),
      date: input.date.clone(),
      amount: format!("{:.2}", input.amount),
      currency,
      name: input.name.clone(),
      notes: input.notes.clone(),
      classification: input.nature.unwrap_or(Nature::Expense).as_str().to_string(),
      account: Account {
        id: input.account_id.clone(),
        name: account.map(|a| a.name.clone()).unwrap_or_default(),
        account_type: account.map(|a| a.account_type.clone()).unwrap_or_default(),
      },
      category,
      merchant: None,
      tags,
      transfer: None,
      created_at: created_at.clone(),
      updated_at: created_at,
    }
  }
}

/// Cache fetcher that keeps still-pending synthetic records in refetched
/// collections.
pub struct ProjectingFetcher {
  gateway: Arc<dyn ApiGateway>,
  projections: ProjectionSet,
}

impl ProjectingFetcher {
  pub fn new(gateway: Arc<dyn ApiGateway>, projections: ProjectionSet) -> Self {
    Self {
      gateway,
      projections,
    }
  }
}

impl CollectionFetcher for ProjectingFetcher {
  fn fetch(&self, key: &CacheKey) -> BoxFuture<'static, Result<Value, ApiError>> {
    let fetch = self.gateway.fetch_resource(key);
    let projections = self.projections.clone();
    let resource = key.resource().to_string();
    Box::pin(async move {
      let items = fetch.await?;
      Ok(projections.overlay(&resource, Value::Array(items)))
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheConfig, MemoryStore, StubFetcher};
  use crate::queue::MutationStatus;
  use crate::scheduler::Scheduler;
  use crate::testing::{client_error, FakeGateway};
  use chrono::Utc;
  use serde_json::json;
  use std::time::Duration;

  fn projector() -> (OptimisticProjector, DurableCache, ProjectionSet) {
    let cache = DurableCache::new(
      Arc::new(MemoryStore::new()),
      Arc::new(StubFetcher::new(json!([]))),
      Scheduler::new(),
      CacheConfig::default(),
    );
    let projections = ProjectionSet::new();
    let projector = OptimisticProjector::new(cache.clone(), projections.clone());
    (projector, cache, projections)
  }

  fn mutation(id: u64, payload: Value) -> PendingMutation {
    PendingMutation {
      id,
      scope: "acc-1".into(),
      name: api::CREATE_TRANSACTION.into(),
      payload,
      created_at: Utc::now(),
      attempt_count: 0,
      status: MutationStatus::Pending,
      last_error: None,
    }
  }

  fn coffee() -> Value {
    json!({
      "account_id": "acc-1",
      "date": "2026-10-17",
      "amount": 4.5,
      "name": "Coffee",
      "nature": "expense",
      "category_id": "cat-1",
      "tag_ids": ["tag-1", "tag-unknown"]
    })
  }

  fn ids(cache: &DurableCache) -> Vec<String> {
    cache
      .get(&api::transactions_key())
      .map(|entry| entry.value)
      .and_then(|value| value.as_array().cloned())
      .unwrap_or_default()
      .iter()
      .filter_map(|item| item["id"].as_str().map(String::from))
      .collect()
  }

  #[tokio::test]
  async fn test_projection_resolves_cached_references() {
    let (projector, cache, _) = projector();
    cache.set(
      &api::accounts_key(),
      json!([{"id": "acc-1", "name": "Checking", "currency": "ILS", "account_type": "depository"}]),
    );
    cache.set(
      &api::expense_categories_key(),
      json!([{"id": "cat-1", "name": "Food"}]),
    );
    cache.set(&api::tags_key(), json!([{"id": "tag-1", "name": "work"}]));
    cache.set(&api::transactions_key(), json!([{"id": "srv-1"}]));

    projector.project(&mutation(7, coffee()));

    let list = cache.get(&api::transactions_key()).unwrap().value;
    let record: Transaction = serde_json::from_value(list[0].clone()).unwrap();
    assert_eq!(record.id, "local-7");
    assert_eq!(record.amount, "4.50");
    assert_eq!(record.currency, "ILS");
    assert_eq!(record.classification, "expense");
    assert_eq!(record.account.name, "Checking");
    assert_eq!(record.category.unwrap().name, "Food");
    assert_eq!(record.tags[0].name, "work");
    assert_eq!(record.tags[1].name, "");
    assert_eq!(list[1]["id"], "srv-1");
  }

  #[tokio::test]
  async fn test_unknown_references_become_empty_strings() {
    let (projector, cache, _) = projector();
    projector.project(&mutation(1, coffee()));

    let list = cache.get(&api::transactions_key()).unwrap().value;
    let record: Transaction = serde_json::from_value(list[0].clone()).unwrap();
    assert_eq!(record.account.name, "");
    assert_eq!(record.currency, "");
    assert_eq!(record.category.unwrap().id, "cat-1");
  }

  #[tokio::test]
  async fn test_project_is_idempotent() {
    let (projector, cache, projections) = projector();
    let queued = mutation(3, coffee());
    projector.project(&queued);
    projector.project(&queued);

    assert_eq!(ids(&cache), vec!["local-3"]);
    assert_eq!(projections.len(), 1);
  }

  #[tokio::test]
  async fn test_failure_removes_synthetic_record() {
    let (projector, cache, projections) = projector();
    cache.set(&api::transactions_key(), json!([{"id": "srv-1"}]));
    let queued = mutation(2, coffee());
    projector.project(&queued);

    let keys = projector.reconcile(&Settlement {
      mutation: queued,
      outcome: SettlementOutcome::Failed(client_error(422, "Invalid")),
    });

    assert!(keys.is_empty());
    assert_eq!(projections.len(), 0);
    assert_eq!(ids(&cache), vec!["srv-1"]);
  }

  #[tokio::test]
  async fn test_success_returns_keys_and_keeps_record_until_refetch() {
    let (projector, cache, projections) = projector();
    cache.set(&api::transactions_key(), json!([]));
    let queued = mutation(4, coffee());
    projector.project(&queued);

    let keys = projector.reconcile(&Settlement {
      mutation: queued,
      outcome: SettlementOutcome::Succeeded(json!({"id": "srv-9"})),
    });

    assert_eq!(keys, vec![api::transactions_key()]);
    assert_eq!(projections.len(), 0);
    assert_eq!(ids(&cache), vec!["local-4"]);
  }

  #[tokio::test]
  async fn test_non_projectable_mutations_are_ignored() {
    let (projector, cache, projections) = projector();
    let mut other = mutation(5, json!({"anything": true}));
    other.name = "accounts.update".into();
    projector.project(&other);

    let malformed = mutation(6, json!({"amount": "not a number"}));
    projector.project(&malformed);

    assert_eq!(projections.len(), 0);
    assert!(cache.get(&api::transactions_key()).is_none());
  }

  #[tokio::test]
  async fn test_refetch_keeps_pending_records() {
    let gateway = Arc::new(FakeGateway::new());
    gateway.set_collection(api::TRANSACTIONS, json!([{"id": "srv-1"}]));
    let projections = ProjectionSet::new();
    let cache = DurableCache::new(
      Arc::new(MemoryStore::new()),
      Arc::new(ProjectingFetcher::new(gateway, projections.clone())),
      Scheduler::new(),
      CacheConfig::default(),
    );
    let projector = OptimisticProjector::new(cache.clone(), projections.clone());

    cache.set(&api::transactions_key(), json!([]));
    projector.project(&mutation(8, coffee()));
    cache.invalidate(&api::transactions_key());
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(ids(&cache), vec!["local-8", "srv-1"]);
    assert!(projections.is_local("local-8"));
  }

  #[test]
  fn test_overlay_skips_ids_already_present() {
    let projections = ProjectionSet::new();
    projections.insert(OptimisticRecord {
      mutation_id: 1,
      local_id: "local-1".into(),
      resource: api::TRANSACTIONS.into(),
      record: json!({"id": "local-1"}),
    });
    projections.insert(OptimisticRecord {
      mutation_id: 2,
      local_id: "local-2".into(),
      resource: api::TRANSACTIONS.into(),
      record: json!({"id": "local-2"}),
    });

    let merged = projections.overlay(api::TRANSACTIONS, json!([{"id": "local-1"}, {"id": "a"}]));
    assert_eq!(merged, json!([{"id": "local-2"}, {"id": "local-1"}, {"id": "a"}]));

    let untouched = projections.overlay(api::TAGS, json!([{"id": "t"}]));
    assert_eq!(untouched, json!([{"id": "t"}]));
  }
}
