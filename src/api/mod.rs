//! Backend API: the gateway trait used by the sync engine, its HTTP
//! implementation, and the resource keys the client reads.

mod client;
pub mod types;

pub use client::HttpGateway;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::cache::CacheKey;
use crate::error::ApiError;

/// A fetched list of records, as stored in the cache.
pub type Collection = Vec<Value>;

/// Name of the single write path modeled by the queue.
pub const CREATE_TRANSACTION: &str = "transactions.create";

pub const ACCOUNTS: &str = "accounts";
pub const CATEGORIES: &str = "categories";
pub const TAGS: &str = "tags";
pub const TRANSACTIONS: &str = "transactions";

/// Page size used for every list request.
const PER_PAGE: &str = "100";

/// Authenticated access to the backend.
///
/// Futures are `'static` so callers can hand them to spawned tasks.
pub trait ApiGateway: Send + Sync {
  /// Fetch a collection resource with the given query parameters.
  fn fetch_resource(&self, key: &CacheKey) -> BoxFuture<'static, Result<Collection, ApiError>>;

  /// Run a named write and return the created entity.
  fn submit_mutation(&self, name: &str, payload: &Value)
    -> BoxFuture<'static, Result<Value, ApiError>>;

  /// Cheap authenticated request used for reachability. Any HTTP response
  /// counts as success; only transport failures are errors.
  fn probe(&self) -> BoxFuture<'static, Result<(), ApiError>>;
}

pub fn accounts_key() -> CacheKey {
  CacheKey::new(ACCOUNTS).with_param("per_page", PER_PAGE)
}

pub fn expense_categories_key() -> CacheKey {
  CacheKey::new(CATEGORIES)
    .with_param("per_page", PER_PAGE)
    .with_param("classification", "expense")
}

pub fn tags_key() -> CacheKey {
  CacheKey::new(TAGS)
}

pub fn transactions_key() -> CacheKey {
  CacheKey::new(TRANSACTIONS).with_param("per_page", PER_PAGE)
}

/// Lookups the capture flow resolves names against. Loaded as soon as the
/// backend is reachable.
pub fn reference_keys() -> Vec<CacheKey> {
  vec![accounts_key(), expense_categories_key(), tags_key()]
}

/// Collection resource a mutation writes into.
pub fn mutation_resource(name: &str) -> Option<&'static str> {
  match name {
    CREATE_TRANSACTION => Some(TRANSACTIONS),
    _ => None,
  }
}
