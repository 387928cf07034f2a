//! Durable caching layer for the read model.
//!
//! This module provides a resource-agnostic cache that:
//! - Keeps every collection in memory and mirrors it to a [`DurableStore`]
//! - Coalesces writes within a throttle window
//! - Serves stale values while a background refetch runs
//! - Discards fetch results overtaken by a newer invalidation

mod key;
mod layer;
mod storage;

pub use key::CacheKey;
pub use layer::{CacheConfig, CacheEntry, CollectionFetcher, DurableCache};
pub use storage::{DurableStore, SqliteStore};
#[cfg(test)]
pub use storage::MemoryStore;

#[cfg(test)]
pub(crate) use layer::tests::StubFetcher;
