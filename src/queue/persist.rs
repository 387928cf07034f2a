//! Durable storage of queued mutations and the id sequence.

use std::sync::Arc;
use tracing::warn;

use super::mutation::PendingMutation;
use crate::cache::DurableStore;
use crate::error::StoreResult;

const MUTATION_PREFIX: &str = "mutation:";
const SEQ_KEY: &str = "queue:seq";

pub(crate) struct MutationStore {
  store: Arc<dyn DurableStore>,
}

impl MutationStore {
  pub(crate) fn new(store: Arc<dyn DurableStore>) -> Self {
    Self { store }
  }

  /// Last id handed out, 0 when nothing was ever queued.
  pub(crate) fn load_seq(&self) -> StoreResult<u64> {
    let Some(bytes) = self.store.get(SEQ_KEY)? else {
      return Ok(0);
    };
    Ok(serde_json::from_slice(&bytes)?)
  }

  pub(crate) fn save_seq(&self, seq: u64) -> StoreResult<()> {
    self.store.set(SEQ_KEY, &serde_json::to_vec(&seq)?)
  }

  pub(crate) fn save(&self, mutation: &PendingMutation) -> StoreResult<()> {
    let bytes = serde_json::to_vec(mutation)?;
    self.store.set(&storage_key(mutation.id), &bytes)
  }

  pub(crate) fn delete(&self, id: u64) -> StoreResult<()> {
    self.store.delete(&storage_key(id))
  }

  /// Every persisted mutation in id order. Unreadable rows are deleted.
  pub(crate) fn load_all(&self) -> StoreResult<Vec<PendingMutation>> {
    let rows = self.store.scan_prefix(MUTATION_PREFIX)?;
    let mut mutations = Vec::with_capacity(rows.len());
    for (key, bytes) in rows {
      match serde_json::from_slice::<PendingMutation>(&bytes) {
        Ok(mutation) => mutations.push(mutation),
        Err(e) => {
          warn!(key, error = %e, "Discarding corrupt mutation");
          self.store.delete(&key)?;
        }
      }
    }
    mutations.sort_by_key(|m| m.id);
    Ok(mutations)
  }
}

/// Zero-padded so lexical key order matches id order.
fn storage_key(id: u64) -> String {
  format!("{}{:020}", MUTATION_PREFIX, id)
}
