//! Cache keys: a resource name plus its query parameters.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Identifies one cached collection, e.g. `transactions?per_page=100`.
///
/// Parameters are kept sorted so logically equal keys compare and hash equal
/// regardless of the order they were added in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
  resource: String,
  #[serde(default)]
  params: BTreeMap<String, String>,
}

impl CacheKey {
  pub fn new(resource: impl Into<String>) -> Self {
    Self {
      resource: resource.into(),
      params: BTreeMap::new(),
    }
  }

  pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.params.insert(name.into(), value.into());
    self
  }

  pub fn resource(&self) -> &str {
    &self.resource
  }

  pub fn params(&self) -> &BTreeMap<String, String> {
    &self.params
  }

  /// Stable, fixed-length identifier used as the durable storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.resource.trim().to_lowercase())?;
    for (i, (name, value)) in self.params.iter().enumerate() {
      let sep = if i == 0 { '?' } else { '&' };
      write!(f, "{}{}={}", sep, name, value)?;
    }
    Ok(())
  }
}
