//! Durable key-value storage and its SQLite implementation.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use crate::error::{StoreError, StoreResult};

/// Persistent key-value store shared by the cache and the mutation queue.
///
/// Each owner keeps to its own key prefix; nothing else writes here.
pub trait DurableStore: Send + Sync {
  fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

  fn set(&self, key: &str, value: &[u8]) -> StoreResult<()>;

  fn delete(&self, key: &str) -> StoreResult<()>;

  /// All entries whose key starts with `prefix`, ordered by key.
  fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;
}

/// SQLite-based store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> StoreResult<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  pub fn open_at(path: &Path) -> StoreResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> StoreResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(StoreError::NoDataDir)?;

    Ok(data_dir.join("suresnap").join("store.db"))
  }

  fn run_migrations(&self) -> StoreResult<()> {
    self.conn.lock().execute_batch(STORE_SCHEMA)?;
    Ok(())
  }
}

const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl DurableStore for SqliteStore {
  fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
    let conn = self.conn.lock();
    let value = conn
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()?;
    Ok(value)
  }

  fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
    self.conn.lock().execute(
      "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn delete(&self, key: &str) -> StoreResult<()> {
    self
      .conn
      .lock()
      .execute("DELETE FROM kv WHERE key = ?", params![key])?;
    Ok(())
  }

  fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
    let conn = self.conn.lock();
    let mut stmt = conn.prepare(
      "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
    )?;
    let rows = stmt
      .query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<Result<Vec<(String, Vec<u8>)>, _>>()?;
    Ok(rows)
  }
}

/// In-memory store. Counts writes so throttling can be observed.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<std::collections::BTreeMap<String, Vec<u8>>>,
  writes: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of `set` calls so far.
  pub fn write_count(&self) -> usize {
    self.writes.load(std::sync::atomic::Ordering::SeqCst)
  }

  pub fn contains(&self, key: &str) -> bool {
    self.entries.lock().contains_key(key)
  }
}

#[cfg(test)]
impl DurableStore for MemoryStore {
  fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
    Ok(self.entries.lock().get(key).cloned())
  }

  fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
    self.writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    self
      .entries
      .lock()
      .insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn delete(&self, key: &str) -> StoreResult<()> {
    self.entries.lock().remove(key);
    Ok(())
  }

  fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
    Ok(
      self
        .entries
        .lock()
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }
}
