//! Snapshot storage trait and SQLite implementation.
//!
//! Only authoritative (server-confirmed) snapshots are ever written here.
//! Optimistic values stay in memory.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::CacheKey;

/// A persisted snapshot.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
  /// Serialized JSON of the value
  pub data: Vec<u8>,
  /// When the snapshot was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for snapshot storage backends.
pub trait SnapshotStorage: Send + Sync {
  /// Store the serialized snapshot for a key, replacing any previous one.
  fn store(&self, key: &CacheKey, data: &[u8]) -> Result<()>;

  /// Load the snapshot for a key.
  fn load(&self, key: &CacheKey) -> Result<Option<StoredSnapshot>>;

  /// Remove the snapshot for a key.
  fn remove(&self, key: &CacheKey) -> Result<()>;

  /// Remove every snapshot.
  fn clear(&self) -> Result<()>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopStorage;

impl SnapshotStorage for NoopStorage {
  fn store(&self, _key: &CacheKey, _data: &[u8]) -> Result<()> {
    Ok(()) // Discard
  }

  fn load(&self, _key: &CacheKey) -> Result<Option<StoredSnapshot>> {
    Ok(None) // Always miss
  }

  fn remove(&self, _key: &CacheKey) -> Result<()> {
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based snapshot storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the snapshot database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open (or create) the snapshot database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// In-memory database, gone when dropped.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("vibely").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SNAPSHOT_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshot_cache (
    key_hash TEXT PRIMARY KEY,
    cache_key TEXT NOT NULL,
    resource TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_snapshot_cache_resource
    ON snapshot_cache(resource);
"#;

impl SnapshotStorage for SqliteStorage {
  fn store(&self, key: &CacheKey, data: &[u8]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO snapshot_cache (key_hash, cache_key, resource, data, cached_at)
         VALUES (?, ?, ?, ?, datetime('now'))",
        params![key.storage_hash(), key.to_string(), key.resource(), data],
      )
      .map_err(|e| eyre!("Failed to store snapshot {}: {}", key, e))?;

    Ok(())
  }

  fn load(&self, key: &CacheKey) -> Result<Option<StoredSnapshot>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM snapshot_cache WHERE key_hash = ?",
        params![key.storage_hash()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to load snapshot {}: {}", key, e))?;

    match row {
      Some((data, cached_at)) => Ok(Some(StoredSnapshot {
        data,
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn remove(&self, key: &CacheKey) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM snapshot_cache WHERE key_hash = ?",
        params![key.storage_hash()],
      )
      .map_err(|e| eyre!("Failed to remove snapshot {}: {}", key, e))?;

    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM snapshot_cache", [])
      .map_err(|e| eyre!("Failed to clear snapshots: {}", e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
