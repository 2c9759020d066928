use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;
use tokio::task;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend is out of capacity; the caller may evict and retry.
    #[error("storage is full")]
    Full,

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Minimal key-value surface the conversation store is written against:
/// get/set/delete plus prefix enumeration. Injected so tests (and
/// storage-pressure scenarios) can run against an in-memory backend.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Durable backend over a single SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn new() -> Result<Self, StoreError> {
        let path = Self::db_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))
            .map_err(StoreError::from)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to configure database")?;

        let store = SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// In-memory database, used for testing.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory database")
            .map_err(StoreError::from)?;
        let store = SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn db_path() -> PathBuf {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".local/share")
            });
        data_dir.join("banter").join("banter.db")
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .context("Failed to run migrations")?;
        Ok(())
    }

    fn map_sqlite_error(err: rusqlite::Error) -> StoreError {
        if let rusqlite::Error::SqliteFailure(e, _) = &err {
            if e.code == ErrorCode::DiskFull {
                return StoreError::Full;
            }
        }
        StoreError::Backend(err.to_string())
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.clone();
        let key = key.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(Self::map_sqlite_error)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![key, value],
            )
            .map(|_| ())
            .map_err(Self::map_sqlite_error)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let key = key.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map(|_| ())
                .map_err(Self::map_sqlite_error)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.clone();
        // LIKE treats % and _ as wildcards; escape them in the prefix.
        let pattern = format!(
            "{}%",
            prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT key FROM kv WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key")
                .map_err(Self::map_sqlite_error)?;
            let keys = stmt
                .query_map(params![pattern], |row| row.get::<_, String>(0))
                .map_err(Self::map_sqlite_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(Self::map_sqlite_error)?;
            Ok(keys)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }
}

/// Ephemeral backend with an optional byte quota, used in tests and when
/// no durable storage is available. Quota accounting covers keys and
/// values, which is close enough to model storage pressure.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BTreeMap::new())),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn used_bytes(map: &BTreeMap<String, String>) -> usize {
        map.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut map = self.inner.lock().unwrap();
        if let Some(quota) = self.quota_bytes {
            let existing = map.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
            let projected = Self::used_bytes(&map) - existing + key.len() + value.len();
            if projected > quota {
                return Err(StoreError::Full);
            }
        }
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
