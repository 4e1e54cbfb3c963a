//! Embedded SQLite backend.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use stratum_core::{Result, StratumError};
use tracing::debug;

use crate::store::{StateEntry, StateStore};

/// SQLite implementation of StateStore.
///
/// One row per key; every write is a single-row upsert, which SQLite
/// applies atomically.
#[derive(Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Open the database at `path`, creating it and its schema if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        debug!(path = %path.display(), "Opened sqlite state store");
        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(sql_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(sql_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StratumError::state("sqlite connection lock poisoned"))?;
            f(&guard)
        })
        .await
        .map_err(|e| StratumError::state(format!("sqlite task failed: {e}")))?
    }
}

fn sql_err(err: rusqlite::Error) -> StratumError {
    StratumError::state(format!("sqlite: {err}"))
}

fn row_to_entry(
    key: String,
    value: String,
    version: i64,
    updated_at: String,
) -> Result<StateEntry> {
    let value = serde_json::from_str(&value)
        .map_err(|e| StratumError::state(format!("Corrupted value at {key}: {e}")))?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map_err(|e| StratumError::state(format!("Corrupted timestamp at {key}: {e}")))?
        .with_timezone(&Utc);
    Ok(StateEntry {
        key,
        value,
        version: version as u64,
        updated_at,
    })
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, key: &str) -> Result<Option<StateEntry>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT value, version, updated_at FROM state WHERE key = ?1",
                    params![key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()
                .map_err(sql_err)?;

            row.map(|(value, version, updated_at)| row_to_entry(key, value, version, updated_at))
                .transpose()
        })
        .await
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<StateEntry> {
        let key = key.to_string();
        let text = serde_json::to_string(&value)?;
        self.with_conn(move |conn| {
            let now = Utc::now();
            let version: i64 = conn
                .query_row(
                    "INSERT INTO state (key, value, version, updated_at)
                     VALUES (?1, ?2, 1, ?3)
                     ON CONFLICT (key) DO UPDATE
                     SET value = excluded.value,
                         version = state.version + 1,
                         updated_at = excluded.updated_at
                     RETURNING version",
                    params![key, text, now.to_rfc3339()],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;

            Ok(StateEntry {
                key,
                value,
                version: version as u64,
                updated_at: now,
            })
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM state WHERE key = ?1", params![key])
                .map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT key FROM state
                     WHERE substr(key, 1, length(?1)) = ?1
                     ORDER BY key",
                )
                .map_err(sql_err)?;

            let keys = stmt
                .query_map(params![prefix], |row| row.get::<_, String>(0))
                .map_err(sql_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(sql_err)?;

            Ok(keys)
        })
        .await
    }

    async fn count(&self, prefix: &str) -> Result<usize> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM state WHERE substr(key, 1, length(?1)) = ?1",
                    params![prefix],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;
            Ok(count as usize)
        })
        .await
    }
}
