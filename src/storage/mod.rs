//! Persistent tier: one SQLite table of `(key, value, timestamp)` rows.
//!
//! Operations run on tokio-rusqlite's background connection thread, so
//! callers never block the async runtime. Maintenance runs inside a single
//! transaction.

pub mod migrations;

use std::path::Path;

use thiserror::Error;
use tokio_rusqlite::rusqlite::{self, OptionalExtension};
use tokio_rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::cache::entry::{CacheEntry, Millis};
use crate::cache::evictor::{Evictor, MaintenanceReport};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to open cache database: {0}")]
    Open(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_rusqlite::Error<StoreError>> for StoreError {
    fn from(err: tokio_rusqlite::Error<StoreError>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            other => StoreError::Connection(other.to_string()),
        }
    }
}

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA temp_store=MEMORY;";

/// Handle to the persistent tier.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone, Debug)]
pub struct PersistentTier {
    conn: Connection,
}

impl PersistentTier {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(path)
            .await
            .map_err(|e| StoreError::Open(format!("{}: {e}", path.display())))?;
        Self::init(conn).await
    }

    /// Open a private in-memory database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Open(format!(":memory:: {e}")))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| -> Result<(), StoreError> {
            conn.execute_batch(PRAGMAS)?;
            Ok(())
        })
        .await
        .map_err(StoreError::from)?;

        migrations::run(&conn).await?;
        Ok(Self { conn })
    }

    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<Option<CacheEntry>, StoreError> {
                let entry = conn
                    .query_row(
                        "SELECT key, value, timestamp FROM cache_entries WHERE key = ?1",
                        params![key],
                        |row| {
                            Ok(CacheEntry {
                                key: row.get(0)?,
                                value: row.get(1)?,
                                stored_at: row.get(2)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(entry)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<bool, StoreError> {
                let found: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM cache_entries WHERE key = ?1)",
                    params![key],
                    |row| row.get(0),
                )?;
                Ok(found)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Insert or replace the row for `key`.
    pub async fn upsert(&self, key: &str, value: Vec<u8>, stored_at: Millis) -> Result<(), StoreError> {
        let key = key.to_string();
        let size = value.len();
        self.conn
            .call(move |conn| -> Result<(), StoreError> {
                conn.execute(
                    "INSERT OR REPLACE INTO cache_entries (key, value, timestamp) VALUES (?1, ?2, ?3)",
                    params![key, value, stored_at],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)?;
        debug!(size, "Wrote persistent entry");
        Ok(())
    }

    /// Refresh the recency timestamp of `key`.
    pub async fn touch(&self, key: &str, now: Millis) -> Result<(), StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<(), StoreError> {
                conn.execute(
                    "UPDATE cache_entries SET timestamp = ?1 WHERE key = ?2",
                    params![now, key],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<bool, StoreError> {
                let n = conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Delete every row whose key starts with `prefix`.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let prefix = prefix.to_string();
        self.conn
            .call(move |conn| -> Result<usize, StoreError> {
                let n = conn.execute(
                    "DELETE FROM cache_entries WHERE substr(key, 1, length(?1)) = ?1",
                    params![prefix],
                )?;
                Ok(n)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn clear(&self) -> Result<usize, StoreError> {
        self.conn
            .call(|conn| -> Result<usize, StoreError> {
                let n = conn.execute("DELETE FROM cache_entries", [])?;
                Ok(n)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        self.conn
            .call(|conn| -> Result<usize, StoreError> {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
                Ok(n as usize)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Drop expired rows, then the oldest rows beyond capacity, atomically.
    pub async fn run_maintenance(&self, evictor: Evictor, now: Millis) -> Result<MaintenanceReport, StoreError> {
        let report = self
            .conn
            .call(move |conn| -> Result<MaintenanceReport, StoreError> {
                let tx = conn.transaction()?;
                let cutoff = evictor.expiry_cutoff(now);

                let mut removed_keys = select_keys(
                    &tx,
                    "SELECT key FROM cache_entries WHERE timestamp < ?1",
                    params![cutoff],
                )?;
                let expired = tx.execute(
                    "DELETE FROM cache_entries WHERE timestamp < ?1",
                    params![cutoff],
                )?;

                let count: i64 = tx.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
                let overflow = evictor.overflow(count as usize);

                let mut trimmed = 0;
                if overflow > 0 {
                    let oldest = select_keys(
                        &tx,
                        "SELECT key FROM cache_entries ORDER BY timestamp ASC, rowid ASC LIMIT ?1",
                        params![overflow as i64],
                    )?;
                    for key in &oldest {
                        trimmed += tx.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
                    }
                    removed_keys.extend(oldest);
                }

                tx.commit()?;

                Ok(MaintenanceReport {
                    expired,
                    trimmed,
                    remaining: (count as usize).saturating_sub(trimmed),
                    removed_keys,
                })
            })
            .await
            .map_err(StoreError::from)?;

        info!(
            expired = report.expired,
            trimmed = report.trimmed,
            remaining = report.remaining,
            "Cache maintenance completed"
        );
        Ok(report)
    }
}

fn select_keys(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let keys = stmt
        .query_map(params, |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(keys)
}
