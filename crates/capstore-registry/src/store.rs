//! SQLite Registry Store
//!
//! Two tables, written in one transaction per commit:
//!
//! ```text
//! registry_log                           registry_snapshot (single row)
//! ┌─────────┬───────────────┬──────────┐  ┌────┬─────────┬─────────────────────────┐
//! │ version │ events (JSON) │ committed│  │ id │ version │ body (persisted layout) │
//! └─────────┴───────────────┴──────────┘  └────┴─────────┴─────────────────────────┘
//! ```
//!
//! The log is the source of truth; the snapshot row makes restarts O(1).
//!
//! Commits run under `BEGIN IMMEDIATE`, so the head check and the append happen
//! under one write lock. A second process waits for that lock (up to the SQLite
//! busy timeout) and then sees the moved head as a `MutationConflict`.

use crate::error::{RegistryError, Result};
use crate::types::{LogEntry, RegistryEvent, RegistrySnapshot};
use crate::RegistryStore;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS registry_log (
        version      INTEGER PRIMARY KEY,
        events       TEXT NOT NULL,
        committed_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS registry_snapshot (
        id      INTEGER PRIMARY KEY CHECK (id = 1),
        version INTEGER NOT NULL,
        body    TEXT NOT NULL
    )",
];

/// SQLite-backed registry log.
pub struct SqliteRegistryStore {
    pool: SqlitePool,
}

impl SqliteRegistryStore {
    /// Open (or create) a registry database file.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }
        }

        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create in-memory database (for testing)
    pub async fn new_in_memory() -> Result<Self> {
        // Every connection to :memory: is a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// Head check, log append and snapshot replace. Runs inside the caller's
/// write transaction.
async fn append_entry(
    conn: &mut SqliteConnection,
    entry: &LogEntry,
    snapshot: &RegistrySnapshot,
    events: &str,
    body: &str,
) -> Result<()> {
    let expected = entry.version.saturating_sub(1);

    let head: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM registry_log")
        .fetch_one(&mut *conn)
        .await
        .map_err(store_error)?;
    if head as u64 != expected {
        return Err(RegistryError::MutationConflict {
            expected,
            found: head as u64,
        });
    }

    let inserted = sqlx::query(
        "INSERT INTO registry_log (version, events, committed_at) VALUES (?, ?, ?)",
    )
    .bind(entry.version as i64)
    .bind(events)
    .bind(entry.committed_at)
    .execute(&mut *conn)
    .await;

    if let Err(e) = inserted {
        let unique = e
            .as_database_error()
            .map(|db| db.is_unique_violation())
            .unwrap_or(false);
        if unique {
            return Err(RegistryError::MutationConflict {
                expected,
                found: entry.version,
            });
        }
        return Err(store_error(e));
    }

    sqlx::query(
        "INSERT INTO registry_snapshot (id, version, body) VALUES (1, ?, ?)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version, body = excluded.body",
    )
    .bind(snapshot.version as i64)
    .bind(body)
    .execute(&mut *conn)
    .await
    .map_err(store_error)?;

    Ok(())
}

/// SQLITE_BUSY or SQLITE_LOCKED, including their extended codes.
fn is_lock_contention(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| matches!(code & 0xff, 5 | 6))
        .unwrap_or(false)
}

fn store_error(e: sqlx::Error) -> RegistryError {
    if is_lock_contention(&e) {
        RegistryError::Busy(e.to_string())
    } else {
        RegistryError::Database(e)
    }
}

#[async_trait]
impl RegistryStore for SqliteRegistryStore {
    async fn load(&self) -> Result<Option<RegistrySnapshot>> {
        let row = sqlx::query("SELECT body FROM registry_snapshot WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: String = row.get("body");
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn commit(&self, entry: &LogEntry, snapshot: &RegistrySnapshot) -> Result<()> {
        let events = serde_json::to_string(&entry.events)?;
        let body = serde_json::to_string(snapshot)?;

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(store_error)?;

        let written = match append_entry(&mut conn, entry, snapshot, &events, &body).await {
            Ok(()) => sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .map(|_| ())
                .map_err(store_error),
            Err(e) => Err(e),
        };

        if written.is_err() {
            if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                tracing::debug!(error = %e, "Registry rollback after failed commit");
            }
        }
        written
    }

    async fn log(&self) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            "SELECT version, events, committed_at FROM registry_log ORDER BY version ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let version: i64 = row.get("version");
                let events: String = row.get("events");
                let events: Vec<RegistryEvent> = serde_json::from_str(&events)?;
                Ok(LogEntry {
                    version: version as u64,
                    events,
                    committed_at: row.get("committed_at"),
                })
            })
            .collect()
    }
}
