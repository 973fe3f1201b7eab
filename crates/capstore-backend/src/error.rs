//! Backend Error Types
//!
//! Every shard operation returns `Result<T>`, aliased to `Result<T, BackendError>`.
//!
//! ## Error Categories
//!
//! ### Transient (safe to retry)
//! - `Unavailable`: the store could not be reached (missing file, I/O, pool timeout, busy)
//!
//! ### Permanent for this operation
//! - `StorageFull`: the shard's quota is exhausted
//! - `DuplicateKey`: a record with the same `candidate_id` already exists on this shard
//! - `NotFound`: update of a key that does not exist
//! - `Schema`: the canonical schema is missing or could not be applied
//!
//! ### Allocation
//! - `AlreadyExists`: an allocator was asked to create a store that already exists
//! - `InvalidConnection`: connection info the allocator cannot interpret

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Shard unavailable: {0}")]
    Unavailable(String),

    #[error("Shard storage full: {0}")]
    StorageFull(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Backing store already exists: {0}")]
    AlreadyExists(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invalid connection info: {0}")]
    InvalidConnection(String),

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

// SQLite primary result codes (extended codes share the low byte)
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;
const SQLITE_FULL: i64 = 13;
const SQLITE_CANTOPEN: i64 = 14;

impl From<sqlx::Error> for BackendError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => BackendError::Unavailable(e.to_string()),
            sqlx::Error::Database(db) => {
                let message = db.message().to_string();
                let primary = db
                    .code()
                    .and_then(|code| code.parse::<i64>().ok())
                    .map(|code| code & 0xff);

                match primary {
                    Some(SQLITE_FULL) => BackendError::StorageFull(message),
                    Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) | Some(SQLITE_CANTOPEN) => {
                        BackendError::Unavailable(message)
                    }
                    _ if message.contains("database or disk is full") => {
                        BackendError::StorageFull(message)
                    }
                    _ if message.contains("no such table") => BackendError::Schema(message),
                    _ => BackendError::Database(e),
                }
            }
            _ => BackendError::Database(e),
        }
    }
}

/// Whether a sqlx error is a primary key / unique constraint violation.
pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            db.is_unique_violation() || db.message().contains("UNIQUE constraint failed")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Unavailable("x".into()).is_transient());
        assert!(!BackendError::StorageFull("x".into()).is_transient());
        assert!(!BackendError::DuplicateKey("CAND-0001".into()).is_transient());
        assert!(!BackendError::Schema("x".into()).is_transient());
    }

    #[test]
    fn test_pool_timeout_is_unavailable() {
        let err: BackendError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }
}
