//! Router Error Types
//!
//! Every variant here is caller-visible. Partial reads are NOT errors; they come
//! back as `ReadResult { partial: true, .. }`.
//!
//! - `NoWriteTarget`: no shard held `WRITE_TARGET` for the whole retry budget
//! - `RouterTimeout`: the last write attempt timed out on its shard
//! - `StorageFull`: the write target rejected the row for lack of space
//! - `DuplicateKey`: the key already lives on `shard_id`
//! - `HomeUnavailable`: the key's home shard could not be consulted
//! - `IncompleteKeySpace`: not every shard answered, so no safe new id exists

use capstore_backend::BackendError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("No write target available after {attempts} attempt(s)")]
    NoWriteTarget { attempts: u32 },

    #[error("Shard {shard_id} timed out after {timeout_ms}ms")]
    RouterTimeout { shard_id: String, timeout_ms: u64 },

    #[error("Write failed after {attempts} attempt(s): {message}")]
    WriteFailed { attempts: u32, message: String },

    #[error("Shard {shard_id} is full: {message}")]
    StorageFull { shard_id: String, message: String },

    #[error("Key {key} already exists on shard {shard_id}")]
    DuplicateKey { key: String, shard_id: String },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Home shard of {key} unavailable (unreachable: {unreachable:?})")]
    HomeUnavailable {
        key: String,
        unreachable: Vec<String>,
    },

    #[error("Cannot assign a new id, shards did not answer: {unreachable:?}")]
    IncompleteKeySpace { unreachable: Vec<String> },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}
