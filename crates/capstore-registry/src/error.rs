//! Registry Error Types
//!
//! ## Error Categories
//!
//! ### Lifecycle
//! - `NotInitialized`: `open` on a store that was never bootstrapped
//!
//! ### Mutation
//! - `MutationConflict`: the durable log head moved underneath this registry
//!   (another process committed). Retried by `mutate` after a reload.
//! - `Busy`: another process held the store's write lock past the busy
//!   timeout. Retried like a conflict.
//! - `InvariantViolation`: the mutation would produce an illegal registry
//!   (two write targets, duplicate ids, empty shard list, ...)
//! - `UnknownShard`: a mutation referenced a shard id not in the registry
//! - `Rejected`: the transformation itself declined to proceed
//!
//! ### Storage
//! - `Database`, `Serialization`: the durable store failed
//! - `ReplayMismatch`: replaying the log did not reproduce the stored snapshot

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry not initialized")]
    NotInitialized,

    #[error("Registry mutation conflict: expected log head {expected}, found {found}")]
    MutationConflict { expected: u64, found: u64 },

    #[error("Registry store busy: {0}")]
    Busy(String),

    #[error("Registry invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Unknown shard: {0}")]
    UnknownShard(String),

    #[error("Mutation rejected: {0}")]
    Rejected(String),

    #[error("Replay mismatch: {0}")]
    ReplayMismatch(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistryError {
    /// Errors that `mutate` answers with a reload and another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::MutationConflict { .. } | Self::Busy(_))
    }
}
