//! capstore Shard Registry
//!
//! The single durable, versioned source of truth listing every shard, its role,
//! and which one is the current write target.
//!
//! ## Guarantees
//!
//! - **Single mutator**: [`ShardRegistry::mutate`] serializes every change; two
//!   provisioning attempts, or a provisioning and a monitor refresh, can never
//!   interleave.
//! - **Durable before visible**: a version is published to readers only after the
//!   [`RegistryStore`] has committed it.
//! - **Replayable**: the log of [`RegistryEvent`]s reproduces the current
//!   snapshot exactly ([`ShardRegistry::replay`]).
//! - **Snapshot reads**: [`ShardRegistry::snapshot`] returns an immutable
//!   `Arc<RegistrySnapshot>` without waiting on in-flight mutations.
//!
//! ## Usage
//!
//! ```ignore
//! use capstore_registry::{ShardRegistry, SqliteRegistryStore};
//!
//! let store = Arc::new(SqliteRegistryStore::new("registry.db").await?);
//! let registry = ShardRegistry::bootstrap(store, first_shard).await?;
//!
//! registry.mutate(|txn| txn.set_role("shard-0001", ShardRole::Unreachable)).await?;
//! let snap = registry.snapshot();
//! ```

pub mod error;
pub mod registry;
pub mod store;
pub mod types;

pub use error::{RegistryError, Result};
pub use registry::{RegistryTxn, ShardRegistry};
pub use store::SqliteRegistryStore;
pub use types::{replay, LogEntry, RegistryEvent, RegistrySnapshot};

use async_trait::async_trait;

/// Durable storage for the registry log and its latest snapshot.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Latest committed snapshot, `None` on a fresh store.
    async fn load(&self) -> Result<Option<RegistrySnapshot>>;

    /// Atomically append `entry` and replace the stored snapshot.
    ///
    /// Fails with `MutationConflict` unless the log head is `entry.version - 1`.
    async fn commit(&self, entry: &LogEntry, snapshot: &RegistrySnapshot) -> Result<()>;

    /// Every log entry, oldest first.
    async fn log(&self) -> Result<Vec<LogEntry>>;
}
