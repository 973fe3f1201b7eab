//! capstore Shard Backends
//!
//! A shard is one physical backing store. This crate defines the two seams the
//! rest of capstore talks to:
//!
//! - [`ShardBackend`]: an open session against one shard (schema, usage probe,
//!   record reads and writes).
//! - [`ShardAllocator`]: creates brand-new empty stores, opens sessions from
//!   [`ConnectionInfo`], and discards partially created stores.
//!
//! Two implementations ship with the crate:
//!
//! | Backend | Connection info | Used by |
//! |---------|-----------------|---------|
//! | [`SqliteAllocator`] | `sqlite://<data_dir>/<shard_id>.db` | the `capstore` binary |
//! | [`MemoryAllocator`] | `memory://<shard_id>` | tests (supports fault injection) |
//!
//! ## Connection ownership
//!
//! Sessions are cached per component with a [`ConnectionCache`]. The monitor and
//! the router each hold their own cache so a slow probe never shares a pool
//! with the request path.
//!
//! ## Usage
//!
//! ```ignore
//! use capstore_backend::{ConnectionCache, ShardAllocator, SqliteAllocator};
//!
//! let allocator = Arc::new(SqliteAllocator::new("./data/shards", 20 << 30));
//! let info = allocator.allocate("shard-0001").await?;
//! let shard = allocator.open("shard-0001", &info).await?;
//! shard.apply_schema().await?;
//! shard.insert(&record).await?;
//! ```

pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use error::{BackendError, Result};
pub use memory::{MemoryAllocator, MemoryShard};
pub use schema::SCHEMA_VERSION;
pub use sqlite::{SqliteAllocator, SqliteShardBackend};

use async_trait::async_trait;
use capstore_core::{ApplicantRecord, ConnectionInfo, RecordQuery, ShardDescriptor};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Raw storage usage reported by a backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

/// An open session against one shard.
#[async_trait]
pub trait ShardBackend: Send + Sync {
    /// Id of the shard this session talks to.
    fn shard_id(&self) -> &str;

    /// Create the canonical schema. Idempotent.
    async fn apply_schema(&self) -> Result<()>;

    /// Schema version recorded on the shard, `None` if never applied.
    async fn schema_version(&self) -> Result<Option<u32>>;

    /// Current usage against the shard's quota.
    async fn usage(&self) -> Result<StorageUsage>;

    /// Insert a new record. Fails with `DuplicateKey` if the key exists here.
    async fn insert(&self, record: &ApplicantRecord) -> Result<()>;

    /// Replace an existing record. Fails with `NotFound` if the key is absent.
    async fn update(&self, record: &ApplicantRecord) -> Result<()>;

    async fn get(&self, candidate_id: &str) -> Result<Option<ApplicantRecord>>;

    /// Evaluate a query; rows are ordered by `candidate_id`.
    async fn query(&self, query: &RecordQuery) -> Result<Vec<ApplicantRecord>>;

    /// Highest numeric suffix among keys starting with `prefix`.
    async fn max_key_sequence(&self, prefix: &str) -> Result<Option<u64>>;
}

/// Creates, opens and discards backing stores.
#[async_trait]
pub trait ShardAllocator: Send + Sync {
    /// Create a new, empty backing store for `shard_id`.
    ///
    /// Fails with `AlreadyExists` if a store for that id is already present.
    async fn allocate(&self, shard_id: &str) -> Result<ConnectionInfo>;

    /// Open a session against an allocated store.
    async fn open(&self, shard_id: &str, info: &ConnectionInfo) -> Result<Arc<dyn ShardBackend>>;

    /// Remove a store, used to clean up after a failed provisioning attempt.
    async fn discard(&self, info: &ConnectionInfo) -> Result<()>;
}

/// Per-component cache of open shard sessions, keyed by shard id.
pub struct ConnectionCache {
    allocator: Arc<dyn ShardAllocator>,
    sessions: RwLock<HashMap<String, Arc<dyn ShardBackend>>>,
}

impl ConnectionCache {
    pub fn new(allocator: Arc<dyn ShardAllocator>) -> Self {
        Self {
            allocator,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached session for a shard, opening one on first use.
    pub async fn get(&self, shard: &ShardDescriptor) -> Result<Arc<dyn ShardBackend>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&shard.id) {
                return Ok(session.clone());
            }
        }

        let session = self.allocator.open(&shard.id, &shard.connection_info).await?;

        let mut sessions = self.sessions.write().await;
        // Another task may have opened it concurrently; keep the first one.
        let session = sessions
            .entry(shard.id.clone())
            .or_insert(session)
            .clone();
        Ok(session)
    }

    /// Drop a cached session so the next `get` reopens it.
    pub async fn evict(&self, shard_id: &str) {
        if self.sessions.write().await.remove(shard_id).is_some() {
            tracing::debug!(shard_id = %shard_id, "Evicted cached shard session");
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub fn allocator(&self) -> &Arc<dyn ShardAllocator> {
        &self.allocator
    }
}
