//! In-memory shard backend
//!
//! Stores records in a `BTreeMap` and accounts usage as the serialized size of
//! each record. Every shard exposes fault-injection switches so tests can
//! simulate outages, slow probes, full disks and failed provisioning.
//!
//! ```ignore
//! let allocator = Arc::new(MemoryAllocator::new(1_000));
//! let info = allocator.allocate("shard-0001").await?;
//! let shard = allocator.shard("shard-0001").unwrap();
//! shard.set_used_bytes(910);      // 91% full
//! shard.set_unavailable(true);     // every call now fails
//! ```

use crate::error::{BackendError, Result};
use crate::schema::SCHEMA_VERSION;
use crate::{ShardAllocator, ShardBackend, StorageUsage};
use async_trait::async_trait;
use capstore_core::{ApplicantRecord, ConnectionInfo, RecordQuery};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

const SCHEME: &str = "memory://";

/// Sentinel meaning "no usage override".
const NO_OVERRIDE: u64 = u64::MAX;

/// An in-memory shard. Cloned `Arc`s share state.
pub struct MemoryShard {
    shard_id: String,
    quota_bytes: u64,
    records: RwLock<BTreeMap<String, ApplicantRecord>>,
    schema_version: RwLock<Option<u32>>,

    unavailable: AtomicBool,
    fail_schema: AtomicBool,
    used_bytes_override: AtomicU64,
    delay_ms: AtomicU64,
    insert_count: AtomicU64,
}

impl MemoryShard {
    fn new(shard_id: &str, quota_bytes: u64) -> Self {
        Self {
            shard_id: shard_id.to_string(),
            quota_bytes,
            records: RwLock::new(BTreeMap::new()),
            schema_version: RwLock::new(None),
            unavailable: AtomicBool::new(false),
            fail_schema: AtomicBool::new(false),
            used_bytes_override: AtomicU64::new(NO_OVERRIDE),
            delay_ms: AtomicU64::new(0),
            insert_count: AtomicU64::new(0),
        }
    }

    /// Make every operation (and `open`) fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Report a fixed used-byte count from `usage()`; inserts past the quota
    /// still fail with `StorageFull`.
    pub fn set_used_bytes(&self, used_bytes: u64) {
        self.used_bytes_override.store(used_bytes, Ordering::SeqCst);
    }

    pub fn clear_used_bytes(&self) {
        self.used_bytes_override.store(NO_OVERRIDE, Ordering::SeqCst);
    }

    /// Delay every operation, to exercise timeouts.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_fail_schema(&self, fail: bool) {
        self.fail_schema.store(fail, Ordering::SeqCst);
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }

    /// Number of successful inserts served by this shard.
    pub fn insert_count(&self) -> u64 {
        self.insert_count.load(Ordering::SeqCst)
    }

    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    async fn enter(&self) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.is_unavailable() {
            return Err(BackendError::Unavailable(format!(
                "shard {} is down",
                self.shard_id
            )));
        }
        Ok(())
    }

    async fn require_schema(&self) -> Result<()> {
        if self.schema_version.read().await.is_none() {
            return Err(BackendError::Schema(format!(
                "no such table: candidates (shard {})",
                self.shard_id
            )));
        }
        Ok(())
    }

    fn stored_size(record: &ApplicantRecord) -> u64 {
        serde_json::to_vec(record).map(|v| v.len() as u64).unwrap_or(0)
    }

    fn used_bytes(&self, records: &BTreeMap<String, ApplicantRecord>) -> u64 {
        match self.used_bytes_override.load(Ordering::SeqCst) {
            NO_OVERRIDE => records.values().map(Self::stored_size).sum(),
            forced => forced,
        }
    }
}

#[async_trait]
impl ShardBackend for MemoryShard {
    fn shard_id(&self) -> &str {
        &self.shard_id
    }

    async fn apply_schema(&self) -> Result<()> {
        self.enter().await?;
        if self.fail_schema.load(Ordering::SeqCst) {
            return Err(BackendError::Schema(format!(
                "injected schema failure on {}",
                self.shard_id
            )));
        }
        *self.schema_version.write().await = Some(SCHEMA_VERSION);
        Ok(())
    }

    async fn schema_version(&self) -> Result<Option<u32>> {
        self.enter().await?;
        Ok(*self.schema_version.read().await)
    }

    async fn usage(&self) -> Result<StorageUsage> {
        self.enter().await?;
        let records = self.records.read().await;
        Ok(StorageUsage {
            used_bytes: self.used_bytes(&records),
            total_bytes: self.quota_bytes,
        })
    }

    async fn insert(&self, record: &ApplicantRecord) -> Result<()> {
        self.enter().await?;
        self.require_schema().await?;

        let mut records = self.records.write().await;
        if records.contains_key(&record.candidate_id) {
            return Err(BackendError::DuplicateKey(record.candidate_id.clone()));
        }
        if self.used_bytes(&records) + Self::stored_size(record) > self.quota_bytes {
            return Err(BackendError::StorageFull(format!(
                "shard {} quota of {} bytes exhausted",
                self.shard_id, self.quota_bytes
            )));
        }
        records.insert(record.candidate_id.clone(), record.clone());
        self.insert_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, record: &ApplicantRecord) -> Result<()> {
        self.enter().await?;
        self.require_schema().await?;

        let mut records = self.records.write().await;
        match records.get_mut(&record.candidate_id) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = record.clone();
                existing.created_at = created_at;
                Ok(())
            }
            None => Err(BackendError::NotFound(record.candidate_id.clone())),
        }
    }

    async fn get(&self, candidate_id: &str) -> Result<Option<ApplicantRecord>> {
        self.enter().await?;
        self.require_schema().await?;
        Ok(self.records.read().await.get(candidate_id).cloned())
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<ApplicantRecord>> {
        self.enter().await?;
        self.require_schema().await?;
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }

    async fn max_key_sequence(&self, prefix: &str) -> Result<Option<u64>> {
        self.enter().await?;
        self.require_schema().await?;
        Ok(self
            .records
            .read()
            .await
            .keys()
            .filter_map(|k| k.strip_prefix(prefix))
            .filter_map(|digits| digits.parse::<u64>().ok())
            .max())
    }
}

/// Allocator handing out [`MemoryShard`]s.
pub struct MemoryAllocator {
    quota_bytes: u64,
    shards: Mutex<HashMap<String, Arc<MemoryShard>>>,
    fail_allocations: AtomicU32,
    fail_schema_applies: AtomicU32,
    allocations: AtomicU32,
}

impl MemoryAllocator {
    pub fn new(quota_bytes: u64) -> Self {
        Self {
            quota_bytes,
            shards: Mutex::new(HashMap::new()),
            fail_allocations: AtomicU32::new(0),
            fail_schema_applies: AtomicU32::new(0),
            allocations: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` calls to `allocate` with `Unavailable`.
    pub fn fail_next_allocations(&self, n: u32) {
        self.fail_allocations.store(n, Ordering::SeqCst);
    }

    /// Make the schema apply fail on the next `n` allocated stores.
    pub fn fail_next_schema_applies(&self, n: u32) {
        self.fail_schema_applies.store(n, Ordering::SeqCst);
    }

    /// Number of `allocate` calls that created a store.
    pub fn allocation_count(&self) -> u32 {
        self.allocations.load(Ordering::SeqCst)
    }

    /// Handle to a live store, for fault injection.
    pub fn shard(&self, shard_id: &str) -> Option<Arc<MemoryShard>> {
        self.lock().get(shard_id).cloned()
    }

    pub fn contains(&self, shard_id: &str) -> bool {
        self.lock().contains_key(shard_id)
    }

    pub fn shard_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Allocate a store and apply the schema in one step.
    pub async fn create_ready(&self, shard_id: &str) -> Result<(ConnectionInfo, Arc<MemoryShard>)> {
        let info = self.allocate(shard_id).await?;
        let shard = self
            .shard(shard_id)
            .ok_or_else(|| BackendError::Unavailable(shard_id.to_string()))?;
        shard.apply_schema().await?;
        Ok((info, shard))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<MemoryShard>>> {
        // A poisoned map only means a test panicked mid-update.
        self.shards.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn parse_id(info: &ConnectionInfo) -> Result<&str> {
        info.as_str()
            .strip_prefix(SCHEME)
            .ok_or_else(|| BackendError::InvalidConnection(info.to_string()))
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ShardAllocator for MemoryAllocator {
    async fn allocate(&self, shard_id: &str) -> Result<ConnectionInfo> {
        if take_one(&self.fail_allocations) {
            return Err(BackendError::Unavailable(format!(
                "injected allocation failure for {}",
                shard_id
            )));
        }

        let mut shards = self.lock();
        if shards.contains_key(shard_id) {
            return Err(BackendError::AlreadyExists(shard_id.to_string()));
        }

        let shard = MemoryShard::new(shard_id, self.quota_bytes);
        if take_one(&self.fail_schema_applies) {
            shard.set_fail_schema(true);
        }
        shards.insert(shard_id.to_string(), Arc::new(shard));
        self.allocations.fetch_add(1, Ordering::SeqCst);

        Ok(ConnectionInfo::new(format!("{}{}", SCHEME, shard_id)))
    }

    async fn open(&self, _shard_id: &str, info: &ConnectionInfo) -> Result<Arc<dyn ShardBackend>> {
        let id = Self::parse_id(info)?;
        let shard = self
            .shard(id)
            .ok_or_else(|| BackendError::Unavailable(format!("no store at {}", info)))?;
        if shard.is_unavailable() {
            return Err(BackendError::Unavailable(format!("shard {} is down", id)));
        }
        Ok(shard)
    }

    async fn discard(&self, info: &ConnectionInfo) -> Result<()> {
        let id = Self::parse_id(info)?;
        self.lock().remove(id);
        Ok(())
    }
}
