//! Durability, replay and conflict handling of the shard registry.

use async_trait::async_trait;
use capstore_core::{CapacitySnapshot, ConnectionInfo, RegistryConfig, ShardDescriptor, ShardRole};
use capstore_registry::{
    LogEntry, RegistryError, RegistrySnapshot, RegistryStore, ShardRegistry, SqliteRegistryStore,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn shard(id: &str) -> ShardDescriptor {
    ShardDescriptor::new(
        id,
        ConnectionInfo::new(format!("memory://{}", id)),
        ShardRole::WriteTarget,
    )
}

async fn file_store(dir: &TempDir) -> Arc<dyn RegistryStore> {
    Arc::new(
        SqliteRegistryStore::new(dir.path().join("registry.db"))
            .await
            .unwrap(),
    )
}

/// Store whose next `fail_next` commits are refused with a lock or head error.
struct ContendedStore {
    inner: SqliteRegistryStore,
    fail_next: AtomicU32,
    busy: bool,
    commits: AtomicU32,
}

impl ContendedStore {
    async fn new(fail_next: u32, busy: bool) -> Self {
        Self {
            inner: SqliteRegistryStore::new_in_memory().await.unwrap(),
            fail_next: AtomicU32::new(fail_next),
            busy,
            commits: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl RegistryStore for ContendedStore {
    async fn load(&self) -> capstore_registry::Result<Option<RegistrySnapshot>> {
        self.inner.load().await
    }

    async fn commit(
        &self,
        entry: &LogEntry,
        snapshot: &RegistrySnapshot,
    ) -> capstore_registry::Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse && entry.version > 1 {
            return Err(if self.busy {
                RegistryError::Busy("database is locked".into())
            } else {
                RegistryError::MutationConflict {
                    expected: entry.version - 1,
                    found: entry.version,
                }
            });
        }
        self.inner.commit(entry, snapshot).await
    }

    async fn log(&self) -> capstore_registry::Result<Vec<LogEntry>> {
        self.inner.log().await
    }
}

async fn contended(fail_next: u32, busy: bool) -> (Arc<ContendedStore>, ShardRegistry) {
    let store = Arc::new(ContendedStore::new(0, busy).await);
    let registry = ShardRegistry::bootstrap(store.clone(), shard("shard-0001"))
        .await
        .unwrap();
    store.fail_next.store(fail_next, Ordering::SeqCst);
    store.commits.store(0, Ordering::SeqCst);
    (store, registry)
}

#[tokio::test]
async fn test_versions_strictly_increase_and_replay_matches() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ShardRegistry::bootstrap(file_store(&dir).await, shard("shard-0001"))
        .await
        .unwrap();

    let mut versions = vec![registry.version()];

    let snap = registry
        .mutate(|txn| {
            txn.record_capacity("shard-0001", CapacitySnapshot::from_usage(91, 100, 1_000))
        })
        .await
        .unwrap();
    versions.push(snap.version);

    let snap = registry
        .mutate(|txn| txn.append_write_target(shard("shard-0002")))
        .await
        .unwrap();
    versions.push(snap.version);

    let snap = registry
        .mutate(|txn| {
            txn.set_role("shard-0001", ShardRole::Unreachable)?;
            txn.record_capacity("shard-0002", CapacitySnapshot::from_usage(5, 100, 2_000))
        })
        .await
        .unwrap();
    versions.push(snap.version);

    assert_eq!(versions, vec![1, 2, 3, 4]);

    let replayed = registry.replay().await.unwrap();
    assert_eq!(replayed, *registry.snapshot());
    registry.verify().await.unwrap();

    // The demotion and promotion happened in the same version.
    let history = registry.history().await.unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[2].events.len(), 1);
}

#[tokio::test]
async fn test_restart_reloads_durable_state() {
    let dir = tempfile::tempdir().unwrap();

    {
        let registry = ShardRegistry::bootstrap(file_store(&dir).await, shard("shard-0001"))
            .await
            .unwrap();
        registry
            .mutate(|txn| txn.append_write_target(shard("shard-0002")))
            .await
            .unwrap();
    }

    let registry = ShardRegistry::open(file_store(&dir).await).await.unwrap();
    let snap = registry.snapshot();
    assert_eq!(snap.version, 2);
    assert_eq!(snap.write_target().unwrap().id, "shard-0002");
    assert_eq!(snap.get("shard-0001").unwrap().role, ShardRole::ReadOnly);

    // Bootstrapping again is a reload, not a reset.
    let again = ShardRegistry::bootstrap(file_store(&dir).await, shard("shard-0009"))
        .await
        .unwrap();
    assert_eq!(again.version(), 2);
    assert!(again.snapshot().get("shard-0009").is_none());
}

#[tokio::test]
async fn test_conflicting_writer_is_reloaded_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    let a = ShardRegistry::bootstrap(file_store(&dir).await, shard("shard-0001"))
        .await
        .unwrap();
    let b = ShardRegistry::open(file_store(&dir).await).await.unwrap();

    // `a` commits version 2; `b` still believes the head is 1.
    a.mutate(|txn| txn.append_write_target(shard("shard-0002")))
        .await
        .unwrap();
    assert_eq!(b.version(), 1);

    let snap = b
        .mutate(|txn| {
            let target = txn
                .state()
                .write_target()
                .map(|s| s.id.clone())
                .ok_or_else(|| RegistryError::Rejected("no write target".into()))?;
            txn.record_capacity(&target, CapacitySnapshot::from_usage(1, 100, 5))
        })
        .await
        .unwrap();

    // The retry ran against the reloaded state, so it observed shard-0002.
    assert_eq!(snap.version, 3);
    assert_eq!(snap.get("shard-0002").unwrap().capacity.used_bytes, 1);
    assert_eq!(snap.get("shard-0001").unwrap().role, ShardRole::ReadOnly);
    b.verify().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_mutations_are_serialized() {
    let store: Arc<dyn RegistryStore> = Arc::new(SqliteRegistryStore::new_in_memory().await.unwrap());
    let registry = Arc::new(
        ShardRegistry::bootstrap(store, shard("shard-0001"))
            .await
            .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..8u64 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry
                .mutate(move |txn| {
                    txn.record_capacity("shard-0001", CapacitySnapshot::from_usage(i, 100, i as i64))
                })
                .await
                .unwrap()
                .version
        }));
    }

    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.await.unwrap());
    }
    versions.sort();
    assert_eq!(versions, (2..=9).collect::<Vec<u64>>());
    registry.verify().await.unwrap();
}

#[tokio::test]
async fn test_two_write_targets_never_committed() {
    let store: Arc<dyn RegistryStore> = Arc::new(SqliteRegistryStore::new_in_memory().await.unwrap());
    let registry = ShardRegistry::bootstrap(store, shard("shard-0001"))
        .await
        .unwrap();
    registry
        .mutate(|txn| txn.append_write_target(shard("shard-0002")))
        .await
        .unwrap();

    // Re-promoting the old shard without demoting the new one is illegal.
    let err = registry
        .mutate(|txn| txn.set_role("shard-0001", ShardRole::WriteTarget))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::InvariantViolation(_)));
    assert_eq!(registry.version(), 2);
}

#[tokio::test]
async fn test_mutation_retry_budget_comes_from_config() {
    // Default budget of 3 attempts gives up after three conflicts.
    let (store, registry) = contended(3, false).await;
    let err = registry
        .mutate(|txn| txn.append_write_target(shard("shard-0002")))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::MutationConflict { .. }));
    assert_eq!(store.commits.load(Ordering::SeqCst), 3);
    assert_eq!(registry.version(), 1);

    // A larger configured budget rides out the same contention.
    let (store, registry) = contended(3, false).await;
    let registry = registry.with_config(&RegistryConfig {
        max_mutation_attempts: 4,
    });
    assert_eq!(registry.max_mutation_attempts(), 4);
    let snap = registry
        .mutate(|txn| txn.append_write_target(shard("shard-0002")))
        .await
        .unwrap();
    assert_eq!(snap.version, 2);
    assert_eq!(store.commits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_busy_store_is_retried_like_a_conflict() {
    let (store, registry) = contended(2, true).await;
    let snap = registry
        .mutate(|txn| txn.set_role("shard-0001", ShardRole::Unreachable))
        .await
        .unwrap();
    assert_eq!(snap.version, 2);
    assert_eq!(store.commits.load(Ordering::SeqCst), 3);

    let (_store, registry) = contended(5, true).await;
    let registry = registry.with_config(&RegistryConfig {
        max_mutation_attempts: 2,
    });
    let err = registry
        .mutate(|txn| txn.set_role("shard-0001", ShardRole::Unreachable))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Busy(_)));
}
