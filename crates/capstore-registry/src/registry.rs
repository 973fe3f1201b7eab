//! ShardRegistry: the single-mutator front of the durable log.
//!
//! Readers call [`ShardRegistry::snapshot`] (lock-free clone of an `Arc`).
//! Writers call [`ShardRegistry::mutate`] with a closure that records events on
//! a [`RegistryTxn`]. Mutations are serialized by an async mutex, validated,
//! committed to the store, and only then published on the watch channel.

use crate::error::{RegistryError, Result};
use crate::types::{replay, LogEntry, RegistryEvent, RegistrySnapshot};
use crate::RegistryStore;
use capstore_core::{now_ms, CapacitySnapshot, RegistryConfig, ShardDescriptor, ShardRole};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Working copy handed to a mutation closure.
///
/// Every method applies its event to the working state immediately, so later
/// calls in the same closure see earlier ones.
pub struct RegistryTxn {
    working: RegistrySnapshot,
    events: Vec<RegistryEvent>,
}

impl RegistryTxn {
    fn new(base: RegistrySnapshot) -> Self {
        Self {
            working: base,
            events: Vec::new(),
        }
    }

    /// Current working state, including changes made so far in this txn.
    pub fn state(&self) -> &RegistrySnapshot {
        &self.working
    }

    /// Append a new write target, demoting the current one (if any) to
    /// `READ_ONLY` in the same version.
    pub fn append_write_target(&mut self, mut shard: ShardDescriptor) -> Result<()> {
        shard.role = ShardRole::WriteTarget;
        let demoted = self.working.write_target().map(|s| s.id.clone());
        self.record(RegistryEvent::ShardAppended { shard, demoted })
    }

    /// Change a shard's role. No event is recorded if the role is unchanged.
    pub fn set_role(&mut self, shard_id: &str, role: ShardRole) -> Result<()> {
        let current = self
            .working
            .get(shard_id)
            .map(|s| s.role)
            .ok_or_else(|| RegistryError::UnknownShard(shard_id.to_string()))?;
        if current == role {
            return Ok(());
        }
        self.record(RegistryEvent::RoleChanged {
            shard_id: shard_id.to_string(),
            from: current,
            to: role,
        })
    }

    pub fn record_capacity(&mut self, shard_id: &str, capacity: CapacitySnapshot) -> Result<()> {
        self.record(RegistryEvent::CapacityObserved {
            shard_id: shard_id.to_string(),
            capacity,
        })
    }

    /// Apply and record an arbitrary event.
    pub fn record(&mut self, event: RegistryEvent) -> Result<()> {
        self.working.apply(&event)?;
        self.events.push(event);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Versioned registry shared by the monitor, the provisioner and the router.
pub struct ShardRegistry {
    store: Arc<dyn RegistryStore>,
    mutation_lock: Mutex<()>,
    current: watch::Sender<Arc<RegistrySnapshot>>,
    max_mutation_attempts: u32,
}

impl ShardRegistry {
    /// Create version 1 with `first_shard` as write target, or reload the
    /// existing registry if the store already holds one.
    pub async fn bootstrap(
        store: Arc<dyn RegistryStore>,
        mut first_shard: ShardDescriptor,
    ) -> Result<Self> {
        if let Some(existing) = store.load().await? {
            tracing::info!(
                version = existing.version,
                shards = existing.len(),
                "Registry already initialized, reloading"
            );
            return Ok(Self::from_snapshot(store, existing));
        }

        first_shard.role = ShardRole::WriteTarget;
        let event = RegistryEvent::Bootstrapped { shard: first_shard };

        let mut snapshot = RegistrySnapshot::empty();
        snapshot.apply(&event)?;
        snapshot.version = 1;
        snapshot.validate()?;

        let entry = LogEntry {
            version: 1,
            events: vec![event],
            committed_at: now_ms(),
        };
        store.commit(&entry, &snapshot).await?;

        tracing::info!(
            shard_id = %snapshot.shards[0].id,
            "Bootstrapped shard registry at version 1"
        );

        Ok(Self::from_snapshot(store, snapshot))
    }

    /// Reload an existing registry. Fails with `NotInitialized` on a fresh store.
    pub async fn open(store: Arc<dyn RegistryStore>) -> Result<Self> {
        let snapshot = store.load().await?.ok_or(RegistryError::NotInitialized)?;
        tracing::info!(version = snapshot.version, "Loaded shard registry");
        Ok(Self::from_snapshot(store, snapshot))
    }

    fn from_snapshot(store: Arc<dyn RegistryStore>, snapshot: RegistrySnapshot) -> Self {
        let (current, _) = watch::channel(Arc::new(snapshot));
        Self {
            store,
            mutation_lock: Mutex::new(()),
            current,
            max_mutation_attempts: RegistryConfig::default().max_mutation_attempts,
        }
    }

    /// Apply registry settings (mutation retry budget).
    pub fn with_config(mut self, config: &RegistryConfig) -> Self {
        self.max_mutation_attempts = config.max_mutation_attempts.max(1);
        self
    }

    pub fn max_mutation_attempts(&self) -> u32 {
        self.max_mutation_attempts
    }

    /// Latest committed version.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.borrow().version
    }

    /// Receiver that observes every committed snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.current.subscribe()
    }

    /// Apply `f` as one atomic, durable version bump.
    ///
    /// `f` may run more than once: if another process committed first (or held
    /// the store's write lock), the registry reloads and re-runs it against the
    /// fresh state, up to `max_mutation_attempts` times. A closure that
    /// records no events leaves the version unchanged.
    pub async fn mutate<F>(&self, f: F) -> Result<Arc<RegistrySnapshot>>
    where
        F: Fn(&mut RegistryTxn) -> Result<()> + Send,
    {
        let _guard = self.mutation_lock.lock().await;

        let mut attempt = 0;
        loop {
            attempt += 1;

            let base = self.snapshot();
            let mut txn = RegistryTxn::new((*base).clone());
            f(&mut txn)?;

            if txn.is_empty() {
                return Ok(base);
            }

            let RegistryTxn { working, events } = txn;
            let mut next = working;
            next.version = base.version + 1;
            next.validate()?;

            let entry = LogEntry {
                version: next.version,
                events,
                committed_at: now_ms(),
            };

            match self.store.commit(&entry, &next).await {
                Ok(()) => {
                    tracing::info!(
                        version = next.version,
                        events = entry.events.len(),
                        write_target = ?next.write_target().map(|s| s.id.as_str()),
                        "Committed registry version"
                    );
                    let next = Arc::new(next);
                    self.current.send_replace(next.clone());
                    return Ok(next);
                }
                Err(e) if e.is_retryable() && attempt < self.max_mutation_attempts => {
                    tracing::warn!(
                        error = %e,
                        attempt,
                        max_attempts = self.max_mutation_attempts,
                        "Registry head moved, reloading and retrying mutation"
                    );
                    self.reload().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Refresh the in-memory view from the durable store.
    pub async fn reload(&self) -> Result<Arc<RegistrySnapshot>> {
        let snapshot = Arc::new(
            self.store
                .load()
                .await?
                .ok_or(RegistryError::NotInitialized)?,
        );
        self.current.send_replace(snapshot.clone());
        Ok(snapshot)
    }

    /// Rebuild the registry from the durable log.
    pub async fn replay(&self) -> Result<RegistrySnapshot> {
        let log = self.store.log().await?;
        replay(&log)
    }

    /// Replay the log and compare it against the stored snapshot.
    pub async fn verify(&self) -> Result<RegistrySnapshot> {
        let replayed = self.replay().await?;
        let stored = self
            .store
            .load()
            .await?
            .ok_or(RegistryError::NotInitialized)?;
        if replayed != stored {
            return Err(RegistryError::ReplayMismatch(format!(
                "log replays to version {}, snapshot is version {}",
                replayed.version, stored.version
            )));
        }
        Ok(replayed)
    }

    /// Durable log entries, oldest first.
    pub async fn history(&self) -> Result<Vec<LogEntry>> {
        self.store.log().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqliteRegistryStore;
    use capstore_core::ConnectionInfo;

    fn shard(id: &str) -> ShardDescriptor {
        ShardDescriptor::new(
            id,
            ConnectionInfo::new(format!("memory://{}", id)),
            ShardRole::Provisioning,
        )
    }

    async fn registry() -> ShardRegistry {
        let store = Arc::new(SqliteRegistryStore::new_in_memory().await.unwrap());
        ShardRegistry::bootstrap(store, shard("shard-0001")).await.unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_forces_write_target() {
        let registry = registry().await;
        let snap = registry.snapshot();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.write_target().unwrap().id, "shard-0001");
    }

    #[tokio::test]
    async fn test_empty_mutation_keeps_version() {
        let registry = registry().await;
        let snap = registry.mutate(|_| Ok(())).await.unwrap();
        assert_eq!(snap.version, 1);

        // Setting the role a shard already has records nothing.
        let snap = registry
            .mutate(|txn| txn.set_role("shard-0001", ShardRole::WriteTarget))
            .await
            .unwrap();
        assert_eq!(snap.version, 1);
    }

    #[tokio::test]
    async fn test_invalid_mutation_not_committed() {
        let registry = registry().await;

        let err = registry
            .mutate(|txn| {
                txn.record(RegistryEvent::ShardAppended {
                    shard: ShardDescriptor::new(
                        "shard-0002",
                        ConnectionInfo::new("memory://shard-0002"),
                        ShardRole::WriteTarget,
                    ),
                    demoted: None,
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvariantViolation(_)));
        assert_eq!(registry.version(), 1);
        assert_eq!(registry.history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_closure_propagates() {
        let registry = registry().await;
        let err = registry
            .mutate(|_| Err(RegistryError::Rejected("stale request".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_subscribers_see_commits() {
        let registry = registry().await;
        let mut rx = registry.subscribe();

        registry
            .mutate(|txn| txn.append_write_target(shard("shard-0002")))
            .await
            .unwrap();

        rx.changed().await.unwrap();
        let seen = rx.borrow().clone();
        assert_eq!(seen.version, 2);
        assert_eq!(seen.write_target().unwrap().id, "shard-0002");
        assert_eq!(seen.get("shard-0001").unwrap().role, ShardRole::ReadOnly);
    }

    #[tokio::test]
    async fn test_open_requires_bootstrap() {
        let store = Arc::new(SqliteRegistryStore::new_in_memory().await.unwrap());
        assert!(matches!(
            ShardRegistry::open(store).await,
            Err(RegistryError::NotInitialized)
        ));
    }
}
