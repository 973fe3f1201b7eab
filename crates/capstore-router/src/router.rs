//! QueryRouter: decides where writes go and how reads are merged.
//!
//! ## Routing Rules
//!
//! - New records go to the single `WRITE_TARGET` of the current snapshot.
//! - Updates go to the record's home shard, wherever it is. A record never moves.
//! - Reads fan out to every readable shard and concatenate the rows in registry
//!   order. A key lives on exactly one shard, so there is nothing to deduplicate.
//!
//! ## Failure Semantics
//!
//! Reads never fail because of a single shard. Shards that are skipped, fail or
//! time out are listed in [`ReadResult::unreachable_shards`] and the result is
//! marked `partial`, so "no matches" stays distinguishable from "some shards did
//! not answer".
//!
//! Writes retry with [`RetryPolicy`] while there is no write target or the
//! target is briefly unavailable, then fail loudly. Storage-full and
//! duplicate-key errors are never retried.
//!
//! ## Home-Shard Cache
//!
//! Each successful write or keyed lookup remembers which shard holds the key,
//! up to `home_cache_capacity` entries. The cache is a hint only: a miss on the cached shard falls back to a full
//! fan-out.

use crate::error::{Result, RouterError};
use crate::retry::RetryPolicy;
use capstore_backend::{BackendError, ConnectionCache, ShardAllocator, ShardBackend};
use capstore_core::{
    format_candidate_id, ApplicantRecord, RecordQuery, RouterConfig, ShardDescriptor,
    CANDIDATE_ID_PREFIX,
};
use capstore_registry::{RegistrySnapshot, ShardRegistry};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// A row tagged with the shard it was read from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutedRecord {
    pub shard_id: String,
    pub record: ApplicantRecord,
}

/// Result of a fan-out read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResult {
    pub rows: Vec<RoutedRecord>,
    /// True when at least one shard did not contribute.
    pub partial: bool,
    pub unreachable_shards: Vec<String>,
    /// Registry version the read was routed with.
    pub version: u64,
}

impl ReadResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &ApplicantRecord> {
        self.rows.iter().map(|row| &row.record)
    }
}

/// Where a write landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReceipt {
    pub candidate_id: String,
    pub shard_id: String,
    pub version: u64,
    pub attempts: u32,
}

/// Why one write attempt did not land.
#[derive(Debug)]
enum AttemptFailure {
    NoWriteTarget,
    Timeout { shard_id: String, timeout_ms: u64 },
    Transient { shard_id: String, message: String },
}

impl AttemptFailure {
    fn into_error(self, attempts: u32) -> RouterError {
        match self {
            AttemptFailure::NoWriteTarget => RouterError::NoWriteTarget { attempts },
            AttemptFailure::Timeout {
                shard_id,
                timeout_ms,
            } => RouterError::RouterTimeout {
                shard_id,
                timeout_ms,
            },
            AttemptFailure::Transient { shard_id, message } => RouterError::WriteFailed {
                attempts,
                message: format!("{}: {}", shard_id, message),
            },
        }
    }
}

enum AttemptOutcome {
    Landed(String),
    Failed(AttemptFailure),
}

/// Where a key was found during a fan-out lookup.
struct KeyLookup {
    home: Option<(String, ApplicantRecord)>,
    unreachable: Vec<String>,
}

pub struct QueryRouter {
    registry: Arc<ShardRegistry>,
    connections: ConnectionCache,
    config: RouterConfig,
    retry: RetryPolicy,
    homes: RwLock<HashMap<String, String>>,
}

impl QueryRouter {
    pub fn new(
        registry: Arc<ShardRegistry>,
        allocator: Arc<dyn ShardAllocator>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            connections: ConnectionCache::new(allocator),
            retry: RetryPolicy::from_config(&config),
            config,
            homes: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Shard last seen holding `key`, if remembered.
    pub async fn cached_home(&self, key: &str) -> Option<String> {
        self.homes.read().await.get(key).cloned()
    }

    /// Persist a new record on the current write target.
    ///
    /// The key must not exist on any shard. While no write target exists the
    /// call waits for the registry to commit one, within the retry budget.
    pub async fn write(&self, record: &ApplicantRecord) -> Result<WriteReceipt> {
        let key = record.key();

        let lookup = self.lookup_key(&self.registry.snapshot(), key).await;
        if let Some((shard_id, _)) = lookup.home {
            self.remember_home(key, &shard_id).await;
            return Err(RouterError::DuplicateKey {
                key: key.to_string(),
                shard_id,
            });
        }
        if !lookup.unreachable.is_empty() {
            tracing::warn!(
                key = %key,
                unreachable = ?lookup.unreachable,
                "Uniqueness check could not reach every shard"
            );
        }

        let mut watcher = self.registry.subscribe();
        // Shard where an earlier attempt timed out and may still have committed.
        let mut in_doubt: Option<String> = None;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let snapshot = watcher.borrow_and_update().clone();

            let failure = match self.attempt_write(&snapshot, record, &mut in_doubt).await? {
                AttemptOutcome::Landed(shard_id) => {
                    self.remember_home(key, &shard_id).await;
                    if attempts > 1 {
                        tracing::info!(
                            key = %key,
                            shard_id = %shard_id,
                            attempts,
                            "Write succeeded after retry"
                        );
                    } else {
                        tracing::debug!(key = %key, shard_id = %shard_id, "Record written");
                    }
                    return Ok(WriteReceipt {
                        candidate_id: key.to_string(),
                        shard_id,
                        version: snapshot.version,
                        attempts,
                    });
                }
                AttemptOutcome::Failed(failure) => failure,
            };

            if !self.retry.allows_retry(attempts) {
                tracing::error!(
                    key = %key,
                    attempts,
                    failure = ?failure,
                    "Write retries exhausted"
                );
                return Err(failure.into_error(attempts));
            }

            let backoff = self.retry.backoff(attempts - 1);
            match failure {
                AttemptFailure::NoWriteTarget => {
                    tracing::debug!(
                        key = %key,
                        version = snapshot.version,
                        wait_ms = backoff.as_millis() as u64,
                        "No write target, waiting for registry change"
                    );
                    // Wakes early when a new version commits.
                    let _ = tokio::time::timeout(backoff, watcher.changed()).await;
                }
                failure => {
                    tracing::warn!(
                        key = %key,
                        attempt = attempts,
                        failure = ?failure,
                        backoff_ms = backoff.as_millis() as u64,
                        "Write attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn attempt_write(
        &self,
        snapshot: &RegistrySnapshot,
        record: &ApplicantRecord,
        in_doubt: &mut Option<String>,
    ) -> Result<AttemptOutcome> {
        let key = record.key();
        let Some(target) = snapshot.write_target() else {
            return Ok(AttemptOutcome::Failed(AttemptFailure::NoWriteTarget));
        };

        if let Some(doubtful) = in_doubt.take() {
            let lookup = self.lookup_key(snapshot, key).await;
            match lookup.home {
                Some((shard_id, stored)) if stored == *record => {
                    return Ok(AttemptOutcome::Landed(shard_id));
                }
                Some((shard_id, _)) => {
                    return Err(RouterError::DuplicateKey {
                        key: key.to_string(),
                        shard_id,
                    });
                }
                None if doubtful != target.id && lookup.unreachable.contains(&doubtful) => {
                    // Writing elsewhere could give the key a second home.
                    let failure = AttemptFailure::Transient {
                        shard_id: doubtful.clone(),
                        message: "outcome of an earlier attempt is unknown".to_string(),
                    };
                    *in_doubt = Some(doubtful);
                    return Ok(AttemptOutcome::Failed(failure));
                }
                None => {}
            }
        }

        let inserted = self
            .call_shard(target, self.config.write_timeout(), |backend| async move {
                backend.insert(record).await
            })
            .await;

        match inserted {
            Ok(()) => Ok(AttemptOutcome::Landed(target.id.clone())),
            Err(RouterError::Backend(BackendError::DuplicateKey(_))) => {
                Err(RouterError::DuplicateKey {
                    key: key.to_string(),
                    shard_id: target.id.clone(),
                })
            }
            Err(RouterError::Backend(BackendError::StorageFull(message))) => {
                tracing::error!(
                    shard_id = %target.id,
                    key = %key,
                    error = %message,
                    "Write target is out of storage"
                );
                Err(RouterError::StorageFull {
                    shard_id: target.id.clone(),
                    message,
                })
            }
            Err(RouterError::Backend(e)) if e.is_transient() => {
                Ok(AttemptOutcome::Failed(AttemptFailure::Transient {
                    shard_id: target.id.clone(),
                    message: e.to_string(),
                }))
            }
            Err(RouterError::RouterTimeout {
                shard_id,
                timeout_ms,
            }) => {
                *in_doubt = Some(shard_id.clone());
                Ok(AttemptOutcome::Failed(AttemptFailure::Timeout {
                    shard_id,
                    timeout_ms,
                }))
            }
            Err(e) => Err(e),
        }
    }

    /// Replace an existing record on its home shard.
    ///
    /// Not retried; a caller sees the first failure.
    pub async fn update(&self, record: &ApplicantRecord) -> Result<WriteReceipt> {
        let snapshot = self.registry.snapshot();
        let key = record.key();
        let home = self.locate_home(&snapshot, key).await?;

        let updated = self
            .call_shard(&home, self.config.write_timeout(), |backend| async move {
                backend.update(record).await
            })
            .await;

        match updated {
            Ok(()) => {
                tracing::debug!(key = %key, shard_id = %home.id, "Record updated");
                Ok(WriteReceipt {
                    candidate_id: key.to_string(),
                    shard_id: home.id,
                    version: snapshot.version,
                    attempts: 1,
                })
            }
            Err(RouterError::Backend(BackendError::NotFound(_))) => {
                self.forget_home(key).await;
                Err(RouterError::NotFound(key.to_string()))
            }
            Err(RouterError::Backend(BackendError::StorageFull(message))) => {
                Err(RouterError::StorageFull {
                    shard_id: home.id,
                    message,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Fan a query out to every readable shard.
    pub async fn read(&self, query: &RecordQuery) -> ReadResult {
        let snapshot = self.registry.snapshot();
        self.read_with(&snapshot, query).await
    }

    /// Look up one key, trying its cached home shard before a full fan-out.
    pub async fn read_by_key(&self, key: &str) -> ReadResult {
        let snapshot = self.registry.snapshot();

        if let Some(home) = self.cached_home_in(&snapshot, key).await {
            let hit = self
                .call_shard(&home, self.config.read_timeout(), |backend| async move {
                    backend.get(key).await
                })
                .await;

            match hit {
                Ok(Some(record)) => {
                    return ReadResult {
                        rows: vec![RoutedRecord {
                            shard_id: home.id,
                            record,
                        }],
                        partial: false,
                        unreachable_shards: Vec::new(),
                        version: snapshot.version,
                    };
                }
                Ok(None) => {
                    tracing::debug!(key = %key, shard_id = %home.id, "Stale home-shard hint");
                    self.forget_home(key).await;
                }
                Err(e) => {
                    tracing::warn!(
                        key = %key,
                        shard_id = %home.id,
                        error = %e,
                        "Cached home shard failed, falling back to fan-out"
                    );
                }
            }
        }

        let result = self
            .read_with(&snapshot, &RecordQuery::ByKey(key.to_string()))
            .await;
        if let Some(row) = result.rows.first() {
            self.remember_home(key, &row.shard_id).await;
        }
        result
    }

    /// Next free `CAND-NNNN` id: highest sequence on any shard plus one.
    ///
    /// Every shard must answer; otherwise an unseen higher id could be reused.
    pub async fn next_candidate_id(&self) -> Result<String> {
        let snapshot = self.registry.snapshot();
        let outcomes = self
            .fan_out(&snapshot, |backend| async move {
                backend.max_key_sequence(CANDIDATE_ID_PREFIX).await
            })
            .await;

        let mut highest = 0u64;
        let mut unreachable = Vec::new();
        for (shard, outcome) in outcomes {
            match outcome {
                Some(Ok(max)) => highest = highest.max(max.unwrap_or(0)),
                Some(Err(e)) => {
                    tracing::warn!(shard_id = %shard.id, error = %e, "Key-space scan failed");
                    unreachable.push(shard.id.clone());
                }
                None => unreachable.push(shard.id.clone()),
            }
        }

        if !unreachable.is_empty() {
            return Err(RouterError::IncompleteKeySpace { unreachable });
        }
        Ok(format_candidate_id(highest + 1))
    }

    async fn read_with(&self, snapshot: &RegistrySnapshot, query: &RecordQuery) -> ReadResult {
        let outcomes = self
            .fan_out(snapshot, |backend| async move { backend.query(query).await })
            .await;

        let mut rows = Vec::new();
        let mut unreachable_shards = Vec::new();
        for (shard, outcome) in outcomes {
            match outcome {
                Some(Ok(records)) => {
                    rows.extend(records.into_iter().map(|record| RoutedRecord {
                        shard_id: shard.id.clone(),
                        record,
                    }));
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        shard_id = %shard.id,
                        error = %e,
                        "Shard did not answer fan-out read"
                    );
                    unreachable_shards.push(shard.id.clone());
                }
                None => unreachable_shards.push(shard.id.clone()),
            }
        }

        let partial = !unreachable_shards.is_empty();
        tracing::debug!(
            version = snapshot.version,
            rows = rows.len(),
            partial,
            "Fan-out read complete"
        );

        ReadResult {
            rows,
            partial,
            unreachable_shards,
            version: snapshot.version,
        }
    }

    async fn locate_home(&self, snapshot: &RegistrySnapshot, key: &str) -> Result<ShardDescriptor> {
        if let Some(home) = self.cached_home_in(snapshot, key).await {
            let hit = self
                .call_shard(&home, self.config.read_timeout(), |backend| async move {
                    backend.get(key).await
                })
                .await;
            match hit {
                Ok(Some(_)) => return Ok(home),
                Ok(None) => self.forget_home(key).await,
                Err(e) => {
                    tracing::debug!(shard_id = %home.id, error = %e, "Cached home lookup failed")
                }
            }
        }

        let lookup = self.lookup_key(snapshot, key).await;
        match lookup.home {
            Some((shard_id, _)) => {
                self.remember_home(key, &shard_id).await;
                snapshot
                    .get(&shard_id)
                    .cloned()
                    .ok_or_else(|| RouterError::NotFound(key.to_string()))
            }
            None if lookup.unreachable.is_empty() => Err(RouterError::NotFound(key.to_string())),
            None => Err(RouterError::HomeUnavailable {
                key: key.to_string(),
                unreachable: lookup.unreachable,
            }),
        }
    }

    async fn lookup_key(&self, snapshot: &RegistrySnapshot, key: &str) -> KeyLookup {
        let outcomes = self
            .fan_out(snapshot, |backend| async move { backend.get(key).await })
            .await;

        let mut lookup = KeyLookup {
            home: None,
            unreachable: Vec::new(),
        };
        for (shard, outcome) in outcomes {
            match outcome {
                Some(Ok(Some(record))) => {
                    if lookup.home.is_none() {
                        lookup.home = Some((shard.id.clone(), record));
                    } else {
                        tracing::error!(key = %key, shard_id = %shard.id, "Key found on more than one shard");
                    }
                }
                Some(Ok(None)) => {}
                Some(Err(_)) | None => lookup.unreachable.push(shard.id.clone()),
            }
        }
        lookup
    }

    /// Run `op` against every readable shard concurrently, in registry order.
    /// `None` marks a shard skipped because of its role.
    async fn fan_out<'s, T, F, Fut>(
        &self,
        snapshot: &'s RegistrySnapshot,
        op: F,
    ) -> Vec<(&'s ShardDescriptor, Option<Result<T>>)>
    where
        F: Fn(Arc<dyn ShardBackend>) -> Fut,
        Fut: Future<Output = capstore_backend::Result<T>>,
    {
        let limit = self.config.read_timeout();
        let op = &op;
        let calls = snapshot.shards.iter().map(|shard| async move {
            if !shard.role.is_readable() {
                return (shard, None);
            }
            (shard, Some(self.call_shard(shard, limit, op).await))
        });
        join_all(calls).await
    }

    /// One bounded call on one shard. Connection opening counts against the
    /// timeout; failed sessions are evicted so the next call reopens them.
    async fn call_shard<T, F, Fut>(
        &self,
        shard: &ShardDescriptor,
        limit: Duration,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn ShardBackend>) -> Fut,
        Fut: Future<Output = capstore_backend::Result<T>>,
    {
        let call = async {
            let backend = self.connections.get(shard).await?;
            op(backend).await
        };

        match tokio::time::timeout(limit, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_transient() {
                    self.connections.evict(&shard.id).await;
                }
                Err(e.into())
            }
            Err(_) => {
                self.connections.evict(&shard.id).await;
                Err(RouterError::RouterTimeout {
                    shard_id: shard.id.clone(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    async fn cached_home_in(&self, snapshot: &RegistrySnapshot, key: &str) -> Option<ShardDescriptor> {
        let shard_id = self.cached_home(key).await?;
        snapshot
            .get(&shard_id)
            .filter(|shard| shard.role.is_readable())
            .cloned()
    }

    async fn remember_home(&self, key: &str, shard_id: &str) {
        let mut homes = self.homes.write().await;
        if homes.len() >= self.config.home_cache_capacity && !homes.contains_key(key) {
            homes.clear();
        }
        homes.insert(key.to_string(), shard_id.to_string());
    }

    async fn forget_home(&self, key: &str) {
        self.homes.write().await.remove(key);
    }
}
