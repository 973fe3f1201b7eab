//! Shard Provisioner
//!
//! Brings a new shard online and hands write traffic to it:
//!
//! ```text
//! allocate ──► open ──► apply schema ──► verify version ──► probe usage ──► registry append
//!    │           │            │                 │                │        (new WRITE_TARGET,
//!    └───────────┴────────────┴─────────────────┴────────────────┘         old → READ_ONLY)
//!                        any failure: discard the partial store
//! ```
//!
//! Nothing is registered until the schema is in place, so the router never sees
//! a shard it cannot write to. If every attempt fails the previous write target
//! keeps its role and keeps taking writes.
//!
//! Only one provisioning runs at a time; a concurrent call fails fast with
//! [`AgentError::ProvisioningInProgress`].

use crate::error::{AgentError, Result};
use crate::events::ShardEvent;
use capstore_backend::{BackendError, ShardAllocator, SCHEMA_VERSION};
use capstore_core::{now_ms, CapacitySnapshot, ConnectionInfo, ProvisionerConfig, ShardDescriptor, ShardRole};
use capstore_registry::{RegistryError, RegistrySnapshot, ShardRegistry};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Why provisioning was requested.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionTrigger {
    HighWaterMark { percent_used: f64 },
    /// The write target was marked `UNREACHABLE` and nothing replaced it.
    WriteTargetLost,
    Operator,
}

/// A request is stale, and dropped, once the condition it was raised for is
/// gone: a high-water request when its shard is no longer the write target, a
/// write-target-lost request once any write target exists. Operator requests
/// never go stale.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRequest {
    /// Write target the request was raised for, if known.
    pub raised_for: Option<String>,
    pub trigger: ProvisionTrigger,
    pub requested_at: i64,
}

impl ProvisionRequest {
    pub fn high_water_mark(shard_id: impl Into<String>, percent_used: f64) -> Self {
        Self {
            raised_for: Some(shard_id.into()),
            trigger: ProvisionTrigger::HighWaterMark { percent_used },
            requested_at: now_ms(),
        }
    }

    /// The registry has no write target; `lost` is the shard that had the role.
    pub fn write_target_lost(lost: Option<String>) -> Self {
        Self {
            raised_for: lost,
            trigger: ProvisionTrigger::WriteTargetLost,
            requested_at: now_ms(),
        }
    }

    /// Explicit retry trigger from an operator.
    pub fn operator() -> Self {
        Self {
            raised_for: None,
            trigger: ProvisionTrigger::Operator,
            requested_at: now_ms(),
        }
    }

    fn is_stale(&self, snapshot: &RegistrySnapshot) -> bool {
        let current = snapshot.write_target().map(|s| s.id.as_str());
        match self.trigger {
            ProvisionTrigger::HighWaterMark { .. } => current != self.raised_for.as_deref(),
            ProvisionTrigger::WriteTargetLost => current.is_some(),
            ProvisionTrigger::Operator => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionOutcome {
    Provisioned {
        shard_id: String,
        demoted: Option<String>,
        version: u64,
    },
    /// The request was stale; nothing was created.
    Skipped { reason: String },
}

/// Clears the in-progress flag when provisioning ends, however it ends.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ShardProvisioner {
    registry: Arc<ShardRegistry>,
    allocator: Arc<dyn ShardAllocator>,
    config: ProvisionerConfig,
    events: broadcast::Sender<ShardEvent>,
    in_progress: AtomicBool,
}

impl ShardProvisioner {
    pub fn new(
        registry: Arc<ShardRegistry>,
        allocator: Arc<dyn ShardAllocator>,
        config: ProvisionerConfig,
        events: broadcast::Sender<ShardEvent>,
    ) -> Self {
        Self {
            registry,
            allocator,
            config,
            events,
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Provision one new write target for `request`.
    pub async fn provision(&self, request: ProvisionRequest) -> Result<ProvisionOutcome> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(AgentError::ProvisioningInProgress);
        }
        let _guard = InProgress(&self.in_progress);

        if request.is_stale(&self.registry.snapshot()) {
            return Ok(self.skip(&request));
        }

        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut taken: HashSet<String> = HashSet::new();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let shard_id = next_free_id(&self.registry.snapshot(), &taken);
            info!(shard_id = %shard_id, attempt, "Provisioning new shard");
            let _ = self.events.send(ShardEvent::ProvisioningStarted {
                shard_id: shard_id.clone(),
                attempt,
            });

            match self.attempt(&shard_id, &request).await {
                Ok(outcome) => {
                    if let ProvisionOutcome::Provisioned {
                        shard_id,
                        demoted,
                        version,
                    } = &outcome
                    {
                        let duration_ms = started.elapsed().as_millis() as u64;
                        info!(
                            shard_id = %shard_id,
                            demoted = ?demoted,
                            version,
                            duration_ms,
                            "Shard provisioned and promoted to write target"
                        );
                        let _ = self.events.send(ShardEvent::ProvisioningCompleted {
                            shard_id: shard_id.clone(),
                            demoted: demoted.clone(),
                            version: *version,
                            duration_ms,
                        });
                    }
                    return Ok(outcome);
                }
                Err(e) => {
                    if matches!(e, AgentError::Backend(BackendError::AlreadyExists(_))) {
                        taken.insert(shard_id.clone());
                    }
                    warn!(
                        shard_id = %shard_id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Provisioning attempt failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.config.retry_backoff() * attempt).await;
            }
        }

        error!(
            attempts = max_attempts,
            error = %last_error,
            "Provisioning failed, previous write target keeps its role"
        );
        let _ = self.events.send(ShardEvent::ProvisioningFailed {
            attempts: max_attempts,
            reason: last_error.clone(),
        });
        Err(AgentError::ProvisioningFailure {
            attempts: max_attempts,
            message: last_error,
        })
    }

    /// One allocate → register attempt. Discards the store on any failure.
    async fn attempt(&self, shard_id: &str, request: &ProvisionRequest) -> Result<ProvisionOutcome> {
        let info = self.allocator.allocate(shard_id).await?;

        let capacity = match self.prepare(shard_id, &info).await {
            Ok(capacity) => capacity,
            Err(e) => {
                self.discard(shard_id, &info).await;
                return Err(e.into());
            }
        };

        let descriptor = ShardDescriptor::new(shard_id, info.clone(), ShardRole::WriteTarget)
            .with_capacity(capacity);
        let previous = self.registry.snapshot().write_target().map(|s| s.id.clone());

        let committed = self
            .registry
            .mutate(|txn| {
                if request.is_stale(txn.state()) {
                    return Err(RegistryError::Rejected(
                        "write target changed while provisioning".to_string(),
                    ));
                }
                txn.append_write_target(descriptor.clone())
            })
            .await;

        match committed {
            Ok(snapshot) => {
                let demoted = previous
                    .filter(|id| snapshot.get(id).map(|s| s.role) == Some(ShardRole::ReadOnly));
                Ok(ProvisionOutcome::Provisioned {
                    shard_id: shard_id.to_string(),
                    demoted,
                    version: snapshot.version,
                })
            }
            Err(RegistryError::Rejected(reason)) => {
                self.discard(shard_id, &info).await;
                Ok(self.skip_with(reason))
            }
            Err(e) => {
                self.discard(shard_id, &info).await;
                Err(e.into())
            }
        }
    }

    /// Open the new store, apply and verify the schema, take a first usage reading.
    async fn prepare(&self, shard_id: &str, info: &ConnectionInfo) -> capstore_backend::Result<CapacitySnapshot> {
        let backend = self.allocator.open(shard_id, info).await?;
        backend.apply_schema().await?;

        match backend.schema_version().await? {
            Some(v) if v == SCHEMA_VERSION => {}
            other => {
                return Err(BackendError::Schema(format!(
                    "expected schema version {}, found {:?}",
                    SCHEMA_VERSION, other
                )))
            }
        }

        let usage = backend.usage().await?;
        debug!(shard_id = %shard_id, used_bytes = usage.used_bytes, "New shard schema applied");
        Ok(CapacitySnapshot::from_usage(
            usage.used_bytes,
            usage.total_bytes,
            now_ms(),
        ))
    }

    async fn discard(&self, shard_id: &str, info: &ConnectionInfo) {
        if let Err(e) = self.allocator.discard(info).await {
            warn!(shard_id = %shard_id, error = %e, "Could not discard partial shard store");
        } else {
            debug!(shard_id = %shard_id, "Discarded partial shard store");
        }
    }

    fn skip(&self, request: &ProvisionRequest) -> ProvisionOutcome {
        self.skip_with(format!(
            "{:?} request raised for {:?} is stale",
            request.trigger, request.raised_for
        ))
    }

    fn skip_with(&self, reason: String) -> ProvisionOutcome {
        info!(reason = %reason, "Provisioning request skipped");
        ProvisionOutcome::Skipped { reason }
    }

    /// Serve provisioning requests until `shutdown` flips or the channel closes.
    pub async fn run(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<ProvisionRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(max_attempts = self.config.max_attempts, "Shard provisioner started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Shard provisioner received shutdown signal");
                    break;
                }
                request = requests.recv() => {
                    let Some(request) = request else {
                        debug!("Provisioning channel closed");
                        break;
                    };
                    match self.provision(request).await {
                        Ok(outcome) => debug!(outcome = ?outcome, "Provisioning request handled"),
                        Err(e) => error!(error = %e, "Provisioning request failed"),
                    }
                }
            }
        }

        info!("Shard provisioner stopped");
    }
}

/// Next `shard-NNNN` id not in the registry and not already found taken.
fn next_free_id(snapshot: &RegistrySnapshot, taken: &HashSet<String>) -> String {
    let mut n = snapshot.len() + 1;
    loop {
        let id = format!("shard-{:04}", n);
        if snapshot.get(&id).is_none() && !taken.contains(&id) {
            return id;
        }
        n += 1;
    }
}
