//! Capacity Monitor
//!
//! Keeps every shard's capacity snapshot fresh and detects when the write target
//! crosses the high-water mark.
//!
//! ## One refresh
//!
//! 1. Take a registry snapshot and probe every shard except `PROVISIONING`
//!    concurrently, each probe (open + usage) under its own timeout.
//!    `UNREACHABLE` shards are probed too so they can recover.
//! 2. Count consecutive failures per shard; at the configured limit the shard
//!    is marked `UNREACHABLE`.
//! 3. Commit all capacity updates and role transitions as ONE registry version.
//! 4. Evaluate the edge trigger on the committed write target and, on a
//!    below → at/above transition, send exactly one [`ProvisionRequest`].
//! 5. If the committed version has no write target at all (the last one was
//!    marked `UNREACHABLE`), send one write-target-lost request.
//!
//! ## Edge trigger
//!
//! The trigger remembers which shard it last evaluated and whether it was above
//! the mark. A write target it has not seen before (freshly promoted, or first
//! observation after process start) counts as "below", so the first at/above
//! observation fires. A sustained over-threshold condition never re-fires.
//! Only fresh observations are evaluated; a failed probe leaves the state as is.
//! A request that could not be queued (provisioner backlog full) leaves the
//! trigger armed, so the next observation raises it again.
//!
//! ## Recovery
//!
//! A recovered shard becomes `READ_ONLY`, unless it is now the newest reachable
//! shard, in which case it takes `WRITE_TARGET` back.

use crate::error::{AgentError, Result};
use crate::events::ShardEvent;
use crate::provisioner::ProvisionRequest;
use capstore_backend::{BackendError, ConnectionCache, ShardAllocator};
use capstore_core::{now_ms, CapacitySnapshot, MonitorConfig, ShardDescriptor, ShardRole};
use capstore_registry::{RegistrySnapshot, RegistryTxn, ShardRegistry};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Outcome of one [`CapacityMonitor::refresh`].
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    /// Registry version after the refresh was committed.
    pub version: u64,
    pub observed: Vec<(String, CapacitySnapshot)>,
    /// Shards whose probe failed, with the error.
    pub failed: Vec<(String, String)>,
    pub newly_unreachable: Vec<String>,
    pub recovered: Vec<String>,
    /// Set when this refresh observed a high-water mark crossing.
    pub crossing: Option<ProvisionRequest>,
    /// Set when this refresh found no write target and asked for a new one.
    pub write_target_lost: Option<ProvisionRequest>,
}

#[derive(Default)]
struct MonitorState {
    consecutive_failures: HashMap<String, u32>,
    trigger_shard: Option<String>,
    trigger_above: bool,
    // A write-target-lost request is queued for the current outage.
    lost_target_raised: bool,
}

pub struct CapacityMonitor {
    registry: Arc<ShardRegistry>,
    connections: ConnectionCache,
    config: MonitorConfig,
    events: broadcast::Sender<ShardEvent>,
    requests: RwLock<Option<mpsc::Sender<ProvisionRequest>>>,
    // Held for a whole refresh, so refreshes never interleave.
    state: Mutex<MonitorState>,
}

impl CapacityMonitor {
    pub fn new(
        registry: Arc<ShardRegistry>,
        allocator: Arc<dyn ShardAllocator>,
        config: MonitorConfig,
        events: broadcast::Sender<ShardEvent>,
    ) -> Self {
        Self {
            registry,
            connections: ConnectionCache::new(allocator),
            config,
            events,
            requests: RwLock::new(None),
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Route crossing requests to a provisioner task (`None` detaches).
    pub async fn set_provisioning_channel(&self, tx: Option<mpsc::Sender<ProvisionRequest>>) {
        *self.requests.write().await = tx;
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Consecutive failed probes recorded for a shard.
    pub async fn failure_count(&self, shard_id: &str) -> u32 {
        self.state
            .lock()
            .await
            .consecutive_failures
            .get(shard_id)
            .copied()
            .unwrap_or(0)
    }

    /// Probe every shard once and commit the results.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let mut state = self.state.lock().await;
        let before = self.registry.snapshot();

        let targets: Vec<&ShardDescriptor> = before
            .shards
            .iter()
            .filter(|s| s.role != ShardRole::Provisioning)
            .collect();
        let outcomes = join_all(targets.iter().map(|s| self.probe(s))).await;

        let mut observed = Vec::new();
        let mut failed = Vec::new();
        let mut escalate = Vec::new();

        for (shard, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Ok(capacity) => {
                    state.consecutive_failures.remove(&shard.id);
                    observed.push((shard.id.clone(), capacity));
                }
                Err(e) => {
                    self.connections.evict(&shard.id).await;
                    let count = state
                        .consecutive_failures
                        .entry(shard.id.clone())
                        .or_insert(0);
                    *count += 1;

                    warn!(
                        shard_id = %shard.id,
                        error = %e,
                        consecutive_failures = *count,
                        "Shard probe failed"
                    );

                    if *count >= self.config.unreachable_after_failures
                        && shard.role != ShardRole::Unreachable
                    {
                        escalate.push(shard.id.clone());
                    }
                    failed.push((shard.id.clone(), e.to_string()));
                }
            }
        }

        let committed = self
            .registry
            .mutate(|txn| apply_observations(txn, &observed, &escalate))
            .await?;

        let mut report = RefreshReport {
            version: committed.version,
            observed,
            failed,
            ..Default::default()
        };

        for (shard_id, capacity) in &report.observed {
            let _ = self.events.send(ShardEvent::CapacityObserved {
                shard_id: shard_id.clone(),
                capacity: *capacity,
            });
        }

        for shard in &committed.shards {
            let was = before.get(&shard.id).map(|s| s.role);
            match (was, shard.role) {
                (Some(prev), ShardRole::Unreachable) if prev != ShardRole::Unreachable => {
                    let failures = state
                        .consecutive_failures
                        .get(&shard.id)
                        .copied()
                        .unwrap_or(0);
                    error!(
                        shard_id = %shard.id,
                        previous_role = %prev,
                        consecutive_failures = failures,
                        "Shard marked UNREACHABLE"
                    );
                    let _ = self.events.send(ShardEvent::ShardUnreachable {
                        shard_id: shard.id.clone(),
                        consecutive_failures: failures,
                    });
                    report.newly_unreachable.push(shard.id.clone());
                }
                (Some(ShardRole::Unreachable), role) if role != ShardRole::Unreachable => {
                    info!(shard_id = %shard.id, role = %role, "Shard recovered");
                    let _ = self.events.send(ShardEvent::ShardRecovered {
                        shard_id: shard.id.clone(),
                        role,
                    });
                    report.recovered.push(shard.id.clone());
                }
                _ => {}
            }
        }

        report.crossing = self.evaluate_trigger(&mut state, &committed, &report.observed);
        if let Some(request) = &report.crossing {
            if !self.dispatch(request.clone()).await {
                state.trigger_above = false;
            }
        }

        report.write_target_lost = self.evaluate_lost_target(&mut state, &before, &committed);
        if let Some(request) = &report.write_target_lost {
            state.lost_target_raised = self.dispatch(request.clone()).await;
        }

        debug!(
            version = report.version,
            observed = report.observed.len(),
            failed = report.failed.len(),
            "Capacity refresh complete"
        );

        Ok(report)
    }

    async fn probe(&self, shard: &ShardDescriptor) -> Result<CapacitySnapshot> {
        let timeout = self.config.probe_timeout();
        let probe = async {
            let backend = self.connections.get(shard).await?;
            backend.usage().await
        };

        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(usage)) => {
                let capacity =
                    CapacitySnapshot::from_usage(usage.used_bytes, usage.total_bytes, now_ms());
                debug!(
                    shard_id = %shard.id,
                    used_bytes = capacity.used_bytes,
                    percent_used = capacity.percent_used,
                    "Probed shard usage"
                );
                Ok(capacity)
            }
            Ok(Err(e)) => Err(probe_failure(&shard.id, e)),
            Err(_) => Err(AgentError::ProbeTimeout {
                shard_id: shard.id.clone(),
                timeout_ms: self.config.probe_timeout_ms,
            }),
        }
    }

    fn evaluate_trigger(
        &self,
        state: &mut MonitorState,
        committed: &RegistrySnapshot,
        observed: &[(String, CapacitySnapshot)],
    ) -> Option<ProvisionRequest> {
        let target = committed.write_target()?;
        let capacity = observed
            .iter()
            .find(|(id, _)| *id == target.id)
            .map(|(_, c)| *c)?;

        let was_above =
            state.trigger_shard.as_deref() == Some(target.id.as_str()) && state.trigger_above;
        let above = capacity.is_at_or_above(self.config.high_water_mark_percent);

        state.trigger_shard = Some(target.id.clone());
        state.trigger_above = above;

        if above && !was_above {
            info!(
                shard_id = %target.id,
                percent_used = capacity.percent_used,
                high_water_mark = self.config.high_water_mark_percent,
                "Write target crossed high-water mark"
            );
            let _ = self.events.send(ShardEvent::HighWaterMarkCrossed {
                shard_id: target.id.clone(),
                percent_used: capacity.percent_used,
            });
            Some(ProvisionRequest::high_water_mark(
                target.id.clone(),
                capacity.percent_used,
            ))
        } else {
            None
        }
    }

    /// One request per outage: re-armed once a write target exists again.
    fn evaluate_lost_target(
        &self,
        state: &mut MonitorState,
        before: &RegistrySnapshot,
        committed: &RegistrySnapshot,
    ) -> Option<ProvisionRequest> {
        if committed.write_target().is_some() {
            state.lost_target_raised = false;
            return None;
        }
        if state.lost_target_raised {
            return None;
        }

        let lost = before.write_target().map(|s| s.id.clone()).or_else(|| {
            committed
                .shards
                .iter()
                .rev()
                .find(|s| s.role == ShardRole::Unreachable)
                .map(|s| s.id.clone())
        });
        warn!(
            lost_write_target = ?lost,
            version = committed.version,
            "Registry has no write target, requesting provisioning"
        );
        let _ = self.events.send(ShardEvent::WriteTargetLost {
            shard_id: lost.clone(),
        });
        Some(ProvisionRequest::write_target_lost(lost))
    }

    /// Queue a request for the provisioner. `false` when it could not be
    /// queued; with no provisioner attached the request is only reported.
    async fn dispatch(&self, request: ProvisionRequest) -> bool {
        let requests = self.requests.read().await;
        let Some(tx) = requests.as_ref() else {
            debug!("No provisioner attached, request reported only");
            return true;
        };
        match tx.try_send(request) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Could not queue provisioning request, will raise it again");
                false
            }
        }
    }

    /// Refresh on the configured interval until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            high_water_mark = self.config.high_water_mark_percent,
            "Capacity monitor started"
        );

        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut refresh_count: u64 = 0;
        let mut failure_count: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Capacity monitor received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    match self.refresh().await {
                        Ok(report) => {
                            refresh_count += 1;
                            failure_count = 0;
                            debug!(version = report.version, refresh_count, "Refresh committed");
                        }
                        Err(e) => {
                            failure_count += 1;
                            error!(error = %e, failure_count, "Capacity refresh failed");
                            if failure_count >= self.config.stale_warning_after_failures {
                                warn!(
                                    failure_count,
                                    "Multiple consecutive refresh failures - capacity data is going stale"
                                );
                            }
                        }
                    }
                }
            }
        }

        info!(total_refreshes = refresh_count, "Capacity monitor stopped");
    }
}

fn probe_failure(shard_id: &str, e: BackendError) -> AgentError {
    AgentError::ProbeFailure {
        shard_id: shard_id.to_string(),
        message: e.to_string(),
    }
}

/// Fold one refresh's observations into a registry transaction.
fn apply_observations(
    txn: &mut RegistryTxn,
    observed: &[(String, CapacitySnapshot)],
    escalate: &[String],
) -> capstore_registry::Result<()> {
    for (shard_id, capacity) in observed {
        let Some(role) = txn.state().get(shard_id).map(|s| s.role) else {
            continue;
        };
        txn.record_capacity(shard_id, *capacity)?;

        if role == ShardRole::Unreachable {
            txn.set_role(shard_id, ShardRole::ReadOnly)?;
            let newest = txn.state().newest_reachable().map(|s| s.id.clone());
            if newest.as_deref() == Some(shard_id.as_str()) {
                if let Some(current) = txn.state().write_target().map(|s| s.id.clone()) {
                    txn.set_role(&current, ShardRole::ReadOnly)?;
                }
                txn.set_role(shard_id, ShardRole::WriteTarget)?;
            }
        }
    }

    for shard_id in escalate {
        if txn.state().get(shard_id).is_some() {
            txn.set_role(shard_id, ShardRole::Unreachable)?;
        }
    }
    Ok(())
}
