//! ShardCoordinator: lifecycle of the monitor and provisioner background tasks.
//!
//! ```text
//!            ┌──────────────────┐  ProvisionRequest (mpsc)  ┌───────────────────┐
//!  interval ─► CapacityMonitor  ├──────────────────────────►│ ShardProvisioner  │
//!            └────────┬─────────┘                           └─────────┬─────────┘
//!                     │ mutate                                        │ mutate
//!                     └────────────────► ShardRegistry ◄──────────────┘
//!                                             │
//!                         ShardEvent (broadcast) ──► operators / logs
//! ```
//!
//! Neither task runs inline with caller requests; the router only ever reads
//! registry snapshots.

use crate::error::{AgentError, Result};
use crate::events::ShardEvent;
use crate::monitor::{CapacityMonitor, RefreshReport};
use crate::provisioner::{ProvisionOutcome, ProvisionRequest, ShardProvisioner};
use capstore_backend::ShardAllocator;
use capstore_core::CapstoreConfig;
use capstore_registry::ShardRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;

pub struct ShardCoordinator {
    registry: Arc<ShardRegistry>,
    monitor: Arc<CapacityMonitor>,
    provisioner: Arc<ShardProvisioner>,
    events: broadcast::Sender<ShardEvent>,
    request_capacity: usize,
    running: AtomicBool,
    shutdown_tx: RwLock<Option<watch::Sender<bool>>>,
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl ShardCoordinator {
    pub fn new(
        registry: Arc<ShardRegistry>,
        allocator: Arc<dyn ShardAllocator>,
        config: &CapstoreConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let monitor = Arc::new(CapacityMonitor::new(
            registry.clone(),
            allocator.clone(),
            config.monitor.clone(),
            events.clone(),
        ));
        let provisioner = Arc::new(ShardProvisioner::new(
            registry.clone(),
            allocator,
            config.provisioner.clone(),
            events.clone(),
        ));

        Self {
            registry,
            monitor,
            provisioner,
            events,
            request_capacity: config.provisioner.request_queue_capacity.max(1),
            running: AtomicBool::new(false),
            shutdown_tx: RwLock::new(None),
            tasks: RwLock::new(Vec::new()),
        }
    }

    /// Spawn the monitor loop and the provisioner task.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyRunning);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (request_tx, request_rx) = mpsc::channel(self.request_capacity);
        self.monitor.set_provisioning_channel(Some(request_tx)).await;

        let provisioner = tokio::spawn(
            self.provisioner
                .clone()
                .run(request_rx, shutdown_rx.clone()),
        );
        let monitor = tokio::spawn(self.monitor.clone().run(shutdown_rx));

        *self.shutdown_tx.write().await = Some(shutdown_tx);
        *self.tasks.write().await = vec![monitor, provisioner];

        tracing::info!(
            version = self.registry.version(),
            "Shard coordinator started"
        );
        Ok(())
    }

    /// Signal both tasks and wait for them to exit.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AgentError::NotRunning);
        }

        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(true);
        }
        self.monitor.set_provisioning_channel(None).await;

        let tasks: Vec<_> = self.tasks.write().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Coordinator task ended abnormally");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Shard coordinator stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one capacity refresh now, outside the polling schedule.
    pub async fn refresh_now(&self) -> Result<RefreshReport> {
        self.monitor.refresh().await
    }

    /// Explicit provisioning trigger, e.g. to retry after a failed attempt.
    pub async fn request_provisioning(&self) -> Result<ProvisionOutcome> {
        self.provisioner.provision(ProvisionRequest::operator()).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShardEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<CapacityMonitor> {
        &self.monitor
    }

    pub fn provisioner(&self) -> &Arc<ShardProvisioner> {
        &self.provisioner
    }
}
