//! Capacity monitoring and provisioning scenarios against in-memory shards.

use capstore_agent::{
    AgentError, CapacityMonitor, ProvisionOutcome, ProvisionRequest, ProvisionTrigger,
    ShardCoordinator, ShardEvent, ShardProvisioner,
};
use capstore_backend::MemoryAllocator;
use capstore_core::{CapstoreConfig, ShardDescriptor, ShardRole};
use capstore_registry::{RegistryEvent, ShardRegistry, SqliteRegistryStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

const QUOTA: u64 = 1_000;

fn test_config() -> CapstoreConfig {
    let mut config = CapstoreConfig::default();
    config.monitor.poll_interval_ms = 20;
    config.monitor.probe_timeout_ms = 100;
    config.monitor.unreachable_after_failures = 2;
    config.provisioner.max_attempts = 3;
    config.provisioner.retry_backoff_ms = 1;
    config
}

/// Registry over in-memory shards; the last id is the write target.
async fn create_registry(
    allocator: &Arc<MemoryAllocator>,
    ids: &[&str],
) -> Arc<ShardRegistry> {
    let store = Arc::new(SqliteRegistryStore::new_in_memory().await.unwrap());

    let (info, _) = allocator.create_ready(ids[0]).await.unwrap();
    let registry = ShardRegistry::bootstrap(
        store,
        ShardDescriptor::new(ids[0], info, ShardRole::WriteTarget),
    )
    .await
    .unwrap();

    for id in &ids[1..] {
        let (info, _) = allocator.create_ready(id).await.unwrap();
        let desc = ShardDescriptor::new(*id, info, ShardRole::WriteTarget);
        registry
            .mutate(|txn| txn.append_write_target(desc.clone()))
            .await
            .unwrap();
    }

    Arc::new(registry)
}

fn monitor_with_channel(
    registry: &Arc<ShardRegistry>,
    allocator: &Arc<MemoryAllocator>,
    config: &CapstoreConfig,
) -> (Arc<CapacityMonitor>, broadcast::Sender<ShardEvent>) {
    let (events, _) = broadcast::channel(64);
    let monitor = Arc::new(CapacityMonitor::new(
        registry.clone(),
        allocator.clone(),
        config.monitor.clone(),
        events.clone(),
    ));
    (monitor, events)
}

#[tokio::test]
async fn test_89_then_91_triggers_exactly_one_provisioning_request() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001"]).await;
    let config = test_config();
    let (monitor, _events) = monitor_with_channel(&registry, &allocator, &config);

    let (tx, mut rx) = mpsc::channel(8);
    monitor.set_provisioning_channel(Some(tx)).await;

    let shard = allocator.shard("shard-0001").unwrap();

    shard.set_used_bytes(890);
    let report = monitor.refresh().await.unwrap();
    assert!(report.crossing.is_none());
    assert!(rx.try_recv().is_err());

    shard.set_used_bytes(910);
    let report = monitor.refresh().await.unwrap();
    assert!(report.crossing.is_some());
    let request = rx.try_recv().unwrap();
    assert_eq!(request.raised_for.as_deref(), Some("shard-0001"));

    // Still above: level, not edge. No second request.
    shard.set_used_bytes(950);
    let report = monitor.refresh().await.unwrap();
    assert!(report.crossing.is_none());
    assert!(rx.try_recv().is_err());

    // Drop below and cross again: a new edge.
    shard.set_used_bytes(500);
    monitor.refresh().await.unwrap();
    shard.set_used_bytes(900);
    let report = monitor.refresh().await.unwrap();
    assert!(report.crossing.is_some());
    assert!(rx.try_recv().is_ok());
}

#[tokio::test]
async fn test_first_observation_above_mark_fires() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001"]).await;
    let config = test_config();
    let (monitor, _events) = monitor_with_channel(&registry, &allocator, &config);

    allocator.shard("shard-0001").unwrap().set_used_bytes(970);
    let report = monitor.refresh().await.unwrap();

    let crossing = report.crossing.unwrap();
    assert_eq!(crossing.raised_for.as_deref(), Some("shard-0001"));
}

#[tokio::test]
async fn test_refresh_commits_one_version() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001", "shard-0002", "shard-0003"]).await;
    let config = test_config();
    let (monitor, _events) = monitor_with_channel(&registry, &allocator, &config);

    let before = registry.version();
    let report = monitor.refresh().await.unwrap();

    assert_eq!(report.version, before + 1);
    assert_eq!(report.observed.len(), 3);
    let snap = registry.snapshot();
    assert!(snap.shards.iter().all(|s| s.capacity.observed_at > 0));
}

#[tokio::test]
async fn test_coordinator_provisions_after_crossing() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001"]).await;
    let coordinator = ShardCoordinator::new(registry.clone(), allocator.clone(), &test_config());
    let mut events = coordinator.subscribe();

    allocator.shard("shard-0001").unwrap().set_used_bytes(950);
    coordinator.start().await.unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ShardEvent::ProvisioningCompleted { shard_id, demoted, .. }) => {
                    return (shard_id, demoted)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("provisioning did not complete");

    assert_eq!(completed.0, "shard-0002");
    assert_eq!(completed.1.as_deref(), Some("shard-0001"));

    // Let a few more polls run; the full old shard is READ_ONLY now and the
    // new write target is nearly empty, so nothing else is provisioned.
    tokio::time::sleep(Duration::from_millis(150)).await;
    coordinator.stop().await.unwrap();

    assert_eq!(allocator.allocation_count(), 2);

    let snap = registry.snapshot();
    assert_eq!(snap.write_target().unwrap().id, "shard-0002");
    assert_eq!(snap.get("shard-0001").unwrap().role, ShardRole::ReadOnly);

    // Promotion and demotion happened in the same registry version.
    let history = registry.history().await.unwrap();
    let appends: Vec<_> = history
        .iter()
        .filter(|e| {
            e.events
                .iter()
                .any(|ev| matches!(ev, RegistryEvent::ShardAppended { .. }))
        })
        .collect();
    assert_eq!(appends.len(), 1);
    assert!(matches!(
        &appends[0].events[0],
        RegistryEvent::ShardAppended { demoted: Some(d), .. } if d == "shard-0001"
    ));
}

#[tokio::test]
async fn test_provisioning_failure_keeps_old_write_target() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001"]).await;
    let config = test_config();
    let (events, mut rx) = broadcast::channel(64);
    let provisioner = ShardProvisioner::new(
        registry.clone(),
        allocator.clone(),
        config.provisioner.clone(),
        events,
    );

    allocator.fail_next_allocations(3);
    let version = registry.version();

    let err = provisioner
        .provision(ProvisionRequest::high_water_mark("shard-0001", 95.0))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::ProvisioningFailure { attempts: 3, .. }));

    assert_eq!(registry.version(), version);
    assert_eq!(registry.snapshot().write_target().unwrap().id, "shard-0001");

    let mut saw_failed = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, ShardEvent::ProvisioningFailed { attempts: 3, .. }) {
            saw_failed = true;
        }
    }
    assert!(saw_failed);

    // An explicit retry succeeds once the allocator recovers.
    let outcome = provisioner
        .provision(ProvisionRequest::operator())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ProvisionOutcome::Provisioned { ref shard_id, .. } if shard_id == "shard-0002"
    ));
}

#[tokio::test]
async fn test_schema_failure_discards_partial_store() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001"]).await;
    let config = test_config();
    let (events, _) = broadcast::channel(64);
    let provisioner = ShardProvisioner::new(
        registry.clone(),
        allocator.clone(),
        config.provisioner.clone(),
        events,
    );

    allocator.fail_next_schema_applies(1);
    let outcome = provisioner
        .provision(ProvisionRequest::operator())
        .await
        .unwrap();

    assert!(matches!(outcome, ProvisionOutcome::Provisioned { .. }));
    // First attempt allocated and discarded shard-0002; the retry reused the id.
    assert_eq!(allocator.allocation_count(), 2);
    assert_eq!(allocator.shard_ids(), vec!["shard-0001", "shard-0002"]);
    assert_eq!(registry.snapshot().len(), 2);
    assert_eq!(registry.snapshot().write_target().unwrap().id, "shard-0002");
}

#[tokio::test]
async fn test_concurrent_provisioning_is_rejected() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001"]).await;
    let mut config = test_config();
    config.provisioner.retry_backoff_ms = 300;
    let (events, _) = broadcast::channel(64);
    let provisioner = Arc::new(ShardProvisioner::new(
        registry.clone(),
        allocator.clone(),
        config.provisioner.clone(),
        events,
    ));

    // First attempt fails, so the first call sits in its backoff.
    allocator.fail_next_allocations(1);
    let first = {
        let provisioner = provisioner.clone();
        tokio::spawn(async move {
            provisioner
                .provision(ProvisionRequest::high_water_mark("shard-0001", 91.0))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = provisioner
        .provision(ProvisionRequest::high_water_mark("shard-0001", 91.0))
        .await;
    assert!(matches!(second, Err(AgentError::ProvisioningInProgress)));

    let first = first.await.unwrap().unwrap();
    assert!(matches!(first, ProvisionOutcome::Provisioned { .. }));
    assert_eq!(registry.snapshot().len(), 2);
}

#[tokio::test]
async fn test_unreachable_write_target_escalates_and_recovers() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001", "shard-0002"]).await;
    let config = test_config();
    let (monitor, events) = monitor_with_channel(&registry, &allocator, &config);
    let mut rx = events.subscribe();

    let shard = allocator.shard("shard-0002").unwrap();
    shard.set_unavailable(true);

    let report = monitor.refresh().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert!(report.newly_unreachable.is_empty());
    assert_eq!(registry.snapshot().write_target().unwrap().id, "shard-0002");
    assert_eq!(monitor.failure_count("shard-0002").await, 1);

    let report = monitor.refresh().await.unwrap();
    assert_eq!(report.newly_unreachable, vec!["shard-0002".to_string()]);
    let lost = report.write_target_lost.unwrap();
    assert_eq!(lost.trigger, ProvisionTrigger::WriteTargetLost);
    assert_eq!(lost.raised_for.as_deref(), Some("shard-0002"));
    let snap = registry.snapshot();
    assert_eq!(snap.get("shard-0002").unwrap().role, ShardRole::Unreachable);
    // The older shard is never promoted automatically.
    assert!(snap.write_target().is_none());
    assert_eq!(snap.get("shard-0001").unwrap().role, ShardRole::ReadOnly);

    shard.set_unavailable(false);
    let report = monitor.refresh().await.unwrap();
    assert_eq!(report.recovered, vec!["shard-0002".to_string()]);
    assert_eq!(
        registry.snapshot().write_target().unwrap().id,
        "shard-0002"
    );
    assert_eq!(monitor.failure_count("shard-0002").await, 0);

    let mut saw = (false, false);
    while let Ok(event) = rx.try_recv() {
        match event {
            ShardEvent::ShardUnreachable { shard_id, .. } if shard_id == "shard-0002" => saw.0 = true,
            ShardEvent::ShardRecovered { shard_id, role } if shard_id == "shard-0002" => {
                assert_eq!(role, ShardRole::WriteTarget);
                saw.1 = true;
            }
            _ => {}
        }
    }
    assert_eq!(saw, (true, true));
}

#[tokio::test]
async fn test_lost_write_target_queues_one_provisioning_request() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001", "shard-0002"]).await;
    let config = test_config();
    let (monitor, events) = monitor_with_channel(&registry, &allocator, &config);
    let mut event_rx = events.subscribe();

    let (tx, mut rx) = mpsc::channel(8);
    monitor.set_provisioning_channel(Some(tx)).await;

    allocator.shard("shard-0002").unwrap().set_unavailable(true);
    for _ in 0..5 {
        monitor.refresh().await.unwrap();
    }

    let snap = registry.snapshot();
    assert!(snap.write_target().is_none());
    assert_eq!(snap.get("shard-0002").unwrap().role, ShardRole::Unreachable);

    // Exactly one request for the whole outage.
    let request = rx.try_recv().unwrap();
    assert_eq!(request.trigger, ProvisionTrigger::WriteTargetLost);
    assert_eq!(request.raised_for.as_deref(), Some("shard-0002"));
    assert!(rx.try_recv().is_err());

    let mut saw_lost = false;
    while let Ok(event) = event_rx.try_recv() {
        if let ShardEvent::WriteTargetLost { shard_id } = event {
            assert_eq!(shard_id.as_deref(), Some("shard-0002"));
            saw_lost = true;
        }
    }
    assert!(saw_lost);

    // The request is not stale just because there is no write target.
    let (events, _) = broadcast::channel(64);
    let provisioner = ShardProvisioner::new(
        registry.clone(),
        allocator.clone(),
        config.provisioner.clone(),
        events,
    );
    let outcome = provisioner.provision(request).await.unwrap();
    assert!(matches!(
        outcome,
        ProvisionOutcome::Provisioned { ref shard_id, demoted: None, .. } if shard_id == "shard-0003"
    ));
    assert_eq!(registry.snapshot().write_target().unwrap().id, "shard-0003");

    // The old write target comes back as READ_ONLY behind the new one.
    allocator.shard("shard-0002").unwrap().set_unavailable(false);
    let report = monitor.refresh().await.unwrap();
    assert_eq!(report.recovered, vec!["shard-0002".to_string()]);
    assert!(report.write_target_lost.is_none());
    let snap = registry.snapshot();
    assert_eq!(snap.get("shard-0002").unwrap().role, ShardRole::ReadOnly);
    assert_eq!(snap.write_target().unwrap().id, "shard-0003");
}

#[tokio::test]
async fn test_lost_target_request_is_stale_after_recovery() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001", "shard-0002"]).await;
    let config = test_config();
    let (monitor, _events) = monitor_with_channel(&registry, &allocator, &config);

    let shard = allocator.shard("shard-0002").unwrap();
    shard.set_unavailable(true);
    monitor.refresh().await.unwrap();
    let request = monitor.refresh().await.unwrap().write_target_lost.unwrap();

    shard.set_unavailable(false);
    monitor.refresh().await.unwrap();
    assert_eq!(registry.snapshot().write_target().unwrap().id, "shard-0002");

    let (events, _) = broadcast::channel(64);
    let provisioner = ShardProvisioner::new(
        registry.clone(),
        allocator.clone(),
        config.provisioner.clone(),
        events,
    );
    let outcome = provisioner.provision(request).await.unwrap();
    assert!(matches!(outcome, ProvisionOutcome::Skipped { .. }));
    assert_eq!(allocator.allocation_count(), 2);
}

#[tokio::test]
async fn test_coordinator_replaces_unreachable_write_target() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001", "shard-0002"]).await;
    let coordinator = ShardCoordinator::new(registry.clone(), allocator.clone(), &test_config());
    let mut events = coordinator.subscribe();

    allocator.shard("shard-0002").unwrap().set_unavailable(true);
    coordinator.start().await.unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ShardEvent::ProvisioningCompleted { shard_id, demoted, .. }) => {
                    return (shard_id, demoted)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("no write target was provisioned");
    coordinator.stop().await.unwrap();

    assert_eq!(completed, ("shard-0003".to_string(), None));
    let snap = registry.snapshot();
    assert_eq!(snap.write_target().unwrap().id, "shard-0003");
    assert_eq!(snap.get("shard-0002").unwrap().role, ShardRole::Unreachable);
}

#[tokio::test]
async fn test_full_request_queue_keeps_crossing_armed() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001"]).await;
    let config = test_config();
    let (monitor, _events) = monitor_with_channel(&registry, &allocator, &config);

    let (tx, mut rx) = mpsc::channel(1);
    tx.try_send(ProvisionRequest::operator()).unwrap();
    monitor.set_provisioning_channel(Some(tx)).await;

    allocator.shard("shard-0001").unwrap().set_used_bytes(950);
    let report = monitor.refresh().await.unwrap();
    assert!(report.crossing.is_some());

    // Only the request that filled the queue is there.
    assert_eq!(rx.try_recv().unwrap().trigger, ProvisionTrigger::Operator);
    assert!(rx.try_recv().is_err());

    // Still above the mark: the dropped crossing is raised again.
    let report = monitor.refresh().await.unwrap();
    assert!(report.crossing.is_some());
    let request = rx.try_recv().unwrap();
    assert_eq!(request.raised_for.as_deref(), Some("shard-0001"));

    // Queued this time, so the edge is consumed.
    let report = monitor.refresh().await.unwrap();
    assert!(report.crossing.is_none());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_usage_exactly_at_configured_mark_fires() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001"]).await;
    let mut config = test_config();
    config.monitor.high_water_mark_percent = 57.0;
    let (monitor, _events) = monitor_with_channel(&registry, &allocator, &config);

    let shard = allocator.shard("shard-0001").unwrap();
    shard.set_used_bytes(569);
    assert!(monitor.refresh().await.unwrap().crossing.is_none());

    shard.set_used_bytes(570);
    let crossing = monitor.refresh().await.unwrap().crossing.unwrap();
    assert_eq!(crossing.raised_for.as_deref(), Some("shard-0001"));
}

#[tokio::test]
async fn test_recovered_older_shard_is_read_only() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001", "shard-0002"]).await;
    let config = test_config();
    let (monitor, _events) = monitor_with_channel(&registry, &allocator, &config);

    let old = allocator.shard("shard-0001").unwrap();
    old.set_unavailable(true);
    monitor.refresh().await.unwrap();
    monitor.refresh().await.unwrap();
    assert_eq!(
        registry.snapshot().get("shard-0001").unwrap().role,
        ShardRole::Unreachable
    );

    old.set_unavailable(false);
    let report = monitor.refresh().await.unwrap();
    assert_eq!(report.recovered, vec!["shard-0001".to_string()]);

    let snap = registry.snapshot();
    assert_eq!(snap.get("shard-0001").unwrap().role, ShardRole::ReadOnly);
    assert_eq!(snap.write_target().unwrap().id, "shard-0002");
}

#[tokio::test]
async fn test_slow_probe_times_out_without_delaying_others() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001", "shard-0002"]).await;
    let config = test_config();
    let (monitor, _events) = monitor_with_channel(&registry, &allocator, &config);

    allocator
        .shard("shard-0001")
        .unwrap()
        .set_delay(Duration::from_secs(2));

    let started = Instant::now();
    let report = monitor.refresh().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "shard-0001");
    assert!(report.failed[0].1.contains("timed out"));
    assert_eq!(report.observed.len(), 1);
    assert_eq!(report.observed[0].0, "shard-0002");
}

#[tokio::test]
async fn test_coordinator_lifecycle_errors() {
    let allocator = Arc::new(MemoryAllocator::new(QUOTA));
    let registry = create_registry(&allocator, &["shard-0001"]).await;
    let coordinator = ShardCoordinator::new(registry, allocator, &test_config());

    assert!(matches!(coordinator.stop().await, Err(AgentError::NotRunning)));
    coordinator.start().await.unwrap();
    assert!(matches!(
        coordinator.start().await,
        Err(AgentError::AlreadyRunning)
    ));
    coordinator.stop().await.unwrap();
    assert!(!coordinator.is_running());

    // Restartable after a stop.
    coordinator.start().await.unwrap();
    coordinator.stop().await.unwrap();
}
