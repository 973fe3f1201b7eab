//! Command handlers.

use crate::format::Formatter;
use anyhow::{anyhow, bail, Context, Result};
use capstore_agent::{CapacityMonitor, ProvisionOutcome, ShardCoordinator, ShardEvent};
use capstore_backend::{ShardAllocator, ShardBackend, SqliteAllocator};
use capstore_core::{
    now_ms, ApplicantRecord, CapacitySnapshot, CapstoreConfig, RecordQuery, ShardDescriptor,
    ShardRole,
};
use capstore_registry::{RegistryStore, ShardRegistry, SqliteRegistryStore};
use capstore_router::QueryRouter;
use clap::Args;
use std::sync::Arc;
use tokio::sync::broadcast;

const FIRST_SHARD_ID: &str = "shard-0001";

/// Record fields accepted by `put` and `update`.
#[derive(Args, Debug, Default)]
pub struct RecordFields {
    /// Applicant name
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub email: Option<String>,
    #[arg(long)]
    pub phone: Option<String>,
    /// Link to the uploaded resume
    #[arg(long)]
    pub resume_link: Option<String>,
    /// User creating the record
    #[arg(long)]
    pub created_by: Option<String>,
    /// Application form answers as a JSON object
    #[arg(long)]
    pub form_data: Option<String>,
    #[arg(long)]
    pub can_edit: Option<bool>,
}

impl RecordFields {
    fn apply(self, mut record: ApplicantRecord) -> Result<ApplicantRecord> {
        if let Some(name) = self.name {
            record.name = name;
        }
        if let Some(email) = self.email {
            record.email = Some(email);
        }
        if let Some(phone) = self.phone {
            record.phone = Some(phone);
        }
        if let Some(link) = self.resume_link {
            record.resume_link = Some(link);
        }
        if let Some(user) = self.created_by {
            record.created_by = Some(user);
        }
        if let Some(form_data) = self.form_data {
            record.form_data =
                serde_json::from_str(&form_data).context("--form-data must be valid JSON")?;
        }
        if let Some(can_edit) = self.can_edit {
            record.can_edit = can_edit;
        }
        Ok(record)
    }
}

fn allocator(config: &CapstoreConfig) -> Arc<SqliteAllocator> {
    Arc::new(SqliteAllocator::new(
        config.data_dir.clone(),
        config.shard_quota_bytes,
    ))
}

async fn registry_store(config: &CapstoreConfig) -> Result<Arc<SqliteRegistryStore>> {
    let store = SqliteRegistryStore::new(&config.registry_path)
        .await
        .with_context(|| {
            format!(
                "Failed to open registry at {}",
                config.registry_path.display()
            )
        })?;
    Ok(Arc::new(store))
}

async fn open_registry(config: &CapstoreConfig) -> Result<Arc<ShardRegistry>> {
    let store = registry_store(config).await?;
    let registry = ShardRegistry::open(store)
        .await
        .context("Registry not initialized, run `capstore init` first")?
        .with_config(&config.registry);
    Ok(Arc::new(registry))
}

async fn open_router(config: &CapstoreConfig) -> Result<QueryRouter> {
    let registry = open_registry(config).await?;
    Ok(QueryRouter::new(
        registry,
        allocator(config),
        config.router.clone(),
    ))
}

pub async fn init(config: &CapstoreConfig, out: &Formatter) -> Result<()> {
    let store = registry_store(config).await?;
    if let Some(existing) = store.load().await? {
        out.print_info(&format!(
            "Registry already initialized (version {}, {} shard(s))",
            existing.version,
            existing.len()
        ));
        return Ok(());
    }

    let allocator = allocator(config);
    let info = allocator
        .allocate(FIRST_SHARD_ID)
        .await
        .with_context(|| format!("Failed to allocate {}", FIRST_SHARD_ID))?;

    let backend = allocator.open(FIRST_SHARD_ID, &info).await?;
    backend
        .apply_schema()
        .await
        .context("Failed to apply schema to the first shard")?;
    let usage = backend.usage().await?;

    let shard = ShardDescriptor::new(FIRST_SHARD_ID, info, ShardRole::WriteTarget).with_capacity(
        CapacitySnapshot::from_usage(usage.used_bytes, usage.total_bytes, now_ms()),
    );
    let registry = ShardRegistry::bootstrap(store, shard).await?;

    out.print_success(&format!(
        "Initialized registry at version {} with {}",
        registry.version(),
        FIRST_SHARD_ID
    ));
    Ok(())
}

pub async fn run(config: &CapstoreConfig) -> Result<()> {
    let registry = open_registry(config).await?;
    let coordinator = ShardCoordinator::new(registry, allocator(config), config);
    let mut events = coordinator.subscribe();

    coordinator.start().await?;
    tracing::info!(
        poll_interval_ms = config.monitor.poll_interval_ms,
        high_water_mark = config.monitor.high_water_mark_percent,
        "capstore running, press Ctrl+C to stop"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            result = &mut shutdown => {
                result.context("Failed to listen for Ctrl+C")?;
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    coordinator.stop().await?;
    Ok(())
}

fn log_event(event: &ShardEvent) {
    let body = serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event));
    match event {
        ShardEvent::ProvisioningFailed { .. } | ShardEvent::WriteTargetLost { .. } => {
            tracing::error!(event = %body, "Shard event")
        }
        ShardEvent::ShardUnreachable { .. } | ShardEvent::HighWaterMarkCrossed { .. } => {
            tracing::warn!(event = %body, "Shard event")
        }
        ShardEvent::CapacityObserved { .. } => tracing::debug!(event = %body, "Shard event"),
        _ => tracing::info!(event = %body, "Shard event"),
    }
}

pub async fn status(config: &CapstoreConfig, out: &Formatter) -> Result<()> {
    let registry = open_registry(config).await?;
    let snapshot = registry.snapshot();
    out.print_registry(&snapshot, config.monitor.high_water_mark_percent)?;

    if !out.is_json() && snapshot.write_target().is_none() {
        out.print_warning("No write target: writes fail until `capstore provision` succeeds");
    }
    Ok(())
}

pub async fn refresh(config: &CapstoreConfig, out: &Formatter) -> Result<()> {
    let registry = open_registry(config).await?;
    let (events, _) = broadcast::channel(config.event_capacity.max(1));
    let monitor = CapacityMonitor::new(
        registry,
        allocator(config),
        config.monitor.clone(),
        events,
    );

    let report = monitor.refresh().await?;
    out.print_refresh(&report)?;

    if out.is_json() {
        return Ok(());
    }
    if report.crossing.is_some() {
        out.print_warning(&format!(
            "Write target is at or above the {}% high-water mark; run `capstore provision`",
            config.monitor.high_water_mark_percent
        ));
    }
    if report.write_target_lost.is_some() {
        out.print_warning("Registry has no write target; run `capstore provision`");
    }
    Ok(())
}

pub async fn provision(config: &CapstoreConfig, out: &Formatter) -> Result<()> {
    let registry = open_registry(config).await?;
    let coordinator = ShardCoordinator::new(registry, allocator(config), config);

    match coordinator
        .request_provisioning()
        .await
        .context("Provisioning failed")?
    {
        ProvisionOutcome::Provisioned {
            shard_id,
            demoted,
            version,
        } => {
            out.print_success(&format!(
                "{} is the new write target (version {})",
                shard_id, version
            ));
            if let Some(demoted) = demoted {
                out.print_info(&format!("{} demoted to READ_ONLY", demoted));
            }
        }
        ProvisionOutcome::Skipped { reason } => out.print_info(&format!("Skipped: {}", reason)),
    }
    Ok(())
}

pub async fn replay(config: &CapstoreConfig, out: &Formatter) -> Result<()> {
    let registry = open_registry(config).await?;
    let history = registry.history().await?;
    let rebuilt = registry
        .verify()
        .await
        .context("Registry log does not reproduce the stored snapshot")?;

    out.print_success(&format!(
        "Replayed {} log entries: version {} with {} shard(s) matches the stored snapshot",
        history.len(),
        rebuilt.version,
        rebuilt.len()
    ));
    Ok(())
}

pub async fn put(
    config: &CapstoreConfig,
    out: &Formatter,
    id: Option<String>,
    fields: RecordFields,
) -> Result<()> {
    let router = open_router(config).await?;
    let name = fields
        .name
        .clone()
        .ok_or_else(|| anyhow!("--name is required"))?;

    let id = match id {
        Some(id) => id,
        None => router
            .next_candidate_id()
            .await
            .context("Failed to assign a candidate id")?,
    };

    let record = fields.apply(ApplicantRecord::new(id, name, now_ms()))?;
    let receipt = router.write(&record).await?;

    if out.is_json() {
        return out.print_json(&receipt);
    }
    out.print_success(&format!(
        "Stored {} on {} (registry version {}, {} attempt(s))",
        receipt.candidate_id, receipt.shard_id, receipt.version, receipt.attempts
    ));
    Ok(())
}

pub async fn update(
    config: &CapstoreConfig,
    out: &Formatter,
    id: String,
    fields: RecordFields,
) -> Result<()> {
    let router = open_router(config).await?;

    let current = router.read_by_key(&id).await;
    let Some(row) = current.rows.into_iter().next() else {
        if current.partial {
            bail!(
                "{} not found, unreachable shards: {}",
                id,
                current.unreachable_shards.join(", ")
            );
        }
        bail!("{} not found", id);
    };

    let mut record = fields.apply(row.record)?;
    record.updated_at = now_ms();
    let receipt = router.update(&record).await?;

    if out.is_json() {
        return out.print_json(&receipt);
    }
    out.print_success(&format!(
        "Updated {} on {}",
        receipt.candidate_id, receipt.shard_id
    ));
    Ok(())
}

pub async fn get(config: &CapstoreConfig, out: &Formatter, id: &str) -> Result<()> {
    let router = open_router(config).await?;
    let result = router.read_by_key(id).await;

    out.print_record_detail(&result)?;
    if out.is_json() {
        return Ok(());
    }
    if result.is_empty() && !result.partial {
        bail!("{} not found", id);
    }
    Ok(())
}

pub fn build_query(
    email: Option<String>,
    name: Option<String>,
    created_by: Option<String>,
) -> RecordQuery {
    match (email, name, created_by) {
        (Some(email), _, _) => RecordQuery::ByEmail(email),
        (_, Some(name), _) => RecordQuery::NameContains(name),
        (_, _, Some(user)) => RecordQuery::CreatedBy(user),
        _ => RecordQuery::All,
    }
}

pub async fn query(config: &CapstoreConfig, out: &Formatter, query: RecordQuery) -> Result<()> {
    let router = open_router(config).await?;
    let result = router.read(&query).await;
    out.print_read_result(&result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_query_prefers_first_filter() {
        assert_eq!(build_query(None, None, None), RecordQuery::All);
        assert_eq!(
            build_query(Some("a@x.io".into()), None, None),
            RecordQuery::ByEmail("a@x.io".into())
        );
        assert_eq!(
            build_query(None, Some("ada".into()), None),
            RecordQuery::NameContains("ada".into())
        );
        assert_eq!(
            build_query(None, None, Some("hr".into())),
            RecordQuery::CreatedBy("hr".into())
        );
    }

    #[test]
    fn test_record_fields_apply() {
        let fields = RecordFields {
            phone: Some("+1-555-0100".into()),
            form_data: Some(r#"{"position":"engineer"}"#.into()),
            can_edit: Some(true),
            ..Default::default()
        };
        let record = fields
            .apply(ApplicantRecord::new("CAND-0001", "Ada", 1))
            .unwrap();
        assert_eq!(record.name, "Ada");
        assert_eq!(record.phone.as_deref(), Some("+1-555-0100"));
        assert_eq!(record.form_data["position"], "engineer");
        assert!(record.can_edit);
    }

    #[test]
    fn test_record_fields_reject_bad_json() {
        let fields = RecordFields {
            form_data: Some("not json".into()),
            ..Default::default()
        };
        assert!(fields
            .apply(ApplicantRecord::new("CAND-0001", "Ada", 1))
            .is_err());
    }
}
