//! Revocation cascade
//!
//! Tears down everything derived from a deleted tenant: secret paths,
//! storage prefix grants and the database tenancy unit. Each step is
//! idempotent, so the whole cascade can be re-run until it reports clean.

use crate::{SecretPathAllocator, TenantRegistry};
use enclave_core::{EnclaveResult, RevocationEvent, TenancyError, Tenant, TenantId};
use enclave_storage::{DatabaseCatalog, ObjectStoreGrants};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

// ============================================================================
// STEPS AND REPORTS
// ============================================================================

/// One teardown step, executed in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationStep {
    RevokeSecrets,
    RevokeStorageAccess,
    DropTenancyUnit,
}

impl RevocationStep {
    pub const ALL: [RevocationStep; 3] = [
        RevocationStep::RevokeSecrets,
        RevocationStep::RevokeStorageAccess,
        RevocationStep::DropTenancyUnit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationStep::RevokeSecrets => "revoke_secrets",
            RevocationStep::RevokeStorageAccess => "revoke_storage_access",
            RevocationStep::DropTenancyUnit => "drop_tenancy_unit",
        }
    }
}

impl fmt::Display for RevocationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Removed this many resources.
    Revoked(usize),
    /// Nothing left to remove.
    AlreadyDone,
}

impl StepOutcome {
    fn from_count(count: usize) -> Self {
        if count == 0 {
            StepOutcome::AlreadyDone
        } else {
            StepOutcome::Revoked(count)
        }
    }
}

/// Outcome of a successful cascade run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevocationReport {
    pub tenant_id: TenantId,
    pub steps: Vec<(RevocationStep, StepOutcome)>,
}

impl RevocationReport {
    /// Whether every step found nothing to do.
    pub fn was_noop(&self) -> bool {
        self.steps
            .iter()
            .all(|(_, outcome)| *outcome == StepOutcome::AlreadyDone)
    }
}

// ============================================================================
// CASCADE
// ============================================================================

/// Runs teardown for deleted tenants.
#[derive(Clone)]
pub struct RevocationCascade {
    registry: TenantRegistry,
    secrets: SecretPathAllocator,
    objects: Arc<dyn ObjectStoreGrants>,
    database: Arc<dyn DatabaseCatalog>,
}

impl RevocationCascade {
    pub fn new(
        registry: TenantRegistry,
        secrets: SecretPathAllocator,
        objects: Arc<dyn ObjectStoreGrants>,
        database: Arc<dyn DatabaseCatalog>,
    ) -> Self {
        Self {
            registry,
            secrets,
            objects,
            database,
        }
    }

    async fn deleted_tenant(&self, tenant_id: &TenantId) -> EnclaveResult<Tenant> {
        let tenant = self.registry.lookup(tenant_id).await?;
        if !tenant.is_deleted() {
            return Err(TenancyError::NotDeleted {
                tenant_id: tenant.tenant_id,
                state: tenant.state,
            }
            .into());
        }
        Ok(tenant)
    }

    async fn run_step(&self, step: RevocationStep, tenant_id: &TenantId) -> EnclaveResult<StepOutcome> {
        let naming = self.secrets.naming();
        let count = match step {
            RevocationStep::RevokeSecrets => self.secrets.revoke(tenant_id).await?,
            RevocationStep::RevokeStorageAccess => {
                self.objects
                    .revoke_prefix(&naming.storage_prefix(tenant_id))
                    .await?
            }
            RevocationStep::DropTenancyUnit => {
                usize::from(self.database.schema_drop(&naming.tenancy_unit(tenant_id)).await?)
            }
        };
        Ok(StepOutcome::from_count(count))
    }

    /// Execute every step for a deleted tenant.
    ///
    /// A failing step does not stop the later ones; the error lists every
    /// step that failed so the retry knows what remains.
    pub async fn run(&self, tenant_id: &TenantId) -> EnclaveResult<RevocationReport> {
        self.deleted_tenant(tenant_id).await?;

        let mut steps = Vec::with_capacity(RevocationStep::ALL.len());
        let mut failed_steps = Vec::new();
        for step in RevocationStep::ALL {
            match self.run_step(step, tenant_id).await {
                Ok(outcome) => {
                    tracing::debug!(tenant_id = %tenant_id, %step, ?outcome, "Revocation step finished");
                    steps.push((step, outcome));
                }
                Err(e) => {
                    tracing::error!(tenant_id = %tenant_id, %step, error = %e, "Revocation step failed");
                    failed_steps.push(step.as_str().to_string());
                }
            }
        }

        if !failed_steps.is_empty() {
            return Err(TenancyError::RevocationIncomplete {
                tenant_id: tenant_id.clone(),
                failed_steps,
            }
            .into());
        }

        tracing::info!(tenant_id = %tenant_id, "Revocation cascade completed");
        Ok(RevocationReport {
            tenant_id: tenant_id.clone(),
            steps,
        })
    }

    /// Steps whose resources still exist for `tenant_id`.
    pub async fn remaining(&self, tenant_id: &TenantId) -> EnclaveResult<Vec<RevocationStep>> {
        let naming = self.secrets.naming();
        let mut remaining = Vec::new();
        if !self.secrets.bindings(tenant_id).await?.is_empty() {
            remaining.push(RevocationStep::RevokeSecrets);
        }
        if !self
            .objects
            .grants_for_prefix(&naming.storage_prefix(tenant_id))
            .await?
            .is_empty()
        {
            remaining.push(RevocationStep::RevokeStorageAccess);
        }
        if self
            .database
            .schema_exists(&naming.tenancy_unit(tenant_id))
            .await?
        {
            remaining.push(RevocationStep::DropTenancyUnit);
        }
        Ok(remaining)
    }

    /// Confirm nothing derived from the tenant remains and record it.
    pub async fn verify(&self, tenant_id: &TenantId) -> EnclaveResult<Tenant> {
        self.deleted_tenant(tenant_id).await?;
        let remaining = self.remaining(tenant_id).await?;
        if !remaining.is_empty() {
            tracing::warn!(tenant_id = %tenant_id, ?remaining, "Revocation verification failed");
            return Err(TenancyError::RevocationIncomplete {
                tenant_id: tenant_id.clone(),
                failed_steps: remaining.iter().map(|s| s.as_str().to_string()).collect(),
            }
            .into());
        }
        self.registry.mark_revocation_verified(tenant_id).await
    }

    /// Run then verify.
    pub async fn run_and_verify(&self, tenant_id: &TenantId) -> EnclaveResult<RevocationReport> {
        let report = self.run(tenant_id).await?;
        self.verify(tenant_id).await?;
        Ok(report)
    }
}

// ============================================================================
// WORKER
// ============================================================================

/// Counters for the revocation worker.
#[derive(Debug, Default)]
pub struct RevocationMetrics {
    pub events_received: AtomicU64,
    pub cascades_completed: AtomicU64,
    pub cascades_failed: AtomicU64,
    pub events_lagged: AtomicU64,
}

/// Point-in-time copy of [`RevocationMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RevocationMetricsSnapshot {
    pub events_received: u64,
    pub cascades_completed: u64,
    pub cascades_failed: u64,
    pub events_lagged: u64,
}

impl RevocationMetrics {
    pub fn snapshot(&self) -> RevocationMetricsSnapshot {
        RevocationMetricsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            cascades_completed: self.cascades_completed.load(Ordering::Relaxed),
            cascades_failed: self.cascades_failed.load(Ordering::Relaxed),
            events_lagged: self.events_lagged.load(Ordering::Relaxed),
        }
    }
}

/// Consume revocation events and run the cascade for each.
///
/// Pending events are drained before a shutdown signal is honoured. Failed
/// cascades are logged and counted; re-marking the tenant deleted
/// re-broadcasts the event for a retry.
pub async fn revocation_worker(
    cascade: RevocationCascade,
    mut events: broadcast::Receiver<RevocationEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<RevocationMetrics> {
    let metrics = Arc::new(RevocationMetrics::default());
    tracing::info!("Revocation worker started");

    loop {
        tokio::select! {
            biased;

            received = events.recv() => match received {
                Ok(event) => {
                    metrics.events_received.fetch_add(1, Ordering::Relaxed);
                    handle_event(&cascade, &event, &metrics).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    metrics.events_lagged.fetch_add(skipped, Ordering::Relaxed);
                    tracing::warn!(skipped, "Revocation worker lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Revocation event channel closed");
                    break;
                }
            },

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Revocation worker shutting down");
                    break;
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        events_received = snapshot.events_received,
        cascades_completed = snapshot.cascades_completed,
        cascades_failed = snapshot.cascades_failed,
        events_lagged = snapshot.events_lagged,
        "Revocation worker stopped"
    );
    metrics
}

async fn handle_event(cascade: &RevocationCascade, event: &RevocationEvent, metrics: &RevocationMetrics) {
    match cascade.run_and_verify(&event.tenant_id).await {
        Ok(_) => {
            metrics.cascades_completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            metrics.cascades_failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                tenant_id = %event.tenant_id,
                event_id = %event.event_id,
                error = %e,
                retryable = e.is_retryable(),
                "Revocation cascade failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_core::{AccessLevel, EnclaveConfig, EnclaveError, IntegrationName, NamingConvention};
    use enclave_storage::{MemoryDatabase, MemoryObjectStore, MemoryTenantStore, MemoryVault};

    fn t(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    fn i(s: &str) -> IntegrationName {
        IntegrationName::parse(s).unwrap()
    }

    struct Fixture {
        registry: TenantRegistry,
        secrets: SecretPathAllocator,
        vault: Arc<MemoryVault>,
        objects: Arc<MemoryObjectStore>,
        database: Arc<MemoryDatabase>,
        cascade: RevocationCascade,
    }

    async fn provisioned(tenant: &str) -> Fixture {
        let config = EnclaveConfig::default();
        let registry = TenantRegistry::new(Arc::new(MemoryTenantStore::new()));
        let vault = Arc::new(MemoryVault::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let database = Arc::new(MemoryDatabase::new(config.tenant_setting.clone()));
        let secrets =
            SecretPathAllocator::from_config(registry.clone(), vault.clone(), &config).unwrap();
        let cascade = RevocationCascade::new(
            registry.clone(),
            secrets.clone(),
            objects.clone(),
            database.clone(),
        );

        let naming = NamingConvention::default();
        let id = t(tenant);
        registry.register(id.clone(), tenant).await.unwrap();
        secrets.allocate(&id, &i("gmail")).await.unwrap();
        secrets.allocate(&id, &i("hubspot")).await.unwrap();
        objects
            .grant_prefix("role-butler", &naming.storage_prefix(&id), AccessLevel::ReadWrite)
            .await
            .unwrap();
        database.schema_create(&naming.tenancy_unit(&id)).await.unwrap();

        Fixture {
            registry,
            secrets,
            vault,
            objects,
            database,
            cascade,
        }
    }

    #[tokio::test]
    async fn test_cascade_requires_deleted_tenant() {
        let f = provisioned("acme").await;
        let err = f.cascade.run(&t("acme")).await.unwrap_err();
        assert!(matches!(err, EnclaveError::Tenancy(TenancyError::NotDeleted { .. })));
        assert_eq!(f.vault.binding_count().await, 2);
    }

    #[tokio::test]
    async fn test_cascade_removes_everything() {
        let f = provisioned("acme").await;
        f.registry.mark_deleted(&t("acme")).await.unwrap();
        let report = f.cascade.run(&t("acme")).await.unwrap();
        assert_eq!(
            report.steps,
            vec![
                (RevocationStep::RevokeSecrets, StepOutcome::Revoked(2)),
                (RevocationStep::RevokeStorageAccess, StepOutcome::Revoked(1)),
                (RevocationStep::DropTenancyUnit, StepOutcome::Revoked(1)),
            ]
        );
        let tenant = f.cascade.verify(&t("acme")).await.unwrap();
        assert!(tenant.revocation_verified_at.is_some());
        assert_eq!(f.objects.grant_count().await, 0);
    }

    #[tokio::test]
    async fn test_double_teardown_is_noop() {
        let f = provisioned("acme").await;
        f.registry.mark_deleted(&t("acme")).await.unwrap();
        f.cascade.run_and_verify(&t("acme")).await.unwrap();
        let second = f.cascade.run(&t("acme")).await.unwrap();
        assert!(second.was_noop());
        assert!(f.cascade.verify(&t("acme")).await.is_ok());
    }

    #[tokio::test]
    async fn test_deleted_tenant_cannot_reclaim_paths() {
        let f = provisioned("acme").await;
        f.registry.mark_deleted(&t("acme")).await.unwrap();
        f.cascade.run_and_verify(&t("acme")).await.unwrap();

        let err = f.secrets.allocate(&t("acme"), &i("gmail")).await.unwrap_err();
        assert!(matches!(err, EnclaveError::Tenancy(TenancyError::TenantInactive { .. })));
        assert_eq!(f.vault.binding_count().await, 0);
        assert!(f.cascade.verify(&t("acme")).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_step_reported_and_others_attempted() {
        let f = provisioned("acme").await;
        f.registry.mark_deleted(&t("acme")).await.unwrap();
        f.vault.faults().fail("binding_delete_prefix");

        let err = f.cascade.run(&t("acme")).await.unwrap_err();
        assert_eq!(
            err,
            EnclaveError::Tenancy(TenancyError::RevocationIncomplete {
                tenant_id: t("acme"),
                failed_steps: vec!["revoke_secrets".to_string()],
            })
        );
        assert!(err.is_retryable());
        // later steps still ran
        assert_eq!(f.objects.grant_count().await, 0);
        assert!(!f
            .database
            .schema_exists(&NamingConvention::default().tenancy_unit(&t("acme")))
            .await
            .unwrap());

        assert!(f.cascade.verify(&t("acme")).await.is_err());
        assert!(f.registry.lookup(&t("acme")).await.unwrap().revocation_verified_at.is_none());

        f.vault.faults().heal();
        let retry = f.cascade.run_and_verify(&t("acme")).await.unwrap();
        assert_eq!(retry.steps[0], (RevocationStep::RevokeSecrets, StepOutcome::Revoked(2)));
        assert_eq!(retry.steps[1].1, StepOutcome::AlreadyDone);
    }

    #[tokio::test]
    async fn test_cascade_leaves_other_tenants_alone() {
        let f = provisioned("acme").await;
        f.registry.register(t("acme-co"), "Acme Co").await.unwrap();
        f.secrets.allocate(&t("acme-co"), &i("gmail")).await.unwrap();

        f.registry.mark_deleted(&t("acme")).await.unwrap();
        f.cascade.run(&t("acme")).await.unwrap();
        assert_eq!(f.secrets.bindings(&t("acme-co")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_runs_cascade_on_event() {
        let f = provisioned("acme").await;
        let events = f.registry.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(revocation_worker(f.cascade.clone(), events, shutdown_rx));

        f.registry.mark_deleted(&t("acme")).await.unwrap();
        shutdown_tx.send(true).unwrap();
        let metrics = worker.await.unwrap().snapshot();

        assert_eq!(metrics.events_received, 1);
        assert_eq!(metrics.cascades_completed, 1);
        assert_eq!(f.vault.binding_count().await, 0);
        let tenant = f.registry.lookup(&t("acme")).await.unwrap();
        assert!(tenant.revocation_verified_at.is_some());
    }
}
