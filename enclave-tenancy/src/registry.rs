//! Tenant Registry
//!
//! Source of truth for tenant identity and lifecycle. Every other component
//! asks the registry whether a tenant exists and is active before deriving
//! anything from its identifier.

use chrono::Utc;
use enclave_core::{
    EnclaveError, EnclaveResult, LifecycleState, RevocationEvent, TenancyError, Tenant, TenantId,
};
use enclave_storage::TenantStore;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the revocation event channel.
const REVOCATION_CHANNEL_CAPACITY: usize = 256;

/// Registry of tenants backed by a durable [`TenantStore`].
#[derive(Clone)]
pub struct TenantRegistry {
    store: Arc<dyn TenantStore>,
    events: broadcast::Sender<RevocationEvent>,
}

impl TenantRegistry {
    pub fn new(store: Arc<dyn TenantStore>) -> Self {
        let (events, _) = broadcast::channel(REVOCATION_CHANNEL_CAPACITY);
        Self { store, events }
    }

    /// Receive a [`RevocationEvent`] for every tenant marked deleted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RevocationEvent> {
        self.events.subscribe()
    }

    /// Register a new active tenant.
    ///
    /// Fails with `DuplicateTenant` if the identifier exists in any state,
    /// including deleted tombstones.
    pub async fn register(
        &self,
        tenant_id: TenantId,
        display_name: impl Into<String>,
    ) -> EnclaveResult<Tenant> {
        let tenant = Tenant::new(tenant_id, display_name);
        if !self.store.tenant_create_if_absent(&tenant).await? {
            tracing::warn!(tenant_id = %tenant.tenant_id, "Rejected duplicate tenant registration");
            return Err(TenancyError::DuplicateTenant {
                tenant_id: tenant.tenant_id,
            }
            .into());
        }
        tracing::info!(tenant_id = %tenant.tenant_id, "Tenant registered");
        Ok(tenant)
    }

    pub async fn lookup(&self, tenant_id: &TenantId) -> EnclaveResult<Tenant> {
        self.store
            .tenant_get(tenant_id)
            .await?
            .ok_or_else(|| EnclaveError::not_found("tenant", tenant_id.as_str()))
    }

    /// Look up a tenant that must be `Active`.
    pub async fn lookup_active(&self, tenant_id: &TenantId) -> EnclaveResult<Tenant> {
        let tenant = self.lookup(tenant_id).await?;
        if !tenant.is_active() {
            return Err(TenancyError::TenantInactive {
                tenant_id: tenant.tenant_id,
                state: tenant.state,
            }
            .into());
        }
        Ok(tenant)
    }

    pub async fn list(&self) -> EnclaveResult<Vec<Tenant>> {
        self.store.tenant_list().await
    }

    /// Move a tenant to `Deleted` and broadcast a [`RevocationEvent`].
    ///
    /// Calling this on an already-deleted tenant leaves the record untouched
    /// and broadcasts again, so an interrupted teardown can be re-triggered.
    pub async fn mark_deleted(&self, tenant_id: &TenantId) -> EnclaveResult<Tenant> {
        let mut tenant = self.lookup(tenant_id).await?;
        if !tenant.is_deleted() {
            let now = Utc::now();
            tenant.state = LifecycleState::Deleted;
            tenant.deleted_at = Some(now);
            tenant.updated_at = now;
            self.store.tenant_update(&tenant).await?;
            tracing::info!(tenant_id = %tenant_id, "Tenant marked deleted");
        }

        let event = RevocationEvent::new(tenant_id.clone());
        match self.events.send(event) {
            Ok(receivers) => {
                tracing::debug!(tenant_id = %tenant_id, receivers, "Revocation event broadcast")
            }
            Err(_) => {
                tracing::warn!(tenant_id = %tenant_id, "Revocation event has no subscribers")
            }
        }
        Ok(tenant)
    }

    pub async fn suspend(&self, tenant_id: &TenantId) -> EnclaveResult<Tenant> {
        self.transition(tenant_id, LifecycleState::Suspended).await
    }

    pub async fn reactivate(&self, tenant_id: &TenantId) -> EnclaveResult<Tenant> {
        self.transition(tenant_id, LifecycleState::Active).await
    }

    /// Record that teardown of a deleted tenant was verified complete.
    pub async fn mark_revocation_verified(&self, tenant_id: &TenantId) -> EnclaveResult<Tenant> {
        let mut tenant = self.lookup(tenant_id).await?;
        if !tenant.is_deleted() {
            return Err(TenancyError::NotDeleted {
                tenant_id: tenant.tenant_id,
                state: tenant.state,
            }
            .into());
        }
        let now = Utc::now();
        tenant.revocation_verified_at = Some(now);
        tenant.updated_at = now;
        self.store.tenant_update(&tenant).await?;
        tracing::info!(tenant_id = %tenant_id, "Tenant revocation verified");
        Ok(tenant)
    }

    async fn transition(&self, tenant_id: &TenantId, to: LifecycleState) -> EnclaveResult<Tenant> {
        let mut tenant = self.lookup(tenant_id).await?;
        if !tenant.state.can_transition_to(to) {
            return Err(TenancyError::InvalidTransition {
                tenant_id: tenant.tenant_id,
                from: tenant.state,
                to,
            }
            .into());
        }
        let from = tenant.state;
        tenant.state = to;
        tenant.updated_at = Utc::now();
        self.store.tenant_update(&tenant).await?;
        tracing::info!(tenant_id = %tenant_id, %from, %to, "Tenant lifecycle transition");
        Ok(tenant)
    }
}
