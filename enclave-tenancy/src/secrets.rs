//! Secret Path Allocator
//!
//! Assigns every (tenant, integration) pair a stable path in the secret
//! store and owns the path's lifecycle: allocation on connect, value
//! rotation on refresh, removal on disconnect or tenant deletion.
//!
//! Only active tenants can claim or rotate a path. Removal is always
//! allowed, since the revocation cascade runs it for deleted tenants.

use crate::TenantRegistry;
use enclave_core::{
    Capability, CredentialBinding, EnclaveConfig, EnclaveError, EnclaveResult, IntegrationName,
    NamingConvention, SecretPath, TenancyError, TenantId,
};
use enclave_storage::{ClaimOutcome, SecretVault};
use secrecy::SecretString;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Allocates and revokes tenant secret paths.
#[derive(Clone)]
pub struct SecretPathAllocator {
    registry: TenantRegistry,
    vault: Arc<dyn SecretVault>,
    naming: NamingConvention,
    capabilities: BTreeMap<IntegrationName, Capability>,
}

impl SecretPathAllocator {
    pub fn new(
        registry: TenantRegistry,
        vault: Arc<dyn SecretVault>,
        naming: NamingConvention,
    ) -> Self {
        Self {
            registry,
            vault,
            naming,
            capabilities: BTreeMap::new(),
        }
    }

    /// Allocator using the configured namespace and integration capabilities.
    pub fn from_config(
        registry: TenantRegistry,
        vault: Arc<dyn SecretVault>,
        config: &EnclaveConfig,
    ) -> EnclaveResult<Self> {
        Ok(Self {
            registry,
            vault,
            naming: config.naming()?,
            capabilities: config.integration_capabilities.clone(),
        })
    }

    pub fn naming(&self) -> &NamingConvention {
        &self.naming
    }

    fn capability_for(&self, integration: &IntegrationName) -> Capability {
        self.capabilities
            .get(integration)
            .cloned()
            .unwrap_or_else(|| Capability::read_only_for(integration))
    }

    /// Claim the secret path for `(tenant_id, integration)`.
    ///
    /// Idempotent for the owning tenant. A path already owned by another
    /// tenant is a `PathCollision`; ownership is read back from the vault,
    /// never assumed from the path shape.
    pub async fn allocate(
        &self,
        tenant_id: &TenantId,
        integration: &IntegrationName,
    ) -> EnclaveResult<SecretPath> {
        self.registry.lookup_active(tenant_id).await?;
        let path = self.naming.secret_path(tenant_id, integration);
        let binding = CredentialBinding::new(path.clone(), self.capability_for(integration));

        match self.vault.binding_claim(&binding).await? {
            ClaimOutcome::Created => {
                tracing::info!(tenant_id = %tenant_id, integration = %integration, path = %path, "Secret path allocated");
                Ok(path)
            }
            ClaimOutcome::AlreadyOwned(existing) => Ok(existing.path),
            ClaimOutcome::OwnedBy(owner) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    owner = %owner,
                    path = %path,
                    "Secret path collision"
                );
                Err(TenancyError::PathCollision {
                    path: path.to_string(),
                    owner,
                    requested_by: tenant_id.clone(),
                }
                .into())
            }
        }
    }

    /// Store a new credential value at the existing path. Returns the new version.
    pub async fn rotate(
        &self,
        tenant_id: &TenantId,
        integration: &IntegrationName,
        value: SecretString,
    ) -> EnclaveResult<u32> {
        self.registry.lookup_active(tenant_id).await?;
        let path = self.naming.secret_path(tenant_id, integration);
        let binding = self
            .vault
            .binding_get(path.as_str())
            .await?
            .ok_or_else(|| EnclaveError::not_found("credential binding", path.as_str()))?;
        if binding.tenant_id() != tenant_id {
            return Err(TenancyError::PathCollision {
                path: path.to_string(),
                owner: binding.tenant_id().clone(),
                requested_by: tenant_id.clone(),
            }
            .into());
        }
        let version = self.vault.secret_put(path.as_str(), value).await?;
        tracing::info!(tenant_id = %tenant_id, integration = %integration, version, "Credential rotated");
        Ok(version)
    }

    /// Remove one binding. Returns `false` if it was not connected.
    pub async fn disconnect(
        &self,
        tenant_id: &TenantId,
        integration: &IntegrationName,
    ) -> EnclaveResult<bool> {
        let path = self.naming.secret_path(tenant_id, integration);
        let removed = self.vault.binding_delete(path.as_str()).await?;
        if removed {
            tracing::info!(tenant_id = %tenant_id, integration = %integration, "Integration disconnected");
        }
        Ok(removed)
    }

    /// Remove every secret path under the tenant's prefix.
    ///
    /// Returns the number removed; zero is not an error.
    pub async fn revoke(&self, tenant_id: &TenantId) -> EnclaveResult<usize> {
        let prefix = self.naming.secret_prefix(tenant_id);
        let removed = self.vault.binding_delete_prefix(&prefix).await?;
        tracing::info!(tenant_id = %tenant_id, removed, "Secret paths revoked");
        Ok(removed)
    }

    pub async fn bindings(&self, tenant_id: &TenantId) -> EnclaveResult<Vec<CredentialBinding>> {
        let prefix = self.naming.secret_prefix(tenant_id);
        self.vault.binding_list_prefix(&prefix).await
    }

    /// Integrations the tenant has connected.
    pub async fn connected(&self, tenant_id: &TenantId) -> EnclaveResult<BTreeSet<IntegrationName>> {
        Ok(self
            .bindings(tenant_id)
            .await?
            .into_iter()
            .map(|b| b.integration().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_core::LifecycleState;
    use enclave_storage::{MemoryTenantStore, MemoryVault};

    fn t(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    fn i(s: &str) -> IntegrationName {
        IntegrationName::parse(s).unwrap()
    }

    async fn registry_with(tenants: &[&str]) -> TenantRegistry {
        let registry = TenantRegistry::new(Arc::new(MemoryTenantStore::new()));
        for tenant in tenants {
            registry.register(t(tenant), *tenant).await.unwrap();
        }
        registry
    }

    async fn allocator() -> (Arc<MemoryVault>, SecretPathAllocator) {
        let vault = Arc::new(MemoryVault::new());
        let registry = registry_with(&["acme", "acme-co"]).await;
        let allocator =
            SecretPathAllocator::from_config(registry, vault.clone(), &EnclaveConfig::default())
                .unwrap();
        (vault, allocator)
    }

    #[tokio::test]
    async fn test_allocate_path_format() {
        let (_, allocator) = allocator().await;
        let path = allocator.allocate(&t("acme"), &i("gmail")).await.unwrap();
        assert_eq!(path.as_str(), "secrets/acme/gmail");
        let bindings = allocator.bindings(&t("acme")).await.unwrap();
        assert_eq!(bindings[0].capability.as_str(), "mail.readonly");
    }

    #[tokio::test]
    async fn test_allocate_is_idempotent() {
        let (vault, allocator) = allocator().await;
        let a = allocator.allocate(&t("acme"), &i("gmail")).await.unwrap();
        let b = allocator.allocate(&t("acme"), &i("gmail")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(vault.binding_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_integration_gets_read_only_capability() {
        let (_, allocator) = allocator().await;
        allocator.allocate(&t("acme"), &i("slack")).await.unwrap();
        let bindings = allocator.bindings(&t("acme")).await.unwrap();
        assert_eq!(bindings[0].capability.as_str(), "slack.readonly");
    }

    /// Vault whose ownership records disagree with the path shape.
    struct ForeignOwnedVault;

    #[async_trait::async_trait]
    impl SecretVault for ForeignOwnedVault {
        async fn binding_claim(&self, _: &CredentialBinding) -> EnclaveResult<ClaimOutcome> {
            Ok(ClaimOutcome::OwnedBy(t("globex")))
        }
        async fn binding_get(&self, _: &str) -> EnclaveResult<Option<CredentialBinding>> {
            Ok(None)
        }
        async fn binding_list_prefix(&self, _: &str) -> EnclaveResult<Vec<CredentialBinding>> {
            Ok(Vec::new())
        }
        async fn secret_put(&self, path: &str, _: SecretString) -> EnclaveResult<u32> {
            Err(EnclaveError::not_found("secret path", path))
        }
        async fn binding_delete(&self, _: &str) -> EnclaveResult<bool> {
            Ok(false)
        }
        async fn binding_delete_prefix(&self, _: &str) -> EnclaveResult<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_collision_detected_from_vault_ownership() {
        let allocator = SecretPathAllocator::new(
            registry_with(&["acme"]).await,
            Arc::new(ForeignOwnedVault),
            NamingConvention::default(),
        );
        let err = allocator.allocate(&t("acme"), &i("gmail")).await.unwrap_err();
        assert_eq!(
            err,
            EnclaveError::Tenancy(TenancyError::PathCollision {
                path: "secrets/acme/gmail".to_string(),
                owner: t("globex"),
                requested_by: t("acme"),
            })
        );
    }

    #[tokio::test]
    async fn test_rotate_keeps_path_and_bumps_version() {
        let (vault, allocator) = allocator().await;
        let path = allocator.allocate(&t("acme"), &i("gmail")).await.unwrap();
        let v1 = allocator
            .rotate(&t("acme"), &i("gmail"), SecretString::from("refresh-1"))
            .await
            .unwrap();
        let v2 = allocator
            .rotate(&t("acme"), &i("gmail"), SecretString::from("refresh-2"))
            .await
            .unwrap();
        assert_eq!((v1, v2), (1, 2));
        assert!(vault.has_value(path.as_str()).await);
        assert_eq!(allocator.bindings(&t("acme")).await.unwrap()[0].path, path);
    }

    #[tokio::test]
    async fn test_rotate_unallocated_is_not_found() {
        let (_, allocator) = allocator().await;
        let err = allocator
            .rotate(&t("acme"), &i("gmail"), SecretString::from("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnclaveError::Tenancy(TenancyError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_and_revoke() {
        let (_, allocator) = allocator().await;
        allocator.allocate(&t("acme"), &i("gmail")).await.unwrap();
        allocator.allocate(&t("acme"), &i("hubspot")).await.unwrap();
        allocator.allocate(&t("acme-co"), &i("gmail")).await.unwrap();

        assert!(allocator.disconnect(&t("acme"), &i("hubspot")).await.unwrap());
        assert!(!allocator.disconnect(&t("acme"), &i("hubspot")).await.unwrap());

        assert_eq!(allocator.revoke(&t("acme")).await.unwrap(), 1);
        assert_eq!(allocator.revoke(&t("acme")).await.unwrap(), 0);
        assert_eq!(
            allocator.connected(&t("acme-co")).await.unwrap(),
            BTreeSet::from([i("gmail")])
        );
    }

    #[tokio::test]
    async fn test_unknown_tenant_cannot_allocate() {
        let (vault, allocator) = allocator().await;
        let err = allocator.allocate(&t("initech"), &i("gmail")).await.unwrap_err();
        assert!(matches!(err, EnclaveError::Tenancy(TenancyError::NotFound { .. })));
        assert_eq!(vault.binding_count().await, 0);
    }

    #[tokio::test]
    async fn test_inactive_tenant_cannot_allocate_or_rotate() {
        let vault = Arc::new(MemoryVault::new());
        let registry = registry_with(&["acme"]).await;
        let config = EnclaveConfig::default();
        let allocator =
            SecretPathAllocator::from_config(registry.clone(), vault.clone(), &config).unwrap();
        allocator.allocate(&t("acme"), &i("gmail")).await.unwrap();

        registry.suspend(&t("acme")).await.unwrap();
        let err = allocator
            .rotate(&t("acme"), &i("gmail"), SecretString::from("refresh"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EnclaveError::Tenancy(TenancyError::TenantInactive {
                tenant_id: t("acme"),
                state: LifecycleState::Suspended,
            })
        );

        registry.mark_deleted(&t("acme")).await.unwrap();
        assert_eq!(allocator.revoke(&t("acme")).await.unwrap(), 1);
        let err = allocator.allocate(&t("acme"), &i("gmail")).await.unwrap_err();
        assert!(matches!(err, EnclaveError::Tenancy(TenancyError::TenantInactive { .. })));
        assert_eq!(vault.binding_count().await, 0);
    }
}
