//! In-process backends persisted to a JSON snapshot between invocations.

use crate::error::{CliError, CliResult};
use enclave_core::{EnclaveConfig, Tenant, TenantId};
use enclave_policy::{CredentialScoper, LaunchDescriptorBuilder};
use enclave_storage::{
    BackendSnapshot, DatabaseCatalog, MemoryDatabase, MemoryObjectStore, MemoryTenantStore,
    MemoryVault, ObjectStoreGrants,
};
use enclave_tenancy::{RevocationCascade, SecretPathAllocator, TenantRegistry};
use std::path::Path;
use std::sync::Arc;

pub struct Workspace {
    pub config: EnclaveConfig,
    tenants: Arc<MemoryTenantStore>,
    vault: Arc<MemoryVault>,
    objects: Arc<MemoryObjectStore>,
    database: Arc<MemoryDatabase>,
    pub registry: TenantRegistry,
    pub secrets: SecretPathAllocator,
    pub cascade: RevocationCascade,
}

impl Workspace {
    pub fn new(config: EnclaveConfig) -> CliResult<Self> {
        let tenants = Arc::new(MemoryTenantStore::new());
        let vault = Arc::new(MemoryVault::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let database = Arc::new(MemoryDatabase::new(config.tenant_setting.clone()));
        let registry = TenantRegistry::new(tenants.clone());
        let secrets = SecretPathAllocator::from_config(registry.clone(), vault.clone(), &config)?;
        let cascade = RevocationCascade::new(
            registry.clone(),
            secrets.clone(),
            objects.clone(),
            database.clone(),
        );
        Ok(Self {
            config,
            tenants,
            vault,
            objects,
            database,
            registry,
            secrets,
            cascade,
        })
    }

    /// Build a workspace and load `path` into it if the file exists.
    pub async fn load(config: EnclaveConfig, path: &Path) -> CliResult<Self> {
        let workspace = Self::new(config)?;
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No state file, starting empty");
            return Ok(workspace);
        }
        let contents = std::fs::read_to_string(path).map_err(|e| CliError::io(path, e))?;
        let snapshot: BackendSnapshot =
            serde_json::from_str(&contents).map_err(|source| CliError::State {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::debug!(
            path = %path.display(),
            tenants = snapshot.tenants.len(),
            bindings = snapshot.bindings.len(),
            "State loaded"
        );
        snapshot
            .restore(
                &workspace.tenants,
                &workspace.vault,
                &workspace.objects,
                &workspace.database,
            )
            .await;
        Ok(workspace)
    }

    pub async fn snapshot(&self) -> BackendSnapshot {
        BackendSnapshot::capture(&self.tenants, &self.vault, &self.objects, &self.database).await
    }

    pub async fn save(&self, path: &Path) -> CliResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CliError::io(parent, e))?;
        }
        let contents = serde_json::to_string_pretty(&self.snapshot().await)?;
        std::fs::write(path, contents).map_err(|e| CliError::io(path, e))?;
        Ok(())
    }

    pub fn scoper(&self) -> CliResult<CredentialScoper> {
        Ok(CredentialScoper::new(
            &self.config,
            self.registry.clone(),
            self.secrets.clone(),
        )?)
    }

    pub fn launch_builder(&self) -> CliResult<LaunchDescriptorBuilder> {
        Ok(LaunchDescriptorBuilder::new(&self.config, self.scoper()?)?)
    }

    /// Register a tenant, grant each role its prefix and create the schema.
    ///
    /// Nothing is granted when registration fails.
    pub async fn onboard(&self, tenant_id: TenantId, display_name: String) -> CliResult<Tenant> {
        let tenant = self.registry.register(tenant_id, display_name).await?;
        let naming = self.config.naming()?;
        let namer = self.config.resource_namer()?;
        let prefix = naming.storage_prefix(&tenant.tenant_id);
        for profile in &self.config.roles {
            let principal = namer.role_name(profile.role, &tenant.tenant_id);
            self.objects
                .grant_prefix(&principal, &prefix, profile.storage_access)
                .await?;
        }
        self.database
            .schema_create(&naming.tenancy_unit(&tenant.tenant_id))
            .await?;
        tracing::info!(tenant_id = %tenant.tenant_id, prefix = %prefix, "Tenant onboarded");
        Ok(tenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_core::IntegrationName;

    fn t(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_state_survives_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let ws = Workspace::load(EnclaveConfig::default(), &path).await.unwrap();
        ws.onboard(t("acme"), "Acme".to_string()).await.unwrap();
        ws.secrets
            .allocate(&t("acme"), &IntegrationName::parse("gmail").unwrap())
            .await
            .unwrap();
        ws.save(&path).await.unwrap();

        let reloaded = Workspace::load(EnclaveConfig::default(), &path).await.unwrap();
        assert_eq!(reloaded.snapshot().await, ws.snapshot().await);
        assert!(reloaded.registry.lookup_active(&t("acme")).await.is_ok());
        assert_eq!(reloaded.secrets.bindings(&t("acme")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_state_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = Workspace::load(EnclaveConfig::default(), &path)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CliError::State { .. }));
    }

    #[tokio::test]
    async fn test_onboard_grants_every_role() {
        let ws = Workspace::new(EnclaveConfig::default()).unwrap();
        ws.onboard(t("acme"), "Acme".to_string()).await.unwrap();
        let snapshot = ws.snapshot().await;
        assert_eq!(snapshot.grants.len(), 3);
        assert!(snapshot.schemas.contains("acme"));

        assert!(ws.onboard(t("acme"), "Again".to_string()).await.is_err());
        assert_eq!(ws.snapshot().await.grants.len(), 3);
    }
}
