//! Task Launch Descriptor Builder
//!
//! Turns a scoped access policy into a launchable unit: private network
//! placement, the tenant-bound identity, references to credential paths and
//! the environment the agent process starts with. Descriptors never carry a
//! secret value.

use crate::identity::{AssumedIdentity, IdentityBinder};
use crate::scoper::{AccessPolicy, CredentialScoper};
use async_trait::async_trait;
use enclave_core::{
    AgentRole, EnclaveConfig, EnclaveResult, IntegrationName, NamingConvention, NetworkConfig,
    ResourceLimits, ResourceNamer, SecretPath, TenancyError, TenantId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

pub const ENV_TENANT_ID: &str = "TENANT_ID";
pub const ENV_AGENT_ROLE: &str = "AGENT_ROLE";
pub const ENV_STORAGE_BUCKET: &str = "STORAGE_BUCKET";
pub const ENV_STORAGE_PREFIX: &str = "STORAGE_PREFIX";
pub const ENV_DB_SCHEMA: &str = "DB_SCHEMA";
pub const ENV_DB_TENANT_SETTING: &str = "DB_TENANT_SETTING";

// ============================================================================
// DESCRIPTOR
// ============================================================================

/// Where the task runs. Always private.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPlacement {
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub assign_public_ip: bool,
}

/// A credential the launcher injects by path; the value never passes
/// through this layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretReference {
    pub integration: IntegrationName,
    /// Environment variable the launcher fills from `path`.
    pub env_var: String,
    pub path: SecretPath,
}

/// Everything needed to launch one agent task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchDescriptor {
    pub tenant_id: TenantId,
    pub role: AgentRole,
    pub identity: AssumedIdentity,
    /// Fingerprint of the access policy the identity is provisioned with.
    pub policy_fingerprint: String,
    pub cluster: String,
    pub log_group: String,
    pub placement: NetworkPlacement,
    pub secrets: Vec<SecretReference>,
    pub environment: BTreeMap<String, String>,
    pub limits: ResourceLimits,
}

impl LaunchDescriptor {
    /// Re-check the invariants a launcher relies on.
    ///
    /// The identity must verify against the tenant, and every name the
    /// task will see is re-derived and compared as a string.
    pub fn validate(
        &self,
        binder: &IdentityBinder,
        naming: &NamingConvention,
    ) -> EnclaveResult<()> {
        check_placement(&self.placement, &self.tenant_id, self.role)?;
        binder.verify(&self.identity, &self.tenant_id)?;

        let fail = |reason: String| -> EnclaveResult<()> {
            tracing::warn!(tenant_id = %self.tenant_id, role = %self.role, %reason, "Launch descriptor rejected");
            Err(TenancyError::IdentityMismatch {
                identity: self.identity.role_name.clone(),
                tenant_id: self.tenant_id.clone(),
                reason,
            }
            .into())
        };
        if self.identity.role != self.role {
            return fail("identity was derived for another role".to_string());
        }
        let expected_env = [
            (ENV_TENANT_ID, self.tenant_id.to_string()),
            (ENV_AGENT_ROLE, self.role.to_string()),
            (ENV_STORAGE_PREFIX, naming.storage_prefix(&self.tenant_id).to_string()),
            (ENV_DB_SCHEMA, naming.tenancy_unit(&self.tenant_id).schema().to_string()),
        ];
        for (var, expected) in expected_env {
            if self.environment.get(var) != Some(&expected) {
                return fail(format!("{var} does not name this tenant"));
            }
        }
        for secret in &self.secrets {
            let expected = naming.secret_path(&self.tenant_id, &secret.integration);
            if secret.path != expected {
                return fail(format!("secret reference {} was not derived for this tenant", secret.path));
            }
        }
        Ok(())
    }

    /// Every resource name that appears anywhere in the descriptor.
    pub fn referenced_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.secrets.iter().map(|s| s.path.to_string()).collect();
        names.extend(self.environment.values().cloned());
        names.push(self.identity.role_name.clone());
        names
    }
}

fn check_placement(
    placement: &NetworkPlacement,
    tenant_id: &TenantId,
    role: AgentRole,
) -> EnclaveResult<()> {
    let reason = if placement.assign_public_ip {
        Some("public IP assignment requested".to_string())
    } else if placement.subnets.is_empty() {
        Some("no subnets".to_string())
    } else if placement.security_groups.is_empty() {
        Some("no security groups".to_string())
    } else {
        None
    };
    match reason {
        Some(reason) => {
            tracing::error!(tenant_id = %tenant_id, role = %role, %reason, "Public placement rejected");
            Err(TenancyError::PublicPlacement {
                tenant_id: tenant_id.clone(),
                role,
                reason,
            }
            .into())
        }
        None => Ok(()),
    }
}

fn secret_env_var(integration: &IntegrationName) -> String {
    format!(
        "{}_CREDENTIALS",
        integration.as_str().to_uppercase().replace('-', "_")
    )
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builds launch descriptors from scoped policies.
#[derive(Clone)]
pub struct LaunchDescriptorBuilder {
    scoper: CredentialScoper,
    network: NetworkConfig,
    namer: ResourceNamer,
}

impl LaunchDescriptorBuilder {
    pub fn new(config: &EnclaveConfig, scoper: CredentialScoper) -> EnclaveResult<Self> {
        Ok(Self {
            scoper,
            network: config.network.clone(),
            namer: config.resource_namer()?,
        })
    }

    /// Network placement from configuration.
    ///
    /// A public subnet anywhere in the list is fatal, even if private ones
    /// are also present.
    fn placement(&self, tenant_id: &TenantId, role: AgentRole) -> EnclaveResult<NetworkPlacement> {
        if let Some(public) = self.network.subnets.iter().find(|s| s.public) {
            let reason = format!("subnet {} is public", public.id);
            tracing::error!(tenant_id = %tenant_id, role = %role, %reason, "Public placement rejected");
            return Err(TenancyError::PublicPlacement {
                tenant_id: tenant_id.clone(),
                role,
                reason,
            }
            .into());
        }
        let placement = NetworkPlacement {
            subnets: self.network.subnets.iter().map(|s| s.id.clone()).collect(),
            security_groups: self.network.security_groups.clone(),
            assign_public_ip: self.network.assign_public_ip,
        };
        check_placement(&placement, tenant_id, role)?;
        Ok(placement)
    }

    /// Build the descriptor for an active tenant's role.
    ///
    /// Fails with `IncompleteBinding` when a required integration is not
    /// connected, and `PublicPlacement` when the network is not private.
    pub async fn build(&self, tenant_id: &TenantId, role: AgentRole) -> EnclaveResult<LaunchDescriptor> {
        let placement = self.placement(tenant_id, role)?;
        let policy = self.scoper.scope_for(tenant_id, role).await?;
        let profile = self.scoper.role_profile(role)?;

        let missing: Vec<IntegrationName> = profile
            .required
            .iter()
            .filter(|i| !policy.secrets.contains_key(*i))
            .cloned()
            .collect();
        if !missing.is_empty() {
            tracing::warn!(tenant_id = %tenant_id, role = %role, ?missing, "Launch blocked on unconnected integrations");
            return Err(TenancyError::IncompleteBinding {
                tenant_id: tenant_id.clone(),
                role,
                missing,
            }
            .into());
        }

        let descriptor = self.assemble(&policy, placement, profile.limits)?;
        self.validate(&descriptor)?;
        tracing::info!(
            tenant_id = %tenant_id,
            role = %role,
            secrets = descriptor.secrets.len(),
            "Launch descriptor built"
        );
        Ok(descriptor)
    }

    /// Check a descriptor against this deployment's identities and names.
    pub fn validate(&self, descriptor: &LaunchDescriptor) -> EnclaveResult<()> {
        descriptor.validate(self.scoper.binder(), self.scoper.naming())
    }

    fn assemble(
        &self,
        policy: &AccessPolicy,
        placement: NetworkPlacement,
        limits: ResourceLimits,
    ) -> EnclaveResult<LaunchDescriptor> {
        let secrets = policy
            .secrets
            .iter()
            .map(|(integration, grant)| SecretReference {
                integration: integration.clone(),
                env_var: secret_env_var(integration),
                path: grant.path.clone(),
            })
            .collect();

        let environment = [
            (ENV_TENANT_ID, policy.tenant_id.to_string()),
            (ENV_AGENT_ROLE, policy.role.to_string()),
            (ENV_STORAGE_BUCKET, self.namer.bucket()?),
            (ENV_STORAGE_PREFIX, policy.storage_prefix.to_string()),
            (ENV_DB_SCHEMA, policy.tenancy_unit.schema().to_string()),
            (ENV_DB_TENANT_SETTING, policy.tenant_setting.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Ok(LaunchDescriptor {
            tenant_id: policy.tenant_id.clone(),
            role: policy.role,
            identity: policy.identity.clone(),
            policy_fingerprint: policy.fingerprint()?,
            cluster: self.namer.cluster()?,
            log_group: self.namer.log_group(policy.role.as_str())?,
            placement,
            secrets,
            environment,
            limits,
        })
    }
}

// ============================================================================
// LAUNCHER
// ============================================================================

/// Compute scheduler that runs a descriptor under its identity.
#[async_trait]
pub trait ComputeLauncher: Send + Sync {
    /// Start the task. Returns a launcher-specific task id.
    async fn launch(&self, descriptor: &LaunchDescriptor) -> EnclaveResult<String>;
}

/// Validate against `builder`'s deployment, then hand off to `launcher`.
pub async fn launch_validated(
    builder: &LaunchDescriptorBuilder,
    launcher: &dyn ComputeLauncher,
    descriptor: &LaunchDescriptor,
) -> EnclaveResult<String> {
    builder.validate(descriptor)?;
    let task_id = launcher.launch(descriptor).await?;
    tracing::info!(
        tenant_id = %descriptor.tenant_id,
        role = %descriptor.role,
        task_id = %task_id,
        "Agent task launched"
    );
    Ok(task_id)
}

/// Launcher that records descriptors instead of starting tasks.
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    launched: Mutex<Vec<LaunchDescriptor>>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn launched(&self) -> Vec<LaunchDescriptor> {
        self.launched.lock().await.clone()
    }
}

#[async_trait]
impl ComputeLauncher for RecordingLauncher {
    async fn launch(&self, descriptor: &LaunchDescriptor) -> EnclaveResult<String> {
        let mut launched = self.launched.lock().await;
        launched.push(descriptor.clone());
        Ok(format!(
            "task-{}-{}-{}",
            descriptor.tenant_id,
            descriptor.role,
            launched.len()
        ))
    }
}
