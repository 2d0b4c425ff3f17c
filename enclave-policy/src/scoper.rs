//! Identity & Credential Scoper
//!
//! Derives, per tenant and role, the minimal set of resources an agent task
//! may touch: its tenant's storage prefix, the secret paths of integrations
//! the role uses and the tenant has connected, and the tenant's database
//! tenancy unit. Nothing else.

use crate::identity::{AssumedIdentity, IdentityBinder};
use enclave_core::{
    AccessLevel, AgentRole, Capability, CredentialBinding, EnclaveConfig, EnclaveResult,
    IntegrationName, NamingConvention, RoleProfile, SecretPath, StoragePrefix, TenancyUnit,
    TenantId,
};
use enclave_tenancy::{SecretPathAllocator, TenantRegistry};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// POLICY TYPES
// ============================================================================

/// One resource named by an access policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum PolicyResource {
    StoragePrefix(String),
    SecretPath(String),
    TenancyUnit(String),
}

impl PolicyResource {
    pub fn name(&self) -> &str {
        match self {
            PolicyResource::StoragePrefix(n)
            | PolicyResource::SecretPath(n)
            | PolicyResource::TenancyUnit(n) => n,
        }
    }
}

/// Read access to one credential binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretGrant {
    pub path: SecretPath,
    pub capability: Capability,
}

/// Minimal-privilege access statement for one (tenant, role) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub tenant_id: TenantId,
    pub role: AgentRole,
    pub identity: AssumedIdentity,
    pub storage_prefix: StoragePrefix,
    pub storage_access: AccessLevel,
    pub secrets: BTreeMap<IntegrationName, SecretGrant>,
    pub tenancy_unit: TenancyUnit,
    /// Session setting the database connection must carry.
    pub tenant_setting: String,
}

impl AccessPolicy {
    /// Pure derivation from already-fetched inputs.
    ///
    /// `connected` may contain bindings of integrations the role does not
    /// use, or of other tenants; both are ignored.
    pub fn derive(
        naming: &NamingConvention,
        binder: &IdentityBinder,
        profile: &RoleProfile,
        tenant_id: &TenantId,
        connected: &[CredentialBinding],
        tenant_setting: &str,
    ) -> Self {
        let secrets = connected
            .iter()
            .filter(|b| b.tenant_id() == tenant_id && profile.permits(b.integration()))
            .map(|b| {
                (
                    b.integration().clone(),
                    SecretGrant {
                        path: naming.secret_path(tenant_id, b.integration()),
                        capability: b.capability.clone(),
                    },
                )
            })
            .collect();

        Self {
            tenant_id: tenant_id.clone(),
            role: profile.role,
            identity: binder.derive(tenant_id, profile.role),
            storage_prefix: naming.storage_prefix(tenant_id),
            storage_access: profile.storage_access,
            secrets,
            tenancy_unit: naming.tenancy_unit(tenant_id),
            tenant_setting: tenant_setting.to_string(),
        }
    }

    /// Every resource this policy grants, ordered.
    pub fn resources(&self) -> BTreeSet<PolicyResource> {
        let mut resources = BTreeSet::new();
        resources.insert(PolicyResource::StoragePrefix(
            self.storage_prefix.as_str().to_string(),
        ));
        resources.extend(
            self.secrets
                .values()
                .map(|g| PolicyResource::SecretPath(g.path.as_str().to_string())),
        );
        resources.insert(PolicyResource::TenancyUnit(
            self.tenancy_unit.schema().to_string(),
        ));
        resources
    }

    /// Integrations whose credentials this policy can read.
    pub fn integrations(&self) -> BTreeSet<IntegrationName> {
        self.secrets.keys().cloned().collect()
    }

    /// SHA-256 over the canonical JSON form. Equal policies hash equal.
    pub fn fingerprint(&self) -> EnclaveResult<String> {
        let canonical = serde_json::to_vec(self).map_err(|e| {
            enclave_core::ValidationError::InvalidValue {
                field: "access_policy".to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    /// Render as a statement list for the provisioning layer.
    ///
    /// Storage access is expressed as a literal key prefix, never a pattern.
    pub fn render_iam_document(&self, bucket: &str) -> serde_json::Value {
        let mut statements = vec![serde_json::json!({
            "sid": "TenantStorage",
            "effect": "allow",
            "actions": self.storage_access.actions(),
            "resource": {
                "bucket": bucket,
                "key_prefix": self.storage_prefix.as_str(),
            },
        })];
        for (integration, grant) in &self.secrets {
            statements.push(serde_json::json!({
                "sid": format!("TenantSecret-{}", integration),
                "effect": "allow",
                "actions": ["read"],
                "resource": {
                    "secret_path": grant.path.as_str(),
                    "capability": grant.capability.as_str(),
                },
            }));
        }
        statements.push(serde_json::json!({
            "sid": "TenantDatabase",
            "effect": "allow",
            "actions": ["connect"],
            "resource": {
                "schema": self.tenancy_unit.schema(),
                "session_setting": { &self.tenant_setting: self.tenant_id.as_str() },
            },
        }));

        serde_json::json!({
            "version": "enclave/v1",
            "principal": {
                "role_name": self.identity.role_name,
                "session_tags": self.identity.session_tags,
            },
            "statements": statements,
        })
    }
}

// ============================================================================
// SCOPER
// ============================================================================

/// Builds access policies for registered tenants.
#[derive(Clone)]
pub struct CredentialScoper {
    registry: TenantRegistry,
    secrets: SecretPathAllocator,
    binder: IdentityBinder,
    roles: Vec<RoleProfile>,
    tenant_setting: String,
}

impl CredentialScoper {
    pub fn new(
        config: &EnclaveConfig,
        registry: TenantRegistry,
        secrets: SecretPathAllocator,
    ) -> EnclaveResult<Self> {
        Ok(Self {
            registry,
            secrets,
            binder: IdentityBinder::from_config(config)?,
            roles: config.roles.clone(),
            tenant_setting: config.tenant_setting.clone(),
        })
    }

    pub fn binder(&self) -> &IdentityBinder {
        &self.binder
    }

    pub fn naming(&self) -> &NamingConvention {
        self.secrets.naming()
    }

    pub fn role_profile(&self, role: AgentRole) -> EnclaveResult<&RoleProfile> {
        self.roles
            .iter()
            .find(|p| p.role == role)
            .ok_or_else(|| enclave_core::EnclaveError::not_found("role profile", role.as_str()))
    }

    /// Access policy for an active tenant's role instance.
    ///
    /// Suspended and deleted tenants get `TenantInactive`.
    pub async fn scope_for(&self, tenant_id: &TenantId, role: AgentRole) -> EnclaveResult<AccessPolicy> {
        self.registry.lookup_active(tenant_id).await?;
        let profile = self.role_profile(role)?;
        let connected = self.secrets.bindings(tenant_id).await?;
        let policy = AccessPolicy::derive(
            self.naming(),
            &self.binder,
            profile,
            tenant_id,
            &connected,
            &self.tenant_setting,
        );
        tracing::debug!(
            tenant_id = %tenant_id,
            role = %role,
            secrets = policy.secrets.len(),
            "Access policy scoped"
        );
        Ok(policy)
    }
}
