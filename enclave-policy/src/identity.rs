//! Execution identities and their binding to tenants.
//!
//! A task never chooses its own tenant. The launcher assumes a named
//! identity carrying a `tenant_id` session tag, and every enforcer that
//! trusts that tag first checks the identity could only have been derived
//! for that tenant.

use enclave_core::{
    AgentRole, EnclaveConfig, EnclaveResult, ResourceNamer, TenancyError, TenantId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Session tag that carries the tenant identifier.
pub const TENANT_TAG: &str = "tenant_id";

/// Session tag that carries the agent role.
pub const ROLE_TAG: &str = "agent_role";

/// An identity a task assumes at launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssumedIdentity {
    pub role_name: String,
    pub role: AgentRole,
    pub session_tags: BTreeMap<String, String>,
}

impl AssumedIdentity {
    pub fn tenant_tag(&self) -> Option<&str> {
        self.session_tags.get(TENANT_TAG).map(String::as_str)
    }

    pub fn role_tag(&self) -> Option<&str> {
        self.session_tags.get(ROLE_TAG).map(String::as_str)
    }
}

/// Derives and verifies tenant-bound identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityBinder {
    namer: ResourceNamer,
}

impl IdentityBinder {
    pub fn new(namer: ResourceNamer) -> Self {
        Self { namer }
    }

    pub fn from_config(config: &EnclaveConfig) -> EnclaveResult<Self> {
        Ok(Self::new(config.resource_namer()?))
    }

    pub fn namer(&self) -> &ResourceNamer {
        &self.namer
    }

    /// The identity for one (tenant, role) instance.
    pub fn derive(&self, tenant_id: &TenantId, role: AgentRole) -> AssumedIdentity {
        let session_tags = [
            (TENANT_TAG.to_string(), tenant_id.to_string()),
            (ROLE_TAG.to_string(), role.to_string()),
        ]
        .into_iter()
        .collect();
        AssumedIdentity {
            role_name: self.namer.role_name(role, tenant_id),
            role,
            session_tags,
        }
    }

    /// Check that `identity` belongs to `tenant_id`.
    ///
    /// Both the session tag and the role name must match what [`derive`]
    /// would produce; a tag alone can be forged by whoever sets session tags.
    ///
    /// [`derive`]: Self::derive
    pub fn verify(&self, identity: &AssumedIdentity, tenant_id: &TenantId) -> EnclaveResult<()> {
        let mismatch = |reason: String| {
            tracing::warn!(
                identity = %identity.role_name,
                tenant_id = %tenant_id,
                %reason,
                "Identity binding rejected"
            );
            TenancyError::IdentityMismatch {
                identity: identity.role_name.clone(),
                tenant_id: tenant_id.clone(),
                reason,
            }
        };

        match identity.tenant_tag() {
            None => return Err(mismatch(format!("missing {TENANT_TAG} session tag")).into()),
            Some(tag) if tag != tenant_id.as_str() => {
                return Err(mismatch(format!("session tag names tenant {tag}")).into())
            }
            Some(_) => {}
        }
        if identity.role_tag() != Some(identity.role.as_str()) {
            return Err(mismatch(format!("{ROLE_TAG} session tag does not match role")).into());
        }
        if identity.role_name != self.namer.role_name(identity.role, tenant_id) {
            return Err(mismatch("role name was not derived for this tenant".to_string()).into());
        }
        Ok(())
    }
}
