//! Core entity structures

use crate::{
    new_event_id, AccessLevel, AgentRole, IntegrationName, LifecycleState, SecretPath, TenantId,
    Timestamp,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Tenant - one customer account and its isolated resource set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: TenantId,
    pub display_name: String,
    pub state: LifecycleState,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub deleted_at: Option<Timestamp>,
    /// Set once the revocation cascade has been verified complete.
    pub revocation_verified_at: Option<Timestamp>,
    pub metadata: Option<serde_json::Value>,
}

impl Tenant {
    /// Create a new active tenant.
    pub fn new(tenant_id: TenantId, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            tenant_id,
            display_name: display_name.into(),
            state: LifecycleState::Active,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            revocation_verified_at: None,
            metadata: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == LifecycleState::Active
    }

    pub fn is_deleted(&self) -> bool {
        self.state == LifecycleState::Deleted
    }
}

/// Capability descriptor attached to a credential binding (e.g. `mail.readonly`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(pub String);

impl Capability {
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    /// Fallback capability for integrations without a configured scope.
    pub fn read_only_for(integration: &IntegrationName) -> Self {
        Self(format!("{}.readonly", integration))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which integrations and storage access an agent role may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleProfile {
    pub role: AgentRole,
    /// Integrations that must be connected before the role can launch.
    #[serde(default)]
    pub required: BTreeSet<IntegrationName>,
    /// Integrations the role uses when connected.
    #[serde(default)]
    pub optional: BTreeSet<IntegrationName>,
    pub storage_access: AccessLevel,
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl RoleProfile {
    pub fn new(role: AgentRole, storage_access: AccessLevel) -> Self {
        Self {
            role,
            required: BTreeSet::new(),
            optional: BTreeSet::new(),
            storage_access,
            limits: ResourceLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_required(mut self, integration: IntegrationName) -> Self {
        self.optional.remove(&integration);
        self.required.insert(integration);
        self
    }

    pub fn with_optional(mut self, integration: IntegrationName) -> Self {
        if !self.required.contains(&integration) {
            self.optional.insert(integration);
        }
        self
    }

    /// Whether the role may touch this integration at all.
    pub fn permits(&self, integration: &IntegrationName) -> bool {
        self.required.contains(integration) || self.optional.contains(integration)
    }
}

/// Compute limits for one agent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU units (1024 = one vCPU)
    pub cpu_units: u32,
    pub memory_mib: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_units: 512,
            memory_mib: 1024,
        }
    }
}

/// Credential binding - (tenant, integration) to a rotatable stored secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBinding {
    pub path: SecretPath,
    pub capability: Capability,
    /// Incremented on every rotation; the path never changes.
    pub version: u32,
    pub created_at: Timestamp,
    pub rotated_at: Option<Timestamp>,
}

impl CredentialBinding {
    pub fn new(path: SecretPath, capability: Capability) -> Self {
        Self {
            path,
            capability,
            version: 0,
            created_at: Utc::now(),
            rotated_at: None,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        self.path.tenant_id()
    }

    pub fn integration(&self) -> &IntegrationName {
        self.path.integration()
    }
}

/// Emitted when a tenant is marked deleted; consumed by teardown workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub requested_at: Timestamp,
}

impl RevocationEvent {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            event_id: new_event_id(),
            tenant_id,
            requested_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i(s: &str) -> IntegrationName {
        IntegrationName::parse(s).unwrap()
    }

    #[test]
    fn test_new_tenant_is_active() {
        let tenant = Tenant::new(TenantId::parse("acme").unwrap(), "Acme Inc");
        assert!(tenant.is_active());
        assert!(!tenant.is_deleted());
        assert!(tenant.deleted_at.is_none());
        assert!(tenant.revocation_verified_at.is_none());
    }

    #[test]
    fn test_role_profile_required_wins_over_optional() {
        let profile = RoleProfile::new(AgentRole::Butler, AccessLevel::ReadWrite)
            .with_optional(i("gmail"))
            .with_required(i("gmail"))
            .with_optional(i("gmail"));
        assert!(profile.required.contains(&i("gmail")));
        assert!(!profile.optional.contains(&i("gmail")));
        assert!(profile.permits(&i("gmail")));
        assert!(!profile.permits(&i("hubspot")));
    }

    #[test]
    fn test_fallback_capability() {
        assert_eq!(Capability::read_only_for(&i("slack")).as_str(), "slack.readonly");
    }
}
