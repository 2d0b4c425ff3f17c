//! Error types for ENCLAVE operations

use crate::{AgentRole, IntegrationName, LifecycleState, TenantId};
use thiserror::Error;

/// Tenancy errors.
///
/// Every variant blocks the provisioning action that produced it. None of
/// them has a safe automatic fallback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TenancyError {
    #[error("Tenant already registered: {tenant_id}")]
    DuplicateTenant { tenant_id: TenantId },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Secret path {path} already owned by tenant {owner}, requested by {requested_by}")]
    PathCollision {
        path: String,
        owner: TenantId,
        requested_by: TenantId,
    },

    #[error("Tenancy attribute not set on session; statement rejected")]
    TenancyNotSet,

    #[error("Role {role} for tenant {tenant_id} requires unconnected integrations: {missing:?}")]
    IncompleteBinding {
        tenant_id: TenantId,
        role: AgentRole,
        missing: Vec<IntegrationName>,
    },

    #[error("Revocation incomplete for tenant {tenant_id}; failed steps: {failed_steps:?}")]
    RevocationIncomplete {
        tenant_id: TenantId,
        failed_steps: Vec<String>,
    },

    #[error("Tenant {tenant_id} is {state}, expected Active")]
    TenantInactive {
        tenant_id: TenantId,
        state: LifecycleState,
    },

    #[error("Tenant {tenant_id} is {state}; revocation requires Deleted")]
    NotDeleted {
        tenant_id: TenantId,
        state: LifecycleState,
    },

    #[error("Session bound to {bound} cannot switch to {requested}")]
    TenantSwitch {
        bound: TenantId,
        requested: TenantId,
    },

    #[error("Session is closed")]
    SessionClosed,

    #[error("Statement on {table} targets tenant {requested} while session is bound to {bound}")]
    CrossTenantRow {
        table: String,
        bound: TenantId,
        requested: String,
    },

    #[error("Launch placement for {tenant_id}/{role} is internet-addressable: {reason}")]
    PublicPlacement {
        tenant_id: TenantId,
        role: AgentRole,
        reason: String,
    },

    #[error("Identity {identity} is not bound to tenant {tenant_id}: {reason}")]
    IdentityMismatch {
        identity: String,
        tenant_id: TenantId,
        reason: String,
    },

    #[error("Illegal lifecycle transition for {tenant_id}: {from} -> {to}")]
    InvalidTransition {
        tenant_id: TenantId,
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid {kind} '{value}': {reason}")]
    InvalidIdentifier {
        kind: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid storage key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Failures reported by an external collaborator (durable store, vault,
/// object store, database, launcher).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("{backend} operation {operation} failed: {reason}")]
    OperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Master error type for all ENCLAVE errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnclaveError {
    #[error("Tenancy error: {0}")]
    Tenancy(#[from] TenancyError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl EnclaveError {
    /// Whether re-running the same operation may succeed.
    ///
    /// Only collaborator failures and partial teardown qualify; everything
    /// else is a decision that will not change on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EnclaveError::Store(_)
                | EnclaveError::Tenancy(TenancyError::RevocationIncomplete { .. })
        )
    }

    /// Shorthand for a `NotFound` tenancy error.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        EnclaveError::Tenancy(TenancyError::NotFound {
            entity,
            id: id.into(),
        })
    }
}

/// Result type alias for ENCLAVE operations.
pub type EnclaveResult<T> = Result<T, EnclaveError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(s: &str) -> TenantId {
        TenantId::parse(s).expect("valid tenant id")
    }

    #[test]
    fn test_duplicate_tenant_display() {
        let err = TenancyError::DuplicateTenant {
            tenant_id: tenant("acme"),
        };
        assert_eq!(err.to_string(), "Tenant already registered: acme");
    }

    #[test]
    fn test_path_collision_display_names_both_tenants() {
        let err = TenancyError::PathCollision {
            path: "secrets/acme/gmail".to_string(),
            owner: tenant("acme"),
            requested_by: tenant("globex"),
        };
        let msg = err.to_string();
        assert!(msg.contains("secrets/acme/gmail"));
        assert!(msg.contains("acme"));
        assert!(msg.contains("globex"));
    }

    #[test]
    fn test_from_conversions() {
        let err: EnclaveError = TenancyError::TenancyNotSet.into();
        assert!(matches!(err, EnclaveError::Tenancy(TenancyError::TenancyNotSet)));

        let err: EnclaveError = StoreError::LockPoisoned.into();
        assert!(matches!(err, EnclaveError::Store(_)));
    }

    #[test]
    fn test_retryable_classification() {
        let store: EnclaveError = StoreError::Unavailable {
            backend: "vault".to_string(),
            reason: "timeout".to_string(),
        }
        .into();
        assert!(store.is_retryable());

        let incomplete: EnclaveError = TenancyError::RevocationIncomplete {
            tenant_id: tenant("acme"),
            failed_steps: vec!["revoke_secrets".to_string()],
        }
        .into();
        assert!(incomplete.is_retryable());

        let not_set: EnclaveError = TenancyError::TenancyNotSet.into();
        assert!(!not_set.is_retryable());

        let dup: EnclaveError = TenancyError::DuplicateTenant {
            tenant_id: tenant("acme"),
        }
        .into();
        assert!(!dup.is_retryable());
    }

    #[test]
    fn test_not_found_helper() {
        let err = EnclaveError::not_found("tenant", "ghost");
        assert_eq!(
            err,
            EnclaveError::Tenancy(TenancyError::NotFound {
                entity: "tenant",
                id: "ghost".to_string()
            })
        );
    }
}
