//! ENCLAVE Storage - Collaborator Traits and In-Memory Backends
//!
//! The isolation layer never talks to a cloud API directly. It is handed
//! collaborators that provide identifiers and endpoints: a durable tenant
//! store, a secret vault, object-store prefix grants and a database catalog.
//! Real implementations live in the provisioning layer; the in-memory ones
//! here back the tests and the CLI.

pub mod memory;
pub mod sql;

pub use memory::{
    BackendSnapshot, FaultInjector, MemoryDatabase, MemoryObjectStore, MemoryTenantStore,
    MemoryVault,
};
pub use sql::{Predicate, QueryResult, Row, SqlConnection, Statement};

use async_trait::async_trait;
use enclave_core::{
    AccessLevel, CredentialBinding, EnclaveResult, StoragePrefix, TenancyUnit, Tenant, TenantId,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

// ============================================================================
// TENANT STORE
// ============================================================================

/// Durable store behind the tenant registry.
///
/// `tenant_create_if_absent` must be atomic: two concurrent onboarding
/// requests for the same identifier cannot both observe `true`.
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Insert the tenant unless the identifier exists in any state.
    /// Returns `true` if this call created it.
    async fn tenant_create_if_absent(&self, tenant: &Tenant) -> EnclaveResult<bool>;

    /// Get a tenant by ID.
    async fn tenant_get(&self, id: &TenantId) -> EnclaveResult<Option<Tenant>>;

    /// Replace an existing tenant record. `NotFound` if absent.
    async fn tenant_update(&self, tenant: &Tenant) -> EnclaveResult<()>;

    /// List every tenant record, tombstones included, ordered by id.
    async fn tenant_list(&self) -> EnclaveResult<Vec<Tenant>>;
}

// ============================================================================
// SECRET VAULT
// ============================================================================

/// Result of claiming a secret path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The path was free and now belongs to the requester.
    Created,
    /// The path already belonged to the requester.
    AlreadyOwned(CredentialBinding),
    /// The path belongs to another tenant.
    OwnedBy(TenantId),
}

/// Secret storage holding credential bindings and their values.
#[async_trait]
pub trait SecretVault: Send + Sync {
    /// Atomically claim `binding.path` for `binding.tenant_id()`.
    async fn binding_claim(&self, binding: &CredentialBinding) -> EnclaveResult<ClaimOutcome>;

    async fn binding_get(&self, path: &str) -> EnclaveResult<Option<CredentialBinding>>;

    /// Bindings whose path starts with `prefix`, ordered by path.
    async fn binding_list_prefix(&self, prefix: &str) -> EnclaveResult<Vec<CredentialBinding>>;

    /// Store a new value version at an existing path. Returns the new version.
    async fn secret_put(&self, path: &str, value: SecretString) -> EnclaveResult<u32>;

    /// Remove one binding and its value. Returns `false` if absent.
    async fn binding_delete(&self, path: &str) -> EnclaveResult<bool>;

    /// Remove every binding under `prefix`. Returns the number removed.
    async fn binding_delete_prefix(&self, prefix: &str) -> EnclaveResult<usize>;
}

// ============================================================================
// OBJECT STORE GRANTS
// ============================================================================

/// An access grant on one storage prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrefixGrant {
    pub principal: String,
    pub prefix: StoragePrefix,
    pub access: AccessLevel,
}

/// Prefix-based access policies on the shared bucket.
#[async_trait]
pub trait ObjectStoreGrants: Send + Sync {
    /// Attach (or replace) the grant for `principal` on `prefix`.
    async fn grant_prefix(
        &self,
        principal: &str,
        prefix: &StoragePrefix,
        access: AccessLevel,
    ) -> EnclaveResult<()>;

    /// Remove every grant on `prefix`. Returns the number removed.
    async fn revoke_prefix(&self, prefix: &StoragePrefix) -> EnclaveResult<usize>;

    async fn grants_for_prefix(&self, prefix: &StoragePrefix) -> EnclaveResult<Vec<PrefixGrant>>;
}

// ============================================================================
// DATABASE CATALOG
// ============================================================================

/// Schema lifecycle in the shared database.
#[async_trait]
pub trait DatabaseCatalog: Send + Sync {
    /// Create the schema if missing. Returns `true` if created.
    async fn schema_create(&self, unit: &TenancyUnit) -> EnclaveResult<bool>;

    /// Drop the schema and every row tagged with its tenant.
    /// Returns `false` if there was nothing to drop.
    async fn schema_drop(&self, unit: &TenancyUnit) -> EnclaveResult<bool>;

    async fn schema_exists(&self, unit: &TenancyUnit) -> EnclaveResult<bool>;
}
