//! ENCLAVE Test Utilities
//!
//! Centralized test infrastructure for the ENCLAVE workspace:
//! - Proptest generators for identifiers and roles
//! - A fully wired in-memory stack
//! - Custom assertions for tenancy errors and isolation checks

pub use enclave_core::{
    AccessLevel, AgentRole, EnclaveConfig, EnclaveError, EnclaveResult, IntegrationName,
    LifecycleState, SecretPath, StorageAction, StoreError, TenancyError, TenantId,
    ValidationError,
};
pub use enclave_storage::{
    BackendSnapshot, MemoryDatabase, MemoryObjectStore, MemoryTenantStore, MemoryVault,
};
pub use enclave_tenancy::{RevocationCascade, SecretPathAllocator, TenantRegistry};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for ENCLAVE identifiers.

    use super::*;
    use proptest::prelude::*;

    /// Generate a valid tenant identifier.
    ///
    /// The first letter stays below `p` so the reserved `pg_` prefix never
    /// comes up.
    pub fn arb_tenant_id() -> impl Strategy<Value = TenantId> {
        "[a-o][a-z0-9_-]{0,14}[a-z0-9]".prop_filter_map("valid tenant id", |s| TenantId::parse(s).ok())
    }

    /// Generate two distinct tenant identifiers.
    pub fn arb_tenant_pair() -> impl Strategy<Value = (TenantId, TenantId)> {
        (arb_tenant_id(), arb_tenant_id()).prop_filter("distinct tenants", |(a, b)| a != b)
    }

    /// Generate one tenant id and a second that extends it, e.g. `acme` and
    /// `acme-eu`. Naive prefix matching confuses these.
    pub fn arb_prefix_sharing_pair() -> impl Strategy<Value = (TenantId, TenantId)> {
        (arb_tenant_id(), "[_-][a-z0-9]{1,6}").prop_filter_map("extended id fits", |(base, tail)| {
            let extended = TenantId::parse(format!("{}{}", base, tail)).ok()?;
            Some((base, extended))
        })
    }

    pub fn arb_role() -> impl Strategy<Value = AgentRole> {
        prop_oneof![
            Just(AgentRole::Butler),
            Just(AgentRole::Scout),
            Just(AgentRole::Strategist),
        ]
    }

    /// Generate one of the integrations the built-in roles know about.
    pub fn arb_integration() -> impl Strategy<Value = IntegrationName> {
        prop_oneof![
            Just("gmail"),
            Just("google-calendar"),
            Just("hubspot"),
            Just("linkedin"),
        ]
        .prop_filter_map("valid integration", |s| IntegrationName::parse(s).ok())
    }

    pub fn arb_storage_action() -> impl Strategy<Value = StorageAction> {
        prop_oneof![
            Just(StorageAction::Get),
            Just(StorageAction::Put),
            Just(StorageAction::Delete),
            Just(StorageAction::List),
        ]
    }

    /// Generate a well-formed key relative to a tenant prefix.
    pub fn arb_relative_key() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z0-9][a-z0-9._-]{0,10}", 1..4).prop_map(|parts| parts.join("/"))
    }

    /// One alteration applied to a storage principal after it was derived.
    ///
    /// Applied to the principal's serialized form, the way a tampered
    /// principal would reach an enforcer from outside the process.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum PrincipalTamper {
        ForgeTenantTag(TenantId),
        DropTenantTag,
        ForgeRoleTag(AgentRole),
        DropRoleTag,
        SwapRole(AgentRole),
        RenameIdentity(String),
        /// Point the storage prefix at another tenant, keeping the owner.
        ForeignPrefix(TenantId),
    }

    impl PrincipalTamper {
        /// Apply to a serialized principal of shape
        /// `{identity: {role_name, role, session_tags}, prefix: {prefix, tenant_id}, access}`.
        pub fn apply(&self, principal: &mut serde_json::Value) {
            let identity = &mut principal["identity"];
            match self {
                PrincipalTamper::ForgeTenantTag(t) => {
                    identity["session_tags"]["tenant_id"] = serde_json::json!(t.as_str())
                }
                PrincipalTamper::DropTenantTag => {
                    remove_key(&mut identity["session_tags"], "tenant_id")
                }
                PrincipalTamper::ForgeRoleTag(r) => {
                    identity["session_tags"]["agent_role"] = serde_json::json!(r.as_str())
                }
                PrincipalTamper::DropRoleTag => {
                    remove_key(&mut identity["session_tags"], "agent_role")
                }
                PrincipalTamper::SwapRole(r) => identity["role"] = serde_json::json!(r.as_str()),
                PrincipalTamper::RenameIdentity(name) => {
                    identity["role_name"] = serde_json::json!(name)
                }
                PrincipalTamper::ForeignPrefix(t) => {
                    principal["prefix"]["prefix"] = serde_json::json!(format!("{}/", t))
                }
            }
        }
    }

    fn remove_key(map: &mut serde_json::Value, key: &str) {
        if let Some(map) = map.as_object_mut() {
            map.remove(key);
        }
    }

    /// Generate an alteration of a derived principal.
    pub fn arb_principal_tamper() -> impl Strategy<Value = PrincipalTamper> {
        prop_oneof![
            arb_tenant_id().prop_map(PrincipalTamper::ForgeTenantTag),
            Just(PrincipalTamper::DropTenantTag),
            arb_role().prop_map(PrincipalTamper::ForgeRoleTag),
            Just(PrincipalTamper::DropRoleTag),
            arb_role().prop_map(PrincipalTamper::SwapRole),
            (arb_role(), arb_tenant_id())
                .prop_map(|(r, t)| PrincipalTamper::RenameIdentity(format!("enclave-dev-{r}-{t}"))),
            arb_tenant_id().prop_map(PrincipalTamper::ForeignPrefix),
        ]
    }

    /// Generate keys that try to escape or widen a prefix.
    pub fn arb_hostile_suffix() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("../".to_string()),
            Just("./".to_string()),
            Just("*".to_string()),
            Just("?".to_string()),
            Just("[a-z]".to_string()),
            Just("/".to_string()),
            "[a-z]{1,5}/\\.\\./[a-z]{1,5}",
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;
    use enclave_storage::{DatabaseCatalog, ObjectStoreGrants};
    use std::sync::Arc;

    /// Parse a tenant id known to be valid.
    #[track_caller]
    pub fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap_or_else(|e| panic!("fixture tenant {id}: {e}"))
    }

    /// Parse an integration name known to be valid.
    #[track_caller]
    pub fn integration(name: &str) -> IntegrationName {
        IntegrationName::parse(name).unwrap_or_else(|e| panic!("fixture integration {name}: {e}"))
    }

    /// In-memory backends plus the tenancy services wired over them.
    ///
    /// Each backend is held concretely so tests can inject faults and
    /// inspect state.
    #[derive(Clone)]
    pub struct TestStack {
        pub config: EnclaveConfig,
        pub tenants: Arc<MemoryTenantStore>,
        pub vault: Arc<MemoryVault>,
        pub objects: Arc<MemoryObjectStore>,
        pub database: Arc<MemoryDatabase>,
        pub registry: TenantRegistry,
        pub secrets: SecretPathAllocator,
        pub cascade: RevocationCascade,
    }

    impl TestStack {
        pub fn new() -> Self {
            Self::with_config(EnclaveConfig::default())
        }

        #[track_caller]
        pub fn with_config(config: EnclaveConfig) -> Self {
            let tenants = Arc::new(MemoryTenantStore::new());
            let vault = Arc::new(MemoryVault::new());
            let objects = Arc::new(MemoryObjectStore::new());
            let database = Arc::new(MemoryDatabase::new(config.tenant_setting.clone()));
            let registry = TenantRegistry::new(tenants.clone());
            let secrets = SecretPathAllocator::from_config(registry.clone(), vault.clone(), &config)
                .unwrap_or_else(|e| panic!("fixture config: {e}"));
            let cascade = RevocationCascade::new(
                registry.clone(),
                secrets.clone(),
                objects.clone(),
                database.clone(),
            );
            Self {
                config,
                tenants,
                vault,
                objects,
                database,
                registry,
                secrets,
                cascade,
            }
        }

        /// Register `tenant`, connect `integrations`, grant every role its
        /// storage prefix and create the tenant schema.
        pub async fn onboard(&self, tenant: &TenantId, integrations: &[&str]) -> EnclaveResult<()> {
            self.registry.register(tenant.clone(), tenant.as_str()).await?;
            for name in integrations {
                let integration = IntegrationName::parse(*name)?;
                self.secrets.allocate(tenant, &integration).await?;
            }
            let naming = self.config.naming()?;
            let namer = self.config.resource_namer()?;
            let prefix = naming.storage_prefix(tenant);
            for profile in &self.config.roles {
                let principal = namer.role_name(profile.role, tenant);
                self.objects
                    .grant_prefix(&principal, &prefix, profile.storage_access)
                    .await?;
            }
            self.database
                .schema_create(&naming.tenancy_unit(tenant))
                .await?;
            Ok(())
        }

        pub async fn snapshot(&self) -> BackendSnapshot {
            BackendSnapshot::capture(&self.tenants, &self.vault, &self.objects, &self.database)
                .await
        }
    }

    impl Default for TestStack {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Tenant-tagged row for `MemoryDatabase::seed`.
    pub fn tenant_row(column: &str, tenant: &TenantId, id: i64, body: &str) -> enclave_storage::Row {
        [
            (column.to_string(), serde_json::json!(tenant.as_str())),
            ("id".to_string(), serde_json::json!(id)),
            ("body".to_string(), serde_json::json!(body)),
        ]
        .into_iter()
        .collect()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for ENCLAVE-specific validation.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &EnclaveResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &EnclaveResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    /// Assert that a result is a Tenancy error matching `pred`.
    #[track_caller]
    pub fn assert_tenancy_error<T: std::fmt::Debug>(
        result: &EnclaveResult<T>,
        expected: &str,
        pred: impl Fn(&TenancyError) -> bool,
    ) {
        match result {
            Err(EnclaveError::Tenancy(e)) if pred(e) => {}
            other => panic!("Expected {expected}, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &EnclaveResult<T>) {
        assert_tenancy_error(result, "NotFound", |e| {
            matches!(e, TenancyError::NotFound { .. })
        });
    }

    #[track_caller]
    pub fn assert_tenant_inactive<T: std::fmt::Debug>(result: &EnclaveResult<T>) {
        assert_tenancy_error(result, "TenantInactive", |e| {
            matches!(e, TenancyError::TenantInactive { .. })
        });
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &EnclaveResult<T>) {
        match result {
            Err(EnclaveError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_retryable<T: std::fmt::Debug>(result: &EnclaveResult<T>) {
        match result {
            Err(e) if e.is_retryable() => {}
            other => panic!("Expected retryable error, got: {:?}", other),
        }
    }

    /// Assert that no name in `names` mentions `other` as a path segment,
    /// prefix or schema.
    #[track_caller]
    pub fn assert_names_exclude_tenant<'a>(
        names: impl IntoIterator<Item = &'a str>,
        other: &TenantId,
    ) {
        let segment = format!("/{}/", other);
        let prefix = format!("{}/", other);
        for name in names {
            assert!(
                !name.contains(&segment) && !name.starts_with(&prefix) && name != other.as_str(),
                "{name} references tenant {other}"
            );
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
