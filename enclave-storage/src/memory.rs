//! In-memory collaborator implementations.
//!
//! Each backend keeps its state behind a `tokio::sync::RwLock`; create-if-absent
//! operations take the write guard for the whole check-and-insert so they are
//! atomic with respect to each other. A [`FaultInjector`] lets tests make a
//! named operation fail until healed.

use crate::sql::{Predicate, QueryResult, Row, SqlConnection, Statement};
use crate::{
    ClaimOutcome, DatabaseCatalog, ObjectStoreGrants, PrefixGrant, SecretVault, TenantStore,
};
use async_trait::async_trait;
use chrono::Utc;
use enclave_core::{
    AccessLevel, CredentialBinding, EnclaveError, EnclaveResult, StoragePrefix, StoreError,
    TenancyUnit, Tenant, TenantId,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Named operations that should fail until healed.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    failing: Arc<Mutex<BTreeSet<String>>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `operation` fail on every call until [`heal`](Self::heal).
    pub fn fail(&self, operation: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(operation.to_string());
        }
    }

    pub fn heal(&self) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.clear();
        }
    }

    fn check(&self, backend: &str, operation: &str) -> EnclaveResult<()> {
        let failing = self.failing.lock().map_err(|_| StoreError::LockPoisoned)?;
        if failing.contains(operation) {
            tracing::debug!(backend, operation, "Injected fault triggered");
            return Err(StoreError::Unavailable {
                backend: backend.to_string(),
                reason: format!("injected fault in {operation}"),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// TENANT STORE
// ============================================================================

/// In-memory tenant store.
#[derive(Debug, Clone, Default)]
pub struct MemoryTenantStore {
    tenants: Arc<RwLock<BTreeMap<TenantId, Tenant>>>,
    faults: FaultInjector,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub async fn tenant_count(&self) -> usize {
        self.tenants.read().await.len()
    }
}

#[async_trait]
impl TenantStore for MemoryTenantStore {
    async fn tenant_create_if_absent(&self, tenant: &Tenant) -> EnclaveResult<bool> {
        self.faults.check("tenant-store", "tenant_create_if_absent")?;
        let mut tenants = self.tenants.write().await;
        if tenants.contains_key(&tenant.tenant_id) {
            return Ok(false);
        }
        tenants.insert(tenant.tenant_id.clone(), tenant.clone());
        Ok(true)
    }

    async fn tenant_get(&self, id: &TenantId) -> EnclaveResult<Option<Tenant>> {
        self.faults.check("tenant-store", "tenant_get")?;
        Ok(self.tenants.read().await.get(id).cloned())
    }

    async fn tenant_update(&self, tenant: &Tenant) -> EnclaveResult<()> {
        self.faults.check("tenant-store", "tenant_update")?;
        let mut tenants = self.tenants.write().await;
        let slot = tenants
            .get_mut(&tenant.tenant_id)
            .ok_or_else(|| EnclaveError::not_found("tenant", tenant.tenant_id.as_str()))?;
        *slot = tenant.clone();
        Ok(())
    }

    async fn tenant_list(&self) -> EnclaveResult<Vec<Tenant>> {
        self.faults.check("tenant-store", "tenant_list")?;
        Ok(self.tenants.read().await.values().cloned().collect())
    }
}

// ============================================================================
// SECRET VAULT
// ============================================================================

#[derive(Debug)]
struct VaultEntry {
    binding: CredentialBinding,
    value: Option<SecretString>,
}

/// In-memory secret vault.
#[derive(Debug, Clone, Default)]
pub struct MemoryVault {
    entries: Arc<RwLock<BTreeMap<String, VaultEntry>>>,
    faults: FaultInjector,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub async fn binding_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether a value has been written at `path`.
    pub async fn has_value(&self, path: &str) -> bool {
        self.entries
            .read()
            .await
            .get(path)
            .map(|e| e.value.is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl SecretVault for MemoryVault {
    async fn binding_claim(&self, binding: &CredentialBinding) -> EnclaveResult<ClaimOutcome> {
        self.faults.check("vault", "binding_claim")?;
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(binding.path.as_str()) {
            let owner = existing.binding.tenant_id();
            if owner == binding.tenant_id() {
                return Ok(ClaimOutcome::AlreadyOwned(existing.binding.clone()));
            }
            return Ok(ClaimOutcome::OwnedBy(owner.clone()));
        }
        entries.insert(
            binding.path.as_str().to_string(),
            VaultEntry {
                binding: binding.clone(),
                value: None,
            },
        );
        Ok(ClaimOutcome::Created)
    }

    async fn binding_get(&self, path: &str) -> EnclaveResult<Option<CredentialBinding>> {
        self.faults.check("vault", "binding_get")?;
        Ok(self.entries.read().await.get(path).map(|e| e.binding.clone()))
    }

    async fn binding_list_prefix(&self, prefix: &str) -> EnclaveResult<Vec<CredentialBinding>> {
        self.faults.check("vault", "binding_list_prefix")?;
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(_, e)| e.binding.clone())
            .collect())
    }

    async fn secret_put(&self, path: &str, value: SecretString) -> EnclaveResult<u32> {
        self.faults.check("vault", "secret_put")?;
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| EnclaveError::not_found("secret path", path))?;
        entry.value = Some(value);
        entry.binding.version += 1;
        entry.binding.rotated_at = Some(Utc::now());
        Ok(entry.binding.version)
    }

    async fn binding_delete(&self, path: &str) -> EnclaveResult<bool> {
        self.faults.check("vault", "binding_delete")?;
        Ok(self.entries.write().await.remove(path).is_some())
    }

    async fn binding_delete_prefix(&self, prefix: &str) -> EnclaveResult<usize> {
        self.faults.check("vault", "binding_delete_prefix")?;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|path, _| !path.starts_with(prefix));
        Ok(before - entries.len())
    }
}

// ============================================================================
// OBJECT STORE GRANTS
// ============================================================================

/// In-memory prefix grant table.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    grants: Arc<RwLock<BTreeMap<(String, String), PrefixGrant>>>,
    faults: FaultInjector,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub async fn grant_count(&self) -> usize {
        self.grants.read().await.len()
    }
}

#[async_trait]
impl ObjectStoreGrants for MemoryObjectStore {
    async fn grant_prefix(
        &self,
        principal: &str,
        prefix: &StoragePrefix,
        access: AccessLevel,
    ) -> EnclaveResult<()> {
        self.faults.check("object-store", "grant_prefix")?;
        let grant = PrefixGrant {
            principal: principal.to_string(),
            prefix: prefix.clone(),
            access,
        };
        self.grants
            .write()
            .await
            .insert((prefix.as_str().to_string(), principal.to_string()), grant);
        Ok(())
    }

    async fn revoke_prefix(&self, prefix: &StoragePrefix) -> EnclaveResult<usize> {
        self.faults.check("object-store", "revoke_prefix")?;
        let mut grants = self.grants.write().await;
        let before = grants.len();
        grants.retain(|(p, _), _| p != prefix.as_str());
        Ok(before - grants.len())
    }

    async fn grants_for_prefix(&self, prefix: &StoragePrefix) -> EnclaveResult<Vec<PrefixGrant>> {
        self.faults.check("object-store", "grants_for_prefix")?;
        Ok(self
            .grants
            .read()
            .await
            .iter()
            .filter(|((p, _), _)| p == prefix.as_str())
            .map(|(_, g)| g.clone())
            .collect())
    }
}

// ============================================================================
// DATABASE
// ============================================================================

#[derive(Debug, Default)]
struct DbState {
    schemas: BTreeSet<String>,
    tables: BTreeMap<String, Vec<Row>>,
    /// table -> tenant column, for tables with row-level security
    tenancy_tables: BTreeMap<String, String>,
}

/// In-memory database with per-session settings and row-level security.
///
/// Tenancy-scoped tables behave like PostgreSQL tables with
/// `FORCE ROW LEVEL SECURITY` and a policy on
/// `current_setting('<tenant_setting>')`: a session without the setting
/// errors instead of seeing rows.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    state: Arc<RwLock<DbState>>,
    tenant_setting: String,
    faults: FaultInjector,
}

impl MemoryDatabase {
    pub fn new(tenant_setting: impl Into<String>) -> Self {
        Self {
            state: Arc::new(RwLock::new(DbState::default())),
            tenant_setting: tenant_setting.into(),
            faults: FaultInjector::new(),
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Declare a table whose rows are filtered by `tenant_column`.
    pub async fn create_tenancy_table(&self, table: &str, tenant_column: &str) {
        let mut state = self.state.write().await;
        state.tables.entry(table.to_string()).or_default();
        state
            .tenancy_tables
            .insert(table.to_string(), tenant_column.to_string());
    }

    /// Declare a table without row-level security.
    pub async fn create_shared_table(&self, table: &str) {
        self.state
            .write()
            .await
            .tables
            .entry(table.to_string())
            .or_default();
    }

    /// Insert as the table owner, bypassing row-level security.
    pub async fn seed(&self, table: &str, row: Row) {
        self.state
            .write()
            .await
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.state
            .read()
            .await
            .tables
            .get(table)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Open a fresh connection with no session settings.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            state: Arc::clone(&self.state),
            tenant_setting: self.tenant_setting.clone(),
            settings: BTreeMap::new(),
            closed: false,
        }
    }
}

#[async_trait]
impl DatabaseCatalog for MemoryDatabase {
    async fn schema_create(&self, unit: &TenancyUnit) -> EnclaveResult<bool> {
        self.faults.check("database", "schema_create")?;
        Ok(self
            .state
            .write()
            .await
            .schemas
            .insert(unit.schema().to_string()))
    }

    async fn schema_drop(&self, unit: &TenancyUnit) -> EnclaveResult<bool> {
        self.faults.check("database", "schema_drop")?;
        let mut state = self.state.write().await;
        let DbState {
            schemas,
            tables,
            tenancy_tables,
        } = &mut *state;
        let tenant = serde_json::Value::from(unit.tenant_id().as_str());
        let mut purged = 0usize;
        for (table, column) in tenancy_tables.iter() {
            if let Some(rows) = tables.get_mut(table) {
                let before = rows.len();
                rows.retain(|row| row.get(column) != Some(&tenant));
                purged += before - rows.len();
            }
        }
        Ok(schemas.remove(unit.schema()) || purged > 0)
    }

    async fn schema_exists(&self, unit: &TenancyUnit) -> EnclaveResult<bool> {
        self.faults.check("database", "schema_exists")?;
        Ok(self.state.read().await.schemas.contains(unit.schema()))
    }
}

fn visible(rls: Option<&Predicate>, row: &Row, filter: &[Predicate]) -> bool {
    rls.map(|p| p.matches(row)).unwrap_or(true) && filter.iter().all(|p| p.matches(row))
}

/// One session against a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryConnection {
    state: Arc<RwLock<DbState>>,
    tenant_setting: String,
    settings: BTreeMap<String, String>,
    closed: bool,
}

impl MemoryConnection {
    fn failure(operation: &str, reason: impl Into<String>) -> EnclaveError {
        StoreError::OperationFailed {
            backend: "database".to_string(),
            operation: operation.to_string(),
            reason: reason.into(),
        }
        .into()
    }

    fn row_tenant_check(column: &str, tenant: &str, row: &Row) -> EnclaveResult<()> {
        match row.get(column) {
            Some(v) if v == &serde_json::Value::from(tenant) => Ok(()),
            _ => Err(Self::failure(
                "execute",
                "new row violates row-level security policy",
            )),
        }
    }
}

#[async_trait]
impl SqlConnection for MemoryConnection {
    async fn set_setting(&mut self, name: &str, value: &str) -> EnclaveResult<()> {
        if self.closed {
            return Err(Self::failure("set_config", "connection closed"));
        }
        self.settings.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn execute(&mut self, statement: &Statement) -> EnclaveResult<QueryResult> {
        if self.closed {
            return Err(Self::failure("execute", "connection closed"));
        }
        let mut state = self.state.write().await;
        let table = statement.table().to_string();
        let rls_column = state.tenancy_tables.get(&table).cloned();
        let rows = state.tables.get_mut(&table).ok_or_else(|| {
            Self::failure("execute", format!("relation \"{table}\" does not exist"))
        })?;

        // USING (tenant_column = current_setting(...)) with missing_ok = false
        let rls = match &rls_column {
            Some(column) => {
                let tenant = self.settings.get(&self.tenant_setting).ok_or_else(|| {
                    Self::failure(
                        "execute",
                        format!("unrecognized configuration parameter \"{}\"", self.tenant_setting),
                    )
                })?;
                Some(Predicate::eq(column.clone(), tenant.clone()))
            }
            None => None,
        };
        let rls = rls.as_ref();

        match statement {
            Statement::Select { filter, .. } => {
                let out: Vec<Row> = rows
                    .iter()
                    .filter(|r| visible(rls, r, filter))
                    .cloned()
                    .collect();
                let affected = out.len();
                Ok(QueryResult {
                    rows: out,
                    affected,
                })
            }
            Statement::Insert { row, .. } => {
                if let (Some(column), Some(Predicate::Eq { value, .. })) = (&rls_column, rls) {
                    let tenant = value.as_str().unwrap_or_default();
                    Self::row_tenant_check(column, tenant, row)?;
                }
                rows.push(row.clone());
                Ok(QueryResult {
                    rows: Vec::new(),
                    affected: 1,
                })
            }
            Statement::Update { filter, set, .. } => {
                if let (Some(column), Some(Predicate::Eq { value, .. })) = (&rls_column, rls) {
                    if let Some(new_tenant) = set.get(column) {
                        if new_tenant != value {
                            return Err(Self::failure(
                                "execute",
                                "new row violates row-level security policy",
                            ));
                        }
                    }
                }
                let mut affected = 0;
                for row in rows.iter_mut() {
                    if !visible(rls, row, filter) {
                        continue;
                    }
                    for (k, v) in set {
                        row.insert(k.clone(), v.clone());
                    }
                    affected += 1;
                }
                Ok(QueryResult {
                    rows: Vec::new(),
                    affected,
                })
            }
            Statement::Delete { filter, .. } => {
                let before = rows.len();
                rows.retain(|r| !visible(rls, r, filter));
                Ok(QueryResult {
                    rows: Vec::new(),
                    affected: before - rows.len(),
                })
            }
        }
    }

    async fn close(&mut self) -> EnclaveResult<()> {
        self.closed = true;
        self.settings.clear();
        Ok(())
    }
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// Serializable state of the in-memory backends.
///
/// Secret values are deliberately absent: a snapshot only records which
/// paths exist and who owns them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendSnapshot {
    pub tenants: Vec<Tenant>,
    pub bindings: Vec<CredentialBinding>,
    pub grants: Vec<PrefixGrant>,
    pub schemas: BTreeSet<String>,
}

impl BackendSnapshot {
    /// Capture the current state of all four backends.
    pub async fn capture(
        tenants: &MemoryTenantStore,
        vault: &MemoryVault,
        objects: &MemoryObjectStore,
        database: &MemoryDatabase,
    ) -> Self {
        Self {
            tenants: tenants.tenants.read().await.values().cloned().collect(),
            bindings: vault
                .entries
                .read()
                .await
                .values()
                .map(|e| e.binding.clone())
                .collect(),
            grants: objects.grants.read().await.values().cloned().collect(),
            schemas: database.state.read().await.schemas.clone(),
        }
    }

    /// Load this snapshot into empty backends.
    pub async fn restore(
        self,
        tenants: &MemoryTenantStore,
        vault: &MemoryVault,
        objects: &MemoryObjectStore,
        database: &MemoryDatabase,
    ) {
        {
            let mut map = tenants.tenants.write().await;
            for tenant in self.tenants {
                map.insert(tenant.tenant_id.clone(), tenant);
            }
        }
        {
            let mut entries = vault.entries.write().await;
            for binding in self.bindings {
                entries.insert(
                    binding.path.as_str().to_string(),
                    VaultEntry {
                        binding,
                        value: None,
                    },
                );
            }
        }
        {
            let mut grants = objects.grants.write().await;
            for grant in self.grants {
                grants.insert(
                    (grant.prefix.as_str().to_string(), grant.principal.clone()),
                    grant,
                );
            }
        }
        database.state.write().await.schemas.extend(self.schemas);
    }
}
