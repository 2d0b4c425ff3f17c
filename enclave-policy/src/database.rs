//! Database Tenancy Enforcer
//!
//! Wraps a database connection in a session that must be bound to exactly
//! one tenant before any statement runs, and rewrites every statement on a
//! tenancy-scoped table so it can only see or write that tenant's rows.
//! The DDL rendered here installs the same rule in the database itself as
//! row-level security, so a connection that bypasses the session wrapper
//! still fails closed.

use crate::identity::{AssumedIdentity, IdentityBinder};
use enclave_core::{
    validate_identifier, EnclaveConfig, EnclaveResult, TenancyError, TenancyUnit, TenantId,
};
use enclave_storage::{Predicate, QueryResult, SqlConnection, Statement};
use serde::Serialize;
use std::collections::BTreeMap;

/// Name of the row-level security policy created on every scoped table.
pub const POLICY_NAME: &str = "tenant_isolation";

// ============================================================================
// TENANCY SCOPE
// ============================================================================

/// Tables whose rows belong to a tenant, and the setting that selects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenancyScope {
    setting: String,
    /// table -> tenant column
    tables: BTreeMap<String, String>,
}

impl TenancyScope {
    pub fn new(setting: impl Into<String>) -> Self {
        Self {
            setting: setting.into(),
            tables: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &EnclaveConfig) -> Self {
        Self::new(config.tenant_setting.clone())
    }

    /// Mark `table` as tenancy-scoped on `tenant_column`.
    pub fn with_table(mut self, table: &str, tenant_column: &str) -> EnclaveResult<Self> {
        validate_identifier("table", table)?;
        validate_identifier("column", tenant_column)?;
        self.tables
            .insert(table.to_string(), tenant_column.to_string());
        Ok(self)
    }

    pub fn setting(&self) -> &str {
        &self.setting
    }

    pub fn tenant_column(&self, table: &str) -> Option<&str> {
        self.tables.get(table).map(String::as_str)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tables.iter().map(|(t, c)| (t.as_str(), c.as_str()))
    }

    /// SQL run on bind; `$1` is the tenant id.
    pub fn bind_sql(&self) -> String {
        format!("SELECT set_config('{}', $1, false)", self.setting)
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unbound,
    Bound(TenantId),
    Closed,
}

/// A connection that only ever acts for one tenant.
pub struct TenantSession<C: SqlConnection> {
    conn: C,
    scope: TenancyScope,
    state: SessionState,
}

impl<C: SqlConnection> TenantSession<C> {
    /// Wrap a freshly opened connection.
    pub fn new(conn: C, scope: TenancyScope) -> Self {
        Self {
            conn,
            scope,
            state: SessionState::Unbound,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Bind the session to `tenant_id`.
    ///
    /// Re-binding to the same tenant is a no-op; binding to another tenant
    /// is refused for the life of the connection.
    pub async fn bind(&mut self, tenant_id: &TenantId) -> EnclaveResult<()> {
        match &self.state {
            SessionState::Closed => Err(TenancyError::SessionClosed.into()),
            SessionState::Bound(bound) if bound == tenant_id => Ok(()),
            SessionState::Bound(bound) => {
                tracing::warn!(bound = %bound, requested = %tenant_id, "Refused tenant switch on session");
                Err(TenancyError::TenantSwitch {
                    bound: bound.clone(),
                    requested: tenant_id.clone(),
                }
                .into())
            }
            SessionState::Unbound => {
                self.conn
                    .set_setting(&self.scope.setting, tenant_id.as_str())
                    .await?;
                self.state = SessionState::Bound(tenant_id.clone());
                tracing::debug!(tenant_id = %tenant_id, "Database session bound");
                Ok(())
            }
        }
    }

    /// Bind to the tenant an execution identity is verified for.
    pub async fn bind_identity(
        &mut self,
        binder: &IdentityBinder,
        identity: &AssumedIdentity,
        tenant_id: &TenantId,
    ) -> EnclaveResult<()> {
        binder.verify(identity, tenant_id)?;
        self.bind(tenant_id).await
    }

    /// Run a statement for the bound tenant.
    ///
    /// Fails with `TenancyNotSet` while unbound, whatever the table.
    pub async fn execute(&mut self, statement: Statement) -> EnclaveResult<QueryResult> {
        let tenant = match &self.state {
            SessionState::Unbound => {
                tracing::warn!(table = statement.table(), "Statement on unbound session rejected");
                return Err(TenancyError::TenancyNotSet.into());
            }
            SessionState::Closed => return Err(TenancyError::SessionClosed.into()),
            SessionState::Bound(tenant) => tenant.clone(),
        };

        let Some(column) = self.scope.tenant_column(statement.table()).map(str::to_string) else {
            return self.conn.execute(&statement).await;
        };
        let scoped = scope_statement(statement, &column, &tenant)?;
        let result = self.conn.execute(&scoped).await?;

        let owner = serde_json::Value::from(tenant.as_str());
        if let Some(row) = result.rows.iter().find(|r| r.get(&column) != Some(&owner)) {
            return Err(TenancyError::CrossTenantRow {
                table: scoped.table().to_string(),
                bound: tenant,
                requested: row
                    .get(&column)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "null".to_string()),
            }
            .into());
        }
        Ok(result)
    }

    /// Close the connection. Closing twice is harmless.
    pub async fn close(&mut self) -> EnclaveResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.conn.close().await
    }
}

/// Constrain `statement` to rows of `tenant`.
fn scope_statement(statement: Statement, column: &str, tenant: &TenantId) -> EnclaveResult<Statement> {
    let owner = serde_json::Value::from(tenant.as_str());
    let cross_tenant = |table: &str, value: &serde_json::Value| TenancyError::CrossTenantRow {
        table: table.to_string(),
        bound: tenant.clone(),
        requested: value.to_string(),
    };

    match statement {
        Statement::Insert { table, mut row } => {
            match row.get(column) {
                Some(value) if value != &owner => return Err(cross_tenant(&table, value).into()),
                Some(_) => {}
                None => {
                    row.insert(column.to_string(), owner);
                }
            }
            Ok(Statement::Insert { table, row })
        }
        Statement::Update { table, filter, set } => {
            if let Some(value) = set.get(column) {
                if value != &owner {
                    return Err(cross_tenant(&table, value).into());
                }
            }
            Ok(Statement::Update { table, filter, set }.filtered(Predicate::eq(column, owner)))
        }
        other => Ok(other.filtered(Predicate::eq(column, owner))),
    }
}

// ============================================================================
// DDL
// ============================================================================

/// Renders per-tenant schema and row-level security statements.
pub struct TenancyDdl;

impl TenancyDdl {
    /// Statements creating the tenant's schema and isolating every scoped
    /// table in it.
    ///
    /// `current_setting` is called without `missing_ok`, so a connection
    /// that never set the tenant errors instead of matching nothing or
    /// everything.
    pub fn render(scope: &TenancyScope, unit: &TenancyUnit) -> Vec<String> {
        let schema = unit.quoted();
        let mut statements = vec![format!("CREATE SCHEMA IF NOT EXISTS {schema}")];
        for (table, column) in scope.tables() {
            let qualified = format!("{schema}.\"{table}\"");
            let predicate = format!("\"{column}\" = current_setting('{}')", scope.setting());
            statements.push(format!("ALTER TABLE {qualified} ENABLE ROW LEVEL SECURITY"));
            statements.push(format!("ALTER TABLE {qualified} FORCE ROW LEVEL SECURITY"));
            statements.push(format!("DROP POLICY IF EXISTS {POLICY_NAME} ON {qualified}"));
            statements.push(format!(
                "CREATE POLICY {POLICY_NAME} ON {qualified} USING ({predicate}) WITH CHECK ({predicate})"
            ));
        }
        statements
    }

    /// Statements removing the tenant's schema and everything in it.
    pub fn drop_statements(unit: &TenancyUnit) -> Vec<String> {
        vec![format!("DROP SCHEMA IF EXISTS {} CASCADE", unit.quoted())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_core::{EnclaveError, NamingConvention};
    use enclave_storage::{MemoryDatabase, Row};
    use serde_json::json;

    fn t(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn scope() -> TenancyScope {
        TenancyScope::new("app.tenant_id")
            .with_table("emails", "tenant_id")
            .unwrap()
    }

    async fn seeded() -> MemoryDatabase {
        let db = MemoryDatabase::new("app.tenant_id");
        db.create_tenancy_table("emails", "tenant_id").await;
        db.create_shared_table("plans").await;
        db.seed("emails", row(&[("tenant_id", json!("tenant-a")), ("id", json!(1))])).await;
        db.seed("emails", row(&[("tenant_id", json!("tenant-b")), ("id", json!(2))])).await;
        db.seed("emails", row(&[("tenant_id", json!("tenant-a")), ("id", json!(3))])).await;
        db
    }

    #[tokio::test]
    async fn test_unbound_session_fails_closed() {
        let db = seeded().await;
        let mut session = TenantSession::new(db.connect(), scope());
        for statement in [
            Statement::select("emails"),
            Statement::delete("emails"),
            Statement::select("plans"),
        ] {
            let err = session.execute(statement).await.unwrap_err();
            assert_eq!(err, EnclaveError::Tenancy(TenancyError::TenancyNotSet));
        }
        assert_eq!(db.row_count("emails").await, 3);
    }

    #[tokio::test]
    async fn test_bound_session_never_sees_other_tenant() {
        let db = seeded().await;
        let mut session = TenantSession::new(db.connect(), scope());
        session.bind(&t("tenant-a")).await.unwrap();

        let result = session.execute(Statement::select("emails")).await.unwrap();
        assert_eq!(result.rows.len(), 2);
        assert!(result.rows.iter().all(|r| r["tenant_id"] == json!("tenant-a")));

        let by_id = session
            .execute(Statement::select("emails").filtered(Predicate::eq("id", 2)))
            .await
            .unwrap();
        assert!(by_id.rows.is_empty());
    }

    #[tokio::test]
    async fn test_explicit_foreign_filter_matches_nothing() {
        let db = seeded().await;
        let mut session = TenantSession::new(db.connect(), scope());
        session.bind(&t("tenant-a")).await.unwrap();
        let result = session
            .execute(Statement::select("emails").filtered(Predicate::eq("tenant_id", "tenant-b")))
            .await
            .unwrap();
        assert!(result.rows.is_empty());

        let deleted = session
            .execute(Statement::delete("emails").filtered(Predicate::eq("tenant_id", "tenant-b")))
            .await
            .unwrap();
        assert_eq!(deleted.affected, 0);
        assert_eq!(db.row_count("emails").await, 3);
    }

    #[tokio::test]
    async fn test_writes_are_tagged_and_checked() {
        let db = seeded().await;
        let mut session = TenantSession::new(db.connect(), scope());
        session.bind(&t("tenant-a")).await.unwrap();

        session
            .execute(Statement::insert("emails", row(&[("id", json!(4))])))
            .await
            .unwrap();
        let foreign = session
            .execute(Statement::insert(
                "emails",
                row(&[("id", json!(5)), ("tenant_id", json!("tenant-b"))]),
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            foreign,
            EnclaveError::Tenancy(TenancyError::CrossTenantRow { .. })
        ));

        let steal = session
            .execute(Statement::update("emails", row(&[("tenant_id", json!("tenant-b"))])))
            .await
            .unwrap_err();
        assert!(matches!(
            steal,
            EnclaveError::Tenancy(TenancyError::CrossTenantRow { .. })
        ));

        let updated = session
            .execute(Statement::update("emails", row(&[("read", json!(true))])))
            .await
            .unwrap();
        assert_eq!(updated.affected, 3);

        let mut other = TenantSession::new(db.connect(), scope());
        other.bind(&t("tenant-b")).await.unwrap();
        let b_rows = other.execute(Statement::select("emails")).await.unwrap();
        assert_eq!(b_rows.rows.len(), 1);
        assert!(b_rows.rows[0].get("read").is_none());
    }

    #[tokio::test]
    async fn test_tenant_switch_refused() {
        let db = seeded().await;
        let mut session = TenantSession::new(db.connect(), scope());
        session.bind(&t("tenant-a")).await.unwrap();
        session.bind(&t("tenant-a")).await.unwrap();
        let err = session.bind(&t("tenant-b")).await.unwrap_err();
        assert!(matches!(
            err,
            EnclaveError::Tenancy(TenancyError::TenantSwitch { .. })
        ));
        assert_eq!(session.state(), &SessionState::Bound(t("tenant-a")));
    }

    #[tokio::test]
    async fn test_closed_session_rejects_everything() {
        let db = seeded().await;
        let mut session = TenantSession::new(db.connect(), scope());
        session.bind(&t("tenant-a")).await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(
            session.execute(Statement::select("emails")).await.unwrap_err(),
            EnclaveError::Tenancy(TenancyError::SessionClosed)
        );
        assert!(session.bind(&t("tenant-a")).await.is_err());
    }

    #[tokio::test]
    async fn test_shared_tables_pass_through_when_bound() {
        let db = seeded().await;
        db.seed("plans", row(&[("name", json!("pro"))])).await;
        let mut session = TenantSession::new(db.connect(), scope());
        session.bind(&t("tenant-a")).await.unwrap();
        let plans = session.execute(Statement::select("plans")).await.unwrap();
        assert_eq!(plans.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_bind_identity_verifies_binding() {
        let db = seeded().await;
        let binder = IdentityBinder::from_config(&EnclaveConfig::default()).unwrap();
        let identity = binder.derive(&t("tenant-a"), enclave_core::AgentRole::Butler);
        let mut session = TenantSession::new(db.connect(), scope());
        assert!(session
            .bind_identity(&binder, &identity, &t("tenant-b"))
            .await
            .is_err());
        assert_eq!(session.state(), &SessionState::Unbound);
        session
            .bind_identity(&binder, &identity, &t("tenant-a"))
            .await
            .unwrap();
    }

    #[test]
    fn test_rendered_ddl() {
        let unit = NamingConvention::default().tenancy_unit(&t("tenant-a"));
        let ddl = TenancyDdl::render(&scope(), &unit);
        assert_eq!(ddl[0], "CREATE SCHEMA IF NOT EXISTS \"tenant-a\"");
        assert_eq!(
            ddl[1],
            "ALTER TABLE \"tenant-a\".\"emails\" ENABLE ROW LEVEL SECURITY"
        );
        assert_eq!(ddl[2], "ALTER TABLE \"tenant-a\".\"emails\" FORCE ROW LEVEL SECURITY");
        assert!(ddl[4].contains("current_setting('app.tenant_id')"));
        assert!(!ddl[4].contains("true)"));
        assert_eq!(
            TenancyDdl::drop_statements(&unit),
            vec!["DROP SCHEMA IF EXISTS \"tenant-a\" CASCADE".to_string()]
        );
        assert_eq!(scope().bind_sql(), "SELECT set_config('app.tenant_id', $1, false)");
    }

    #[test]
    fn test_scope_rejects_unsafe_table_names() {
        assert!(TenancyScope::new("app.tenant_id")
            .with_table("emails\"; drop", "tenant_id")
            .is_err());
    }
}
