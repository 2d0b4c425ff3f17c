//! Subcommand definitions and handlers.

use crate::error::{CliError, CliResult};
use crate::workspace::Workspace;
use async_trait::async_trait;
use clap::Subcommand;
use enclave_core::{AgentRole, EnclaveResult, IntegrationName, StorageAction, TenantId};
use enclave_policy::{
    launch_validated, ComputeLauncher, LaunchDescriptor, StoragePartitionPolicy,
    StoragePrincipal, StorageRequest, TenancyDdl, TenancyScope,
};
use serde_json::json;

const DEFAULT_TENANT_COLUMN: &str = "tenant_id";

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Register a tenant and provision its storage grants and schema
    Onboard {
        tenant: TenantId,
        /// Display name (defaults to the tenant id)
        #[arg(long)]
        name: Option<String>,
    },
    /// Allocate the secret path for an integration
    Connect {
        tenant: TenantId,
        integration: IntegrationName,
    },
    /// Remove an integration's secret path
    Disconnect {
        tenant: TenantId,
        integration: IntegrationName,
    },
    /// Print the access policy for a role instance
    Scope { tenant: TenantId, role: AgentRole },
    /// Build, validate and hand off a launch descriptor
    Launch { tenant: TenantId, role: AgentRole },
    /// Render the identity policy, bucket policy and row-level security DDL
    Render {
        tenant: TenantId,
        role: AgentRole,
        /// Tenancy-scoped table, optionally with its tenant column
        #[arg(long = "table", value_name = "TABLE[:COLUMN]")]
        tables: Vec<String>,
    },
    /// Evaluate one storage request for a role instance
    CheckKey {
        tenant: TenantId,
        role: AgentRole,
        action: StorageAction,
        /// Object key; omit to address the bucket root
        key: Option<String>,
    },
    /// Suspend an active tenant
    Suspend { tenant: TenantId },
    /// Reactivate a suspended tenant
    Reactivate { tenant: TenantId },
    /// Mark a tenant deleted and revoke everything it owned
    Delete { tenant: TenantId },
    /// List every tenant, tombstones included
    List,
}

impl Command {
    /// Whether the command can change backend state.
    pub fn mutates(&self) -> bool {
        matches!(
            self,
            Command::Onboard { .. }
                | Command::Connect { .. }
                | Command::Disconnect { .. }
                | Command::Suspend { .. }
                | Command::Reactivate { .. }
                | Command::Delete { .. }
        )
    }
}

/// Result of a command: the JSON body for stdout and whether the request
/// was granted.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub body: serde_json::Value,
    pub granted: bool,
}

impl CommandOutput {
    fn ok(body: serde_json::Value) -> Self {
        Self {
            body,
            granted: true,
        }
    }
}

/// Hands descriptors to the provisioning layer on stdout.
///
/// The task id is derived from the policy fingerprint, so handing off the
/// same descriptor twice yields the same id.
struct HandoffLauncher;

#[async_trait]
impl ComputeLauncher for HandoffLauncher {
    async fn launch(&self, descriptor: &LaunchDescriptor) -> EnclaveResult<String> {
        let fingerprint = descriptor.policy_fingerprint.as_str();
        let short = fingerprint.get(..12).unwrap_or(fingerprint);
        Ok(format!("{}-{}-{}", descriptor.tenant_id, descriptor.role, short))
    }
}

fn parse_table_arg(arg: &str) -> CliResult<(&str, &str)> {
    let (table, column) = match arg.split_once(':') {
        Some((table, column)) => (table, column),
        None => (arg, DEFAULT_TENANT_COLUMN),
    };
    if table.is_empty() || column.is_empty() {
        return Err(CliError::TableArg(arg.to_string()));
    }
    Ok((table, column))
}

pub async fn execute(ws: &Workspace, command: Command) -> CliResult<CommandOutput> {
    match command {
        Command::Onboard { tenant, name } => {
            let display_name = name.unwrap_or_else(|| tenant.to_string());
            let tenant = ws.onboard(tenant, display_name).await?;
            Ok(CommandOutput::ok(serde_json::to_value(tenant)?))
        }
        Command::Connect {
            tenant,
            integration,
        } => {
            let path = ws.secrets.allocate(&tenant, &integration).await?;
            Ok(CommandOutput::ok(json!({
                "tenant_id": tenant,
                "integration": integration,
                "path": path,
            })))
        }
        Command::Disconnect {
            tenant,
            integration,
        } => {
            let removed = ws.secrets.disconnect(&tenant, &integration).await?;
            Ok(CommandOutput::ok(json!({
                "tenant_id": tenant,
                "integration": integration,
                "removed": removed,
            })))
        }
        Command::Scope { tenant, role } => {
            let policy = ws.scoper()?.scope_for(&tenant, role).await?;
            Ok(CommandOutput::ok(json!({
                "policy": policy,
                "fingerprint": policy.fingerprint()?,
            })))
        }
        Command::Launch { tenant, role } => {
            let builder = ws.launch_builder()?;
            let descriptor = builder.build(&tenant, role).await?;
            let task_id = launch_validated(&builder, &HandoffLauncher, &descriptor).await?;
            Ok(CommandOutput::ok(json!({
                "task_id": task_id,
                "descriptor": descriptor,
            })))
        }
        Command::Render {
            tenant,
            role,
            tables,
        } => {
            let scoper = ws.scoper()?;
            let policy = scoper.scope_for(&tenant, role).await?;
            let bucket = ws.config.resource_namer()?.bucket()?;

            let mut scope = TenancyScope::from_config(&ws.config);
            for arg in &tables {
                let (table, column) = parse_table_arg(arg)?;
                scope = scope.with_table(table, column)?;
            }
            let storage = StoragePartitionPolicy::new(scoper.binder().clone());
            let bucket_policy =
                storage.render_bucket_policy(&bucket, &[StoragePrincipal::from(&policy)]);

            Ok(CommandOutput::ok(json!({
                "identity_policy": policy.render_iam_document(&bucket),
                "bucket_policy": bucket_policy.to_json(),
                "database": {
                    "session": scope.bind_sql(),
                    "ddl": TenancyDdl::render(&scope, &policy.tenancy_unit),
                    "teardown": TenancyDdl::drop_statements(&policy.tenancy_unit),
                },
            })))
        }
        Command::CheckKey {
            tenant,
            role,
            action,
            key,
        } => {
            let scoper = ws.scoper()?;
            let policy = scoper.scope_for(&tenant, role).await?;
            let request = match key {
                Some(key) => StorageRequest::new(action, key),
                None => StorageRequest::bucket_root(action),
            };
            let decision = StoragePartitionPolicy::new(scoper.binder().clone())
                .evaluate(&StoragePrincipal::from(&policy), &request);
            Ok(CommandOutput {
                granted: decision.is_allowed(),
                body: json!({
                    "identity": policy.identity.role_name,
                    "request": request,
                    "decision": decision,
                }),
            })
        }
        Command::Suspend { tenant } => Ok(CommandOutput::ok(serde_json::to_value(
            ws.registry.suspend(&tenant).await?,
        )?)),
        Command::Reactivate { tenant } => Ok(CommandOutput::ok(serde_json::to_value(
            ws.registry.reactivate(&tenant).await?,
        )?)),
        Command::Delete { tenant } => {
            ws.registry.mark_deleted(&tenant).await?;
            let report = ws.cascade.run_and_verify(&tenant).await?;
            Ok(CommandOutput::ok(serde_json::to_value(report)?))
        }
        Command::List => Ok(CommandOutput::ok(serde_json::to_value(
            ws.registry.list().await?,
        )?)),
    }
}
