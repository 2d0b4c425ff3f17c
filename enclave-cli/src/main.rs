//! ENCLAVE CLI
//!
//! Operator interface to the tenant isolation layer. State lives in a JSON
//! snapshot standing in for the durable stores.
//!
//! # Usage
//!
//! ```bash
//! enclave onboard acme --name "Acme Corp"
//! enclave connect acme gmail
//! enclave launch acme butler
//! enclave check-key acme scout get globex/leads.json
//! enclave render acme strategist --table emails --table leads:owner
//! enclave delete acme
//! ```

use clap::Parser;
use enclave_core::EnclaveConfig;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod commands;
mod error;
mod telemetry;
mod workspace;

use commands::{Command, CommandOutput};
use error::{CliError, CliResult};
use workspace::Workspace;

/// Exit code for a storage check that was denied.
const EXIT_DENIED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "enclave")]
#[command(version)]
#[command(about = "Tenant isolation and credential scoping for agent workloads", long_about = None)]
struct Cli {
    /// Snapshot file holding tenants, bindings, grants and schemas
    #[arg(long, env = "ENCLAVE_STATE", default_value = "enclave-state.json")]
    state: PathBuf,

    /// TOML configuration file; environment variables are used otherwise
    #[arg(long, env = "ENCLAVE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

fn load_config(path: Option<&Path>) -> CliResult<EnclaveConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| CliError::io(path, e))?;
            Ok(EnclaveConfig::from_toml_str(&raw)?)
        }
        None => {
            let config = EnclaveConfig::from_env();
            config.validate()?;
            Ok(config)
        }
    }
}

async fn run(cli: Cli) -> CliResult<CommandOutput> {
    let config = load_config(cli.config.as_deref())?;
    let ws = Workspace::load(config, &cli.state).await?;

    let persist = cli.command.mutates();
    let result = commands::execute(&ws, cli.command).await;
    // A failed teardown still leaves the tenant marked deleted.
    if persist {
        ws.save(&cli.state).await?;
    }
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = telemetry::init_tracing(cli.log_json) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(output) => match serde_json::to_string_pretty(&output.body) {
            Ok(body) => {
                println!("{body}");
                if output.granted {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::from(EXIT_DENIED)
                }
            }
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
