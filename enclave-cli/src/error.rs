//! Error types for the enclave CLI

use enclave_core::EnclaveError;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Enclave(#[from] EnclaveError),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed state file {path}: {source}")]
    State {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid --table value '{0}': expected TABLE or TABLE:COLUMN")]
    TableArg(String),

    #[error("Failed to initialize logging: {0}")]
    Telemetry(String),

    #[error("Failed to render output: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CliError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;
