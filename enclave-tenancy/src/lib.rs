//! ENCLAVE Tenancy - Registry, Secret Paths and Teardown
//!
//! Stateful services over the collaborator traits in `enclave-storage`:
//!
//! - [`TenantRegistry`]: tenant identity and lifecycle, revocation fan-out
//! - [`SecretPathAllocator`]: per-tenant secret paths and credential rotation
//! - [`RevocationCascade`]: idempotent teardown of everything a tenant owned

pub mod registry;
pub mod revocation;
pub mod secrets;

pub use registry::TenantRegistry;
pub use revocation::{
    revocation_worker, RevocationCascade, RevocationMetrics, RevocationMetricsSnapshot,
    RevocationReport, RevocationStep, StepOutcome,
};
pub use secrets::SecretPathAllocator;
