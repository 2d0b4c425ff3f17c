//! ENCLAVE Policy - Scoping and Enforcement
//!
//! Everything that decides what a single (tenant, role) task may touch:
//!
//! - [`IdentityBinder`]: tenant-bound execution identities
//! - [`CredentialScoper`]: the access policy for one role instance
//! - [`StoragePartitionPolicy`]: object-store prefix enforcement
//! - [`TenantSession`]: row-level tenancy on database sessions
//! - [`LaunchDescriptorBuilder`]: private, tenant-bound task launches

pub mod database;
pub mod identity;
pub mod launch;
pub mod scoper;
pub mod storage;

pub use database::{SessionState, TenancyDdl, TenancyScope, TenantSession, POLICY_NAME};
pub use identity::{AssumedIdentity, IdentityBinder, ROLE_TAG, TENANT_TAG};
pub use launch::{
    launch_validated, ComputeLauncher, LaunchDescriptor, LaunchDescriptorBuilder,
    NetworkPlacement, RecordingLauncher, SecretReference,
};
pub use scoper::{AccessPolicy, CredentialScoper, PolicyResource, SecretGrant};
pub use storage::{
    BucketPolicyDocument, Decision, DenyReason, Effect, KeyCondition, PolicyStatement,
    PrincipalMatch, StoragePartitionPolicy, StoragePrincipal, StorageRequest,
};
