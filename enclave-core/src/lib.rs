//! ENCLAVE Core - Tenancy Types
//!
//! Identifiers, entities, the naming convention and the error taxonomy shared
//! by every other crate. This crate holds data types and pure derivations
//! only; no I/O.

pub mod config;
pub mod entities;
pub mod enums;
pub mod error;
pub mod identity;
pub mod naming;

pub use config::{
    default_role_profiles, EnclaveConfig, NetworkConfig, SubnetConfig, DEFAULT_TENANT_SETTING,
};
pub use entities::{
    Capability, CredentialBinding, ResourceLimits, RevocationEvent, RoleProfile, Tenant,
};
pub use enums::{AccessLevel, AgentRole, EnumParseError, LifecycleState, StorageAction};
pub use error::{
    ConfigError, EnclaveError, EnclaveResult, StoreError, TenancyError, ValidationError,
};
pub use identity::{
    compute_content_hash, new_event_id, validate_identifier, ContentHash, IntegrationName,
    TenantId, Timestamp, MAX_IDENTIFIER_LEN, MIN_IDENTIFIER_LEN,
};
pub use naming::{
    key_hazard, validate_relative_key, NamingConvention, ResourceNamer, SecretPath,
    StoragePrefix, TenancyUnit, DEFAULT_SECRET_NAMESPACE, GLOB_METACHARACTERS,
    MAX_RESOURCE_NAME_LEN, PATH_SEPARATOR,
};
