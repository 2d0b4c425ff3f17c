//! Naming convention for every tenant-derived resource.
//!
//! All names that reach the provisioning layer are produced here. The
//! formats are fixed for compatibility with existing deployments:
//!
//! - secret paths: `{namespace}/{tenantId}/{integrationName}`
//! - storage keys: `{tenantId}/{...}`
//! - database tenancy units: schema `{tenantId}`
//!
//! # Collision property
//!
//! Identifiers cannot contain `/` and every derived prefix ends in `/`, so
//! the prefix of tenant A is a prefix of the prefix (or any key) of tenant B
//! only when A == B. `acme/` never matches `acme-co/...`.

use crate::{
    compute_content_hash, AgentRole, ConfigError, EnclaveResult, IntegrationName, TenantId,
    ValidationError,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between path components.
pub const PATH_SEPARATOR: char = '/';

/// Default secret namespace.
pub const DEFAULT_SECRET_NAMESPACE: &str = "secrets";

/// Upper bound for provider-global resource names (role names, buckets).
pub const MAX_RESOURCE_NAME_LEN: usize = 63;

static NAMESPACE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9_-]*(?:/[a-z0-9][a-z0-9_-]*)*$").expect("namespace regex is valid")
});

static RESOURCE_PART_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9](?:[a-z0-9-]*[a-z0-9])?$").expect("resource regex is valid"));

// ============================================================================
// DERIVED NAMES
// ============================================================================

/// Secret-store path for one (tenant, integration) binding.
///
/// Deserialization re-checks that `path` ends in `/{tenant_id}/{integration}`
/// under a well-formed namespace, so a stored path can never disagree with
/// the tenant it claims to belong to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawSecretPath")]
pub struct SecretPath {
    path: String,
    tenant_id: TenantId,
    integration: IntegrationName,
}

impl SecretPath {
    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn integration(&self) -> &IntegrationName {
        &self.integration
    }
}

#[derive(Deserialize)]
struct RawSecretPath {
    path: String,
    tenant_id: TenantId,
    integration: IntegrationName,
}

impl TryFrom<RawSecretPath> for SecretPath {
    type Error = ValidationError;

    fn try_from(raw: RawSecretPath) -> Result<Self, Self::Error> {
        let suffix = format!("{}{}{}{}", PATH_SEPARATOR, raw.tenant_id, PATH_SEPARATOR, raw.integration);
        match raw.path.strip_suffix(&suffix) {
            Some(namespace) if NAMESPACE_RE.is_match(namespace) => Ok(Self {
                path: raw.path,
                tenant_id: raw.tenant_id,
                integration: raw.integration,
            }),
            _ => Err(inconsistent_name("secret_path", &raw.path, &raw.tenant_id)),
        }
    }
}

impl fmt::Display for SecretPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Prefix of a tenant's partition in the shared object namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawStoragePrefix")]
pub struct StoragePrefix {
    prefix: String,
    tenant_id: TenantId,
}

impl StoragePrefix {
    pub fn as_str(&self) -> &str {
        &self.prefix
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Literal byte-prefix test. No normalisation or pattern matching.
    pub fn is_prefix_of(&self, key: &str) -> bool {
        key.as_bytes().starts_with(self.prefix.as_bytes())
    }
}

#[derive(Deserialize)]
struct RawStoragePrefix {
    prefix: String,
    tenant_id: TenantId,
}

impl TryFrom<RawStoragePrefix> for StoragePrefix {
    type Error = ValidationError;

    fn try_from(raw: RawStoragePrefix) -> Result<Self, Self::Error> {
        if raw.prefix != format!("{}{}", raw.tenant_id, PATH_SEPARATOR) {
            return Err(inconsistent_name("storage_prefix", &raw.prefix, &raw.tenant_id));
        }
        Ok(Self {
            prefix: raw.prefix,
            tenant_id: raw.tenant_id,
        })
    }
}

impl fmt::Display for StoragePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix)
    }
}

/// Per-tenant schema in the shared database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawTenancyUnit")]
pub struct TenancyUnit {
    schema: String,
    tenant_id: TenantId,
}

impl TenancyUnit {
    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Schema as a double-quoted SQL identifier.
    ///
    /// Identifiers never contain `"`, so no escaping is required.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.schema)
    }
}

#[derive(Deserialize)]
struct RawTenancyUnit {
    schema: String,
    tenant_id: TenantId,
}

impl TryFrom<RawTenancyUnit> for TenancyUnit {
    type Error = ValidationError;

    fn try_from(raw: RawTenancyUnit) -> Result<Self, Self::Error> {
        if raw.schema != raw.tenant_id.as_str() {
            return Err(inconsistent_name("tenancy_unit", &raw.schema, &raw.tenant_id));
        }
        Ok(Self {
            schema: raw.schema,
            tenant_id: raw.tenant_id,
        })
    }
}

fn inconsistent_name(field: &str, name: &str, tenant_id: &TenantId) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        reason: format!("'{name}' was not derived for tenant {tenant_id}"),
    }
}

impl fmt::Display for TenancyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.schema)
    }
}

// ============================================================================
// NAMING CONVENTION
// ============================================================================

/// Derives tenant resource names from validated identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingConvention {
    namespace: String,
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_SECRET_NAMESPACE.to_string(),
        }
    }
}

impl NamingConvention {
    /// Create a convention rooted at `namespace` (e.g. `secrets`, `prod/secrets`).
    pub fn new(namespace: impl Into<String>) -> EnclaveResult<Self> {
        let namespace = namespace.into();
        if !NAMESPACE_RE.is_match(&namespace) {
            return Err(ConfigError::InvalidValue {
                field: "secret_namespace".to_string(),
                value: namespace,
                reason: "must be lowercase path segments separated by '/'".to_string(),
            }
            .into());
        }
        Ok(Self { namespace })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `{namespace}/{tenantId}/{integrationName}`
    pub fn secret_path(&self, tenant_id: &TenantId, integration: &IntegrationName) -> SecretPath {
        SecretPath {
            path: format!("{}/{}/{}", self.namespace, tenant_id, integration),
            tenant_id: tenant_id.clone(),
            integration: integration.clone(),
        }
    }

    /// `{namespace}/{tenantId}/`; every secret path of the tenant starts with this.
    pub fn secret_prefix(&self, tenant_id: &TenantId) -> String {
        format!("{}/{}/", self.namespace, tenant_id)
    }

    /// `{tenantId}/`
    pub fn storage_prefix(&self, tenant_id: &TenantId) -> StoragePrefix {
        StoragePrefix {
            prefix: format!("{}{}", tenant_id, PATH_SEPARATOR),
            tenant_id: tenant_id.clone(),
        }
    }

    /// `{tenantId}/{relative}` after validating the relative part.
    pub fn storage_key(&self, tenant_id: &TenantId, relative: &str) -> EnclaveResult<String> {
        validate_relative_key(relative)?;
        Ok(format!("{}{}{}", tenant_id, PATH_SEPARATOR, relative))
    }

    /// Schema `{tenantId}`
    pub fn tenancy_unit(&self, tenant_id: &TenantId) -> TenancyUnit {
        TenancyUnit {
            schema: tenant_id.as_str().to_string(),
            tenant_id: tenant_id.clone(),
        }
    }

    /// Recover the owning tenant from a secret path under this namespace.
    pub fn tenant_of_secret_path(&self, path: &str) -> Option<TenantId> {
        let rest = path.strip_prefix(&self.namespace)?.strip_prefix(PATH_SEPARATOR)?;
        let (tenant, integration) = rest.split_once(PATH_SEPARATOR)?;
        if integration.is_empty() || integration.contains(PATH_SEPARATOR) {
            return None;
        }
        TenantId::parse(tenant).ok()
    }
}

/// Characters that could be interpreted as patterns by a policy engine.
pub const GLOB_METACHARACTERS: &[char] = &['*', '?', '[', ']', '{', '}'];

/// Validate a key relative to a tenant prefix.
///
/// Rejects anything a downstream matcher might interpret rather than compare
/// literally: glob characters, dot segments, empty segments, backslashes and
/// control characters.
pub fn validate_relative_key(relative: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidKey {
        key: relative.to_string(),
        reason: reason.to_string(),
    };

    if relative.is_empty() {
        return Err(invalid("empty key"));
    }
    if relative.starts_with(PATH_SEPARATOR) {
        return Err(invalid("leading separator"));
    }
    if let Some(reason) = key_hazard(relative) {
        return Err(invalid(reason));
    }
    Ok(())
}

/// First reason a full object key is unsafe to compare literally, if any.
pub fn key_hazard(key: &str) -> Option<&'static str> {
    if key.chars().any(|c| GLOB_METACHARACTERS.contains(&c)) {
        return Some("glob metacharacter");
    }
    if key.contains('\\') {
        return Some("backslash");
    }
    if key.chars().any(char::is_control) {
        return Some("control character");
    }
    if key.contains("//") {
        return Some("empty path segment");
    }
    if key.split(PATH_SEPARATOR).any(|seg| seg == "." || seg == "..") {
        return Some("dot segment");
    }
    None
}

// ============================================================================
// GLOBAL RESOURCE NAMES
// ============================================================================

/// Builds provider-global names as `{project}-{environment}-{resource}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNamer {
    project: String,
    environment: String,
}

impl ResourceNamer {
    pub fn new(project: impl Into<String>, environment: impl Into<String>) -> EnclaveResult<Self> {
        let project = project.into();
        let environment = environment.into();
        validate_resource_part("project", &project)?;
        validate_resource_part("environment", &environment)?;
        Ok(Self {
            project,
            environment,
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// `{project}-{environment}-{resource}`.
    ///
    /// Names longer than [`MAX_RESOURCE_NAME_LEN`] are truncated and suffixed
    /// with 16 hex digits of the SHA-256 of the full name, so distinct inputs
    /// still produce distinct names.
    pub fn name(&self, resource: &str) -> EnclaveResult<String> {
        for part in resource.split('-') {
            validate_resource_part("resource", part)?;
        }
        let full = format!("{}-{}-{}", self.project, self.environment, resource);
        Ok(fit_resource_name(full))
    }

    /// Name of the shared tenant-data bucket.
    pub fn bucket(&self) -> EnclaveResult<String> {
        self.name("tenant-data")
    }

    /// Name of the agent cluster.
    pub fn cluster(&self) -> EnclaveResult<String> {
        self.name("agents")
    }

    /// Execution identity name for one (tenant, role) instance:
    /// `{project}-{environment}-{role}-{tenantId}`.
    ///
    /// Roles never contain `-`, so the tenant id is everything after the
    /// role segment. Tenant ids are already validated and may contain `_`,
    /// which the generic resource charset rejects.
    pub fn role_name(&self, role: AgentRole, tenant_id: &TenantId) -> String {
        fit_resource_name(format!(
            "{}-{}-{}-{}",
            self.project, self.environment, role, tenant_id
        ))
    }

    /// Log group for one role's tasks: `/{project}/{environment}/{role}`.
    pub fn log_group(&self, role: &str) -> EnclaveResult<String> {
        validate_resource_part("role", role)?;
        Ok(format!("/{}/{}/{}", self.project, self.environment, role))
    }
}

fn fit_resource_name(full: String) -> String {
    if full.len() <= MAX_RESOURCE_NAME_LEN {
        return full;
    }
    let digest = hex::encode(compute_content_hash(full.as_bytes()));
    let keep = MAX_RESOURCE_NAME_LEN - 17;
    let head = full[..keep].trim_end_matches('-');
    format!("{}-{}", head, &digest[..16])
}

fn validate_resource_part(field: &str, value: &str) -> Result<(), ConfigError> {
    if RESOURCE_PART_RE.is_match(value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: "must be lowercase alphanumerics separated by '-'".to_string(),
        })
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Prefix containment between two tenants holds only for equal ids.
        #[test]
        fn prop_prefixes_nest_only_when_equal(
            a in "[a-o][a-z0-9-]{0,20}[a-z0-9]",
            b in "[a-o][a-z0-9-]{0,20}[a-z0-9]",
            rest in "[a-z0-9/]{0,20}",
        ) {
            let naming = NamingConvention::default();
            let ta = TenantId::parse(a).unwrap();
            let tb = TenantId::parse(b).unwrap();
            let pa = naming.storage_prefix(&ta);
            let key_b = format!("{}{}", naming.storage_prefix(&tb).as_str(), rest);
            prop_assert_eq!(pa.is_prefix_of(&key_b), ta == tb);
            prop_assert_eq!(
                naming.secret_prefix(&tb).starts_with(&naming.secret_prefix(&ta)),
                ta == tb
            );
        }
    }
}
