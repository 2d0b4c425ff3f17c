//! Configuration types

use crate::*;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Session setting the database policies key off.
pub const DEFAULT_TENANT_SETTING: &str = "app.tenant_id";

static SETTING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]*\.[a-z_][a-z0-9_]*$").expect("setting regex is valid"));

/// A subnet tasks may be placed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub id: String,
    /// Whether the subnet routes to an internet gateway.
    #[serde(default)]
    pub public: bool,
}

impl SubnetConfig {
    pub fn private(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            public: false,
        }
    }
}

/// Network placement for agent tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub subnets: Vec<SubnetConfig>,
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub assign_public_ip: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnets: vec![
                SubnetConfig::private("subnet-private-a"),
                SubnetConfig::private("subnet-private-b"),
            ],
            security_groups: vec!["sg-agent-tasks".to_string()],
            assign_public_ip: false,
        }
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnclaveConfig {
    pub project: String,
    pub environment: String,
    pub secret_namespace: String,
    /// Database session setting carrying the tenant id.
    pub tenant_setting: String,
    pub network: NetworkConfig,
    pub roles: Vec<RoleProfile>,
    /// Capability scope per integration; unknown integrations fall back to
    /// `<name>.readonly`.
    #[serde(default)]
    pub integration_capabilities: BTreeMap<IntegrationName, Capability>,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            project: "enclave".to_string(),
            environment: "dev".to_string(),
            secret_namespace: DEFAULT_SECRET_NAMESPACE.to_string(),
            tenant_setting: DEFAULT_TENANT_SETTING.to_string(),
            network: NetworkConfig::default(),
            roles: default_role_profiles(),
            integration_capabilities: default_capabilities(),
        }
    }
}

fn integration(name: &'static str) -> IntegrationName {
    IntegrationName::parse(name).unwrap_or_else(|e| panic!("built-in integration {name}: {e}"))
}

/// Built-in role catalogue.
pub fn default_role_profiles() -> Vec<RoleProfile> {
    vec![
        RoleProfile::new(AgentRole::Butler, AccessLevel::ReadWrite)
            .with_required(integration("gmail"))
            .with_optional(integration("google-calendar")),
        RoleProfile::new(AgentRole::Scout, AccessLevel::ReadWrite)
            .with_optional(integration("hubspot"))
            .with_optional(integration("linkedin")),
        RoleProfile::new(AgentRole::Strategist, AccessLevel::ReadOnly)
            .with_optional(integration("hubspot"))
            .with_limits(ResourceLimits {
                cpu_units: 1024,
                memory_mib: 2048,
            }),
    ]
}

fn default_capabilities() -> BTreeMap<IntegrationName, Capability> {
    [
        ("gmail", "mail.readonly"),
        ("google-calendar", "calendar.readonly"),
        ("hubspot", "crm.readwrite"),
        ("linkedin", "profile.readonly"),
    ]
    .into_iter()
    .map(|(name, scope)| (integration(name), Capability::new(scope)))
    .collect()
}

impl EnclaveConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `ENCLAVE_PROJECT`: project prefix for global names (default: enclave)
    /// - `ENCLAVE_ENVIRONMENT`: environment name (default: dev)
    /// - `ENCLAVE_SECRET_NAMESPACE`: secret path namespace (default: secrets)
    /// - `ENCLAVE_TENANT_SETTING`: database session setting (default: app.tenant_id)
    /// - `ENCLAVE_SUBNETS`: comma-separated private subnet ids
    /// - `ENCLAVE_SECURITY_GROUPS`: comma-separated security group ids
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let list = |var: &str| -> Option<Vec<String>> {
            std::env::var(var).ok().map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
        };

        let mut network = defaults.network.clone();
        if let Some(subnets) = list("ENCLAVE_SUBNETS") {
            network.subnets = subnets.into_iter().map(SubnetConfig::private).collect();
        }
        if let Some(groups) = list("ENCLAVE_SECURITY_GROUPS") {
            network.security_groups = groups;
        }

        Self {
            project: std::env::var("ENCLAVE_PROJECT").unwrap_or(defaults.project),
            environment: std::env::var("ENCLAVE_ENVIRONMENT").unwrap_or(defaults.environment),
            secret_namespace: std::env::var("ENCLAVE_SECRET_NAMESPACE")
                .unwrap_or(defaults.secret_namespace),
            tenant_setting: std::env::var("ENCLAVE_TENANT_SETTING")
                .unwrap_or(defaults.tenant_setting),
            network,
            roles: defaults.roles,
            integration_capabilities: defaults.integration_capabilities,
        }
    }

    /// Parse a TOML document and validate it.
    pub fn from_toml_str(raw: &str) -> EnclaveResult<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - project/environment/namespace are valid name components
    /// - tenant_setting is a two-part custom setting name
    /// - at least one subnet; no public subnet; no public IP assignment
    /// - every role appears exactly once with non-zero limits
    pub fn validate(&self) -> EnclaveResult<()> {
        ResourceNamer::new(&self.project, &self.environment)?;
        NamingConvention::new(&self.secret_namespace)?;

        if !SETTING_RE.is_match(&self.tenant_setting) {
            return Err(invalid(
                "tenant_setting",
                &self.tenant_setting,
                "must look like 'app.tenant_id'",
            ));
        }

        if self.network.subnets.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "network.subnets".to_string(),
            }
            .into());
        }
        if let Some(public) = self.network.subnets.iter().find(|s| s.public) {
            return Err(invalid(
                "network.subnets",
                &public.id,
                "agent tasks may only be placed in private subnets",
            ));
        }
        if self.network.assign_public_ip {
            return Err(invalid(
                "network.assign_public_ip",
                "true",
                "agent tasks must not receive public addresses",
            ));
        }
        if self.network.security_groups.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "network.security_groups".to_string(),
            }
            .into());
        }

        for role in AgentRole::ALL {
            let count = self.roles.iter().filter(|p| p.role == role).count();
            if count != 1 {
                return Err(invalid(
                    "roles",
                    role.as_str(),
                    &format!("expected exactly one profile, found {count}"),
                ));
            }
        }
        for profile in &self.roles {
            if profile.limits.cpu_units == 0 || profile.limits.memory_mib == 0 {
                return Err(invalid(
                    "roles.limits",
                    profile.role.as_str(),
                    "cpu_units and memory_mib must be positive",
                ));
            }
        }

        Ok(())
    }

    pub fn naming(&self) -> EnclaveResult<NamingConvention> {
        NamingConvention::new(&self.secret_namespace)
    }

    pub fn resource_namer(&self) -> EnclaveResult<ResourceNamer> {
        ResourceNamer::new(&self.project, &self.environment)
    }

    pub fn role_profile(&self, role: AgentRole) -> EnclaveResult<&RoleProfile> {
        self.roles
            .iter()
            .find(|p| p.role == role)
            .ok_or_else(|| EnclaveError::not_found("role profile", role.as_str()))
    }

    pub fn capability_for(&self, integration: &IntegrationName) -> Capability {
        self.integration_capabilities
            .get(integration)
            .cloned()
            .unwrap_or_else(|| Capability::read_only_for(integration))
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> EnclaveError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_config_error(result: EnclaveResult<()>) {
        match result {
            Err(EnclaveError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        EnclaveConfig::default().validate().unwrap();
    }

    #[test]
    fn test_public_subnet_rejected() {
        let mut config = EnclaveConfig::default();
        config.network.subnets.push(SubnetConfig {
            id: "subnet-public-a".to_string(),
            public: true,
        });
        assert_config_error(config.validate());
    }

    #[test]
    fn test_public_ip_rejected() {
        let mut config = EnclaveConfig::default();
        config.network.assign_public_ip = true;
        assert_config_error(config.validate());
    }

    #[test]
    fn test_missing_role_rejected() {
        let mut config = EnclaveConfig::default();
        config.roles.retain(|p| p.role != AgentRole::Scout);
        assert_config_error(config.validate());
    }

    #[test]
    fn test_duplicate_role_rejected() {
        let mut config = EnclaveConfig::default();
        let butler = config.roles[0].clone();
        config.roles.push(butler);
        assert_config_error(config.validate());
    }

    #[test]
    fn test_bad_setting_rejected() {
        let mut config = EnclaveConfig::default();
        config.tenant_setting = "tenant_id".to_string();
        assert_config_error(config.validate());
    }

    #[test]
    fn test_capability_fallback() {
        let config = EnclaveConfig::default();
        let gmail = IntegrationName::parse("gmail").unwrap();
        let slack = IntegrationName::parse("slack").unwrap();
        assert_eq!(config.capability_for(&gmail).as_str(), "mail.readonly");
        assert_eq!(config.capability_for(&slack).as_str(), "slack.readonly");
    }

    #[test]
    fn test_butler_requires_gmail() {
        let config = EnclaveConfig::default();
        let butler = config.role_profile(AgentRole::Butler).unwrap();
        assert!(butler.required.contains(&IntegrationName::parse("gmail").unwrap()));
        assert_eq!(butler.storage_access, AccessLevel::ReadWrite);
        let strategist = config.role_profile(AgentRole::Strategist).unwrap();
        assert_eq!(strategist.storage_access, AccessLevel::ReadOnly);
    }

    #[test]
    fn test_from_toml() {
        let raw = r#"
            project = "openclaw"
            environment = "prod"
            secret_namespace = "secrets"
            tenant_setting = "app.tenant_id"

            [network]
            subnets = [{ id = "subnet-1" }, { id = "subnet-2" }]
            security_groups = ["sg-1"]

            [[roles]]
            role = "butler"
            required = ["gmail"]
            optional = ["google-calendar"]
            storage_access = "read_write"

            [[roles]]
            role = "scout"
            storage_access = "read_write"

            [[roles]]
            role = "strategist"
            storage_access = "read_only"
            limits = { cpu_units = 2048, memory_mib = 4096 }

            [integration_capabilities]
            gmail = "mail.readonly"
        "#;
        let config = EnclaveConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.project, "openclaw");
        assert_eq!(config.network.subnets.len(), 2);
        assert_eq!(
            config.role_profile(AgentRole::Strategist).unwrap().limits.memory_mib,
            4096
        );
        assert_eq!(
            config.role_profile(AgentRole::Scout).unwrap().limits,
            ResourceLimits::default()
        );
    }

    #[test]
    fn test_from_toml_rejects_invalid_integration_name() {
        let raw = r#"
            project = "openclaw"
            environment = "prod"
            secret_namespace = "secrets"
            tenant_setting = "app.tenant_id"
            roles = []

            [network]
            subnets = [{ id = "subnet-1" }]
            security_groups = ["sg-1"]

            [integration_capabilities]
            "Bad/Name" = "x"
        "#;
        match EnclaveConfig::from_toml_str(raw) {
            Err(EnclaveError::Config(ConfigError::Parse { .. })) => {}
            other => panic!("Expected parse error, got: {:?}", other),
        }
    }
}
