//! Storage Partition Enforcer
//!
//! Decides whether a principal may perform an action on a key in the shared
//! bucket. The decision is a pure function of the principal, the request and
//! the identity binder. The same rules are rendered into a bucket policy
//! document whose own evaluator must agree with [`StoragePartitionPolicy`]
//! on every request.

use crate::identity::{AssumedIdentity, IdentityBinder};
use crate::scoper::AccessPolicy;
use enclave_core::{
    key_hazard, AccessLevel, AgentRole, StorageAction, StoragePrefix, PATH_SEPARATOR,
};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// REQUESTS AND DECISIONS
// ============================================================================

/// Caller of a storage request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePrincipal {
    pub identity: AssumedIdentity,
    pub prefix: StoragePrefix,
    pub access: AccessLevel,
}

impl From<&AccessPolicy> for StoragePrincipal {
    fn from(policy: &AccessPolicy) -> Self {
        Self {
            identity: policy.identity.clone(),
            prefix: policy.storage_prefix.clone(),
            access: policy.storage_access,
        }
    }
}

/// One request against the shared bucket.
///
/// For `List`, `key` is the list prefix. `None` addresses the bucket root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRequest {
    pub action: StorageAction,
    pub key: Option<String>,
}

impl StorageRequest {
    pub fn new(action: StorageAction, key: impl Into<String>) -> Self {
        Self {
            action,
            key: Some(key.into()),
        }
    }

    pub fn bucket_root(action: StorageAction) -> Self {
        Self { action, key: None }
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DenyReason {
    /// The principal's identity is not bound to the tenant of its prefix.
    IdentityNotBound,
    /// No key: the bucket root is never addressable.
    BucketRoot,
    /// Key could be interpreted rather than compared literally.
    UnsafeKey(String),
    /// Key is outside the principal's prefix.
    OutsidePrefix,
    /// Access level does not include the action.
    ActionNotPermitted,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::IdentityNotBound => f.write_str("identity not bound to tenant"),
            DenyReason::BucketRoot => f.write_str("bucket root request"),
            DenyReason::UnsafeKey(why) => write!(f, "unsafe key: {why}"),
            DenyReason::OutsidePrefix => f.write_str("key outside tenant prefix"),
            DenyReason::ActionNotPermitted => f.write_str("action not permitted"),
        }
    }
}

/// Outcome of evaluating a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny { reason: DenyReason },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    fn deny(reason: DenyReason) -> Self {
        Decision::Deny { reason }
    }
}

/// Reason a key must be denied before any prefix comparison.
fn unsafe_key_reason(key: &str) -> Option<&'static str> {
    if key.is_empty() {
        return Some("empty key");
    }
    if key.starts_with(PATH_SEPARATOR) {
        return Some("leading separator");
    }
    key_hazard(key)
}

// ============================================================================
// EVALUATOR
// ============================================================================

/// Evaluates storage requests against tenant prefixes.
#[derive(Debug, Clone)]
pub struct StoragePartitionPolicy {
    binder: IdentityBinder,
}

impl StoragePartitionPolicy {
    pub fn new(binder: IdentityBinder) -> Self {
        Self { binder }
    }

    /// Allow iff the identity is bound to the prefix's tenant, the key is
    /// safe, the prefix is a literal byte prefix of the key, and the access
    /// level permits the action. Everything else is denied.
    pub fn evaluate(&self, principal: &StoragePrincipal, request: &StorageRequest) -> Decision {
        let decision = self.decide(principal, request);
        match &decision {
            Decision::Allow => tracing::debug!(
                identity = %principal.identity.role_name,
                action = %request.action,
                key = ?request.key,
                "Storage request allowed"
            ),
            Decision::Deny { reason } => tracing::warn!(
                identity = %principal.identity.role_name,
                action = %request.action,
                key = ?request.key,
                %reason,
                "Storage request denied"
            ),
        }
        decision
    }

    fn decide(&self, principal: &StoragePrincipal, request: &StorageRequest) -> Decision {
        if self
            .binder
            .verify(&principal.identity, principal.prefix.tenant_id())
            .is_err()
        {
            return Decision::deny(DenyReason::IdentityNotBound);
        }
        let Some(key) = request.key.as_deref() else {
            return Decision::deny(DenyReason::BucketRoot);
        };
        if let Some(why) = unsafe_key_reason(key) {
            return Decision::deny(DenyReason::UnsafeKey(why.to_string()));
        }
        if !principal.prefix.is_prefix_of(key) {
            return Decision::deny(DenyReason::OutsidePrefix);
        }
        if !principal.access.permits(request.action) {
            return Decision::deny(DenyReason::ActionNotPermitted);
        }
        Decision::Allow
    }

    /// Render the bucket policy for a set of principals.
    pub fn render_bucket_policy(
        &self,
        bucket: &str,
        principals: &[StoragePrincipal],
    ) -> BucketPolicyDocument {
        let mut statements = vec![PolicyStatement {
            sid: "DenyUnsafeKeys".to_string(),
            effect: Effect::Deny,
            principal: None,
            actions: StorageAction::ALL.to_vec(),
            condition: KeyCondition::Unsafe,
        }];
        for principal in principals {
            let tenant = principal.prefix.tenant_id();
            let role = principal.identity.role;
            statements.push(PolicyStatement {
                sid: format!("TenantPrefix-{}-{}", tenant, role),
                effect: Effect::Allow,
                principal: Some(PrincipalMatch {
                    role_name: self.binder.namer().role_name(role, tenant),
                    role,
                    tenant_tag: tenant.to_string(),
                    role_tag: role.to_string(),
                }),
                actions: principal.access.actions(),
                condition: KeyCondition::LiteralPrefix(principal.prefix.as_str().to_string()),
            });
        }
        BucketPolicyDocument {
            bucket: bucket.to_string(),
            statements,
        }
    }
}

// ============================================================================
// RENDERED DOCUMENT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
}

/// Which callers a statement applies to.
///
/// Every field must match; together they are exactly what
/// [`IdentityBinder::verify`] checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalMatch {
    pub role_name: String,
    pub role: AgentRole,
    pub tenant_tag: String,
    pub role_tag: String,
}

impl PrincipalMatch {
    fn matches(&self, identity: &AssumedIdentity) -> bool {
        identity.role_name == self.role_name
            && identity.role == self.role
            && identity.tenant_tag() == Some(self.tenant_tag.as_str())
            && identity.role_tag() == Some(self.role_tag.as_str())
    }
}

/// Key condition of a statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCondition {
    /// Matches missing keys and keys with glob characters, dot or empty
    /// segments, backslashes, control characters or a leading separator.
    Unsafe,
    /// Matches keys that start with this exact byte string.
    LiteralPrefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub sid: String,
    pub effect: Effect,
    /// `None` applies to every caller.
    pub principal: Option<PrincipalMatch>,
    pub actions: Vec<StorageAction>,
    pub condition: KeyCondition,
}

impl PolicyStatement {
    fn applies_to(&self, identity: &AssumedIdentity, request: &StorageRequest) -> bool {
        if !self.actions.contains(&request.action) {
            return false;
        }
        if self.principal.as_ref().is_some_and(|p| !p.matches(identity)) {
            return false;
        }
        match (&self.condition, request.key.as_deref()) {
            (KeyCondition::Unsafe, None) => true,
            (KeyCondition::Unsafe, Some(key)) => unsafe_key_reason(key).is_some(),
            (KeyCondition::LiteralPrefix(_), None) => false,
            (KeyCondition::LiteralPrefix(prefix), Some(key)) => {
                key.as_bytes().starts_with(prefix.as_bytes())
            }
        }
    }
}

/// Bucket policy as handed to the provisioning layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketPolicyDocument {
    pub bucket: String,
    pub statements: Vec<PolicyStatement>,
}

impl BucketPolicyDocument {
    /// Evaluate the rendered statements: explicit deny wins, then any
    /// matching allow, otherwise deny.
    pub fn evaluate(&self, identity: &AssumedIdentity, request: &StorageRequest) -> Effect {
        let mut allowed = false;
        for statement in &self.statements {
            if !statement.applies_to(identity, request) {
                continue;
            }
            match statement.effect {
                Effect::Deny => return Effect::Deny,
                Effect::Allow => allowed = true,
            }
        }
        if allowed {
            Effect::Allow
        } else {
            Effect::Deny
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_core::{AgentRole, EnclaveConfig, NamingConvention, TenantId};

    fn t(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    fn binder() -> IdentityBinder {
        IdentityBinder::from_config(&EnclaveConfig::default()).unwrap()
    }

    fn principal(tenant: &str, role: AgentRole, access: AccessLevel) -> StoragePrincipal {
        StoragePrincipal {
            identity: binder().derive(&t(tenant), role),
            prefix: NamingConvention::default().storage_prefix(&t(tenant)),
            access,
        }
    }

    fn get(key: &str) -> StorageRequest {
        StorageRequest::new(StorageAction::Get, key)
    }

    /// (key or None, action, expected allow) for a read-write `tenant-a` principal.
    const VECTORS: &[(Option<&str>, StorageAction, bool)] = &[
        (Some("tenant-a/secret.json"), StorageAction::Get, true),
        (Some("other-tenant/secret.json"), StorageAction::Get, false),
        (Some("tenant-a/inbox/2024/01.json"), StorageAction::Put, true),
        (Some("tenant-a/"), StorageAction::List, true),
        (Some("tenant-a/inbox/"), StorageAction::List, true),
        (Some("tenant-a"), StorageAction::List, false),
        (Some("tenant-ab/secret.json"), StorageAction::Get, false),
        (Some("tenant-a-co/secret.json"), StorageAction::Get, false),
        (Some("tenant-a/*"), StorageAction::Get, false),
        (Some("tenant-*/secret.json"), StorageAction::Get, false),
        (Some("tenant-a/?.json"), StorageAction::Get, false),
        (Some("tenant-a/[ab].json"), StorageAction::Get, false),
        (Some("tenant-a/{x,y}"), StorageAction::Get, false),
        (Some("tenant-a/../other-tenant/secret.json"), StorageAction::Get, false),
        (Some("tenant-a/./secret.json"), StorageAction::Get, false),
        (Some("tenant-a//secret.json"), StorageAction::Get, false),
        (Some("tenant-a\\..\\other-tenant"), StorageAction::Get, false),
        (Some("/tenant-a/secret.json"), StorageAction::Get, false),
        (Some("tenant-a/sec\u{0}ret.json"), StorageAction::Get, false),
        (Some("tenant-a/line\nbreak"), StorageAction::Put, false),
        (Some(""), StorageAction::List, false),
        (Some("*"), StorageAction::List, false),
        (None, StorageAction::List, false),
        (None, StorageAction::Get, false),
    ];

    #[test]
    fn test_required_vectors() {
        let policy = StoragePartitionPolicy::new(binder());
        let p = principal("tenant-a", AgentRole::Butler, AccessLevel::ReadWrite);
        assert_eq!(
            policy.evaluate(&p, &get("other-tenant/secret.json")),
            Decision::Deny {
                reason: DenyReason::OutsidePrefix
            }
        );
        assert_eq!(policy.evaluate(&p, &get("tenant-a/secret.json")), Decision::Allow);
    }

    #[test]
    fn test_vector_table_evaluator_and_document_agree() {
        let policy = StoragePartitionPolicy::new(binder());
        let p = principal("tenant-a", AgentRole::Butler, AccessLevel::ReadWrite);
        let other = principal("other-tenant", AgentRole::Butler, AccessLevel::ReadWrite);
        let doc = policy.render_bucket_policy("enclave-dev-tenant-data", &[p.clone(), other]);

        for (key, action, expected) in VECTORS {
            let request = StorageRequest {
                action: *action,
                key: key.map(str::to_string),
            };
            let decision = policy.evaluate(&p, &request);
            assert_eq!(decision.is_allowed(), *expected, "evaluator {key:?} {action}");
            let effect = doc.evaluate(&p.identity, &request);
            assert_eq!(effect == Effect::Allow, *expected, "document {key:?} {action}");
        }
    }

    #[test]
    fn test_deny_reasons() {
        let policy = StoragePartitionPolicy::new(binder());
        let p = principal("tenant-a", AgentRole::Butler, AccessLevel::ReadWrite);
        assert_eq!(
            policy.evaluate(&p, &StorageRequest::bucket_root(StorageAction::List)),
            Decision::Deny {
                reason: DenyReason::BucketRoot
            }
        );
        assert_eq!(
            policy.evaluate(&p, &get("tenant-a/*")),
            Decision::Deny {
                reason: DenyReason::UnsafeKey("glob metacharacter".to_string())
            }
        );
        assert_eq!(
            policy.evaluate(&p, &get("tenant-a/../x")),
            Decision::Deny {
                reason: DenyReason::UnsafeKey("dot segment".to_string())
            }
        );
    }

    #[test]
    fn test_read_only_principal_cannot_write() {
        let policy = StoragePartitionPolicy::new(binder());
        let p = principal("acme", AgentRole::Strategist, AccessLevel::ReadOnly);
        assert!(policy.evaluate(&p, &get("acme/report.pdf")).is_allowed());
        let put = StorageRequest::new(StorageAction::Put, "acme/report.pdf");
        assert_eq!(
            policy.evaluate(&p, &put),
            Decision::Deny {
                reason: DenyReason::ActionNotPermitted
            }
        );
        let doc = policy.render_bucket_policy("b", &[p.clone()]);
        assert_eq!(doc.evaluate(&p.identity, &put), Effect::Deny);
    }

    #[test]
    fn test_identity_not_bound_denied() {
        let policy = StoragePartitionPolicy::new(binder());
        let mut p = principal("acme", AgentRole::Butler, AccessLevel::ReadWrite);
        // identity of another tenant presented with acme's prefix
        p.identity = binder().derive(&t("globex"), AgentRole::Butler);
        assert_eq!(
            policy.evaluate(&p, &get("acme/x.json")),
            Decision::Deny {
                reason: DenyReason::IdentityNotBound
            }
        );
    }

    #[test]
    fn test_document_rejects_forged_tag() {
        let policy = StoragePartitionPolicy::new(binder());
        let acme = principal("acme", AgentRole::Butler, AccessLevel::ReadWrite);
        let doc = policy.render_bucket_policy("b", &[acme.clone()]);
        let mut forged = binder().derive(&t("globex"), AgentRole::Butler);
        forged
            .session_tags
            .insert(crate::identity::TENANT_TAG.to_string(), "acme".to_string());
        assert_eq!(doc.evaluate(&forged, &get("acme/x.json")), Effect::Deny);
        assert_eq!(doc.evaluate(&acme.identity, &get("acme/x.json")), Effect::Allow);
    }

    #[test]
    fn test_document_rejects_tampered_role_binding() {
        let policy = StoragePartitionPolicy::new(binder());
        let acme = principal("acme", AgentRole::Butler, AccessLevel::ReadWrite);
        let doc = policy.render_bucket_policy("b", &[acme.clone()]);
        let request = get("acme/x.json");

        let mut untagged = acme.clone();
        untagged.identity.session_tags.remove(crate::identity::ROLE_TAG);
        let mut retagged = acme.clone();
        retagged
            .identity
            .session_tags
            .insert(crate::identity::ROLE_TAG.to_string(), "scout".to_string());
        let mut reroled = acme.clone();
        reroled.identity.role = AgentRole::Scout;

        for tampered in [untagged, retagged, reroled] {
            assert_eq!(
                policy.evaluate(&tampered, &request),
                Decision::Deny {
                    reason: DenyReason::IdentityNotBound
                }
            );
            assert_eq!(doc.evaluate(&tampered.identity, &request), Effect::Deny);
        }
        assert_eq!(doc.evaluate(&acme.identity, &request), Effect::Allow);
    }

    #[test]
    fn test_deserialized_principal_cannot_point_at_foreign_prefix() {
        let acme = principal("acme", AgentRole::Butler, AccessLevel::ReadWrite);
        let mut raw = serde_json::to_value(&acme).unwrap();
        raw["prefix"]["prefix"] = serde_json::json!("globex/");
        assert!(serde_json::from_value::<StoragePrincipal>(raw).is_err());
    }

    #[test]
    fn test_rendered_document_serializes_literal_prefix() {
        let policy = StoragePartitionPolicy::new(binder());
        let doc = policy.render_bucket_policy(
            "enclave-dev-tenant-data",
            &[principal("acme", AgentRole::Butler, AccessLevel::ReadWrite)],
        );
        let json = doc.to_json();
        assert_eq!(json["statements"][1]["condition"]["literal_prefix"], "acme/");
        assert_eq!(json["statements"][0]["effect"], "deny");
    }
}
