//! Identity types for ENCLAVE entities
//!
//! Tenant and integration identifiers flow into object-store keys, secret
//! paths and SQL schema names, so they are validated once at construction
//! and carried as newtypes afterwards.

use crate::{EnclaveResult, ValidationError};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 content hash for policy fingerprints.
pub type ContentHash = [u8; 32];

/// Maximum identifier length (PostgreSQL NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Minimum identifier length.
pub const MIN_IDENTIFIER_LEN: usize = 2;

/// Schema names that may never be handed to a tenant.
const RESERVED_IDENTIFIERS: &[&str] = &["public", "information_schema", "pg_catalog", "pg_toast"];

/// Lowercase letter first, lowercase alphanumerics, `_` or `-` after, and an
/// alphanumeric last character.
static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z](?:[a-z0-9_-]*[a-z0-9])?$").expect("identifier regex is valid")
});

/// Validate an identifier against the safe character set shared by object
/// key segments and (quoted) SQL identifiers.
pub fn validate_identifier(kind: &'static str, value: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidIdentifier {
        kind,
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if value.len() < MIN_IDENTIFIER_LEN {
        return Err(invalid("too short"));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(invalid("longer than 63 bytes"));
    }
    if !IDENTIFIER_RE.is_match(value) {
        return Err(invalid(
            "must match [a-z][a-z0-9_-]* and end with a letter or digit",
        ));
    }
    if value.starts_with("pg_") {
        return Err(invalid("the pg_ prefix is reserved"));
    }
    if RESERVED_IDENTIFIERS.contains(&value) {
        return Err(invalid("reserved schema name"));
    }
    Ok(())
}

macro_rules! validated_identifier {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parse and validate an identifier.
            pub fn parse(value: impl Into<String>) -> EnclaveResult<Self> {
                let value = value.into();
                validate_identifier($kind, &value)?;
                Ok(Self(value))
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = crate::EnclaveError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                validate_identifier($kind, &value)?;
                Ok(Self(value))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

validated_identifier!(
    /// Globally unique, immutable tenant identifier.
    ///
    /// Doubles as the storage prefix segment and the database schema name,
    /// which is why the character set is the intersection of both.
    TenantId,
    "tenant id"
);

validated_identifier!(
    /// Name of an external integration (e.g. `gmail`, `google-calendar`).
    IntegrationName,
    "integration name"
);

/// Generate a new UUIDv7 event identifier (timestamp-sortable).
pub fn new_event_id() -> Uuid {
    Uuid::now_v7()
}

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EnclaveError;

    #[test]
    fn test_accepts_common_identifiers() {
        for id in ["acme", "tenant-a", "other-tenant", "acme_corp", "a1", "customer-001"] {
            assert!(TenantId::parse(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn test_rejects_path_and_sql_metacharacters() {
        for id in [
            "acme/evil", "acme*", "ac me", "acme;drop", "Acme", "acme.", "../x", "acme\"",
            "x", "", "-acme", "acme-", "acme_", "9lives",
        ] {
            let err = TenantId::parse(id).unwrap_err();
            assert!(
                matches!(err, EnclaveError::Validation(ValidationError::InvalidIdentifier { .. })),
                "{id:?} should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn test_rejects_reserved_names() {
        assert!(TenantId::parse("public").is_err());
        assert!(TenantId::parse("information_schema").is_err());
        assert!(TenantId::parse("pg_anything").is_err());
    }

    #[test]
    fn test_length_bounds() {
        let max = format!("a{}", "b".repeat(62));
        assert!(TenantId::parse(max.clone()).is_ok());
        assert!(TenantId::parse(format!("{max}c")).is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Result<TenantId, _> = serde_json::from_str("\"acme\"");
        assert!(ok.is_ok());
        let bad: Result<TenantId, _> = serde_json::from_str("\"acme/../globex\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(compute_content_hash(b"policy"), compute_content_hash(b"policy"));
        assert_ne!(compute_content_hash(b"policy"), compute_content_hash(b"policy2"));
    }
}
