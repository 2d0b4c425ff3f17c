//! Enum types for ENCLAVE entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// TENANT LIFECYCLE
// ============================================================================

/// Lifecycle state of a tenant.
///
/// `Deleted` is terminal: a deleted tenant stays in the registry as a
/// tombstone so its identifier can never be handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Active,
    Suspended,
    Deleted,
}

impl LifecycleState {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::Suspended => "suspended",
            LifecycleState::Deleted => "deleted",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "active" => Ok(LifecycleState::Active),
            "suspended" => Ok(LifecycleState::Suspended),
            "deleted" => Ok(LifecycleState::Deleted),
            _ => Err(EnumParseError::new("lifecycle state", s)),
        }
    }

    /// Whether a transition to `next` is legal.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Active, Suspended) | (Suspended, Active) | (Active, Deleted) | (Suspended, Deleted)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for LifecycleState {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// ============================================================================
// AGENT ROLES
// ============================================================================

/// Functional category of an agent acting on a tenant's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Inbox and calendar assistant
    Butler,
    /// Lead discovery and scoring
    Scout,
    /// Planning and reporting over the tenant's own data
    Strategist,
}

impl AgentRole {
    /// Every role, in a stable order.
    pub const ALL: [AgentRole; 3] = [AgentRole::Butler, AgentRole::Scout, AgentRole::Strategist];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Butler => "butler",
            AgentRole::Scout => "scout",
            AgentRole::Strategist => "strategist",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "butler" => Ok(AgentRole::Butler),
            "scout" => Ok(AgentRole::Scout),
            "strategist" => Ok(AgentRole::Strategist),
            _ => Err(EnumParseError::new("agent role", s)),
        }
    }
}

// ============================================================================
// STORAGE ACCESS
// ============================================================================

/// Access level a role receives on its tenant's storage partition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::ReadOnly => "read_only",
            AccessLevel::ReadWrite => "read_write",
        }
    }

    /// Whether this level permits the given action.
    pub fn permits(&self, action: StorageAction) -> bool {
        match self {
            AccessLevel::ReadWrite => true,
            AccessLevel::ReadOnly => !action.is_mutation(),
        }
    }

    /// Actions granted by this level, in a stable order.
    pub fn actions(&self) -> Vec<StorageAction> {
        StorageAction::ALL
            .into_iter()
            .filter(|a| self.permits(*a))
            .collect()
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object-store operation requested by a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageAction {
    Get,
    Put,
    Delete,
    List,
}

impl StorageAction {
    pub const ALL: [StorageAction; 4] = [
        StorageAction::Get,
        StorageAction::Put,
        StorageAction::Delete,
        StorageAction::List,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageAction::Get => "get",
            StorageAction::Put => "put",
            StorageAction::Delete => "delete",
            StorageAction::List => "list",
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self, StorageAction::Put | StorageAction::Delete)
    }
}

impl fmt::Display for StorageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageAction {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "get" | "read" => Ok(StorageAction::Get),
            "put" | "write" => Ok(StorageAction::Put),
            "delete" => Ok(StorageAction::Delete),
            "list" => Ok(StorageAction::List),
            _ => Err(EnumParseError::new("storage action", s)),
        }
    }
}

// ============================================================================
// PARSE ERROR
// ============================================================================

/// Error when parsing an invalid enum string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl EnumParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use LifecycleState::*;
        assert!(Active.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Active));
        assert!(Active.can_transition_to(Deleted));
        assert!(Suspended.can_transition_to(Deleted));
        assert!(!Deleted.can_transition_to(Active));
        assert!(!Deleted.can_transition_to(Suspended));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_lifecycle_roundtrip_str() {
        for state in [LifecycleState::Active, LifecycleState::Suspended, LifecycleState::Deleted] {
            assert_eq!(state.as_db_str().parse::<LifecycleState>(), Ok(state));
        }
        assert!("archived".parse::<LifecycleState>().is_err());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Butler".parse::<AgentRole>(), Ok(AgentRole::Butler));
        assert_eq!("scout".parse::<AgentRole>(), Ok(AgentRole::Scout));
        let err = "janitor".parse::<AgentRole>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid agent role: janitor");
    }

    #[test]
    fn test_read_only_excludes_mutations() {
        assert!(AccessLevel::ReadOnly.permits(StorageAction::Get));
        assert!(AccessLevel::ReadOnly.permits(StorageAction::List));
        assert!(!AccessLevel::ReadOnly.permits(StorageAction::Put));
        assert!(!AccessLevel::ReadOnly.permits(StorageAction::Delete));
        assert_eq!(AccessLevel::ReadWrite.actions().len(), 4);
    }
}
