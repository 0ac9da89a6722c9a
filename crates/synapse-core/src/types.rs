//! Common types used throughout Synapse.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{BusError, BusResult};

/// Unique identifier for a registered agent.
///
/// Assigned by the registrar when the agent is first registered and stable
/// for the agent's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    /// Create a new random agent ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an agent ID from a UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent:{}", self.0)
    }
}

/// Unique identifier for a subscription, generated at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// Create a new random subscription ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub:{}", self.0)
    }
}

/// Unique identifier for a negotiated peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerConnectionId(pub Uuid);

impl PeerConnectionId {
    /// Create a new random connection ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer:{}", self.0)
    }
}

/// Timestamp wrapper for consistent handling throughout Synapse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    /// Get the current timestamp.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Get the inner `DateTime<Utc>`.
    #[must_use]
    pub fn into_inner(self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%S%.3fZ"))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

/// The kind of registry partition a subscription lives in.
///
/// The declaration order is the order in which partitions are reported by
/// resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// Process-wide subscriptions. Has no partition key.
    Global,
    /// Subscriptions private to one agent, keyed by the agent ID.
    Agent,
    /// Subscriptions attached to a named channel.
    Channel,
    /// Subscriptions attached to a named role.
    Role,
    /// Subscriptions attached to a namespace.
    Namespace,
}

impl ScopeKind {
    /// All scope kinds in resolution order.
    pub const ALL: [Self; 5] = [
        Self::Global,
        Self::Agent,
        Self::Channel,
        Self::Role,
        Self::Namespace,
    ];

    /// Stable lowercase name, used in log fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Agent => "agent",
            Self::Channel => "channel",
            Self::Role => "role",
            Self::Namespace => "namespace",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registry partition: a scope kind plus its partition key.
///
/// The key is absent for [`ScopeKind::Global`] and required for every
/// other kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    /// Partition kind.
    pub kind: ScopeKind,
    /// Partition key (agent ID, channel name, role name or namespace).
    pub key: Option<String>,
}

impl Scope {
    /// The single global partition.
    #[must_use]
    pub fn global() -> Self {
        Self {
            kind: ScopeKind::Global,
            key: None,
        }
    }

    /// The private partition of an agent.
    #[must_use]
    pub fn agent(agent_id: AgentId) -> Self {
        Self {
            kind: ScopeKind::Agent,
            key: Some(agent_id.to_string()),
        }
    }

    /// A named channel partition.
    #[must_use]
    pub fn channel(name: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::Channel,
            key: Some(name.into()),
        }
    }

    /// A named role partition.
    #[must_use]
    pub fn role(name: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::Role,
            key: Some(name.into()),
        }
    }

    /// A namespace partition.
    #[must_use]
    pub fn namespace(name: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::Namespace,
            key: Some(name.into()),
        }
    }

    /// Build a scope from a kind and an optional key, checking that the key
    /// is present exactly when the kind requires one.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidScope`] when a global scope carries a key,
    /// or a partitioned scope has a missing or blank key.
    pub fn new(kind: ScopeKind, key: Option<String>) -> BusResult<Self> {
        let scope = Self { kind, key };
        scope.validate()?;
        Ok(scope)
    }

    /// Check the key/kind invariant.
    ///
    /// # Errors
    ///
    /// See [`Scope::new`].
    pub fn validate(&self) -> BusResult<()> {
        match (self.kind, self.key.as_deref()) {
            (ScopeKind::Global, None) => Ok(()),
            (ScopeKind::Global, Some(key)) => Err(BusError::InvalidScope(format!(
                "global scope takes no key (got '{key}')"
            ))),
            (kind, None) => Err(BusError::InvalidScope(format!(
                "{kind} scope requires a key"
            ))),
            (kind, Some(key)) if key.trim().is_empty() => Err(BusError::InvalidScope(format!(
                "{kind} scope key must not be blank"
            ))),
            _ => Ok(()),
        }
    }

    /// Whether this is the global partition.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.kind == ScopeKind::Global
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}/{}", self.kind, key),
            None => write!(f, "{}", self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_display() {
        let id = AgentId::new();
        assert!(id.to_string().starts_with("agent:"));
        assert_ne!(id, AgentId::new());
    }

    #[test]
    fn test_subscription_id_display() {
        assert!(SubscriptionId::new().to_string().starts_with("sub:"));
        assert!(PeerConnectionId::new().to_string().starts_with("peer:"));
    }

    #[test]
    fn test_scope_constructors() {
        assert!(Scope::global().is_global());
        assert_eq!(Scope::global().key, None);

        let agent = AgentId::new();
        let scope = Scope::agent(agent);
        assert_eq!(scope.kind, ScopeKind::Agent);
        assert_eq!(scope.key, Some(agent.to_string()));

        assert_eq!(Scope::channel("ops").to_string(), "channel/ops");
        assert_eq!(Scope::global().to_string(), "global");
    }

    #[test]
    fn test_scope_validation() {
        assert!(Scope::new(ScopeKind::Global, None).is_ok());
        assert!(Scope::new(ScopeKind::Role, Some("admin".into())).is_ok());

        assert!(matches!(
            Scope::new(ScopeKind::Global, Some("x".into())),
            Err(BusError::InvalidScope(_))
        ));
        assert!(matches!(
            Scope::new(ScopeKind::Channel, None),
            Err(BusError::InvalidScope(_))
        ));
        assert!(matches!(
            Scope::new(ScopeKind::Namespace, Some("  ".into())),
            Err(BusError::InvalidScope(_))
        ));
    }

    #[test]
    fn test_scope_kind_order() {
        let mut kinds = vec![ScopeKind::Namespace, ScopeKind::Global, ScopeKind::Role];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![ScopeKind::Global, ScopeKind::Role, ScopeKind::Namespace]
        );
    }

    #[test]
    fn test_scope_serde() {
        let scope = Scope::channel("alerts");
        let json = serde_json::to_string(&scope).unwrap();
        assert!(json.contains("\"kind\":\"channel\""));
        let parsed: Scope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, scope);
    }
}
