//! Error types surfaced by the Synapse bus.
//!
//! Only registration and peering negotiation fail visibly. Handler failures
//! and peered delivery failures are values handled inside the bus and never
//! reach emitters.

use thiserror::Error;

/// Errors returned synchronously to registrants and peering callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// A subscription pattern is malformed.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The rejected pattern text
        pattern: String,
        /// Why it was rejected
        reason: String,
    },

    /// An event name is malformed.
    #[error("invalid event name '{name}': {reason}")]
    InvalidEventName {
        /// The rejected name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// Scope kind and partition key disagree.
    #[error("invalid scope: {0}")]
    InvalidScope(String),

    /// The agent is not registered (or was already disposed).
    #[error("agent not found: {agent_id}")]
    AgentNotFound {
        /// The missing agent identifier
        agent_id: String,
    },

    /// Peering negotiation was refused.
    #[error("peering denied: {reason}")]
    PeeringDenied {
        /// Reason for denial
        reason: String,
    },

    /// Peering negotiation exceeded its time budget.
    #[error("peering negotiation timed out after {timeout_ms}ms")]
    PeeringTimeout {
        /// Negotiation window in milliseconds
        timeout_ms: u64,
    },

    /// The peer connection does not exist.
    #[error("peer connection not found: {connection_id}")]
    ConnectionNotFound {
        /// The missing connection identifier
        connection_id: String,
    },
}

impl BusError {
    /// Whether this error came out of peering negotiation.
    ///
    /// Callers seeing a peering error fall back to a normal emit.
    #[must_use]
    pub fn is_peering_error(&self) -> bool {
        matches!(self, Self::PeeringDenied { .. } | Self::PeeringTimeout { .. })
    }
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;
