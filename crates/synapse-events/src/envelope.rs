//! Event names and the immutable event envelope.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use synapse_core::{AgentId, BusError, BusResult};
use uuid::Uuid;

use crate::pattern::check_segments;

/// Ordered key/value payload carried by an event.
///
/// Keys are unique and keep their insertion order.
pub type Payload = serde_json::Map<String, Value>;

/// A validated, dot-segmented event name such as `system.critical`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventName {
    text: String,
    segment_count: usize,
}

impl EventName {
    /// Parse and validate an event name.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidEventName`] for empty names, empty
    /// segments, or characters outside `[A-Za-z0-9_]`.
    pub fn parse(text: &str) -> BusResult<Self> {
        check_segments(text).map_err(|reason| BusError::InvalidEventName {
            name: text.to_string(),
            reason,
        })?;

        Ok(Self {
            segment_count: text.split('.').count(),
            text: text.to_string(),
        })
    }

    /// The name text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Iterate the segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.text.split('.')
    }

    /// Number of segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// The first segment.
    #[must_use]
    pub fn first_segment(&self) -> &str {
        self.text.split('.').next().unwrap_or_default()
    }

    /// Whether `prefix` is a whole-segment prefix of this name.
    ///
    /// `order` is a prefix of `order` and `order.created`, not of
    /// `orders.created`.
    #[must_use]
    pub fn has_prefix(&self, prefix: &str) -> bool {
        match self.text.strip_prefix(prefix) {
            Some("") => true,
            Some(rest) => rest.starts_with('.'),
            None => false,
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for EventName {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EventName {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EventName> for String {
    fn from(name: EventName) -> Self {
        name.text
    }
}

/// One emitted event.
///
/// Envelopes are built once, then shared as `Arc<EventEnvelope>` with every
/// matched handler. There is no mutating API after construction; the
/// `with_*` builders consume the value before it is shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    id: Uuid,
    name: EventName,
    payload: Payload,
    source: Option<AgentId>,
    timestamp: DateTime<Utc>,
    correlation_id: Option<Uuid>,
    #[serde(skip, default = "Instant::now")]
    created: Instant,
}

impl EventEnvelope {
    /// Create an anonymous envelope.
    #[must_use]
    pub fn new(name: EventName, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            payload,
            source: None,
            timestamp: Utc::now(),
            correlation_id: None,
            created: Instant::now(),
        }
    }

    /// Parse the name and create an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidEventName`] if the name is malformed.
    pub fn named(name: &str, payload: Payload) -> BusResult<Self> {
        Ok(Self::new(EventName::parse(name)?, payload))
    }

    /// Set the emitting agent.
    #[must_use]
    pub fn with_source(mut self, source: AgentId) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Continue the causal chain of `parent`.
    ///
    /// Inherits the parent's correlation ID, or starts the chain from the
    /// parent's own ID.
    #[must_use]
    pub fn caused_by(mut self, parent: &EventEnvelope) -> Self {
        self.correlation_id = Some(parent.correlation_id.unwrap_or(parent.id));
        self
    }

    /// Unique event ID.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Event name.
    #[must_use]
    pub fn name(&self) -> &EventName {
        &self.name
    }

    /// Payload map.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Look up one payload value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Emitting agent, `None` for anonymous emission.
    #[must_use]
    pub fn source(&self) -> Option<AgentId> {
        self.source
    }

    /// Wall-clock creation time.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Correlation ID, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    /// Monotonic time since creation.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }
}
