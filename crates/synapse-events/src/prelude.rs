//! Prelude module - commonly used types for convenient import.
//!
//! Use `use synapse_events::prelude::*;` to import all essential types.
//!
//! # Example
//!
//! ```rust
//! use synapse_events::prelude::*;
//!
//! # async fn example() {
//! let bus = EventBus::new();
//! let agent = bus.register_agent("watcher");
//! bus.register_handler(
//!     agent,
//!     "any.failed",
//!     ScopeKind::Global,
//!     None,
//!     handler_fn("alert", |_envelope| async { Ok(()) }),
//! )
//! .unwrap();
//!
//! assert_eq!(bus.emit("job.failed", Payload::new(), Some(agent)), 1);
//! # }
//! ```

// Bus
pub use crate::{AgentHandle, Emission, EventBus, EventBusBuilder, Routed};

// Events and patterns
pub use crate::{EventEnvelope, EventName, Pattern, Payload, WILDCARD};

// Handlers
pub use crate::{
    DeliveryContext, EventHandler, HandlerEntry, HandlerError, HandlerResult, handler_fn,
};

// Routing
pub use crate::{Audience, DeliveryOrdering, DispatchConfig};

// Peering
pub use crate::{
    DeliveryResult, PeerCapabilities, PeerState, PeeringConfig, PeeringPolicy,
    PeeringRequirements,
};

// Statistics
pub use crate::BusStats;

// Core types
pub use synapse_core::prelude::*;
