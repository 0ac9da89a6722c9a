//! Synapse Events - Scoped publish/subscribe routing for agents.
//!
//! This crate provides:
//! - Hierarchical event names and `any`-wildcard patterns
//! - A scope-partitioned subscription registry
//! - An asynchronous dispatcher that isolates handler failures
//! - Agent registration with ownership-based teardown
//! - Negotiated peer links for low-latency agent-to-agent delivery
//! - Lock-free runtime statistics
//!
//! # Architecture
//!
//! Agents register handlers under a scope (`Global`, `Agent`, `Channel`,
//! `Role` or `Namespace`). An emitted event is resolved against every
//! partition whose patterns could match, and one delivery per matching
//! subscription is scheduled on the runtime. `emit` returns once the
//! deliveries are scheduled; it never waits for a handler.
//!
//! Two agents may negotiate a peer link. Events sent over the link skip
//! resolution; when the link refuses an event, the caller gets it back and
//! the bus resubmits it through normal routing.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use synapse_core::ScopeKind;
//! use synapse_events::{EventBus, HandlerEntry, Payload, handler_fn};
//!
//! # async fn example() {
//! let bus = EventBus::new();
//!
//! let billing = bus.register_agent("billing");
//! let audit = bus.register_agent("audit");
//!
//! bus.register_table(
//!     billing,
//!     &[HandlerEntry::agent(
//!         "order.created",
//!         handler_fn("invoice", |_envelope| async { Ok(()) }),
//!     )],
//! )
//! .unwrap();
//! bus.register_handler(
//!     audit,
//!     "any.created",
//!     ScopeKind::Agent,
//!     None,
//!     handler_fn("record", |_envelope| async { Ok(()) }),
//! )
//! .unwrap();
//!
//! // Both handlers match.
//! assert_eq!(bus.emit("order.created", Payload::new(), None), 2);
//! assert_eq!(bus.stats().subscription_count, 2);
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod agents;
mod bus;
#[cfg(feature = "config")]
mod config_bridge;
mod dispatch;
mod envelope;
mod handler;
mod pattern;
mod peering;
mod registry;
mod stats;

pub use agents::{AgentInfo, AgentRegistrar};
pub use bus::{AgentHandle, Emission, EventBus, EventBusBuilder, Routed};
pub use dispatch::{DeliveryOrdering, DispatchConfig, Dispatcher};
pub use envelope::{EventEnvelope, EventName, Payload};
pub use handler::{
    DeliveryContext, EventHandler, FnHandler, HandlerEntry, HandlerError, HandlerRef,
    HandlerResult, handler_fn,
};
pub use pattern::{Pattern, WILDCARD, matches, matches_str};
pub use peering::{
    CapabilityMatchPolicy, DeliveryFailure, DeliveryResult, Negotiation, NegotiationRequest,
    PeerCapabilities, PeerConnection, PeerState, PeeringConfig, PeeringManager, PeeringPolicy,
    PeeringRequirements,
};
pub use registry::{Audience, ResolvedSubscription, ScopeRegistry, Subscription};
pub use stats::{BusMetrics, BusStats, StatsConfig};
