//! Synapse Core - Foundation types for the Synapse event-routing engine.
//!
//! This crate provides:
//! - Identifiers for agents, subscriptions and peer connections
//! - Registry scopes (`Global`, `Agent`, `Channel`, `Role`, `Namespace`)
//! - The error taxonomy surfaced to registrants and peering callers
//! - Retry utilities with exponential backoff

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

pub mod error;
pub mod retry;
pub mod types;

pub use error::{BusError, BusResult};
pub use retry::{RetryConfig, RetryOutcome, retry};
pub use types::{AgentId, PeerConnectionId, Scope, ScopeKind, SubscriptionId, Timestamp};
