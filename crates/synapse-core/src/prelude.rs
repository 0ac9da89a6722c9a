//! Prelude module - commonly used types for convenient import.
//!
//! Use `use synapse_core::prelude::*;` to import all essential types.
//!
//! # Example
//!
//! ```rust
//! use synapse_core::prelude::*;
//!
//! let scope = Scope::channel("ops");
//! assert_eq!(scope.kind, ScopeKind::Channel);
//! ```

// Errors
pub use crate::{BusError, BusResult};

// Identifiers and scopes
pub use crate::{AgentId, PeerConnectionId, Scope, ScopeKind, SubscriptionId, Timestamp};

// Retry utilities
pub use crate::{RetryConfig, RetryOutcome, retry};
