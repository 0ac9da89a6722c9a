//! Synapse Test - Shared test utilities for the Synapse engine.
//!
//! This crate provides mock handlers, peering policies and fixtures that
//! can be used across Synapse crates as a dev-dependency.
//!
//! # Usage
//!
//! ```rust,ignore
//! use synapse_test::prelude::*;
//!
//! #[tokio::test(flavor = "multi_thread")]
//! async fn test_delivery() {
//!     let bus = test_bus();
//!     let recorder = RecordingHandler::new("recorder");
//!     agent_with_handler(&bus, "a", "order.created", recorder.clone());
//!
//!     bus.emit("order.created", payload(serde_json::json!({"id": 1})), None);
//!     assert!(recorder.wait_for(1, DEFAULT_WAIT).await);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use fixtures::*;
pub use harness::*;
pub use mocks::*;
