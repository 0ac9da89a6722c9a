//! Synapse Telemetry - Logging setup for the Synapse event-routing engine.
//!
//! This crate provides:
//! - Configurable logging setup with multiple formats
//! - Stdout, stderr and rolling-file targets
//! - Conversion from the `[logging]` config section (feature `config`)
//!
//! # Example
//!
//! ```rust,no_run
//! use synapse_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), synapse_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Json)
//!     .with_directive("synapse_events=debug");
//!
//! setup_logging(&config)?;
//! tracing::info!("Bus starting");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

#[cfg(feature = "config")]
mod config_bridge;
mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileLogConfig, FileRotation, LogConfig, LogFormat, LogTarget, setup_default_logging,
    setup_logging,
};
