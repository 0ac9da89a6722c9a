//! Prelude module - commonly used test utilities.
//!
//! Use `use synapse_test::prelude::*;` in test modules.

// Mocks
pub use crate::{
    FailingHandler, GatedHandler, PanickingHandler, Received, RecordingHandler, SlowHandler,
    StaticPolicy,
};

// Fixtures
pub use crate::{
    agent_with_handler, config_home, fifo_bus, payload, small_link_bus, test_bus, test_envelope,
    timeout_bus, write_file,
};

// Harness
pub use crate::{DEFAULT_WAIT, init_test_tracing, settle, wait_until};
