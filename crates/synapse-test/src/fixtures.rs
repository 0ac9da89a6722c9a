//! Test fixtures for common types.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use synapse_core::AgentId;
use synapse_events::{
    DeliveryOrdering, EventBus, EventEnvelope, EventHandler, EventName, Payload, PeeringConfig,
};

/// Turn a JSON object literal into a payload. Non-objects give an empty
/// payload.
#[must_use]
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// Create an envelope with an empty payload.
///
/// # Panics
///
/// Panics if `name` is not a valid event name.
#[must_use]
pub fn test_envelope(name: &str) -> EventEnvelope {
    let name = EventName::parse(name)
        .unwrap_or_else(|e| panic!("invalid test event name '{name}': {e}"));
    EventEnvelope::new(name, Payload::new())
}

/// A bus with default settings.
#[must_use]
pub fn test_bus() -> EventBus {
    EventBus::new()
}

/// A bus delivering in emission order per subscription.
#[must_use]
pub fn fifo_bus() -> EventBus {
    EventBus::builder()
        .ordering(DeliveryOrdering::PerSubscriptionFifo)
        .build()
}

/// A bus whose handlers time out after `timeout`.
#[must_use]
pub fn timeout_bus(timeout: Duration) -> EventBus {
    EventBus::builder().handler_timeout(timeout).build()
}

/// A bus whose peer links hold `capacity` events and degrade after
/// `failure_threshold` refusals.
#[must_use]
pub fn small_link_bus(capacity: usize, failure_threshold: u32) -> EventBus {
    EventBus::builder()
        .peering_config(PeeringConfig {
            channel_capacity: capacity,
            failure_threshold,
            ..PeeringConfig::default()
        })
        .build()
}

/// Register an agent with one handler in its private scope.
///
/// # Panics
///
/// Panics if `pattern` is invalid.
#[must_use]
pub fn agent_with_handler(
    bus: &EventBus,
    name: &str,
    pattern: &str,
    handler: Arc<dyn EventHandler>,
) -> AgentId {
    let agent = bus.register_agent(name);
    if let Err(e) = bus.register_handler(
        agent,
        pattern,
        synapse_core::ScopeKind::Agent,
        None,
        handler,
    ) {
        panic!("failed to register '{pattern}' for {name}: {e}");
    }
    agent
}

/// Write `contents` to `relative` under `dir`, creating parent directories.
///
/// # Panics
///
/// Panics on I/O failure.
pub fn write_file(dir: &Path, relative: &str, contents: &str) {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .unwrap_or_else(|e| panic!("failed to create {}: {e}", parent.display()));
    }
    std::fs::write(&path, contents)
        .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
}

/// A temporary `.synapse` home directory containing `config.toml`.
///
/// # Panics
///
/// Panics on I/O failure.
#[must_use]
pub fn config_home(contents: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("failed to create temp dir: {e}"));
    write_file(dir.path(), "config.toml", contents);
    dir
}
