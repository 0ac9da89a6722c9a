//! Configuration types for the Synapse engine.
//!
//! These types have no dependency on the routing crates. Conversion to the
//! domain configs happens in `synapse-events` and `synapse-telemetry`
//! behind their `config` features. Every struct implements [`Default`] so
//! that a bare `[section]` header produces a working configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Handler scheduling.
    pub dispatch: DispatchSection,
    /// Direct agent-to-agent links.
    pub peering: PeeringSection,
    /// Runtime statistics.
    pub stats: StatsSection,
    /// Logging level, format and output.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// DispatchSection
// ---------------------------------------------------------------------------

/// Delivery ordering setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingMode {
    /// No ordering guarantee.
    #[default]
    Concurrent,
    /// Emission order per subscription.
    PerSubscriptionFifo,
}

/// Handler scheduling configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// Ordering guarantee.
    pub ordering: OrderingMode,
    /// Milliseconds before a handler is reported as timed out. `0` disables
    /// the timeout.
    pub handler_timeout_ms: u64,
    /// Upper bound on handlers running at once. `0` means unbounded.
    pub max_concurrent_handlers: usize,
}

impl DispatchSection {
    /// The handler timeout, if enabled.
    #[must_use]
    pub fn handler_timeout(&self) -> Option<Duration> {
        (self.handler_timeout_ms > 0).then(|| Duration::from_millis(self.handler_timeout_ms))
    }

    /// The concurrency limit, if bounded.
    #[must_use]
    pub fn concurrency_limit(&self) -> Option<usize> {
        (self.max_concurrent_handlers > 0).then_some(self.max_concurrent_handlers)
    }
}

// ---------------------------------------------------------------------------
// PeeringSection
// ---------------------------------------------------------------------------

/// Peer link configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeeringSection {
    /// Whether new connections may be negotiated.
    pub enabled: bool,
    /// Time budget for policy evaluation, in milliseconds.
    pub negotiation_timeout_ms: u64,
    /// Bounded backlog of each link.
    pub channel_capacity: usize,
    /// Consecutive send failures before a link degrades.
    pub failure_threshold: u32,
    /// Backoff used to restore a degraded link.
    pub retry: RetrySection,
}

impl Default for PeeringSection {
    fn default() -> Self {
        Self {
            enabled: true,
            negotiation_timeout_ms: 250,
            channel_capacity: 256,
            failure_threshold: 3,
            retry: RetrySection::default(),
        }
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Retries after the initial attempt.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub backoff_factor: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 50,
            max_delay_ms: 2000,
            backoff_factor: 2.0,
        }
    }
}

// ---------------------------------------------------------------------------
// StatsSection
// ---------------------------------------------------------------------------

/// Statistics configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSection {
    /// Window over which events per second are averaged, in seconds.
    pub throughput_window_secs: u64,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            throughput_window_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"` or `"full"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["synapse_events=debug"]`).
    pub directives: Vec<String>,
    /// Output target: `"stdout"`, `"stderr"` or `"file"`.
    pub target: String,
    /// Log directory, required when `target` is `"file"`.
    pub directory: Option<String>,
    /// Log file name prefix.
    pub file_prefix: String,
    /// File rotation: `"minutely"`, `"hourly"`, `"daily"` or `"never"`.
    pub rotation: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
            target: "stderr".to_owned(),
            directory: None,
            file_prefix: "synapse".to_owned(),
            rotation: "daily".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_sections_use_defaults() {
        let config: Config = toml::from_str("[dispatch]\n[peering]\n").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_section() {
        let config: Config = toml::from_str(
            r#"
            [peering.retry]
            max_attempts = 9
        "#,
        )
        .unwrap();
        assert_eq!(config.peering.retry.max_attempts, 9);
        assert_eq!(config.peering.retry.initial_delay_ms, 50);
        assert!(config.peering.enabled);
    }

    #[test]
    fn test_zero_disables_limits() {
        let section = DispatchSection::default();
        assert_eq!(section.handler_timeout(), None);
        assert_eq!(section.concurrency_limit(), None);

        let section = DispatchSection {
            handler_timeout_ms: 1500,
            max_concurrent_handlers: 8,
            ..DispatchSection::default()
        };
        assert_eq!(section.handler_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(section.concurrency_limit(), Some(8));
    }

    #[test]
    fn test_ordering_names() {
        let config: Config = toml::from_str(
            r#"
            [dispatch]
            ordering = "per_subscription_fifo"
        "#,
        )
        .unwrap();
        assert_eq!(config.dispatch.ordering, OrderingMode::PerSubscriptionFifo);

        assert!(toml::from_str::<Config>("[dispatch]\nordering = \"sorted\"\n").is_err());
    }
}
