//! Conversion from `synapse_config` sections to the bus configs.

use std::sync::Arc;
use std::time::Duration;

use synapse_config::{
    Config, DispatchSection, OrderingMode, PeeringSection, RetrySection, StatsSection,
};
use synapse_core::RetryConfig;

use crate::bus::{EventBus, EventBusBuilder};
use crate::dispatch::{DeliveryOrdering, DispatchConfig};
use crate::peering::{PeeringConfig, PeeringPolicy};
use crate::stats::StatsConfig;

impl From<OrderingMode> for DeliveryOrdering {
    fn from(mode: OrderingMode) -> Self {
        match mode {
            OrderingMode::Concurrent => Self::Concurrent,
            OrderingMode::PerSubscriptionFifo => Self::PerSubscriptionFifo,
        }
    }
}

impl From<&DispatchSection> for DispatchConfig {
    fn from(section: &DispatchSection) -> Self {
        Self {
            ordering: section.ordering.into(),
            handler_timeout: section.handler_timeout(),
            max_concurrent_handlers: section.concurrency_limit(),
        }
    }
}

fn retry_config(section: &RetrySection) -> RetryConfig {
    RetryConfig::new(
        section.max_attempts,
        Duration::from_millis(section.initial_delay_ms),
        Duration::from_millis(section.max_delay_ms),
        section.backoff_factor,
    )
}

impl From<&PeeringSection> for PeeringConfig {
    fn from(section: &PeeringSection) -> Self {
        Self {
            enabled: section.enabled,
            negotiation_timeout: Duration::from_millis(section.negotiation_timeout_ms),
            channel_capacity: section.channel_capacity,
            failure_threshold: section.failure_threshold,
            retry: retry_config(&section.retry),
        }
    }
}

impl From<&StatsSection> for StatsConfig {
    fn from(section: &StatsSection) -> Self {
        Self {
            throughput_window: Duration::from_secs(section.throughput_window_secs),
        }
    }
}

impl EventBusBuilder {
    /// Builder seeded from a loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .dispatch_config((&config.dispatch).into())
            .peering_config((&config.peering).into())
            .stats_config((&config.stats).into())
    }

    /// Builder seeded from a configuration, with a custom peering policy.
    #[must_use]
    pub fn from_config_with_policy(config: &Config, policy: Arc<dyn PeeringPolicy>) -> Self {
        Self::from_config(config).peering_policy(policy)
    }
}

impl EventBus {
    /// Bus built from a loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        EventBusBuilder::from_config(config).build()
    }
}
