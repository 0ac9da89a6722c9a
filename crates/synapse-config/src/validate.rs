//! Post-merge configuration validation.
//!
//! Validates that deserialized [`Config`](crate::Config) values are within
//! acceptable ranges and that cross-field invariants hold.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_dispatch(config)?;
    validate_peering(config)?;
    validate_stats(config)?;
    validate_logging(config)?;
    Ok(())
}

/// Longest accepted handler timeout (one hour).
const MAX_HANDLER_TIMEOUT_MS: u64 = 3_600_000;

/// Largest accepted concurrency limit.
const MAX_CONCURRENT_HANDLERS: usize = 1_000_000;

/// Largest accepted peer link backlog.
const MAX_CHANNEL_CAPACITY: usize = 1_048_576;

/// Longest accepted throughput window (one hour).
const MAX_THROUGHPUT_WINDOW_SECS: u64 = 3600;

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn validate_dispatch(config: &Config) -> ConfigResult<()> {
    let d = &config.dispatch;

    if d.handler_timeout_ms > MAX_HANDLER_TIMEOUT_MS {
        return Err(invalid(
            "dispatch.handler_timeout_ms",
            format!("must be at most {MAX_HANDLER_TIMEOUT_MS} (0 disables the timeout)"),
        ));
    }

    if d.max_concurrent_handlers > MAX_CONCURRENT_HANDLERS {
        return Err(invalid(
            "dispatch.max_concurrent_handlers",
            format!("must be at most {MAX_CONCURRENT_HANDLERS} (0 means unbounded)"),
        ));
    }

    Ok(())
}

fn validate_peering(config: &Config) -> ConfigResult<()> {
    let p = &config.peering;

    if p.negotiation_timeout_ms == 0 {
        return Err(invalid(
            "peering.negotiation_timeout_ms",
            "must be greater than 0",
        ));
    }

    if p.channel_capacity == 0 || p.channel_capacity > MAX_CHANNEL_CAPACITY {
        return Err(invalid(
            "peering.channel_capacity",
            format!("must be between 1 and {MAX_CHANNEL_CAPACITY}"),
        ));
    }

    if p.failure_threshold == 0 {
        return Err(invalid("peering.failure_threshold", "must be at least 1"));
    }

    let r = &p.retry;
    if !r.backoff_factor.is_finite() || r.backoff_factor < 1.0 {
        return Err(invalid(
            "peering.retry.backoff_factor",
            "must be a finite number of at least 1.0",
        ));
    }

    if r.initial_delay_ms > r.max_delay_ms {
        return Err(invalid(
            "peering.retry.initial_delay_ms",
            format!(
                "initial delay ({}ms) exceeds max delay ({}ms)",
                r.initial_delay_ms, r.max_delay_ms
            ),
        ));
    }

    Ok(())
}

fn validate_stats(config: &Config) -> ConfigResult<()> {
    let window = config.stats.throughput_window_secs;
    if window == 0 || window > MAX_THROUGHPUT_WINDOW_SECS {
        return Err(invalid(
            "stats.throughput_window_secs",
            format!("must be between 1 and {MAX_THROUGHPUT_WINDOW_SECS}"),
        ));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;

    if !matches!(
        l.level.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(invalid(
            "logging.level",
            format!(
                "unsupported level '{}'; expected one of: trace, debug, info, warn, error",
                l.level
            ),
        ));
    }

    if !matches!(l.format.as_str(), "pretty" | "compact" | "json" | "full") {
        return Err(invalid(
            "logging.format",
            format!(
                "unsupported format '{}'; expected one of: pretty, compact, json, full",
                l.format
            ),
        ));
    }

    match l.target.as_str() {
        "stdout" | "stderr" => {},
        "file" => {
            if l.directory.as_deref().is_none_or(str::is_empty) {
                return Err(invalid(
                    "logging.directory",
                    "required when logging.target is \"file\"",
                ));
            }
        },
        other => {
            return Err(invalid(
                "logging.target",
                format!("unsupported target '{other}'; expected one of: stdout, stderr, file"),
            ));
        },
    }

    if !matches!(l.rotation.as_str(), "minutely" | "hourly" | "daily" | "never") {
        return Err(invalid(
            "logging.rotation",
            format!(
                "unsupported rotation '{}'; expected one of: minutely, hourly, daily, never",
                l.rotation
            ),
        ));
    }

    Ok(())
}
