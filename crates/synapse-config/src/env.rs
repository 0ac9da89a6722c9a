//! `SYNAPSE_*` environment overrides.
//!
//! Overrides are the last layer: a set variable wins over every file.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Type of the config field an override targets.
#[derive(Debug, Clone, Copy)]
enum FieldKind {
    String,
    Integer,
    Boolean,
}

/// Mapping from environment variable name to config field path.
struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: FieldKind,
}

/// All supported `SYNAPSE_*` variables.
const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "SYNAPSE_LOG_LEVEL",
        field_path: "logging.level",
        kind: FieldKind::String,
    },
    EnvMapping {
        var_name: "SYNAPSE_LOG_FORMAT",
        field_path: "logging.format",
        kind: FieldKind::String,
    },
    EnvMapping {
        var_name: "SYNAPSE_DELIVERY_ORDERING",
        field_path: "dispatch.ordering",
        kind: FieldKind::String,
    },
    EnvMapping {
        var_name: "SYNAPSE_HANDLER_TIMEOUT_MS",
        field_path: "dispatch.handler_timeout_ms",
        kind: FieldKind::Integer,
    },
    EnvMapping {
        var_name: "SYNAPSE_MAX_CONCURRENT_HANDLERS",
        field_path: "dispatch.max_concurrent_handlers",
        kind: FieldKind::Integer,
    },
    EnvMapping {
        var_name: "SYNAPSE_PEERING_ENABLED",
        field_path: "peering.enabled",
        kind: FieldKind::Boolean,
    },
];

/// Apply every set `SYNAPSE_*` variable to the merged tree.
///
/// Returns the number of variables applied.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] if a numeric or boolean variable does
/// not parse.
pub fn apply_env_overrides<S: ::std::hash::BuildHasher>(
    merged: &mut toml::Value,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<usize> {
    let mut count: usize = 0;

    for mapping in ENV_MAPPINGS {
        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };

        let value = coerce(mapping, raw)?;
        debug!(
            var = mapping.var_name,
            field = mapping.field_path,
            "applying env var override"
        );
        set_field(merged, mapping.field_path, value);
        count = count.saturating_add(1);
    }

    Ok(count)
}

fn coerce(mapping: &EnvMapping, raw: &str) -> ConfigResult<toml::Value> {
    let raw = raw.trim();
    match mapping.kind {
        FieldKind::String => Ok(toml::Value::String(raw.to_owned())),
        FieldKind::Integer => raw
            .parse::<i64>()
            .ok()
            .filter(|n| *n >= 0)
            .map(toml::Value::Integer)
            .ok_or_else(|| ConfigError::EnvError {
                var_name: mapping.var_name.to_owned(),
                message: format!("expected a non-negative integer, got '{raw}'"),
            }),
        FieldKind::Boolean => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(toml::Value::Boolean(true)),
            "0" | "false" | "no" | "off" => Ok(toml::Value::Boolean(false)),
            _ => Err(ConfigError::EnvError {
                var_name: mapping.var_name.to_owned(),
                message: format!("expected a boolean, got '{raw}'"),
            }),
        },
    }
}

/// Set a dotted field path, creating intermediate tables.
fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) {
    let (parents, leaf) = path.rsplit_once('.').unwrap_or(("", path));

    let mut current = root;
    for segment in parents.split('.').filter(|s| !s.is_empty()) {
        let Some(table) = current.as_table_mut() else {
            return;
        };
        current = table
            .entry(segment.to_owned())
            .or_insert(toml::Value::Table(toml::map::Map::new()));
    }

    if let Some(table) = current.as_table_mut() {
        table.insert(leaf.to_owned(), value);
    }
}

/// Collect all current environment variables into a map.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn base() -> toml::Value {
        toml::from_str("[logging]\nlevel = \"info\"\n").unwrap()
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let mut merged = base();
        let env = make_env(&[
            ("SYNAPSE_LOG_LEVEL", "debug"),
            ("SYNAPSE_HANDLER_TIMEOUT_MS", "750"),
            ("SYNAPSE_PEERING_ENABLED", "off"),
            ("UNRELATED", "x"),
        ]);

        let applied = apply_env_overrides(&mut merged, &env).unwrap();
        assert_eq!(applied, 3);
        assert_eq!(merged["logging"]["level"].as_str(), Some("debug"));
        assert_eq!(
            merged["dispatch"]["handler_timeout_ms"].as_integer(),
            Some(750)
        );
        assert_eq!(merged["peering"]["enabled"].as_bool(), Some(false));
    }

    #[test]
    fn test_no_variables_no_changes() {
        let mut merged = base();
        let applied = apply_env_overrides(&mut merged, &HashMap::new()).unwrap();
        assert_eq!(applied, 0);
        assert_eq!(merged, base());
    }

    #[test]
    fn test_bad_integer_is_an_error() {
        let mut merged = base();
        let env = make_env(&[("SYNAPSE_MAX_CONCURRENT_HANDLERS", "lots")]);
        let err = apply_env_overrides(&mut merged, &env).unwrap_err();
        assert!(
            matches!(err, ConfigError::EnvError { ref var_name, .. } if var_name == "SYNAPSE_MAX_CONCURRENT_HANDLERS")
        );

        let env = make_env(&[("SYNAPSE_HANDLER_TIMEOUT_MS", "-5")]);
        assert!(apply_env_overrides(&mut merged, &env).is_err());
    }

    #[test]
    fn test_bad_boolean_is_an_error() {
        let mut merged = base();
        let env = make_env(&[("SYNAPSE_PEERING_ENABLED", "maybe")]);
        assert!(matches!(
            apply_env_overrides(&mut merged, &env),
            Err(ConfigError::EnvError { .. })
        ));
    }

    #[test]
    fn test_set_field_creates_tables() {
        let mut root = toml::Value::Table(toml::map::Map::new());
        set_field(&mut root, "a.b.c", toml::Value::Integer(1));
        assert_eq!(root["a"]["b"]["c"].as_integer(), Some(1));
    }
}
