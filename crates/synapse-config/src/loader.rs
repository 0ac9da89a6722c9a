//! Config file discovery and layered loading.
//!
//! Implements the `Config::load()` algorithm:
//! 1. Parse `defaults.toml` → base
//! 2. Merge `~/.synapse/config.toml` (user)
//! 3. Merge `{workspace}/.synapse/config.toml` (workspace)
//! 4. Apply `SYNAPSE_*` environment overrides
//! 5. Deserialize merged tree → `Config`
//! 6. Validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::env::{apply_env_overrides, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::deep_merge;
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// A loaded configuration and where it came from.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// The final configuration.
    pub config: Config,
    /// Config files that were found and merged, in merge order.
    pub loaded_files: Vec<String>,
    /// Number of environment overrides applied.
    pub env_overrides: usize,
}

impl ResolvedConfig {
    /// Render as pretty JSON, for display.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError::ValidationError`] if serialization fails.
    pub fn to_json_pretty(&self) -> ConfigResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::ValidationError {
            field: "<resolved config>".to_owned(),
            message: e.to_string(),
        })
    }
}

/// Load the configuration with layered file precedence, reading the
/// process environment.
///
/// `workspace_root` is the root of the current project. If `None`, the
/// workspace layer is skipped. `home_override` is treated as the
/// `.synapse` directory itself.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is malformed, an
/// environment override does not parse, or the merged configuration fails
/// validation.
pub fn load(
    workspace_root: Option<&Path>,
    home_override: Option<&Path>,
) -> ConfigResult<ResolvedConfig> {
    load_with_env(workspace_root, home_override, &collect_env_vars())
}

/// [`load`] with an explicit environment.
///
/// # Errors
///
/// See [`load`].
pub fn load_with_env<S: ::std::hash::BuildHasher>(
    workspace_root: Option<&Path>,
    home_override: Option<&Path>,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<ResolvedConfig> {
    let mut merged = defaults_value()?;
    let mut loaded_files = Vec::new();

    // User config.
    let user_path = match home_override {
        Some(dir) => dir.join("config.toml"),
        None => home_directory()?.join(".synapse").join("config.toml"),
    };
    if let Some(overlay) = try_load_file(&user_path)? {
        deep_merge(&mut merged, &overlay);
        loaded_files.push(user_path.display().to_string());
        info!(path = %user_path.display(), "loaded user config");
    }

    // Workspace config.
    if let Some(root) = workspace_root {
        let ws_path = root.join(".synapse").join("config.toml");
        if let Some(overlay) = try_load_file(&ws_path)? {
            deep_merge(&mut merged, &overlay);
            loaded_files.push(ws_path.display().to_string());
            info!(path = %ws_path.display(), "loaded workspace config");
        }
    }

    let env_overrides = apply_env_overrides(&mut merged, env_vars)?;
    if env_overrides > 0 {
        debug!(count = env_overrides, "applied environment variable overrides");
    }

    let config = into_config(merged, "<merged config>")?;
    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        loaded_files,
        env_overrides,
    })
}

/// Load a config from a specific file path (no layering).
///
/// Keys absent from the file take their embedded defaults.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails
/// validation.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let overlay = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
        path: path.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
    })?;

    let mut merged = defaults_value()?;
    deep_merge(&mut merged, &overlay);

    let config = into_config(merged, &path.display().to_string())?;
    validate::validate(&config)?;
    Ok(config)
}

/// Parse a config from a TOML string over the embedded defaults.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the string does not parse or the result
/// fails validation.
pub fn from_toml_str(content: &str) -> ConfigResult<Config> {
    let overlay: toml::Value = toml::from_str(content).map_err(|e| ConfigError::ParseError {
        path: "<string>".to_owned(),
        source: e,
    })?;

    let mut merged = defaults_value()?;
    deep_merge(&mut merged, &overlay);

    let config = into_config(merged, "<string>")?;
    validate::validate(&config)?;
    Ok(config)
}

fn defaults_value() -> ConfigResult<toml::Value> {
    toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
        path: "<embedded defaults>".to_owned(),
        source: e,
    })
}

fn into_config(merged: toml::Value, origin: &str) -> ConfigResult<Config> {
    merged
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError {
            path: origin.to_owned(),
            source: e,
        })
}

/// Try to load a file, returning `None` if the file doesn't exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {} byte limit",
                content.len(),
                MAX_CONFIG_FILE_SIZE
            ),
        });
    }

    let value: toml::Value = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(Some(value))
}

/// Determine the user's home directory.
fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderingMode;

    fn write(dir: &Path, relative: &str, content: &str) {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_defaults_deserialize_to_config() {
        let config: Config = toml::from_str(DEFAULTS_TOML).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_without_files() {
        let home = tempfile::tempdir().unwrap();
        let resolved = load_with_env(None, Some(home.path()), &HashMap::new()).unwrap();

        assert_eq!(resolved.config, Config::default());
        assert!(resolved.loaded_files.is_empty());
        assert_eq!(resolved.env_overrides, 0);
    }

    #[test]
    fn test_layer_precedence() {
        let home = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();

        write(
            home.path(),
            "config.toml",
            r#"
            [dispatch]
            handler_timeout_ms = 1000
            max_concurrent_handlers = 16

            [logging]
            level = "debug"
        "#,
        );
        write(
            workspace.path(),
            ".synapse/config.toml",
            r#"
            [dispatch]
            handler_timeout_ms = 500
            ordering = "per_subscription_fifo"
        "#,
        );

        let env: HashMap<String, String> =
            [("SYNAPSE_LOG_LEVEL".to_owned(), "warn".to_owned())].into();
        let resolved =
            load_with_env(Some(workspace.path()), Some(home.path()), &env).unwrap();
        let config = &resolved.config;

        assert_eq!(config.dispatch.handler_timeout_ms, 500);
        assert_eq!(config.dispatch.max_concurrent_handlers, 16);
        assert_eq!(config.dispatch.ordering, OrderingMode::PerSubscriptionFifo);
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.peering, crate::PeeringSection::default());
        assert_eq!(resolved.loaded_files.len(), 2);
        assert_eq!(resolved.env_overrides, 1);
    }

    #[test]
    fn test_invalid_layer_fails_validation() {
        let home = tempfile::tempdir().unwrap();
        write(home.path(), "config.toml", "[peering]\nchannel_capacity = 0\n");

        let result = load_with_env(None, Some(home.path()), &HashMap::new());
        assert!(matches!(
            result,
            Err(ConfigError::ValidationError { ref field, .. }) if field == "peering.channel_capacity"
        ));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let home = tempfile::tempdir().unwrap();
        write(home.path(), "config.toml", "[dispatch\n");

        let result = load_with_env(None, Some(home.path()), &HashMap::new());
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_wrong_type_is_parse_error() {
        let result = from_toml_str("[peering]\nenabled = \"sometimes\"\n");
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_load_file_nonexistent() {
        let result = load_file(Path::new("/nonexistent/config.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_load_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "synapse.toml", "[stats]\nthroughput_window_secs = 30\n");

        let config = load_file(&dir.path().join("synapse.toml")).unwrap();
        assert_eq!(config.stats.throughput_window_secs, 30);
        assert_eq!(config.peering.channel_capacity, 256);
    }

    #[test]
    fn test_from_toml_str() {
        let config = from_toml_str("[peering]\nenabled = false\n").unwrap();
        assert!(!config.peering.enabled);
        assert_eq!(config.logging.format, "compact");
    }

    #[test]
    fn test_oversized_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("huge.toml");
        let data = "x = \"".to_owned() + &"a".repeat(1_100_000) + "\"";
        std::fs::write(&file_path, data).unwrap();

        let result = try_load_file(&file_path);
        assert!(
            matches!(result, Err(ConfigError::ValidationError { .. })),
            "Expected ValidationError for oversized config, got: {result:?}"
        );
    }

    #[test]
    fn test_resolved_config_json() {
        let home = tempfile::tempdir().unwrap();
        let resolved = load_with_env(None, Some(home.path()), &HashMap::new()).unwrap();
        let json = resolved.to_json_pretty().unwrap();
        assert!(json.contains("\"channel_capacity\": 256"));
    }
}
