//! Conversion from the `[logging]` config section.

use std::path::PathBuf;

use synapse_config::LoggingSection;

use crate::error::{TelemetryError, TelemetryResult};
use crate::logging::{FileRotation, LogConfig, LogFormat, LogTarget};

impl TryFrom<&LoggingSection> for LogConfig {
    type Error = TelemetryError;

    fn try_from(section: &LoggingSection) -> TelemetryResult<Self> {
        let format = match section.format.as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            "json" => LogFormat::Json,
            "full" => LogFormat::Full,
            other => {
                return Err(TelemetryError::ConfigError(format!(
                    "unknown log format '{other}'"
                )));
            },
        };

        let rotation = match section.rotation.as_str() {
            "minutely" => FileRotation::Minutely,
            "hourly" => FileRotation::Hourly,
            "daily" => FileRotation::Daily,
            "never" => FileRotation::Never,
            other => {
                return Err(TelemetryError::ConfigError(format!(
                    "unknown rotation '{other}'"
                )));
            },
        };

        let mut config = LogConfig::new(section.level.to_ascii_lowercase()).with_format(format);
        config.directives.clone_from(&section.directives);

        match section.target.as_str() {
            "stdout" => config = config.with_target(LogTarget::Stdout),
            "stderr" => config = config.with_target(LogTarget::Stderr),
            "file" => {
                let directory = section.directory.as_deref().ok_or_else(|| {
                    TelemetryError::ConfigError("file logging requires a directory".to_string())
                })?;
                config = config.with_file_logging(
                    PathBuf::from(directory),
                    section.file_prefix.clone(),
                    rotation,
                );
            },
            other => {
                return Err(TelemetryError::ConfigError(format!(
                    "unknown log target '{other}'"
                )));
            },
        }

        Ok(config)
    }
}
