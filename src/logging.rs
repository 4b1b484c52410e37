//! Logging system.
//!
//! Structured logging built on the `tracing` crate: configurable level,
//! output format, destination, and per-module overrides, with `OPFLOW_LOG*`
//! environment variables taking precedence over file configuration.

use crate::error::CoordinationError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error, off
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: json, text
    #[serde(default = "default_format")]
    pub format: String,

    /// Output destination: stdout, file
    #[serde(default = "default_output")]
    pub output: String,

    /// Log file path (if output is "file")
    #[serde(default = "default_log_file")]
    pub file: PathBuf,

    /// Enable colored output (text format, stdout only)
    #[serde(default = "default_true")]
    pub color: bool,

    /// Module-specific log levels
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

fn default_output() -> String {
    "stdout".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("opflow.log")
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_format(),
            output: default_output(),
            file: default_log_file(),
            color: default_true(),
            modules: HashMap::new(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), CoordinationError> {
        if self.format != "json" && self.format != "text" {
            return Err(CoordinationError::InvalidArgument(format!(
                "invalid log format: {} (must be 'json' or 'text')",
                self.format
            )));
        }
        if self.output != "stdout" && self.output != "file" {
            return Err(CoordinationError::InvalidArgument(format!(
                "invalid log output: {} (must be 'stdout' or 'file')",
                self.output
            )));
        }
        Ok(())
    }
}

/// Initialize the logging system.
///
/// Priority order (highest to lowest): `OPFLOW_LOG*` environment variables,
/// then the passed configuration, then defaults.
pub fn init_logging(config: Option<&LoggingConfig>) -> Result<(), CoordinationError> {
    let filter = build_env_filter(config)?;
    let format = determine_format(config)?;
    let to_file = determine_file_output(config)?;
    let use_color = config.map(|c| c.color).unwrap_or(true);

    let base = Registry::default().with(filter);

    let file_writer = if to_file {
        let log_file = config
            .map(|c| c.file.clone())
            .unwrap_or_else(default_log_file);
        if let Some(parent) = log_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CoordinationError::InvalidArgument(format!(
                        "failed to create log directory: {}",
                        e
                    ))
                })?;
            }
        }
        Some(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .map_err(|e| {
                    CoordinationError::InvalidArgument(format!(
                        "failed to open log file {:?}: {}",
                        log_file, e
                    ))
                })?,
        )
    } else {
        None
    };

    match (format.as_str(), file_writer) {
        ("json", Some(writer)) => base
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(writer),
            )
            .init(),
        ("json", None) => base
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stdout),
            )
            .init(),
        (_, Some(writer)) => base
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .init(),
        (_, None) => base
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(use_color)
                    .with_writer(std::io::stdout),
            )
            .init(),
    }

    Ok(())
}

/// Build the env filter from `OPFLOW_LOG`, or from the configured level plus
/// module overrides.
fn build_env_filter(config: Option<&LoggingConfig>) -> Result<EnvFilter, CoordinationError> {
    if let Ok(filter) = EnvFilter::try_from_env("OPFLOW_LOG") {
        return Ok(filter);
    }

    let level = config.map(|c| c.level.as_str()).unwrap_or("info");
    if level == "off" {
        return Ok(EnvFilter::new("off"));
    }

    let mut filter = EnvFilter::new(level);
    if let Some(config) = config {
        for (module, module_level) in &config.modules {
            let directive = format!("{}={}", module, module_level);
            filter = filter.add_directive(directive.parse().map_err(|e| {
                CoordinationError::InvalidArgument(format!("invalid log directive: {}", e))
            })?);
        }
    }
    Ok(filter)
}

fn determine_format(config: Option<&LoggingConfig>) -> Result<String, CoordinationError> {
    if let Ok(format) = std::env::var("OPFLOW_LOG_FORMAT") {
        if format == "json" || format == "text" {
            return Ok(format);
        }
    }
    let format = config.map(|c| c.format.as_str()).unwrap_or("text");
    if format != "json" && format != "text" {
        return Err(CoordinationError::InvalidArgument(format!(
            "invalid log format: {}",
            format
        )));
    }
    Ok(format.to_string())
}

fn determine_file_output(config: Option<&LoggingConfig>) -> Result<bool, CoordinationError> {
    let output = match std::env::var("OPFLOW_LOG_OUTPUT") {
        Ok(output) => output,
        Err(_) => config
            .map(|c| c.output.clone())
            .unwrap_or_else(default_output),
    };
    match output.as_str() {
        "stdout" => Ok(false),
        "file" => Ok(true),
        other => Err(CoordinationError::InvalidArgument(format!(
            "invalid log output: {} (must be 'stdout' or 'file')",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logging_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "text");
        assert_eq!(config.output, "stdout");
        assert!(config.color);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_format() {
        let mut config = LoggingConfig::default();
        config.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_output() {
        let mut config = LoggingConfig::default();
        config.output = "syslog".to_string();
        assert!(config.validate().is_err());
    }
}
