//! Configuration system.
//!
//! Hierarchical runtime configuration with environment variable overrides:
//! defaults, then an optional TOML file, then `OPFLOW_*` variables, each
//! layer overriding the last.

use crate::error::CoordinationError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// System-wide settings
    #[serde(default)]
    pub system: SystemConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// System-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Interval between keep-alive reaper sweeps (milliseconds)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Number of CPU devices to expose to new contexts
    #[serde(default = "default_cpu_devices")]
    pub cpu_devices: usize,
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_cpu_devices() -> usize {
    1
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            cpu_devices: default_cpu_devices(),
        }
    }
}

impl CoordinatorConfig {
    /// Validate the entire configuration.
    pub fn validate(&self) -> Result<(), CoordinationError> {
        if self.system.sweep_interval_ms == 0 {
            return Err(CoordinationError::InvalidArgument(
                "sweep_interval_ms must be positive".to_string(),
            ));
        }
        if self.system.cpu_devices == 0 {
            return Err(CoordinationError::InvalidArgument(
                "cpu_devices must be positive".to_string(),
            ));
        }
        self.logging.validate()
    }
}

/// Configuration loader: defaults < file < environment.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration, optionally layering a TOML file under the
    /// `OPFLOW_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<CoordinatorConfig, CoordinationError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("OPFLOW")
                .separator("__")
                .try_parsing(true),
        );
        let loaded: CoordinatorConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }
}
