//! Allocator configuration.
//!
//! The configuration is a small TOML document:
//!
//! ```toml
//! [device]
//! path = "/dev/dri/renderD129"
//! backend = "gbm"
//!
//! [logging]
//! level = "debug"
//!
//! [properties]
//! "debug.gralloc.trace" = "1"
//! ```
//!
//! Device selection goes through [`PropertySource`] so that the device
//! lifecycle does not depend on where the value came from.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Property naming the allocator device node.
pub const DEVICE_PROPERTY: &str = "gralloc.gbm.device";

/// Render node used when nothing else is configured.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/dri/renderD128";

/// Read-only key/value lookup used for device selection.
pub trait PropertySource {
    /// Returns the value of `key`, or `default` when it is unset.
    fn string_property(&self, key: &str, default: &str) -> String;
}

impl PropertySource for HashMap<String, String> {
    fn string_property(&self, key: &str, default: &str) -> String {
        self.get(key).cloned().unwrap_or_else(|| default.to_string())
    }
}

/// Which allocator backend to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Gbm,
    Memfd,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Overrides the device node. Falls back to [`DEFAULT_DEVICE_PATH`].
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub backend: BackendKind,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: None,
            backend: BackendKind::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// One of "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "text" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Root configuration of the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct GrallocConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Free-form properties, looked up through [`PropertySource`].
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl GrallocConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GrallocConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses the configuration file at `path`.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.device.path {
            if path.trim().is_empty() {
                return Err(ConfigError::ValidationError("device.path must not be empty".to_string()));
            }
        }
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!("invalid log level '{other}'")));
            }
        }
        match self.logging.format.to_lowercase().as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::ValidationError(format!("invalid log format '{other}'"))),
        }
    }
}

impl PropertySource for GrallocConfig {
    fn string_property(&self, key: &str, default: &str) -> String {
        if key == DEVICE_PROPERTY {
            if let Some(path) = &self.device.path {
                return path.clone();
            }
        }
        self.properties.string_property(key, default)
    }
}
