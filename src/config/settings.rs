//! Controller settings loaded from the config layers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use distfork_worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use toml::Value;

use super::merge::merge_layers;

/// Errors for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

/// Effective controller settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Merge defaults, the config file at `path` (if any) and `overrides`.
    ///
    /// A missing file is only an error when `required` is set, which is the
    /// case for an explicit `--config`.
    pub fn load(path: Option<&Path>, required: bool, overrides: Option<Value>) -> Result<Self, ConfigError> {
        let defaults = Value::try_from(Settings::default())
            .map_err(|e| ConfigError::Invalid(format!("defaults do not serialize: {}", e)))?;
        let mut layers = vec![defaults];

        if let Some(path) = path {
            if required || path.exists() {
                layers.push(Self::load_file(path)?);
                tracing::debug!(path = %path.display(), "loaded config file");
            }
        }

        if let Some(cli) = overrides {
            layers.push(cli);
        }

        let settings: Settings = merge_layers(layers)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Invalid(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn load_file(path: &Path) -> Result<Value, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table: toml::Table = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Value::Table(table))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "worker.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.worker.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("worker.root must not be empty".to_string()));
        }
        Ok(())
    }
}

/// `$HOME/.config/distfork/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join("distfork")
            .join("config.toml")
    })
}
