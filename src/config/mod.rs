//! Layered configuration
//!
//! Three layers, later ones winning:
//! 1. Built-in defaults
//! 2. User config file (~/.config/distfork/config.toml or --config)
//! 3. CLI flags

mod merge;
mod settings;

pub use merge::{deep_merge, merge_layers};
pub use settings::{default_config_path, ConfigError, LoggingConfig, Settings};
