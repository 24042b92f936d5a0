//! distfork - run a command on a worker as if it ran locally
//!
//! The controller side: configuration layers, task assembly from
//! command-line options, label checks and signal handling. The execution
//! itself lives in `distfork-worker`.

pub mod config;
pub mod signal;
pub mod task;

pub use config::{ConfigError, LoggingConfig, Settings};
pub use signal::{SignalAction, SignalHandler, SignalState};
pub use task::{check_label, NoSuchLabel, RunRequest};
