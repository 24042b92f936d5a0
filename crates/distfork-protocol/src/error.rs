//! Errors raised while assembling or validating a task descriptor.

use std::path::PathBuf;

/// Errors for task descriptor construction
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskSpecError {
    #[error("No commands are specified")]
    EmptyCommand,

    #[error("invalid assignment '{0}': expected NAME=VALUE")]
    InvalidAssignment(String),

    #[error("invalid port forwarding spec '{spec}': {reason}")]
    InvalidPortSpec { spec: String, reason: String },

    #[error("workspace path must be relative and stay inside the workspace: {0}")]
    EscapingPath(PathBuf),
}
