//! distfork protocol types
//!
//! Defines the data exchanged between a controller and the worker that runs
//! a forked process: the immutable task descriptor, port-forward specs, the
//! execution state machine and the final result.

pub mod error;
pub mod port;
pub mod result;
pub mod state;
pub mod task;

pub use error::TaskSpecError;
pub use port::PortSpec;
pub use result::{ExecutionResult, Outcome, EXIT_CODE_INCOMPLETE};
pub use state::{ExecutionState, ExecutionStateData, StateError};
pub use task::{check_workspace_relative, parse_assignment, TaskSpec, TaskSpecBuilder, MAX_DISPLAY_NAME_LEN};
