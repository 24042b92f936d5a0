//! Final result of one execution, the only value surfaced to the controller

use serde::{Deserialize, Serialize};

/// Exit code for "did not complete normally" (never a real process status)
pub const EXIT_CODE_INCOMPLETE: i32 = -1;

/// How an execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// The process ran to completion; the exit code is its own
    Succeeded,
    /// Staging, launch or another failure prevented a normal run
    Failed,
    /// Cancellation was requested while running or harvesting
    Aborted,
}

/// Exit code plus an optional failure description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Process exit code, or -1 when the process did not complete normally
    pub exit_code: i32,
    /// Failure description for Failed/Aborted outcomes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Terminal outcome
    pub outcome: Outcome,
}

impl ExecutionResult {
    /// The process ran and exited with `exit_code`
    pub fn completed(exit_code: i32) -> Self {
        Self {
            exit_code,
            error_message: None,
            outcome: Outcome::Succeeded,
        }
    }

    /// The execution failed before or while launching the process
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            exit_code: EXIT_CODE_INCOMPLETE,
            error_message: Some(message.into()),
            outcome: Outcome::Failed,
        }
    }

    /// The execution was cancelled
    pub fn aborted() -> Self {
        Self {
            exit_code: EXIT_CODE_INCOMPLETE,
            error_message: Some("Aborted".to_string()),
            outcome: Outcome::Aborted,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.outcome == Outcome::Aborted
    }

    /// Exit status for a CLI process (-1 wraps to 255 like a shell would)
    pub fn process_exit_code(&self) -> u8 {
        (self.exit_code & 0xff) as u8
    }
}
