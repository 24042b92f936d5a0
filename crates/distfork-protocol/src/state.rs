//! Execution state machine
//!
//! Created → Staging → Running → Harvesting → CleaningUp → {Succeeded | Failed | Aborted}
//!
//! Staging failures go straight to Failed. Running may skip Harvesting when
//! nothing is to be copied back or the run was cancelled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Execution state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Created,
    Staging,
    Running,
    Harvesting,
    CleaningUp,
    Succeeded,
    Failed,
    Aborted,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded | ExecutionState::Failed | ExecutionState::Aborted
        )
    }

    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: ExecutionState) -> bool {
        use ExecutionState::*;

        match (self, target) {
            (Created, Staging) => true,
            (Created, Failed) => true, // invalid descriptor

            (Staging, Running) => true,
            (Staging, Failed) => true,

            (Running, Harvesting) => true,
            (Running, CleaningUp) => true,

            (Harvesting, CleaningUp) => true,

            (CleaningUp, Succeeded) => true,
            (CleaningUp, Failed) => true,
            (CleaningUp, Aborted) => true,

            _ => false,
        }
    }
}

/// Errors for state transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ExecutionState,
        to: ExecutionState,
    },
}

/// Current state plus the timestamped path taken to reach it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStateData {
    pub state: ExecutionState,
    pub history: Vec<(ExecutionState, DateTime<Utc>)>,
}

impl ExecutionStateData {
    /// Start in Created
    pub fn new() -> Self {
        Self {
            state: ExecutionState::Created,
            history: vec![(ExecutionState::Created, Utc::now())],
        }
    }

    /// Transition to a new state
    pub fn transition(&mut self, next: ExecutionState) -> Result<(), StateError> {
        if !self.state.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push((next, Utc::now()));
        Ok(())
    }

    /// Whether the execution passed through `state`
    pub fn visited(&self, state: ExecutionState) -> bool {
        self.history.iter().any(|(s, _)| *s == state)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

impl Default for ExecutionStateData {
    fn default() -> Self {
        Self::new()
    }
}
