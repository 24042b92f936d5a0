//! Signal handling for SIGINT/SIGTERM
//!
//! The first signal cancels the in-flight task: the worker kills the child
//! and still cleans up the workspace and tunnels. A second signal exits
//! immediately with the incomplete-run status.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use distfork_protocol::ExecutionResult;
use distfork_worker::CancelToken;

/// Signal handler state
#[derive(Debug)]
pub struct SignalState {
    /// Signals received so far
    signal_count: AtomicU8,
    /// Token of the in-flight task
    cancel: CancelToken,
}

impl SignalState {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            signal_count: AtomicU8::new(0),
            cancel,
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Record a signal and decide what to do about it
    pub fn handle_signal(&self) -> SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);

        match count {
            0 => {
                self.cancel.cancel();
                SignalAction::Cancel
            }
            1 => SignalAction::ImmediateExit,
            _ => SignalAction::Ignore,
        }
    }
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: cancel the task and let cleanup run
    Cancel,
    /// Second signal: exit now
    ImmediateExit,
    /// Third+ signal
    Ignore,
}

/// Installs the process-wide handler
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            state: Arc::new(SignalState::new(cancel)),
        }
    }

    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// Install handlers for SIGINT and SIGTERM. Call once at startup.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || match state.handle_signal() {
            SignalAction::Cancel => {
                eprintln!("\nReceived interrupt signal, aborting...");
            }
            SignalAction::ImmediateExit => {
                eprintln!("\nReceived second interrupt, exiting immediately");
                std::process::exit(i32::from(ExecutionResult::aborted().process_exit_code()));
            }
            SignalAction::Ignore => {}
        })
    }
}
