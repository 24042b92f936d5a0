//! In-process dispatch handoff
//!
//! Runs an execution on its own thread and hands back a cancellable future.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use distfork_protocol::{ExecutionResult, TaskSpec};

use crate::cancel::CancelToken;
use crate::orchestrator::{ExecutionContext, Orchestrator};

/// Submits tasks to the orchestrator.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
}

impl Dispatcher {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Start executing `spec` and return immediately.
    pub fn submit(&self, spec: TaskSpec, ctx: ExecutionContext) -> TaskFuture {
        let cancel = ctx.cancel.clone();
        let orchestrator = Arc::clone(&self.orchestrator);
        let name = format!("distfork-{}", spec.display_name.chars().take(32).collect::<String>());

        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || orchestrator.execute(&spec, ctx));

        let state = match spawned {
            Ok(handle) => FutureState::Running(handle),
            Err(e) => {
                tracing::error!(error = %e, "failed to start execution thread");
                FutureState::Done(ExecutionResult::failed(format!("failed to start execution: {}", e)))
            }
        };
        TaskFuture { cancel, state }
    }
}

enum FutureState {
    Running(JoinHandle<ExecutionResult>),
    Done(ExecutionResult),
}

/// Handle on a submitted execution.
pub struct TaskFuture {
    cancel: CancelToken,
    state: FutureState,
}

impl TaskFuture {
    /// Request cancellation. The execution still runs its cleanup.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            FutureState::Running(handle) => handle.is_finished(),
            FutureState::Done(_) => true,
        }
    }

    /// Block until the execution finishes.
    pub fn wait(self) -> ExecutionResult {
        match self.state {
            FutureState::Done(result) => result,
            FutureState::Running(handle) => handle.join().unwrap_or_else(|panic| {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(panic = %detail, "execution thread panicked");
                ExecutionResult::failed(format!("execution panicked: {}", detail))
            }),
        }
    }
}

impl std::fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}
