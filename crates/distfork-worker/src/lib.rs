//! Worker-side remote execution for distfork
//!
//! The [`Orchestrator`] runs one task on a worker: it stages a workspace,
//! opens tunnels, runs the process with live stdio, harvests results and
//! releases everything it acquired on every exit path.

pub mod archive;
pub mod cancel;
pub mod channel;
pub mod cleanup;
pub mod config;
pub mod dispatch;
pub mod harvest;
pub mod log;
pub mod orchestrator;
pub mod process;
pub mod stager;
pub mod stream;
pub mod tunnel;

pub use archive::{ArchiveError, ArchiveFormat, EntryFilter, TimestampFilter};
pub use cancel::CancelToken;
pub use channel::{Channel, LocalChannel};
pub use cleanup::ReleaseList;
pub use config::WorkerConfig;
pub use dispatch::{Dispatcher, TaskFuture};
pub use harvest::{HarvestError, HarvestReport, Harvester};
pub use log::ExecutionLog;
pub use orchestrator::{Execution, ExecutionContext, Orchestrator};
pub use process::{ProcessRunner, RunError};
pub use stager::{StagingError, Workspace};
pub use stream::{CaptureBuffer, ControllerStreams, SharedWriter};
pub use tunnel::{Direction, TunnelError, TunnelHandle, TunnelManager};
