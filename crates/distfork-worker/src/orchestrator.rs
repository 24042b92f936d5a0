//! Remote execution orchestrator
//!
//! Runs one task end to end on the worker: stage the workspace, open
//! tunnels in both directions, run the process, harvest results and always
//! release what was acquired. The workspace and every tunnel handle are
//! registered on a single [`ReleaseList`] as soon as they exist, so every
//! exit path past staging goes through the same cleanup.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use distfork_protocol::{ExecutionResult, ExecutionState, ExecutionStateData, TaskSpec};

use crate::cancel::CancelToken;
use crate::channel::Channel;
use crate::cleanup::ReleaseList;
use crate::config::WorkerConfig;
use crate::harvest::{HarvestError, HarvestReport, Harvester};
use crate::log::ExecutionLog;
use crate::process::{ProcessRunner, RunError};
use crate::stager;
use crate::stream::{ControllerStreams, SharedWriter};
use crate::tunnel::{Direction, TunnelManager};

const FAILURE_MESSAGE: &str = "Failed to execute a process";

/// Everything an execution needs from the invoking context.
pub struct ExecutionContext {
    pub controller: Arc<dyn Channel>,
    pub worker: Arc<dyn Channel>,
    pub streams: ControllerStreams,
    pub cancel: CancelToken,
}

/// Result of one execution plus how it got there.
#[derive(Debug)]
pub struct Execution {
    pub result: ExecutionResult,
    pub states: ExecutionStateData,
    pub workspace: Option<PathBuf>,
    pub harvest: Option<HarvestReport>,
}

/// How the process phase ended
enum Finish {
    Completed(i32),
    Aborted,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    runner: ProcessRunner,
    tunnels: TunnelManager,
}

impl Orchestrator {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            runner: ProcessRunner::new(config.poll_interval(), config.termination_grace()),
            tunnels: TunnelManager::new(config.poll_interval()),
        }
    }

    /// Run `spec` and report its result.
    pub fn execute(&self, spec: &TaskSpec, ctx: ExecutionContext) -> ExecutionResult {
        self.run(spec, ctx).result
    }

    /// Run `spec`, keeping the state history and harvest report.
    pub fn run(&self, spec: &TaskSpec, ctx: ExecutionContext) -> Execution {
        let ExecutionContext {
            controller,
            worker,
            streams,
            cancel,
        } = ctx;
        let log = ExecutionLog::new(streams.stdout.clone());
        let stderr = streams.stderr.clone();
        let mut exec = Execution {
            result: ExecutionResult::failed(FAILURE_MESSAGE),
            states: ExecutionStateData::new(),
            workspace: None,
            harvest: None,
        };

        log.info(&format!("Executing on {}", worker.node_name()));
        tracing::info!(task = %spec.display_name, worker = worker.node_name(), "execution starting");

        if let Err(e) = spec.validate() {
            log.failure(FAILURE_MESSAGE, &e);
            advance(&mut exec.states, ExecutionState::Failed);
            exec.result = ExecutionResult::failed(e.to_string());
            return exec;
        }

        advance(&mut exec.states, ExecutionState::Staging);
        let workspace = match stager::prepare(
            worker.as_ref(),
            controller.as_ref(),
            spec.bootstrap_archive.as_deref(),
            &spec.input_files,
            &cancel,
        ) {
            Ok(ws) => ws,
            Err(e) => {
                log.failure(FAILURE_MESSAGE, &e);
                advance(&mut exec.states, ExecutionState::Failed);
                exec.result = ExecutionResult::failed(e.to_string());
                return exec;
            }
        };
        let ws_path = workspace.path().to_path_buf();
        exec.workspace = Some(ws_path.clone());
        tracing::info!(workspace = %ws_path.display(), "workspace staged");

        let mut release = ReleaseList::new();
        release.push(format!("workspace {}", ws_path.display()), move || {
            let mut workspace = workspace;
            workspace.destroy().map_err(|e| e.to_string())
        });

        let start_time = match worker.system_time() {
            Ok(t) => t,
            Err(e) => {
                log.failure(FAILURE_MESSAGE, &e);
                report_release_failures(&log, release.run());
                advance(&mut exec.states, ExecutionState::Failed);
                exec.result = ExecutionResult::failed(e.to_string());
                return exec;
            }
        };

        advance(&mut exec.states, ExecutionState::Running);
        self.open_tunnels(spec, &controller, &worker, &cancel, &mut release, &log);

        let finish = match self.runner.run(&spec.command, &spec.env, &ws_path, streams, &cancel) {
            Ok(code) => {
                if spec.wants_harvest() {
                    advance(&mut exec.states, ExecutionState::Harvesting);
                    self.harvest(spec, code, start_time, &ws_path, &controller, &worker, &cancel, &stderr, &log, &mut exec)
                } else {
                    Finish::Completed(code)
                }
            }
            Err(RunError::Cancelled) => Finish::Aborted,
            Err(e) => {
                log.failure(FAILURE_MESSAGE, &e);
                Finish::Failed(e.to_string())
            }
        };
        if matches!(finish, Finish::Aborted) {
            log.error("Aborted");
        }

        advance(&mut exec.states, ExecutionState::CleaningUp);
        report_release_failures(&log, release.run());

        let (state, result) = match finish {
            Finish::Completed(code) => (ExecutionState::Succeeded, ExecutionResult::completed(code)),
            Finish::Aborted => (ExecutionState::Aborted, ExecutionResult::aborted()),
            Finish::Failed(msg) => (ExecutionState::Failed, ExecutionResult::failed(msg)),
        };
        advance(&mut exec.states, state);
        tracing::info!(
            task = %spec.display_name,
            exit_code = result.exit_code,
            outcome = ?result.outcome,
            "execution finished"
        );
        exec.result = result;
        exec
    }

    /// Open both directions and register every handle for release.
    ///
    /// A failure stops that direction only.
    fn open_tunnels(
        &self,
        spec: &TaskSpec,
        controller: &Arc<dyn Channel>,
        worker: &Arc<dyn Channel>,
        cancel: &CancelToken,
        release: &mut ReleaseList,
        log: &ExecutionLog,
    ) {
        let directions = [
            (Direction::LocalToRemote, &spec.local_to_remote, controller, worker),
            (Direction::RemoteToLocal, &spec.remote_to_local, worker, controller),
        ];

        for (direction, specs, listen_on, forward_via) in directions {
            if specs.is_empty() {
                continue;
            }
            let opened = self.tunnels.open(direction, specs, listen_on, forward_via, cancel);
            for handle in opened.handles {
                release.push(format!("tunnel {} {}", direction, handle.spec()), move || {
                    handle.close().map_err(|e| e.to_string())
                });
            }
            if let Some(e) = opened.failure {
                log.warn(&e.to_string());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn harvest(
        &self,
        spec: &TaskSpec,
        code: i32,
        start_time: SystemTime,
        ws_path: &Path,
        controller: &Arc<dyn Channel>,
        worker: &Arc<dyn Channel>,
        cancel: &CancelToken,
        stderr: &SharedWriter,
        log: &ExecutionLog,
        exec: &mut Execution,
    ) -> Finish {
        let mut err_out = stderr.clone();
        if let Err(e) = writeln!(err_out, "Copying back files").and_then(|_| err_out.flush()) {
            tracing::warn!(error = %e, "failed to write to controller stderr");
        }

        let harvester = Harvester::new(worker.as_ref(), controller.as_ref(), ws_path);
        match harvester.harvest(&spec.output_files, spec.return_archive.as_deref(), start_time, cancel) {
            Ok(report) => {
                for e in &report.errors {
                    log.warn(&e.to_string());
                }
                exec.harvest = Some(report);
                Finish::Completed(code)
            }
            Err(HarvestError::Cancelled) => Finish::Aborted,
            Err(e) => {
                log.warn(&e.to_string());
                Finish::Completed(code)
            }
        }
    }
}

fn advance(states: &mut ExecutionStateData, next: ExecutionState) {
    if let Err(e) = states.transition(next) {
        tracing::warn!(error = %e, "unexpected execution state transition");
    }
}

fn report_release_failures(log: &ExecutionLog, failures: Vec<String>) {
    for failure in failures {
        log.warn(&failure);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::channel::LocalChannel;
    use crate::stream::CaptureBuffer;
    use distfork_protocol::Outcome;
    use std::fs;

    struct Harness {
        dir: tempfile::TempDir,
        orchestrator: Orchestrator,
    }

    impl Harness {
        fn new() -> Self {
            let config = WorkerConfig {
                poll_interval_ms: 10,
                termination_grace_ms: 200,
                ..WorkerConfig::default()
            };
            Self {
                dir: tempfile::tempdir().unwrap(),
                orchestrator: Orchestrator::new(&config),
            }
        }

        fn worker_root(&self) -> PathBuf {
            self.dir.path().join("worker")
        }

        fn context(&self, cancel: CancelToken) -> (ExecutionContext, CaptureBuffer, CaptureBuffer) {
            let (streams, out, err) = ControllerStreams::captured();
            let ctx = ExecutionContext {
                controller: Arc::new(LocalChannel::new("", self.dir.path())),
                worker: Arc::new(LocalChannel::new("node-1", self.worker_root())),
                streams,
                cancel,
            };
            (ctx, out, err)
        }
    }

    #[test]
    fn test_log_names_worker_and_result_is_real_exit_code() {
        let h = Harness::new();
        let spec = TaskSpec::builder(["/bin/sh", "-c", "echo hi; exit 4"]).build().unwrap();
        let (ctx, out, _) = h.context(CancelToken::new());

        let exec = h.orchestrator.run(&spec, ctx);

        assert_eq!(exec.result.exit_code, 4);
        assert_eq!(exec.result.outcome, Outcome::Succeeded);
        assert_eq!(out.contents(), "Executing on node-1\nhi\n");
        assert!(!exec.workspace.unwrap().exists());
        assert!(exec.states.visited(ExecutionState::CleaningUp));
        assert!(!exec.states.visited(ExecutionState::Harvesting));
    }

    #[test]
    fn test_staging_failure_skips_running() {
        let h = Harness::new();
        let spec = TaskSpec::builder(["true"])
            .input_file("in.txt", h.dir.path().join("absent"))
            .build()
            .unwrap();
        let (ctx, out, _) = h.context(CancelToken::new());

        let exec = h.orchestrator.run(&spec, ctx);

        assert_eq!(exec.result.exit_code, -1);
        assert_eq!(exec.result.outcome, Outcome::Failed);
        assert!(!exec.states.visited(ExecutionState::Running));
        assert!(out.contents().contains("ERROR: Failed to execute a process"));
        assert_eq!(fs::read_dir(h.worker_root()).unwrap().count(), 0);
    }

    #[test]
    fn test_launch_failure_still_cleans_up() {
        let h = Harness::new();
        let spec = TaskSpec::builder(["/no/such/program"]).build().unwrap();
        let (ctx, out, _) = h.context(CancelToken::new());

        let exec = h.orchestrator.run(&spec, ctx);

        assert_eq!(exec.result.exit_code, -1);
        assert_eq!(exec.result.outcome, Outcome::Failed);
        assert!(exec.states.visited(ExecutionState::CleaningUp));
        assert!(out.contents().contains("/no/such/program"));
        assert!(!exec.workspace.unwrap().exists());
    }

    #[test]
    fn test_harvest_announced_on_stderr() {
        let h = Harness::new();
        let dest = h.dir.path().join("result.txt");
        let spec = TaskSpec::builder(["/bin/sh", "-c", "echo done > out.txt"])
            .output_file(&dest, "out.txt")
            .build()
            .unwrap();
        let (ctx, _, err) = h.context(CancelToken::new());

        let exec = h.orchestrator.run(&spec, ctx);

        assert_eq!(exec.result.exit_code, 0);
        assert_eq!(err.contents(), "Copying back files\n");
        assert_eq!(fs::read_to_string(&dest).unwrap(), "done\n");
        assert!(exec.harvest.unwrap().is_clean());
        assert!(exec.states.visited(ExecutionState::Harvesting));
    }

    #[test]
    fn test_harvest_failure_keeps_exit_code() {
        let h = Harness::new();
        let spec = TaskSpec::builder(["/bin/sh", "-c", "exit 3"])
            .output_file(h.dir.path().join("result.txt"), "never-written.txt")
            .build()
            .unwrap();
        let (ctx, out, _) = h.context(CancelToken::new());

        let exec = h.orchestrator.run(&spec, ctx);

        assert_eq!(exec.result.exit_code, 3);
        assert_eq!(exec.result.outcome, Outcome::Succeeded);
        assert!(out.contents().contains("WARNING: failed to copy back"));
    }

    #[test]
    fn test_cancel_during_staging_is_failure() {
        let h = Harness::new();
        let spec = TaskSpec::builder(["/bin/sh", "-c", "touch ran"]).build().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let (ctx, out, _) = h.context(cancel);

        let exec = h.orchestrator.run(&spec, ctx);

        assert_eq!(exec.result.exit_code, -1);
        assert_eq!(exec.result.outcome, Outcome::Failed);
        assert!(!exec.states.visited(ExecutionState::Running));
        assert!(out.contents().contains("cancelled while staging"));
        assert_eq!(fs::read_dir(h.worker_root()).unwrap().count(), 0);
    }

    /// Controller that requests cancellation the first time a file is written to it
    struct CancelOnWrite {
        inner: LocalChannel,
        cancel: CancelToken,
    }

    impl Channel for CancelOnWrite {
        fn node_name(&self) -> &str {
            self.inner.node_name()
        }
        fn root_path(&self) -> &Path {
            self.inner.root_path()
        }
        fn system_time(&self) -> std::io::Result<SystemTime> {
            self.inner.system_time()
        }
        fn open_read(&self, path: &Path) -> std::io::Result<Box<dyn std::io::Read + Send>> {
            self.inner.open_read(path)
        }
        fn open_write(&self, path: &Path) -> std::io::Result<Box<dyn std::io::Write + Send>> {
            self.cancel.cancel();
            self.inner.open_write(path)
        }
        fn permissions(&self, path: &Path) -> std::io::Result<u32> {
            self.inner.permissions(path)
        }
        fn set_permissions(&self, path: &Path, mode: u32) -> std::io::Result<()> {
            self.inner.set_permissions(path, mode)
        }
        fn exists(&self, path: &Path) -> std::io::Result<bool> {
            self.inner.exists(path)
        }
        fn remove_file(&self, path: &Path) -> std::io::Result<()> {
            self.inner.remove_file(path)
        }
        fn rename(&self, from: &Path, to: &Path) -> std::io::Result<()> {
            self.inner.rename(from, to)
        }
        fn bind(&self, port: u16) -> std::io::Result<std::net::TcpListener> {
            self.inner.bind(port)
        }
        fn connect(&self, host: &str, port: u16) -> std::io::Result<std::net::TcpStream> {
            self.inner.connect(host, port)
        }
    }

    #[test]
    fn test_cancel_during_harvest_is_aborted() {
        let h = Harness::new();
        let cancel = CancelToken::new();
        let (streams, out, _) = ControllerStreams::captured();
        let ctx = ExecutionContext {
            controller: Arc::new(CancelOnWrite {
                inner: LocalChannel::new("", h.dir.path()),
                cancel: cancel.clone(),
            }),
            worker: Arc::new(LocalChannel::new("node-1", h.worker_root())),
            streams,
            cancel,
        };
        let first = h.dir.path().join("a.txt");
        let second = h.dir.path().join("b.txt");
        let spec = TaskSpec::builder(["/bin/sh", "-c", "echo a > a.txt; echo b > b.txt"])
            .output_file(&first, "a.txt")
            .output_file(&second, "b.txt")
            .build()
            .unwrap();

        let exec = h.orchestrator.run(&spec, ctx);

        assert_eq!(exec.result.exit_code, -1);
        assert_eq!(exec.result.outcome, Outcome::Aborted);
        assert!(exec.states.visited(ExecutionState::Harvesting));
        assert_eq!(exec.states.state, ExecutionState::Aborted);
        assert!(out.contents().ends_with("ERROR: Aborted\n"));
        // the first file was mid-copy when cancellation arrived; the second is never attempted
        assert!(!second.exists());
        assert!(!exec.workspace.unwrap().exists());
        assert_eq!(fs::read_dir(h.worker_root()).unwrap().count(), 0);
    }
}
