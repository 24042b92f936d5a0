//! Child process launch with live stdio relays
//!
//! Each standard stream is pumped on its own thread so a slow consumer on
//! one stream cannot stall the others. Output is forwarded chunk by chunk
//! as it is produced. The wait loop polls the cancellation token and kills
//! the child's whole process group when cancellation is requested.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::stream::{ControllerStreams, SharedWriter};

const PUMP_BUFFER_SIZE: usize = 8 * 1024;

/// Errors from running a process.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("no command to run")]
    EmptyCommand,

    #[error("failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error while waiting for the process: {0}")]
    Io(#[from] io::Error),
}

/// Launches one command and relays its streams.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    poll_interval: Duration,
    termination_grace: Duration,
}

impl ProcessRunner {
    pub fn new(poll_interval: Duration, termination_grace: Duration) -> Self {
        Self {
            poll_interval,
            termination_grace,
        }
    }

    /// Run `command` in `cwd` with `env` merged over the inherited environment.
    ///
    /// Blocks until the child exits and returns its exit code. A child killed
    /// by a signal reports `128 + signal`.
    pub fn run(
        &self,
        command: &[String],
        env: &BTreeMap<String, String>,
        cwd: &Path,
        streams: ControllerStreams,
        cancel: &CancelToken,
    ) -> Result<i32, RunError> {
        let (program, args) = command.split_first().ok_or(RunError::EmptyCommand)?;

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // own group, so cancellation reaches grandchildren too
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| RunError::Launch {
            program: program.clone(),
            source,
        })?;
        tracing::info!(pid = child.id(), program = %program, cwd = %cwd.display(), "process started");

        let ControllerStreams { stdin, stdout, stderr } = streams;

        // stdin is never joined: the controller side may never reach EOF
        if let Some(child_stdin) = child.stdin.take() {
            spawn_pump("stdin", stdin, child_stdin);
        }
        let out_pump = child
            .stdout
            .take()
            .map(|s| spawn_pump("stdout", s, stdout));
        let err_pump = child
            .stderr
            .take()
            .map(|s| spawn_pump("stderr", s, stderr));

        let status = loop {
            if cancel.is_cancelled() {
                tracing::info!(pid = child.id(), "cancellation requested, terminating process");
                if let Err(e) = self.terminate(&mut child) {
                    tracing::warn!(pid = child.id(), error = %e, "failed to terminate process");
                }
                return Err(RunError::Cancelled);
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(self.poll_interval),
            }
        };

        // background processes may still hold the output pipes
        let pumps: Vec<_> = [out_pump, err_pump].into_iter().flatten().collect();
        while !pumps.iter().all(|p| p.is_finished()) {
            if cancel.is_cancelled() {
                tracing::info!(pid = child.id(), "cancellation requested, killing leftover processes");
                kill_group(&child);
                return Err(RunError::Cancelled);
            }
            thread::sleep(self.poll_interval);
        }
        for pump in pumps {
            let _ = pump.join();
        }

        let code = exit_code(status);
        tracing::info!(exit_code = code, "process exited");
        Ok(code)
    }

    /// SIGTERM the process group, wait the grace period, then SIGKILL.
    fn terminate(&self, child: &mut Child) -> io::Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(child.id() as i32);
            let _ = signal::killpg(pgid, Signal::SIGTERM);

            let start = Instant::now();
            while start.elapsed() < self.termination_grace {
                if child.try_wait()?.is_some() {
                    // leader is gone; make sure stragglers in the group are too
                    let _ = signal::killpg(pgid, Signal::SIGKILL);
                    return Ok(());
                }
                thread::sleep(self.poll_interval);
            }
            let _ = signal::killpg(pgid, Signal::SIGKILL);
        }

        let _ = child.kill();
        child.wait()?;
        Ok(())
    }
}

/// SIGKILL whatever is left in the child's process group.
fn kill_group(child: &Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Err(e) = signal::killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
            tracing::debug!(pid = child.id(), error = %e, "process group already gone");
        }
    }
    #[cfg(not(unix))]
    let _ = child;
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    distfork_protocol::EXIT_CODE_INCOMPLETE
}

/// Where a pump writes to
trait Sink: Send + 'static {
    fn put(&mut self, chunk: &[u8]) -> io::Result<()>;
}

impl Sink for SharedWriter {
    fn put(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.write_chunk(chunk)
    }
}

impl Sink for std::process::ChildStdin {
    fn put(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.write_all(chunk)?;
        self.flush()
    }
}

fn spawn_pump<R, S>(name: &'static str, mut source: R, mut sink: S) -> JoinHandle<()>
where
    R: Read + Send + 'static,
    S: Sink,
{
    thread::spawn(move || {
        let mut buf = [0u8; PUMP_BUFFER_SIZE];
        let mut sink_open = true;
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(stream = name, error = %e, "stream read failed");
                    break;
                }
            };
            // keep draining after the sink fails so the child never blocks on a full pipe
            if sink_open {
                if let Err(e) = sink.put(&buf[..n]) {
                    tracing::debug!(stream = name, error = %e, "stream consumer went away");
                    sink_open = false;
                    if name == "stdin" {
                        break;
                    }
                }
            }
        }
        // dropping the sink closes the child's stdin
    })
}
