//! Controller-side standard streams.
//!
//! The process output and the execution log share the controller's stdout,
//! so writers are wrapped in a mutex and handed out as cheap clones.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

/// Cloneable writer; every clone writes to the same underlying sink.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SharedWriter {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Write a whole chunk and flush it while holding the lock.
    pub fn write_chunk(&self, buf: &[u8]) -> io::Result<()> {
        let mut w = self.lock()?;
        w.write_all(buf)?;
        w.flush()
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, Box<dyn Write + Send>>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "stream writer lock poisoned"))
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

impl std::fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWriter").finish_non_exhaustive()
    }
}

/// In-memory sink whose contents can be read back.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        self.bytes
            .lock()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = self
            .bytes
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "capture buffer lock poisoned"))?;
        bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The three live streams supplied by the invoking context.
pub struct ControllerStreams {
    pub stdin: Box<dyn Read + Send>,
    pub stdout: SharedWriter,
    pub stderr: SharedWriter,
}

impl ControllerStreams {
    pub fn new<R: Read + Send + 'static>(stdin: R, stdout: SharedWriter, stderr: SharedWriter) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout,
            stderr,
        }
    }

    /// Streams wired to this process's own stdin/stdout/stderr.
    pub fn inherit() -> Self {
        Self::new(io::stdin(), SharedWriter::new(io::stdout()), SharedWriter::new(io::stderr()))
    }

    /// Empty stdin, output captured in memory. Returns (streams, stdout, stderr).
    pub fn captured() -> (Self, CaptureBuffer, CaptureBuffer) {
        let out = CaptureBuffer::new();
        let err = CaptureBuffer::new();
        let streams = Self::new(
            io::empty(),
            SharedWriter::new(out.clone()),
            SharedWriter::new(err.clone()),
        );
        (streams, out, err)
    }
}

impl std::fmt::Debug for ControllerStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerStreams").finish_non_exhaustive()
    }
}
