//! Controller-visible execution log.
//!
//! Plain text written to the controller's stdout, separate from the
//! `tracing` diagnostics emitted on the worker.

use std::error::Error;
use std::io::Write;

use crate::stream::SharedWriter;

/// Line-oriented log sink on the controller's stdout.
#[derive(Debug, Clone)]
pub struct ExecutionLog {
    out: SharedWriter,
}

impl ExecutionLog {
    pub fn new(out: SharedWriter) -> Self {
        Self { out }
    }

    pub fn info(&self, msg: &str) {
        self.line(msg);
    }

    pub fn warn(&self, msg: &str) {
        self.line(&format!("WARNING: {}", msg));
    }

    pub fn error(&self, msg: &str) {
        self.line(&format!("ERROR: {}", msg));
    }

    /// Report a failure followed by its source chain.
    pub fn failure(&self, msg: &str, err: &dyn Error) {
        self.error(msg);
        self.line(&err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            self.line(&format!("Caused by: {}", cause));
            source = cause.source();
        }
    }

    fn line(&self, msg: &str) {
        let mut out = self.out.clone();
        if let Err(e) = writeln!(out, "{}", msg).and_then(|_| out.flush()) {
            tracing::warn!(error = %e, "failed to write execution log");
        }
    }
}
