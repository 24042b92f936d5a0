//! Ordered release actions run on every exit path.
//!
//! Resources acquired during an execution register a release action here.
//! `run()` executes them in registration order; dropping the list runs
//! whatever is still pending, so release also happens while unwinding.

type ReleaseFn = Box<dyn FnOnce() -> Result<(), String> + Send>;

/// Ordered list of named release actions.
#[derive(Default)]
pub struct ReleaseList {
    pending: Vec<(String, ReleaseFn)>,
}

impl ReleaseList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release action.
    pub fn push<F>(&mut self, name: impl Into<String>, release: F)
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        self.pending.push((name.into(), Box::new(release)));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Run every pending action in order. Failures are logged and collected,
    /// never propagated; a second call finds nothing pending.
    pub fn run(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        for (name, release) in self.pending.drain(..) {
            tracing::debug!(resource = %name, "releasing");
            if let Err(e) = release() {
                tracing::warn!(resource = %name, error = %e, "release failed");
                failures.push(format!("{}: {}", name, e));
            }
        }
        failures
    }
}

impl Drop for ReleaseList {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            self.run();
        }
    }
}

impl std::fmt::Debug for ReleaseList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.pending.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("ReleaseList").field("pending", &names).finish()
    }
}
