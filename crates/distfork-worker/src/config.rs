//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name reported in the execution log.
    pub name: String,
    /// Directory under which per-execution workspaces are created.
    pub root: PathBuf,
    /// Labels this worker satisfies.
    pub labels: Vec<String>,
    /// Grace period between SIGTERM and SIGKILL when cancelling.
    pub termination_grace_ms: u64,
    /// Poll interval for the process wait loop and tunnel accept loops.
    pub poll_interval_ms: u64,
}

impl WorkerConfig {
    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Whether this worker satisfies `label` (no label = any worker)
    pub fn satisfies(&self, label: Option<&str>) -> bool {
        match label {
            None => true,
            Some(l) => self.labels.iter().any(|have| have == l) || l == self.name,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "master".to_string(),
            root: std::env::temp_dir(),
            labels: Vec::new(),
            termination_grace_ms: 2000,
            poll_interval_ms: 50,
        }
    }
}
