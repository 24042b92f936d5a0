//! Task descriptor
//!
//! A `TaskSpec` is created once at submission time and never mutated after
//! it has been handed to a worker.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TaskSpecError;
use crate::port::PortSpec;

/// Display names longer than this are cut and suffixed with ` ...`
pub const MAX_DISPLAY_NAME_LEN: usize = 80;

/// Number of command words used for a default display name
const DISPLAY_NAME_WORDS: usize = 3;

/// Immutable description of one remote execution request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Label the worker must satisfy (None = any worker)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Command vector; first element is the program
    pub command: Vec<String>,

    /// Environment overrides merged over the worker's environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Zip or tgz archive (controller path) expanded into the workspace before launch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_archive: Option<PathBuf>,

    /// Workspace-relative destination -> controller source path
    #[serde(default)]
    pub input_files: BTreeMap<PathBuf, PathBuf>,

    /// Controller destination path -> workspace-relative source path
    #[serde(default)]
    pub output_files: BTreeMap<PathBuf, PathBuf>,

    /// Controller path of an archive holding everything touched during the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_archive: Option<PathBuf>,

    /// Listener on the controller, target reached from the worker
    #[serde(default)]
    pub local_to_remote: Vec<PortSpec>,

    /// Listener on the worker, target reached from the controller
    #[serde(default)]
    pub remote_to_local: Vec<PortSpec>,

    /// Human-readable name
    pub display_name: String,

    /// Estimated duration in milliseconds (None = unknown)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
}

impl TaskSpec {
    /// Start building a task for the given command vector
    pub fn builder<I, S>(command: I) -> TaskSpecBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TaskSpecBuilder::new(command)
    }

    /// Check the invariants a worker relies on
    pub fn validate(&self) -> Result<(), TaskSpecError> {
        if self.command.is_empty() {
            return Err(TaskSpecError::EmptyCommand);
        }
        for dest in self.input_files.keys() {
            check_workspace_relative(dest)?;
        }
        for src in self.output_files.values() {
            check_workspace_relative(src)?;
        }
        Ok(())
    }

    /// Whether anything has to be copied back after the process exits
    pub fn wants_harvest(&self) -> bool {
        !self.output_files.is_empty() || self.return_archive.is_some()
    }

    /// Default display name derived from a command vector
    pub fn default_display_name(command: &[String]) -> String {
        let mut truncated = command.len() > DISPLAY_NAME_WORDS;
        let mut name = command
            .iter()
            .take(DISPLAY_NAME_WORDS)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");

        if name.chars().count() > MAX_DISPLAY_NAME_LEN {
            name = name.chars().take(MAX_DISPLAY_NAME_LEN).collect();
            truncated = true;
        }
        if truncated {
            name.push_str(" ...");
        }
        name
    }
}

/// Reject absolute paths and parent-directory components
pub fn check_workspace_relative(path: &Path) -> Result<(), TaskSpecError> {
    let escapes = path.as_os_str().is_empty()
        || path.components().any(|c| {
            matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
        });
    if escapes {
        return Err(TaskSpecError::EscapingPath(path.to_path_buf()));
    }
    Ok(())
}

/// Split `NAME=VALUE` on the first `=`
pub fn parse_assignment(s: &str) -> Result<(String, String), TaskSpecError> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(TaskSpecError::InvalidAssignment(s.to_string())),
    }
}

/// Builder for [`TaskSpec`]
#[derive(Debug, Clone)]
pub struct TaskSpecBuilder {
    spec: TaskSpec,
    name_given: bool,
}

impl TaskSpecBuilder {
    fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            spec: TaskSpec {
                label: None,
                command: command.into_iter().map(Into::into).collect(),
                env: BTreeMap::new(),
                bootstrap_archive: None,
                input_files: BTreeMap::new(),
                output_files: BTreeMap::new(),
                return_archive: None,
                local_to_remote: Vec::new(),
                remote_to_local: Vec::new(),
                display_name: String::new(),
                estimated_duration_ms: None,
            },
            name_given: false,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.spec.label = Some(label.into());
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.env.insert(name.into(), value.into());
        self
    }

    pub fn bootstrap_archive(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.bootstrap_archive = Some(path.into());
        self
    }

    /// Copy `source` (controller) to `dest` (relative to the workspace) before launch
    pub fn input_file(mut self, dest: impl Into<PathBuf>, source: impl Into<PathBuf>) -> Self {
        self.spec.input_files.insert(dest.into(), source.into());
        self
    }

    /// Copy `source` (relative to the workspace) back to `dest` (controller) after exit
    pub fn output_file(mut self, dest: impl Into<PathBuf>, source: impl Into<PathBuf>) -> Self {
        self.spec.output_files.insert(dest.into(), source.into());
        self
    }

    pub fn return_archive(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.return_archive = Some(path.into());
        self
    }

    pub fn local_to_remote(mut self, spec: PortSpec) -> Self {
        self.spec.local_to_remote.push(spec);
        self
    }

    pub fn remote_to_local(mut self, spec: PortSpec) -> Self {
        self.spec.remote_to_local.push(spec);
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.spec.display_name = name.into();
        self.name_given = true;
        self
    }

    /// Estimated duration in milliseconds; negative means unknown
    pub fn estimated_duration_ms(mut self, millis: i64) -> Self {
        self.spec.estimated_duration_ms = u64::try_from(millis).ok();
        self
    }

    /// Validate and produce the immutable descriptor
    pub fn build(mut self) -> Result<TaskSpec, TaskSpecError> {
        if !self.name_given {
            self.spec.display_name = TaskSpec::default_display_name(&self.spec.command);
        }
        self.spec.validate()?;
        Ok(self.spec)
    }
}
