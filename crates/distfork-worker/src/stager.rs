//! Workspace staging
//!
//! Creates the per-execution temp directory on the worker, expands the
//! bootstrap archive into it and copies input files over from the
//! controller with their permission bits.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use distfork_protocol::{check_workspace_relative, TaskSpecError};
use uuid::Uuid;

use crate::archive::{self, ArchiveError, ArchiveFormat};
use crate::cancel::CancelToken;
use crate::channel::Channel;

/// Workspace directory name prefix
pub const WORKSPACE_PREFIX: &str = "distfork";

/// Errors for staging operations
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("failed to create workspace under {root}: {source}")]
    CreateWorkspace {
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read bootstrap archive {path}: {source}")]
    OpenArchive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to expand bootstrap archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: ArchiveError,
    },

    #[error("failed to copy {source_path} to {dest}: {source}")]
    CopyInput {
        source_path: PathBuf,
        dest: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid input destination: {0}")]
    InvalidDestination(#[from] TaskSpecError),

    #[error("cancelled while staging")]
    Cancelled,
}

/// A uniquely named temp directory owned by one execution.
///
/// `destroy` deletes it at most once; dropping an undestroyed workspace
/// deletes it too.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    destroyed: bool,
}

impl Workspace {
    /// Create a fresh directory under `root`.
    pub fn create(root: &Path) -> Result<Self, StagingError> {
        let create_err = |source| StagingError::CreateWorkspace {
            root: root.to_path_buf(),
            source,
        };

        fs::create_dir_all(root).map_err(create_err)?;
        let path = root.join(format!("{}{}", WORKSPACE_PREFIX, Uuid::new_v4().simple()));
        fs::create_dir(&path).map_err(create_err)?;

        tracing::debug!(workspace = %path.display(), "created workspace");
        Ok(Self {
            path,
            destroyed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Recursively delete the workspace. Later calls are no-ops.
    pub fn destroy(&mut self) -> io::Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {
                tracing::debug!(workspace = %self.path.display(), "deleted workspace");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!(workspace = %self.path.display(), error = %e, "failed to delete workspace");
        }
    }
}

/// Prepare a workspace on the worker.
///
/// Any failure, cancellation included, deletes the partially staged
/// directory before returning.
pub fn prepare(
    worker: &dyn Channel,
    controller: &dyn Channel,
    bootstrap: Option<&Path>,
    inputs: &BTreeMap<PathBuf, PathBuf>,
    cancel: &CancelToken,
) -> Result<Workspace, StagingError> {
    let mut workspace = Workspace::create(worker.root_path())?;

    if let Err(e) = stage(&workspace, worker, controller, bootstrap, inputs, cancel) {
        if let Err(cleanup) = workspace.destroy() {
            tracing::warn!(error = %cleanup, "failed to roll back workspace");
        }
        return Err(e);
    }

    Ok(workspace)
}

fn stage(
    workspace: &Workspace,
    worker: &dyn Channel,
    controller: &dyn Channel,
    bootstrap: Option<&Path>,
    inputs: &BTreeMap<PathBuf, PathBuf>,
    cancel: &CancelToken,
) -> Result<(), StagingError> {
    if let Some(archive_path) = bootstrap {
        let reader = controller
            .open_read(archive_path)
            .map_err(|source| StagingError::OpenArchive {
                path: archive_path.to_path_buf(),
                source,
            })?;
        let format = ArchiveFormat::from_name(archive_path);
        archive::extract(io::BufReader::new(reader), format, workspace.path()).map_err(|source| {
            StagingError::Archive {
                path: archive_path.to_path_buf(),
                source,
            }
        })?;
        tracing::debug!(archive = %archive_path.display(), ?format, "expanded bootstrap archive");
    }

    if cancel.is_cancelled() {
        return Err(StagingError::Cancelled);
    }

    for (dest, source_path) in inputs {
        if cancel.is_cancelled() {
            return Err(StagingError::Cancelled);
        }
        check_workspace_relative(dest)?;
        let target = workspace.path().join(dest);
        copy_with_permissions(controller, source_path, worker, &target).map_err(|source| {
            StagingError::CopyInput {
                source_path: source_path.clone(),
                dest: dest.clone(),
                source,
            }
        })?;
    }

    Ok(())
}

/// Copy a file between nodes, carrying over its permission bits.
pub fn copy_with_permissions(
    from: &dyn Channel,
    source: &Path,
    to: &dyn Channel,
    dest: &Path,
) -> io::Result<()> {
    let mode = from.permissions(source)?;
    let mut reader = from.open_read(source)?;
    let mut writer = to.open_write(dest)?;
    io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    drop(writer);
    to.set_permissions(dest, mode)
}
