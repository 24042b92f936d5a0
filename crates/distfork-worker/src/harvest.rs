//! Result harvesting
//!
//! Copies named output files back to the controller and builds the return
//! archive. Each return file is written to `<dest>.tmp` first and renamed
//! over the destination, so a partial file is never visible at its final
//! name. Harvesting is best-effort: a failed file is reported and the rest
//! are still attempted. Nothing already copied is rolled back.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::archive::{self, ArchiveError, ArchiveFormat, TimestampFilter};
use crate::cancel::CancelToken;
use crate::channel::Channel;
use crate::stager::copy_with_permissions;

/// Suffix of the temp name a return file is written under
pub const TEMP_SUFFIX: &str = ".tmp";

/// Errors for harvest operations
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("failed to copy back {source_path} to {dest}: {source}")]
    ReturnFile {
        source_path: PathBuf,
        dest: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create return archive {path}: {source}")]
    CreateArchive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to build return archive {path}: {source}")]
    BuildArchive {
        path: PathBuf,
        #[source]
        source: ArchiveError,
    },

    #[error("cancelled while harvesting")]
    Cancelled,
}

/// What a harvest pass produced
#[derive(Debug, Default)]
pub struct HarvestReport {
    pub files_returned: usize,
    /// Entries in the return archive, if one was built
    pub archive_entries: Option<usize>,
    pub errors: Vec<HarvestError>,
}

impl HarvestReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Moves results from a workspace on the worker back to the controller.
pub struct Harvester<'a> {
    worker: &'a dyn Channel,
    controller: &'a dyn Channel,
    workspace: &'a Path,
}

impl<'a> Harvester<'a> {
    pub fn new(worker: &'a dyn Channel, controller: &'a dyn Channel, workspace: &'a Path) -> Self {
        Self {
            worker,
            controller,
            workspace,
        }
    }

    /// Return every mapped output file, then build the return archive.
    ///
    /// Only cancellation is returned as an error. Per-item failures are
    /// collected in the report.
    pub fn harvest(
        &self,
        output_files: &BTreeMap<PathBuf, PathBuf>,
        return_archive: Option<&Path>,
        start_time: SystemTime,
        cancel: &CancelToken,
    ) -> Result<HarvestReport, HarvestError> {
        let mut report = HarvestReport::default();

        for (dest, source) in output_files {
            if cancel.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }
            match self.return_file(source, dest) {
                Ok(()) => report.files_returned += 1,
                Err(e) => {
                    tracing::warn!(dest = %dest.display(), error = %e, "return file failed");
                    report.errors.push(e);
                }
            }
        }

        if let Some(path) = return_archive {
            if cancel.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }
            match self.build_return_archive(path, start_time) {
                Ok(count) => report.archive_entries = Some(count),
                Err(e) => {
                    tracing::warn!(archive = %path.display(), error = %e, "return archive failed");
                    report.errors.push(e);
                }
            }
        }

        Ok(report)
    }

    /// Copy one workspace file to the controller through a temp name.
    pub fn return_file(&self, source: &Path, dest: &Path) -> Result<(), HarvestError> {
        let from = self.workspace.join(source);
        let tmp = temp_name(dest);

        let result = copy_with_permissions(self.worker, &from, self.controller, &tmp)
            .and_then(|()| self.replace(&tmp, dest));

        if let Err(source_err) = result {
            if self.controller.exists(&tmp).unwrap_or(false) {
                if let Err(e) = self.controller.remove_file(&tmp) {
                    tracing::warn!(tmp = %tmp.display(), error = %e, "failed to remove temp file");
                }
            }
            return Err(HarvestError::ReturnFile {
                source_path: source.to_path_buf(),
                dest: dest.to_path_buf(),
                source: source_err,
            });
        }

        tracing::debug!(dest = %dest.display(), "returned file");
        Ok(())
    }

    fn replace(&self, tmp: &Path, dest: &Path) -> io::Result<()> {
        if self.controller.exists(dest)? {
            self.controller.remove_file(dest)?;
        }
        self.controller.rename(tmp, dest)
    }

    /// Archive everything in the workspace modified after `start_time`.
    pub fn build_return_archive(&self, path: &Path, start_time: SystemTime) -> Result<usize, HarvestError> {
        let writer = self
            .controller
            .open_write(path)
            .map_err(|source| HarvestError::CreateArchive {
                path: path.to_path_buf(),
                source,
            })?;
        let format = ArchiveFormat::from_name(path);
        let filter = TimestampFilter::new(start_time);

        let count = archive::build(self.workspace, &filter, BufWriter::new(writer), format).map_err(|source| {
            HarvestError::BuildArchive {
                path: path.to_path_buf(),
                source,
            }
        })?;
        tracing::debug!(archive = %path.display(), entries = count, ?format, "built return archive");
        Ok(count)
    }
}

/// `<dest>.tmp`, next to the destination
pub fn temp_name(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}
