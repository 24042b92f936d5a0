//! Per-entry inclusion filters for archive building

use std::fs::Metadata;
use std::path::Path;
use std::time::SystemTime;

/// A filesystem object considered for inclusion in an archive
#[derive(Debug, Clone, Copy)]
pub struct ArchiveEntry<'a> {
    /// Absolute path on disk
    pub path: &'a Path,
    /// Path relative to the archive root (never empty)
    pub relative: &'a Path,
    /// Metadata of the entry itself (symlinks are not followed)
    pub metadata: &'a Metadata,
}

/// Decides whether an entry goes into an archive
pub trait EntryFilter {
    fn include(&self, entry: &ArchiveEntry<'_>) -> bool;
}

/// Includes everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl EntryFilter for AcceptAll {
    fn include(&self, _entry: &ArchiveEntry<'_>) -> bool {
        true
    }
}

/// Includes entries modified strictly after a threshold.
///
/// With the threshold set to the worker clock right before launch, the
/// archive holds only what the process created or touched.
#[derive(Debug, Clone, Copy)]
pub struct TimestampFilter {
    threshold: SystemTime,
}

impl TimestampFilter {
    pub fn new(threshold: SystemTime) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> SystemTime {
        self.threshold
    }
}

impl EntryFilter for TimestampFilter {
    fn include(&self, entry: &ArchiveEntry<'_>) -> bool {
        match entry.metadata.modified() {
            Ok(mtime) => mtime > self.threshold,
            // platform without mtimes: keep the entry rather than lose output
            Err(_) => true,
        }
    }
}
