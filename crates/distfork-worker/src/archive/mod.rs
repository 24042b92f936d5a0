//! Zip and gzip-compressed tar archives
//!
//! The format is picked from the file name: `.zip` means zip, anything else
//! is treated as a gzip-compressed tar. The same rule applies to bootstrap
//! archives on the way in and return archives on the way out.

mod filter;

pub use filter::{AcceptAll, ArchiveEntry, EntryFilter, TimestampFilter};

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Archive container format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Select the format from a file name suffix
    pub fn from_name(path: &Path) -> Self {
        let is_zip = path
            .to_string_lossy()
            .to_ascii_lowercase()
            .ends_with(".zip");
        if is_zip {
            ArchiveFormat::Zip
        } else {
            ArchiveFormat::TarGz
        }
    }
}

/// Errors for archive operations
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("path is not within archive root: {0}")]
    PathNotInRoot(PathBuf),
}

/// Expand an archive stream into `dest`.
///
/// Zip needs random access, so the stream is spooled to an anonymous temp
/// file first. Entries that would land outside `dest` are rejected by the
/// underlying readers.
pub fn extract<R: Read>(mut reader: R, format: ArchiveFormat, dest: &Path) -> Result<(), ArchiveError> {
    match format {
        ArchiveFormat::TarGz => {
            let mut archive = tar::Archive::new(GzDecoder::new(reader));
            archive.set_preserve_permissions(true);
            archive.unpack(dest)?;
        }
        ArchiveFormat::Zip => {
            let mut spool = tempfile::tempfile()?;
            io::copy(&mut reader, &mut spool)?;
            spool.seek(SeekFrom::Start(0))?;
            let mut archive = ZipArchive::new(spool)?;
            archive.extract(dest)?;
        }
    }
    Ok(())
}

/// Write every descendant of `root` accepted by `filter` into `dest`.
///
/// The root directory itself is never an entry, so extracting the archive
/// elsewhere reproduces only the contents. Returns the number of entries written.
pub fn build<W, F>(root: &Path, filter: &F, dest: W, format: ArchiveFormat) -> Result<usize, ArchiveError>
where
    W: Write,
    F: EntryFilter + ?Sized,
{
    let entries = collect_entries(root, filter)?;
    match format {
        ArchiveFormat::TarGz => write_tar_gz(&entries, dest)?,
        ArchiveFormat::Zip => write_zip(&entries, dest)?,
    }
    Ok(entries.len())
}

/// An accepted entry, ready to be written
#[derive(Debug)]
struct Selected {
    path: PathBuf,
    name: String,
    kind: EntryKind,
    mode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Directory,
    Symlink,
}

fn collect_entries<F: EntryFilter + ?Sized>(root: &Path, filter: &F) -> Result<Vec<Selected>, ArchiveError> {
    let mut selected = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry?;
        let path = entry.path();

        let rel_path = path
            .strip_prefix(root)
            .map_err(|_| ArchiveError::PathNotInRoot(path.to_path_buf()))?;

        // Skip root itself
        if rel_path.as_os_str().is_empty() {
            continue;
        }

        let metadata = fs::symlink_metadata(path)?;
        let candidate = ArchiveEntry {
            path,
            relative: rel_path,
            metadata: &metadata,
        };
        if !filter.include(&candidate) {
            continue;
        }

        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        selected.push(Selected {
            path: path.to_path_buf(),
            name: entry_name(rel_path),
            kind,
            mode: mode_of(&metadata, kind),
        });
    }

    Ok(selected)
}

/// Archive entry names always use `/`
fn entry_name(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata, _kind: EntryKind) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &fs::Metadata, kind: EntryKind) -> u32 {
    match (kind, metadata.permissions().readonly()) {
        (EntryKind::Directory, _) => 0o755,
        (_, true) => 0o444,
        (_, false) => 0o644,
    }
}

fn write_tar_gz<W: Write>(entries: &[Selected], dest: W) -> Result<(), ArchiveError> {
    let mut builder = tar::Builder::new(GzEncoder::new(dest, Compression::default()));
    builder.follow_symlinks(false);

    for entry in entries {
        match entry.kind {
            EntryKind::Directory => builder.append_dir(&entry.name, &entry.path)?,
            EntryKind::File | EntryKind::Symlink => {
                builder.append_path_with_name(&entry.path, &entry.name)?
            }
        }
    }

    let mut out = builder.into_inner()?.finish()?;
    out.flush()?;
    Ok(())
}

fn write_zip<W: Write>(entries: &[Selected], mut dest: W) -> Result<(), ArchiveError> {
    // ZipWriter needs Seek; build into a spool file and stream it out
    let mut spool = tempfile::tempfile()?;
    {
        let mut zip = ZipWriter::new(&mut spool);
        for entry in entries {
            let options = FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .unix_permissions(entry.mode);
            match entry.kind {
                EntryKind::Directory => zip.add_directory(entry.name.as_str(), options)?,
                EntryKind::Symlink => {
                    let target = fs::read_link(&entry.path)?;
                    zip.add_symlink(entry.name.as_str(), target.to_string_lossy(), options)?;
                }
                EntryKind::File => {
                    zip.start_file(entry.name.as_str(), options)?;
                    let mut file = File::open(&entry.path)?;
                    io::copy(&mut file, &mut zip)?;
                }
            }
        }
        zip.finish()?;
    }

    spool.seek(SeekFrom::Start(0))?;
    io::copy(&mut spool, &mut dest)?;
    dest.flush()?;
    Ok(())
}
