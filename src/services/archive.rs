//! src/services/archive.rs
//!
//! Zip extraction into archive directories and on-demand re-compression of
//! an archive directory for download.
//!
//! Extraction works on a fully buffered archive. A failing entry aborts the
//! whole extraction and whatever was already written stays on disk; callers
//! that want all-or-nothing must remove `dest` themselves.

use crate::services::namespace::to_fs_path;
use std::{
    collections::HashSet,
    fs,
    io::{self, Cursor},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error};
use walkdir::WalkDir;
use zip::{CompressionMethod, ZipArchive, ZipWriter, result::ZipError, write::SimpleFileOptions};

/// Top-level folder macOS adds to zips it creates.
const MACOS_METADATA_DIR: &str = "__MACOSX";
/// Finder bookkeeping file.
const MACOS_DS_STORE: &str = ".DS_Store";
/// Windows thumbnail cache.
const WINDOWS_THUMBS_DB: &str = "Thumbs.db";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("invalid zip archive: {0}")]
    Zip(#[from] ZipError),
    #[error("archive i/o failed at `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to walk `{}`: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

impl ArchiveError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// True for OS-generated bookkeeping entries that should never be extracted.
pub fn is_junk_entry(name: &str) -> bool {
    let mut segments = name.split('/').filter(|s| !s.is_empty());
    let Some(first) = segments.clone().next() else {
        return false;
    };
    if first == MACOS_METADATA_DIR {
        return true;
    }
    matches!(
        segments.next_back(),
        Some(MACOS_DS_STORE) | Some(WINDOWS_THUMBS_DB)
    )
}

/// The single first path segment shared by every entry, if there is one.
///
/// Every entry must sit below that segment (a bare top-level file disables
/// stripping) and all entries must agree on it.
pub fn common_root<'a, I>(names: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut root: Option<&str> = None;
    for name in names {
        let (first, _) = name.split_once('/')?;
        match root {
            None => root = Some(first),
            Some(existing) if existing == first => {}
            Some(_) => return None,
        }
    }
    root.filter(|r| !r.is_empty()).map(str::to_owned)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveManager;

impl ArchiveManager {
    pub fn new() -> Self {
        Self
    }

    /// Extract `archive` into `dest`, flattening a single wrapping folder and
    /// skipping OS junk. Returns the number of files written.
    pub fn extract(&self, archive: &[u8], dest: &Path) -> Result<usize, ArchiveError> {
        let mut zip = ZipArchive::new(Cursor::new(archive)).inspect_err(|err| {
            error!(%err, "Fail to open zip archive");
        })?;

        let names: Vec<String> = zip
            .file_names()
            .filter(|name| !is_junk_entry(name))
            .map(str::to_owned)
            .collect();
        let kept: HashSet<&str> = names.iter().map(String::as_str).collect();
        let strip = common_root(names.iter().map(String::as_str)).map(|root| format!("{root}/"));
        if let Some(prefix) = &strip {
            debug!(prefix = %prefix, "stripping common archive root");
        }

        fs::create_dir_all(dest).map_err(|e| ArchiveError::io(dest, e))?;

        let mut written = 0;
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index)?;
            let name = entry.name().to_owned();
            if !kept.contains(name.as_str()) {
                continue;
            }

            let relative = match &strip {
                Some(prefix) => name.strip_prefix(prefix.as_str()).unwrap_or(&name),
                None => &name,
            };
            let relative = to_fs_path(relative);
            if relative.as_os_str().is_empty() {
                continue;
            }
            let target = dest.join(relative);

            if entry.is_dir() {
                create_dir_with_mode(&target, entry.unix_mode()).map_err(|e| {
                    error!(path = %target.display(), err = %e, "Fail to create dirs");
                    ArchiveError::io(&target, e)
                })?;
                continue;
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    error!(path = %parent.display(), err = %e, "Fail to create dirs for file");
                    ArchiveError::io(parent, e)
                })?;
            }
            let mut out = fs::File::create(&target).map_err(|e| ArchiveError::io(&target, e))?;
            io::copy(&mut entry, &mut out).map_err(|e| {
                error!(path = %target.display(), err = %e, "Fail to copy data");
                ArchiveError::io(&target, e)
            })?;
            written += 1;
        }

        Ok(written)
    }

    /// Zip every regular file below `dir` with paths relative to it.
    pub fn compress_dir(&self, dir: &Path) -> Result<Vec<u8>, ArchiveError> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|source| ArchiveError::Walk {
                path: dir.to_path_buf(),
                source,
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let Ok(relative) = path.strip_prefix(dir) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            writer.start_file(name, options)?;
            let mut src = fs::File::open(path).map_err(|e| ArchiveError::io(path, e))?;
            io::copy(&mut src, &mut writer).map_err(|e| ArchiveError::io(path, e))?;
        }

        Ok(writer.finish()?.into_inner())
    }
}

#[cfg(unix)]
fn create_dir_with_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    // Owner keeps full access so later entries can still be written inside.
    let mode = mode.map_or(0o755, |m| (m & 0o777) | 0o700);
    fs::DirBuilder::new().recursive(true).mode(mode).create(path)
}

#[cfg(not(unix))]
fn create_dir_with_mode(path: &Path, _mode: Option<u32>) -> io::Result<()> {
    fs::create_dir_all(path)
}
