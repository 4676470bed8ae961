//! Byte-exact write suppression and atomic file replacement.
//!
//! ## `write_if_changed` protocol
//!
//! 1. Read the bytes currently on disk (a missing file never matches).
//! 2. Compare byte-for-byte with the desired content → skip if identical.
//! 3. Create parent directories.
//! 4. Write to `<path>.kubersync.tmp`.
//! 5. Rename to final path (atomic on POSIX).

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use kubersync_core::error::io_err;
use kubersync_core::{tree, TreeError};

/// Outcome of an individual file write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// File was written (content changed or did not previously exist).
    Written { path: PathBuf },
    /// File was skipped; on-disk bytes already match.
    Unchanged { path: PathBuf },
}

/// Write `content` to `path` unless the file already holds exactly those bytes.
///
/// A symlink that resolves to a regular file is written through: the link
/// stays in place and its target receives the new bytes.
pub fn write_if_changed(path: &Path, content: &[u8]) -> Result<WriteResult, TreeError> {
    let dest = link_target(path).unwrap_or_else(|| path.to_path_buf());
    let tmp = PathBuf::from(format!("{}{}", dest.display(), tree::TMP_SUFFIX));
    write_if_changed_with_tmp(&dest, content, &tmp)
}

/// Resolved file behind `path` when `path` itself is a symlink.
fn link_target(path: &Path) -> Option<PathBuf> {
    let meta = fs::symlink_metadata(path).ok()?;
    if !meta.file_type().is_symlink() {
        return None;
    }
    let target = fs::canonicalize(path).ok()?;
    target.is_file().then_some(target)
}

fn write_if_changed_with_tmp(
    path: &Path,
    content: &[u8],
    tmp: &Path,
) -> Result<WriteResult, TreeError> {
    match fs::read(path) {
        Ok(current) if current == content => {
            tracing::debug!("unchanged: {}", path.display());
            return Ok(WriteResult::Unchanged {
                path: path.to_path_buf(),
            });
        }
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(io_err(path, err)),
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    fs::write(tmp, content).map_err(|e| io_err(tmp, e))?;

    if let Err(e) = fs::rename(tmp, path) {
        let _ = fs::remove_file(tmp);
        return Err(io_err(path, e));
    }

    tracing::info!("write {}", path.display());
    Ok(WriteResult::Written {
        path: path.to_path_buf(),
    })
}

/// Remove a mirrored file. A file that is already gone counts as removed.
pub fn remove_file(path: &Path) -> Result<(), TreeError> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::info!("delete {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            tracing::debug!("already gone: {}", path.display());
            Ok(())
        }
        Err(err) => Err(io_err(path, err)),
    }
}
