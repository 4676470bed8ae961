//! Local tree snapshots.
//!
//! The mirrored directory is flattened into the same key space as the remote
//! object: every regular file under the root becomes one entry whose key is
//! its `/`-separated path relative to the root. Directories are transparent.
//!
//! ```text
//! <root>/
//!   tls.crt            -> "tls.crt"
//!   nginx/
//!     site.conf        -> "nginx/site.conf"
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::error::{io_err, TreeError};
use crate::types::Entries;

/// Suffix of the scratch file written next to a target before it is renamed
/// into place. Leftovers from an interrupted write are never mirrored.
pub const TMP_SUFFIX: &str = ".kubersync.tmp";

/// Every regular file under `root`, recursively, as absolute paths (sorted).
///
/// Symbolic links are followed when they resolve to a regular file; dangling
/// links and links to directories are skipped. A subdirectory that vanishes
/// mid-walk is skipped, but a missing `root` is an error.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>, TreeError> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    let mut cursor = 0;
    while cursor < dirs.len() {
        let current = dirs[cursor].clone();
        cursor += 1;
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound && cursor > 1 => continue,
            Err(err) => return Err(io_err(&current, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let path = entry.path();
            let ty = entry.file_type().map_err(|e| io_err(&path, e))?;
            if ty.is_dir() {
                dirs.push(path);
            } else if is_scratch(&path) {
                continue;
            } else if ty.is_file() || (ty.is_symlink() && resolves_to_file(&path)) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn is_scratch(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(TMP_SUFFIX))
}

fn resolves_to_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// Read every file under `root` into a fresh key → bytes mapping.
///
/// Any read failure aborts the snapshot.
pub fn snapshot(root: &Path) -> Result<Entries, TreeError> {
    let mut entries = Entries::new();
    for path in list_files(root)? {
        let key = key_for(root, &path)?;
        let bytes = fs::read(&path).map_err(|e| io_err(&path, e))?;
        entries.insert(key, bytes);
    }
    Ok(entries)
}

/// Entry key for a file located under `root`.
pub fn key_for(root: &Path, path: &Path) -> Result<String, TreeError> {
    let relative = path.strip_prefix(root).map_err(|_| TreeError::OutsideRoot {
        path: path.to_path_buf(),
    })?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => {
                    return Err(TreeError::NonUtf8Path {
                        path: path.to_path_buf(),
                    })
                }
            },
            _ => {
                return Err(TreeError::OutsideRoot {
                    path: path.to_path_buf(),
                })
            }
        }
    }
    Ok(parts.join("/"))
}

/// Local path for an entry key, rejecting keys that would escape `root`.
pub fn path_for_key(root: &Path, key: &str) -> Result<PathBuf, TreeError> {
    let invalid = |reason| TreeError::InvalidKey {
        key: key.to_string(),
        reason,
    };
    if key.is_empty() {
        return Err(invalid("key is empty"));
    }
    if key.ends_with(TMP_SUFFIX) {
        return Err(invalid("key uses the reserved scratch-file suffix"));
    }
    let relative = Path::new(key);
    if relative.is_absolute() {
        return Err(invalid("key is an absolute path"));
    }
    let mut path = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir | Component::ParentDir => {
                return Err(invalid("key contains '.' or '..' components"))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("key is an absolute path"))
            }
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn list_files_skips_directories_and_sorts() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("nested").join("deeper")).unwrap();
        fs::create_dir_all(tmp.path().join("empty")).unwrap();
        fs::write(tmp.path().join("b"), "2").unwrap();
        fs::write(tmp.path().join("nested").join("deeper").join("a"), "1").unwrap();

        let files = list_files(tmp.path()).unwrap();
        assert_eq!(
            files,
            vec![
                tmp.path().join("b"),
                tmp.path().join("nested").join("deeper").join("a"),
            ]
        );
    }

    #[test]
    fn list_files_missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = list_files(&tmp.path().join("absent")).unwrap_err();
        assert!(matches!(err, TreeError::Io { .. }), "got: {err}");
    }

    #[test]
    fn snapshot_uses_slash_separated_relative_keys() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("nginx")).unwrap();
        fs::write(tmp.path().join("tls.crt"), b"cert").unwrap();
        fs::write(tmp.path().join("nginx").join("site.conf"), b"server {}").unwrap();

        let entries = snapshot(tmp.path()).unwrap();
        let keys: Vec<_> = entries.keys().cloned().collect();
        assert_eq!(keys, vec!["nginx/site.conf", "tls.crt"]);
        assert_eq!(entries["tls.crt"], b"cert");
    }

    #[test]
    fn snapshot_of_empty_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(snapshot(tmp.path()).unwrap().is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn symlinks_to_files_are_read_through_and_dangling_links_skipped() {
        use std::os::unix::fs::symlink;

        let tmp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("real"), b"linked").unwrap();
        symlink(outside.path().join("real"), tmp.path().join("link")).unwrap();
        symlink(outside.path().join("gone"), tmp.path().join("dangling")).unwrap();

        let entries = snapshot(tmp.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["link"], b"linked");
    }

    #[test]
    fn leftover_scratch_files_are_not_listed() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("token"), b"t").unwrap();
        fs::write(tmp.path().join(format!("token{TMP_SUFFIX}")), b"half").unwrap();

        let entries = snapshot(tmp.path()).unwrap();
        assert_eq!(entries.keys().collect::<Vec<_>>(), vec!["token"]);
    }

    #[test]
    fn path_for_key_joins_nested_keys_under_root() {
        let root = Path::new("/srv/mirror");
        let path = path_for_key(root, "nginx/site.conf").unwrap();
        assert_eq!(path, root.join("nginx").join("site.conf"));
    }

    #[test]
    fn key_round_trips_through_path() {
        let root = Path::new("/srv/mirror");
        let path = path_for_key(root, "a/b/c.txt").unwrap();
        assert_eq!(key_for(root, &path).unwrap(), "a/b/c.txt");
    }
}
