//! Atomic file replacement.
//!
//! Writes go to a uniquely named temporary file in the destination's own
//! directory and are renamed over the destination once flushed to disk, so a
//! reader observes either the previous contents or the new contents, never a
//! prefix. Temporary names follow `<name>.tmp-<random>` so that crashed
//! writers can be cleaned up later with [`remove_stale`].

use log::{debug, warn};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Infix placed between the destination file name and the random suffix.
const TEMP_INFIX: &str = ".tmp-";

/// Return the glob pattern matching temporary files created for `path`.
///
/// Glob metacharacters in `path` itself are escaped, so the only wildcard in
/// the result is the random suffix.
///
/// # Examples
///
/// ```
/// use modcache_common::renameio::pattern;
/// use std::path::Path;
///
/// assert_eq!(pattern(Path::new("/cache/v1.0.0.zip")), "/cache/v1.0.0.zip.tmp-*");
/// ```
#[must_use]
pub fn pattern(path: &Path) -> String {
    format!(
        "{}{TEMP_INFIX}*",
        glob::Pattern::escape(&path.to_string_lossy())
    )
}

/// Create an empty temporary file next to `path`.
///
/// The file lives in the same directory as `path` so that persisting it is a
/// same-file-system rename.
///
/// # Errors
///
/// Returns an error if the destination has no file name or the temporary
/// file cannot be created.
pub fn create_temp(path: &Path) -> io::Result<NamedTempFile> {
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::other(format!("{} has no file name", path.display())))?;
    let dir = parent_or_current(path);
    tempfile::Builder::new()
        .prefix(&format!("{}{TEMP_INFIX}", name.to_string_lossy()))
        .tempfile_in(dir)
}

/// Atomically replace `path` with `data`.
///
/// # Errors
///
/// Returns an error if the temporary file cannot be written, synced, or
/// renamed into place.
pub fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = create_temp(path)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Read a file previously written with [`write_file`].
///
/// # Errors
///
/// Propagates the underlying read error, including `NotFound`.
pub fn read_file(path: &Path) -> io::Result<Vec<u8>> {
    fs::read(path)
}

/// Remove temporary files left behind for `path` by crashed writers.
///
/// Only safe while the caller holds a lock that excludes every other writer
/// of `path`. Failures are logged and otherwise ignored.
pub fn remove_stale(path: &Path) {
    let entries = match glob::glob(&pattern(path)) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("invalid temp-file pattern for {}: {err}", path.display());
            return;
        }
    };
    for entry in entries {
        let stale: PathBuf = match entry {
            Ok(stale) => stale,
            Err(err) => {
                warn!("skipping unreadable temp-file candidate: {err}");
                continue;
            }
        };
        match fs::remove_file(&stale) {
            Ok(()) => debug!("removed stale temp file {}", stale.display()),
            Err(err) => warn!("failed to remove stale temp file {}: {err}", stale.display()),
        }
    }
}

fn parent_or_current(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_file_replaces_existing_contents() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("v1.0.0.ziphash");
        fs::write(&path, b"old").expect("seed file");

        write_file(&path, b"h1:new").expect("atomic write");

        assert_eq!(fs::read(&path).expect("read back"), b"h1:new");
    }

    #[test]
    fn write_file_leaves_no_temp_files() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("sum");

        write_file(&path, b"data").expect("atomic write");

        let names: Vec<_> = fs::read_dir(temp.path())
            .expect("list dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("sum")]);
    }

    #[test]
    fn create_temp_names_match_pattern() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("v1.2.3.zip");
        let tmp = create_temp(&path).expect("create temp");

        let glob = glob::Pattern::new(&pattern(&path)).expect("valid pattern");
        assert!(glob.matches_path(tmp.path()), "{}", tmp.path().display());
    }

    #[test]
    fn remove_stale_deletes_only_matching_files() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("v1.2.3.zip");
        let stale = temp.path().join("v1.2.3.zip.tmp-123456");
        let unrelated = temp.path().join("v1.2.4.zip.tmp-123456");
        fs::write(&stale, b"partial").expect("write stale");
        fs::write(&unrelated, b"other").expect("write unrelated");

        remove_stale(&path);

        assert!(!stale.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn pattern_escapes_metacharacters() {
        let escaped = pattern(Path::new("/cache/[weird]/v1.zip"));
        assert_eq!(escaped, "/cache/[[]weird[]]/v1.zip.tmp-*");
    }
}
