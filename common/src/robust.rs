//! Permission handling and removal for read-only cache trees.
//!
//! Extracted module trees are made read-only to discourage accidental edits.
//! Removing such a tree needs write permission restored on every directory
//! first; that restoration is best effort and only logged, while failure of
//! the removal itself is reported to the caller.

use log::warn;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Remove `dir` and everything beneath it, restoring write permission on
/// its directories first. A missing `dir` is not an error.
///
/// # Errors
///
/// Returns the error from the recursive delete.
pub fn remove_all(dir: &Path) -> io::Result<()> {
    for sub in directories_innermost_first(dir) {
        if let Err(err) = set_writable(&sub, true) {
            warn!(
                "could not restore write permission on {}: {err}",
                sub.display()
            );
        }
    }
    match fs::remove_dir_all(dir) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Best-effort removal of write permission from `dir` and every directory
/// below it, children before parents.
pub fn make_dirs_read_only(dir: &Path) {
    for sub in directories_innermost_first(dir) {
        if let Err(err) = set_writable(&sub, false) {
            warn!("could not make {} read-only: {err}", sub.display());
        }
    }
}

/// Collect `dir` and its descendant directories in post-order, so every
/// child precedes its parent. Unreadable subtrees are logged and skipped.
fn directories_innermost_first(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    match fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => collect(dir, &mut out),
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("cannot inspect {}: {err}", dir.display()),
    }
    out
}

fn collect(dir: &Path, out: &mut Vec<PathBuf>) {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut children: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
                .map(|entry| entry.path())
                .collect();
            children.sort();
            for child in children {
                collect(&child, out);
            }
        }
        Err(err) => warn!("cannot list {}: {err}", dir.display()),
    }
    out.push(dir.to_path_buf());
}

#[cfg(unix)]
fn set_writable(path: &Path, writable: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    let mode = perms.mode();
    let wanted = if writable { mode | 0o700 } else { mode & !0o222 };
    if wanted != mode {
        perms.set_mode(wanted);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_writable(path: &Path, writable: bool) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    if perms.readonly() == writable {
        perms.set_readonly(!writable);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("a").join("b")).expect("create dirs");
        fs::write(root.join("a").join("b").join("file.go"), b"package b").expect("write file");
        fs::write(root.join("top.go"), b"package top").expect("write file");
    }

    #[test]
    fn innermost_directories_come_first() {
        let temp = tempfile::tempdir().expect("temp dir");
        let root = temp.path().join("mod@v1.0.0");
        build_tree(&root);

        let order = directories_innermost_first(&root);

        assert_eq!(
            order,
            vec![root.join("a").join("b"), root.join("a"), root.clone()]
        );
    }

    #[test]
    fn remove_all_handles_read_only_tree() {
        let temp = tempfile::tempdir().expect("temp dir");
        let root = temp.path().join("mod@v1.0.0");
        build_tree(&root);
        make_dirs_read_only(&root);

        remove_all(&root).expect("remove read-only tree");

        assert!(!root.exists());
    }

    #[test]
    fn remove_all_of_missing_directory_succeeds() {
        let temp = tempfile::tempdir().expect("temp dir");
        remove_all(&temp.path().join("absent")).expect("missing dir is fine");
    }

    #[cfg(unix)]
    #[test]
    fn make_dirs_read_only_clears_write_bits() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("temp dir");
        let root = temp.path().join("mod@v1.0.0");
        build_tree(&root);

        make_dirs_read_only(&root);

        for dir in [root.clone(), root.join("a"), root.join("a").join("b")] {
            let mode = fs::metadata(&dir).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o222, 0, "{} still writable", dir.display());
        }
        remove_all(&root).expect("cleanup");
    }
}
