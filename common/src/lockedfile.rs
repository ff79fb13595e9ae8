//! Advisory file locks shared between processes.
//!
//! Locks are taken with `fs2`, which maps to `flock` on Unix and
//! `LockFileEx` on Windows. The operating system releases them when the
//! holding process exits, so a crashed holder never wedges the cache.

use fs2::FileExt;
use log::{trace, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// An exclusively locked file, unlocked on drop.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

impl LockedFile {
    /// Open (creating if needed) `path` and block until an exclusive lock is
    /// held. Parent directories are created as required.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or locked.
    pub fn lock_exclusive(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        trace!("waiting for lock on {}", path.display());
        FileExt::lock_exclusive(&file)?;
        trace!("locked {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        unlock(&self.file, &self.path);
    }
}

/// Release the lock on `file`. A failed unlock is logged; closing the file
/// releases the lock in any case.
fn unlock(file: &File, path: &Path) {
    match FileExt::unlock(file) {
        Ok(()) => trace!("unlocked {}", path.display()),
        Err(err) => warn!("unlocking {}: {err}", path.display()),
    }
}

/// Read the whole file at `path` under a shared lock.
///
/// # Errors
///
/// Returns `NotFound` when the file does not exist, or any other error from
/// opening, locking, or reading it.
pub fn read(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    FileExt::lock_shared(&file)?;
    let mut data = Vec::new();
    let result = file.read_to_end(&mut data);
    unlock(&file, path);
    result.map(|_| data)
}

/// Rewrite the file at `path` under an exclusive lock.
///
/// `transform` receives the current contents (empty if the file did not
/// exist) and returns the replacement. The file is left untouched when the
/// replacement is byte-identical or when `transform` fails.
///
/// # Errors
///
/// Returns the error produced by `transform`, or an I/O error from opening,
/// locking, or rewriting the file.
pub fn transform<F, E>(path: &Path, transform: F) -> Result<(), E>
where
    F: FnOnce(&[u8]) -> Result<Vec<u8>, E>,
    E: From<io::Error>,
{
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    FileExt::lock_exclusive(&file)?;
    let result = rewrite(&mut file, transform);
    unlock(&file, path);
    result
}

fn rewrite<F, E>(file: &mut File, transform: F) -> Result<(), E>
where
    F: FnOnce(&[u8]) -> Result<Vec<u8>, E>,
    E: From<io::Error>,
{
    let mut old = Vec::new();
    file.read_to_end(&mut old)?;
    let new = transform(&old)?;
    if new == old {
        return Ok(());
    }
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&new)?;
    file.set_len(u64::try_from(new.len()).unwrap_or(u64::MAX))?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn transform_creates_missing_file() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("ledger");

        transform(&path, |old| {
            assert!(old.is_empty());
            Ok::<_, io::Error>(b"a v1 h1:x\n".to_vec())
        })
        .expect("transform");

        assert_eq!(read(&path).expect("read"), b"a v1 h1:x\n");
    }

    #[test]
    fn transform_shrinks_file() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("ledger");
        fs::write(&path, b"a long line of content\n").expect("seed");

        transform(&path, |_| Ok::<_, io::Error>(b"short\n".to_vec())).expect("transform");

        assert_eq!(fs::read(&path).expect("read"), b"short\n");
    }

    #[test]
    fn failed_transform_leaves_contents() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("ledger");
        fs::write(&path, b"keep\n").expect("seed");

        let result = transform(&path, |_| Err::<Vec<u8>, _>(io::Error::other("refused")));

        assert!(result.is_err());
        assert_eq!(fs::read(&path).expect("read"), b"keep\n");
    }

    #[test]
    fn read_missing_file_is_not_found() {
        let temp = tempfile::tempdir().expect("temp dir");
        let err = read(&temp.path().join("absent")).expect_err("missing file");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn exclusive_lock_serialises_holders() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("nested").join("v1.0.0.lock");
        let first = LockedFile::lock_exclusive(&path).expect("first lock");

        let (tx, rx) = mpsc::channel();
        let contender_path = path.clone();
        let handle = thread::spawn(move || {
            let _second = LockedFile::lock_exclusive(&contender_path).expect("second lock");
            tx.send(()).expect("signal acquisition");
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(first);
        rx.recv_timeout(Duration::from_secs(5))
            .expect("second holder acquires after release");
        handle.join().expect("join contender");
    }

    #[test]
    fn read_and_transform_release_their_locks() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("ledger");

        transform(&path, |_| Ok::<_, io::Error>(b"x\n".to_vec())).expect("transform");
        let other = File::open(&path).expect("open");
        FileExt::try_lock_exclusive(&other).expect("free after transform");
        FileExt::unlock(&other).expect("unlock");

        read(&path).expect("read");
        FileExt::try_lock_exclusive(&other).expect("free after read");
    }
}
