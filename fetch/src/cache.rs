//! The on-disk module cache.
//!
//! Layout under the cache root, with paths and versions escaped:
//!
//! ```text
//! <root>/<path>@<version>/                      extracted source tree
//! <root>/cache/download/<path>/@v/<version>.zip      archive
//! <root>/cache/download/<path>/@v/<version>.ziphash  archive hash
//! <root>/cache/download/<path>/@v/<version>.partial  extraction marker
//! <root>/cache/download/<path>/@v/<version>.lock     per-version lock
//! ```
//!
//! Completion is read from the file system alone: a tree is complete when
//! it exists, its marker does not and its hash file does. Every mutation
//! happens under the per-version lock, and every fetch is performed at most
//! once per process.

use crate::error::{FetchError, Result};
use crate::extraction::{self, ExtractionError, Limits};
use crate::module::{ModuleError, ModuleVersion};
use crate::once_map::OnceMap;
use crate::proxy::{self, SourceEntry, SourceError};
use crate::verify::Verifier;
use crate::{dirhash, semver};
use log::{debug, warn};
use modcache_common::{LockedFile, MarkerState, RecoverableState, renameio, robust};
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Observed state of a module version's source tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Nothing has been extracted.
    NotPresent,
    /// A tree exists but cannot be trusted and will be redone.
    Partial,
    /// The tree is fully extracted.
    Complete,
}

/// A held per-version lock, released on drop.
pub struct VersionLock {
    _guard: Box<dyn Send>,
}

impl VersionLock {
    /// Wrap any guard whose drop releases the lock.
    #[must_use]
    pub fn new(guard: impl Send + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

/// Serialises mutation of one module version across threads and processes.
#[cfg_attr(test, mockall::automock)]
pub trait VersionLocker: Send + Sync {
    /// Block until `module` is locked, using `lock_file` as the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken.
    fn acquire(&self, module: &ModuleVersion, lock_file: &Path) -> io::Result<VersionLock>;
}

/// Locks versions with advisory locks on their `.lock` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileLocker;

impl VersionLocker for FileLocker {
    fn acquire(&self, module: &ModuleVersion, lock_file: &Path) -> io::Result<VersionLock> {
        debug!("locking {module}");
        LockedFile::lock_exclusive(lock_file).map(VersionLock::new)
    }
}

/// A module cache rooted at one directory.
pub struct ModuleCache {
    root: PathBuf,
    sources: Vec<SourceEntry>,
    verifier: Arc<Verifier>,
    locker: Box<dyn VersionLocker>,
    writable: bool,
    limits: Limits,
    trees: OnceMap<ModuleVersion, Result<PathBuf>>,
    archives: OnceMap<ModuleVersion, Result<PathBuf>>,
}

impl ModuleCache {
    /// A cache under `root` that downloads from `sources` and verifies
    /// with `verifier`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, sources: Vec<SourceEntry>, verifier: Arc<Verifier>) -> Self {
        Self {
            root: root.into(),
            sources,
            verifier,
            locker: Box::new(FileLocker),
            writable: false,
            limits: Limits::default(),
            trees: OnceMap::new(),
            archives: OnceMap::new(),
        }
    }

    /// Replace the per-version lock implementation.
    #[must_use]
    pub fn with_locker(mut self, locker: Box<dyn VersionLocker>) -> Self {
        self.locker = locker;
        self
    }

    /// Leave extracted trees writable instead of marking them read-only.
    #[must_use]
    pub const fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Replace the download and extraction size limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// The cache root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The verifier archives are checked with.
    #[must_use]
    pub const fn verifier(&self) -> &Arc<Verifier> {
        &self.verifier
    }

    /// Directory holding the extracted tree of `module`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Module`] if the module cannot be a cache key.
    pub fn dir(&self, module: &ModuleVersion) -> Result<PathBuf> {
        check_version(module)?;
        let escaped = format!("{}@{}", module.escaped_path()?, module.escaped_version()?);
        Ok(self.root.join(escaped))
    }

    /// Path of the archive of `module`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Module`] if the module cannot be a cache key.
    pub fn zip_path(&self, module: &ModuleVersion) -> Result<PathBuf> {
        self.cache_file(module, "zip")
    }

    /// Path of the archive hash file of `module`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Module`] if the module cannot be a cache key.
    pub fn ziphash_path(&self, module: &ModuleVersion) -> Result<PathBuf> {
        self.cache_file(module, "ziphash")
    }

    fn cache_file(&self, module: &ModuleVersion, suffix: &str) -> Result<PathBuf> {
        check_version(module)?;
        Ok(self
            .root
            .join("cache")
            .join("download")
            .join(module.escaped_path()?)
            .join("@v")
            .join(format!("{}.{suffix}", module.escaped_version()?)))
    }

    fn tree_state(&self, module: &ModuleVersion) -> Result<RecoverableState> {
        Ok(RecoverableState::new(
            self.dir(module)?,
            self.cache_file(module, "partial")?,
        ))
    }

    /// Inspect the source tree of `module` without locking.
    ///
    /// # Errors
    ///
    /// Returns an error if the file system cannot be inspected.
    pub fn state(&self, module: &ModuleVersion) -> Result<CacheState> {
        let tree = self.tree_state(module)?;
        let observed = tree
            .state()
            .map_err(|err| FetchError::io(tree.target(), err))?;
        Ok(match observed {
            MarkerState::Absent => CacheState::NotPresent,
            MarkerState::Partial => CacheState::Partial,
            MarkerState::Complete => {
                let ziphash = self.ziphash_path(module)?;
                if tree.target().is_dir() && ziphash.is_file() {
                    CacheState::Complete
                } else {
                    CacheState::Partial
                }
            }
        })
    }

    /// Return the extracted source tree of `module`, downloading and
    /// extracting it if needed.
    ///
    /// Concurrent calls for the same version in this process share a
    /// single download.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`]; check [`FetchError::is_fatal`] before
    /// recovering from it.
    pub fn download(&self, module: &ModuleVersion) -> Result<PathBuf> {
        self.trees.get_or_init(module, || {
            let dir = self.fetch_source_tree(module)?;
            self.check_mod(module)?;
            Ok(dir)
        })
    }

    fn fetch_source_tree(&self, module: &ModuleVersion) -> Result<PathBuf> {
        let tree = self.tree_state(module)?;
        let dir = tree.target().to_path_buf();
        if self.state(module)? == CacheState::Complete {
            return Ok(dir);
        }

        let zip = self.download_zip(module)?;

        let _lock = self.lock(module)?;
        let state = self.state(module)?;
        if state == CacheState::Complete {
            return Ok(dir);
        }

        remove_stale_dirs(&dir);
        if state == CacheState::Partial {
            robust::remove_all(&dir).map_err(|err| FetchError::io(&dir, err))?;
        }

        let transition = tree.begin().map_err(|err| FetchError::io(tree.marker(), err))?;
        debug!("extracting {module} into {}", dir.display());
        if let Err(source) =
            extraction::unzip_with_limits(&dir, &module.zip_prefix(), &zip, self.limits)
        {
            if let Err(err) = transition.abort() {
                warn!("failed to remove partial tree {}: {err}", dir.display());
            }
            return Err(FetchError::Extraction {
                module: module.to_string(),
                source,
            });
        }
        transition
            .commit()
            .map_err(|err| FetchError::io(tree.marker(), err))?;

        if !self.writable {
            robust::make_dirs_read_only(&dir);
        }
        Ok(dir)
    }

    /// Return the verified archive of `module`, downloading it if needed.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`]; check [`FetchError::is_fatal`] before
    /// recovering from it.
    pub fn download_zip(&self, module: &ModuleVersion) -> Result<PathBuf> {
        self.archives
            .get_or_init(module, || self.fetch_archive(module))
    }

    fn fetch_archive(&self, module: &ModuleVersion) -> Result<PathBuf> {
        let zip = self.zip_path(module)?;
        let ziphash = self.ziphash_path(module)?;
        if zip.is_file() && ziphash.is_file() {
            return Ok(zip);
        }

        let _lock = self.lock(module)?;
        if zip.is_file() && ziphash.is_file() {
            return Ok(zip);
        }

        if let Some(parent) = zip.parent() {
            fs::create_dir_all(parent).map_err(|err| FetchError::io(parent, err))?;
        }
        renameio::remove_stale(&zip);
        renameio::remove_stale(&ziphash);

        if zip.is_file() {
            debug!("rehashing existing archive for {module}");
            self.hash_zip(module, &zip, &ziphash)?;
            return Ok(zip);
        }

        // No marker: the archive only appears by rename, and its hash file
        // only after it verified.
        let mut temp = renameio::create_temp(&zip).map_err(|err| FetchError::io(&zip, err))?;
        let limit = self.limits.max_zip_file;
        proxy::try_sources(&self.sources, |source| {
            debug!("fetching {module} from {}", source.name());
            let result = source.fetch_zip(module, temp.as_file_mut()).and_then(|()| {
                let len = temp
                    .as_file()
                    .metadata()
                    .map_err(SourceError::Unrecoverable)?
                    .len();
                if len > limit {
                    warn!("{module} from {} is {len} bytes, over {limit}", source.name());
                    return Err(SourceError::Failed {
                        source_name: source.name(),
                        reason: format!("archive exceeds {limit} bytes"),
                    });
                }
                Ok(())
            });
            if result.is_err() {
                truncate(temp.as_file_mut()).map_err(SourceError::Unrecoverable)?;
            }
            result
        })
        .map_err(|source| FetchError::Source {
            module: module.to_string(),
            source,
        })?;

        check_prefix(module, temp.path())?;
        temp.as_file()
            .sync_all()
            .map_err(|err| FetchError::io(temp.path(), err))?;
        self.hash_zip(module, temp.path(), &ziphash)?;
        temp.persist(&zip)
            .map_err(|err| FetchError::io(&zip, err.error))?;
        debug!("downloaded {module} to {}", zip.display());
        Ok(zip)
    }

    /// Hash an archive, verify the hash, then record it in the side file.
    fn hash_zip(&self, module: &ModuleVersion, zip: &Path, ziphash: &Path) -> Result<()> {
        let hash = dirhash::hash_zip(zip).map_err(|source| FetchError::Hash {
            module: module.to_string(),
            source,
        })?;
        self.verifier.check_mod_sum(module, &hash)?;
        renameio::write_file(ziphash, hash.as_bytes()).map_err(|err| FetchError::io(ziphash, err))
    }

    /// The recorded archive hash of `module`, if it has been downloaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the side file exists but cannot be read.
    pub fn sum(&self, module: &ModuleVersion) -> Result<Option<String>> {
        let ziphash = self.ziphash_path(module)?;
        let data = match renameio::read_file(&ziphash) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(FetchError::io(&ziphash, err)),
        };
        let hash = String::from_utf8_lossy(&data).trim().to_owned();
        Ok(hash.starts_with(dirhash::H1_PREFIX).then_some(hash))
    }

    /// Verify the recorded archive hash of `module` against the ledger and
    /// database. A module that was never downloaded passes.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::UnexpectedZipHash`] for an unrecognised side
    /// file and [`FetchError::Verify`] when verification fails.
    pub fn check_mod(&self, module: &ModuleVersion) -> Result<()> {
        let ziphash = self.ziphash_path(module)?;
        let data = match renameio::read_file(&ziphash) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(FetchError::io(&ziphash, err)),
        };
        let hash = String::from_utf8_lossy(&data).trim().to_owned();
        if !hash.starts_with(dirhash::H1_PREFIX) {
            return Err(FetchError::UnexpectedZipHash {
                module: module.to_string(),
                hash,
            });
        }
        self.verifier.check_mod_sum(module, &hash)?;
        Ok(())
    }

    /// Check that the cached archive and tree of `module` still match the
    /// hash recorded when it was downloaded.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Modified`] naming what changed, or
    /// [`FetchError::MissingZipHash`] if the module was never downloaded.
    pub fn verify_tree(&self, module: &ModuleVersion) -> Result<()> {
        let Some(recorded) = self.sum(module)? else {
            return Err(FetchError::MissingZipHash {
                module: module.to_string(),
            });
        };
        let hash_error = |source| FetchError::Hash {
            module: module.to_string(),
            source,
        };

        let zip = self.zip_path(module)?;
        if zip.is_file() && dirhash::hash_zip(&zip).map_err(hash_error)? != recorded {
            return Err(modified(module, "zip", &zip));
        }
        let dir = self.dir(module)?;
        if dir.is_dir()
            && dirhash::hash_dir(&dir, &module.zip_prefix()).map_err(hash_error)? != recorded
        {
            return Err(modified(module, "dir", &dir));
        }
        Ok(())
    }

    /// Remove the whole cache, including read-only trees.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache root cannot be deleted.
    pub fn clean(&self) -> Result<()> {
        purge(&self.root)?;
        self.trees.clear();
        self.archives.clear();
        Ok(())
    }

    fn lock(&self, module: &ModuleVersion) -> Result<VersionLock> {
        let lock_file = self.cache_file(module, "lock")?;
        self.locker
            .acquire(module, &lock_file)
            .map_err(|err| FetchError::io(&lock_file, err))
    }
}

/// Delete `dir` recursively, first restoring write permission on every
/// directory beneath it.
///
/// # Errors
///
/// Returns [`FetchError::Io`] if the tree cannot be deleted. Failures to
/// restore permissions are only logged.
pub fn purge(dir: &Path) -> Result<()> {
    robust::remove_all(dir).map_err(|err| FetchError::io(dir, err))
}

/// Clear write permission on every directory under `dir`, children first.
/// Failures are logged and otherwise ignored.
pub fn make_dirs_read_only(dir: &Path) {
    robust::make_dirs_read_only(dir);
}

fn check_version(module: &ModuleVersion) -> Result<()> {
    if module.is_go_mod() || !semver::is_valid(module.version()) {
        return Err(ModuleError::InvalidVersion {
            version: module.version().to_owned(),
            reason: "not a semantic version",
        }
        .into());
    }
    Ok(())
}

/// Remove directories left behind by extractions that crashed before
/// renaming into place.
fn remove_stale_dirs(dir: &Path) {
    let entries = match glob::glob(&renameio::pattern(dir)) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("invalid temp-dir pattern for {}: {err}", dir.display());
            return;
        }
    };
    for stale in entries.flatten() {
        if let Err(err) = robust::remove_all(&stale) {
            warn!("failed to remove stale directory {}: {err}", stale.display());
        }
    }
}

/// Discard whatever a failed source wrote.
fn truncate(file: &mut File) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)
}

/// Reject archives holding entries outside `path@version/`.
fn check_prefix(module: &ModuleVersion, zip: &Path) -> Result<()> {
    let extraction_error = |reason: String| FetchError::Extraction {
        module: module.to_string(),
        source: ExtractionError::Malformed {
            path: zip.display().to_string(),
            reason,
        },
    };
    let file = File::open(zip).map_err(|err| FetchError::io(zip, err))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|err| extraction_error(err.to_string()))?;
    let prefix = module.zip_prefix();
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|err| extraction_error(err.to_string()))?;
        if !entry.name().starts_with(&prefix) {
            return Err(FetchError::UnexpectedFile {
                module: module.to_string(),
                file: entry.name().to_owned(),
            });
        }
    }
    Ok(())
}

fn modified(module: &ModuleVersion, what: &'static str, path: &Path) -> FetchError {
    FetchError::Modified {
        module: module.to_string(),
        what,
        path: path.display().to_string(),
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
