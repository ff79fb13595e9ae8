//! Unpacking of module archives into the cache.
//!
//! Every entry must live under the `path@version/` prefix of the module it
//! belongs to. Entries are validated before anything is written, so a
//! malicious archive fails without leaving files behind.

use log::debug;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Component, Path};
use thiserror::Error;

/// Size limits applied while unpacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest archive accepted, both on disk and uncompressed.
    pub max_zip_file: u64,
    /// Largest manifest accepted at the root of the archive.
    pub max_go_mod: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_zip_file: 500 << 20,
            max_go_mod: 16 << 20,
        }
    }
}

/// Errors arising from archive extraction.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The destination already holds files.
    #[error("target directory {dir} exists and is not empty")]
    DestinationNotEmpty {
        /// The destination directory.
        dir: String,
    },

    /// The archive cannot be read as a zip file.
    #[error("reading {path}: {reason}")]
    Malformed {
        /// The archive path.
        path: String,
        /// Description of the decoding failure.
        reason: String,
    },

    /// An entry lies outside the module prefix.
    #[error("unexpected file name {file}")]
    UnexpectedFile {
        /// The offending entry name.
        file: String,
    },

    /// A path in the archive attempts to traverse outside the destination.
    #[error("path traversal detected: {path}")]
    PathTraversal {
        /// The offending path from the archive entry.
        path: String,
    },

    /// Two entries differ only in letter case.
    #[error("case-insensitive file name collision: {first:?} and {second:?}")]
    CaseCollision {
        /// The entry seen first.
        first: String,
        /// The entry that collides with it.
        second: String,
    },

    /// The archive or one of its parts exceeds a size limit.
    #[error("{what} too large (max size is {limit} bytes)")]
    TooLarge {
        /// What was measured.
        what: String,
        /// The limit that was exceeded.
        limit: u64,
    },

    /// An entry held more data than its header declared.
    #[error("uncompressed size of file {file} is larger than declared size ({declared} bytes)")]
    SizeMismatch {
        /// The offending entry name.
        file: String,
        /// The size recorded in the archive directory.
        declared: u64,
    },

    /// I/O error during extraction.
    #[error("extraction I/O error at {path}")]
    Io {
        /// The file being read or written.
        path: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

impl Clone for ExtractionError {
    fn clone(&self) -> Self {
        match self {
            Self::DestinationNotEmpty { dir } => Self::DestinationNotEmpty { dir: dir.clone() },
            Self::Malformed { path, reason } => Self::Malformed {
                path: path.clone(),
                reason: reason.clone(),
            },
            Self::UnexpectedFile { file } => Self::UnexpectedFile { file: file.clone() },
            Self::PathTraversal { path } => Self::PathTraversal { path: path.clone() },
            Self::CaseCollision { first, second } => Self::CaseCollision {
                first: first.clone(),
                second: second.clone(),
            },
            Self::TooLarge { what, limit } => Self::TooLarge {
                what: what.clone(),
                limit: *limit,
            },
            Self::SizeMismatch { file, declared } => Self::SizeMismatch {
                file: file.clone(),
                declared: *declared,
            },
            Self::Io { path, source } => Self::Io {
                path: path.clone(),
                source: io::Error::new(source.kind(), source.to_string()),
            },
        }
    }
}

/// A file entry that passed validation.
struct Planned {
    index: usize,
    name: String,
    relative: String,
    size: u64,
}

/// Unpack `zip_path` into `dir`, stripping `prefix` from every entry.
///
/// # Errors
///
/// See [`unzip_with_limits`].
pub fn unzip(dir: &Path, prefix: &str, zip_path: &Path) -> Result<(), ExtractionError> {
    unzip_with_limits(dir, prefix, zip_path, Limits::default())
}

/// Unpack `zip_path` into `dir` under explicit size limits.
///
/// `dir` must be absent or empty. Files are created read-only and never
/// overwrite existing ones. Directory entries are skipped; directories are
/// created as needed for the files beneath them.
///
/// # Errors
///
/// Returns an [`ExtractionError`] describing the first violated rule. The
/// destination may hold some extracted files on I/O failures; the caller
/// is expected to remove it.
pub fn unzip_with_limits(
    dir: &Path,
    prefix: &str,
    zip_path: &Path,
    limits: Limits,
) -> Result<(), ExtractionError> {
    ensure_empty(dir)?;

    let file = File::open(zip_path).map_err(|source| io_error(zip_path, source))?;
    let archive_size = file
        .metadata()
        .map_err(|source| io_error(zip_path, source))?
        .len();
    if archive_size > limits.max_zip_file {
        return Err(ExtractionError::TooLarge {
            what: format!("module source tree {}", zip_path.display()),
            limit: limits.max_zip_file,
        });
    }
    let mut archive = zip::ZipArchive::new(file).map_err(|err| ExtractionError::Malformed {
        path: zip_path.display().to_string(),
        reason: err.to_string(),
    })?;

    let planned = plan_entries(&mut archive, zip_path, prefix, limits)?;

    fs::create_dir_all(dir).map_err(|source| io_error(dir, source))?;
    for entry in &planned {
        extract_entry(&mut archive, zip_path, dir, entry)?;
    }
    debug!("unzipped {} files into {}", planned.len(), dir.display());
    Ok(())
}

fn ensure_empty(dir: &Path) -> Result<(), ExtractionError> {
    match fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(ExtractionError::DestinationNotEmpty {
                    dir: dir.display().to_string(),
                });
            }
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(io_error(dir, source)),
    }
}

fn plan_entries(
    archive: &mut zip::ZipArchive<File>,
    zip_path: &Path,
    prefix: &str,
    limits: Limits,
) -> Result<Vec<Planned>, ExtractionError> {
    let mut planned = Vec::new();
    let mut folded: HashMap<String, String> = HashMap::new();
    let mut total: u64 = 0;

    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|err| ExtractionError::Malformed {
                path: zip_path.display().to_string(),
                reason: err.to_string(),
            })?;
        let name = entry.name().to_owned();
        let size = entry.size();
        drop(entry);

        let Some(relative) = name.strip_prefix(prefix) else {
            return Err(ExtractionError::UnexpectedFile { file: name });
        };
        if relative.is_empty() || relative.ends_with('/') {
            continue;
        }
        validate_entry_path(relative)?;
        if let Some(first) = folded.insert(relative.to_lowercase(), name.clone()) {
            return Err(ExtractionError::CaseCollision {
                first,
                second: name,
            });
        }
        total = total.saturating_add(size);
        if total > limits.max_zip_file {
            return Err(ExtractionError::TooLarge {
                what: format!("total size of files in {}", zip_path.display()),
                limit: limits.max_zip_file,
            });
        }
        if relative == "go.mod" && size > limits.max_go_mod {
            return Err(ExtractionError::TooLarge {
                what: format!("go.mod file in {}", zip_path.display()),
                limit: limits.max_go_mod,
            });
        }
        planned.push(Planned {
            index,
            relative: relative.to_owned(),
            name,
            size,
        });
    }
    Ok(planned)
}

fn extract_entry(
    archive: &mut zip::ZipArchive<File>,
    zip_path: &Path,
    dir: &Path,
    planned: &Planned,
) -> Result<(), ExtractionError> {
    let target = dir.join(&planned.relative);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
    }
    let entry = archive
        .by_index(planned.index)
        .map_err(|err| ExtractionError::Malformed {
            path: zip_path.display().to_string(),
            reason: err.to_string(),
        })?;
    let mut out = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
        .map_err(|source| io_error(&target, source))?;
    let copied = io::copy(&mut entry.take(planned.size.saturating_add(1)), &mut out)
        .map_err(|source| io_error(&target, source))?;
    if copied > planned.size {
        return Err(ExtractionError::SizeMismatch {
            file: planned.name.clone(),
            declared: planned.size,
        });
    }
    drop(out);
    set_read_only(&target).map_err(|source| io_error(&target, source))
}

/// Validate that an archive entry path does not escape the destination
/// directory via `..` components, absolute paths or backslashes.
fn validate_entry_path(relative: &str) -> Result<(), ExtractionError> {
    let path = Path::new(relative);
    let escapes = path.is_absolute()
        || relative.contains('\\')
        || path
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
    if escapes {
        return Err(ExtractionError::PathTraversal {
            path: relative.to_owned(),
        });
    }
    Ok(())
}

#[cfg(unix)]
fn set_read_only(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o444))
}

#[cfg(not(unix))]
fn set_read_only(path: &Path) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(path, permissions)
}

fn io_error(path: &Path, source: io::Error) -> ExtractionError {
    ExtractionError::Io {
        path: path.display().to_string(),
        source,
    }
}
