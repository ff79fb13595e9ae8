//! Error type for cache operations.
//!
//! Results of a download are shared between every caller waiting on the
//! same module version, so [`FetchError`] is `Clone`. I/O errors are
//! reproduced from their kind and message when cloned.

use crate::dirhash::HashError;
use crate::extraction::ExtractionError;
use crate::module::ModuleError;
use crate::proxy::SourceError;
use crate::verify::VerifyError;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Errors arising from fetching, extracting or checking a module version.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The module path or version cannot be used as a cache key.
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// No configured source produced the archive.
    #[error("{module}: {source}")]
    Source {
        /// The module version requested.
        module: String,
        /// The most informative source failure.
        #[source]
        source: SourceError,
    },

    /// A downloaded archive holds an entry outside the module prefix.
    #[error("zip for {module} has unexpected file {file}")]
    UnexpectedFile {
        /// The module version requested.
        module: String,
        /// The offending entry name.
        file: String,
    },

    /// The archive could not be read or unpacked.
    #[error("unzipping {module}")]
    Extraction {
        /// The module version requested.
        module: String,
        /// The extraction failure.
        #[source]
        source: ExtractionError,
    },

    /// The archive or tree could not be hashed.
    #[error("hashing {module}")]
    Hash {
        /// The module version requested.
        module: String,
        /// The hashing failure.
        #[source]
        source: HashError,
    },

    /// Verification against the ledger or database failed.
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// The side checksum file does not hold a recognised hash.
    #[error("{module}: unexpected ziphash: {hash:?}")]
    UnexpectedZipHash {
        /// The module version checked.
        module: String,
        /// The side file contents.
        hash: String,
    },

    /// The side checksum file is missing for a downloaded module.
    #[error("{module}: missing ziphash")]
    MissingZipHash {
        /// The module version checked.
        module: String,
    },

    /// Cached content no longer matches the hash recorded at download.
    #[error("{module}: {what} has been modified ({path})")]
    Modified {
        /// The module version checked.
        module: String,
        /// `zip` or `dir`.
        what: &'static str,
        /// The modified file or directory.
        path: String,
    },

    /// A file-system operation on the cache failed.
    #[error("{path}")]
    Io {
        /// The path being accessed.
        path: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    /// Whether the error signals possible tampering and must not be
    /// recovered from.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Verify(err) => err.is_security(),
            _ => false,
        }
    }

    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl Clone for FetchError {
    fn clone(&self) -> Self {
        match self {
            Self::Module(err) => Self::Module(err.clone()),
            Self::Source { module, source } => Self::Source {
                module: module.clone(),
                source: source.clone(),
            },
            Self::UnexpectedFile { module, file } => Self::UnexpectedFile {
                module: module.clone(),
                file: file.clone(),
            },
            Self::Extraction { module, source } => Self::Extraction {
                module: module.clone(),
                source: source.clone(),
            },
            Self::Hash { module, source } => Self::Hash {
                module: module.clone(),
                source: source.clone(),
            },
            Self::Verify(err) => Self::Verify(err.clone()),
            Self::UnexpectedZipHash { module, hash } => Self::UnexpectedZipHash {
                module: module.clone(),
                hash: hash.clone(),
            },
            Self::MissingZipHash { module } => Self::MissingZipHash {
                module: module.clone(),
            },
            Self::Modified { module, what, path } => Self::Modified {
                module: module.clone(),
                what,
                path: path.clone(),
            },
            Self::Io { path, source } => Self::Io {
                path: path.clone(),
                source: io::Error::new(source.kind(), source.to_string()),
            },
        }
    }
}

/// Result type alias using [`FetchError`].
pub type Result<T> = std::result::Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::{MismatchOrigin, SecurityError};

    #[test]
    fn security_errors_are_fatal() {
        let err = FetchError::from(VerifyError::Security(SecurityError {
            origin: MismatchOrigin::Ledger,
            module: "example.com/foo@v1.2.3".to_owned(),
            downloaded: "h1:a=".to_owned(),
            authority: "modules.sum".to_owned(),
            recorded: "h1:b=".to_owned(),
        }));
        assert!(err.is_fatal());
        assert!(err.clone().is_fatal());
    }

    #[test]
    fn io_errors_survive_cloning() {
        let err = FetchError::io(
            Path::new("/cache/x"),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );

        let FetchError::Io { path, source } = err.clone() else {
            panic!("expected Io");
        };

        assert_eq!(path, "/cache/x");
        assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
        assert!(!err.is_fatal());
    }
}
