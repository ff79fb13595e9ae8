//! Directory hashing in the `h1:` format.
//!
//! A tree hash is the SHA-256 of a summary listing one line per file,
//! `<hex sha256 of contents>  <name>\n`, sorted by name, encoded as
//! standard base64 and prefixed with `h1:`. The same tree hashes the same
//! whether it is read from a zip archive or from an extracted directory.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;

/// Prefix of every hash produced by [`hash1`].
pub const H1_PREFIX: &str = "h1:";

/// Name hashed for manifest-only checksums.
const GO_MOD_FILE: &str = "go.mod";

/// Errors raised while hashing a file tree.
#[derive(Debug, Error)]
pub enum HashError {
    /// A file name contains a newline and cannot appear in the summary.
    #[error("file name {name:?} contains a newline")]
    NewlineInName {
        /// The offending name.
        name: String,
    },

    /// A listed file could not be opened or read.
    #[error("reading {name}")]
    Io {
        /// The file being hashed.
        name: String,
        /// The underlying failure.
        #[source]
        source: io::Error,
    },

    /// The archive could not be parsed.
    #[error("reading archive {path}: {reason}")]
    Zip {
        /// The archive path.
        path: String,
        /// Description of the parse failure.
        reason: String,
    },
}

impl Clone for HashError {
    fn clone(&self) -> Self {
        match self {
            Self::NewlineInName { name } => Self::NewlineInName { name: name.clone() },
            // Lossy: io::Error is rebuilt from its kind and message.
            Self::Io { name, source } => Self::Io {
                name: name.clone(),
                source: io::Error::new(source.kind(), source.to_string()),
            },
            Self::Zip { path, reason } => Self::Zip {
                path: path.clone(),
                reason: reason.clone(),
            },
        }
    }
}

/// Whether `hash` uses an algorithm this crate can verify.
#[must_use]
pub fn is_strong(hash: &str) -> bool {
    hash.starts_with(H1_PREFIX)
}

/// Hash the named files, reading each through `open`.
///
/// # Errors
///
/// Returns [`HashError::NewlineInName`] for unrepresentable names and
/// [`HashError::Io`] when a file cannot be read.
pub fn hash1<F, R>(files: &[String], mut open: F) -> Result<String, HashError>
where
    F: FnMut(&str) -> io::Result<R>,
    R: Read,
{
    let mut names: Vec<&String> = files.iter().collect();
    names.sort();
    let mut summary = Sha256::new();
    for name in names {
        if name.contains('\n') {
            return Err(HashError::NewlineInName { name: name.clone() });
        }
        let io_error = |source| HashError::Io {
            name: name.clone(),
            source,
        };
        let reader = open(name).map_err(io_error)?;
        let digest = sha256_reader(reader).map_err(io_error)?;
        summary.update(format!("{digest}  {name}\n").as_bytes());
    }
    Ok(format!("{H1_PREFIX}{}", STANDARD.encode(summary.finalize())))
}

/// Hash every entry of the zip archive at `path`.
///
/// # Errors
///
/// Returns [`HashError::Zip`] for unreadable archives and
/// [`HashError::Io`] when an entry cannot be decompressed.
pub fn hash_zip(path: &Path) -> Result<String, HashError> {
    let zip_error = |reason: String| HashError::Zip {
        path: path.display().to_string(),
        reason,
    };
    let file = File::open(path).map_err(|err| zip_error(err.to_string()))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|err| zip_error(err.to_string()))?;
    let mut names = Vec::with_capacity(archive.len());
    let mut indices = HashMap::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|err| zip_error(err.to_string()))?;
        let name = entry.name().to_owned();
        indices.insert(name.clone(), index);
        names.push(name);
    }
    hash1(&names, |name| {
        let index = indices
            .get(name)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "not in archive"))?;
        let mut entry = archive.by_index(index).map_err(io::Error::other)?;
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        Ok(io::Cursor::new(data))
    })
}

/// Hash the files below `dir` as if each were named `<prefix>/<relative>`.
/// A trailing `/` on `prefix` is ignored, so a zip entry prefix may be
/// passed as is.
///
/// # Errors
///
/// Returns [`HashError::Io`] when the tree cannot be walked or read.
pub fn hash_dir(dir: &Path, prefix: &str) -> Result<String, HashError> {
    let prefix = prefix.trim_end_matches('/');
    let mut files = Vec::new();
    collect_files(dir, dir, prefix, &mut files).map_err(|source| HashError::Io {
        name: dir.display().to_string(),
        source,
    })?;
    let names: Vec<String> = files.iter().map(|(name, _)| name.clone()).collect();
    let paths: HashMap<String, std::path::PathBuf> = files.into_iter().collect();
    hash1(&names, |name| {
        let path = paths
            .get(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "not in tree"))?;
        File::open(path)
    })
}

/// Hash a manifest as a one-file tree named `go.mod`.
///
/// # Errors
///
/// Cannot fail for in-memory data; the result type is shared with the
/// other hash functions.
pub fn go_mod_sum(data: &[u8]) -> Result<String, HashError> {
    hash1(&[GO_MOD_FILE.to_owned()], |_| Ok(data))
}

fn collect_files(
    root: &Path,
    dir: &Path,
    prefix: &str,
    out: &mut Vec<(String, std::path::PathBuf)>,
) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, prefix, out)?;
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .map_err(io::Error::other)?
            .components()
            .map(|part| part.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        out.push((format!("{prefix}/{relative}"), path));
    }
    Ok(())
}

fn sha256_reader(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    /// Hash recorded for an empty manifest by older toolchains.
    const EMPTY_GO_MOD_HASH: &str = "h1:G7mAYYxgmS0lVkHyy2hEOLQCFB0DlQFTMLWggykrydY=";

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).expect("create zip");
        let mut writer = zip::ZipWriter::new(file);
        for (name, data) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("start entry");
            writer.write_all(data).expect("write entry");
        }
        writer.finish().expect("finish zip");
    }

    #[test]
    fn empty_manifest_matches_known_hash() {
        assert_eq!(go_mod_sum(b"").expect("hash"), EMPTY_GO_MOD_HASH);
    }

    #[test]
    fn order_of_listing_does_not_matter() {
        let data: HashMap<&str, &[u8]> = HashMap::from([("a", &b"1"[..]), ("b", &b"2"[..])]);
        let open = |name: &str| Ok(*data.get(name).expect("known name"));

        let forward = hash1(&["a".to_owned(), "b".to_owned()], open).expect("hash");
        let backward = hash1(&["b".to_owned(), "a".to_owned()], open).expect("hash");

        assert_eq!(forward, backward);
        assert!(is_strong(&forward));
    }

    #[test]
    fn rejects_newline_in_name() {
        let result = hash1(&["bad\nname".to_owned()], |_| Ok(&b""[..]));
        assert!(matches!(result, Err(HashError::NewlineInName { .. })));
    }

    #[test]
    fn zip_and_extracted_tree_agree() {
        let temp = tempfile::tempdir().expect("temp dir");
        let zip_path = temp.path().join("v1.2.3.zip");
        write_zip(
            &zip_path,
            &[
                ("example.com/foo@v1.2.3/go.mod", b"module example.com/foo\n"),
                ("example.com/foo@v1.2.3/sub/foo.go", b"package sub\n"),
            ],
        );
        let tree = temp.path().join("tree");
        std::fs::create_dir_all(tree.join("sub")).expect("mkdir");
        std::fs::write(tree.join("go.mod"), b"module example.com/foo\n").expect("write");
        std::fs::write(tree.join("sub").join("foo.go"), b"package sub\n").expect("write");

        let from_zip = hash_zip(&zip_path).expect("hash zip");
        let from_dir = hash_dir(&tree, "example.com/foo@v1.2.3").expect("hash dir");
        let from_entry_prefix = hash_dir(&tree, "example.com/foo@v1.2.3/").expect("hash dir");

        assert_eq!(from_zip, from_dir);
        assert_eq!(from_zip, from_entry_prefix);
    }

    #[test]
    fn unreadable_archive_is_reported() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("broken.zip");
        std::fs::write(&path, b"not a zip").expect("write");

        assert!(matches!(hash_zip(&path), Err(HashError::Zip { .. })));
    }
}
