//! Shared helpers for the session test suites.
//!
//! Provides an in-process archive source and a builder for module archives
//! so that sessions can be exercised without network access.

use modcache::{CacheConfig, ModuleVersion, Session};
use modcache_fetch::proxy::{ArchiveSource, SourceEntry, SourceError};
use std::fs::File;
use std::io::{Cursor, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;

/// A ledger entry that no real archive hashes to.
pub const FORGED_HASH: &str = "h1:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

/// Serves one fixed archive for every request.
pub struct FixedSource {
    archive: Vec<u8>,
}

impl FixedSource {
    /// A source serving `archive`.
    pub const fn new(archive: Vec<u8>) -> Self {
        Self { archive }
    }
}

impl ArchiveSource for FixedSource {
    fn name(&self) -> String {
        "fixed".to_owned()
    }

    fn fetch_zip(&self, _module: &ModuleVersion, dest: &mut File) -> Result<(), SourceError> {
        dest.write_all(&self.archive)
            .map_err(|err| SourceError::Failed {
                source_name: self.name(),
                reason: err.to_string(),
            })
    }
}

/// A minimal archive for `path` at `version`.
pub fn module_archive(path: &str, version: &str) -> Vec<u8> {
    let prefix = format!("{path}@{version}/");
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in [
        ("go.mod", format!("module {path}\n")),
        ("doc.go", "package foo\n".to_owned()),
    ] {
        writer
            .start_file(format!("{prefix}{name}"), SimpleFileOptions::default())
            .expect("start entry");
        writer.write_all(data.as_bytes()).expect("write entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

/// Offline settings rooted in `base` with a ledger file and security errors
/// returned rather than fatal.
pub fn offline_config(base: &Path) -> CacheConfig {
    CacheConfig {
        cache_root: Some(base.join("mod")),
        proxy: "off".to_owned(),
        sumdb_url: "off".to_owned(),
        ledger_file: Some(base.join("modules.sum")),
        writable_cache: true,
        abort_on_security_error: false,
        ..CacheConfig::default()
    }
}

/// A session under `base` whose only source serves `module`.
pub fn serving_session(base: &Path, module: &ModuleVersion) -> Session {
    let source = FixedSource::new(module_archive(module.path(), module.version()));
    Session::with_sources(
        offline_config(base),
        vec![SourceEntry::new(Box::new(source))],
    )
    .expect("session")
}
