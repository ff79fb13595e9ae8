//! A configured module cache together with its ledger.
//!
//! [`Session`] wires a [`CacheConfig`] into the pieces of `modcache-fetch`:
//! the ledger (or a disabled one when no ledger file is configured), a
//! verifier that consults the checksum database unless it is switched off or
//! the module is exempt, and a [`ModuleCache`] over the configured sources.
//!
//! Security errors are routed through a single place. By default they end
//! the process with status 1 after logging; setting
//! `abort_on_security_error = false` returns them instead.

use modcache_fetch::proxy::SourceEntry;
use modcache_fetch::sumdb::HttpSumDb;
use modcache_fetch::{
    CacheConfig, ConfigError, FetchError, Ledger, LedgerError, ModuleCache, ModuleVersion,
    Verifier,
};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by a [`Session`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// The configuration could not be resolved.
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    /// A cache operation failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The ledger could not be flushed.
    #[error("flushing the ledger")]
    Ledger(#[from] LedgerError),
}

impl SessionError {
    /// Whether the error signals possible tampering.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Fetch(err) => err.is_fatal(),
            Self::Config(_) | Self::Ledger(_) => false,
        }
    }
}

/// Convenience alias for session results.
pub type Result<T> = std::result::Result<T, SessionError>;

/// A module cache, its verifier and its ledger.
pub struct Session {
    config: CacheConfig,
    cache: ModuleCache,
}

impl Session {
    /// Build a session from defaults overridden by `MODCACHE_*` variables.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] for invalid settings.
    pub fn from_env() -> Result<Self> {
        Self::open(CacheConfig::default().with_env_overrides()?)
    }

    /// Build a session that downloads from the configured proxy list.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] when the cache root cannot be
    /// determined or the proxy list is empty.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let sources = config.sources()?;
        Self::with_sources(config, sources)
    }

    /// Build a session that downloads from `sources` instead of the
    /// configured proxy list.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] when the cache root cannot be
    /// determined.
    pub fn with_sources(config: CacheConfig, sources: Vec<SourceEntry>) -> Result<Self> {
        let root = config.resolved_cache_root()?;
        let ledger = Arc::new(match &config.ledger_file {
            Some(file) => Ledger::new(file.clone()),
            None => Ledger::disabled(),
        });

        let mut verifier = Verifier::new(ledger).with_exemptions(config.no_sumdb_patterns());
        if config.sumdb_enabled() {
            let database = HttpSumDb::with_timeout(config.sumdb_url.trim(), config.timeout());
            verifier = verifier.with_database(Arc::new(database));
        }

        log::debug!("module cache at {}", root.display());
        let cache = ModuleCache::new(root, sources, Arc::new(verifier))
            .writable(config.writable_cache);
        Ok(Self { config, cache })
    }

    /// The settings this session was built from.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The underlying cache.
    #[must_use]
    pub const fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    /// The ledger verified hashes are recorded in.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        self.cache.verifier().ledger()
    }

    /// Download, verify and extract `module`, returning its directory.
    /// The extracted `go.mod` is verified under its own ledger key.
    ///
    /// # Errors
    ///
    /// Returns the cache error; security errors end the process unless
    /// aborting is disabled.
    pub fn download(&self, module: &ModuleVersion) -> Result<PathBuf> {
        let result = self.cache.download(module).and_then(|dir| {
            self.check_manifest(module, &dir)?;
            Ok(dir)
        });
        self.abort_on_fatal(result)
    }

    fn check_manifest(&self, module: &ModuleVersion, dir: &Path) -> modcache_fetch::Result<()> {
        let manifest = dir.join("go.mod");
        let data = match fs::read(&manifest) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(FetchError::Io {
                    path: manifest.display().to_string(),
                    source,
                });
            }
        };
        self.cache
            .verifier()
            .check_go_mod(module.path(), module.version(), &data)?;
        Ok(())
    }

    /// Download and verify the archive of `module`, returning its path.
    ///
    /// # Errors
    ///
    /// As [`Session::download`].
    pub fn download_zip(&self, module: &ModuleVersion) -> Result<PathBuf> {
        self.abort_on_fatal(self.cache.download_zip(module))
    }

    /// Check the extracted tree of `module` against its recorded hash.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Modified`] when the tree or archive changed.
    pub fn verify(&self, module: &ModuleVersion) -> Result<()> {
        Ok(self.cache.verify_tree(module)?)
    }

    /// Write the hashes used this session to the ledger file.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Ledger`] if the file cannot be updated.
    pub fn flush(&self) -> Result<()> {
        let ledger = self.ledger();
        ledger.write(&ledger.used_modules())?;
        Ok(())
    }

    /// Forget the ledger state loaded this session.
    pub fn reset(&self) {
        self.ledger().reset();
    }

    /// Remove the whole cache directory.
    ///
    /// # Errors
    ///
    /// Returns the failure to delete the tree.
    pub fn clean(&self) -> Result<()> {
        Ok(self.cache.clean()?)
    }

    fn abort_on_fatal<T>(&self, result: modcache_fetch::Result<T>) -> Result<T> {
        match result {
            Err(err) if err.is_fatal() => {
                log::error!("{err}");
                if self.config.abort_on_security_error {
                    if let Err(write_err) = writeln!(io::stderr().lock(), "modcache: {err}") {
                        log::warn!("writing to stderr: {write_err}");
                    }
                    std::process::exit(1);
                }
                Err(err.into())
            }
            other => other.map_err(SessionError::from),
        }
    }
}
