//! Cache configuration.
//!
//! Settings are read from a TOML file and then overridden from the
//! environment, so a deployment can pin a file while individual runs adjust
//! the proxy or cache root:
//!
//! | Field            | Variable           |
//! |------------------|--------------------|
//! | `cache_root`     | `MODCACHE_ROOT`    |
//! | `proxy`          | `MODCACHE_PROXY`   |
//! | `sumdb_url`      | `MODCACHE_SUMDB`   |
//! | `private`        | `MODCACHE_PRIVATE` |
//! | `no_sumdb`       | `MODCACHE_NOSUMDB` |
//! | `ledger_file`    | `MODCACHE_LEDGER`  |
//! | `writable_cache` | `MODCACHE_RW`      |

use crate::proxy::{self, SourceEntry};
use crate::sumdb::PrefixPatterns;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PROXY: &str = "https://proxy.golang.org";
const DEFAULT_SUMDB: &str = "https://sum.golang.org";

/// Errors arising from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("reading configuration {path}")]
    Read {
        /// The configuration file.
        path: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid.
    #[error("parsing configuration {path}")]
    Parse {
        /// The configuration file, or `<inline>`.
        path: String,
        /// The parser's report.
        #[source]
        source: toml::de::Error,
    },

    /// An environment variable holds an unusable value.
    #[error("invalid value {value:?} for {name}")]
    InvalidEnv {
        /// The variable name.
        name: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The proxy list cannot be parsed.
    #[error("invalid proxy setting: {reason}")]
    InvalidProxy {
        /// Description of the problem.
        reason: String,
    },

    /// No cache root is configured and the platform has no cache directory.
    #[error("no cache root configured and no platform cache directory found")]
    NoCacheDir,
}

/// Settings for a module cache session.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache root; defaults to a `mod` directory in the platform cache.
    pub cache_root: Option<PathBuf>,
    /// Proxy list, such as `https://a.example,https://b.example|off`.
    pub proxy: String,
    /// Checksum database URL, or `off`.
    pub sumdb_url: String,
    /// Comma-separated glob prefixes of private module paths.
    pub private: String,
    /// Prefixes never checked against the database; defaults to `private`.
    pub no_sumdb: Option<String>,
    /// Ledger file; verification against a ledger is disabled without one.
    pub ledger_file: Option<PathBuf>,
    /// Leave extracted trees writable.
    pub writable_cache: bool,
    /// Exit the process on checksum mismatches instead of returning them.
    pub abort_on_security_error: bool,
    /// Network timeout for archive downloads and database lookups.
    pub download_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root: None,
            proxy: DEFAULT_PROXY.to_owned(),
            sumdb_url: DEFAULT_SUMDB.to_owned(),
            private: String::new(),
            no_sumdb: None,
            ledger_file: None,
            writable_cache: false,
            abort_on_security_error: true,
            download_timeout_secs: 30,
        }
    }
}

impl CacheConfig {
    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid TOML or unknown fields.
    ///
    /// # Examples
    ///
    /// ```
    /// use modcache_fetch::config::CacheConfig;
    ///
    /// let config = CacheConfig::from_toml_str("proxy = \"off\"\n").unwrap();
    /// assert_eq!(config.proxy, "off");
    /// assert!(config.abort_on_security_error);
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_owned(),
            source,
        })
    }

    /// Read configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply overrides from the process environment.
    ///
    /// # Errors
    ///
    /// See [`CacheConfig::with_overrides_from`].
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    /// Empty values are treated as unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] when `MODCACHE_RW` is not a
    /// boolean.
    ///
    /// # Examples
    ///
    /// ```
    /// use modcache_fetch::config::CacheConfig;
    ///
    /// let config = CacheConfig::default()
    ///     .with_overrides_from(|name| (name == "MODCACHE_SUMDB").then(|| "off".to_owned()))
    ///     .unwrap();
    /// assert!(!config.sumdb_enabled());
    /// ```
    pub fn with_overrides_from<F>(mut self, mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        if let Some(root) = var("MODCACHE_ROOT") {
            self.cache_root = Some(PathBuf::from(root));
        }
        if let Some(proxy) = var("MODCACHE_PROXY") {
            self.proxy = proxy;
        }
        if let Some(sumdb) = var("MODCACHE_SUMDB") {
            self.sumdb_url = sumdb;
        }
        if let Some(private) = var("MODCACHE_PRIVATE") {
            self.private = private;
        }
        if let Some(no_sumdb) = var("MODCACHE_NOSUMDB") {
            self.no_sumdb = Some(no_sumdb);
        }
        if let Some(ledger) = var("MODCACHE_LEDGER") {
            self.ledger_file = Some(PathBuf::from(ledger));
        }
        if let Some(rw) = var("MODCACHE_RW") {
            self.writable_cache = parse_bool("MODCACHE_RW", &rw)?;
        }
        Ok(self)
    }

    /// The cache root, falling back to the platform cache directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoCacheDir`] when neither is available.
    pub fn resolved_cache_root(&self) -> Result<PathBuf, ConfigError> {
        if let Some(root) = &self.cache_root {
            return Ok(root.clone());
        }
        directories_next::ProjectDirs::from("", "", "modcache")
            .map(|dirs| dirs.cache_dir().join("mod"))
            .ok_or(ConfigError::NoCacheDir)
    }

    /// Whether a checksum database is configured.
    #[must_use]
    pub fn sumdb_enabled(&self) -> bool {
        let url = self.sumdb_url.trim();
        !url.is_empty() && url != "off"
    }

    /// Module path prefixes exempt from the checksum database.
    #[must_use]
    pub fn no_sumdb_patterns(&self) -> PrefixPatterns {
        PrefixPatterns::new(self.no_sumdb.as_deref().unwrap_or(&self.private))
    }

    /// The network timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// HTTP sources for the configured proxy list.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidProxy`] for an empty list.
    pub fn sources(&self) -> Result<Vec<SourceEntry>, ConfigError> {
        let specs = proxy::parse_proxy_list(&self.proxy)
            .map_err(|reason| ConfigError::InvalidProxy { reason })?;
        Ok(proxy::sources_from_specs(&specs, self.timeout()))
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name,
            value: value.to_owned(),
        }),
    }
}
