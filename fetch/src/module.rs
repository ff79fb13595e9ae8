//! Module identity: the `(path, version)` key used throughout the cache.

use crate::semver;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Version suffix selecting the checksum of the manifest file alone.
pub const GO_MOD_SUFFIX: &str = "/go.mod";

/// Errors arising from malformed module paths or versions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    /// The module path cannot be used as a cache key.
    #[error("malformed module path \"{path}\": {reason}")]
    InvalidPath {
        /// The rejected path.
        path: String,
        /// Description of the violated rule.
        reason: &'static str,
    },

    /// The version cannot be used as a cache key.
    #[error("malformed version \"{version}\": {reason}")]
    InvalidVersion {
        /// The rejected version.
        version: String,
        /// Description of the violated rule.
        reason: &'static str,
    },
}

/// An immutable module path and version.
///
/// The version may end in [`GO_MOD_SUFFIX`], in which case the value names
/// the manifest of that version rather than its whole source tree.
///
/// # Examples
///
/// ```
/// use modcache_fetch::ModuleVersion;
///
/// let module = ModuleVersion::new("example.com/foo", "v1.2.3");
/// assert_eq!(module.to_string(), "example.com/foo@v1.2.3");
/// assert_eq!(module.go_mod().version(), "v1.2.3/go.mod");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleVersion {
    path: String,
    version: String,
}

impl ModuleVersion {
    /// Build a module version from its parts.
    #[must_use]
    pub fn new(path: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: version.into(),
        }
    }

    /// The module path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The version, including any manifest suffix.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Whether this key names a manifest rather than a source tree.
    #[must_use]
    pub fn is_go_mod(&self) -> bool {
        self.version.ends_with(GO_MOD_SUFFIX)
    }

    /// The same module with the manifest suffix removed.
    #[must_use]
    pub fn without_suffix(&self) -> Self {
        Self {
            path: self.path.clone(),
            version: self
                .version
                .strip_suffix(GO_MOD_SUFFIX)
                .unwrap_or(&self.version)
                .to_owned(),
        }
    }

    /// The manifest key for this module version.
    #[must_use]
    pub fn go_mod(&self) -> Self {
        let base = self.without_suffix();
        Self {
            version: format!("{}{GO_MOD_SUFFIX}", base.version),
            path: base.path,
        }
    }

    /// The path escaped for use as file-system components.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::InvalidPath`] for paths that cannot be
    /// represented safely on disk.
    pub fn escaped_path(&self) -> Result<String, ModuleError> {
        escape_path(&self.path)
    }

    /// The version escaped for use as a file-name component.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::InvalidVersion`] for versions that cannot be
    /// represented safely on disk.
    pub fn escaped_version(&self) -> Result<String, ModuleError> {
        escape_version(&self.version)
    }

    /// Prefix every entry of this version's archive must carry.
    #[must_use]
    pub fn zip_prefix(&self) -> String {
        format!("{}@{}/", self.path, self.version)
    }

    fn version_parts(&self) -> (&str, &str) {
        match self.version.find('/') {
            Some(index) => self.version.split_at(index),
            None => (self.version.as_str(), ""),
        }
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.version)
    }
}

impl Ord for ModuleVersion {
    /// Path first, then the semantic version, then any file suffix.
    fn cmp(&self, other: &Self) -> Ordering {
        let (version, file) = self.version_parts();
        let (other_version, other_file) = other.version_parts();
        self.path
            .cmp(&other.path)
            .then_with(|| semver::compare(version, other_version))
            .then_with(|| version.cmp(other_version))
            .then_with(|| file.cmp(other_file))
    }
}

impl PartialOrd for ModuleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Escape a module path so that it is safe on case-insensitive file systems.
///
/// Upper-case ASCII letters become `!` followed by the lower-case letter.
///
/// # Errors
///
/// Rejects empty paths, non-ASCII or `!` characters, leading or trailing
/// slashes, and empty, `.` or `..` elements.
///
/// # Examples
///
/// ```
/// use modcache_fetch::module::escape_path;
///
/// assert_eq!(escape_path("github.com/Azure/go").unwrap(), "github.com/!azure/go");
/// ```
pub fn escape_path(path: &str) -> Result<String, ModuleError> {
    let invalid = |reason| ModuleError::InvalidPath {
        path: path.to_owned(),
        reason,
    };
    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    if path.split('/').any(|elem| elem.is_empty() || elem == "." || elem == "..") {
        return Err(invalid("empty or dot path element"));
    }
    escape(path).ok_or_else(|| invalid("invalid character"))
}

/// Escape a version the same way as [`escape_path`].
///
/// # Errors
///
/// Rejects empty versions, versions containing `!` or non-ASCII characters,
/// and versions that would climb out of their directory.
pub fn escape_version(version: &str) -> Result<String, ModuleError> {
    let invalid = |reason| ModuleError::InvalidVersion {
        version: version.to_owned(),
        reason,
    };
    if version.is_empty() {
        return Err(invalid("empty version"));
    }
    if version.split('/').any(|elem| elem.is_empty() || elem == "." || elem == "..") {
        return Err(invalid("empty or dot version element"));
    }
    escape(version).ok_or_else(|| invalid("invalid character"))
}

fn escape(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '!' || !c.is_ascii() || c.is_ascii_control() || c == '\\' {
            return None;
        }
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Sort module versions into canonical order.
pub fn sort(modules: &mut [ModuleVersion]) {
    modules.sort();
}
