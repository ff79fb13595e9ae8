//! The remote checksum database and the patterns that exempt modules from it.

use crate::module::{ModuleError, ModuleVersion};
use log::debug;
use std::time::Duration;
use thiserror::Error;

/// Default network timeout for database lookups.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors arising from checksum database lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SumDbError {
    /// The database has no record of the module version.
    #[error("{url}: not found")]
    NotFound {
        /// The URL that was requested.
        url: String,
    },

    /// The lookup failed for any other reason.
    #[error("{url}: {reason}")]
    Failed {
        /// The URL that was requested.
        url: String,
        /// A human-readable description of the failure.
        reason: String,
    },

    /// The module could not be encoded into a lookup URL.
    #[error(transparent)]
    Module(#[from] ModuleError),
}

/// A source of trusted `path version hash` lines.
///
/// Implementations return every line the database holds for the module
/// version, ignoring any manifest suffix on the version, so that both the
/// tree hash and the manifest hash come back from a single lookup.
#[cfg_attr(test, mockall::automock)]
pub trait ChecksumDatabase: Send + Sync {
    /// Name shown in mismatch reports.
    fn name(&self) -> String;

    /// Fetch the lines recorded for `module`.
    ///
    /// # Errors
    ///
    /// Returns [`SumDbError::NotFound`] when the database has no record and
    /// [`SumDbError::Failed`] for transport or protocol failures.
    fn lookup(&self, module: &ModuleVersion) -> Result<Vec<String>, SumDbError>;
}

/// Checksum database reached over HTTP.
///
/// Issues `GET <base>/lookup/<escaped path>@<escaped version>` and keeps the
/// record lines of the response body, which end at the first blank line.
/// The signed tree note that follows is not checked; the transport is
/// trusted instead.
#[derive(Clone)]
pub struct HttpSumDb {
    base: String,
    agent: ureq::Agent,
}

impl HttpSumDb {
    /// A database rooted at `base`, such as `https://sum.golang.org`.
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        Self::with_timeout(base, LOOKUP_TIMEOUT)
    }

    /// A database rooted at `base` whose lookups give up after `timeout`.
    #[must_use]
    pub fn with_timeout(base: impl Into<String>, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            base: base.into().trim_end_matches('/').to_owned(),
            agent: ureq::Agent::new_with_config(config),
        }
    }

    /// The lookup URL for `module`.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`] if the path or version cannot be escaped.
    ///
    /// # Examples
    ///
    /// ```
    /// use modcache_fetch::{ModuleVersion, sumdb::HttpSumDb};
    ///
    /// let db = HttpSumDb::new("https://sum.example.test/");
    /// let url = db.lookup_url(&ModuleVersion::new("example.com/Foo", "v1.0.0/go.mod"));
    /// assert_eq!(url.unwrap(), "https://sum.example.test/lookup/example.com/!foo@v1.0.0");
    /// ```
    pub fn lookup_url(&self, module: &ModuleVersion) -> Result<String, ModuleError> {
        let base = module.without_suffix();
        Ok(format!(
            "{}/lookup/{}@{}",
            self.base,
            base.escaped_path()?,
            base.escaped_version()?
        ))
    }
}

impl ChecksumDatabase for HttpSumDb {
    fn name(&self) -> String {
        self.base
            .split_once("://")
            .map_or(self.base.as_str(), |(_, host)| host)
            .to_owned()
    }

    fn lookup(&self, module: &ModuleVersion) -> Result<Vec<String>, SumDbError> {
        let url = self.lookup_url(module)?;
        debug!("looking up {module} in {url}");
        let response = self.agent.get(url.as_str()).call().map_err(|err| match err {
            ureq::Error::StatusCode(404 | 410) => SumDbError::NotFound { url: url.clone() },
            other => SumDbError::Failed {
                url: url.clone(),
                reason: other.to_string(),
            },
        })?;
        let body = response
            .into_body()
            .read_to_string()
            .map_err(|err| SumDbError::Failed {
                url: url.clone(),
                reason: err.to_string(),
            })?;
        Ok(record_lines(&body, module))
    }
}

/// Keep the record lines of a lookup response that belong to `module`.
fn record_lines(body: &str, module: &ModuleVersion) -> Vec<String> {
    let base = module.without_suffix();
    let tree = format!("{} {} ", base.path(), base.version());
    let manifest = format!("{} {}/go.mod ", base.path(), base.version());
    body.lines()
        .take_while(|line| !line.is_empty())
        .filter(|line| line.starts_with(&tree) || line.starts_with(&manifest))
        .map(str::to_owned)
        .collect()
}

/// Comma-separated glob patterns matched against leading path elements.
///
/// A pattern with `n` slashes is matched against the first `n + 1`
/// elements of a module path, so `example.com` covers every module under
/// that host and `*.corp/team` covers one team on any corporate host.
///
/// # Examples
///
/// ```
/// use modcache_fetch::sumdb::PrefixPatterns;
///
/// let private = PrefixPatterns::new("*.corp.example,github.com/acme");
/// assert!(private.matches("git.corp.example/tools/x"));
/// assert!(private.matches("github.com/acme/widget"));
/// assert!(!private.matches("github.com/other/widget"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixPatterns {
    patterns: Vec<String>,
}

impl PrefixPatterns {
    /// Parse a comma-separated list; empty entries and trailing slashes
    /// are ignored.
    #[must_use]
    pub fn new(list: &str) -> Self {
        Self {
            patterns: list
                .split(',')
                .map(|pattern| pattern.trim().trim_end_matches('/'))
                .filter(|pattern| !pattern.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    /// Whether no patterns are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether any pattern matches a prefix of `path`.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        self.patterns.iter().any(|pattern| {
            let elements = pattern.matches('/').count() + 1;
            let prefix: Vec<&str> = path.splitn(elements + 1, '/').take(elements).collect();
            if prefix.len() < elements {
                return false;
            }
            glob::Pattern::new(pattern)
                .is_ok_and(|glob| glob.matches_with(&prefix.join("/"), options))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn record_lines_stop_at_the_note() {
        let body = "12345\n\
                    example.com/foo v1.2.3 h1:tree=\n\
                    example.com/foo v1.2.3/go.mod h1:mod=\n\
                    example.com/foo v1.2.30 h1:other=\n\
                    \n\
                    go.sum database tree\n\
                    example.com/foo v1.2.3 h1:forged=\n";
        let module = ModuleVersion::new("example.com/foo", "v1.2.3/go.mod");

        assert_eq!(
            record_lines(body, &module),
            [
                "example.com/foo v1.2.3 h1:tree=",
                "example.com/foo v1.2.3/go.mod h1:mod="
            ]
        );
    }

    #[test]
    fn name_strips_scheme() {
        assert_eq!(HttpSumDb::new("https://sum.golang.org").name(), "sum.golang.org");
    }

    #[rstest]
    #[case::host("example.com", "example.com/foo/bar", true)]
    #[case::exact("example.com/foo", "example.com/foo", true)]
    #[case::glob_host("*.corp", "git.corp/x", true)]
    #[case::glob_stays_in_element("*.corp", "git.other/x.corp", false)]
    #[case::too_few_elements("example.com/foo/bar", "example.com/foo", false)]
    #[case::trailing_slash_ignored("example.com/", "example.com/foo", true)]
    #[case::other_host("example.com", "example.org/foo", false)]
    fn matches_prefix_patterns(#[case] list: &str, #[case] path: &str, #[case] expected: bool) {
        assert_eq!(PrefixPatterns::new(list).matches(path), expected);
    }

    #[test]
    fn empty_list_matches_nothing() {
        let patterns = PrefixPatterns::new(" , ,");
        assert!(patterns.is_empty());
        assert!(!patterns.matches("example.com/foo"));
    }
}
