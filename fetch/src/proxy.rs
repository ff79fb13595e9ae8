//! Archive sources and fallback across them.
//!
//! Sources are configured as a proxy list such as
//! `https://a.example,https://b.example|https://c.example`. After a source
//! separated by `,` fails, the next one is tried only if the failure was
//! "not found"; after one separated by `|`, the next is tried on any error.
//! The keyword `off` disables lookups from that point on.

use crate::extraction::Limits;
use crate::module::{ModuleError, ModuleVersion};
use log::{debug, warn};
use std::fs::File;
use std::io::{self, Read, Write};
use std::time::Duration;
use thiserror::Error;

/// Default network timeout for archive downloads.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Keyword disabling every later source.
const OFF: &str = "off";

/// Errors arising from a single archive source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source does not have the requested module version.
    #[error("{source_name}: {module}: not found")]
    NotFound {
        /// The source that was asked.
        source_name: String,
        /// The module version requested.
        module: String,
    },

    /// Lookups are disabled by configuration.
    #[error("module lookup disabled by proxy setting \"off\"")]
    Disabled,

    /// The source failed for any other reason.
    #[error("{source_name}: {reason}")]
    Failed {
        /// The source that was asked.
        source_name: String,
        /// A human-readable description of the failure.
        reason: String,
    },

    /// The module cannot be expressed as a request.
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// Cleaning up after a failed attempt went wrong; no further source
    /// can be tried safely.
    #[error("resetting download after failed attempt")]
    Unrecoverable(#[source] io::Error),
}

impl SourceError {
    /// Whether the error means "this source does not have it".
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Disabled)
    }
}

impl Clone for SourceError {
    fn clone(&self) -> Self {
        match self {
            Self::NotFound {
                source_name,
                module,
            } => Self::NotFound {
                source_name: source_name.clone(),
                module: module.clone(),
            },
            Self::Disabled => Self::Disabled,
            Self::Failed {
                source_name,
                reason,
            } => Self::Failed {
                source_name: source_name.clone(),
                reason: reason.clone(),
            },
            Self::Module(err) => Self::Module(err.clone()),
            // Lossy: io::Error is rebuilt from its kind and message.
            Self::Unrecoverable(err) => {
                Self::Unrecoverable(io::Error::new(err.kind(), err.to_string()))
            }
        }
    }
}

/// A place module archives can be downloaded from.
#[cfg_attr(test, mockall::automock)]
pub trait ArchiveSource: Send + Sync {
    /// Name shown in logs and errors.
    fn name(&self) -> String;

    /// Write the archive of `module` into `dest`.
    ///
    /// On failure `dest` may hold a partial download; the caller truncates
    /// it before trying elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotFound`] when the source lacks the version.
    fn fetch_zip(&self, module: &ModuleVersion, dest: &mut File) -> Result<(), SourceError>;
}

/// One configured source and how to react to its failures.
pub struct SourceEntry {
    source: Box<dyn ArchiveSource>,
    fall_back_on_error: bool,
}

impl SourceEntry {
    /// Try the next source only if this one reports "not found".
    #[must_use]
    pub fn new(source: Box<dyn ArchiveSource>) -> Self {
        Self {
            source,
            fall_back_on_error: false,
        }
    }

    /// Try the next source after any failure of this one.
    #[must_use]
    pub fn falling_back_on_error(source: Box<dyn ArchiveSource>) -> Self {
        Self {
            source,
            fall_back_on_error: true,
        }
    }

    /// The wrapped source.
    #[must_use]
    pub fn source(&self) -> &dyn ArchiveSource {
        self.source.as_ref()
    }
}

/// A parsed proxy list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    /// Base URL, or `off`.
    pub url: String,
    /// Whether the separator after this entry was `|`.
    pub fall_back_on_error: bool,
}

/// Parse a proxy list. Entries after `off` are ignored.
///
/// # Errors
///
/// Returns a description of the problem when the list has no entries.
///
/// # Examples
///
/// ```
/// use modcache_fetch::proxy::parse_proxy_list;
///
/// let specs = parse_proxy_list("https://a.example|https://b.example,off").unwrap();
/// assert_eq!(specs.len(), 3);
/// assert!(specs[0].fall_back_on_error);
/// assert!(!specs[1].fall_back_on_error);
/// ```
pub fn parse_proxy_list(list: &str) -> Result<Vec<SourceSpec>, String> {
    let mut specs = Vec::new();
    let mut rest = list.trim();
    while !rest.is_empty() {
        let (url, separator, tail) = match rest.find([',', '|']) {
            Some(index) => (
                &rest[..index],
                rest[index..].chars().next(),
                &rest[index + 1..],
            ),
            None => (rest, None, ""),
        };
        rest = tail;
        let url = url.trim();
        if url.is_empty() {
            continue;
        }
        specs.push(SourceSpec {
            url: url.trim_end_matches('/').to_owned(),
            fall_back_on_error: separator == Some('|'),
        });
        if url == OFF {
            break;
        }
    }
    if specs.is_empty() {
        return Err(format!("proxy list \"{list}\" has no entries"));
    }
    Ok(specs)
}

/// Build HTTP sources for a parsed proxy list.
#[must_use]
pub fn sources_from_specs(specs: &[SourceSpec], timeout: Duration) -> Vec<SourceEntry> {
    specs
        .iter()
        .map(|spec| {
            let source: Box<dyn ArchiveSource> = if spec.url == OFF {
                Box::new(DisabledSource)
            } else {
                Box::new(HttpProxy::with_timeout(&spec.url, timeout))
            };
            SourceEntry {
                source,
                fall_back_on_error: spec.fall_back_on_error,
            }
        })
        .collect()
}

/// Call `attempt` on each source in turn until one succeeds.
///
/// Falls through to the next source per each entry's fallback policy and
/// stops immediately on [`SourceError::Unrecoverable`]. When every source
/// fails, the most informative error is returned: any real failure is
/// preferred over "not found".
///
/// # Errors
///
/// Returns the chosen source error, or [`SourceError::Disabled`] when no
/// sources are configured.
pub fn try_sources<F>(sources: &[SourceEntry], mut attempt: F) -> Result<(), SourceError>
where
    F: FnMut(&dyn ArchiveSource) -> Result<(), SourceError>,
{
    let mut best: Option<SourceError> = None;
    for entry in sources {
        let err = match attempt(entry.source()) {
            Ok(()) => return Ok(()),
            Err(err @ SourceError::Unrecoverable(_)) => return Err(err),
            Err(err) => err,
        };
        let not_found = err.is_not_found();
        debug!("{} failed: {err}", entry.source.name());
        let replaces = match &best {
            None => true,
            Some(previous) => !not_found || previous.is_not_found(),
        };
        if replaces {
            best = Some(err);
        }
        if !entry.fall_back_on_error && !not_found {
            break;
        }
    }
    Err(best.unwrap_or(SourceError::Disabled))
}

/// A source that refuses every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSource;

impl ArchiveSource for DisabledSource {
    fn name(&self) -> String {
        OFF.to_owned()
    }

    fn fetch_zip(&self, _module: &ModuleVersion, _dest: &mut File) -> Result<(), SourceError> {
        Err(SourceError::Disabled)
    }
}

/// A module proxy reached over HTTP.
///
/// Archives are fetched from `<base>/<escaped path>/@v/<escaped version>.zip`.
#[derive(Clone)]
pub struct HttpProxy {
    base: String,
    agent: ureq::Agent,
    max_bytes: u64,
}

impl HttpProxy {
    /// A proxy rooted at `base` with the default timeout.
    #[must_use]
    pub fn new(base: &str) -> Self {
        Self::with_timeout(base, DOWNLOAD_TIMEOUT)
    }

    /// A proxy rooted at `base` whose requests give up after `timeout`.
    #[must_use]
    pub fn with_timeout(base: &str, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            base: base.trim_end_matches('/').to_owned(),
            agent: ureq::Agent::new_with_config(config),
            max_bytes: Limits::default().max_zip_file,
        }
    }

    /// Abandon downloads whose body grows past `max_bytes`.
    #[must_use]
    pub const fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// The archive URL for `module`.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError`] if the path or version cannot be escaped.
    ///
    /// # Examples
    ///
    /// ```
    /// use modcache_fetch::{ModuleVersion, proxy::HttpProxy};
    ///
    /// let proxy = HttpProxy::new("https://proxy.example.test");
    /// let url = proxy.zip_url(&ModuleVersion::new("example.com/Foo", "v1.2.3"));
    /// assert_eq!(url.unwrap(), "https://proxy.example.test/example.com/!foo/@v/v1.2.3.zip");
    /// ```
    pub fn zip_url(&self, module: &ModuleVersion) -> Result<String, ModuleError> {
        Ok(format!(
            "{}/{}/@v/{}.zip",
            self.base,
            module.escaped_path()?,
            module.escaped_version()?
        ))
    }
}

impl ArchiveSource for HttpProxy {
    fn name(&self) -> String {
        self.base.clone()
    }

    fn fetch_zip(&self, module: &ModuleVersion, dest: &mut File) -> Result<(), SourceError> {
        let url = self.zip_url(module)?;
        debug!("downloading {url}");
        let response = self
            .agent
            .get(url.as_str())
            .call()
            .map_err(|err| self.map_ureq_error(module, &err))?;
        let within = copy_limited(response.into_body().as_reader(), dest, self.max_bytes)
            .map_err(|err| {
                warn!("download of {url} interrupted: {err}");
                SourceError::Failed {
                    source_name: self.name(),
                    reason: err.to_string(),
                }
            })?;
        if !within {
            warn!("download of {url} exceeds {} bytes", self.max_bytes);
            return Err(SourceError::Failed {
                source_name: self.name(),
                reason: format!("archive exceeds {} bytes", self.max_bytes),
            });
        }
        Ok(())
    }
}

/// Copy at most `limit` bytes of `reader` into `dest`.
///
/// Returns `false` when the reader held more than `limit` bytes; one byte
/// past the limit has then been written.
fn copy_limited(reader: impl Read, dest: &mut impl Write, limit: u64) -> io::Result<bool> {
    let copied = io::copy(&mut reader.take(limit.saturating_add(1)), dest)?;
    Ok(copied <= limit)
}

impl HttpProxy {
    fn map_ureq_error(&self, module: &ModuleVersion, err: &ureq::Error) -> SourceError {
        match err {
            ureq::Error::StatusCode(404 | 410) => SourceError::NotFound {
                source_name: self.name(),
                module: module.to_string(),
            },
            other => SourceError::Failed {
                source_name: self.name(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn source(name: &'static str, result: fn() -> Result<(), SourceError>) -> MockArchiveSource {
        let mut mock = MockArchiveSource::new();
        mock.expect_name().returning(move || name.to_owned());
        mock.expect_fetch_zip().returning(move |_, _| result());
        mock
    }

    fn not_found() -> Result<(), SourceError> {
        Err(SourceError::NotFound {
            source_name: "a".to_owned(),
            module: "example.com/foo@v1.2.3".to_owned(),
        })
    }

    fn failed() -> Result<(), SourceError> {
        Err(SourceError::Failed {
            source_name: "a".to_owned(),
            reason: "502 Bad Gateway".to_owned(),
        })
    }

    fn run(entries: &[SourceEntry]) -> (Result<(), SourceError>, Vec<String>) {
        let mut asked = Vec::new();
        let result = try_sources(entries, |source| {
            asked.push(source.name());
            let temp = tempfile::tempfile().expect("temp file");
            let mut dest = temp;
            source.fetch_zip(&ModuleVersion::new("example.com/foo", "v1.2.3"), &mut dest)
        });
        (result, asked)
    }

    #[rstest]
    #[case::comma("a,b", vec![("a", false), ("b", false)])]
    #[case::pipe("a|b", vec![("a", true), ("b", false)])]
    #[case::off_stops("a,off,b", vec![("a", false), ("off", false)])]
    #[case::empty_entries(" a ,, b/ ", vec![("a", false), ("b", false)])]
    fn parses_proxy_lists(#[case] list: &str, #[case] expected: Vec<(&str, bool)>) {
        let specs = parse_proxy_list(list).expect("valid list");
        let actual: Vec<(&str, bool)> = specs
            .iter()
            .map(|spec| (spec.url.as_str(), spec.fall_back_on_error))
            .collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn empty_proxy_list_is_rejected() {
        assert!(parse_proxy_list(" , ").is_err());
    }

    #[test]
    fn not_found_falls_through_comma() {
        let entries = [
            SourceEntry::new(Box::new(source("a", not_found))),
            SourceEntry::new(Box::new(source("b", || Ok(())))),
        ];

        let (result, asked) = run(&entries);

        assert!(result.is_ok());
        assert_eq!(asked, ["a", "b"]);
    }

    #[test]
    fn failure_stops_at_comma() {
        let entries = [
            SourceEntry::new(Box::new(source("a", failed))),
            SourceEntry::new(Box::new(source("b", || Ok(())))),
        ];

        let (result, asked) = run(&entries);

        assert!(matches!(result, Err(SourceError::Failed { .. })));
        assert_eq!(asked, ["a"]);
    }

    #[test]
    fn failure_falls_through_pipe() {
        let entries = [
            SourceEntry::falling_back_on_error(Box::new(source("a", failed))),
            SourceEntry::new(Box::new(source("b", || Ok(())))),
        ];

        let (result, asked) = run(&entries);

        assert!(result.is_ok());
        assert_eq!(asked, ["a", "b"]);
    }

    #[test]
    fn real_failure_is_preferred_over_not_found() {
        let entries = [
            SourceEntry::falling_back_on_error(Box::new(source("a", failed))),
            SourceEntry::new(Box::new(source("b", not_found))),
        ];

        let (result, _) = run(&entries);

        assert!(matches!(result, Err(SourceError::Failed { .. })));
    }

    #[test]
    fn unrecoverable_error_short_circuits() {
        let entries = [
            SourceEntry::falling_back_on_error(Box::new(source("a", || {
                Err(SourceError::Unrecoverable(io::Error::other("disk gone")))
            }))),
            SourceEntry::new(Box::new(source("b", || Ok(())))),
        ];

        let (result, asked) = run(&entries);

        assert!(matches!(result, Err(SourceError::Unrecoverable(_))));
        assert_eq!(asked, ["a"]);
    }

    #[test]
    fn off_disables_lookups() {
        let entries = sources_from_specs(
            &parse_proxy_list("off").expect("valid list"),
            DOWNLOAD_TIMEOUT,
        );

        let (result, _) = run(&entries);

        assert!(matches!(result, Err(SourceError::Disabled)));
    }

    #[test]
    fn zip_url_escapes_module() {
        let proxy = HttpProxy::new("https://proxy.example.test/");
        let url = proxy
            .zip_url(&ModuleVersion::new("github.com/BurntSushi/toml", "v1.0.0"))
            .expect("url");
        assert_eq!(
            url,
            "https://proxy.example.test/github.com/!burnt!sushi/toml/@v/v1.0.0.zip"
        );
    }

    #[rstest]
    #[case::under(9, true, 9)]
    #[case::exact(10, true, 10)]
    #[case::over(11, false, 11)]
    #[case::far_over(4096, false, 11)]
    fn copy_limited_stops_one_byte_past_the_limit(
        #[case] body: usize,
        #[case] within: bool,
        #[case] written: usize,
    ) {
        let mut dest = Vec::new();

        let result = copy_limited(&vec![7_u8; body][..], &mut dest, 10).expect("copy");

        assert_eq!(result, within);
        assert_eq!(dest.len(), written);
    }

    #[test]
    fn max_bytes_defaults_to_the_archive_limit() {
        let proxy = HttpProxy::new("https://proxy.example.test");
        assert_eq!(proxy.max_bytes, Limits::default().max_zip_file);
        assert_eq!(proxy.with_max_bytes(64).max_bytes, 64);
    }
}
