//! The checksum ledger: a persistent record of trusted module hashes.
//!
//! The ledger file holds one `path version hash` line per entry. It is read
//! lazily on first use and rewritten by [`Ledger::write`], which merges the
//! hashes verified during this session into whatever is on disk at that
//! moment, so concurrent edits by other processes survive.
//!
//! Each `(module, hash)` pair carries a status: `used` when this session
//! relied on the entry and `dirty` when this session added it (or scheduled
//! it for removal). Entries that were already on disk and untouched are
//! always written back.

use crate::dirhash::is_strong;
use crate::module::ModuleVersion;
use log::{debug, warn};
use modcache_common::lockedfile;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Hash of an empty manifest that older toolchains recorded by mistake.
/// Lines carrying it are dropped on read.
pub const EMPTY_GO_MOD_HASH: &str = "h1:G7mAYYxgmS0lVkHyy2hEOLQCFB0DlQFTMLWggykrydY=";

/// Errors raised while loading or updating the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A line does not have exactly three fields.
    #[error("malformed ledger:\n{}:{line}: wrong number of fields {fields}", file.display())]
    Malformed {
        /// The ledger file.
        file: PathBuf,
        /// One-based line number.
        line: usize,
        /// Number of fields found on the line.
        fields: usize,
    },

    /// The ledger file exists but could not be read.
    #[error("reading ledger {}", file.display())]
    Read {
        /// The ledger file.
        file: PathBuf,
        /// The underlying failure.
        #[source]
        source: io::Error,
    },

    /// The ledger file could not be rewritten.
    #[error("updating ledger")]
    Update(#[from] io::Error),

    /// The file gained a conflicting strong hash while this session held a
    /// different one.
    #[error("verifying {module}: ledger records {recorded} but this session verified {hash}")]
    Conflict {
        /// The affected module version.
        module: String,
        /// Hash found in the ledger file.
        recorded: String,
        /// Hash verified by this session.
        hash: String,
    },
}

impl Clone for LedgerError {
    fn clone(&self) -> Self {
        match self {
            Self::Malformed { file, line, fields } => Self::Malformed {
                file: file.clone(),
                line: *line,
                fields: *fields,
            },
            // Lossy: io::Error is rebuilt from its kind and message.
            Self::Read { file, source } => Self::Read {
                file: file.clone(),
                source: io::Error::new(source.kind(), source.to_string()),
            },
            Self::Update(source) => Self::Update(io::Error::new(source.kind(), source.to_string())),
            Self::Conflict {
                module,
                recorded,
                hash,
            } => Self::Conflict {
                module: module.clone(),
                recorded: recorded.clone(),
                hash: hash.clone(),
            },
        }
    }
}

/// What the ledger knows about a downloaded hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// No ledger file is configured.
    Disabled,
    /// The exact hash is recorded.
    Known,
    /// Nothing strong is recorded for the module.
    Unknown,
    /// A different strong hash is recorded.
    Conflict(Conflict),
}

/// A strong hash on record that disagrees with a downloaded one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// The hash on record.
    pub recorded: String,
}

#[derive(Debug, Default, Clone, Copy)]
struct SumStatus {
    used: bool,
    dirty: bool,
}

type Entries = HashMap<ModuleVersion, Vec<String>>;

#[derive(Debug, Default)]
struct LedgerState {
    /// `None` until the file has been read this session.
    entries: Option<Entries>,
    status: HashMap<(ModuleVersion, String), SumStatus>,
    overwrite: bool,
}

/// Process-scoped ledger state guarding a single ledger file.
#[derive(Debug, Default)]
pub struct Ledger {
    file: Option<PathBuf>,
    state: Mutex<LedgerState>,
}

impl Ledger {
    /// A ledger backed by `file`, read on first use.
    #[must_use]
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(file.into()),
            state: Mutex::default(),
        }
    }

    /// A ledger that records nothing and never touches the disk.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// The backing file, if any.
    #[must_use]
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Name used for this ledger in mismatch reports.
    #[must_use]
    pub fn name(&self) -> String {
        self.file
            .as_deref()
            .and_then(Path::file_name)
            .map_or_else(|| "ledger".to_owned(), |name| name.to_string_lossy().into_owned())
    }

    /// Consult the ledger for `hash`, marking the pair used unless it
    /// conflicts with a recorded strong hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger file cannot be loaded.
    pub fn check(&self, module: &ModuleVersion, hash: &str) -> Result<Lookup, LedgerError> {
        let mut state = self.lock();
        if !self.init_locked(&mut state)? {
            return Ok(Lookup::Disabled);
        }
        let known = match have_locked(&state, module, hash) {
            Ok(known) => known,
            Err(conflict) => return Ok(Lookup::Conflict(conflict)),
        };
        state
            .status
            .entry((module.clone(), hash.to_owned()))
            .or_default()
            .used = true;
        Ok(if known { Lookup::Known } else { Lookup::Unknown })
    }

    /// Stage `hash` as a verified, unflushed entry for `module`.
    ///
    /// # Errors
    ///
    /// Returns the recorded hash when a different strong hash was added for
    /// `module` since it was checked.
    pub fn record(&self, module: &ModuleVersion, hash: &str) -> Result<(), Conflict> {
        let mut state = self.lock();
        if state.entries.is_none() {
            return Ok(());
        }
        add_locked(&mut state, self.file.as_deref(), module, hash)?;
        let status = state
            .status
            .entry((module.clone(), hash.to_owned()))
            .or_default();
        status.used = true;
        status.dirty = true;
        Ok(())
    }

    /// Whether the ledger holds a strong hash for `module` that is not
    /// merely staged awaiting a flush.
    #[must_use]
    pub fn have_sum(&self, module: &ModuleVersion) -> bool {
        let mut state = self.lock();
        match self.init_locked(&mut state) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => {
                debug!("ledger unavailable: {err}");
                return false;
            }
        }
        state
            .entries
            .as_ref()
            .and_then(|entries| entries.get(module))
            .is_some_and(|hashes| {
                hashes.iter().any(|hash| {
                    is_strong(hash)
                        && !state
                            .status
                            .get(&(module.clone(), hash.clone()))
                            .is_some_and(|status| status.dirty)
                })
            })
    }

    /// Hashes currently recorded for `module`, loading the file if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger file cannot be loaded.
    pub fn sums(&self, module: &ModuleVersion) -> Result<Vec<String>, LedgerError> {
        let mut state = self.lock();
        self.init_locked(&mut state)?;
        Ok(state
            .entries
            .as_ref()
            .and_then(|entries| entries.get(module))
            .cloned()
            .unwrap_or_default())
    }

    /// Modules with at least one hash used this session.
    #[must_use]
    pub fn used_modules(&self) -> HashSet<ModuleVersion> {
        self.lock()
            .status
            .iter()
            .filter(|(_, status)| status.used)
            .map(|((module, _), _)| module.clone())
            .collect()
    }

    /// Flush staged entries to the ledger file.
    ///
    /// Does nothing unless the file was read this session and some staged
    /// change would alter it. Hashes staged for modules outside `keep` are
    /// discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be re-read, parsed, or written.
    pub fn write(&self, keep: &HashSet<ModuleVersion>) -> Result<(), LedgerError> {
        let mut state = self.lock();
        let Some(file) = self.file.as_deref() else {
            return Ok(());
        };
        if state.entries.is_none() || !needs_write(&state, keep) {
            return Ok(());
        }
        lockedfile::transform(file, |data| -> Result<Vec<u8>, LedgerError> {
            if !state.overwrite {
                reconcile(&mut state, file, data)?;
            }
            Ok(render(&state, keep))
        })?;
        debug!("updated ledger {}", file.display());
        state.status.clear();
        state.overwrite = false;
        Ok(())
    }

    /// Schedule every entry for modules outside `keep` for removal at the
    /// next [`Ledger::write`].
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger file cannot be loaded.
    pub fn trim(&self, keep: &HashSet<ModuleVersion>) -> Result<(), LedgerError> {
        let mut state = self.lock();
        if !self.init_locked(&mut state)? {
            return Ok(());
        }
        let doomed: Vec<(ModuleVersion, String)> = state
            .entries
            .iter()
            .flatten()
            .filter(|(module, _)| !keep.contains(*module))
            .flat_map(|(module, hashes)| {
                hashes
                    .iter()
                    .map(move |hash| (module.clone(), hash.clone()))
            })
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }
        for key in doomed {
            state.status.insert(
                key,
                SumStatus {
                    used: false,
                    dirty: true,
                },
            );
        }
        state.overwrite = true;
        Ok(())
    }

    /// Forget everything loaded or staged; the file is read again on next
    /// use.
    pub fn reset(&self) {
        *self.lock() = LedgerState::default();
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the file on first use. Returns whether the ledger is enabled.
    fn init_locked(&self, state: &mut LedgerState) -> Result<bool, LedgerError> {
        let Some(file) = self.file.as_deref() else {
            return Ok(false);
        };
        if state.entries.is_some() {
            return Ok(true);
        }
        let data = match lockedfile::read(file) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(LedgerError::Read {
                    file: file.to_path_buf(),
                    source,
                });
            }
        };
        let mut entries = Entries::new();
        parse(file, &data, &mut entries)?;
        debug!(
            "loaded {} ledger keys from {}",
            entries.len(),
            file.display()
        );
        state.entries = Some(entries);
        Ok(true)
    }
}

/// Parse ledger text into `dst`, dropping the legacy empty-manifest hash.
fn parse(file: &Path, data: &[u8], dst: &mut Entries) -> Result<(), LedgerError> {
    let text = String::from_utf8_lossy(data);
    for (index, line) in text.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [] => {}
            [_, _, hash] if *hash == EMPTY_GO_MOD_HASH => {}
            [path, version, hash] => dst
                .entry(ModuleVersion::new(*path, *version))
                .or_default()
                .push((*hash).to_owned()),
            _ => {
                return Err(LedgerError::Malformed {
                    file: file.to_path_buf(),
                    line: index + 1,
                    fields: fields.len(),
                });
            }
        }
    }
    Ok(())
}

fn have_locked(state: &LedgerState, module: &ModuleVersion, hash: &str) -> Result<bool, Conflict> {
    let recorded = state
        .entries
        .as_ref()
        .and_then(|entries| entries.get(module))
        .map_or(&[][..], Vec::as_slice);
    for existing in recorded {
        if existing == hash {
            return Ok(true);
        }
        if is_strong(existing) {
            return Err(Conflict {
                recorded: existing.clone(),
            });
        }
    }
    Ok(false)
}

fn add_locked(
    state: &mut LedgerState,
    file: Option<&Path>,
    module: &ModuleVersion,
    hash: &str,
) -> Result<(), Conflict> {
    if have_locked(state, module, hash)? {
        return Ok(());
    }
    let Some(entries) = state.entries.as_mut() else {
        return Ok(());
    };
    let hashes = entries.entry(module.clone()).or_default();
    if !hashes.is_empty() {
        warn!(
            "verifying {module}: unknown hashes in {}: {}; adding {hash}\n\n\
             SECURITY WARNING\n\
             The ledger records this module with a hash algorithm that is not recognised.\n\
             The existing entries are kept, but they were not checked.",
            file.map_or_else(|| "ledger".to_owned(), |path| path.display().to_string()),
            hashes.join(", ")
        );
    }
    hashes.push(hash.to_owned());
    Ok(())
}

fn needs_write(state: &LedgerState, keep: &HashSet<ModuleVersion>) -> bool {
    state
        .status
        .iter()
        .any(|((module, _), status)| status.dirty && (!status.used || keep.contains(module)))
}

/// Replace the in-memory entries with the file's current contents, then
/// re-add every hash this session relied on.
fn reconcile(state: &mut LedgerState, file: &Path, data: &[u8]) -> Result<(), LedgerError> {
    let mut fresh = Entries::new();
    parse(file, data, &mut fresh)?;
    state.entries = Some(fresh);
    let mut used: Vec<(ModuleVersion, String)> = state
        .status
        .iter()
        .filter(|(_, status)| status.used)
        .map(|(key, _)| key.clone())
        .collect();
    used.sort();
    for (module, hash) in used {
        add_locked(state, Some(file), &module, &hash).map_err(|conflict| {
            LedgerError::Conflict {
                module: module.to_string(),
                recorded: conflict.recorded,
                hash: hash.clone(),
            }
        })?;
    }
    Ok(())
}

fn render(state: &LedgerState, keep: &HashSet<ModuleVersion>) -> Vec<u8> {
    let Some(entries) = state.entries.as_ref() else {
        return Vec::new();
    };
    let mut modules: Vec<&ModuleVersion> = entries.keys().collect();
    modules.sort();
    let mut out = String::new();
    for module in modules {
        let mut hashes = entries.get(module).cloned().unwrap_or_default();
        hashes.sort();
        hashes.dedup();
        for hash in hashes {
            let status = state
                .status
                .get(&(module.clone(), hash.clone()))
                .copied()
                .unwrap_or_default();
            if !status.dirty || (status.used && keep.contains(module)) {
                let _ = writeln!(out, "{} {} {hash}", module.path(), module.version());
            }
        }
    }
    out.into_bytes()
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
