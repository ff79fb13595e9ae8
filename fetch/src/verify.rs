//! Checksum verification against the ledger and the checksum database.
//!
//! A downloaded hash is accepted when the ledger already records it.
//! Otherwise, unless the module is exempt, the checksum database is asked;
//! its answer may confirm the hash, contradict it, or say nothing. Any
//! contradiction, from either authority, is a [`SecurityError`]: the content
//! may have been tampered with and must not be used.

use crate::dirhash::{self, HashError};
use crate::ledger::{Ledger, LedgerError, Lookup};
use crate::module::ModuleVersion;
use crate::sumdb::{ChecksumDatabase, PrefixPatterns, SumDbError};
use log::debug;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// The authority a downloaded hash disagreed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchOrigin {
    /// The local ledger file.
    Ledger,
    /// The remote checksum database.
    Database,
}

impl fmt::Display for MismatchOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subject = match self {
            Self::Ledger => "an earlier download recorded in the ledger",
            Self::Database => "the one reported by the checksum database",
        };
        write!(
            f,
            "SECURITY ERROR\n\
             This download does NOT match {subject}.\n\
             The content may have been replaced at its origin, or the download\n\
             may have been intercepted and tampered with."
        )
    }
}

/// A downloaded hash contradicts a trusted one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "verifying {module}: checksum mismatch\n\tdownloaded: {downloaded}\n\t{authority}: {recorded}\n\n{origin}"
)]
pub struct SecurityError {
    /// Which authority disagreed.
    pub origin: MismatchOrigin,
    /// The module version being verified.
    pub module: String,
    /// Hash of the downloaded content.
    pub downloaded: String,
    /// Name of the ledger file or database.
    pub authority: String,
    /// Hash the authority holds.
    pub recorded: String,
}

/// Errors arising from checksum verification.
#[derive(Debug, Clone, Error)]
pub enum VerifyError {
    /// The ledger could not be loaded.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The checksum database could not be consulted.
    #[error("verifying {module}: {noun} lookup failed")]
    Database {
        /// The module version being verified.
        module: String,
        /// `module` or `go.mod`, naming what was verified.
        noun: &'static str,
        /// The lookup failure.
        #[source]
        source: SumDbError,
    },

    /// The downloaded content contradicts a trusted hash.
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// The manifest could not be hashed.
    #[error(transparent)]
    Hash(#[from] HashError),
}

impl VerifyError {
    /// Whether this error signals possible tampering.
    #[must_use]
    pub const fn is_security(&self) -> bool {
        matches!(self, Self::Security(_))
    }
}

/// Verifies hashes against a ledger and, optionally, a checksum database.
pub struct Verifier {
    ledger: Arc<Ledger>,
    database: Option<Arc<dyn ChecksumDatabase>>,
    exempt: PrefixPatterns,
}

impl Verifier {
    /// A verifier that consults only `ledger`.
    #[must_use]
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            database: None,
            exempt: PrefixPatterns::default(),
        }
    }

    /// Also consult `database` for modules the ledger does not know.
    #[must_use]
    pub fn with_database(mut self, database: Arc<dyn ChecksumDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    /// Never consult the database for module paths matching `exempt`.
    #[must_use]
    pub fn with_exemptions(mut self, exempt: PrefixPatterns) -> Self {
        self.exempt = exempt;
        self
    }

    /// The ledger this verifier records into.
    #[must_use]
    pub const fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Whether `module` would be checked against the database.
    #[must_use]
    pub fn uses_database(&self, module: &ModuleVersion) -> bool {
        self.database.is_some() && !self.exempt.matches(module.path())
    }

    /// Verify `hash` as the checksum of `module` and stage it in the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Security`] when the ledger or the database
    /// holds a different hash, and other variants when an authority cannot
    /// be consulted.
    pub fn check_mod_sum(&self, module: &ModuleVersion, hash: &str) -> Result<(), VerifyError> {
        let lookup = self.ledger.check(module, hash)?;
        match &lookup {
            Lookup::Known => return Ok(()),
            Lookup::Conflict(conflict) => {
                return Err(self.ledger_mismatch(module, hash, &conflict.recorded));
            }
            Lookup::Disabled | Lookup::Unknown => {}
        }
        if self.uses_database(module) {
            self.check_database(module, hash)?;
        }
        if lookup == Lookup::Unknown {
            self.ledger
                .record(module, hash)
                .map_err(|conflict| self.ledger_mismatch(module, hash, &conflict.recorded))?;
        }
        Ok(())
    }

    /// Verify a manifest's contents under the `/go.mod` key for its version.
    ///
    /// # Errors
    ///
    /// As for [`Verifier::check_mod_sum`].
    pub fn check_go_mod(&self, path: &str, version: &str, data: &[u8]) -> Result<(), VerifyError> {
        let hash = dirhash::go_mod_sum(data)?;
        self.check_mod_sum(&ModuleVersion::new(path, version).go_mod(), &hash)
    }

    fn check_database(&self, module: &ModuleVersion, hash: &str) -> Result<(), VerifyError> {
        let Some(database) = self.database.as_deref() else {
            return Ok(());
        };
        let lines = match database.lookup(module) {
            Ok(lines) => lines,
            Err(SumDbError::NotFound { url }) => {
                debug!("{url} has no record of {module}");
                return Ok(());
            }
            Err(source) => {
                return Err(VerifyError::Database {
                    module: module.without_suffix().to_string(),
                    noun: if module.is_go_mod() { "go.mod" } else { "module" },
                    source,
                });
            }
        };
        let have = format!("{} {} {hash}", module.path(), module.version());
        let prefix = format!("{} {} ", module.path(), module.version());
        for line in &lines {
            if *line == have {
                return Ok(());
            }
            if let Some(recorded) = line.strip_prefix(prefix.as_str())
                && dirhash::is_strong(recorded)
            {
                return Err(SecurityError {
                    origin: MismatchOrigin::Database,
                    module: module.to_string(),
                    downloaded: hash.to_owned(),
                    authority: database.name(),
                    recorded: recorded.to_owned(),
                }
                .into());
            }
        }
        debug!("{} returned no line for {module}", database.name());
        Ok(())
    }

    fn ledger_mismatch(&self, module: &ModuleVersion, hash: &str, recorded: &str) -> VerifyError {
        SecurityError {
            origin: MismatchOrigin::Ledger,
            module: module.to_string(),
            downloaded: hash.to_owned(),
            authority: self.ledger.name(),
            recorded: recorded.to_owned(),
        }
        .into()
    }
}
