//! Checksum-verified module download cache.
//!
//! [`ModuleCache`] downloads module archives through a list of
//! [`proxy`] sources, verifies their hashes with a [`Verifier`] backed by a
//! [`Ledger`] and an optional checksum database, and extracts them into a
//! shared cache directory that may be used by several processes at once.

pub mod cache;
pub mod config;
pub mod dirhash;
pub mod error;
pub mod extraction;
pub mod ledger;
pub mod module;
pub mod once_map;
pub mod proxy;
pub mod semver;
pub mod sumdb;
pub mod verify;

pub use cache::{CacheState, ModuleCache};
pub use config::{CacheConfig, ConfigError};
pub use error::{FetchError, Result};
pub use ledger::{Ledger, LedgerError};
pub use module::ModuleVersion;
pub use verify::{MismatchOrigin, SecurityError, Verifier, VerifyError};
