//! Checksum-verified module cache with signal-aware shutdown.
//!
//! [`Session`] assembles a [`modcache_fetch::ModuleCache`] from a
//! [`modcache_fetch::CacheConfig`], and [`shutdown::flush_on_signal`] uses
//! the [`sigqueue`] bridge to persist the ledger when the process is told to
//! stop.

pub mod session;
pub mod shutdown;

pub use modcache_fetch::{CacheConfig, ModuleVersion};
pub use session::{Session, SessionError};
pub use shutdown::flush_on_signal;
