//! File-system primitives shared by the module cache: atomic replacement,
//! advisory locks, removal of read-only trees, and marker-guarded targets
//! that survive a crash mid-update.

pub mod lockedfile;
pub mod marker;
pub mod renameio;
pub mod robust;

pub use lockedfile::LockedFile;
pub use marker::{MarkerState, RecoverableState, Transition};
