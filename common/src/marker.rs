//! Crash-recoverable materialisation of a file-system target.
//!
//! A [`RecoverableState`] pairs a target path with a zero-byte marker file.
//! The marker is written before the target is populated and removed only
//! once population has fully completed, so its presence is a durable record
//! that the target cannot be trusted. Any process that later finds the
//! marker may delete the target and redo the work, provided it holds the
//! lock guarding the target.

use crate::robust;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Observed state of a target guarded by a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    /// The target does not exist.
    Absent,
    /// The target exists but its marker is still present.
    Partial,
    /// The target exists and no marker is present.
    Complete,
}

/// A target path together with the marker guarding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverableState {
    target: PathBuf,
    marker: PathBuf,
}

impl RecoverableState {
    /// Pair `target` with `marker`.
    #[must_use]
    pub fn new(target: impl Into<PathBuf>, marker: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            marker: marker.into(),
        }
    }

    /// The guarded target.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// The marker file.
    #[must_use]
    pub fn marker(&self) -> &Path {
        &self.marker
    }

    /// Inspect the file system.
    ///
    /// # Errors
    ///
    /// Returns any error other than `NotFound` from inspecting the target or
    /// the marker.
    pub fn state(&self) -> io::Result<MarkerState> {
        if !exists(&self.target)? {
            return Ok(MarkerState::Absent);
        }
        if exists(&self.marker)? {
            Ok(MarkerState::Partial)
        } else {
            Ok(MarkerState::Complete)
        }
    }

    /// Write the marker, announcing that the target is about to be
    /// populated.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker or its parent directory cannot be
    /// created.
    pub fn begin(&self) -> io::Result<Transition<'_>> {
        if let Some(parent) = self.marker.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.marker, [])?;
        Ok(Transition { state: self })
    }
}

/// An in-progress population of a target. Dropping it without calling
/// [`Transition::commit`] or [`Transition::abort`] leaves the marker in
/// place, exactly as a crash would.
#[derive(Debug)]
#[must_use = "an unfinished transition leaves its marker behind"]
pub struct Transition<'a> {
    state: &'a RecoverableState,
}

impl Transition<'_> {
    /// Declare the target complete by removing the marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be removed.
    pub fn commit(self) -> io::Result<()> {
        remove_marker(&self.state.marker)
    }

    /// Remove the partially populated target. The marker is removed only if
    /// the target was removed, so a failed cleanup is still detected later.
    ///
    /// # Errors
    ///
    /// Returns the error from removing the target.
    pub fn abort(self) -> io::Result<()> {
        robust::remove_all(&self.state.target)?;
        remove_marker(&self.state.marker)
    }
}

fn remove_marker(marker: &Path) -> io::Result<()> {
    match fs::remove_file(marker) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn exists(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    struct Layout {
        _temp: tempfile::TempDir,
        state: RecoverableState,
    }

    #[fixture]
    fn layout() -> Layout {
        let temp = tempfile::tempdir().expect("temp dir");
        let state = RecoverableState::new(
            temp.path().join("example.com").join("foo@v1.2.3"),
            temp.path()
                .join("cache")
                .join("download")
                .join("v1.2.3.partial"),
        );
        Layout { _temp: temp, state }
    }

    #[rstest]
    fn missing_target_is_absent(layout: Layout) {
        assert_eq!(layout.state.state().expect("state"), MarkerState::Absent);
    }

    #[rstest]
    fn committed_target_is_complete(layout: Layout) {
        let transition = layout.state.begin().expect("begin");
        fs::create_dir_all(layout.state.target()).expect("populate");
        assert_eq!(layout.state.state().expect("state"), MarkerState::Partial);

        transition.commit().expect("commit");

        assert_eq!(layout.state.state().expect("state"), MarkerState::Complete);
        assert!(!layout.state.marker().exists());
    }

    #[rstest]
    fn dropped_transition_stays_partial(layout: Layout) {
        {
            let _transition = layout.state.begin().expect("begin");
            fs::create_dir_all(layout.state.target()).expect("populate");
        }
        assert_eq!(layout.state.state().expect("state"), MarkerState::Partial);
    }

    #[rstest]
    fn abort_removes_target_and_marker(layout: Layout) {
        let transition = layout.state.begin().expect("begin");
        fs::create_dir_all(layout.state.target().join("sub")).expect("populate");

        transition.abort().expect("abort");

        assert_eq!(layout.state.state().expect("state"), MarkerState::Absent);
        assert!(!layout.state.marker().exists());
    }
}
