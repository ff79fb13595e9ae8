//! How the process handles a signal at the operating-system level.

#[cfg(unix)]
use std::collections::HashMap;
#[cfg(unix)]
use std::sync::{Mutex, PoisonError};

/// Installs and removes the process-level handler for a signal.
#[cfg_attr(test, mockall::automock)]
pub trait Disposition: Send + Sync {
    /// Route `sig` to the mailbox.
    fn enable(&self, sig: u32);
    /// Restore the handling `sig` had before [`Disposition::enable`].
    fn disable(&self, sig: u32);
    /// Have the process ignore `sig`.
    fn ignore(&self, sig: u32);
}

/// Leaves the operating system alone. Signals reach the mailbox only
/// through explicit [`crate::SignalMailbox::send`] calls.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopDisposition;

impl Disposition for NoopDisposition {
    fn enable(&self, _sig: u32) {}
    fn disable(&self, _sig: u32) {}
    fn ignore(&self, _sig: u32) {}
}

/// Installs `sigaction` handlers that feed [`crate::SignalMailbox::global`].
#[cfg(unix)]
#[derive(Default)]
pub struct NativeDisposition {
    saved: Mutex<HashMap<u32, libc::sigaction>>,
}

#[cfg(unix)]
extern "C" fn deliver(sig: libc::c_int) {
    if let Ok(sig) = u32::try_from(sig) {
        crate::SignalMailbox::global().send(sig);
    }
}

#[cfg(unix)]
impl NativeDisposition {
    /// A disposition with no handlers installed yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the process inherited `sig` as ignored.
    #[must_use]
    pub fn initially_ignored(sig: u32) -> bool {
        let Ok(signum) = libc::c_int::try_from(sig) else {
            return false;
        };
        // SAFETY: a null new action only queries the current one.
        unsafe {
            let mut current: libc::sigaction = std::mem::zeroed();
            libc::sigaction(signum, std::ptr::null(), &raw mut current) == 0
                && current.sa_sigaction == libc::SIG_IGN
        }
    }

    fn install(&self, sig: u32, handler: libc::sighandler_t) -> Option<libc::sigaction> {
        let Ok(signum) = libc::c_int::try_from(sig) else {
            log::warn!("signal {sig} is out of range for this platform");
            return None;
        };
        // SAFETY: both structs are plain C data; zeroed is a valid initial
        // value and `sigaction` only reads `action` and writes `previous`.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&raw mut action.sa_mask);
            let mut previous: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(signum, &raw const action, &raw mut previous) != 0 {
                log::warn!(
                    "cannot change the handler for signal {sig}: {}",
                    std::io::Error::last_os_error()
                );
                return None;
            }
            Some(previous)
        }
    }

    fn restore(sig: u32, previous: &libc::sigaction) {
        let Ok(signum) = libc::c_int::try_from(sig) else {
            return;
        };
        // SAFETY: `previous` was filled in by an earlier `sigaction` call.
        let status = unsafe { libc::sigaction(signum, previous, std::ptr::null_mut()) };
        if status != 0 {
            log::warn!(
                "cannot restore the handler for signal {sig}: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(unix)]
impl Disposition for NativeDisposition {
    fn enable(&self, sig: u32) {
        let mut saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        if saved.contains_key(&sig) {
            return;
        }
        let handler = deliver as extern "C" fn(libc::c_int) as libc::sighandler_t;
        if let Some(previous) = self.install(sig, handler) {
            log::debug!("routing signal {sig} to the mailbox");
            saved.insert(sig, previous);
        }
    }

    fn disable(&self, sig: u32) {
        let previous = self
            .saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sig);
        match previous {
            Some(previous) => Self::restore(sig, &previous),
            None => {
                self.install(sig, libc::SIG_DFL);
            }
        }
    }

    fn ignore(&self, sig: u32) {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sig);
        self.install(sig, libc::SIG_IGN);
    }
}
