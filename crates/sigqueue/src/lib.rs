//! Lock-free hand-off of operating-system signals to ordinary threads.
//!
//! Signal handlers call [`SignalMailbox::send`], which only touches atomics
//! and a futex-backed [`Note`]. A single consumer drains the mailbox with
//! [`SignalMailbox::recv`]; [`Registry`] runs that consumer on a dispatcher
//! thread and fans signals out to channel subscriptions.

pub mod disposition;
pub mod mailbox;
pub mod note;
pub mod registry;

#[cfg(unix)]
pub use disposition::NativeDisposition;
pub use disposition::{Disposition, NoopDisposition};
pub use mailbox::{NSIG, SignalMailbox};
pub use note::Note;
pub use registry::{Registry, Subscription};

/// Write `msg` to standard error without allocating and abort.
///
/// Callable from signal handlers.
pub(crate) fn fatal(msg: &[u8]) -> ! {
    write_stderr(msg);
    std::process::abort()
}

#[cfg(unix)]
fn write_stderr(msg: &[u8]) {
    // SAFETY: `msg` is a valid buffer of `msg.len()` bytes. A failed write is
    // ignored because the process aborts next.
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
    }
}

#[cfg(not(unix))]
fn write_stderr(_msg: &[u8]) {}
