//! One-shot sleep and wake-up event.
//!
//! A [`Note`] is cleared, slept on by exactly one thread and woken exactly
//! once. Waking is async-signal-safe: it is an atomic store followed, on
//! Linux, by a `futex` wake system call.

use crate::fatal;
use std::sync::atomic::{AtomicU32, Ordering};

/// A one-shot wake-up event.
#[derive(Debug, Default)]
pub struct Note {
    key: AtomicU32,
}

impl Note {
    /// A cleared note.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            key: AtomicU32::new(0),
        }
    }

    /// Reset the note so it can be slept on again.
    pub fn clear(&self) {
        self.key.store(0, Ordering::SeqCst);
    }

    /// Whether the note has been woken since it was last cleared.
    #[must_use]
    pub fn is_woken(&self) -> bool {
        self.key.load(Ordering::SeqCst) != 0
    }

    /// Wake the sleeper, if any. Waking a note twice without clearing it
    /// aborts the process.
    pub fn wakeup(&self) {
        if self.key.swap(1, Ordering::SeqCst) != 0 {
            fatal(b"notewakeup: double wakeup\n");
        }
        futex::wake(&self.key);
    }

    /// Block until the note is woken.
    pub fn sleep(&self) {
        while self.key.load(Ordering::SeqCst) == 0 {
            futex::wait(&self.key, 0);
        }
    }
}

#[cfg(target_os = "linux")]
mod futex {
    use std::ptr;
    use std::sync::atomic::AtomicU32;

    /// Sleep while `key` holds `expected`. Spurious returns are allowed.
    pub(super) fn wait(key: &AtomicU32, expected: u32) {
        // SAFETY: `key` is a live, aligned 32-bit atomic and a null timeout
        // means "wait indefinitely".
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                key.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                ptr::null::<libc::timespec>(),
            );
        }
    }

    pub(super) fn wake(key: &AtomicU32) {
        // SAFETY: `key` is a live, aligned 32-bit atomic.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                key.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1_i32,
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod futex {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;

    pub(super) fn wait(key: &AtomicU32, expected: u32) {
        if key.load(Ordering::SeqCst) == expected {
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub(super) fn wake(_key: &AtomicU32) {}
}
