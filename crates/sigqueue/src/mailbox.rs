//! The signal mailbox shared by the signal handler and its consumer.
//!
//! The producer side, [`SignalMailbox::send`], runs inside signal handlers
//! and therefore cannot block, allocate or take locks. It records the
//! signal in a pending bitset and then moves the mailbox through a small
//! state machine with compare-and-swap:
//!
//! * `Idle`: nothing new is pending and the consumer is not asleep.
//! * `Receiving`: the consumer is asleep on the note and nothing new is
//!   pending.
//! * `Sending`: new signals may be pending; the consumer must not sleep.
//! * `FixupPending`: a transient detour from `Receiving` back to `Idle`,
//!   used to run a hook on the consumer's thread while it waits.
//!
//! Concurrent senders and a receiver can cause unnecessary rechecks of the
//! pending set, never missed signals or deadlocks. A signal delivered again
//! before the consumer drains it is observed once.

use crate::disposition::Disposition;
use crate::fatal;
use crate::note::Note;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;

/// Number of supported signal numbers; valid numbers are `0..NSIG`.
pub const NSIG: u32 = 65;

const WORDS: usize = NSIG.div_ceil(32) as usize;

const IDLE: u32 = 0;
const RECEIVING: u32 = 1;
const SENDING: u32 = 2;
const FIXUP_PENDING: u32 = 3;

/// Hand-off point between signal handlers and one consumer thread.
pub struct SignalMailbox {
    note: Note,
    pending: [AtomicU32; WORDS],
    wanted: [AtomicU32; WORDS],
    ignored: [AtomicU32; WORDS],
    // Only touched by the consumer; atomics keep the type `Sync`.
    local: [AtomicU32; WORDS],
    state: AtomicU32,
    delivering: AtomicU32,
    in_use: AtomicBool,
    fixup: OnceLock<fn()>,
}

static GLOBAL: SignalMailbox = SignalMailbox::new();

impl Default for SignalMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalMailbox {
    /// An inactive mailbox with nothing wanted.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            note: Note::new(),
            pending: [const { AtomicU32::new(0) }; WORDS],
            wanted: [const { AtomicU32::new(0) }; WORDS],
            ignored: [const { AtomicU32::new(0) }; WORDS],
            local: [const { AtomicU32::new(0) }; WORDS],
            state: AtomicU32::new(IDLE),
            delivering: AtomicU32::new(0),
            in_use: AtomicBool::new(false),
            fixup: OnceLock::new(),
        }
    }

    /// The process-wide mailbox fed by installed signal handlers.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Queue `sig` for the consumer. Safe to call from a signal handler.
    ///
    /// Returns `false` when the signal cannot be delivered: the mailbox was
    /// never enabled, `sig` is out of range or nobody wants it. Returns
    /// `true` when the signal is queued, including when it already was.
    pub fn send(&self, sig: u32) -> bool {
        if !self.in_use.load(Ordering::SeqCst) || sig >= NSIG {
            return false;
        }
        let (word, bit) = locate(sig);

        self.delivering.fetch_add(1, Ordering::SeqCst);

        if self.wanted[word].load(Ordering::SeqCst) & bit == 0 {
            self.delivering.fetch_sub(1, Ordering::SeqCst);
            return false;
        }

        let mut mask = self.pending[word].load(Ordering::SeqCst);
        loop {
            if mask & bit != 0 {
                self.delivering.fetch_sub(1, Ordering::SeqCst);
                return true;
            }
            match self.pending[word].compare_exchange_weak(
                mask,
                mask | bit,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => mask = actual,
            }
        }

        loop {
            match self.state.load(Ordering::SeqCst) {
                IDLE => {
                    if self.transition(IDLE, SENDING) {
                        break;
                    }
                }
                SENDING => break,
                RECEIVING => {
                    if self.transition(RECEIVING, IDLE) {
                        self.note.wakeup();
                        break;
                    }
                }
                FIXUP_PENDING => thread::yield_now(),
                _ => fatal(b"sigsend: inconsistent state\n"),
            }
        }

        self.delivering.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Block until a signal is available and return its number.
    ///
    /// Signals queued together are returned in ascending numeric order.
    /// Only one thread may receive from a mailbox at a time.
    pub fn recv(&self) -> u32 {
        loop {
            if let Some(sig) = self.take_local() {
                return sig;
            }
            self.wait_for_pending();
            for (local, pending) in self.local.iter().zip(&self.pending) {
                local.store(pending.swap(0, Ordering::SeqCst), Ordering::Relaxed);
            }
        }
    }

    fn take_local(&self) -> Option<u32> {
        for (index, word) in (0_u32..).zip(&self.local) {
            let bits = word.load(Ordering::Relaxed);
            if bits != 0 {
                let offset = bits.trailing_zeros();
                word.store(bits & !(1 << offset), Ordering::Relaxed);
                return Some(index * 32 + offset);
            }
        }
        None
    }

    fn wait_for_pending(&self) {
        loop {
            match self.state.load(Ordering::SeqCst) {
                IDLE => {
                    if self.transition(IDLE, RECEIVING) {
                        self.note.sleep();
                        self.note.clear();
                        if !self.transition(FIXUP_PENDING, IDLE) {
                            return;
                        }
                        // Woken for a fixup: run it here, then sleep again.
                        if let Some(hook) = self.fixup.get() {
                            hook();
                        }
                    }
                }
                SENDING => {
                    if self.transition(SENDING, IDLE) {
                        return;
                    }
                }
                _ => fatal(b"signal_recv: inconsistent state\n"),
            }
        }
    }

    /// Wake a consumer asleep in [`SignalMailbox::recv`] so that it runs the
    /// fixup hook on its own thread before going back to sleep. Does
    /// nothing unless the consumer is asleep.
    pub fn prepare_for_fixup(&self) {
        if self.transition(RECEIVING, FIXUP_PENDING) {
            self.note.wakeup();
        }
    }

    /// Register the hook run by [`SignalMailbox::prepare_for_fixup`].
    /// Returns `false` if a hook was already registered.
    pub fn set_fixup_hook(&self, hook: fn()) -> bool {
        self.fixup.set(hook).is_ok()
    }

    /// Start delivering `sig` and install the handler through
    /// `disposition`. The first call activates the mailbox.
    ///
    /// Callers must serialise `enable`, `disable` and `ignore`.
    pub fn enable(&self, sig: u32, disposition: &dyn Disposition) {
        if !self.in_use.swap(true, Ordering::SeqCst) {
            self.note.clear();
        }
        if sig >= NSIG {
            return;
        }
        let (word, bit) = locate(sig);
        self.wanted[word].fetch_or(bit, Ordering::SeqCst);
        self.ignored[word].fetch_and(!bit, Ordering::SeqCst);
        disposition.enable(sig);
    }

    /// Stop delivering `sig` and restore its previous handling.
    pub fn disable(&self, sig: u32, disposition: &dyn Disposition) {
        if sig >= NSIG {
            return;
        }
        disposition.disable(sig);
        let (word, bit) = locate(sig);
        self.wanted[word].fetch_and(!bit, Ordering::SeqCst);
    }

    /// Stop delivering `sig` and have the process ignore it.
    pub fn ignore(&self, sig: u32, disposition: &dyn Disposition) {
        if sig >= NSIG {
            return;
        }
        disposition.ignore(sig);
        let (word, bit) = locate(sig);
        self.wanted[word].fetch_and(!bit, Ordering::SeqCst);
        self.ignored[word].fetch_or(bit, Ordering::SeqCst);
    }

    /// Record that `sig` was already ignored when the process started.
    pub fn init_ignored(&self, sig: u32) {
        if sig >= NSIG {
            return;
        }
        let (word, bit) = locate(sig);
        self.ignored[word].fetch_or(bit, Ordering::SeqCst);
    }

    /// Whether `sig` is ignored.
    #[must_use]
    pub fn is_ignored(&self, sig: u32) -> bool {
        if sig >= NSIG {
            return false;
        }
        let (word, bit) = locate(sig);
        self.ignored[word].load(Ordering::SeqCst) & bit != 0
    }

    /// Whether `sig` is currently delivered.
    #[must_use]
    pub fn is_wanted(&self, sig: u32) -> bool {
        if sig >= NSIG {
            return false;
        }
        let (word, bit) = locate(sig);
        self.wanted[word].load(Ordering::SeqCst) & bit != 0
    }

    /// Spin until no delivery is in flight and the consumer is asleep.
    ///
    /// Used after disabling a signal to make sure no delivery that read the
    /// old `wanted` bit is still on its way. Requires a consumer blocked in
    /// [`SignalMailbox::recv`]; there is no deadline.
    pub fn wait_until_idle(&self) {
        while self.delivering.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
        while self.state.load(Ordering::SeqCst) != RECEIVING {
            thread::yield_now();
        }
    }

    /// Return the mailbox to its initial, inactive state. Only for tests
    /// that reuse a mailbox with no consumer running.
    pub fn reset(&self) {
        self.in_use.store(false, Ordering::SeqCst);
        for words in [&self.pending, &self.wanted, &self.ignored, &self.local] {
            for word in words {
                word.store(0, Ordering::SeqCst);
            }
        }
        self.state.store(IDLE, Ordering::SeqCst);
        self.delivering.store(0, Ordering::SeqCst);
        self.note.clear();
    }

    fn transition(&self, from: u32, to: u32) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

const fn locate(sig: u32) -> (usize, u32) {
    ((sig / 32) as usize, 1 << (sig % 32))
}

#[cfg(test)]
#[path = "mailbox_tests.rs"]
mod tests;
