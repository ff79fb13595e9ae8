//! Subscriptions that fan signals out from the mailbox to channels.
//!
//! A [`Registry`] owns the single consumer of its mailbox: a dispatcher
//! thread started on the first [`Registry::notify`]. Each subscription has a
//! bounded channel; a signal arriving while a channel is full is dropped for
//! that subscriber, so a capacity of at least one is advisable.

use crate::disposition::{Disposition, NoopDisposition};
use crate::mailbox::{NSIG, SignalMailbox};
use std::collections::HashMap;
use std::io;
use std::sync::mpsc::{self, Receiver, RecvError, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

/// A set of signal numbers below [`NSIG`].
type SignalSet = u128;

fn signal_set(sigs: &[u32]) -> SignalSet {
    if sigs.is_empty() {
        return (1..NSIG).fold(0, |set, sig| set | (1 << sig));
    }
    sigs.iter()
        .filter(|&&sig| sig < NSIG)
        .fold(0, |set, &sig| set | (1 << sig))
}

fn members(set: SignalSet) -> impl Iterator<Item = u32> {
    (0..NSIG).filter(move |sig| set & (1 << sig) != 0)
}

struct Subscriber {
    sigs: SignalSet,
    tx: SyncSender<u32>,
}

#[derive(Default)]
struct Handlers {
    active: HashMap<u64, Subscriber>,
    // Stopped subscribers still receive until the mailbox is idle.
    stopping: HashMap<u64, Subscriber>,
    refs: HashMap<u32, usize>,
    next_id: u64,
    dispatching: bool,
}

struct Shared {
    mailbox: &'static SignalMailbox,
    disposition: Box<dyn Disposition>,
    handlers: Mutex<Handlers>,
}

impl Shared {
    fn handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, sig: u32) {
        let handlers = self.handlers();
        let bit: SignalSet = 1 << sig;
        for (id, subscriber) in handlers.active.iter().chain(&handlers.stopping) {
            if subscriber.sigs & bit != 0 && subscriber.tx.try_send(sig).is_err() {
                log::trace!("dropping signal {sig} for subscription {id}");
            }
        }
    }
}

/// Routes signals from a mailbox to subscribers.
pub struct Registry {
    shared: Arc<Shared>,
}

/// The receiving end of [`Registry::notify`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: Receiver<u32>,
}

impl Subscription {
    /// Identifier unique within the registry that issued it.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until a signal arrives. Fails once the subscription is stopped
    /// and drained.
    pub fn recv(&self) -> Result<u32, RecvError> {
        self.rx.recv()
    }

    /// Like [`Subscription::recv`] with a deadline.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<u32, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Take a signal if one is already queued.
    pub fn try_recv(&self) -> Result<u32, TryRecvError> {
        self.rx.try_recv()
    }
}

impl Registry {
    /// A registry over `mailbox` that installs handlers via `disposition`.
    #[must_use]
    pub fn new(mailbox: &'static SignalMailbox, disposition: Box<dyn Disposition>) -> Self {
        Self {
            shared: Arc::new(Shared {
                mailbox,
                disposition,
                handlers: Mutex::new(Handlers::default()),
            }),
        }
    }

    /// The process-wide registry over [`SignalMailbox::global`].
    ///
    /// On Unix it installs real signal handlers and seeds the ignored set
    /// with the signals the process inherited as ignored.
    pub fn native() -> &'static Self {
        static NATIVE: OnceLock<Registry> = OnceLock::new();
        NATIVE.get_or_init(|| {
            let mailbox = SignalMailbox::global();
            #[cfg(unix)]
            {
                for sig in 1..NSIG {
                    if crate::disposition::NativeDisposition::initially_ignored(sig) {
                        mailbox.init_ignored(sig);
                    }
                }
                Self::new(
                    mailbox,
                    Box::new(crate::disposition::NativeDisposition::new()),
                )
            }
            #[cfg(not(unix))]
            {
                Self::new(mailbox, Box::new(NoopDisposition))
            }
        })
    }

    /// A registry that never touches the operating system; signals arrive
    /// only through [`SignalMailbox::send`].
    #[must_use]
    pub fn detached(mailbox: &'static SignalMailbox) -> Self {
        Self::new(mailbox, Box::new(NoopDisposition))
    }

    /// Subscribe to `sigs`, or to every signal when `sigs` is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the dispatcher thread cannot be started.
    pub fn notify(&self, sigs: &[u32], capacity: usize) -> io::Result<Subscription> {
        let set = signal_set(sigs);
        let (tx, rx) = mpsc::sync_channel(capacity);
        let mut handlers = self.shared.handlers();
        self.start_dispatcher(&mut handlers)?;

        let id = handlers.next_id;
        handlers.next_id += 1;
        for sig in members(set) {
            let refs = handlers.refs.entry(sig).or_insert(0);
            if *refs == 0 {
                self.shared
                    .mailbox
                    .enable(sig, self.shared.disposition.as_ref());
            }
            *refs += 1;
        }
        handlers.active.insert(id, Subscriber { sigs: set, tx });
        log::debug!("subscription {id} registered");
        Ok(Subscription { id, rx })
    }

    fn start_dispatcher(&self, handlers: &mut Handlers) -> io::Result<()> {
        if handlers.dispatching {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("sigqueue-dispatch".to_owned())
            .spawn(move || {
                loop {
                    let sig = shared.mailbox.recv();
                    shared.dispatch(sig);
                }
            })?;
        handlers.dispatching = true;
        Ok(())
    }

    /// Stop delivering to `subscription`.
    ///
    /// Signals no other subscription wants are disabled. When this returns,
    /// no delivery that was in flight can still reach the subscription.
    pub fn stop(&self, subscription: &Subscription) {
        let id = subscription.id;
        {
            let mut handlers = self.shared.handlers();
            let Some(subscriber) = handlers.active.remove(&id) else {
                return;
            };
            for sig in members(subscriber.sigs) {
                self.release(&mut handlers, sig);
            }
            handlers.stopping.insert(id, subscriber);
        }

        self.shared.mailbox.wait_until_idle();

        self.shared.handlers().stopping.remove(&id);
        log::debug!("subscription {id} stopped");
    }

    fn release(&self, handlers: &mut Handlers, sig: u32) {
        if let Some(refs) = handlers.refs.get_mut(&sig) {
            *refs = refs.saturating_sub(1);
            if *refs == 0 {
                handlers.refs.remove(&sig);
                self.shared
                    .mailbox
                    .disable(sig, self.shared.disposition.as_ref());
            }
        }
    }

    /// Ignore `sigs`, or every signal when `sigs` is empty. Subscriptions
    /// stop receiving them.
    pub fn ignore(&self, sigs: &[u32]) {
        self.cancel(sigs, |mailbox, sig, disposition| {
            mailbox.ignore(sig, disposition);
        });
    }

    /// Restore the default handling of `sigs`, or of every signal when
    /// `sigs` is empty. Subscriptions stop receiving them.
    pub fn reset(&self, sigs: &[u32]) {
        self.cancel(sigs, |mailbox, sig, disposition| {
            mailbox.disable(sig, disposition);
        });
    }

    fn cancel(&self, sigs: &[u32], action: impl Fn(&SignalMailbox, u32, &dyn Disposition)) {
        let set = signal_set(sigs);
        let mut handlers = self.shared.handlers();
        for subscriber in handlers.active.values_mut() {
            subscriber.sigs &= !set;
        }
        for sig in members(set) {
            handlers.refs.remove(&sig);
            action(self.shared.mailbox, sig, self.shared.disposition.as_ref());
        }
    }

    /// Whether `sig` is currently ignored.
    #[must_use]
    pub fn ignored(&self, sig: u32) -> bool {
        self.shared.mailbox.is_ignored(sig)
    }
}
