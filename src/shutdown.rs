//! Flushing the ledger when the process is asked to stop.

use crate::session::Session;
use sigqueue::Registry;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Wait on a background thread for the first of `sigs`, then flush the
/// session's ledger and stop listening. The thread yields the signal it
/// saw, or `None` if the subscription closed first.
///
/// # Errors
///
/// Returns an error if the subscription or the thread cannot be started.
pub fn flush_on_signal(
    session: Arc<Session>,
    registry: &'static Registry,
    sigs: &[u32],
) -> io::Result<JoinHandle<Option<u32>>> {
    let subscription = registry.notify(sigs, 1)?;
    thread::Builder::new()
        .name("modcache-shutdown".to_owned())
        .spawn(move || {
            let sig = subscription.recv().ok();
            registry.stop(&subscription);
            if let Some(sig) = sig {
                log::debug!("signal {sig} received, flushing ledger");
                if let Err(err) = session.flush() {
                    log::error!("cannot flush ledger on signal {sig}: {err}");
                }
            }
            sig
        })
}
