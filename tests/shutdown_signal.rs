//! The ledger is flushed when a subscribed signal arrives.

mod support;

use modcache::{ModuleVersion, flush_on_signal};
use sigqueue::{Registry, SignalMailbox};
use std::fs;
use std::sync::Arc;

#[test]
fn termination_signal_flushes_the_ledger() {
    let temp = tempfile::tempdir().expect("temp dir");
    let module = ModuleVersion::new("example.com/foo", "v1.2.3");
    let session = Arc::new(support::serving_session(temp.path(), &module));
    session.download(&module).expect("download");
    let mailbox: &'static SignalMailbox = Box::leak(Box::new(SignalMailbox::new()));
    let registry: &'static Registry = Box::leak(Box::new(Registry::detached(mailbox)));

    let waiter = flush_on_signal(Arc::clone(&session), registry, &[15]).expect("watch signals");
    assert!(!mailbox.send(2));
    assert!(mailbox.send(15));

    assert_eq!(waiter.join().expect("shutdown thread"), Some(15));
    let ledger = fs::read_to_string(temp.path().join("modules.sum")).expect("read ledger");
    assert!(ledger.contains("example.com/foo v1.2.3 h1:"), "{ledger}");
    assert!(!mailbox.is_wanted(15));
}
