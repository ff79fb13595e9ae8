//! Security errors are logged before they are returned or acted on.

mod support;

use logtest::Logger;
use modcache::ModuleVersion;
use std::fs;

#[test]
fn ledger_mismatch_is_logged_as_an_error() {
    let mut logger = Logger::start();
    let temp = tempfile::tempdir().expect("temp dir");
    fs::write(
        temp.path().join("modules.sum"),
        format!("example.com/foo v1.2.3 {}\n", support::FORGED_HASH),
    )
    .expect("seed ledger");
    let module = ModuleVersion::new("example.com/foo", "v1.2.3");
    let session = support::serving_session(temp.path(), &module);

    let err = session.download(&module).expect_err("mismatch");

    assert!(err.is_fatal());
    let mut logged = false;
    while let Some(record) = logger.pop() {
        if record.level() == log::Level::Error {
            let message = record.args().to_string();
            assert!(message.contains("SECURITY ERROR"), "{message}");
            assert!(message.contains(support::FORGED_HASH), "{message}");
            logged = true;
        }
    }
    assert!(logged, "expected the mismatch to be logged");
}
