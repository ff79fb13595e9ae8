//! A security error ends the process with status 1 when aborting is on.
//!
//! The test re-runs its own binary with `MODCACHE_TEST_ABORT_BASE` set; the
//! child downloads a module whose ledger entry is forged and must exit.

mod support;

use modcache::{ModuleVersion, Session};
use modcache_fetch::proxy::SourceEntry;
use std::fs;
use std::path::Path;
use std::process::Command;

const BASE_VAR: &str = "MODCACHE_TEST_ABORT_BASE";
const TEST_NAME: &str = "security_error_exits_with_status_one";

fn download_forged(base: &Path) {
    let module = ModuleVersion::new("example.com/foo", "v1.2.3");
    fs::write(
        base.join("modules.sum"),
        format!("example.com/foo v1.2.3 {}\n", support::FORGED_HASH),
    )
    .expect("seed ledger");
    let config = modcache::CacheConfig {
        abort_on_security_error: true,
        ..support::offline_config(base)
    };
    let source = support::FixedSource::new(support::module_archive(
        module.path(),
        module.version(),
    ));
    let session = Session::with_sources(config, vec![SourceEntry::new(Box::new(source))])
        .expect("session");

    let result = session.download(&module);

    panic!("download returned instead of exiting: {:?}", result.err());
}

#[test]
fn security_error_exits_with_status_one() {
    if let Some(base) = std::env::var_os(BASE_VAR) {
        download_forged(Path::new(&base));
    }
    let temp = tempfile::tempdir().expect("temp dir");

    let output = Command::new(std::env::current_exe().expect("test binary"))
        .args(["--exact", TEST_NAME, "--nocapture", "--test-threads=1"])
        .env(BASE_VAR, temp.path())
        .output()
        .expect("run child");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(1), "{stderr}");
    assert!(stderr.contains("modcache: "), "{stderr}");
    assert!(stderr.contains(support::FORGED_HASH), "{stderr}");
}
