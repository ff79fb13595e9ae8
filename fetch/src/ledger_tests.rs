use super::*;
use rstest::{fixture, rstest};
use std::fs;

const HASH_A: &str = "h1:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
const HASH_B: &str = "h1:BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB=";

struct LedgerFile {
    _temp: tempfile::TempDir,
    path: PathBuf,
}

impl LedgerFile {
    fn seed(&self, contents: &str) {
        fs::write(&self.path, contents).expect("seed ledger");
    }

    fn contents(&self) -> String {
        fs::read_to_string(&self.path).expect("read ledger")
    }

    fn open(&self) -> Ledger {
        Ledger::new(&self.path)
    }
}

#[fixture]
fn ledger_file() -> LedgerFile {
    let temp = tempfile::tempdir().expect("temp dir");
    let path = temp.path().join("modules.sum");
    LedgerFile { _temp: temp, path }
}

fn foo() -> ModuleVersion {
    ModuleVersion::new("example.com/foo", "v1.2.3")
}

fn verify(ledger: &Ledger, module: &ModuleVersion, hash: &str) {
    let lookup = ledger.check(module, hash).expect("check");
    assert!(
        matches!(lookup, Lookup::Known | Lookup::Unknown),
        "unexpected {lookup:?}"
    );
    ledger.record(module, hash).expect("record");
}

fn keep_all(ledger: &Ledger) -> HashSet<ModuleVersion> {
    ledger.used_modules()
}

#[rstest]
fn round_trip_reports_every_entry(ledger_file: LedgerFile) {
    let modules: Vec<ModuleVersion> = (0..5)
        .map(|minor| ModuleVersion::new("example.com/foo", format!("v1.{minor}.0")))
        .collect();
    let ledger = ledger_file.open();
    for module in &modules {
        verify(&ledger, module, HASH_A);
    }
    ledger.write(&keep_all(&ledger)).expect("write");

    let reloaded = ledger_file.open();

    for module in &modules {
        assert!(reloaded.have_sum(module), "{module} missing after reload");
    }
}

#[rstest]
fn flush_is_idempotent(ledger_file: LedgerFile) {
    ledger_file.seed("example.com/bar v0.1.0 h1:existing=\n");
    let ledger = ledger_file.open();
    verify(&ledger, &foo(), HASH_A);
    let keep = keep_all(&ledger);

    ledger.write(&keep).expect("first write");
    let first = ledger_file.contents();
    ledger.write(&keep).expect("second write");

    assert_eq!(first, ledger_file.contents());
    assert_eq!(
        first,
        format!("example.com/bar v0.1.0 h1:existing=\nexample.com/foo v1.2.3 {HASH_A}\n")
    );
}

#[rstest]
fn write_without_load_leaves_no_file(ledger_file: LedgerFile) {
    let ledger = ledger_file.open();

    ledger.write(&HashSet::new()).expect("write");

    assert!(!ledger_file.path.exists());
}

#[rstest]
fn entries_are_written_in_canonical_order(ledger_file: LedgerFile) {
    let ledger = ledger_file.open();
    verify(&ledger, &ModuleVersion::new("example.com/foo", "v1.10.0"), HASH_B);
    verify(&ledger, &ModuleVersion::new("example.com/foo", "v1.9.0/go.mod"), HASH_A);
    verify(&ledger, &ModuleVersion::new("example.com/foo", "v1.9.0"), HASH_A);

    ledger.write(&keep_all(&ledger)).expect("write");

    assert_eq!(
        ledger_file.contents(),
        format!(
            "example.com/foo v1.9.0 {HASH_A}\n\
             example.com/foo v1.9.0/go.mod {HASH_A}\n\
             example.com/foo v1.10.0 {HASH_B}\n"
        )
    );
}

#[rstest]
fn malformed_line_reports_file_and_line(ledger_file: LedgerFile) {
    ledger_file.seed("example.com/foo v1.0.0 h1:x=\nexample.com/foo v1.0.0\n");
    let ledger = ledger_file.open();

    let err = ledger.check(&foo(), HASH_A).expect_err("malformed ledger");

    let message = err.to_string();
    assert!(message.starts_with("malformed ledger:\n"), "{message}");
    assert!(message.ends_with(":2: wrong number of fields 2"), "{message}");
}

#[rstest]
fn malformed_ledger_is_not_half_loaded(ledger_file: LedgerFile) {
    ledger_file.seed(&format!("example.com/foo v1.2.3 {HASH_A}\nbroken\n"));
    let ledger = ledger_file.open();
    assert!(ledger.check(&foo(), HASH_A).is_err());

    assert!(ledger.check(&foo(), HASH_A).is_err());
}

#[rstest]
fn blank_lines_and_legacy_hash_are_skipped(ledger_file: LedgerFile) {
    ledger_file.seed(&format!(
        "\nexample.com/foo v1.2.3/go.mod {EMPTY_GO_MOD_HASH}\n\n"
    ));
    let ledger = ledger_file.open();

    assert!(ledger.sums(&foo().go_mod()).expect("sums").is_empty());
    assert!(!ledger.have_sum(&foo().go_mod()));
}

#[rstest]
fn known_hash_needs_no_record(ledger_file: LedgerFile) {
    ledger_file.seed(&format!("example.com/foo v1.2.3 {HASH_A}\n"));
    let ledger = ledger_file.open();

    assert_eq!(ledger.check(&foo(), HASH_A).expect("check"), Lookup::Known);
    assert!(ledger.have_sum(&foo()));
}

#[rstest]
fn different_strong_hash_is_a_conflict(ledger_file: LedgerFile) {
    ledger_file.seed(&format!("example.com/foo v1.2.3 {HASH_A}\n"));
    let ledger = ledger_file.open();

    let lookup = ledger.check(&foo(), HASH_B).expect("check");

    assert_eq!(
        lookup,
        Lookup::Conflict(Conflict {
            recorded: HASH_A.to_owned()
        })
    );
    assert!(ledger.used_modules().is_empty());
}

#[rstest]
fn unknown_algorithm_entries_are_kept(ledger_file: LedgerFile) {
    ledger_file.seed("example.com/foo v1.2.3 h9:future=\n");
    let ledger = ledger_file.open();

    assert_eq!(ledger.check(&foo(), HASH_A).expect("check"), Lookup::Unknown);
    ledger.record(&foo(), HASH_A).expect("record");
    ledger.write(&keep_all(&ledger)).expect("write");

    assert_eq!(
        ledger_file.contents(),
        format!("example.com/foo v1.2.3 {HASH_A}\nexample.com/foo v1.2.3 h9:future=\n")
    );
}

#[rstest]
fn flush_merges_concurrent_edits(ledger_file: LedgerFile) {
    let ledger = ledger_file.open();
    verify(&ledger, &foo(), HASH_A);
    ledger_file.seed("example.com/other v2.0.0 h1:external=\n");

    ledger.write(&keep_all(&ledger)).expect("write");

    assert_eq!(
        ledger_file.contents(),
        format!("example.com/foo v1.2.3 {HASH_A}\nexample.com/other v2.0.0 h1:external=\n")
    );
}

#[rstest]
fn staged_hashes_outside_keep_are_dropped(ledger_file: LedgerFile) {
    ledger_file.seed("example.com/bar v0.1.0 h1:existing=\n");
    let ledger = ledger_file.open();
    verify(&ledger, &foo(), HASH_A);

    ledger.write(&HashSet::new()).expect("write");

    assert_eq!(ledger_file.contents(), "example.com/bar v0.1.0 h1:existing=\n");
}

#[rstest]
fn trim_removes_modules_outside_keep(ledger_file: LedgerFile) {
    ledger_file.seed(&format!(
        "example.com/bar v0.1.0 h1:existing=\nexample.com/foo v1.2.3 {HASH_A}\n"
    ));
    let ledger = ledger_file.open();
    let keep = HashSet::from([foo()]);

    ledger.trim(&keep).expect("trim");
    ledger.write(&keep).expect("write");

    assert_eq!(ledger_file.contents(), format!("example.com/foo v1.2.3 {HASH_A}\n"));
}

#[rstest]
fn reset_forgets_staged_state(ledger_file: LedgerFile) {
    let ledger = ledger_file.open();
    verify(&ledger, &foo(), HASH_A);

    ledger.reset();
    ledger.write(&HashSet::from([foo()])).expect("write");

    assert!(ledger.used_modules().is_empty());
    assert!(!ledger_file.path.exists());
}

#[test]
fn disabled_ledger_records_nothing() {
    let ledger = Ledger::disabled();

    assert_eq!(ledger.check(&foo(), HASH_A).expect("check"), Lookup::Disabled);
    ledger.record(&foo(), HASH_A).expect("record");
    assert!(!ledger.have_sum(&foo()));
    assert!(ledger.used_modules().is_empty());
}
