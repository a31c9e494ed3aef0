//! Store behaviour across independent writers sharing one directory.

use swap_payload::{fingerprint_from_file_name, Payload, PayloadStore};

fn files_in(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn same_fingerprint_from_two_writers_leaves_one_file() {
    let dir = tempfile::tempdir().unwrap();
    let payload = Payload::new(b"instrumentation archive v1".to_vec());

    // Each store stands in for a separate process pointed at the same directory.
    let first = PayloadStore::new(dir.path()).ensure_written(&payload).unwrap();
    let second = PayloadStore::new(dir.path()).ensure_written(&payload).unwrap();

    assert_eq!(first, second);
    assert_eq!(files_in(dir.path()), vec![payload.file_name()]);
    assert_eq!(std::fs::read(&first).unwrap(), payload.bytes());
}

#[test]
fn distinct_fingerprints_never_share_a_path() {
    let dir = tempfile::tempdir().unwrap();
    let store = PayloadStore::new(dir.path());
    let v1 = Payload::new(b"archive v1".to_vec());
    let v2 = Payload::new(b"archive v2".to_vec());

    let p1 = store.ensure_written(&v1).unwrap();
    let p2 = store.ensure_written(&v2).unwrap();

    assert_ne!(p1, p2);
    assert_eq!(std::fs::read(&p1).unwrap(), v1.bytes());
    assert_eq!(std::fs::read(&p2).unwrap(), v2.bytes());

    let recovered: Vec<_> = files_in(dir.path())
        .iter()
        .filter_map(|n| fingerprint_from_file_name(n))
        .collect();
    assert_eq!(recovered.len(), 2);
    assert!(recovered.contains(v1.fingerprint()));
    assert!(recovered.contains(v2.fingerprint()));
}
