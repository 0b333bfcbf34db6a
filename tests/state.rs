use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::Value;

use oryza_dispatch::domain::RunAccession;
use oryza_dispatch::error::DispatchError;
use oryza_dispatch::state::{RunStatus, StateStore, UploadedReads};

fn state_path(temp: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().join("ledger").join("state.json")).unwrap()
}

fn run(id: &str) -> RunAccession {
    id.parse().unwrap()
}

#[test]
fn ledger_survives_a_reload() {
    let temp = tempfile::tempdir().unwrap();
    let path = state_path(&temp);

    let mut store = StateStore::load(path.clone(), false).unwrap();
    assert!(store.is_empty());
    let id = run("SRR5");
    store.transition(&id, RunStatus::Uploading, None).unwrap();
    store
        .record_uploaded_reads(
            &id,
            UploadedReads {
                history_id: "h1".to_string(),
                src: "hdca".to_string(),
                id: "c1".to_string(),
            },
        )
        .unwrap();
    store.transition(&id, RunStatus::Dispatched, None).unwrap();
    store.transition(&id, RunStatus::Succeeded, None).unwrap();
    store.record_backend_ref(&id, "h1", "inv-7").unwrap();
    store.persist().unwrap();

    let reloaded = StateStore::load(path, false).unwrap();
    assert_eq!(reloaded.get(&id), store.get(&id));
    assert_eq!(reloaded.get(&id).unwrap().backend_ref.as_deref(), Some("inv-7"));
}

#[test]
fn ledger_file_is_keyed_by_run_with_camel_case_fields() {
    let temp = tempfile::tempdir().unwrap();
    let path = state_path(&temp);
    let mut store = StateStore::empty(path.clone());
    store
        .transition(&run("ERR42"), RunStatus::Failed, Some("status 503".to_string()))
        .unwrap();
    store.persist().unwrap();

    let raw: Value =
        serde_json::from_str(&std::fs::read_to_string(path.as_std_path()).unwrap()).unwrap();
    let entry = &raw["ERR42"];
    assert_eq!(entry["status"], "failed");
    assert_eq!(entry["detail"], "status 503");
    assert!(entry["updatedAt"].is_string());
    assert!(entry.get("backendRef").is_none());
}

#[test]
fn corrupt_ledger_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let path = state_path(&temp);
    std::fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
    std::fs::write(path.as_std_path(), "[1, 2").unwrap();

    let err = StateStore::load(path.clone(), false).unwrap_err();
    assert_matches!(err, DispatchError::StateCorruption { .. });

    let store = StateStore::load(path, true).unwrap();
    assert!(store.is_empty());
}

#[test]
fn unknown_status_is_corruption() {
    let temp = tempfile::tempdir().unwrap();
    let path = state_path(&temp);
    std::fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
    std::fs::write(
        path.as_std_path(),
        r#"{"SRR1": {"status": "running", "updatedAt": "2024-05-01T10:00:00Z"}}"#,
    )
    .unwrap();
    let err = StateStore::load(path, false).unwrap_err();
    assert_matches!(err, DispatchError::StateCorruption { .. });
}

#[test]
fn recording_on_unknown_run_is_rejected() {
    let mut store = StateStore::empty("unused.json");
    let err = store.record_backend_ref(&run("SRR1"), "h", "i").unwrap_err();
    assert_matches!(err, DispatchError::InvalidTransition { .. });
}
