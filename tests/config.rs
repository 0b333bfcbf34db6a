use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use oryza_dispatch::config::{
    ConfigLayer, ConfigLoader, HistoryTarget, ReferenceSource, RunFlags, WorkflowSelector,
};
use oryza_dispatch::error::DispatchError;

#[test]
fn file_layer_sits_between_defaults_and_cli() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("oryza-dispatch.json")).unwrap();
    std::fs::write(
        path.as_std_path(),
        r#"{
            "query": "Oryza glaberrima",
            "max_runs": 5,
            "reference_dataset_id": "ref-1",
            "history_id": "h-existing"
        }"#,
    )
    .unwrap();

    let cli = ConfigLayer {
        max_runs: Some(0),
        single_workflow_id: Some("wf-s".to_string()),
        ..ConfigLayer::default()
    };
    let resolved = ConfigLoader::resolve(
        Some(&path),
        cli,
        RunFlags {
            reset: true,
            dry_run: false,
        },
    )
    .unwrap();
    let pipeline = resolved.pipeline;
    assert_eq!(pipeline.query, "Oryza glaberrima");
    assert_eq!(pipeline.max_runs, 0);
    assert_eq!(pipeline.max_records, 50);
    assert_eq!(pipeline.single.selector, WorkflowSelector::Id("wf-s".to_string()));
    assert_eq!(
        pipeline.reference,
        Some(ReferenceSource::Dataset("ref-1".to_string()))
    );
    assert_eq!(pipeline.history, HistoryTarget::Existing("h-existing".to_string()));
    assert!(pipeline.reset);
}

#[test]
fn explicit_config_file_must_exist() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("missing.json")).unwrap();
    let err = ConfigLoader::load_file(Some(&path)).unwrap_err();
    assert_matches!(err, DispatchError::ConfigRead(_));
}

#[test]
fn malformed_config_file_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("bad.json")).unwrap();
    std::fs::write(path.as_std_path(), r#"{"max_runs": "many"}"#).unwrap();
    let err = ConfigLoader::load_file(Some(&path)).unwrap_err();
    assert_matches!(err, DispatchError::ConfigParse(_));
}

#[test]
fn blank_query_is_rejected() {
    let cli = ConfigLayer {
        query: Some("   ".to_string()),
        ..ConfigLayer::default()
    };
    let err = ConfigLoader::resolve_layers(ConfigLayer::defaults().merge(cli), RunFlags::default())
        .unwrap_err();
    assert_matches!(err, DispatchError::Config(_));
}

#[test]
fn zero_max_records_is_rejected() {
    let cli = ConfigLayer {
        max_records: Some(0),
        ..ConfigLayer::default()
    };
    let err = ConfigLoader::resolve_layers(ConfigLayer::defaults().merge(cli), RunFlags::default())
        .unwrap_err();
    assert_matches!(err, DispatchError::Config(_));
}
