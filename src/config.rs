use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

pub const DEFAULT_CONFIG_FILE: &str = "oryza-dispatch.json";
pub const DEFAULT_QUERY: &str = r#"(rice[Title/Abstract] OR "Oryza sativa"[MeSH Terms])"#;
pub const DEFAULT_SINGLE_WORKFLOW: &str = "Rice Variant Calling (BWA-MEM2 + FreeBayes)";
pub const DEFAULT_PAIRED_WORKFLOW: &str = "Rice Variant Calling Paired (BWA-MEM2 + FreeBayes)";
pub const DEFAULT_STATE_FILE: &str = ".oryza_dispatch_state.json";

/// One layer of settings. Defaults, the JSON file and the command line each
/// produce a layer; higher layers win field by field. The backend API key is
/// deliberately absent so it never lands in a file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigLayer {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub max_records: Option<usize>,
    #[serde(default)]
    pub max_runs: Option<usize>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub galaxy_url: Option<String>,
    #[serde(default)]
    pub single_workflow_id: Option<String>,
    #[serde(default)]
    pub single_workflow_name: Option<String>,
    #[serde(default)]
    pub paired_workflow_id: Option<String>,
    #[serde(default)]
    pub paired_workflow_name: Option<String>,
    #[serde(default)]
    pub single_input_label: Option<String>,
    #[serde(default)]
    pub paired_input_label: Option<String>,
    #[serde(default)]
    pub reference_input_label: Option<String>,
    #[serde(default)]
    pub reference_url: Option<String>,
    #[serde(default)]
    pub reference_dataset_id: Option<String>,
    #[serde(default)]
    pub history_id: Option<String>,
    #[serde(default)]
    pub history_name: Option<String>,
    #[serde(default)]
    pub history_per_sample: Option<bool>,
    #[serde(default)]
    pub state_file: Option<Utf8PathBuf>,
}

impl ConfigLayer {
    pub fn defaults() -> Self {
        Self {
            query: Some(DEFAULT_QUERY.to_string()),
            max_records: Some(50),
            max_runs: Some(20),
            single_workflow_name: Some(DEFAULT_SINGLE_WORKFLOW.to_string()),
            paired_workflow_name: Some(DEFAULT_PAIRED_WORKFLOW.to_string()),
            single_input_label: Some("Reads FASTQ".to_string()),
            paired_input_label: Some("Reads Pair".to_string()),
            reference_input_label: Some("Reference FASTA".to_string()),
            history_name: Some("Rice_variant_calling_inputs".to_string()),
            history_per_sample: Some(false),
            state_file: Some(Utf8PathBuf::from(DEFAULT_STATE_FILE)),
            ..Self::default()
        }
    }

    /// Fields set in `higher` replace ours.
    pub fn merge(self, higher: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            query: higher.query.or(self.query),
            max_records: higher.max_records.or(self.max_records),
            max_runs: higher.max_runs.or(self.max_runs),
            email: higher.email.or(self.email),
            galaxy_url: higher.galaxy_url.or(self.galaxy_url),
            single_workflow_id: higher.single_workflow_id.or(self.single_workflow_id),
            single_workflow_name: higher.single_workflow_name.or(self.single_workflow_name),
            paired_workflow_id: higher.paired_workflow_id.or(self.paired_workflow_id),
            paired_workflow_name: higher.paired_workflow_name.or(self.paired_workflow_name),
            single_input_label: higher.single_input_label.or(self.single_input_label),
            paired_input_label: higher.paired_input_label.or(self.paired_input_label),
            reference_input_label: higher.reference_input_label.or(self.reference_input_label),
            reference_url: higher.reference_url.or(self.reference_url),
            reference_dataset_id: higher.reference_dataset_id.or(self.reference_dataset_id),
            history_id: higher.history_id.or(self.history_id),
            history_name: higher.history_name.or(self.history_name),
            history_per_sample: higher.history_per_sample.or(self.history_per_sample),
            state_file: higher.state_file.or(self.state_file),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowSelector {
    Id(String),
    Name(String),
}

impl WorkflowSelector {
    fn from_parts(id: Option<String>, name: Option<String>) -> Option<Self> {
        non_blank(id)
            .map(WorkflowSelector::Id)
            .or_else(|| non_blank(name).map(WorkflowSelector::Name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSource {
    Dataset(String),
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryTarget {
    Existing(String),
    Named(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSettings {
    pub selector: WorkflowSelector,
    pub reads_label: String,
    pub reference_label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    pub query: String,
    pub max_records: usize,
    /// 0 means no cap.
    pub max_runs: usize,
    pub single: WorkflowSettings,
    pub paired: WorkflowSettings,
    pub reference: Option<ReferenceSource>,
    pub history: HistoryTarget,
    pub history_per_sample: bool,
    pub state_file: Utf8PathBuf,
    pub reset: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceSettings {
    pub email: Option<String>,
    pub galaxy_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub pipeline: PipelineConfig,
    pub services: ServiceSettings,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunFlags {
    pub reset: bool,
    pub dry_run: bool,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the file layer. Without an explicit path the default file is
    /// optional.
    pub fn load_file(path: Option<&Utf8Path>) -> Result<ConfigLayer, DispatchError> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };
        if path.is_none() && !config_path.as_std_path().exists() {
            return Ok(ConfigLayer::default());
        }
        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| DispatchError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| DispatchError::ConfigParse(err.to_string()))
    }

    /// Defaults, then the file, then `cli`.
    pub fn layered(path: Option<&Utf8Path>, cli: ConfigLayer) -> Result<ConfigLayer, DispatchError> {
        let file = Self::load_file(path)?;
        Ok(ConfigLayer::defaults().merge(file).merge(cli))
    }

    pub fn resolve(
        path: Option<&Utf8Path>,
        cli: ConfigLayer,
        flags: RunFlags,
    ) -> Result<ResolvedConfig, DispatchError> {
        Self::resolve_layers(Self::layered(path, cli)?, flags)
    }

    /// Ledger location for commands that only read or repair the ledger.
    pub fn state_file(
        path: Option<&Utf8Path>,
        cli: Option<Utf8PathBuf>,
    ) -> Result<Utf8PathBuf, DispatchError> {
        let layer = Self::layered(
            path,
            ConfigLayer {
                state_file: cli,
                ..ConfigLayer::default()
            },
        )?;
        Ok(layer
            .state_file
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_STATE_FILE)))
    }

    pub fn resolve_layers(layer: ConfigLayer, flags: RunFlags) -> Result<ResolvedConfig, DispatchError> {
        let query = non_blank(layer.query)
            .ok_or_else(|| DispatchError::Config("query must not be empty".to_string()))?;
        let max_records = layer.max_records.unwrap_or(50);
        if max_records == 0 {
            return Err(DispatchError::Config(
                "max records must be greater than zero".to_string(),
            ));
        }

        let single = WorkflowSelector::from_parts(layer.single_workflow_id, layer.single_workflow_name)
            .ok_or_else(|| DispatchError::Config("no single-end workflow configured".to_string()))?;
        let paired = WorkflowSelector::from_parts(layer.paired_workflow_id, layer.paired_workflow_name)
            .ok_or_else(|| DispatchError::Config("no paired-end workflow configured".to_string()))?;
        let reference_label = required(layer.reference_input_label, "reference input label")?;

        let reference = match (
            non_blank(layer.reference_dataset_id),
            non_blank(layer.reference_url),
        ) {
            (Some(_), Some(_)) => {
                return Err(DispatchError::Config(
                    "give either a reference dataset id or a reference URL, not both".to_string(),
                ));
            }
            (Some(id), None) => Some(ReferenceSource::Dataset(id)),
            (None, Some(url)) => Some(ReferenceSource::Url(url)),
            (None, None) => None,
        };

        let history = match non_blank(layer.history_id) {
            Some(id) => HistoryTarget::Existing(id),
            None => HistoryTarget::Named(required(layer.history_name, "history name")?),
        };

        let pipeline = PipelineConfig {
            query,
            max_records,
            max_runs: layer.max_runs.unwrap_or(0),
            single: WorkflowSettings {
                selector: single,
                reads_label: required(layer.single_input_label, "single-end input label")?,
                reference_label: reference_label.clone(),
            },
            paired: WorkflowSettings {
                selector: paired,
                reads_label: required(layer.paired_input_label, "paired-end input label")?,
                reference_label,
            },
            reference,
            history,
            history_per_sample: layer.history_per_sample.unwrap_or(false),
            state_file: layer
                .state_file
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_STATE_FILE)),
            reset: flags.reset,
            dry_run: flags.dry_run,
        };

        Ok(ResolvedConfig {
            pipeline,
            services: ServiceSettings {
                email: non_blank(layer.email),
                galaxy_url: non_blank(layer.galaxy_url),
            },
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required(value: Option<String>, what: &str) -> Result<String, DispatchError> {
    non_blank(value).ok_or_else(|| DispatchError::Config(format!("{what} must not be empty")))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_resolve() {
        let resolved =
            ConfigLoader::resolve_layers(ConfigLayer::defaults(), RunFlags::default()).unwrap();
        let pipeline = resolved.pipeline;
        assert_eq!(pipeline.query, DEFAULT_QUERY);
        assert_eq!(pipeline.max_records, 50);
        assert_eq!(pipeline.max_runs, 20);
        assert_eq!(
            pipeline.single.selector,
            WorkflowSelector::Name(DEFAULT_SINGLE_WORKFLOW.to_string())
        );
        assert_eq!(pipeline.paired.reads_label, "Reads Pair");
        assert_eq!(
            pipeline.history,
            HistoryTarget::Named("Rice_variant_calling_inputs".to_string())
        );
        assert!(pipeline.reference.is_none());
    }

    #[test]
    fn explicit_workflow_id_beats_name() {
        let cli = ConfigLayer {
            paired_workflow_id: Some("wf-9".to_string()),
            ..ConfigLayer::default()
        };
        let resolved =
            ConfigLoader::resolve_layers(ConfigLayer::defaults().merge(cli), RunFlags::default())
                .unwrap();
        assert_eq!(
            resolved.pipeline.paired.selector,
            WorkflowSelector::Id("wf-9".to_string())
        );
    }

    #[test]
    fn state_file_follows_config_file_unless_overridden() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("settings.json")).unwrap();
        fs::write(path.as_std_path(), r#"{"state_file": "ledger.json"}"#).unwrap();

        assert_eq!(
            ConfigLoader::state_file(Some(&path), None).unwrap(),
            Utf8PathBuf::from("ledger.json")
        );
        assert_eq!(
            ConfigLoader::state_file(Some(&path), Some(Utf8PathBuf::from("other.json"))).unwrap(),
            Utf8PathBuf::from("other.json")
        );
    }

    #[test]
    fn both_reference_sources_rejected() {
        let cli = ConfigLayer {
            reference_url: Some("https://x.test/ref.fa".to_string()),
            reference_dataset_id: Some("d1".to_string()),
            ..ConfigLayer::default()
        };
        let err =
            ConfigLoader::resolve_layers(ConfigLayer::defaults().merge(cli), RunFlags::default())
                .unwrap_err();
        assert_matches!(err, DispatchError::Config(_));
    }
}
