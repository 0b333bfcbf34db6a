use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::archive::ArchiveClient;
use crate::backend::{Backend, InputRef, WorkflowInputs};
use crate::config::{HistoryTarget, PipelineConfig, ReferenceSource, WorkflowSelector, WorkflowSettings};
use crate::domain::{ReadFiles, ReadLayout, RunAccession, RunMetadata, SampleGroup, SampleKey};
use crate::error::DispatchError;
use crate::grouping;
use crate::literature::LiteratureClient;
use crate::state::{RunStatus, StateStore, UploadedReads};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct SilentSink;

impl ProgressSink for SilentSink {
    fn event(&self, _event: ProgressEvent) {}
}

/// Stop request observed between runs, never in the middle of one.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub sample: String,
    pub runs: Vec<String>,
    pub layouts: Vec<ReadLayout>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub run: String,
    pub stage: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedDispatch {
    pub run: String,
    pub sample: String,
    pub layout: ReadLayout,
    pub workflow: WorkflowSelector,
    pub read_count: Option<u64>,
    pub estimated_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub dry_run: bool,
    pub discovered: usize,
    pub resolved: usize,
    pub groups: Vec<GroupSummary>,
    pub dispatched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub succeeded_total: usize,
    pub cancelled: bool,
    pub not_started: usize,
    /// Runs found mid-dispatch from an earlier crash and marked failed.
    pub recovered: Vec<String>,
    pub failures: Vec<RunFailure>,
    pub planned: Vec<PlannedDispatch>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub run: String,
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
    pub detail: Option<String>,
    pub backend_ref: Option<String>,
    pub history_id: Option<String>,
    pub backend_state: Option<String>,
}

pub fn ledger_entries(store: &StateStore) -> Vec<LedgerEntry> {
    store
        .runs()
        .iter()
        .map(|(run, state)| LedgerEntry {
            run: run.to_string(),
            status: state.status,
            updated_at: state.updated_at,
            detail: state.detail.clone(),
            backend_ref: state.backend_ref.clone(),
            history_id: state.history_id.clone(),
            backend_state: None,
        })
        .collect()
}

#[derive(Clone)]
pub struct App<L: LiteratureClient, A: ArchiveClient, B: Backend> {
    literature: L,
    archive: A,
    backend: B,
}

impl<L: LiteratureClient, A: ArchiveClient, B: Backend> App<L, A, B> {
    pub fn new(literature: L, archive: A, backend: B) -> Self {
        Self {
            literature,
            archive,
            backend,
        }
    }

    pub fn archive(&self) -> &A {
        &self.archive
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn run(
        &self,
        config: &PipelineConfig,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<RunSummary, DispatchError> {
        let mut store = StateStore::load(config.state_file.clone(), config.reset)?;
        let mut summary = RunSummary {
            dry_run: config.dry_run,
            ..RunSummary::default()
        };
        self.recover_interrupted(&mut store, config, &mut summary)?;

        emit(sink, format!("phase=Discover; searching PubMed: {}", config.query));
        let start = Instant::now();
        let mut accessions = self.literature.discover(&config.query, config.max_records)?;
        summary.discovered = accessions.len();
        if config.max_runs > 0 {
            accessions.truncate(config.max_runs);
        }
        emit_timed(
            sink,
            format!(
                "phase=Discover; {} run accession(s), {} after cap",
                summary.discovered,
                accessions.len()
            ),
            start.elapsed(),
        );

        let resolved = self.resolve_runs(&accessions, &mut store, config, &mut summary, sink, cancel)?;
        summary.resolved = resolved.len();

        let groups = grouping::group(&resolved);
        emit(sink, format!("phase=Group; {} sample group(s)", groups.len()));
        summary.groups = groups.iter().map(group_summary).collect();

        if config.dry_run {
            summary.planned = plan(&groups, config);
        } else if !summary.cancelled && !groups.is_empty() {
            self.dispatch_groups(&groups, &mut store, config, &mut summary, sink, cancel)?;
        }

        summary.succeeded_total = summary.skipped + summary.dispatched;
        Ok(summary)
    }

    /// Queries the backend for the state of every recorded invocation.
    pub fn refresh_ledger(&self, entries: &mut [LedgerEntry]) {
        for entry in entries.iter_mut() {
            let Some(invocation) = entry.backend_ref.as_deref() else {
                continue;
            };
            entry.backend_state = Some(match self.backend.invocation_state(invocation) {
                Ok(state) => state,
                Err(err) => format!("unavailable: {err}"),
            });
        }
    }

    fn recover_interrupted(
        &self,
        store: &mut StateStore,
        config: &PipelineConfig,
        summary: &mut RunSummary,
    ) -> Result<(), DispatchError> {
        let in_flight = store.in_flight();
        for (run, status) in &in_flight {
            if *status == RunStatus::Dispatched {
                tracing::warn!(
                    run = %run,
                    "run was interrupted while invoking its workflow; the backend may already hold an invocation"
                );
            } else {
                tracing::warn!(run = %run, "run was interrupted during upload");
            }
            summary.recovered.push(run.to_string());
            if !config.dry_run {
                store.transition(
                    run,
                    RunStatus::Failed,
                    Some(format!("interrupted while {status}")),
                )?;
            }
        }
        if !in_flight.is_empty() && !config.dry_run {
            store.persist()?;
        }
        Ok(())
    }

    fn resolve_runs(
        &self,
        accessions: &[RunAccession],
        store: &mut StateStore,
        config: &PipelineConfig,
        summary: &mut RunSummary,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<Vec<RunMetadata>, DispatchError> {
        let mut resolved = Vec::new();
        for (idx, run) in accessions.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                summary.not_started += accessions.len() - idx;
                break;
            }
            if store.status(run) == Some(RunStatus::Succeeded) {
                emit(sink, format!("phase=Resolve; {run} already succeeded, skipping"));
                summary.skipped += 1;
                continue;
            }
            match self.archive.resolve_run(run) {
                Ok(metadata) => {
                    emit(
                        sink,
                        format!("phase=Resolve; {run} {} run", metadata.layout()),
                    );
                    resolved.push(metadata);
                }
                Err(err) => {
                    let detail = err.to_string();
                    emit(sink, format!("phase=Resolve; {run} failed: {detail}"));
                    if !config.dry_run {
                        mark_failed(store, run, &detail)?;
                        store.persist()?;
                    }
                    summary.failed += 1;
                    summary.failures.push(RunFailure {
                        run: run.to_string(),
                        stage: "resolve",
                        detail,
                    });
                }
            }
        }
        Ok(resolved)
    }

    fn dispatch_groups(
        &self,
        groups: &[SampleGroup],
        store: &mut StateStore,
        config: &PipelineConfig,
        summary: &mut RunSummary,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), DispatchError> {
        let layouts = groups
            .iter()
            .flat_map(|group| group.runs.iter().map(RunMetadata::layout))
            .collect::<BTreeSet<_>>();
        let mut session = Session::new(&self.backend, config);
        for layout in layouts {
            session.prepare_workflow(layout)?;
        }

        let total = groups.iter().map(|group| group.runs.len()).sum::<usize>();
        let mut started = 0usize;
        for group in groups {
            for metadata in &group.runs {
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    summary.not_started = total - started;
                    emit(sink, "phase=Dispatch; stop requested, leaving remaining runs pending".to_string());
                    return Ok(());
                }
                started += 1;
                let start = Instant::now();
                match self.dispatch_run(&mut session, store, &group.key, metadata) {
                    Ok(invocation) => {
                        summary.dispatched += 1;
                        emit_timed(
                            sink,
                            format!(
                                "phase=Dispatch; sample {} {} run {} invocation={invocation}",
                                group.key,
                                metadata.layout(),
                                metadata.run
                            ),
                            start.elapsed(),
                        );
                    }
                    Err(err) if err.is_run_scoped() => {
                        let detail = err.to_string();
                        mark_failed(store, &metadata.run, &detail)?;
                        store.persist()?;
                        emit(sink, format!("phase=Dispatch; {} failed: {detail}", metadata.run));
                        summary.failed += 1;
                        summary.failures.push(RunFailure {
                            run: metadata.run.to_string(),
                            stage: "dispatch",
                            detail,
                        });
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    fn dispatch_run(
        &self,
        session: &mut Session<'_, B>,
        store: &mut StateStore,
        key: &SampleKey,
        metadata: &RunMetadata,
    ) -> Result<String, DispatchError> {
        let run = &metadata.run;
        if store.status(run) == Some(RunStatus::Failed) {
            store.transition(run, RunStatus::Pending, None)?;
        }
        store.transition(run, RunStatus::Uploading, None)?;
        store.persist()?;

        let history = session.history_for(key)?;
        let reference = session.reference_for(&history)?;

        let reused = store
            .get(run)
            .and_then(|state| state.reads.as_ref())
            .filter(|reads| reads.history_id == history)
            .map(|reads| InputRef {
                src: reads.src.clone(),
                id: reads.id.clone(),
            });
        let reads = match reused {
            Some(reads) => reads,
            None => {
                let reads = self.upload_reads(&history, metadata)?;
                store.record_uploaded_reads(
                    run,
                    UploadedReads {
                        history_id: history.clone(),
                        src: reads.src.clone(),
                        id: reads.id.clone(),
                    },
                )?;
                store.persist()?;
                reads
            }
        };

        let workflow = session.workflow(metadata.layout())?;
        let mut inputs = WorkflowInputs::new();
        inputs.insert(workflow.reads_input.clone(), reads);
        if let (Some(dataset), Some(input)) = (reference, workflow.reference_input.as_ref()) {
            inputs.insert(input.clone(), InputRef::dataset(dataset));
        }

        store.transition(run, RunStatus::Dispatched, None)?;
        store.persist()?;
        let invocation = self.backend.invoke_workflow(&workflow.id, &history, &inputs)?;

        store.transition(run, RunStatus::Succeeded, None)?;
        store.record_backend_ref(run, &history, &invocation)?;
        store.persist()?;
        Ok(invocation)
    }

    fn upload_reads(&self, history: &str, metadata: &RunMetadata) -> Result<InputRef, DispatchError> {
        let run = &metadata.run;
        match &metadata.reads {
            ReadFiles::Single { reads } => {
                let id = self.backend.upload_dataset(
                    history,
                    &reads.url,
                    &format!("{run}.fastq.gz"),
                    reads.md5.as_deref(),
                )?;
                Ok(InputRef::dataset(id))
            }
            ReadFiles::Paired { forward, reverse } => {
                let forward_id = self.backend.upload_dataset(
                    history,
                    &forward.url,
                    &format!("{run}_R1.fastq.gz"),
                    forward.md5.as_deref(),
                )?;
                let reverse_id = self.backend.upload_dataset(
                    history,
                    &reverse.url,
                    &format!("{run}_R2.fastq.gz"),
                    reverse.md5.as_deref(),
                )?;
                let collection = self.backend.create_paired_collection(
                    history,
                    &forward_id,
                    &reverse_id,
                    &format!("{run}_pair"),
                )?;
                Ok(InputRef::collection(collection))
            }
        }
    }
}

#[derive(Debug, Clone)]
struct ResolvedWorkflow {
    id: String,
    reads_input: String,
    reference_input: Option<String>,
}

/// Backend lookups cached for one invocation of the pipeline.
struct Session<'a, B: Backend> {
    backend: &'a B,
    config: &'a PipelineConfig,
    workflows: HashMap<ReadLayout, ResolvedWorkflow>,
    histories: HashMap<String, String>,
    reference: Option<String>,
}

impl<'a, B: Backend> Session<'a, B> {
    fn new(backend: &'a B, config: &'a PipelineConfig) -> Self {
        Self {
            backend,
            config,
            workflows: HashMap::new(),
            histories: HashMap::new(),
            reference: None,
        }
    }

    fn prepare_workflow(&mut self, layout: ReadLayout) -> Result<(), DispatchError> {
        let settings: &WorkflowSettings = match layout {
            ReadLayout::SingleEnd => &self.config.single,
            ReadLayout::PairedEnd => &self.config.paired,
        };
        let id = match &settings.selector {
            WorkflowSelector::Id(id) => id.clone(),
            WorkflowSelector::Name(name) => self.backend.find_workflow(name)?,
        };
        let reads_input = self
            .backend
            .workflow_input(&id, Some(&settings.reads_label))?;
        let reference_input = match self.config.reference {
            Some(_) => Some(
                self.backend
                    .workflow_input(&id, Some(&settings.reference_label))?,
            ),
            None => None,
        };
        self.workflows.insert(
            layout,
            ResolvedWorkflow {
                id,
                reads_input,
                reference_input,
            },
        );
        Ok(())
    }

    fn workflow(&self, layout: ReadLayout) -> Result<ResolvedWorkflow, DispatchError> {
        self.workflows
            .get(&layout)
            .cloned()
            .ok_or_else(|| DispatchError::Config(format!("no {layout}-end workflow prepared")))
    }

    fn history_for(&mut self, key: &SampleKey) -> Result<String, DispatchError> {
        let name = match &self.config.history {
            HistoryTarget::Existing(id) => return Ok(id.clone()),
            HistoryTarget::Named(name) if self.config.history_per_sample => {
                format!("{name}_{}", key.history_label())
            }
            HistoryTarget::Named(name) => name.clone(),
        };
        if let Some(id) = self.histories.get(&name) {
            return Ok(id.clone());
        }
        let id = self.backend.ensure_history(&name)?;
        self.histories.insert(name, id.clone());
        Ok(id)
    }

    /// Reference dataset id; a URL source is imported once and reused.
    fn reference_for(&mut self, history: &str) -> Result<Option<String>, DispatchError> {
        match &self.config.reference {
            None => Ok(None),
            Some(ReferenceSource::Dataset(id)) => Ok(Some(id.clone())),
            Some(ReferenceSource::Url(url)) => {
                if let Some(id) = &self.reference {
                    return Ok(Some(id.clone()));
                }
                let id = self.backend.upload_dataset(history, url, "reference.fasta", None)?;
                self.reference = Some(id.clone());
                Ok(Some(id))
            }
        }
    }
}

fn mark_failed(store: &mut StateStore, run: &RunAccession, detail: &str) -> Result<(), DispatchError> {
    if store.status(run) == Some(RunStatus::Failed) {
        store.transition(run, RunStatus::Pending, None)?;
    }
    store.transition(run, RunStatus::Failed, Some(detail.to_string()))?;
    Ok(())
}

fn group_summary(group: &SampleGroup) -> GroupSummary {
    let layouts = group
        .runs
        .iter()
        .map(RunMetadata::layout)
        .fold(Vec::new(), |mut acc, layout| {
            if !acc.contains(&layout) {
                acc.push(layout);
            }
            acc
        });
    GroupSummary {
        sample: group.key.to_string(),
        runs: group.runs.iter().map(|run| run.run.to_string()).collect(),
        layouts,
    }
}

fn plan(groups: &[SampleGroup], config: &PipelineConfig) -> Vec<PlannedDispatch> {
    groups
        .iter()
        .flat_map(|group| {
            group.runs.iter().map(move |metadata| PlannedDispatch {
                run: metadata.run.to_string(),
                sample: group.key.to_string(),
                layout: metadata.layout(),
                workflow: match metadata.layout() {
                    ReadLayout::SingleEnd => config.single.selector.clone(),
                    ReadLayout::PairedEnd => config.paired.selector.clone(),
                },
                read_count: metadata.read_count,
                estimated_bytes: metadata.estimated_bytes,
            })
        })
        .collect()
}

fn emit(sink: &dyn ProgressSink, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: None,
    });
}

fn emit_timed(sink: &dyn ProgressSink, message: String, elapsed: Duration) {
    sink.event(ProgressEvent {
        message,
        elapsed: Some(elapsed),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FastqFile, SampleAccession};

    fn metadata(run: &str, paired: bool) -> RunMetadata {
        let file = FastqFile::new(format!("https://h/{run}_1.fastq.gz"));
        let reads = if paired {
            ReadFiles::Paired {
                forward: file.clone(),
                reverse: FastqFile::new(format!("https://h/{run}_2.fastq.gz")),
            }
        } else {
            ReadFiles::Single {
                reads: file.clone(),
            }
        };
        RunMetadata {
            run: run.parse().unwrap(),
            sample: SampleAccession::new("SAMN1"),
            reads,
            files: vec![file],
            estimated_bytes: None,
            read_count: None,
        }
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn group_summary_lists_distinct_layouts_in_order() {
        let group = SampleGroup {
            key: SampleKey::Sample(SampleAccession::new("SAMN1").unwrap()),
            runs: vec![
                metadata("SRR1", true),
                metadata("SRR2", false),
                metadata("SRR3", true),
            ],
        };
        let summary = group_summary(&group);
        assert_eq!(summary.sample, "SAMN1");
        assert_eq!(summary.layouts, vec![ReadLayout::PairedEnd, ReadLayout::SingleEnd]);
    }

    #[test]
    fn failures_make_the_summary_unsuccessful() {
        let mut summary = RunSummary::default();
        assert!(!summary.has_failures());
        summary.failed = 1;
        assert!(summary.has_failures());
    }
}
