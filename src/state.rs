//! Durable per-run ledger.
//!
//! The ledger is a single JSON object keyed by run accession. Every mutation
//! goes through [`StateStore::transition`], which enforces the forward-only
//! status rule, and [`StateStore::persist`] rewrites the whole file through an
//! atomic replace.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::RunAccession;
use crate::error::DispatchError;
use crate::fs_util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Uploading,
    Dispatched,
    Succeeded,
    Failed,
}

impl RunStatus {
    /// `from` is `None` for runs the ledger has never seen, which behave as `Pending`.
    pub fn allows(from: Option<RunStatus>, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (from.unwrap_or(Pending), to),
            (Pending, Pending)
                | (Pending, Uploading)
                | (Pending, Failed)
                | (Uploading, Dispatched)
                | (Uploading, Failed)
                | (Dispatched, Succeeded)
                | (Dispatched, Failed)
                | (Failed, Pending)
        )
    }

    /// Left behind only when a process died mid-dispatch.
    pub fn is_in_flight(self) -> bool {
        matches!(self, RunStatus::Uploading | RunStatus::Dispatched)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Pending => "pending",
            RunStatus::Uploading => "uploading",
            RunStatus::Dispatched => "dispatched",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Workflow input already created in the backend for a run's reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedReads {
    pub history_id: String,
    /// `hda` for a single dataset, `hdca` for a paired collection.
    pub src: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reads: Option<UploadedReads>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub uploading: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct StateStore {
    path: Utf8PathBuf,
    runs: BTreeMap<RunAccession, RunState>,
}

impl StateStore {
    /// Missing file means a fresh start. A malformed file is an error unless
    /// `reset` is set, in which case the ledger starts empty and the next
    /// persist overwrites it.
    pub fn load(path: impl Into<Utf8PathBuf>, reset: bool) -> Result<Self, DispatchError> {
        let path = path.into();
        if reset {
            return Ok(Self::empty(path));
        }
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::empty(path)),
            Err(err) => {
                return Err(DispatchError::StateCorruption {
                    path,
                    message: err.to_string(),
                });
            }
        };
        let runs = serde_json::from_str::<BTreeMap<RunAccession, RunState>>(&content).map_err(
            |err| DispatchError::StateCorruption {
                path: path.clone(),
                message: err.to_string(),
            },
        )?;
        Ok(Self { path, runs })
    }

    pub fn empty(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            runs: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn get(&self, run: &RunAccession) -> Option<&RunState> {
        self.runs.get(run)
    }

    pub fn status(&self, run: &RunAccession) -> Option<RunStatus> {
        self.runs.get(run).map(|state| state.status)
    }

    pub fn runs(&self) -> &BTreeMap<RunAccession, RunState> {
        &self.runs
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Runs a crashed process left in `Uploading` or `Dispatched`.
    pub fn in_flight(&self) -> Vec<(RunAccession, RunStatus)> {
        self.runs
            .iter()
            .filter(|(_, state)| state.status.is_in_flight())
            .map(|(run, state)| (run.clone(), state.status))
            .collect()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for state in self.runs.values() {
            match state.status {
                RunStatus::Pending => counts.pending += 1,
                RunStatus::Uploading => counts.uploading += 1,
                RunStatus::Dispatched => counts.dispatched += 1,
                RunStatus::Succeeded => counts.succeeded += 1,
                RunStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Moves `run` to `status`. The detail is replaced by `detail`; the
    /// backend reference and uploaded reads are kept.
    pub fn transition(
        &mut self,
        run: &RunAccession,
        status: RunStatus,
        detail: Option<String>,
    ) -> Result<&RunState, DispatchError> {
        let current = self.status(run);
        if !RunStatus::allows(current, status) {
            return Err(DispatchError::InvalidTransition {
                run: run.to_string(),
                from: current.unwrap_or(RunStatus::Pending),
                to: status,
            });
        }
        let now = Utc::now();
        let state = self
            .runs
            .entry(run.clone())
            .or_insert_with(|| RunState {
                status,
                updated_at: now,
                detail: None,
                backend_ref: None,
                history_id: None,
                reads: None,
            });
        state.status = status;
        state.updated_at = now;
        state.detail = detail;
        Ok(state)
    }

    /// Records where the run's workflow was launched.
    pub fn record_backend_ref(
        &mut self,
        run: &RunAccession,
        history_id: &str,
        backend_ref: &str,
    ) -> Result<(), DispatchError> {
        let state = self.known_mut(run)?;
        state.history_id = Some(history_id.to_string());
        state.backend_ref = Some(backend_ref.to_string());
        Ok(())
    }

    pub fn record_uploaded_reads(
        &mut self,
        run: &RunAccession,
        reads: UploadedReads,
    ) -> Result<(), DispatchError> {
        self.known_mut(run)?.reads = Some(reads);
        Ok(())
    }

    /// Explicit retry path: `Failed -> Pending`. Returns the runs that were reset.
    pub fn reset_failed(&mut self, only: &[RunAccession]) -> Result<Vec<RunAccession>, DispatchError> {
        let targets = self
            .runs
            .iter()
            .filter(|(run, state)| {
                state.status == RunStatus::Failed && (only.is_empty() || only.contains(run))
            })
            .map(|(run, _)| run.clone())
            .collect::<Vec<_>>();
        for run in &targets {
            self.transition(run, RunStatus::Pending, None)?;
        }
        Ok(targets)
    }

    pub fn persist(&self) -> Result<(), DispatchError> {
        let mut content = serde_json::to_vec_pretty(&self.runs)
            .map_err(|err| DispatchError::Filesystem(err.to_string()))?;
        content.push(b'\n');
        fs_util::write_atomic(&self.path, &content)
    }

    fn known_mut(&mut self, run: &RunAccession) -> Result<&mut RunState, DispatchError> {
        self.runs
            .get_mut(run)
            .ok_or_else(|| DispatchError::InvalidTransition {
                run: run.to_string(),
                from: RunStatus::Pending,
                to: RunStatus::Pending,
            })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn run(id: &str) -> RunAccession {
        id.parse().unwrap()
    }

    #[test]
    fn forward_transitions_only() {
        use RunStatus::*;
        assert!(RunStatus::allows(None, Uploading));
        assert!(RunStatus::allows(Some(Failed), Pending));
        assert!(!RunStatus::allows(Some(Succeeded), Pending));
        assert!(!RunStatus::allows(Some(Succeeded), Uploading));
        assert!(!RunStatus::allows(Some(Failed), Uploading));
        assert!(!RunStatus::allows(Some(Dispatched), Uploading));
        assert!(!RunStatus::allows(None, Succeeded));
    }

    #[test]
    fn succeeded_is_terminal() {
        let mut store = StateStore::empty("unused.json");
        let id = run("SRR1");
        store.transition(&id, RunStatus::Uploading, None).unwrap();
        store.transition(&id, RunStatus::Dispatched, None).unwrap();
        store.transition(&id, RunStatus::Succeeded, None).unwrap();
        let err = store.transition(&id, RunStatus::Uploading, None).unwrap_err();
        assert_matches!(
            err,
            DispatchError::InvalidTransition {
                from: RunStatus::Succeeded,
                to: RunStatus::Uploading,
                ..
            }
        );
    }

    #[test]
    fn reset_failed_targets_only_failed_runs() {
        let mut store = StateStore::empty("unused.json");
        store.transition(&run("SRR1"), RunStatus::Failed, Some("boom".into())).unwrap();
        store.transition(&run("SRR2"), RunStatus::Uploading, None).unwrap();
        store.transition(&run("SRR3"), RunStatus::Failed, None).unwrap();

        let reset = store.reset_failed(&[run("SRR3")]).unwrap();
        assert_eq!(reset, vec![run("SRR3")]);
        assert_eq!(store.status(&run("SRR1")), Some(RunStatus::Failed));

        let reset = store.reset_failed(&[]).unwrap();
        assert_eq!(reset, vec![run("SRR1")]);
        assert_eq!(store.get(&run("SRR1")).unwrap().detail, None);
        assert_eq!(store.counts().pending, 2);
    }

    #[test]
    fn in_flight_runs_are_reported() {
        let mut store = StateStore::empty("unused.json");
        store.transition(&run("SRR1"), RunStatus::Uploading, None).unwrap();
        store.transition(&run("SRR2"), RunStatus::Pending, None).unwrap();
        assert_eq!(store.in_flight(), vec![(run("SRR1"), RunStatus::Uploading)]);
    }
}
