use std::io::{self, Write};

use serde::Serialize;

use crate::app::{LedgerEntry, ProgressEvent, ProgressSink, RunSummary};
use crate::config::WorkflowSelector;
use crate::domain::RunAccession;
use crate::state::StatusCounts;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

#[derive(Debug, Serialize)]
pub struct LedgerReport {
    pub state_file: String,
    pub counts: StatusCounts,
    pub runs: Vec<LedgerEntry>,
}

#[derive(Debug, Serialize)]
pub struct RetryReport {
    pub state_file: String,
    pub reset: Vec<RunAccession>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_ledger(report: &LedgerReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_retry(report: &RetryReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct TextOutput;

impl ProgressSink for TextOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => tracing::info!("{}", event.message),
        }
    }
}

impl TextOutput {
    pub fn render_summary(summary: &RunSummary) -> String {
        let mut out = String::new();
        let title = if summary.dry_run {
            "oryza-dispatch plan (dry run)"
        } else {
            "oryza-dispatch summary"
        };
        out.push_str(&format!("{title}\n"));
        out.push_str(&format!("  discovered runs:  {}\n", summary.discovered));
        out.push_str(&format!("  resolved runs:    {}\n", summary.resolved));
        out.push_str(&format!("  sample groups:    {}\n", summary.groups.len()));
        if !summary.recovered.is_empty() {
            out.push_str(&format!(
                "  interrupted:      {}\n",
                summary.recovered.join(", ")
            ));
        }
        if summary.dry_run {
            for planned in &summary.planned {
                out.push_str(&format!(
                    "  would dispatch {} ({}, sample {}) via {}",
                    planned.run,
                    planned.layout,
                    planned.sample,
                    selector_label(&planned.workflow)
                ));
                if let Some(reads) = planned.read_count {
                    out.push_str(&format!(", {reads} reads"));
                }
                if let Some(bytes) = planned.estimated_bytes {
                    out.push_str(&format!(", {bytes} bytes"));
                }
                out.push('\n');
            }
        } else {
            out.push_str(&format!("  dispatched:       {}\n", summary.dispatched));
            out.push_str(&format!("  skipped:          {}\n", summary.skipped));
            out.push_str(&format!("  succeeded total:  {}\n", summary.succeeded_total));
        }
        out.push_str(&format!("  failed:           {}\n", summary.failed));
        for failure in &summary.failures {
            out.push_str(&format!(
                "    {} [{}]: {}\n",
                failure.run, failure.stage, failure.detail
            ));
        }
        if summary.cancelled {
            out.push_str(&format!(
                "  stopped early; {} run(s) not started\n",
                summary.not_started
            ));
        }
        out
    }

    pub fn render_ledger(report: &LedgerReport) -> String {
        let counts = report.counts;
        let mut out = format!(
            "{}: {} pending, {} uploading, {} dispatched, {} succeeded, {} failed\n",
            report.state_file,
            counts.pending,
            counts.uploading,
            counts.dispatched,
            counts.succeeded,
            counts.failed
        );
        for entry in &report.runs {
            out.push_str(&format!(
                "  {:<14} {:<10} {}",
                entry.run,
                entry.status.to_string(),
                entry.updated_at.format("%Y-%m-%d %H:%M:%S")
            ));
            if let Some(backend_ref) = &entry.backend_ref {
                out.push_str(&format!("  invocation={backend_ref}"));
            }
            if let Some(state) = &entry.backend_state {
                out.push_str(&format!(" ({state})"));
            }
            if let Some(detail) = &entry.detail {
                out.push_str(&format!("  {detail}"));
            }
            out.push('\n');
        }
        out
    }
}

fn selector_label(selector: &WorkflowSelector) -> String {
    match selector {
        WorkflowSelector::Id(id) => format!("workflow id {id}"),
        WorkflowSelector::Name(name) => format!("workflow '{name}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{PlannedDispatch, RunFailure};
    use crate::domain::ReadLayout;

    #[test]
    fn summary_lists_failures_and_cancellation() {
        let summary = RunSummary {
            discovered: 3,
            resolved: 2,
            dispatched: 1,
            skipped: 1,
            failed: 1,
            succeeded_total: 2,
            cancelled: true,
            not_started: 1,
            failures: vec![RunFailure {
                run: "SRR3".to_string(),
                stage: "resolve",
                detail: "no FASTQ files".to_string(),
            }],
            ..RunSummary::default()
        };
        let text = TextOutput::render_summary(&summary);
        assert!(text.contains("succeeded total:  2"));
        assert!(text.contains("SRR3 [resolve]: no FASTQ files"));
        assert!(text.contains("1 run(s) not started"));
    }

    #[test]
    fn dry_run_plan_shows_read_volume_when_known() {
        let summary = RunSummary {
            dry_run: true,
            planned: vec![
                PlannedDispatch {
                    run: "SRR1".to_string(),
                    sample: "SAMN1".to_string(),
                    layout: ReadLayout::PairedEnd,
                    workflow: WorkflowSelector::Id("wf-p".to_string()),
                    read_count: Some(4000),
                    estimated_bytes: Some(250),
                },
                PlannedDispatch {
                    run: "SRR2".to_string(),
                    sample: "SRR2".to_string(),
                    layout: ReadLayout::SingleEnd,
                    workflow: WorkflowSelector::Name("Rice".to_string()),
                    read_count: None,
                    estimated_bytes: None,
                },
            ],
            ..RunSummary::default()
        };
        let text = TextOutput::render_summary(&summary);
        assert!(text.contains("via workflow id wf-p, 4000 reads, 250 bytes\n"));
        assert!(text.contains("via workflow 'Rice'\n"));
    }
}
