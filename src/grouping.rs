use std::collections::HashMap;

use crate::domain::{RunAccession, RunMetadata, SampleGroup, SampleKey};

/// Partitions runs by sample, keeping first-seen order for both groups and
/// runs. A run listed twice keeps its first position but takes the metadata
/// resolved last.
pub fn group(runs: &[RunMetadata]) -> Vec<SampleGroup> {
    let mut order: Vec<RunAccession> = Vec::new();
    let mut latest: HashMap<&RunAccession, &RunMetadata> = HashMap::new();
    for metadata in runs {
        match latest.insert(&metadata.run, metadata) {
            None => order.push(metadata.run.clone()),
            Some(previous) if previous.sample != metadata.sample => {
                tracing::warn!(
                    run = %metadata.run,
                    previous = ?previous.sample.as_ref().map(|s| s.as_str()),
                    current = ?metadata.sample.as_ref().map(|s| s.as_str()),
                    "conflicting sample accession; using the last resolved value"
                );
            }
            Some(_) => {}
        }
    }

    let mut groups: Vec<SampleGroup> = Vec::new();
    let mut index: HashMap<SampleKey, usize> = HashMap::new();
    for run in &order {
        let metadata = latest[run];
        let key = SampleKey::for_run(metadata);
        match index.get(&key) {
            Some(&slot) => groups[slot].runs.push(metadata.clone()),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push(SampleGroup {
                    key,
                    runs: vec![metadata.clone()],
                });
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FastqFile, ReadFiles, SampleAccession};

    fn run(id: &str, sample: &str) -> RunMetadata {
        RunMetadata {
            run: id.parse().unwrap(),
            sample: SampleAccession::new(sample),
            reads: ReadFiles::Single {
                reads: FastqFile::new(format!("https://h/{id}.fastq.gz")),
            },
            files: vec![FastqFile::new(format!("https://h/{id}.fastq.gz"))],
            estimated_bytes: None,
            read_count: None,
        }
    }

    fn shape(groups: &[SampleGroup]) -> Vec<(String, Vec<String>)> {
        groups
            .iter()
            .map(|g| {
                (
                    g.key.to_string(),
                    g.runs.iter().map(|r| r.run.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn groups_keep_first_seen_order() {
        let runs = vec![run("SRR3", "S2"), run("SRR1", "S1"), run("SRR2", "S2")];
        assert_eq!(
            shape(&group(&runs)),
            vec![
                ("S2".to_string(), vec!["SRR3".to_string(), "SRR2".to_string()]),
                ("S1".to_string(), vec!["SRR1".to_string()]),
            ]
        );
    }

    #[test]
    fn unknown_samples_stay_separate() {
        let runs = vec![run("SRR1", ""), run("SRR2", " "), run("SRR3", "S1")];
        let groups = group(&runs);
        assert_eq!(groups.len(), 3);
        assert!(matches!(groups[0].key, SampleKey::Ungrouped(_)));
        assert_eq!(groups[1].key.as_str(), "SRR2");
    }

    #[test]
    fn ungrouped_run_never_merges_with_same_named_sample() {
        let runs = vec![run("SRR1", ""), run("SRR2", "SRR1")];
        assert_eq!(group(&runs).len(), 2);
    }

    #[test]
    fn last_resolved_sample_wins() {
        let runs = vec![run("SRR1", "S1"), run("SRR2", "S1"), run("SRR1", "S9")];
        assert_eq!(
            shape(&group(&runs)),
            vec![
                ("S9".to_string(), vec!["SRR1".to_string()]),
                ("S1".to_string(), vec!["SRR2".to_string()]),
            ]
        );
    }

    #[test]
    fn grouping_is_deterministic() {
        let runs = vec![run("SRR1", "A"), run("SRR2", "B"), run("SRR3", "A")];
        assert_eq!(group(&runs), group(&runs));
    }
}
