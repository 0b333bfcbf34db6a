use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunAccession(String);

impl RunAccession {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunAccession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunAccession {
    type Err = DispatchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.');
        if !is_valid {
            return Err(DispatchError::InvalidRunAccession(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for RunAccession {
    type Error = DispatchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RunAccession> for String {
    fn from(value: RunAccession) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleAccession(String);

impl SampleAccession {
    /// Returns `None` for blank values, which the archive uses for unknown samples.
    pub fn new(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleAccession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadLayout {
    SingleEnd,
    PairedEnd,
}

impl fmt::Display for ReadLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadLayout::SingleEnd => write!(f, "single"),
            ReadLayout::PairedEnd => write!(f, "paired"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastqFile {
    pub url: String,
    pub md5: Option<String>,
    pub bytes: Option<u64>,
}

impl FastqFile {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            md5: None,
            bytes: None,
        }
    }

    /// Last path segment of the URL.
    pub fn file_name(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(self.url.as_str())
    }
}

/// Read files that feed a workflow, one variant per layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum ReadFiles {
    Single { reads: FastqFile },
    Paired { forward: FastqFile, reverse: FastqFile },
}

impl ReadFiles {
    pub fn layout(&self) -> ReadLayout {
        match self {
            ReadFiles::Single { .. } => ReadLayout::SingleEnd,
            ReadFiles::Paired { .. } => ReadLayout::PairedEnd,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run: RunAccession,
    pub sample: Option<SampleAccession>,
    pub reads: ReadFiles,
    /// Every file the archive reported, in archive order.
    pub files: Vec<FastqFile>,
    pub estimated_bytes: Option<u64>,
    pub read_count: Option<u64>,
}

impl RunMetadata {
    pub fn layout(&self) -> ReadLayout {
        self.reads.layout()
    }
}

/// Grouping key; runs without a sample accession stay on their own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SampleKey {
    Sample(SampleAccession),
    Ungrouped(RunAccession),
}

impl SampleKey {
    pub fn for_run(metadata: &RunMetadata) -> Self {
        match &metadata.sample {
            Some(sample) => SampleKey::Sample(sample.clone()),
            None => SampleKey::Ungrouped(metadata.run.clone()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SampleKey::Sample(sample) => sample.as_str(),
            SampleKey::Ungrouped(run) => run.as_str(),
        }
    }

    /// Suffix for per-sample history names. Ungrouped runs are prefixed so a
    /// run accession never collides with a sample named the same.
    pub fn history_label(&self) -> String {
        match self {
            SampleKey::Sample(sample) => sample.as_str().to_string(),
            SampleKey::Ungrouped(run) => format!("ungrouped_{run}"),
        }
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleGroup {
    pub key: SampleKey,
    pub runs: Vec<RunMetadata>,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_run_accession_normalizes() {
        let run: RunAccession = " srr014966 ".parse().unwrap();
        assert_eq!(run.as_str(), "SRR014966");
    }

    #[test]
    fn parse_run_accession_rejects_blank() {
        let err = "  ".parse::<RunAccession>().unwrap_err();
        assert_matches!(err, DispatchError::InvalidRunAccession(_));
        let err = "SRR 1".parse::<RunAccession>().unwrap_err();
        assert_matches!(err, DispatchError::InvalidRunAccession(_));
    }

    #[test]
    fn blank_sample_is_unknown() {
        assert!(SampleAccession::new(" ").is_none());
        assert_eq!(SampleAccession::new("SAMN1").unwrap().as_str(), "SAMN1");
    }

    #[test]
    fn fastq_file_name() {
        let file = FastqFile::new("https://ftp.sra.ebi.ac.uk/vol1/fastq/SRR1_1.fastq.gz");
        assert_eq!(file.file_name(), "SRR1_1.fastq.gz");
    }

    #[test]
    fn ungrouped_history_label_is_prefixed() {
        let grouped = SampleKey::Sample(SampleAccession::new("SRR1").unwrap());
        let ungrouped = SampleKey::Ungrouped("SRR1".parse().unwrap());
        assert_eq!(grouped.history_label(), "SRR1");
        assert_eq!(ungrouped.history_label(), "ungrouped_SRR1");
    }
}
