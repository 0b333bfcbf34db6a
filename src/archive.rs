use serde::Deserialize;

use crate::domain::{FastqFile, ReadFiles, RunAccession, RunMetadata, SampleAccession};
use crate::error::DispatchError;
use crate::http::{HttpRequest, RetryClient, Transport};

pub const ENA_FILEREPORT: &str = "https://www.ebi.ac.uk/ena/portal/api/filereport";
const FILEREPORT_FIELDS: &str =
    "run_accession,sample_accession,library_layout,fastq_ftp,fastq_md5,fastq_bytes,read_count";

pub trait ArchiveClient: Send + Sync {
    fn resolve_run(&self, run: &RunAccession) -> Result<RunMetadata, DispatchError>;
}

/// One row of the ENA `read_run` file report. ENA reports every field as a string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileReportRow {
    #[serde(default)]
    pub run_accession: Option<String>,
    #[serde(default)]
    pub sample_accession: Option<String>,
    #[serde(default)]
    pub library_layout: Option<String>,
    #[serde(default)]
    pub fastq_ftp: Option<String>,
    #[serde(default)]
    pub fastq_md5: Option<String>,
    #[serde(default)]
    pub fastq_bytes: Option<String>,
    #[serde(default)]
    pub read_count: Option<String>,
}

pub struct EnaRunResolver<T: Transport> {
    client: RetryClient<T>,
    endpoint: String,
}

impl<T: Transport> EnaRunResolver<T> {
    pub fn new(client: RetryClient<T>) -> Self {
        Self::with_endpoint(client, ENA_FILEREPORT)
    }

    pub fn with_endpoint(client: RetryClient<T>, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
        }
    }
}

impl<T: Transport> ArchiveClient for EnaRunResolver<T> {
    fn resolve_run(&self, run: &RunAccession) -> Result<RunMetadata, DispatchError> {
        let request = HttpRequest::get(self.endpoint.as_str())
            .query("accession", run.as_str())
            .query("result", "read_run")
            .query("fields", FILEREPORT_FIELDS)
            .query("format", "json");
        let response = self.client.call(&request)?;
        // ENA answers an unknown accession with an empty body rather than `[]`.
        if response.body.trim().is_empty() {
            return Err(unknown_run(run));
        }
        let rows: Vec<FileReportRow> =
            serde_json::from_str(&response.body).map_err(|err| DispatchError::MetadataResolution {
                run: run.to_string(),
                message: format!("malformed file report: {err}"),
            })?;
        let row = rows.into_iter().next().ok_or_else(|| unknown_run(run))?;
        metadata_from_row(run, &row)
    }
}

fn unknown_run(run: &RunAccession) -> DispatchError {
    DispatchError::MetadataResolution {
        run: run.to_string(),
        message: "accession is unknown to the archive".to_string(),
    }
}

pub fn metadata_from_row(run: &RunAccession, row: &FileReportRow) -> Result<RunMetadata, DispatchError> {
    let urls = split_field(row.fastq_ftp.as_deref())
        .into_iter()
        .map(|part| normalize_url(&part))
        .collect::<Vec<_>>();
    if urls.is_empty() {
        return Err(DispatchError::MetadataResolution {
            run: run.to_string(),
            message: "no FASTQ files reported".to_string(),
        });
    }

    let count = urls.len();
    let md5 = split_field(row.fastq_md5.as_deref());
    let bytes = split_field(row.fastq_bytes.as_deref())
        .iter()
        .map(|value| value.parse::<u64>().ok())
        .collect::<Vec<_>>();
    let files = urls
        .into_iter()
        .enumerate()
        .map(|(idx, url)| FastqFile {
            md5: (md5.len() == count).then(|| md5[idx].clone()),
            bytes: if bytes.len() == count { bytes[idx] } else { None },
            url,
        })
        .collect::<Vec<_>>();

    let estimated_bytes = files
        .iter()
        .map(|file| file.bytes)
        .sum::<Option<u64>>();
    let read_count = row
        .read_count
        .as_deref()
        .and_then(|value| value.trim().parse().ok());
    let declared = row
        .library_layout
        .as_deref()
        .map(|value| value.trim().to_uppercase())
        .unwrap_or_default();

    Ok(RunMetadata {
        run: run.clone(),
        sample: row.sample_accession.as_deref().and_then(SampleAccession::new),
        reads: classify_layout(&files, &declared),
        files,
        estimated_bytes,
        read_count,
    })
}

/// Paired only when two mate files can be identified; a lone file or an
/// ambiguous set is treated as single-end on the first file. `files` is never empty.
fn classify_layout(files: &[FastqFile], declared: &str) -> ReadFiles {
    let single = || ReadFiles::Single {
        reads: files[0].clone(),
    };
    if declared == "SINGLE" || files.len() < 2 {
        return single();
    }

    let forward = files
        .iter()
        .filter(|file| mate_number(file) == Some(1))
        .collect::<Vec<_>>();
    let reverse = files
        .iter()
        .filter(|file| mate_number(file) == Some(2))
        .collect::<Vec<_>>();
    if forward.len() == 1 && reverse.len() == 1 {
        return ReadFiles::Paired {
            forward: forward[0].clone(),
            reverse: reverse[0].clone(),
        };
    }
    if files.len() == 2 && declared == "PAIRED" {
        return ReadFiles::Paired {
            forward: files[0].clone(),
            reverse: files[1].clone(),
        };
    }
    single()
}

fn mate_number(file: &FastqFile) -> Option<u8> {
    let name = file.file_name();
    let stem = name
        .strip_suffix(".gz")
        .unwrap_or(name)
        .trim_end_matches(".fastq")
        .trim_end_matches(".fq");
    if stem.ends_with("_1") {
        Some(1)
    } else if stem.ends_with("_2") {
        Some(2)
    } else {
        None
    }
}

fn split_field(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn normalize_url(part: &str) -> String {
    if part.starts_with("https://") || part.starts_with("http://") {
        return part.to_string();
    }
    if let Some(rest) = part.strip_prefix("ftp://") {
        return format!("https://{rest}");
    }
    format!("https://{part}")
}
