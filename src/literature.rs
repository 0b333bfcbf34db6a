use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use crate::domain::RunAccession;
use crate::error::DispatchError;
use crate::http::{HttpRequest, RetryClient, Transport};

pub const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const BATCH_SIZE: usize = 200;

pub trait LiteratureClient: Send + Sync {
    /// Sorted, deduplicated run accessions linked to the first `max_records` hits of `query`.
    fn discover(&self, query: &str, max_records: usize) -> Result<Vec<RunAccession>, DispatchError>;
}

#[derive(Debug, Clone, Default)]
pub struct EutilsOptions {
    pub email: Option<String>,
    pub api_key: Option<String>,
    /// Pause between batched calls to stay under the E-utilities rate limit.
    pub request_interval: Duration,
}

pub struct EutilsLiteratureResolver<T: Transport> {
    client: RetryClient<T>,
    base_url: String,
    options: EutilsOptions,
}

impl<T: Transport> EutilsLiteratureResolver<T> {
    pub fn new(client: RetryClient<T>, options: EutilsOptions) -> Self {
        Self::with_base_url(client, options, EUTILS_BASE)
    }

    pub fn with_base_url(client: RetryClient<T>, options: EutilsOptions, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            options,
        }
    }

    fn request(&self, endpoint: &str) -> HttpRequest {
        let mut request = HttpRequest::get(format!("{}/{endpoint}", self.base_url));
        if let Some(email) = &self.options.email {
            request = request.query("email", email.as_str());
        }
        if let Some(key) = &self.options.api_key {
            request = request.query("api_key", key.as_str());
        }
        request
    }

    fn pause(&self) {
        if !self.options.request_interval.is_zero() {
            thread::sleep(self.options.request_interval);
        }
    }

    pub fn search_pubmed(&self, query: &str, max_records: usize) -> Result<Vec<String>, DispatchError> {
        let request = self
            .request("esearch.fcgi")
            .query("db", "pubmed")
            .query("term", query)
            .query("retmax", max_records.to_string())
            .query("retmode", "json");
        let payload: Value = self.client.call_json(&request)?;
        let mut ids = string_list(&payload["esearchresult"]["idlist"]);
        ids.truncate(max_records);
        Ok(ids)
    }

    fn link_batch(&self, pmids: &[String]) -> Result<Vec<String>, DispatchError> {
        let request = self
            .request("elink.fcgi")
            .query("dbfrom", "pubmed")
            .query("db", "sra")
            .query("linkname", "pubmed_sra")
            .query("id", pmids.join(","))
            .query("retmode", "json");
        let payload: Value = self.client.call_json(&request)?;
        Ok(extract_links(&payload))
    }

    /// Maps PubMed records to SRA uids. A failing batch is retried record by
    /// record so that only the records that keep failing are skipped.
    pub fn link_to_sra(&self, pmids: &[String]) -> BTreeSet<String> {
        let mut sra_ids = BTreeSet::new();
        for batch in pmids.chunks(BATCH_SIZE) {
            match self.link_batch(batch) {
                Ok(ids) => sra_ids.extend(ids),
                Err(err) if batch.len() > 1 => {
                    tracing::warn!(
                        records = batch.len(),
                        error = %err,
                        "elink batch failed; retrying records individually"
                    );
                    for pmid in batch {
                        match self.link_batch(std::slice::from_ref(pmid)) {
                            Ok(ids) => sra_ids.extend(ids),
                            Err(err) => {
                                tracing::warn!(pmid = %pmid, error = %err, "skipping record");
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(pmid = %batch[0], error = %err, "skipping record");
                }
            }
            self.pause();
        }
        sra_ids
    }

    pub fn sra_runs(&self, sra_ids: &[String]) -> BTreeSet<RunAccession> {
        let mut runs = BTreeSet::new();
        for batch in sra_ids.chunks(BATCH_SIZE) {
            let request = self
                .request("esummary.fcgi")
                .query("db", "sra")
                .query("id", batch.join(","))
                .query("retmode", "json");
            match self.client.call_json::<Value>(&request) {
                Ok(payload) => runs.extend(extract_runs(&payload)),
                Err(err) => {
                    tracing::warn!(
                        records = batch.len(),
                        error = %err,
                        "skipping SRA summary batch"
                    );
                }
            }
            self.pause();
        }
        runs
    }
}

impl<T: Transport> LiteratureClient for EutilsLiteratureResolver<T> {
    fn discover(&self, query: &str, max_records: usize) -> Result<Vec<RunAccession>, DispatchError> {
        let pmids = self.search_pubmed(query, max_records)?;
        if pmids.is_empty() {
            return Ok(Vec::new());
        }
        let sra_ids = self.link_to_sra(&pmids).into_iter().collect::<Vec<_>>();
        if sra_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.sra_runs(&sra_ids).into_iter().collect())
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|item| match item {
                    Value::String(text) => Some(text.trim().to_string()),
                    Value::Number(num) => Some(num.to_string()),
                    _ => None,
                })
                .filter(|text| !text.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub fn extract_links(payload: &Value) -> Vec<String> {
    let mut output = Vec::new();
    if let Some(linksets) = payload["linksets"].as_array() {
        for linkset in linksets {
            if let Some(dbs) = linkset["linksetdbs"].as_array() {
                for db in dbs {
                    output.extend(string_list(&db["links"]));
                }
            }
        }
    }
    output.sort();
    output.dedup();
    output
}

fn run_regex() -> &'static Regex {
    static RUN_RE: OnceLock<Regex> = OnceLock::new();
    RUN_RE.get_or_init(|| Regex::new(r#"acc="([SED]RR\d+)""#).expect("static regex"))
}

pub fn extract_runs(payload: &Value) -> BTreeSet<RunAccession> {
    let mut runs = BTreeSet::new();
    let Some(uids) = payload["result"]["uids"].as_array() else {
        return runs;
    };
    for uid in uids.iter().filter_map(|uid| uid.as_str()) {
        if let Some(runs_xml) = payload["result"][uid]["runs"].as_str() {
            for cap in run_regex().captures_iter(runs_xml) {
                if let Some(run) = cap.get(1).and_then(|m| m.as_str().parse().ok()) {
                    runs.insert(run);
                }
            }
        }
    }
    runs
}
