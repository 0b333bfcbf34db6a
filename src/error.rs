use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

use crate::state::RunStatus;

#[derive(Debug, Error, Diagnostic)]
pub enum DispatchError {
    #[error("invalid run accession: {0}")]
    InvalidRunAccession(String),

    #[error("{service} request failed after {attempts} attempt(s): {message}")]
    #[diagnostic(help("the service may be overloaded; re-run later to retry this run"))]
    ExternalService {
        service: &'static str,
        attempts: usize,
        status: Option<u16>,
        message: String,
    },

    #[error("{service} rejected the request with status {status}: {message}")]
    ClientRequest {
        service: &'static str,
        status: u16,
        message: String,
    },

    #[error("metadata for {run} could not be resolved: {message}")]
    MetadataResolution { run: String, message: String },

    #[error("state file {path} is unreadable: {message}")]
    #[diagnostic(help("fix or remove the file, or pass --reset-state to start over"))]
    StateCorruption { path: Utf8PathBuf, message: String },

    #[error("invalid state transition for {run}: {from} -> {to}")]
    InvalidTransition {
        run: String,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("missing backend setting: {0}")]
    #[diagnostic(help("pass --galaxy-url and --galaxy-api-key, or use --dry-run"))]
    MissingCredential(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("workflow named '{0}' was not found")]
    WorkflowNotFound(String),

    #[error("multiple workflows named '{0}' found; use an explicit workflow ID")]
    AmbiguousWorkflow(String),

    #[error("workflow {workflow} has no input labelled '{label}'")]
    WorkflowInputNotFound { workflow: String, label: String },

    #[error("{service} returned an unexpected payload: {message}")]
    UnexpectedPayload {
        service: &'static str,
        message: String,
    },
}

impl DispatchError {
    /// Errors recorded against a single run; everything else aborts the invocation.
    pub fn is_run_scoped(&self) -> bool {
        matches!(
            self,
            DispatchError::ExternalService { .. }
                | DispatchError::ClientRequest { .. }
                | DispatchError::MetadataResolution { .. }
                | DispatchError::UnexpectedPayload { .. }
        )
    }
}
