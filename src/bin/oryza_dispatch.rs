use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use oryza_dispatch::app::{App, CancelToken, ProgressSink, RunSummary, ledger_entries};
use oryza_dispatch::archive::{ArchiveClient, EnaRunResolver};
use oryza_dispatch::backend::{ApiKey, Backend, GalaxyBackend, WorkflowInputs};
use oryza_dispatch::config::{ConfigLayer, ConfigLoader, DEFAULT_STATE_FILE, RunFlags};
use oryza_dispatch::domain::{RunAccession, RunMetadata};
use oryza_dispatch::error::DispatchError;
use oryza_dispatch::http::{ReqwestTransport, RetryClient, RetryPolicy};
use oryza_dispatch::literature::{EutilsLiteratureResolver, EutilsOptions, LiteratureClient};
use oryza_dispatch::output::{JsonOutput, LedgerReport, OutputMode, RetryReport, TextOutput};
use oryza_dispatch::state::StateStore;

const EXIT_RUNS_FAILED: u8 = 4;

#[derive(Parser)]
#[command(name = "oryza-dispatch")]
#[command(about = "Find rice sequencing runs in the literature and dispatch variant calling to Galaxy")]
#[command(version, author)]
struct Cli {
    /// Print machine-readable JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Discover, resolve, group and dispatch runs")]
    Run(RunArgs),
    #[command(about = "Show the dispatch ledger")]
    Status(StatusArgs),
    #[command(about = "Mark failed runs pending so the next run retries them")]
    Retry(RetryArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: Option<Utf8PathBuf>,

    #[arg(long)]
    query: Option<String>,

    #[arg(long)]
    max_records: Option<usize>,

    /// Cap on discovered runs; 0 disables the cap.
    #[arg(long)]
    max_runs: Option<usize>,

    #[arg(long, env = "NCBI_EMAIL")]
    email: Option<String>,

    #[arg(long, env = "NCBI_API_KEY", hide_env_values = true)]
    ncbi_api_key: Option<String>,

    #[arg(long, env = "GALAXY_URL")]
    galaxy_url: Option<String>,

    #[arg(long, env = "GALAXY_API_KEY", hide_env_values = true)]
    galaxy_api_key: Option<String>,

    #[arg(long)]
    single_workflow_id: Option<String>,

    #[arg(long)]
    single_workflow_name: Option<String>,

    #[arg(long)]
    paired_workflow_id: Option<String>,

    #[arg(long)]
    paired_workflow_name: Option<String>,

    #[arg(long)]
    single_input_label: Option<String>,

    #[arg(long)]
    paired_input_label: Option<String>,

    #[arg(long)]
    reference_input_label: Option<String>,

    #[arg(long)]
    reference_url: Option<String>,

    #[arg(long)]
    reference_dataset_id: Option<String>,

    #[arg(long)]
    history_id: Option<String>,

    #[arg(long)]
    history_name: Option<String>,

    /// One history per sample; `--history-per-sample=false` overrides the config file.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    history_per_sample: Option<bool>,

    #[arg(long)]
    state_file: Option<Utf8PathBuf>,

    /// Ignore the existing ledger and start over.
    #[arg(long)]
    reset_state: bool,

    /// Resolve and group without touching the backend or the ledger.
    #[arg(long)]
    dry_run: bool,
}

impl RunArgs {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            query: self.query.clone(),
            max_records: self.max_records,
            max_runs: self.max_runs,
            email: self.email.clone(),
            galaxy_url: self.galaxy_url.clone(),
            single_workflow_id: self.single_workflow_id.clone(),
            single_workflow_name: self.single_workflow_name.clone(),
            paired_workflow_id: self.paired_workflow_id.clone(),
            paired_workflow_name: self.paired_workflow_name.clone(),
            single_input_label: self.single_input_label.clone(),
            paired_input_label: self.paired_input_label.clone(),
            reference_input_label: self.reference_input_label.clone(),
            reference_url: self.reference_url.clone(),
            reference_dataset_id: self.reference_dataset_id.clone(),
            history_id: self.history_id.clone(),
            history_name: self.history_name.clone(),
            history_per_sample: self.history_per_sample,
            state_file: self.state_file.clone(),
        }
    }
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    config: Option<Utf8PathBuf>,

    #[arg(long)]
    state_file: Option<Utf8PathBuf>,

    /// Ask the backend for the current state of each invocation.
    #[arg(long)]
    refresh: bool,

    #[arg(long, env = "GALAXY_URL")]
    galaxy_url: Option<String>,

    #[arg(long, env = "GALAXY_API_KEY", hide_env_values = true)]
    galaxy_api_key: Option<String>,
}

#[derive(Args)]
struct RetryArgs {
    #[arg(long)]
    config: Option<Utf8PathBuf>,

    #[arg(long)]
    state_file: Option<Utf8PathBuf>,

    /// Runs to reset; all failed runs when omitted.
    runs: Vec<String>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<DispatchError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &DispatchError) -> u8 {
    match error {
        DispatchError::StateCorruption { .. }
        | DispatchError::MissingCredential(_)
        | DispatchError::Config(_)
        | DispatchError::ConfigRead(_)
        | DispatchError::ConfigParse(_)
        | DispatchError::WorkflowNotFound(_)
        | DispatchError::AmbiguousWorkflow(_)
        | DispatchError::WorkflowInputNotFound { .. } => 2,
        DispatchError::ExternalService { .. }
        | DispatchError::ClientRequest { .. }
        | DispatchError::UnexpectedPayload { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    match cli.command {
        Commands::Run(args) => run_dispatch(args, output_mode),
        Commands::Status(args) => run_status(args, output_mode),
        Commands::Retry(args) => run_retry(args, output_mode),
    }
}

fn run_dispatch(args: RunArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let flags = RunFlags {
        reset: args.reset_state,
        dry_run: args.dry_run,
    };
    let resolved = ConfigLoader::resolve(args.config.as_deref(), args.layer(), flags)?;
    let pipeline = resolved.pipeline;

    let literature = EutilsLiteratureResolver::new(
        RetryClient::new("ncbi", ReqwestTransport::new()?, RetryPolicy::default()),
        EutilsOptions {
            email: resolved.services.email.clone(),
            api_key: args.ncbi_api_key.clone(),
            request_interval: Duration::from_millis(340),
        },
    );
    let archive = EnaRunResolver::new(RetryClient::new(
        "ena",
        ReqwestTransport::new()?,
        RetryPolicy::default(),
    ));

    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());

    let summary = if pipeline.dry_run {
        let app = App::new(literature, archive, OfflineBackend);
        app.run(&pipeline, sink_for(output_mode), &cancel)?
    } else {
        let url = resolved
            .services
            .galaxy_url
            .ok_or(DispatchError::MissingCredential("galaxy url"))?;
        let backend = galaxy_backend(&url, args.galaxy_api_key.as_deref())?;
        let app = App::new(literature, archive, backend);
        app.run(&pipeline, sink_for(output_mode), &cancel)?
    };

    print_summary(&summary, output_mode)?;
    if summary.has_failures() {
        return Ok(ExitCode::from(EXIT_RUNS_FAILED));
    }
    Ok(ExitCode::SUCCESS)
}

fn run_status(args: StatusArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let layer = ConfigLoader::layered(
        args.config.as_deref(),
        ConfigLayer {
            state_file: args.state_file.clone(),
            galaxy_url: args.galaxy_url.clone(),
            ..ConfigLayer::default()
        },
    )?;
    let state_file = layer
        .state_file
        .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_STATE_FILE));
    let store = StateStore::load(state_file, false)?;
    let mut runs = ledger_entries(&store);
    if args.refresh {
        let url = layer
            .galaxy_url
            .ok_or(DispatchError::MissingCredential("galaxy url"))?;
        let backend = galaxy_backend(&url, args.galaxy_api_key.as_deref())?;
        App::new(NopLiterature, NopArchive, backend).refresh_ledger(&mut runs);
    }
    let report = LedgerReport {
        state_file: store.path().to_string(),
        counts: store.counts(),
        runs,
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_ledger(&report).into_diagnostic()?,
        OutputMode::Human => print!("{}", TextOutput::render_ledger(&report)),
    }
    Ok(ExitCode::SUCCESS)
}

fn run_retry(args: RetryArgs, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let runs = args
        .runs
        .iter()
        .map(|run| run.parse::<RunAccession>())
        .collect::<Result<Vec<_>, _>>()?;
    let state_file = ConfigLoader::state_file(args.config.as_deref(), args.state_file.clone())?;
    let mut store = StateStore::load(state_file, false)?;
    let reset = store.reset_failed(&runs)?;
    if !reset.is_empty() {
        store.persist()?;
    }
    let report = RetryReport {
        state_file: store.path().to_string(),
        reset,
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_retry(&report).into_diagnostic()?,
        OutputMode::Human => println!(
            "{} failed run(s) reset to pending in {}",
            report.reset.len(),
            report.state_file
        ),
    }
    Ok(ExitCode::SUCCESS)
}

fn galaxy_backend(url: &str, api_key: Option<&str>) -> Result<GalaxyBackend<ReqwestTransport>, DispatchError> {
    let key = api_key
        .and_then(ApiKey::new)
        .ok_or(DispatchError::MissingCredential("galaxy api key"))?;
    let transport = ReqwestTransport::with_headers(&[("x-api-key", key.expose())])?;
    Ok(GalaxyBackend::new(
        RetryClient::new("galaxy", transport, RetryPolicy::default()),
        url,
    ))
}

fn sink_for(output_mode: OutputMode) -> &'static dyn ProgressSink {
    match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &TextOutput,
    }
}

fn print_summary(summary: &RunSummary, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::Json => JsonOutput::print_summary(summary).into_diagnostic(),
        OutputMode::Human => {
            print!("{}", TextOutput::render_summary(summary));
            Ok(())
        }
    }
}

/// First Ctrl-C asks the dispatcher to stop after the current run; a second one exits.
fn install_interrupt_handler(cancel: CancelToken) {
    let spawned = thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    tracing::warn!("interrupt handler unavailable: {err}");
                    return;
                }
            };
            if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                tracing::warn!("interrupt received; finishing the current run before stopping");
                cancel.cancel();
            }
            if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                std::process::exit(130);
            }
        });
    if let Err(err) = spawned {
        tracing::warn!("interrupt handler unavailable: {err}");
    }
}

struct NopLiterature;
struct NopArchive;
struct OfflineBackend;

impl LiteratureClient for NopLiterature {
    fn discover(&self, _query: &str, _max_records: usize) -> Result<Vec<RunAccession>, DispatchError> {
        Err(DispatchError::Config("literature search not configured".to_string()))
    }
}

impl ArchiveClient for NopArchive {
    fn resolve_run(&self, run: &RunAccession) -> Result<RunMetadata, DispatchError> {
        Err(DispatchError::MetadataResolution {
            run: run.to_string(),
            message: "archive client not configured".to_string(),
        })
    }
}

impl OfflineBackend {
    fn offline() -> DispatchError {
        DispatchError::Config("backend is not contacted in a dry run".to_string())
    }
}

impl Backend for OfflineBackend {
    fn find_workflow(&self, _name: &str) -> Result<String, DispatchError> {
        Err(Self::offline())
    }

    fn workflow_input(&self, _workflow_id: &str, _label: Option<&str>) -> Result<String, DispatchError> {
        Err(Self::offline())
    }

    fn ensure_history(&self, _name: &str) -> Result<String, DispatchError> {
        Err(Self::offline())
    }

    fn upload_dataset(
        &self,
        _history_id: &str,
        _url: &str,
        _name: &str,
        _md5: Option<&str>,
    ) -> Result<String, DispatchError> {
        Err(Self::offline())
    }

    fn create_paired_collection(
        &self,
        _history_id: &str,
        _forward_id: &str,
        _reverse_id: &str,
        _name: &str,
    ) -> Result<String, DispatchError> {
        Err(Self::offline())
    }

    fn invoke_workflow(
        &self,
        _workflow_id: &str,
        _history_id: &str,
        _inputs: &WorkflowInputs,
    ) -> Result<String, DispatchError> {
        Err(Self::offline())
    }

    fn invocation_state(&self, _invocation_id: &str) -> Result<String, DispatchError> {
        Err(Self::offline())
    }
}
