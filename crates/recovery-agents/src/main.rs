//! recovery-agents: run disruption recovery from the command line
//!
//! # Usage
//!
//! ```bash
//! # One run against fixture data, printing the outcome JSON
//! recovery-agents run --scenario "Flight XY123 (N123AB) at ORD delayed 3 hours" --data fixtures.json
//!
//! # Submit and poll instead of waiting in place, appending an audit log
//! recovery-agents run --scenario scenario.json --audit-log audit.jsonl --async
//!
//! # Resume a derived-index build
//! recovery-agents build-indexes --state-file .recovery/indexes.json --mode resume
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use coordination::reasoner::opinion_schema;
use coordination::{
    AuditSink, IndexBuildRunner, IndexDefinition, JsonlAuditSink, KvBackend, OrchestratorConfig,
    PhaseController, RecoveryService, ResumeMode, RunOutcome, RunStatusReport,
};
use recovery_agents::config::check_endpoint;
use recovery_agents::{default_config, load_scenario, AgentsConfig, FixtureData, HttpReasoner};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one disruption through both agent phases and arbitration
    Run(RunArgs),
    /// Build derived secondary indexes, resuming from a checkpoint file
    BuildIndexes(BuildArgs),
    /// Print the JSON schema reasoner output must satisfy
    Schema,
}

#[derive(Args, Debug)]
struct DataArgs {
    /// Fixture JSON mapping table names to records
    #[arg(long)]
    data: Option<PathBuf>,

    /// RocksDB state directory; fixture records are written into it
    #[cfg(feature = "rocksdb-store")]
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to a scenario JSON file, or a free-text disruption report
    #[arg(long)]
    scenario: String,

    /// Orchestrator TOML (roster, timeouts, retrieval tuning)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    data: DataArgs,

    /// Append the sealed audit record to this JSONL file
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// Submit the run and poll its status instead of awaiting it
    #[arg(long = "async", default_value_t = false)]
    async_mode: bool,
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Checkpoint file recording per-step progress
    #[arg(long)]
    state_file: PathBuf,

    /// fresh, resume or retry-failed
    #[arg(long, default_value = "resume")]
    mode: ResumeMode,

    /// Orchestrator TOML supplying the retry schedule
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    data: DataArgs,
}

/// Record backend plus whatever else the storage choice provides
struct Storage {
    backend: Arc<dyn KvBackend>,
    sink: Option<Arc<dyn AuditSink>>,
    indexes: Vec<IndexDefinition>,
}

fn open_storage(args: &DataArgs) -> Result<Storage> {
    let fixture = match &args.data {
        Some(path) => FixtureData::load(path)
            .with_context(|| format!("Failed to load fixture {}", path.display()))?,
        None => FixtureData::default(),
    };
    let indexes = fixture.index_definitions();

    if let Some(storage) = open_state_store(args, &fixture, &indexes)? {
        return Ok(storage);
    }

    info!(
        records = fixture.record_count(),
        tables = fixture.tables.len(),
        "Fixture loaded into memory"
    );
    Ok(Storage {
        backend: Arc::new(fixture.to_backend()),
        sink: None,
        indexes,
    })
}

#[cfg(feature = "rocksdb-store")]
fn open_state_store(
    args: &DataArgs,
    fixture: &FixtureData,
    indexes: &[IndexDefinition],
) -> Result<Option<Storage>> {
    let Some(dir) = &args.state_dir else {
        return Ok(None);
    };
    let store = coordination::StateStore::open(dir)
        .with_context(|| format!("Failed to open state store {}", dir.display()))?
        .shared();
    let written = fixture
        .write_to_store(&store)
        .context("Failed to write fixture records")?;
    info!(records = written, path = %dir.display(), "Fixture written to state store");
    Ok(Some(Storage {
        backend: store.clone() as Arc<dyn KvBackend>,
        sink: Some(store as Arc<dyn AuditSink>),
        indexes: indexes.to_vec(),
    }))
}

#[cfg(not(feature = "rocksdb-store"))]
fn open_state_store(
    _args: &DataArgs,
    _fixture: &FixtureData,
    _indexes: &[IndexDefinition],
) -> Result<Option<Storage>> {
    Ok(None)
}

fn cancel_on_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            cancel.cancel();
        }
    });
}

async fn run(args: RunArgs) -> Result<()> {
    let agents = AgentsConfig::default();
    let config = match &args.config {
        Some(path) => {
            let mut config = OrchestratorConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            agents.apply_models(&mut config);
            config
        }
        None => default_config(&agents),
    };

    let storage = open_storage(&args.data)?;
    for index in &storage.indexes {
        storage
            .backend
            .create_index(index)
            .await
            .with_context(|| format!("Failed to create index {}", index.name))?;
    }

    if !check_endpoint(&agents.endpoint).await {
        warn!(
            url = %agents.endpoint.base_url,
            "Reasoner endpoint not reachable; agents will report errors"
        );
    }
    let reasoner = HttpReasoner::new(agents.endpoint.clone()).context("Failed to build reasoner client")?;

    let mut controller = PhaseController::new(config, Arc::new(reasoner), storage.backend)
        .context("Invalid orchestrator configuration")?;
    let sink = match &args.audit_log {
        Some(path) => Some(Arc::new(JsonlAuditSink::new(path)) as Arc<dyn AuditSink>),
        None => storage.sink,
    };
    if let Some(sink) = sink {
        controller = controller.with_audit_sink(sink);
    }

    let scenario = load_scenario(&args.scenario).context("Failed to load scenario")?;
    info!(
        scenario = %scenario.id,
        flight = ?scenario.flight_number,
        aircraft = ?scenario.aircraft_registration,
        "Disruption recovery starting"
    );

    let service = Arc::new(RecoveryService::new(controller));
    {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                service.shutdown();
            }
        });
    }

    let outcome = if args.async_mode {
        let request_id = service.submit(scenario).await;
        info!(request_id = %request_id, "Run submitted, polling status");
        poll_until_finished(&service, &request_id).await?
    } else {
        service.run_sync(scenario).await
    };

    info!(
        run_id = %outcome.run_id,
        status = %outcome.status,
        explanation = %outcome.explanation,
        "Run finished"
    );
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn poll_until_finished(service: &RecoveryService, request_id: &str) -> Result<RunOutcome> {
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        match service.status(request_id).await {
            Some(RunStatusReport::Processing) => continue,
            Some(RunStatusReport::Complete { outcome }) => return Ok(*outcome),
            Some(RunStatusReport::Error { message }) => bail!("Run {request_id} failed: {message}"),
            None => bail!("Run {request_id} is unknown to the service"),
        }
    }
}

async fn build_indexes(args: BuildArgs) -> Result<()> {
    let retrieval = match &args.config {
        Some(path) => {
            OrchestratorConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?
                .retrieval
        }
        None => OrchestratorConfig::default().retrieval,
    };

    let storage = open_storage(&args.data)?;
    let runner = IndexBuildRunner::new(storage.backend, retrieval, &args.state_file);
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let report = runner
        .run(&storage.indexes, args.mode, &cancel)
        .await
        .with_context(|| format!("Failed to write checkpoint {}", args.state_file.display()))?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_success() {
        bail!(
            "{} index step(s) failed and {} did not run; rerun with --mode retry-failed",
            report.failed.len(),
            report.not_run.len()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Run(args) => run(args).await,
        Command::BuildIndexes(args) => build_indexes(args).await,
        Command::Schema => {
            println!("{}", serde_json::to_string_pretty(&opinion_schema())?);
            Ok(())
        }
    }
}
