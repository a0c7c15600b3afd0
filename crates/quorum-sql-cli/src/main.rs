use std::io::{self, BufReader};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use quorum_sql_backend::{run_worker, BackendConfig, WorkerCommand};
use quorum_sql_domain::RunId;
use quorum_sql_orchestrator::{Orchestrator, RunConfig};
use quorum_sql_profile::{load_profile_from_path, load_tasks_from_path};
use quorum_sql_provider::{BindingGeneratorFactory, Generator, GeneratorFactory, SessionRole};
use quorum_sql_trace_core::TraceStore;
use quorum_sql_trace_sqlite::SqliteTraceStore;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "quorum-sql")]
#[command(about = "Text-to-SQL with self-refinement, majority voting and SQLite audit traces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Run(RunArgs),
    /// Execute one query against a read-only `SQLite` file; spawned by `run`.
    SqliteWorker(WorkerArgs),
    Trace(TraceArgs),
    Replay(ReplayArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    profile: PathBuf,
    #[arg(long)]
    tasks: PathBuf,
    #[arg(long)]
    output_dir: PathBuf,
    /// Defaults to `<output-dir>/trace.sqlite`.
    #[arg(long)]
    trace_db: Option<PathBuf>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long, default_value_t = false)]
    force_revote: bool,
    #[arg(long)]
    num_workers: Option<usize>,
}

#[derive(Debug, Args)]
struct WorkerArgs {
    #[arg(long)]
    db: PathBuf,
}

#[derive(Debug, Args)]
struct ReplayArgs {
    #[arg(long)]
    trace_db: PathBuf,
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Args)]
struct TraceArgs {
    #[command(subcommand)]
    command: TraceSubcommand,
}

#[derive(Debug, Subcommand)]
enum TraceSubcommand {
    Runs {
        #[arg(long)]
        trace_db: PathBuf,
    },
    Events {
        #[arg(long)]
        trace_db: PathBuf,
        #[arg(long)]
        run_id: String,
    },
    Tasks {
        #[arg(long)]
        trace_db: PathBuf,
        #[arg(long)]
        run_id: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Run(args) => run_command(args),
        Commands::SqliteWorker(args) => worker_command(&args),
        Commands::Trace(args) => trace_command(args),
        Commands::Replay(args) => replay_command(&args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run_command(args: RunArgs) -> Result<()> {
    let envelope = load_profile_from_path(&args.profile)?;
    let tasks = load_tasks_from_path(&args.tasks)?;
    let profile = &envelope.profile;
    info!(
        profile = %profile.profile_name,
        tasks = tasks.len(),
        "loaded profile and task manifest"
    );

    let trace_db = args
        .trace_db
        .clone()
        .unwrap_or_else(|| args.output_dir.join("trace.sqlite"));
    std::fs::create_dir_all(&args.output_dir)?;
    let trace_store = SqliteTraceStore::open(&trace_db)?;

    let worker = match &profile.backend.worker_program {
        Some(program) => WorkerCommand::sqlite_worker(program.clone()),
        None => WorkerCommand::current_exe()?,
    };
    let backends = BackendConfig {
        credentials_path: profile.backend.credentials_path.clone(),
        worker,
    };
    let generators = BindingGeneratorFactory::new(profile.generator.clone(), profile.judge.clone());

    let config = RunConfig {
        run_id: args.run_id.as_deref().map(parse_run_id).transpose()?,
        output_dir: args.output_dir.clone(),
        force_revote: args.force_revote,
        num_workers: args.num_workers,
        cli_args_json: json!({
            "profile": args.profile,
            "tasks": args.tasks,
            "output_dir": args.output_dir,
            "trace_db": trace_db,
            "force_revote": args.force_revote,
            "num_workers": args.num_workers,
        }),
        ..RunConfig::default()
    };

    let summary =
        Orchestrator::new(&trace_store, &generators, &backends).execute_run(&envelope, &tasks, config)?;

    let tally = &summary.tally;
    println!(
        "run_id={} status={} tasks={} finalized={} abstained={} no_candidates={} skipped={} failed={}",
        summary.run_id,
        summary.status.as_str(),
        tally.tasks,
        tally.finalized,
        tally.abstained,
        tally.no_candidates,
        tally.skipped,
        tally.failed
    );

    Ok(())
}

fn worker_command(args: &WorkerArgs) -> Result<()> {
    let input = BufReader::new(io::stdin());
    run_worker(&args.db, input, io::stdout().lock())?;
    Ok(())
}

fn trace_command(args: TraceArgs) -> Result<()> {
    match args.command {
        TraceSubcommand::Runs { trace_db } => {
            let trace_store = SqliteTraceStore::open(&trace_db)?;
            let runs = trace_store.list_runs()?;
            for run in runs {
                println!("{}", serde_json::to_string(&run)?);
            }
        }
        TraceSubcommand::Events { trace_db, run_id } => {
            let trace_store = SqliteTraceStore::open(&trace_db)?;
            let run_id = parse_run_id(&run_id)?;
            let events = trace_store.list_events_for_run(run_id)?;
            for event in events {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        TraceSubcommand::Tasks { trace_db, run_id } => {
            let trace_store = SqliteTraceStore::open(&trace_db)?;
            let run_id = parse_run_id(&run_id)?;
            for task_run in trace_store.get_task_runs(run_id)? {
                println!("{}", serde_json::to_string(&task_run)?);
            }
        }
    }
    Ok(())
}

fn replay_command(args: &ReplayArgs) -> Result<()> {
    let trace_store = SqliteTraceStore::open(&args.trace_db)?;
    let run_id = parse_run_id(&args.run_id)?;
    let backends = BackendConfig {
        credentials_path: None,
        worker: WorkerCommand::current_exe()?,
    };
    let report = Orchestrator::new(&trace_store, &NoSessions, &backends).replay_audit(run_id)?;

    println!(
        "run_id={} events={} chain_valid={}",
        report.run_id, report.events, report.chain_valid
    );
    Ok(())
}

/// Audit replay reads the ledger only.
struct NoSessions;

impl GeneratorFactory for NoSessions {
    fn open_session(&self, _role: SessionRole) -> Result<Box<dyn Generator>> {
        Err(anyhow!("replay does not open generator sessions"))
    }
}

fn parse_run_id(input: &str) -> Result<RunId> {
    let value = Ulid::from_str(input).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
    Ok(RunId(value))
}
