//! `queuectl` — control-plane and worker-launcher binary.
//!
//! Thin `clap` adapter over the control-plane operations and the worker
//! runtime. Help rendering, colorization, and config-file loading stay out
//! of scope; this binary resolves a `Config` from flags/env and a fixed set
//! of defaults, then calls straight through to `queuectl-core` /
//! `queuectl-worker`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use queuectl_core::{Categorizable, Config, EnqueueRequest, JobManager, JobState, QueueError, SafeErrorCategory};
use queuectl_store_sqlite::SqliteStore;
use queuectl_worker::{listen_for_shutdown, ShutdownPhase, WorkerRuntime};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "queuectl")]
#[command(author, version, about = "A durable, single-machine job queue for shell commands", long_about = None)]
struct Cli {
    /// Path to the SQLite database file.
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a new job.
    Enqueue {
        /// Client-supplied unique job id.
        id: String,
        /// Shell command to execute.
        command: String,
        /// Override the default retry ceiling for this job.
        #[arg(long)]
        max_retries: Option<i64>,
    },
    /// Show a single job's full record.
    Info {
        id: String,
    },
    /// List jobs, optionally filtered by state.
    List {
        #[arg(long, value_enum)]
        state: Option<StateArg>,
    },
    /// Show aggregate counts per state.
    Status,
    /// Dead letter queue operations.
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
    /// Run a worker process (blocks until shutdown).
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List jobs currently in the dead letter queue.
    List,
    /// Reschedule a dead job back to pending.
    Retry { id: String },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Start polling for jobs until a shutdown signal is received.
    Run,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum StateArg {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl From<StateArg> for JobState {
    fn from(s: StateArg) -> Self {
        match s {
            StateArg::Pending => JobState::Pending,
            StateArg::Processing => JobState::Processing,
            StateArg::Completed => JobState::Completed,
            StateArg::Failed => JobState::Failed,
            StateArg::Dead => JobState::Dead,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::default();
    init_logging(&config.log_filter);

    let db_path = cli.db_path.clone().unwrap_or_else(|| config.db_path.clone());
    let store = SqliteStore::open(&db_path)
        .await
        .with_context(|| format!("failed to open durable store at {db_path}"))?;
    let jm = Arc::new(JobManager::new(Arc::new(store), config));

    match cli.command {
        Commands::Enqueue { id, command, max_retries } => {
            let job = jm
                .enqueue(EnqueueRequest { id, command, max_retries })
                .await
                .map_err(report_queue_error)?;
            println!("enqueued job {} (max_retries={})", job.id, job.max_retries);
        }
        Commands::Info { id } => {
            let job = jm.info(&id).await.map_err(report_queue_error)?;
            println!("{}", serde_json::to_string_pretty(&job).expect("job serializes to json"));
        }
        Commands::List { state } => {
            let jobs = jm.list(state.map(Into::into)).await.map_err(report_queue_error)?;
            for job in jobs {
                println!("{:<24} {:<12} attempts={}/{}", job.id, job.state, job.attempts, job.max_retries);
            }
        }
        Commands::Status => {
            let status = jm.status().await.map_err(report_queue_error)?;
            println!("{}", serde_json::to_string_pretty(&status).expect("status serializes to json"));
        }
        Commands::Dlq { command } => match command {
            DlqCommands::List => {
                let jobs = jm.dlq_list().await.map_err(report_queue_error)?;
                for job in jobs {
                    println!("{:<24} attempts={} error={:?}", job.id, job.attempts, job.error);
                }
            }
            DlqCommands::Retry { id } => {
                let job = jm.dlq_retry(&id).await.map_err(report_queue_error)?;
                println!("rescheduled job {} to pending", job.id);
            }
        },
        Commands::Worker { command } => match command {
            WorkerCommands::Run => run_worker(jm).await?,
        },
    }

    Ok(())
}

/// §7's propagation policy: validation and not-found errors are shown to
/// the operator as-is, but a storage fault is logged in full and shown only
/// as a generic "unavailable" outcome rather than leaking backend internals.
fn report_queue_error(err: QueueError) -> anyhow::Error {
    match err.category() {
        SafeErrorCategory::StorageUnavailable => {
            tracing::error!(error = %err, "durable store unavailable");
            anyhow::anyhow!("durable store is unavailable")
        }
        SafeErrorCategory::Validation | SafeErrorCategory::NotFound => anyhow::anyhow!("{err}"),
    }
}

async fn run_worker(jm: Arc<JobManager>) -> Result<()> {
    let shutdown_grace = jm.config().shutdown_grace;
    let (tx, rx) = watch::channel(ShutdownPhase::Running);

    tokio::spawn(listen_for_shutdown(tx, shutdown_grace));

    let runtime = WorkerRuntime::new(jm, rx);
    tracing::info!(worker_id = %runtime.id(), "starting worker");
    runtime.run().await;
    Ok(())
}

fn init_logging(log_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
