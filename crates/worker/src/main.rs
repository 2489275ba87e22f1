// TaskFlow worker and operator CLI
//
// Design Decision: One binary for running a worker and for operating the queue
// (submit, status, stats), so deployments ship a single artifact.
// Design Decision: Connection strings come from flags or the environment; all
// coordination tunables come from TASKFLOW_* variables via TaskFlowConfig.
// Design Decision: Without REDIS_URL the worker falls back to in-process leases,
// which is only safe for a single worker.

mod handlers;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use taskflow_core::prelude::*;

#[derive(Parser)]
#[command(name = "taskflow")]
#[command(about = "TaskFlow - distributed job coordination worker")]
#[command(version)]
struct Cli {
    /// PostgreSQL connection string for the job store
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Redis connection string for leases
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Job store connection pool size
    #[arg(long, env = "TASKFLOW_DB_MAX_CONNECTIONS", default_value = "10")]
    max_connections: u32,

    /// Emit logs as JSON lines
    #[arg(long, env = "TASKFLOW_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker until interrupted
    Worker {
        /// Overrides WORKER_ID
        #[arg(long)]
        worker_id: Option<String>,

        /// Overrides TASKFLOW_MAX_CONCURRENCY
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Apply migrations before starting
        #[arg(long)]
        migrate: bool,
    },

    /// Apply job store migrations
    Migrate,

    /// Submit a job and print its id
    Submit {
        #[arg(long)]
        kind: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,

        #[arg(long, default_value = "3")]
        max_attempts: u32,
    },

    /// Print a job's committed state
    Status { id: uuid::Uuid },

    /// Print job counts by status
    Stats,
}

#[derive(Serialize)]
struct Submitted {
    id: JobId,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config() -> Result<TaskFlowConfig> {
    TaskFlowConfig::from_env().context("Invalid TaskFlow configuration")
}

/// Connect to the job store, enforcing the configured payload bound
async fn connect_store(cli: &Cli, config: &TaskFlowConfig) -> Result<PostgresJobStore> {
    let store = PostgresJobStore::connect(&cli.database_url, cli.max_connections)
        .await
        .context("Failed to connect to job store")?;
    Ok(store.with_max_payload_bytes(config.max_payload_bytes))
}

/// Parse the CLI's JSON payload and submit it
async fn submit_job(client: &JobClient, kind: &str, payload: &str, max_attempts: u32) -> Result<JobId> {
    let payload: Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let id = client
        .submit(kind, payload, max_attempts)
        .await
        .context("Job rejected")?;
    Ok(id)
}

#[cfg(feature = "redis")]
async fn connect_leases(url: Option<&str>) -> Result<Option<Arc<dyn LeaseCoordinator>>> {
    match url {
        Some(url) => {
            let leases = RedisLeaseCoordinator::connect(url)
                .await
                .context("Failed to connect to lease store")?;
            Ok(Some(Arc::new(leases)))
        }
        None => Ok(None),
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_leases(url: Option<&str>) -> Result<Option<Arc<dyn LeaseCoordinator>>> {
    if url.is_some() {
        anyhow::bail!("REDIS_URL is set but this build has no redis support");
    }
    Ok(None)
}

async fn run_worker(
    cli: &Cli,
    worker_id: Option<String>,
    max_concurrency: Option<usize>,
    migrate: bool,
) -> Result<()> {
    let mut config = load_config()?;
    if let Some(id) = worker_id {
        config = config.with_worker_id(id);
    }
    if let Some(max) = max_concurrency {
        config = config.with_max_concurrency(max);
    }

    let store = connect_store(cli, &config).await?;
    if migrate {
        store.migrate().await.context("Failed to run migrations")?;
    }

    let leases = match connect_leases(cli.redis_url.as_deref()).await? {
        Some(leases) => leases,
        None => {
            tracing::warn!("REDIS_URL not set, using in-process leases (single worker only)");
            Arc::new(InMemoryLeaseCoordinator::new())
        }
    };

    let registry = handlers::registry().context("Failed to register handlers")?;
    tracing::info!(kinds = ?registry.kinds(), "Registered job handlers");

    let dispatcher = Dispatcher::new(Arc::new(store), leases, Arc::new(registry), config)
        .context("Failed to create dispatcher")?;
    dispatcher.start()?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    dispatcher.shutdown().await?;
    tracing::info!("Worker shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init(cli.log_json);

    match &cli.command {
        Command::Worker {
            worker_id,
            max_concurrency,
            migrate,
        } => run_worker(&cli, worker_id.clone(), *max_concurrency, *migrate).await,
        Command::Migrate => {
            connect_store(&cli, &load_config()?)
                .await?
                .migrate()
                .await
                .context("Failed to run migrations")?;
            tracing::info!("Migrations applied");
            Ok(())
        }
        Command::Submit {
            kind,
            payload,
            max_attempts,
        } => {
            let store = connect_store(&cli, &load_config()?).await?;
            let client = JobClient::new(Arc::new(store));
            let id = submit_job(&client, kind, payload, *max_attempts).await?;
            print_json(&Submitted { id })
        }
        Command::Status { id } => {
            let client = JobClient::new(Arc::new(connect_store(&cli, &load_config()?).await?));
            let job = client.status(JobId::from_uuid(*id)).await?;
            print_json(&job)
        }
        Command::Stats => {
            let client = JobClient::new(Arc::new(connect_store(&cli, &load_config()?).await?));
            print_json(&client.snapshot().await?)
        }
    }
}
