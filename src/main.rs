use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use signature_engine::background_jobs::{create_scheduler, jobs::engine_jobs, JobContext};
use signature_engine::config::{AppConfig, CliConfig, FileConfig};
use signature_engine::job_queue::{spawn_workers, QueueWorkerConfig, RetryPolicy};
use signature_engine::{
    metrics, EngineContext, EngineDispatcher, SqliteJobQueue, SqliteOpsStore, SqlitePetitionStore,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => path_buf,
        Err(err) => {
            return Err(err).with_context(|| format!("Error resolving path: {}", s));
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Values in it override the flags below.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding petitions.db, queue.db and ops.db.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// Number of queue workers.
    #[clap(long, default_value_t = 2)]
    pub worker_count: usize,

    /// How long an idle worker waits before polling the queue again.
    #[clap(long, default_value_t = 500)]
    pub poll_interval_ms: u64,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_dir: self.db_dir.clone(),
            metrics_port: self.metrics_port,
            worker_count: self.worker_count,
            poll_interval_ms: self.poll_interval_ms,
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.to_cli_config(), file_config)?;

    info!("Opening databases in {:?}...", config.db_dir);
    let petition_store = Arc::new(SqlitePetitionStore::new(config.petitions_db_path())?);
    let job_queue = Arc::new(
        SqliteJobQueue::new(config.queue_db_path())?
            .with_default_max_attempts(config.engine.max_attempts),
    );
    let ops_store = Arc::new(SqliteOpsStore::new(config.ops_db_path())?);

    info!("Initializing metrics...");
    metrics::init_metrics();

    let engine = EngineContext::new(
        petition_store,
        job_queue.clone(),
        ops_store.clone(),
        config.engine.clone(),
    );

    let shutdown_token = CancellationToken::new();
    let mut tasks = Vec::new();

    if config.metrics_port != 0 {
        let port = config.metrics_port;
        let token = shutdown_token.child_token();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = metrics::run_metrics_server(port, token).await {
                error!("Metrics server error: {}", e);
            }
        }));
    }

    let worker_config = QueueWorkerConfig {
        worker_count: config.worker_count,
        poll_interval: config.poll_interval(),
    };
    info!("Starting {} queue workers", worker_config.worker_count);
    tasks.extend(spawn_workers(
        &worker_config,
        job_queue,
        Arc::new(EngineDispatcher::new(engine.clone())),
        ops_store.clone(),
        RetryPolicy::new(config.engine.signature_count_interval()),
        shutdown_token.child_token(),
    ));

    let job_context = JobContext::new(shutdown_token.child_token(), engine);
    let (mut scheduler, _scheduler_handle) =
        create_scheduler(ops_store, shutdown_token.child_token(), job_context);
    for job in engine_jobs(&config.engine) {
        scheduler.register_job(job).await;
    }
    tasks.push(tokio::spawn(async move {
        scheduler.run().await;
    }));

    wait_for_shutdown_signal().await;
    info!("Shutting down...");
    shutdown_token.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!("Task failed during shutdown: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}
