//! GridFlow Rule Injector Service
//!
//! Asynchronous engine that turns pending replication rules into transfer
//! requests:
//! - Claims rules via lease-based partitioning
//! - Evaluates placements against a fresh topology view each pass
//! - Emits idempotent transfer requests to the transfer subsystem
//! - Marks rules OK, REPLICATING, or STUCK as inventory evolves

use clap::Parser;
use gridflow_injector::{InjectorConfig, InjectorDaemon, PostgresStoreClient};
use gridflow_metadata::{Database, DbConfig};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gridflow-injector")]
#[command(about = "GridFlow rule-injection service")]
struct Cli {
    /// Perform a single pass over the pending set, then exit
    #[arg(long, default_value = "false")]
    run_once: bool,

    /// Number of independent worker loops
    #[arg(long)]
    threads: Option<usize>,

    /// Seconds to sleep after an empty batch
    #[arg(long)]
    sleep_time: Option<u64>,

    /// Maximum rules claimed per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Consecutive no-progress passes before a rule goes STUCK
    #[arg(long)]
    no_progress_threshold: Option<i32>,

    /// Evaluate and log decisions without emitting requests
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// PostgreSQL database URL (overrides DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,
}

impl Cli {
    /// Environment configuration with command-line overrides applied
    fn into_config(self) -> Result<(InjectorConfig, bool), gridflow_injector::ConfigError> {
        if let Some(url) = &self.database_url {
            std::env::set_var("DATABASE_URL", url);
        }
        let mut config = InjectorConfig::from_env()?;
        if let Some(threads) = self.threads {
            config.threads = threads.max(1);
        }
        if let Some(sleep_time) = self.sleep_time {
            config.sleep_time_secs = sleep_time;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(threshold) = self.no_progress_threshold {
            config.no_progress_threshold = threshold;
        }
        config.dry_run = config.dry_run || self.dry_run;
        Ok((config, self.run_once))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let (config, run_once) = cli.into_config()?;

    info!(
        threads = config.threads,
        sleep_time = config.sleep_time_secs,
        batch_size = config.batch_size,
        no_progress_threshold = config.no_progress_threshold,
        run_once,
        dry_run = config.dry_run,
        "Starting GridFlow rule injector"
    );

    // Fatal startup faults abort before any worker starts.
    let db = Database::new(DbConfig {
        url: config.database_url.clone(),
        ..Default::default()
    })
    .await?;
    db.migrate().await?;

    let client = Arc::new(PostgresStoreClient::new(Arc::new(db)));
    let daemon = InjectorDaemon::new(config, client.clone(), client.clone(), client);

    // The signal handler only sets the token; workers observe it between
    // rule evaluations and before sleeping.
    let token = daemon.cancellation_token();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                token.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    daemon.run(run_once).await;

    Ok(())
}
