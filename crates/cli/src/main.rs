//! Conveyor CLI - queue maintenance from the command line

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conveyor_core::application::{
    Cleanup, CleanupConfig, ExponentialRetryScheduler, JobManager, DEFAULT_RETRY_BASE_DELAY_MS,
};
use conveyor_core::port::{ListenerDispatcher, SystemTimeProvider, TimeProvider};
use conveyor_infra_sqlite::{create_pool, run_migrations, SqliteJobStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_DB_PATH: &str = "~/.conveyor/jobs.db";

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Conveyor job queue maintenance", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the SQLite database
    #[arg(long, env = "CONVEYOR_DB_PATH", default_value = DEFAULT_DB_PATH)]
    database: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Close stale running jobs and delete jobs past their retention
    Cleanup {
        /// How long closed jobs are kept
        #[arg(long, default_value = "7 days", value_parser = parse_duration)]
        max_retention: Duration,

        /// How long successfully finished jobs are kept
        #[arg(long, default_value = "1 hour", value_parser = parse_duration)]
        max_retention_succeeded: Duration,

        /// Maximum number of jobs deleted per invocation
        #[arg(long, default_value = "1000")]
        per_call: usize,
    },
}

/// humantime wants "7days"; also accept the spaced "7 days" form.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(&s.replace(' ', ""))
}

fn init_logging() {
    let log_format = std::env::var("CONVEYOR_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("conveyor=info"))
        .expect("failed to create env filter");

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let db_path = shellexpand::tilde(&cli.database).into_owned();
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }
    info!(db_path = %db_path, "opening database");

    let pool = create_pool(&db_path)
        .await
        .context("failed to open database")?;
    run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let store = Arc::new(SqliteJobStore::new(pool));
    let manager = Arc::new(JobManager::new(
        store.clone(),
        Arc::new(ExponentialRetryScheduler::new(
            time_provider.clone(),
            DEFAULT_RETRY_BASE_DELAY_MS,
        )),
        Arc::new(ListenerDispatcher::new()),
        time_provider.clone(),
    ));

    match cli.command {
        Commands::Cleanup {
            max_retention,
            max_retention_succeeded,
            per_call,
        } => {
            let config = CleanupConfig {
                max_retention_ms: max_retention.as_millis() as i64,
                max_retention_succeeded_ms: max_retention_succeeded.as_millis() as i64,
                per_call,
            };
            let cleanup = Cleanup::new(store, manager, time_provider, config);
            let report = cleanup.run().await.context("cleanup run failed")?;
            info!(
                swept_stale = report.swept_stale,
                deleted = report.deleted,
                "cleanup completed"
            );
        }
    }

    Ok(())
}
