use anyhow::{Context, Result};
use services::{node_aggregator::RunReport, object_store};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::{path::Path, process::ExitCode, str::FromStr, sync::Arc};
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod lock;
mod models;
mod services;

const SCHEMA: &str = include_str!("../migrations/0001_init.sql");

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Config: missing credentials abort before any work ---
    let cfg = config::AppConfig::from_env_and_args()?;
    tracing::info!("Starting mako-rollup with config: {:?}", cfg);

    match execute(&cfg).await? {
        Outcome::AlreadyRunning => Ok(ExitCode::SUCCESS),
        Outcome::Finished(report) if report.is_clean() => Ok(ExitCode::SUCCESS),
        Outcome::Finished(report) => {
            tracing::warn!(
                failed = report.failed.len(),
                tombstone_warnings = report.tombstone_warnings,
                "rollup completed with warnings"
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

#[derive(Debug)]
enum Outcome {
    /// Another run holds the lock; nothing was touched.
    AlreadyRunning,
    Finished(RunReport),
}

/// One rollup run under the process-wide lock.
async fn execute(cfg: &config::AppConfig) -> Result<Outcome> {
    let lock_path = cfg.lock_path();
    let Some(run_lock) = lock::RunLock::try_acquire(&lock_path)
        .with_context(|| format!("acquiring run lock {}", lock_path.display()))?
    else {
        tracing::info!(
            "Another rollup holds {}; exiting without changes",
            lock_path.display()
        );
        return Ok(Outcome::AlreadyRunning);
    };
    tracing::debug!("Holding run lock {}", run_lock.path().display());

    // --- Journal database ---
    let db = connect_db(&cfg.database_url).await?;
    run_migrations(&db).await?;

    // --- Object store ---
    let store = object_store::connect(&cfg.store_url, db.clone())
        .with_context(|| format!("opening store {}", cfg.store_url))?;
    tracing::debug!(
        user = %cfg.store_user,
        key_id = %cfg.store_key_id,
        "store credentials loaded"
    );

    let builder = services::region_builder::RegionBuilder::begin(db.clone()).await?;
    let aggregator = services::node_aggregator::NodeAggregator::new(
        store,
        cfg.layout.clone(),
        cfg.concurrency,
        cfg.fetch_timeout,
    );
    let report = aggregator.run(builder).await?;

    Ok(Outcome::Finished(report))
}

/// Open (creating if needed) the SQLite journal.
async fn connect_db(database_url: &str) -> Result<Arc<SqlitePool>> {
    tracing::debug!("Connecting using raw URL => {}", database_url);

    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database URL `{}`", database_url))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {}", database_url))?;
    Ok(Arc::new(pool))
}

/// Apply the embedded schema. Every statement is idempotent.
async fn run_migrations(db: &SqlitePool) -> Result<()> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::debug!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::trace!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}
