use crate::errors::RollupError;
use clap::Parser;
use std::{env, path::PathBuf, time::Duration};

pub const ENV_STORE_URL: &str = "MAKO_STORE_URL";
pub const ENV_STORE_USER: &str = "MAKO_STORE_USER";
pub const ENV_STORE_KEY_ID: &str = "MAKO_STORE_KEY_ID";

const DEFAULT_WORK_DIR: &str = "/var/tmp/mako-rollup";
const DEFAULT_CONCURRENCY: usize = 8;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 300;
const LOCK_FILE: &str = "rollup.lock";

/// Where manifests, summaries and the region report live in the store.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub manifest_dir: String,
    pub summary_dir: String,
    pub report_dir: String,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store_url: String,
    pub store_user: String,
    pub store_key_id: String,
    pub layout: StoreLayout,
    pub work_dir: PathBuf,
    pub database_url: String,
    pub concurrency: usize,
    pub fetch_timeout: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Roll up storage node manifests into a region report")]
pub struct Args {
    /// Directory holding one manifest per storage node (overrides MAKO_MANIFEST_DIR)
    #[arg(long)]
    pub manifest_dir: Option<String>,

    /// Directory of per-node summaries (overrides MAKO_SUMMARY_DIR)
    #[arg(long)]
    pub summary_dir: Option<String>,

    /// Directory the region report is published to (overrides MAKO_REPORT_DIR)
    #[arg(long)]
    pub report_dir: Option<String>,

    /// Local directory for the lock file and journal (overrides MAKO_WORK_DIR)
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Journal database URL (overrides MAKO_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Nodes processed in parallel (overrides MAKO_CONCURRENCY)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Per-node store operation timeout in seconds (overrides MAKO_FETCH_TIMEOUT_SECS)
    #[arg(long)]
    pub fetch_timeout_secs: Option<u64>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self, RollupError> {
        Self::resolve(Args::parse(), |key| env::var(key).ok())
    }

    /// Merge CLI arguments over values from `lookup`.
    pub fn resolve(
        args: Args,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, RollupError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(RollupError::ConfigMissing(key));

        let store_url = required(ENV_STORE_URL)?;
        let store_user = required(ENV_STORE_USER)?;
        let store_key_id = required(ENV_STORE_KEY_ID)?;

        let manifest_dir = args
            .manifest_dir
            .or_else(|| get("MAKO_MANIFEST_DIR"))
            .unwrap_or_else(|| format!("/{store_user}/stor/mako"));
        let summary_dir = args
            .summary_dir
            .or_else(|| get("MAKO_SUMMARY_DIR"))
            .unwrap_or_else(|| format!("{}/summary", manifest_dir.trim_end_matches('/')));
        let report_dir = args
            .report_dir
            .or_else(|| get("MAKO_REPORT_DIR"))
            .unwrap_or_else(|| format!("{}/rollup", manifest_dir.trim_end_matches('/')));

        let work_dir = args
            .work_dir
            .or_else(|| get("MAKO_WORK_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR));
        let database_url = args
            .database_url
            .or_else(|| get("MAKO_DATABASE_URL"))
            .unwrap_or_else(|| format!("sqlite://{}/rollup.db", work_dir.display()));

        let concurrency = match args.concurrency {
            Some(n) => n,
            None => parse_env(&get, "MAKO_CONCURRENCY")?.unwrap_or(DEFAULT_CONCURRENCY),
        };
        if concurrency == 0 {
            return Err(RollupError::ConfigInvalid {
                var: "MAKO_CONCURRENCY",
                reason: "must be at least 1".into(),
            });
        }
        let timeout_secs = match args.fetch_timeout_secs {
            Some(n) => n,
            None => parse_env(&get, "MAKO_FETCH_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
        };

        Ok(Self {
            store_url,
            store_user,
            store_key_id,
            layout: StoreLayout {
                manifest_dir,
                summary_dir,
                report_dir,
            },
            work_dir,
            database_url,
            concurrency,
            fetch_timeout: Duration::from_secs(timeout_secs),
        })
    }

    pub fn lock_path(&self) -> PathBuf {
        self.work_dir.join(LOCK_FILE)
    }
}

fn parse_env<T: std::str::FromStr>(
    get: impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, RollupError>
where
    T::Err: std::fmt::Display,
{
    get(var)
        .map(|value| {
            value.trim().parse::<T>().map_err(|err| RollupError::ConfigInvalid {
                var,
                reason: format!("`{value}`: {err}"),
            })
        })
        .transpose()
}
