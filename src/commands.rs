use std::fs;
use std::io::Write;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::PublicAppConfig;
use crate::errors::AppResult;
use crate::pipeline::PipelineRun;
use crate::preferences::{Preferences, UpdatePreferencesPayload};
use crate::progress::LogProgress;
use crate::{AppState, ClearScope};

const PROGRESS_LOG_EVERY: usize = 25;

/// Batch geocoder for address lists
#[derive(clap::Parser, Debug)]
#[command(name = "address-geocoder", version, about, propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Resolve coordinates for every row of a CSV file
    Resolve(ResolveArgs),

    /// Inspect or manage the persistent coordinate cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Show or update persisted preferences
    Prefs(PrefsArgs),

    /// Print storage, cache and configuration status as JSON
    Health,
}

#[derive(clap::Args, Debug)]
pub struct ResolveArgs {
    /// Input CSV (comma, semicolon or tab separated)
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub input: PathBuf,

    /// Output CSV; written to stdout when omitted
    #[arg(short, long, value_hint = clap::ValueHint::FilePath)]
    pub output: Option<PathBuf>,

    /// JSON map of address -> coordinates consulted before the provider
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub preload: Option<PathBuf>,

    /// Worker count for this run only
    #[arg(short, long)]
    pub workers: Option<usize>,
}

#[derive(clap::Subcommand, Debug)]
pub enum CacheCommand {
    /// Merge a JSON cache export into the store
    Import {
        #[arg(value_hint = clap::ValueHint::FilePath)]
        file: PathBuf,
    },

    /// Write all cached coordinates as JSON
    Export {
        #[arg(short, long, value_hint = clap::ValueHint::FilePath)]
        output: Option<PathBuf>,
    },

    /// Remove cached coordinates (and preferences with --all)
    Clear {
        #[arg(long)]
        all: bool,
    },
}

#[derive(clap::Args, Debug)]
pub struct PrefsArgs {
    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(long)]
    pub rate_limit_ms: Option<u64>,

    #[arg(long)]
    pub cluster_radius_px: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub db_path: String,
    pub db_recovered: bool,
    pub cached_entries: usize,
    pub preload_entries: usize,
    pub journal_path: String,
    pub journal_pending: usize,
    pub rate_limit_ms: u64,
    pub worker_count: usize,
    pub preferences: Preferences,
    pub config: PublicAppConfig,
}

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    total: usize,
    geocoded: usize,
    cache_hits: usize,
    preload_hits: usize,
    provider_hits: usize,
    skipped: usize,
    failed: usize,
    failed_queries: &'a [String],
    cancelled: bool,
}

impl<'a> From<&'a PipelineRun> for RunSummary<'a> {
    fn from(run: &'a PipelineRun) -> Self {
        Self {
            total: run.total,
            geocoded: run.geocoded(),
            cache_hits: run.cache_hits,
            preload_hits: run.preload_hits,
            provider_hits: run.provider_hits,
            skipped: run.skipped,
            failed: run.failed,
            failed_queries: &run.failed_queries,
            cancelled: run.cancelled,
        }
    }
}

pub async fn execute(state: &AppState, command: Command) -> AppResult<()> {
    match command {
        Command::Resolve(args) => resolve(state, args).await,
        Command::Cache { action } => cache(state, action),
        Command::Prefs(args) => prefs(state, args),
        Command::Health => print_json(&state.health()?),
    }
}

async fn resolve(state: &AppState, args: ResolveArgs) -> AppResult<()> {
    if let Some(path) = &args.preload {
        let loaded = state.load_preload(path)?;
        info!(target: "commands", loaded, path = %path.display(), "preload table loaded");
    }
    if let Some(workers) = args.workers {
        state.set_worker_count(workers);
    }

    let input = fs::read(&args.input)?;
    let reporter = LogProgress::new(PROGRESS_LOG_EVERY);
    let batch = state.start_batch(&input, &reporter);
    tokio::pin!(batch);
    let report = tokio::select! {
        report = &mut batch => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!(target: "commands", "interrupt received; cancelling batch");
            state.cancel_batch();
            batch.await?
        }
    };

    let csv = state.export_csv(&report.rows)?;
    let summary = serde_json::to_string_pretty(&RunSummary::from(&report.run))?;
    match &args.output {
        Some(path) => {
            fs::write(path, csv)?;
            info!(target: "commands", path = %path.display(), "wrote geocoded csv");
            println!("{summary}");
        }
        None => {
            std::io::stdout().write_all(&csv)?;
            eprintln!("{summary}");
        }
    }
    Ok(())
}

fn cache(state: &AppState, action: CacheCommand) -> AppResult<()> {
    match action {
        CacheCommand::Import { file } => {
            let json = fs::read_to_string(&file)?;
            print_json(&state.import_cache(&json)?)
        }
        CacheCommand::Export { output } => {
            let json = state.export_cache()?;
            match output {
                Some(path) => fs::write(path, json)?,
                None => println!("{json}"),
            }
            Ok(())
        }
        CacheCommand::Clear { all } => {
            let scope = if all {
                ClearScope::All
            } else {
                ClearScope::Geocode
            };
            let removed = state.clear(scope)?;
            info!(target: "commands", removed, ?scope, "cleared stored entries");
            Ok(())
        }
    }
}

fn prefs(state: &AppState, args: PrefsArgs) -> AppResult<()> {
    let PrefsArgs {
        workers,
        rate_limit_ms,
        cluster_radius_px,
    } = args;
    let preferences = if workers.is_none() && rate_limit_ms.is_none() && cluster_radius_px.is_none() {
        state.preferences()
    } else {
        state.update_preferences(&UpdatePreferencesPayload {
            worker_count: workers,
            rate_limit_ms,
            cluster_radius_px,
        })?
    };
    print_json(&preferences)
}

fn print_json<T: Serialize>(value: &T) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
