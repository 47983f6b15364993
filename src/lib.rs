mod address;
mod cache;
mod commands;
mod config;
mod db;
mod errors;
mod export;
mod extract;
mod ingestion;
mod journal;
mod pipeline;
mod preferences;
mod progress;
mod provider;
mod rate_limit;
mod resolver;
mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::json;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::address::{cache_key, normalize, GEOCODE_PREFIX, PREFERENCE_PREFIX};
pub use crate::cache::{CoordinateCache, ImportSummary};
pub use crate::commands::{Cli, HealthReport};
pub use crate::config::{AppConfig, PublicAppConfig};
pub use crate::db::{bootstrap, DatabaseBootstrap, DatabaseContext};
pub use crate::errors::{AppError, AppResult};
pub use crate::export::write_csv;
pub use crate::extract::try_extract;
pub use crate::ingestion::{parse_csv, Coordinate, FieldKind, Row, RowSet};
pub use crate::journal::RunJournal;
pub use crate::pipeline::{PipelineOutcome, PipelineRun, ResolutionPipeline};
pub use crate::preferences::{Preferences, UpdatePreferencesPayload};
pub use crate::progress::{ChannelProgress, LogProgress, NullProgress, ProgressEvent, ProgressReporter};
pub use crate::provider::{GeocodeProvider, NominatimClient};
pub use crate::rate_limit::RateLimiter;
pub use crate::resolver::{GeocodeResolver, PreloadTable, Resolution, ResolutionSource};
pub use crate::store::KeyValueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    /// Geocode entries only.
    Geocode,
    /// Geocode entries and UI preferences.
    All,
}

#[derive(Debug)]
pub struct BatchReport {
    pub run: PipelineRun,
    pub rows: RowSet,
}

/// Session object owning every long-lived resource of the tool. Adapters
/// (the CLI here) call into it instead of sharing module-level state.
pub struct AppState {
    config: AppConfig,
    db_path: PathBuf,
    db_recovered: bool,
    store: KeyValueStore,
    cache: CoordinateCache,
    preload: Arc<PreloadTable>,
    limiter: Arc<RateLimiter>,
    pipeline: ResolutionPipeline,
    journal: RunJournal,
    preferences: Mutex<Preferences>,
}

impl AppState {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        let provider = NominatimClient::new(&config)?;
        Self::with_provider(config, Arc::new(provider))
    }

    pub fn with_provider(config: AppConfig, provider: Arc<dyn GeocodeProvider>) -> AppResult<Self> {
        let DatabaseBootstrap {
            context: DatabaseContext { connection, path },
            recovered,
        } = bootstrap(&config.data_dir, &config.database_file_name)?;
        let store = KeyValueStore::new(Arc::new(Mutex::new(connection)));
        let cache = CoordinateCache::new(store.clone());
        let preferences = Preferences::load(&store, &config)?;
        let journal = RunJournal::new(&config.data_dir, &config)?;

        let preload = Arc::new(PreloadTable::default());
        let limiter = Arc::new(RateLimiter::new(preferences.rate_limit_ms));
        let resolver = GeocodeResolver::new(
            cache.clone(),
            Arc::clone(&preload),
            Arc::clone(&limiter),
            provider,
        );
        let pipeline = ResolutionPipeline::new(Arc::new(resolver), preferences.worker_count);

        if let Err(err) = journal.record(
            "session_started",
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "db_recovered": recovered,
                "cached_entries": cache.len()?,
            }),
        ) {
            warn!(?err, "failed to journal session start");
        }

        Ok(Self {
            config,
            db_path: path,
            db_recovered: recovered,
            store,
            cache,
            preload,
            limiter,
            pipeline,
            journal,
            preferences: Mutex::new(preferences),
        })
    }

    /// Parses `input` and resolves every row. Unreadable input fails the
    /// whole batch before any row is processed.
    pub async fn start_batch(
        &self,
        input: &[u8],
        reporter: &dyn ProgressReporter,
    ) -> AppResult<BatchReport> {
        let parsed = match parse_csv(input) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.journal_event("batch_rejected", json!({ "reason": err.to_string() }));
                return Err(err);
            }
        };
        let RowSet {
            headers,
            rows,
            delimiter,
        } = parsed;

        self.journal_event(
            "batch_started",
            json!({
                "generation": self.pipeline.current_generation() + 1,
                "total": rows.len(),
                "workers": self.pipeline.worker_count(),
            }),
        );
        let PipelineOutcome { run, rows } = self.pipeline.run(rows, reporter).await;

        let name = if run.cancelled {
            "batch_cancelled"
        } else {
            "batch_completed"
        };
        self.journal_event(name, serde_json::to_value(&run)?);
        if let Err(err) = self.journal.flush() {
            warn!(?err, "failed to flush run journal");
        }

        Ok(BatchReport {
            run,
            rows: RowSet {
                headers,
                rows,
                delimiter,
            },
        })
    }

    pub fn cancel_batch(&self) {
        self.pipeline.cancel();
    }

    pub fn export_csv(&self, rows: &RowSet) -> AppResult<Vec<u8>> {
        write_csv(rows)
    }

    pub fn load_preload(&self, path: &Path) -> AppResult<usize> {
        self.preload.load_file(path)
    }

    pub fn import_cache(&self, json: &str) -> AppResult<ImportSummary> {
        let summary = self.cache.import_json(json)?;
        self.journal_event("cache_imported", serde_json::to_value(&summary)?);
        Ok(summary)
    }

    pub fn export_cache(&self) -> AppResult<String> {
        self.cache.export_json()
    }

    pub fn clear(&self, scope: ClearScope) -> AppResult<usize> {
        let mut removed = self.cache.clear()?;
        if scope == ClearScope::All {
            removed += self.store.remove_prefix(PREFERENCE_PREFIX)?;
            let defaults = Preferences::load(&self.store, &self.config)?;
            self.apply_preferences(&defaults);
            *self.preferences.lock() = defaults;
        }
        self.journal_event(
            "cache_cleared",
            json!({ "scope": format!("{scope:?}"), "removed": removed }),
        );
        Ok(removed)
    }

    pub fn preferences(&self) -> Preferences {
        self.preferences.lock().clone()
    }

    pub fn update_preferences(&self, payload: &UpdatePreferencesPayload) -> AppResult<Preferences> {
        let mut preferences = self.preferences.lock();
        preferences.apply_patch(payload);
        preferences.persist(&self.store)?;
        self.apply_preferences(&preferences);
        Ok(preferences.clone())
    }

    /// Overrides the worker count for subsequent batches without persisting.
    pub fn set_worker_count(&self, count: usize) {
        self.pipeline.set_worker_count(count);
    }

    pub fn health(&self) -> AppResult<HealthReport> {
        Ok(HealthReport {
            db_path: self.db_path.to_string_lossy().to_string(),
            db_recovered: self.db_recovered,
            cached_entries: self.cache.len()?,
            preload_entries: self.preload.len(),
            journal_path: self.journal.path().to_string_lossy().to_string(),
            journal_pending: self.journal.pending(),
            rate_limit_ms: self.limiter.interval().as_millis() as u64,
            worker_count: self.pipeline.worker_count(),
            preferences: self.preferences(),
            config: self.config.public_profile(),
        })
    }

    pub fn flush_journal(&self) -> AppResult<()> {
        self.journal.flush()
    }

    fn apply_preferences(&self, preferences: &Preferences) {
        self.limiter.set_interval_ms(preferences.rate_limit_ms);
        self.pipeline.set_worker_count(preferences.worker_count);
    }

    fn journal_event(&self, name: &str, payload: serde_json::Value) {
        if let Err(err) = self.journal.record(name, payload) {
            warn!(?err, event = name, "failed to journal event");
        }
    }
}

fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,address_geocoder_lib=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let config = AppConfig::from_env();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let state = AppState::initialize(config)?;
        commands::execute(&state, cli.command).await?;
        state.flush_journal()?;
        Ok(())
    })
}
