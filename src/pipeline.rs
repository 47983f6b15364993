use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::address::query_for_row;
use crate::extract::try_extract;
use crate::ingestion::{Coordinate, Row};
use crate::progress::ProgressReporter;
use crate::resolver::{GeocodeResolver, Resolution, ResolutionSource};

/// Aggregate for one batch. Replaced wholesale by the next batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineRun {
    pub generation: u64,
    pub total: usize,
    pub done: usize,
    /// Rows that carried their own coordinates.
    pub native: usize,
    /// Rows resolved through the resolver (cache, preload or provider).
    pub resolved: usize,
    pub cache_hits: usize,
    pub preload_hits: usize,
    pub provider_hits: usize,
    /// Rows without address text; counted in `total` only.
    pub skipped: usize,
    /// Rows that ended without a coordinate (no match or error).
    pub failed: usize,
    /// Unresolved query strings, deduplicated, in first-seen order.
    pub failed_queries: Vec<String>,
    pub cancelled: bool,
}

impl PipelineRun {
    fn new(generation: u64, total: usize) -> Self {
        Self {
            generation,
            total,
            ..Self::default()
        }
    }

    pub fn geocoded(&self) -> usize {
        self.native + self.resolved
    }
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub run: PipelineRun,
    /// Input rows in their original order with coordinates attached.
    pub rows: Vec<Row>,
}

#[derive(Debug)]
enum RowOutcome {
    Native(Coordinate),
    Resolved(Resolution),
    Skipped,
    Unresolved(String),
    Failed(String),
}

struct RunState {
    run: PipelineRun,
    coordinates: Vec<Option<Coordinate>>,
    seen_failures: HashSet<String>,
}

impl RunState {
    fn record(&mut self, position: usize, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Native(coordinate) => {
                self.run.native += 1;
                self.coordinates[position] = Some(coordinate);
            }
            RowOutcome::Resolved(resolution) => {
                self.run.resolved += 1;
                match resolution.source {
                    ResolutionSource::Cache => self.run.cache_hits += 1,
                    ResolutionSource::Preload => self.run.preload_hits += 1,
                    ResolutionSource::Provider => self.run.provider_hits += 1,
                }
                self.coordinates[position] = Some(resolution.coordinate);
            }
            RowOutcome::Skipped => self.run.skipped += 1,
            RowOutcome::Unresolved(query) | RowOutcome::Failed(query) => {
                self.run.failed += 1;
                if self.seen_failures.insert(query.clone()) {
                    self.run.failed_queries.push(query);
                }
            }
        }
        self.run.done += 1;
    }
}

/// Drives a fixed pool of cooperative workers over a batch of rows.
///
/// Every batch takes a new generation number. Starting another batch or
/// calling [`ResolutionPipeline::cancel`] bumps the generation; workers of the
/// older batch stop pulling rows and drop any result that lands afterwards.
pub struct ResolutionPipeline {
    resolver: Arc<GeocodeResolver>,
    worker_count: AtomicUsize,
    generation: AtomicU64,
}

impl ResolutionPipeline {
    pub fn new(resolver: Arc<GeocodeResolver>, worker_count: usize) -> Self {
        Self {
            resolver,
            worker_count: AtomicUsize::new(worker_count.max(1)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn resolver(&self) -> &GeocodeResolver {
        &self.resolver
    }

    pub fn set_worker_count(&self, count: usize) {
        self.worker_count.store(count.max(1), Ordering::SeqCst);
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::SeqCst)
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidates the running batch, if any.
    pub fn cancel(&self) -> u64 {
        let next = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(target: "pipeline", generation = next, "batch cancelled");
        next
    }

    pub async fn run(&self, mut rows: Vec<Row>, reporter: &dyn ProgressReporter) -> PipelineOutcome {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let total = rows.len();
        for row in rows.iter_mut() {
            row.coordinate = None;
        }

        let queue = Mutex::new((0..total).collect::<VecDeque<_>>());
        let state = Mutex::new(RunState {
            run: PipelineRun::new(generation, total),
            coordinates: vec![None; total],
            seen_failures: HashSet::new(),
        });

        let workers = self.worker_count().min(total.max(1));
        info!(target: "pipeline", generation, total, workers, "batch started");
        {
            let rows = &rows;
            let queue = &queue;
            let state = &state;
            join_all((0..workers).map(|worker| async move {
                loop {
                    if !self.is_current(generation) {
                        break;
                    }
                    let Some(position) = queue.lock().pop_front() else {
                        break;
                    };
                    let outcome = self.process_row(&rows[position]).await;
                    if !self.is_current(generation) {
                        debug!(target: "pipeline", worker, generation, "dropping result of stale batch");
                        break;
                    }
                    let done = {
                        let mut state = state.lock();
                        state.record(position, outcome);
                        state.run.done
                    };
                    reporter.on_progress(done, total);
                }
            }))
            .await;
        }

        let RunState {
            mut run,
            coordinates,
            ..
        } = state.into_inner();
        for (row, coordinate) in rows.iter_mut().zip(coordinates) {
            row.coordinate = coordinate;
        }

        if !self.is_current(generation) {
            run.cancelled = true;
            info!(target: "pipeline", generation, done = run.done, total, "batch superseded");
            return PipelineOutcome { run, rows };
        }

        if !run.failed_queries.is_empty() {
            warn!(
                target: "pipeline",
                count = run.failed_queries.len(),
                failures = ?run.failed_queries,
                "addresses could not be geocoded"
            );
        }
        info!(
            target: "pipeline",
            generation,
            total,
            geocoded = run.geocoded(),
            native = run.native,
            provider_hits = run.provider_hits,
            skipped = run.skipped,
            failed = run.failed,
            "batch completed"
        );
        if run.geocoded() > 0 {
            reporter.on_complete(run.geocoded());
        }
        PipelineOutcome { run, rows }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn process_row(&self, row: &Row) -> RowOutcome {
        let query = query_for_row(row);
        if let Some(coordinate) = try_extract(row) {
            if let Some(query) = &query {
                if let Err(err) = self.resolver.cache().put(query, coordinate) {
                    warn!(target: "pipeline", ?err, row = row.index, "failed to cache native coordinate");
                }
            }
            return RowOutcome::Native(coordinate);
        }

        let Some(query) = query else {
            return RowOutcome::Skipped;
        };

        match self.resolver.resolve(&query).await {
            Ok(Some(resolution)) => RowOutcome::Resolved(resolution),
            Ok(None) => RowOutcome::Unresolved(query),
            Err(err) if err.is_row_level() => {
                warn!(target: "pipeline", ?err, row = row.index, query = %query, "failed to geocode row");
                RowOutcome::Failed(query)
            }
            Err(err) => {
                error!(target: "pipeline", ?err, row = row.index, query = %query, "geocode store unavailable");
                RowOutcome::Failed(query)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::cache::CoordinateCache;
    use crate::errors::AppResult;
    use crate::progress::{ChannelProgress, NullProgress, ProgressEvent};
    use crate::provider::GeocodeProvider;
    use crate::rate_limit::RateLimiter;
    use crate::resolver::tests::ScriptedProvider;
    use crate::resolver::PreloadTable;
    use crate::store::KeyValueStore;

    fn palermo() -> Coordinate {
        Coordinate::new(-34.59, -58.40).unwrap()
    }

    fn pipeline_with(provider: Arc<dyn GeocodeProvider>, workers: usize) -> ResolutionPipeline {
        let resolver = GeocodeResolver::new(
            CoordinateCache::new(KeyValueStore::in_memory()),
            Arc::new(PreloadTable::default()),
            Arc::new(RateLimiter::new(1)),
            provider,
        );
        ResolutionPipeline::new(Arc::new(resolver), workers)
    }

    fn address_row(index: usize, street: &str, barrio: &str) -> Row {
        Row::from_pairs(index, [("Direccion", street), ("Barrio", barrio)])
    }

    #[tokio::test]
    async fn resolves_native_rows_without_network() {
        let provider = Arc::new(ScriptedProvider::with(&[(
            "Av. Santa Fe 3253, Palermo",
            palermo(),
        )]));
        let pipeline = pipeline_with(provider.clone(), 2);
        let rows = vec![
            address_row(0, "Av. Santa Fe 3253", "Palermo"),
            Row::from_pairs(
                1,
                [
                    ("Direccion", "Av. 9 de Julio 100"),
                    ("Lat", "-34,6"),
                    ("Lon", "-58,38"),
                ],
            ),
        ];

        let outcome = pipeline.run(rows, &NullProgress).await;
        assert_eq!(provider.call_count(), 1);
        assert_eq!(outcome.run.native, 1);
        assert_eq!(outcome.run.provider_hits, 1);
        assert_eq!(outcome.rows[0].coordinate, Some(palermo()));
        assert_eq!(
            outcome.rows[1].coordinate,
            Some(Coordinate { lat: -34.6, lon: -58.38 })
        );
        assert_eq!(
            pipeline.resolver().cache().get("av. 9 de julio 100").unwrap(),
            Some(Coordinate { lat: -34.6, lon: -58.38 })
        );

        let again = pipeline
            .run(vec![address_row(0, "Av. Santa Fe 3253", "Palermo")], &NullProgress)
            .await;
        assert_eq!(again.run.cache_hits, 1);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn counts_native_resolved_and_deduplicated_failures() {
        let provider = Arc::new(
            ScriptedProvider::with(&[
                ("Corrientes 348, San Nicolás", palermo()),
                ("Cabildo 2000, Belgrano", palermo()),
            ])
            .fail_on("Rivadavia 1, Once"),
        );
        let pipeline = pipeline_with(provider.clone(), 3);
        let rows = vec![
            Row::from_pairs(0, [("lat", "-34.6"), ("lon", "-58.4")]),
            address_row(1, "Corrientes 348", "San Nicolás"),
            address_row(2, "Calle Falsa 123", "Springfield"),
            Row::from_pairs(3, [("Latitud", "-34.7"), ("Longitud", "-58.5")]),
            address_row(4, "Calle Falsa 123", "Springfield"),
            address_row(5, "Cabildo 2000", "Belgrano"),
            address_row(6, "Rivadavia 1", "Once"),
            address_row(7, "", "Palermo"),
        ];

        let outcome = pipeline.run(rows, &NullProgress).await;
        let run = &outcome.run;
        assert_eq!(run.total, 8);
        assert_eq!(run.done, 8);
        assert_eq!(run.native, 2);
        assert_eq!(run.resolved, 2);
        assert_eq!(run.geocoded(), 4);
        assert_eq!(run.skipped, 1);
        assert_eq!(run.failed, 3);
        let mut failures = run.failed_queries.clone();
        failures.sort();
        assert_eq!(failures, vec!["Calle Falsa 123, Springfield", "Rivadavia 1, Once"]);
        assert!(!run.cancelled);
    }

    #[tokio::test]
    async fn preserves_input_order_regardless_of_completion() {
        struct Staggered;

        #[async_trait]
        impl GeocodeProvider for Staggered {
            async fn lookup(&self, query: &str) -> AppResult<Option<Coordinate>> {
                let (delay, lat) = match query {
                    "slow" => (60, -10.0),
                    "medium" => (30, -20.0),
                    _ => (1, -30.0),
                };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(Coordinate::new(lat, 0.0))
            }
        }

        let pipeline = pipeline_with(Arc::new(Staggered), 3);
        let rows = ["slow", "medium", "fast"]
            .iter()
            .enumerate()
            .map(|(index, street)| Row::from_pairs(index, [("address", *street)]))
            .collect();

        let outcome = pipeline.run(rows, &NullProgress).await;
        let indices: Vec<_> = outcome.rows.iter().map(|row| row.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        let lats: Vec<_> = outcome
            .rows
            .iter()
            .map(|row| row.coordinate.unwrap().lat)
            .collect();
        assert_eq!(lats, vec![-10.0, -20.0, -30.0]);
    }

    #[tokio::test]
    async fn reports_each_row_once_and_completion() {
        let provider = Arc::new(ScriptedProvider::default());
        let pipeline = pipeline_with(provider, 2);
        let (tx, mut rx) = unbounded_channel();
        let reporter = ChannelProgress::new(tx);
        let rows = vec![
            Row::from_pairs(0, [("lat", "-34.6"), ("lon", "-58.4")]),
            address_row(1, "Calle Falsa 123", "Springfield"),
            Row::from_pairs(2, [("lat", "-34.7"), ("lon", "-58.5")]),
        ];

        pipeline.run(rows, &reporter).await;
        drop(reporter);

        let mut done_values = Vec::new();
        let mut completed = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ProgressEvent::Progress { done, total } => {
                    assert_eq!(total, 3);
                    done_values.push(done);
                }
                ProgressEvent::Completed { geocoded } => completed.push(geocoded),
            }
        }
        assert_eq!(done_values, vec![1, 2, 3]);
        assert_eq!(completed, vec![2]);
    }

    #[tokio::test]
    async fn no_completion_event_without_successes() {
        let pipeline = pipeline_with(Arc::new(ScriptedProvider::default()), 1);
        let (tx, mut rx) = unbounded_channel();
        let reporter = ChannelProgress::new(tx);
        pipeline
            .run(vec![address_row(0, "Calle Falsa 123", "Springfield")], &reporter)
            .await;
        drop(reporter);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events, vec![ProgressEvent::Progress { done: 1, total: 1 }]);
    }

    struct SlowProvider;

    #[async_trait]
    impl GeocodeProvider for SlowProvider {
        async fn lookup(&self, _query: &str) -> AppResult<Option<Coordinate>> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Coordinate::new(-34.6, -58.4))
        }
    }

    fn numbered_rows(count: usize) -> Vec<Row> {
        (0..count)
            .map(|index| Row::from_pairs(index, [("address", format!("Calle {index}"))]))
            .collect()
    }

    #[tokio::test]
    async fn new_batch_supersedes_running_one() {
        let pipeline = pipeline_with(Arc::new(SlowProvider), 1);

        let first = pipeline.run(numbered_rows(10), &NullProgress);
        let second = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            pipeline.run(numbered_rows(2), &NullProgress).await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.run.cancelled);
        assert!(first.run.done < 10);
        assert_eq!(first.rows.len(), 10);
        assert!(!second.run.cancelled);
        assert_eq!(second.run.done, 2);
        assert_eq!(second.run.generation, first.run.generation + 1);
    }

    #[tokio::test]
    async fn cancel_stops_pulling_rows() {
        let pipeline = pipeline_with(Arc::new(SlowProvider), 2);
        let run = pipeline.run(numbered_rows(20), &NullProgress);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            pipeline.cancel();
        };
        let (outcome, _) = tokio::join!(run, cancel);

        assert!(outcome.run.cancelled);
        assert!(outcome.run.done < 20);
    }

    /// Answers "Calle 0" and "Calle 1" at once; every other lookup blocks
    /// until `release` gets permits.
    struct GatedProvider {
        entered: Semaphore,
        release: Semaphore,
    }

    #[async_trait]
    impl GeocodeProvider for GatedProvider {
        async fn lookup(&self, query: &str) -> AppResult<Option<Coordinate>> {
            if !matches!(query, "Calle 0" | "Calle 1") {
                self.entered.add_permits(1);
                let _permit = self.release.acquire().await.expect("gate closed");
            }
            Ok(Coordinate::new(-34.6, -58.4))
        }
    }

    #[tokio::test]
    async fn drops_results_landing_after_cancel() {
        let provider = Arc::new(GatedProvider {
            entered: Semaphore::new(0),
            release: Semaphore::new(0),
        });
        let pipeline = pipeline_with(provider.clone(), 2);
        let run = pipeline.run(numbered_rows(6), &NullProgress);
        let cancel = async {
            // both workers are now waiting on rows 2 and 3
            let _entered = provider.entered.acquire_many(2).await.unwrap();
            pipeline.cancel();
            provider.release.add_permits(2);
        };
        let (outcome, _) = tokio::join!(run, cancel);

        assert!(outcome.run.cancelled);
        assert_eq!(outcome.run.done, 2);
        assert_eq!(outcome.run.provider_hits, 2);
        let resolved: Vec<_> = outcome
            .rows
            .iter()
            .map(|row| row.coordinate.is_some())
            .collect();
        assert_eq!(resolved, vec![true, true, false, false, false, false]);
        assert_eq!(pipeline.resolver().cache().len().unwrap(), 4);
    }

    #[tokio::test]
    async fn empty_batch_completes_immediately() {
        let pipeline = pipeline_with(Arc::new(ScriptedProvider::default()), 4);
        let outcome = pipeline.run(Vec::new(), &NullProgress).await;
        assert_eq!(outcome.run.total, 0);
        assert_eq!(outcome.run.done, 0);
        assert!(!outcome.run.cancelled);
    }
}
