use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace};

use crate::address::normalize;
use crate::cache::CoordinateCache;
use crate::errors::AppResult;
use crate::ingestion::Coordinate;
use crate::provider::GeocodeProvider;
use crate::rate_limit::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Cache,
    Preload,
    Provider,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub coordinate: Coordinate,
    pub source: ResolutionSource,
}

/// Optional in-memory seed data, consulted after the durable cache. Hits are
/// copied into the cache on first use.
#[derive(Default)]
pub struct PreloadTable {
    entries: RwLock<HashMap<String, Coordinate>>,
}

impl PreloadTable {
    pub fn get(&self, normalized: &str) -> Option<Coordinate> {
        self.entries.read().get(normalized).copied()
    }

    pub fn replace(&self, entries: HashMap<String, Coordinate>) -> usize {
        let normalized = entries
            .into_iter()
            .map(|(address, coordinate)| (normalize(&address), coordinate))
            .filter(|(address, coordinate)| !address.is_empty() && coordinate.is_valid())
            .collect::<HashMap<_, _>>();
        let count = normalized.len();
        *self.entries.write() = normalized;
        count
    }

    /// Loads a JSON object of `address -> {lat, lon}` from disk.
    pub fn load_file(&self, path: &Path) -> AppResult<usize> {
        let contents = std::fs::read_to_string(path)?;
        let entries: HashMap<String, Coordinate> = serde_json::from_str(&contents)?;
        let count = self.replace(entries);
        debug!(target: "resolver", path = %path.display(), count, "preload table loaded");
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct GeocodeResolver {
    cache: CoordinateCache,
    preload: Arc<PreloadTable>,
    limiter: Arc<RateLimiter>,
    provider: Arc<dyn GeocodeProvider>,
}

impl GeocodeResolver {
    pub fn new(
        cache: CoordinateCache,
        preload: Arc<PreloadTable>,
        limiter: Arc<RateLimiter>,
        provider: Arc<dyn GeocodeProvider>,
    ) -> Self {
        Self {
            cache,
            preload,
            limiter,
            provider,
        }
    }

    pub fn cache(&self) -> &CoordinateCache {
        &self.cache
    }

    pub fn preload(&self) -> &PreloadTable {
        &self.preload
    }

    /// Cache, then preload table, then one rate-limited provider call.
    ///
    /// Misses are not cached so a later run can try again.
    pub async fn resolve(&self, address: &str) -> AppResult<Option<Resolution>> {
        let normalized = normalize(address);
        if normalized.is_empty() {
            return Ok(None);
        }

        if let Some(coordinate) = self.cache.get(&normalized)? {
            trace!(target: "resolver", address = %normalized, "cache hit");
            return Ok(Some(Resolution {
                coordinate,
                source: ResolutionSource::Cache,
            }));
        }

        if let Some(coordinate) = self.preload.get(&normalized) {
            self.cache.put(&normalized, coordinate)?;
            trace!(target: "resolver", address = %normalized, "preload hit");
            return Ok(Some(Resolution {
                coordinate,
                source: ResolutionSource::Preload,
            }));
        }

        self.limiter.acquire().await;
        let Some(coordinate) = self.provider.lookup(address.trim()).await? else {
            debug!(target: "resolver", address = %normalized, "provider returned no candidates");
            return Ok(None);
        };
        self.cache.put(&normalized, coordinate)?;
        Ok(Some(Resolution {
            coordinate,
            source: ResolutionSource::Provider,
        }))
    }
}
