use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::address::{cache_key, normalize, strip_cache_prefix, GEOCODE_PREFIX};
use crate::errors::AppResult;
use crate::ingestion::Coordinate;
use crate::store::KeyValueStore;

/// Durable address -> coordinate memo. Keys are normalized addresses; the
/// geocode namespace prefix is applied here.
#[derive(Clone)]
pub struct CoordinateCache {
    store: KeyValueStore,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

/// Accepts both `{"lat": .., "lon": ..}` objects and `[lat, lon]` pairs.
#[derive(Deserialize)]
#[serde(untagged)]
enum ImportedCoordinate {
    Object { lat: f64, #[serde(alias = "lng")] lon: f64 },
    Pair([f64; 2]),
}

impl ImportedCoordinate {
    fn into_coordinate(self) -> Option<Coordinate> {
        match self {
            ImportedCoordinate::Object { lat, lon } => Coordinate::new(lat, lon),
            ImportedCoordinate::Pair([lat, lon]) => Coordinate::new(lat, lon),
        }
    }
}

impl CoordinateCache {
    pub fn new(store: KeyValueStore) -> Self {
        Self { store }
    }

    pub fn get(&self, address: &str) -> AppResult<Option<Coordinate>> {
        let key = cache_key(&normalize(address));
        let cached: Option<Coordinate> = self.store.get(&key)?;
        Ok(cached.filter(Coordinate::is_valid))
    }

    pub fn put(&self, address: &str, coordinate: Coordinate) -> AppResult<()> {
        let normalized = normalize(address);
        if normalized.is_empty() {
            return Ok(());
        }
        self.store.put(&cache_key(&normalized), &coordinate)
    }

    /// Bulk-loads entries without resolving anything.
    pub fn seed<'a, I>(&self, entries: I) -> AppResult<usize>
    where
        I: IntoIterator<Item = (&'a str, Coordinate)>,
    {
        let prepared = entries
            .into_iter()
            .map(|(address, coordinate)| (normalize(strip_cache_prefix(address)), coordinate))
            .filter(|(normalized, _)| !normalized.is_empty())
            .collect::<Vec<_>>();
        let written = self.store.put_many(
            prepared
                .iter()
                .map(|(normalized, coordinate)| (cache_key(normalized), coordinate)),
        )?;
        debug!(target: "cache", written, "seeded coordinate cache");
        Ok(written)
    }

    pub fn clear(&self) -> AppResult<usize> {
        self.store.remove_prefix(GEOCODE_PREFIX)
    }

    pub fn len(&self) -> AppResult<usize> {
        self.store.count_prefix(GEOCODE_PREFIX)
    }

    pub fn is_empty(&self) -> AppResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Full normalized-address -> coordinate mapping.
    pub fn export(&self) -> AppResult<BTreeMap<String, Coordinate>> {
        let entries: Vec<(String, Coordinate)> = self.store.entries_with_prefix(GEOCODE_PREFIX)?;
        Ok(entries
            .into_iter()
            .map(|(key, coordinate)| (strip_cache_prefix(&key).to_string(), coordinate))
            .collect())
    }

    pub fn import_json(&self, json: &str) -> AppResult<ImportSummary> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(json)?;
        let mut valid = Vec::with_capacity(raw.len());
        let mut skipped = 0;
        for (address, value) in &raw {
            let parsed = serde_json::from_value::<ImportedCoordinate>(value.clone())
                .ok()
                .and_then(ImportedCoordinate::into_coordinate);
            match parsed {
                Some(coordinate) => valid.push((address.as_str(), coordinate)),
                None => {
                    warn!(target: "cache", address = %address, "skipping invalid imported coordinate");
                    skipped += 1;
                }
            }
        }
        let imported = self.seed(valid)?;
        Ok(ImportSummary { imported, skipped })
    }

    pub fn export_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string_pretty(&self.export()?)?)
    }
}
