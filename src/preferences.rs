use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::address::PREFERENCE_PREFIX;
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::store::KeyValueStore;

const MAX_WORKERS: usize = 16;
const MIN_RATE_LIMIT_MS: u64 = 250;
const MAX_RATE_LIMIT_MS: u64 = 60_000;
const DEFAULT_CLUSTER_RADIUS_PX: u32 = 60;

/// UI preferences, persisted beside the geocode cache under their own
/// namespace so clearing one never touches the other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    pub worker_count: usize,
    pub rate_limit_ms: u64,
    pub cluster_radius_px: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePreferencesPayload {
    pub worker_count: Option<usize>,
    pub rate_limit_ms: Option<u64>,
    pub cluster_radius_px: Option<u32>,
}

impl Preferences {
    pub fn storage_key() -> String {
        format!("{PREFERENCE_PREFIX}runtime")
    }

    pub fn load(store: &KeyValueStore, config: &AppConfig) -> AppResult<Self> {
        match store.get::<Self>(&Self::storage_key()) {
            Ok(Some(stored)) => Ok(stored.clamped()),
            Ok(None) => Ok(Self::from_config(config)),
            Err(err) => {
                warn!(
                    target: "preferences",
                    error = ?err,
                    "stored preferences unreadable; using defaults"
                );
                let defaults = Self::from_config(config);
                defaults.persist(store)?;
                Ok(defaults)
            }
        }
    }

    pub fn persist(&self, store: &KeyValueStore) -> AppResult<()> {
        store.put(&Self::storage_key(), self)
    }

    pub fn apply_patch(&mut self, payload: &UpdatePreferencesPayload) {
        if let Some(workers) = payload.worker_count {
            self.worker_count = workers;
        }
        if let Some(rate_limit_ms) = payload.rate_limit_ms {
            self.rate_limit_ms = rate_limit_ms;
        }
        if let Some(radius) = payload.cluster_radius_px {
            self.cluster_radius_px = radius;
        }
        *self = self.clone().clamped();
    }

    fn from_config(config: &AppConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            rate_limit_ms: config.rate_limit_ms,
            cluster_radius_px: DEFAULT_CLUSTER_RADIUS_PX,
        }
        .clamped()
    }

    fn clamped(mut self) -> Self {
        self.worker_count = self.worker_count.clamp(1, MAX_WORKERS);
        self.rate_limit_ms = self.rate_limit_ms.clamp(MIN_RATE_LIMIT_MS, MAX_RATE_LIMIT_MS);
        self.cluster_radius_px = self.cluster_radius_px.clamp(10, 200);
        self
    }
}
