use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_JOURNAL_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_JOURNAL_MAX_FILES: usize = 5;
const DEFAULT_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
pub const DEFAULT_RATE_LIMIT_MS: u64 = 1_100;
pub const DEFAULT_WORKERS: usize = 3;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub geocoder_endpoint: String,
    pub geocoder_country: String,
    pub geocoder_api_key: Option<SecretString>,
    pub geocoder_email: Option<String>,
    pub geocoder_user_agent: String,
    pub geocoder_timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub worker_count: usize,
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub journal_enabled: bool,
    pub journal_batch_size: usize,
    pub journal_max_bytes: u64,
    pub journal_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocoder_endpoint: String,
    pub geocoder_country: String,
    pub geocoder_user_agent: String,
    pub geocoder_timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub worker_count: usize,
    pub data_dir: String,
    pub database_file_name: String,
    pub journal_enabled: bool,
    pub journal_batch_size: usize,
    pub journal_max_bytes: u64,
    pub journal_max_files: usize,
    pub has_geocoder_api_key: bool,
    pub has_geocoder_email: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            geocoder_endpoint: env::var("GEOCODER_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            geocoder_country: env::var("GEOCODER_COUNTRY")
                .map(|v| v.trim().to_ascii_lowercase())
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "ar".to_string()),
            geocoder_api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            geocoder_email: env::var("GEOCODER_EMAIL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            geocoder_user_agent: env::var("GEOCODER_USER_AGENT").unwrap_or_else(|_| {
                format!("address-geocoder/{}", env!("CARGO_PKG_VERSION"))
            }),
            geocoder_timeout_ms: parse_u64("GEOCODER_TIMEOUT_MS", 10_000),
            rate_limit_ms: parse_u64("RATE_LIMIT_MS", DEFAULT_RATE_LIMIT_MS),
            worker_count: parse_usize("GEOCODE_WORKERS", DEFAULT_WORKERS).max(1),
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".address-geocoder")),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "geocache.db".to_string()),
            journal_enabled: parse_bool("JOURNAL_ENABLED", true),
            journal_batch_size: parse_usize("JOURNAL_BATCH_SIZE", 10).max(1),
            journal_max_bytes: parse_u64("JOURNAL_MAX_BYTES", DEFAULT_JOURNAL_MAX_BYTES),
            journal_max_files: parse_usize("JOURNAL_MAX_FILES", DEFAULT_JOURNAL_MAX_FILES).max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocoder_endpoint: self.geocoder_endpoint.clone(),
            geocoder_country: self.geocoder_country.clone(),
            geocoder_user_agent: self.geocoder_user_agent.clone(),
            geocoder_timeout_ms: self.geocoder_timeout_ms,
            rate_limit_ms: self.rate_limit_ms,
            worker_count: self.worker_count,
            data_dir: self.data_dir.to_string_lossy().to_string(),
            database_file_name: self.database_file_name.clone(),
            journal_enabled: self.journal_enabled,
            journal_batch_size: self.journal_batch_size,
            journal_max_bytes: self.journal_max_bytes,
            journal_max_files: self.journal_max_files,
            has_geocoder_api_key: self.geocoder_api_key.is_some(),
            has_geocoder_email: self.geocoder_email.is_some(),
        }
    }

    /// Config rooted at `data_dir` with journal and provider defaults, for tests.
    #[cfg(test)]
    pub fn for_tests(data_dir: &std::path::Path) -> Self {
        Self {
            geocoder_endpoint: "http://127.0.0.1:9/search".into(),
            geocoder_country: "ar".into(),
            geocoder_api_key: None,
            geocoder_email: None,
            geocoder_user_agent: "address-geocoder/test".into(),
            geocoder_timeout_ms: 1_000,
            rate_limit_ms: 5,
            worker_count: 3,
            data_dir: data_dir.to_path_buf(),
            database_file_name: "test.db".into(),
            journal_enabled: true,
            journal_batch_size: 2,
            journal_max_bytes: 1024,
            journal_max_files: 3,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}
