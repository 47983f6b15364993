use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("could not read input rows: {0}")]
    Parse(String),
    #[error("geocoding provider returned {status} for {query:?}")]
    Provider { status: u16, query: String },
    #[error("geocoding provider unreachable: {0}")]
    Network(#[from] reqwest::Error),
}

impl AppError {
    /// Row-level failures that must not abort a batch.
    pub fn is_row_level(&self) -> bool {
        matches!(self, AppError::Provider { .. } | AppError::Network(_))
    }
}
