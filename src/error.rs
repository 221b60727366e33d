//! Error types shared across the pipeline.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Durable key-value store could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Problems with a user-supplied CSV upload. The message is shown as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImportError {
    #[error("Please select a CSV file")]
    NotCsv,

    #[error("Please enter CSV data")]
    Empty,

    #[error("No valid pairs found in CSV")]
    NoValidPairs,

    #[error("No existing CSV export found")]
    NoExistingExport,

    #[error("Error loading CSV file: {0}")]
    Unreadable(String),
}
