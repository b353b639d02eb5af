//! Error taxonomy of the dynamic driver.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HatError>;

#[derive(Error, Debug)]
pub enum HatError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("template `{template}` needs tag `{tag}` but no value was given")]
    MissingTag { tag: String, template: String },

    #[error("data not available: {}", .0.display())]
    DataUnavailable(PathBuf),

    #[error("unexpected data in {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },

    #[error("corrupt cache file {}: {reason}", path.display())]
    CacheCorruption { path: PathBuf, reason: String },

    #[error("IO error {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error {0}")]
    Csv(#[from] csv::Error),

    #[error("parquet error {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

impl HatError {
    pub fn config(msg: impl Into<String>) -> Self {
        HatError::Configuration(msg.into())
    }

    pub fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        HatError::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Errors that only invalidate one entity/time step; the run goes on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, HatError::DataUnavailable(_) | HatError::Format { .. })
    }

    /// Settings mismatches: the whole run stops.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HatError::Configuration(_) | HatError::MissingTag { .. })
    }
}

// -- Tests -------------------------------------------------------------------
