// src/error.rs

//! Unified error handling for the exporter and processors.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::services::FetchError;

/// Result type alias for export and processing operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client could not be built
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// CSV output failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// SQLite store failed
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Invalid run configuration; raised before any network activity
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Checkpoint file cannot be trusted
    #[error(
        "Checkpoint {path} is corrupt: {message}. Re-run with --no-resume to discard it, or repair the file by hand"
    )]
    CheckpointCorrupt { path: PathBuf, message: String },

    /// A fetch failed in a way the run cannot continue past
    #[error("Fetch failed for {context}: {source}")]
    Fetch {
        context: String,
        #[source]
        source: FetchError,
    },

    /// Payload does not match any recognized shape
    #[error("Malformed payload in {context}: {message}")]
    MalformedPayload { context: String, message: String },
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a checkpoint corruption error.
    pub fn checkpoint_corrupt(path: &Path, message: impl fmt::Display) -> Self {
        Self::CheckpointCorrupt {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }

    /// Create a fatal fetch error with context.
    pub fn fetch(context: impl Into<String>, source: FetchError) -> Self {
        Self::Fetch {
            context: context.into(),
            source,
        }
    }

    /// Create a malformed payload error with context.
    pub fn malformed(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::MalformedPayload {
            context: context.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_error_names_the_way_out() {
        let err = AppError::checkpoint_corrupt(Path::new("out/1/.checkpoint.json"), "bad json");
        let text = err.to_string();
        assert!(text.contains("out/1/.checkpoint.json"));
        assert!(text.contains("--no-resume"));
    }

    #[test]
    fn fetch_error_keeps_context() {
        let err = AppError::fetch("events of org 7", FetchError::Timeout);
        assert!(err.to_string().starts_with("Fetch failed for events of org 7"));
    }
}
