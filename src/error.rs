//! Error types for sync operations.

use std::io;
use thiserror::Error;

/// Errors that can occur while fetching, parsing or reconciling range files.
#[derive(Error, Debug)]
pub enum SyncError {
    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// HTTP request error during download.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// Error reported by the storage backend.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),

    /// Schema migration failure while opening a store.
    #[error(transparent)]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    /// A string that is not five hexadecimal characters.
    #[error("Invalid prefix: {0:?}")]
    InvalidPrefix(String),

    /// A range download that still failed after the last retry.
    #[error("Range download failed: {0}")]
    DownloadFailed(String),

    /// The cache directory is missing or not usable. Fatal, never retried.
    #[error("Cache directory unusable: {0}")]
    CacheDir(String),

    /// Work was refused or abandoned because shutdown has started.
    #[error("Operation cancelled")]
    Cancelled,

    /// A worker task panicked or was aborted.
    #[error("Task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Task(e.to_string())
    }
}
