//! Error types for persistence operations.

use std::io;
use thiserror::Error;

/// Result type for persistence operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during persistence operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another process holds the storage directory lock.
    #[error("storage directory is locked by another process: {0}")]
    Locked(String),

    /// A stored file name could not be mapped back to a key.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The backend refused the write (quota, read-only medium, ...).
    #[error("storage full: {0}")]
    Full(String),
}
