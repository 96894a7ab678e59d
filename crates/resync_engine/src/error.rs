//! Error types for the sync engine.

use resync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Retry classification of a [`SyncError`].
///
/// Every scheduling decision in the engine is a `match` on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input. Caller error, never retried.
    Validation,
    /// Network, rate-limit or server-unavailable. Retried with backoff.
    Transient,
    /// The remote explicitly rejected the payload. Never retried.
    Permanent,
    /// Local resource failure such as a persistence write. Retried after a
    /// short fixed delay without consuming an attempt.
    Capacity,
    /// The work was withdrawn before it ran.
    Cancelled,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The caller supplied invalid input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Network or transport error that may succeed later.
    #[error("transient error: {0}")]
    Transient(String),

    /// The remote is rate limiting this client.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The remote operation did not answer in time.
    #[error("operation timed out")]
    Timeout,

    /// The remote rejected the payload (schema mismatch, forbidden, ...).
    #[error("rejected by remote: {0}")]
    Permanent(String),

    /// A local resource is exhausted.
    #[error("capacity error: {0}")]
    Capacity(String),

    /// Persistence layer failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A persisted record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The component has been shut down and accepts no more work.
    #[error("engine is shut down")]
    Shutdown,

    /// The work was cancelled before it started.
    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a transient (retryable) error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a permanent (non-retryable) error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Returns the retry classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation(_) | SyncError::Shutdown => ErrorKind::Validation,
            SyncError::Transient(_) | SyncError::RateLimited(_) | SyncError::Timeout => {
                ErrorKind::Transient
            }
            SyncError::Permanent(_) => ErrorKind::Permanent,
            SyncError::Capacity(_) | SyncError::Storage(_) | SyncError::Codec(_) => {
                ErrorKind::Capacity
            }
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Capacity)
    }
}

impl From<ciborium::de::Error<std::io::Error>> for SyncError {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        SyncError::Codec(err.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for SyncError {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        SyncError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds() {
        assert_eq!(SyncError::validation("empty key").kind(), ErrorKind::Validation);
        assert_eq!(SyncError::Shutdown.kind(), ErrorKind::Validation);
        assert_eq!(SyncError::transient("offline").kind(), ErrorKind::Transient);
        assert_eq!(SyncError::RateLimited("429".into()).kind(), ErrorKind::Transient);
        assert_eq!(SyncError::Timeout.kind(), ErrorKind::Transient);
        assert_eq!(SyncError::permanent("schema").kind(), ErrorKind::Permanent);
        assert_eq!(
            SyncError::Storage(StorageError::Full("quota".into())).kind(),
            ErrorKind::Capacity
        );
        assert_eq!(SyncError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transient("connection lost").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::Capacity("disk full".into()).is_retryable());
        assert!(!SyncError::permanent("schema mismatch").is_retryable());
        assert!(!SyncError::validation("bad key").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn error_display() {
        assert_eq!(SyncError::Shutdown.to_string(), "engine is shut down");
        assert!(SyncError::permanent("schema mismatch")
            .to_string()
            .contains("schema mismatch"));
    }
}
