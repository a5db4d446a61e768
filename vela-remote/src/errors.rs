//! Error types for remote store access and transfers

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    /// Retryable: timeouts, 5xx, maintenance windows, connection drops.
    #[error("Temporary remote failure: {0}")]
    Temporary(String),

    /// The server broke protocol expectations (wrong status, malformed
    /// body). Never retried; aborts the affected subtree or item.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Authentication was rejected. Aborts the whole run without marking
    /// items in error.
    #[error("Remote store rejected credentials")]
    Unauthorized,

    #[error("Remote item not found: {0}")]
    NotFound(String),

    /// Quota exhausted on the remote side.
    #[error("Insufficient remote storage")]
    InsufficientStorage,

    /// An If-Match precondition failed: the remote item changed after
    /// discovery. The item is rediscovered next run.
    #[error("Remote item changed since discovery: {0}")]
    PreconditionFailed(String),

    /// The local file mutated while its upload was in flight.
    #[error("Upload source changed during transfer")]
    SourceChanged,

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn is_temporary(&self) -> bool {
        matches!(self, RemoteError::Temporary(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Protocol(format!("malformed response body: {err}"))
        } else {
            // Connect failures, timeouts, and mid-body disconnects all
            // classify as retryable.
            RemoteError::Temporary(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;
