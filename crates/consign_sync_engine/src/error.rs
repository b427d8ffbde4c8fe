//! Error types for the settings sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while synchronizing a settings document.
///
/// Transport failures never escape the engine's save path; they are
/// reported through the error channel instead. The remaining variants are
/// caller errors (bad paths, values that don't fit the document type).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The settings API answered with a non-success status.
    #[error("settings api returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// A document or payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A field path is malformed (empty, or with an empty segment).
    #[error("invalid field path: {0:?}")]
    InvalidPath(String),

    /// A write would have to descend through a non-object value.
    #[error("cannot write {path:?}: segment {segment:?} is not an object")]
    PathConflict {
        /// The full path being written.
        path: String,
        /// The segment holding a non-object value.
        segment: String,
    },

    /// Request timed out.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to settings api")]
    NotConnected,

    /// The engine was constructed outside a Tokio runtime.
    #[error("no tokio runtime available to drive the save scheduler")]
    NoRuntime,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Status { status, .. } => *status >= 500 || *status == 429,
            SyncError::Timeout => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Codec(err.to_string())
    }
}
