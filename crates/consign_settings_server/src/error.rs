//! Error types for the settings server.

use consign_sync_engine::SyncError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while serving a settings request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Malformed request body.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The document was rejected by the resource's normalizer.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown resource, or no document stored yet.
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource does not accept this method.
    #[error("method {method} not allowed on {resource}")]
    MethodNotAllowed {
        /// Request method.
        method: String,
        /// Requested resource.
        resource: String,
    },

    /// Request body exceeds the configured limit.
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge {
        /// Body size.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Validation(_) => 400,
            ServerError::NotFound(_) => 404,
            ServerError::MethodNotAllowed { .. } => 405,
            ServerError::PayloadTooLarge { .. } => 413,
            ServerError::Internal(_) => 500,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(error: serde_json::Error) -> Self {
        ServerError::InvalidRequest(error.to_string())
    }
}

impl From<SyncError> for ServerError {
    fn from(error: SyncError) -> Self {
        ServerError::InvalidRequest(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Validation("rate".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
    }

    #[test]
    fn status_codes() {
        assert_eq!(ServerError::NotFound("x".into()).status_code(), 404);
        assert_eq!(
            ServerError::MethodNotAllowed {
                method: "PATCH".into(),
                resource: "/api/settings/storefront".into()
            }
            .status_code(),
            405
        );
        assert_eq!(ServerError::PayloadTooLarge { size: 10, limit: 5 }.status_code(), 413);
    }

    #[test]
    fn error_display() {
        let err = ServerError::PayloadTooLarge { size: 70000, limit: 65536 };
        let msg = err.to_string();
        assert!(msg.contains("70000"));
        assert!(msg.contains("65536"));
    }

    #[test]
    fn path_errors_are_bad_requests() {
        let err: ServerError = SyncError::InvalidPath("tax..rate".into()).into();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn json_errors_are_bad_requests() {
        let err: ServerError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }
}
