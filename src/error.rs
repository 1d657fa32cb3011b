//! Error types for claimr
//!
//! Centralized error handling using thiserror.

use std::time::Duration;

use thiserror::Error;

use crate::ipc::ErrorKind;

/// All error types that can occur in claimr
#[derive(Debug, Error)]
pub enum ClaimrError {
    /// The server has no unclaimed work left. Not a fault.
    #[error("No work available")]
    NoWorkAvailable,

    /// The server failed while servicing the request
    #[error("Remote error ({kind}): {message}")]
    Remote { kind: ErrorKind, message: String },

    /// No reply arrived within the bounded wait
    #[error("Timed out after {0:?} waiting for reply")]
    Timeout(Duration),

    /// The server assigned a key with no local counterpart
    #[error("Unknown key: {0}")]
    UnknownKey(String),

    /// Transport-level communication error
    #[error("IPC error: {0}")]
    Ipc(String),

    /// State file persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration or input
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClaimrError {
    /// Whether a bounded retry may succeed where this attempt failed
    pub fn is_retryable(&self) -> bool {
        match self {
            ClaimrError::Timeout(_) | ClaimrError::Ipc(_) => true,
            ClaimrError::Remote { kind, .. } => kind.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias for claimr operations
pub type Result<T> = std::result::Result<T, ClaimrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_work_available_error() {
        let err = ClaimrError::NoWorkAvailable;
        assert_eq!(err.to_string(), "No work available");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_remote_error_display() {
        let err = ClaimrError::Remote {
            kind: ErrorKind::Internal,
            message: "state file locked".to_string(),
        };
        assert_eq!(err.to_string(), "Remote error (internal): state file locked");
    }

    #[test]
    fn test_remote_retryable_depends_on_kind() {
        let busy = ClaimrError::Remote {
            kind: ErrorKind::Unavailable,
            message: "shutting down".to_string(),
        };
        let fatal = ClaimrError::Remote {
            kind: ErrorKind::VersionMismatch,
            message: "v2".to_string(),
        };
        assert!(busy.is_retryable());
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn test_timeout_error() {
        let err = ClaimrError::Timeout(Duration::from_secs(10));
        assert!(err.to_string().contains("10s"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unknown_key_is_fatal() {
        let err = ClaimrError::UnknownKey("c.pkl".to_string());
        assert_eq!(err.to_string(), "Unknown key: c.pkl");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: ClaimrError = io_err.into();
        assert!(matches!(err, ClaimrError::Io(_)));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: ClaimrError = json_err.into();
        assert!(matches!(err, ClaimrError::Json(_)));
    }
}
