//! Error type shared by the ingestion pipeline, the store and publishing clients,
//! and the job runner.
//!
//! Every failure carries an [`ErrorKind`]. The kind decides the terminal status
//! code written to the status log and whether the job runner retries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retry hint attached to geometry errors that a ring repair policy could absorb.
pub const RING_RETRY_HINT: &str = "Try again with error_handle set to 'replace' or 'drop'.";

/// Closed classification of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller fault: malformed input, bad arguments, missing preconditions
    Validation,
    /// The target already exists
    Conflict,
    /// The target does not exist
    NotFound,
    /// Unexpected failure of the store, the tile server or the filesystem
    Upstream,
}

impl ErrorKind {
    /// Only system faults are worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Upstream)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::NotFound => write!(f, "not found"),
            ErrorKind::Upstream => write!(f, "upstream"),
        }
    }
}

/// Error raised anywhere in the layer pipeline
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct LayerError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Result type for layer operations
pub type LayerResult<T> = Result<T, LayerError>;

impl LayerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream, message)
    }

    /// Malformed geometry that survived ring repair
    pub fn malformed_geometry(detail: impl std::fmt::Display) -> Self {
        Self::validation(format!("{} {}", detail, RING_RETRY_HINT))
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<std::io::Error> for LayerError {
    fn from(e: std::io::Error) -> Self {
        LayerError::upstream(format!("IO error: {}", e))
    }
}

impl From<reqwest::Error> for LayerError {
    fn from(e: reqwest::Error) -> Self {
        LayerError::upstream(format!("HTTP error: {}", e))
    }
}

impl From<quick_xml::Error> for LayerError {
    fn from(e: quick_xml::Error) -> Self {
        LayerError::validation(format!("Malformed KML document: {}", e))
    }
}

impl From<serde_json::Error> for LayerError {
    fn from(e: serde_json::Error) -> Self {
        LayerError::upstream(format!("Serialization error: {}", e))
    }
}

#[cfg(feature = "postgres-backend")]
impl From<tokio_postgres::Error> for LayerError {
    fn from(e: tokio_postgres::Error) -> Self {
        LayerError::upstream(format!("PostGIS query failed: {}", e))
    }
}

#[cfg(feature = "postgres-backend")]
impl From<deadpool_postgres::PoolError> for LayerError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        LayerError::upstream(format!("PostGIS connection unavailable: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_upstream_is_retryable() {
        assert!(LayerError::upstream("down").is_retryable());
        assert!(!LayerError::validation("bad").is_retryable());
        assert!(!LayerError::conflict("dup").is_retryable());
        assert!(!LayerError::not_found("gone").is_retryable());
    }

    #[test]
    fn test_malformed_geometry_carries_hint() {
        let err = LayerError::malformed_geometry("LinearRing has 2 points.");
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.to_string().ends_with(RING_RETRY_HINT));
    }

    #[test]
    fn test_io_error_is_upstream() {
        let err: LayerError = std::io::Error::other("disk full").into();
        assert_eq!(err.kind, ErrorKind::Upstream);
        assert!(err.message.contains("disk full"));
    }
}
