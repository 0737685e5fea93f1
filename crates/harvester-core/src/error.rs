use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by every component.
///
/// Whether a failure is retried is decided by its kind alone, never by the
/// component that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed target identity.
    Validation,
    /// DNS / connect / transport failure.
    Network,
    /// A deadline was exceeded at some suspension point.
    Timeout,
    /// The anti-block classifier flagged the response.
    BlockDetected,
    /// The page loaded but the expected data was absent.
    Extraction,
    /// Pool saturated beyond the wait deadline, or no mandatory proxy.
    ResourceExhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::BlockDetected => "block_detected",
            ErrorKind::Extraction => "extraction",
            ErrorKind::ResourceExhausted => "resource_exhausted",
        }
    }

    /// Kinds that go through the retry controller's backoff.
    ///
    /// `Extraction` is retryable but budgeted separately
    /// (see [`RetryPolicy::max_extraction_retries`](crate::retry::RetryPolicy)).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Extraction
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Application-wide error type for Harvester.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppError {
    /// The target identity could not be parsed or is not allowed.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A suspension point exceeded its deadline.
    #[error("Timed out during {stage} after {elapsed_ms} ms")]
    Timeout { stage: &'static str, elapsed_ms: u64 },

    /// Automated-access countermeasures detected in the response.
    #[error("Block detected: {0}")]
    BlockDetected(String),

    /// Page loaded but the expected fields were missing.
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// No capacity (pool slot or mandatory proxy) within the deadline.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl AppError {
    pub fn timeout(stage: &'static str, elapsed: std::time::Duration) -> Self {
        AppError::Timeout {
            stage,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::ValidationError(_) => ErrorKind::Validation,
            AppError::NetworkError(_) => ErrorKind::Network,
            AppError::Timeout { .. } => ErrorKind::Timeout,
            AppError::BlockDetected(_) => ErrorKind::BlockDetected,
            AppError::ExtractionError(_) => ErrorKind::Extraction,
            AppError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Returns true if the egress path should be held responsible.
    pub fn should_penalize_proxy(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::BlockDetected
        )
    }
}
