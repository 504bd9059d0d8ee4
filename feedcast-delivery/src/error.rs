//! Typed error handling for delivery operations.
//!
//! Delivery failures are split the way the queue reacts to them:
//! - Transient failures (connection errors, timeouts, 5xx) pause the
//!   destination under backoff
//! - Permanent failures (4xx rejections) also pause the destination, unless the
//!   destination is marked non-retryable, in which case the entry is dropped
//! - System errors are local problems (spool I/O, corrupt payloads)

use feedcast_spool::SpoolError;
use thiserror::Error;

/// Outcome of a failed delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The destination may accept the file later.
    #[error("Transient failure: {0}")]
    Transient(#[from] TransientError),

    /// The destination refused the file.
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Something went wrong on this node.
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

#[derive(Debug, Error)]
pub enum TransientError {
    /// Connection refused, reset or otherwise not established.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No response within the request timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The destination answered 5xx (or some other unexpected status).
    #[error("Destination returned {status}")]
    ServerError { status: u16 },

    /// A redirect chain longer than the configured limit.
    #[error("Too many redirects ({0})")]
    TooManyRedirects(u32),

    /// A redirect whose location does not name the file being delivered.
    #[error("Unusable redirect to {0}")]
    UnusableRedirect(String),
}

#[derive(Debug, Error)]
pub enum PermanentError {
    /// The destination answered 4xx.
    #[error("Destination rejected the file with {status}")]
    Rejected { status: u16 },

    /// The resolved target could not be turned into a request.
    #[error("Invalid target URL: {0}")]
    InvalidTarget(String),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Spool error: {0}")]
    Spool(#[from] SpoolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A gzip payload that could not be inflated.
    #[error("Failed to decompress payload: {0}")]
    Decompress(String),

    #[error("Metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// The entry was cancelled while an attempt for it was running.
    #[error("Entry {0} was cancelled")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Classify a non-success, non-redirect HTTP status.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        if matches!(status, 400..=499) {
            Self::Permanent(PermanentError::Rejected { status })
        } else {
            Self::Transient(TransientError::ServerError { status })
        }
    }
}

impl From<SpoolError> for DeliveryError {
    fn from(error: SpoolError) -> Self {
        Self::System(SystemError::Spool(error))
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            TransientError::Timeout(error.to_string()).into()
        } else if error.is_builder() {
            PermanentError::InvalidTarget(error.to_string()).into()
        } else {
            TransientError::ConnectionFailed(error.to_string()).into()
        }
    }
}

/// Provisioning problems severe enough to reject a whole snapshot.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Destination {0} is declared more than once")]
    DuplicateDestination(String),

    #[error("Destination {destination} has an invalid URL: {reason}")]
    InvalidUrl { destination: String, reason: String },

    #[error("Local node {0} is not in the node list")]
    UnknownLocalNode(String),

    #[error("Invalid disk thresholds: {0}")]
    InvalidThresholds(String),

    #[error("Backoff multiplier {0} must be at least 1.0")]
    InvalidBackoff(f64),

    #[error("Destination {0} has an empty name")]
    EmptyName(String),
}

/// Redirect log persistence errors.
#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("Redirect log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Redirect log encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(DeliveryError::from_status(404).is_permanent());
        assert!(DeliveryError::from_status(400).is_permanent());
        assert!(DeliveryError::from_status(500).is_transient());
        assert!(DeliveryError::from_status(503).is_transient());
        assert!(DeliveryError::from_status(101).is_transient());
    }

    #[test]
    fn test_spool_error_is_system() {
        let err: DeliveryError = SpoolError::from(std::io::Error::other("disk gone")).into();
        assert!(err.is_system());
        assert!(!err.is_transient());
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_error_display() {
        let error = DeliveryError::from(TransientError::ConnectionFailed(
            "connection refused".to_string(),
        ));
        assert_eq!(
            error.to_string(),
            "Transient failure: Connection failed: connection refused"
        );

        let error = DeliveryError::from_status(410);
        assert_eq!(
            error.to_string(),
            "Permanent failure: Destination rejected the file with 410"
        );
    }
}
