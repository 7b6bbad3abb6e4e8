//! Error types for the request-execution core.
//!
//! Every failure surfaced by the pool, the byte stream channel, the integrity
//! filters, the retry controller and the execution state machine is a
//! [`StratusError`]. Each variant maps onto an [`ErrorKind`], which is what
//! retry conditions match against.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Classification of failures used by retry conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The pool could not produce a connection in time.
    ConnectionAcquisition,
    /// I/O failure while writing the request or reading the response.
    Transmission,
    /// Malformed response framing.
    ResponseDecode,
    /// A socket read did not complete within the socket timeout.
    Timeout,
    /// A computed digest did not match the expected one.
    IntegrityMismatch,
    /// The service answered with an error status code.
    ServiceStatus,
    /// The retry controller declined further attempts.
    RetryExhausted,
    /// Caller-initiated abort.
    Cancelled,
    /// The pool was closed.
    PoolClosed,
    /// Invalid configuration.
    Configuration,
    /// Misuse of a byte stream channel.
    Stream,
    /// Iteration past the last page.
    Pagination,
}

impl ErrorKind {
    /// Kinds retried by the default retry condition.
    #[must_use]
    pub fn transient() -> &'static [ErrorKind] {
        &[
            Self::ConnectionAcquisition,
            Self::Transmission,
            Self::ResponseDecode,
            Self::Timeout,
            Self::IntegrityMismatch,
        ]
    }
}

/// The main error type for stratus operations.
#[derive(Debug, Clone, Error)]
pub enum StratusError {
    /// No connection could be acquired.
    #[error("Unable to acquire connection to {endpoint}: {message}")]
    ConnectionAcquisition {
        /// The endpoint the acquisition was for.
        endpoint: String,
        /// What went wrong.
        message: String,
    },

    /// Writing the request or reading the response failed.
    #[error("Transmission failure: {0}")]
    Transmission(String),

    /// The response could not be decoded.
    #[error("Unable to decode response: {0}")]
    ResponseDecode(String),

    /// A socket operation timed out.
    #[error("Socket timeout after {millis}ms while {during}")]
    SocketTimeout {
        /// The configured timeout.
        millis: u64,
        /// The phase that timed out.
        during: String,
    },

    /// Content integrity verification failed.
    #[error("{0}")]
    IntegrityMismatch(#[from] IntegrityMismatchError),

    /// The service answered with a retryable error status.
    #[error("Service returned status {code} {text}")]
    Status {
        /// Status code.
        code: u16,
        /// Status text.
        text: String,
    },

    /// Retries were exhausted.
    #[error("Request failed after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last attempt's failure.
        #[source]
        source: Box<StratusError>,
    },

    /// The request was aborted by the caller.
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// The connection pool has been closed.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// A lease was released twice.
    #[error("Lease {0} was already released")]
    DoubleRelease(u64),

    /// Configuration error.
    #[error("{0}")]
    Configuration(#[from] ConfigError),

    /// A second consumer tried to attach to a byte stream.
    #[error("Byte stream already has a subscriber")]
    AlreadySubscribed,

    /// Pagination ran past the last page.
    #[error("No more pages")]
    EndOfPages,

    /// Item iteration ran past the last item.
    #[error("No more items")]
    EndOfItems,

    /// IO error.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for StratusError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

impl StratusError {
    /// Returns the kind used for retry classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionAcquisition { .. } => ErrorKind::ConnectionAcquisition,
            Self::Transmission(_) | Self::Io(_) => ErrorKind::Transmission,
            Self::ResponseDecode(_) => ErrorKind::ResponseDecode,
            Self::SocketTimeout { .. } => ErrorKind::Timeout,
            Self::IntegrityMismatch(_) => ErrorKind::IntegrityMismatch,
            Self::Status { .. } => ErrorKind::ServiceStatus,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::PoolClosed => ErrorKind::PoolClosed,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::DoubleRelease(_) | Self::AlreadySubscribed => ErrorKind::Stream,
            Self::EndOfPages | Self::EndOfItems => ErrorKind::Pagination,
        }
    }

    /// Returns the status code carried by a status error.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { code, .. } => Some(*code),
            Self::RetryExhausted { source, .. } => source.status_code(),
            _ => None,
        }
    }

    /// Returns true for caller-initiated aborts.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Creates a transmission error.
    #[must_use]
    pub fn transmission(message: impl Into<String>) -> Self {
        Self::Transmission(message.into())
    }

    /// Creates a response decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::ResponseDecode(message.into())
    }
}

/// Which direction of a transfer failed integrity verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Request body sent to the service.
    Upload,
    /// Response body received from the service.
    Download,
}

/// Error raised when a computed digest does not match the expected one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Unable to verify integrity of data {direction:?}. Client calculated content hash {computed} \
     didn't match expected hash {expected}. The data may be corrupt."
)]
pub struct IntegrityMismatchError {
    /// Transfer direction.
    pub direction: TransferDirection,
    /// Digest reported by the service, hex encoded.
    pub expected: String,
    /// Digest computed by the client, hex encoded.
    pub computed: String,
}

impl IntegrityMismatchError {
    /// Creates a new mismatch error from raw digests.
    #[must_use]
    pub fn new(direction: TransferDirection, expected: &[u8], computed: &[u8]) -> Self {
        Self {
            direction,
            expected: hex::encode(expected),
            computed: hex::encode(computed),
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert(
            "direction".to_string(),
            serde_json::to_value(self.direction).unwrap_or(serde_json::Value::Null),
        );
        map.insert("expected".to_string(), serde_json::Value::String(self.expected.clone()));
        map.insert("computed".to_string(), serde_json::Value::String(self.computed.clone()));
        map
    }
}

/// Error raised when configuration values are invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid configuration for {field}: {message}")]
pub struct ConfigError {
    /// The offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates the error raised for a negative value.
    #[must_use]
    pub fn negative(field: impl Into<String>) -> Self {
        Self::new(field, "must not be negative")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(StratusError::transmission("reset").kind(), ErrorKind::Transmission);
        assert_eq!(StratusError::decode("bad").kind(), ErrorKind::ResponseDecode);
        assert_eq!(StratusError::PoolClosed.kind(), ErrorKind::PoolClosed);
        assert_eq!(
            StratusError::Cancelled("user".into()).kind(),
            ErrorKind::Cancelled
        );
        let io: StratusError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(io.kind(), ErrorKind::Transmission);
    }

    #[test]
    fn test_integrity_mismatch_carries_digests() {
        let err = IntegrityMismatchError::new(TransferDirection::Download, &[0xab, 0xcd], &[0x01, 0x02]);
        assert_eq!(err.expected, "abcd");
        assert_eq!(err.computed, "0102");

        let message = StratusError::from(err.clone()).to_string();
        assert!(message.contains("abcd"));
        assert!(message.contains("0102"));

        let dict = err.to_dict();
        assert_eq!(dict["direction"], "download");
    }

    #[test]
    fn test_retry_exhausted_exposes_status() {
        let err = StratusError::RetryExhausted {
            attempts: 3,
            source: Box::new(StratusError::Status {
                code: 503,
                text: "Slow Down".into(),
            }),
        };
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::negative("base_delay");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for base_delay: must not be negative"
        );
    }
}
