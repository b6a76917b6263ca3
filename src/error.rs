//! Error types for the telemetry engine.
//!
//! Delivery failures are split the same way the collector treats them: a
//! [`TransportError`] means the request never produced a usable HTTP exchange,
//! a [`ProtocolError`] means the server answered but not with what we expected.
//! Neither ever reaches a producer call path; the scheduler catches them per
//! record kind and retains that kind's pool.

use thiserror::Error;

use crate::model::RecordKind;

/// The request could not be completed (network, DNS, TLS, timeout).
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed before a response was received
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// Request timed out
    #[error("request timed out")]
    Timeout,

    /// Client could not be built from the configuration
    #[error("client configuration error: {0}")]
    Config(String),
}

/// The server answered, but not successfully or not in the expected shape.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Server returned a non-2xx status code
    #[error("server error ({code}): {message}")]
    Status { code: u16, message: String },

    /// Response body could not be parsed
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Any failure of a single collaborator call.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// All retry attempts exhausted
    #[error("all {attempts} attempts exhausted, last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeliveryError::Transport(TransportError::Timeout)
        } else if err.is_decode() {
            DeliveryError::Protocol(ProtocolError::Malformed(err.to_string()))
        } else if let Some(status) = err.status() {
            DeliveryError::Protocol(ProtocolError::Status {
                code: status.as_u16(),
                message: err.to_string(),
            })
        } else {
            DeliveryError::Transport(TransportError::Request(err.to_string()))
        }
    }
}

/// A pool hit its growth ceiling and started dropping its oldest records.
///
/// This is never returned to callers; it is only reported through tracing and
/// the pool statistics.
#[derive(Debug, Error)]
#[error("{kind} pool reached its ceiling of {ceiling} records, oldest record dropped")]
pub struct CapacityError {
    pub kind: RecordKind,
    pub ceiling: usize,
}

/// A single record could not be serialized.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// Float or double parameter that JSON cannot carry
    #[error("parameter '{name}' holds a non-finite number")]
    NonFinite { name: String },

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Durable state could not be read or written.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored blob exists but does not decode
    #[error("corrupt {what}: {reason}")]
    Corrupt { what: String, reason: String },
}

/// Identity registration did not complete.
///
/// Registration itself never gives up; persistence failures are logged and the
/// in-memory identity is used anyway. Only the host can stop the wait.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The host cancelled the wait; registration resumes on the next launch
    #[error("registration cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_error_display() {
        let err = DeliveryError::from(TransportError::Timeout);
        assert_eq!(err.to_string(), "request timed out");

        let err = DeliveryError::from(ProtocolError::Status {
            code: 503,
            message: "Service Unavailable".to_string(),
        });
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("Service Unavailable"));

        let err = DeliveryError::RetriesExhausted {
            attempts: 4,
            last_error: "connection refused".to_string(),
        };
        assert!(err.to_string().contains('4'));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_capacity_error_display() {
        let err = CapacityError {
            kind: RecordKind::Event,
            ceiling: 500,
        };
        assert_eq!(
            err.to_string(),
            "events pool reached its ceiling of 500 records, oldest record dropped"
        );
    }

    #[test]
    fn test_persistence_error_display() {
        let err = PersistenceError::Corrupt {
            what: "identity".to_string(),
            reason: "eof".to_string(),
        };
        assert_eq!(err.to_string(), "corrupt identity: eof");

        let err: PersistenceError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.to_string().starts_with("io error"));
    }
}
