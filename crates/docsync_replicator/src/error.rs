//! Error types for the replication engine.

use crate::transport::{HttpResponse, TransportError};
use docsync_protocol::{parse_auth_header, ProtocolError, RevId};
use std::collections::BTreeMap;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur during replication.
///
/// Errors are `Clone` so they can be carried in lifecycle events and in the
/// replication status.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicationError {
    /// Connection failure, timeout, or a retryable HTTP status.
    #[error("transient network error: {message}")]
    Transient {
        /// HTTP status, when the failure was a response.
        status: Option<u16>,
        /// Error message.
        message: String,
    },

    /// The peer answered with a non-retryable HTTP status.
    #[error("protocol error (HTTP {status}): {message}")]
    Protocol {
        /// HTTP status.
        status: u16,
        /// Error message.
        message: String,
    },

    /// A checkpoint write lost a race with another writer.
    #[error("checkpoint {checkpoint_id} was updated concurrently")]
    CheckpointConflict {
        /// Checkpoint document ID.
        checkpoint_id: String,
    },

    /// Validation or filtering refused a document.
    #[error("document {doc_id} rejected: {reason}")]
    DocumentRejected {
        /// Document ID.
        doc_id: String,
        /// Rejection reason.
        reason: String,
    },

    /// The peer does not have a requested revision.
    #[error("document {doc_id} is missing on the peer")]
    DocumentMissingOnPeer {
        /// Document ID.
        doc_id: String,
        /// Requested revision, if known.
        rev: Option<RevId>,
    },

    /// Credentials were refused.
    #[error("authentication failed (HTTP {status:?}): {message}")]
    Authentication {
        /// HTTP status, usually 401 or 403.
        status: Option<u16>,
        /// Error message.
        message: String,
        /// Parsed `WWW-Authenticate` challenge, if the server sent one.
        challenge: Option<BTreeMap<String, String>>,
    },

    /// The local store failed in a way that leaves its state unknown.
    #[error("local storage error: {0}")]
    LocalStorage(String),

    /// A response could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The configuration asks for something the engine does not do.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The operation was cancelled by `stop()`.
    #[error("replication cancelled")]
    Cancelled,

    /// A lifecycle transition was rejected.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl ReplicationError {
    /// Creates a transient error that did not come from an HTTP response.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            status: None,
            message: message.into(),
        }
    }

    /// Classifies an HTTP status.
    ///
    /// 5xx, 408 and 429 are transient; 401 and 403 are authentication
    /// failures; every other status is a permanent protocol error.
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let message = error_message(status, body);
        match status {
            401 | 403 => Self::Authentication {
                status: Some(status),
                message,
                challenge: None,
            },
            408 | 429 | 500..=599 => Self::Transient {
                status: Some(status),
                message,
            },
            _ => Self::Protocol { status, message },
        }
    }

    /// Classifies a non-success response, attaching any auth challenge.
    pub fn from_response(response: &HttpResponse) -> Self {
        let mut error = Self::from_status(response.status, &response.body);
        if let Self::Authentication { challenge, .. } = &mut error {
            *challenge = parse_auth_header(response.header("WWW-Authenticate"));
        }
        error
    }

    /// Returns true if the operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns true if the error halts a replication unconditionally.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::LocalStorage(_))
    }

    /// Returns true if the error concerns a single document only.
    pub fn is_document_level(&self) -> bool {
        matches!(
            self,
            Self::DocumentRejected { .. } | Self::DocumentMissingOnPeer { .. }
        )
    }

    /// Returns the HTTP status associated with the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transient { status, .. } | Self::Authentication { status, .. } => *status,
            Self::Protocol { status, .. } => Some(*status),
            Self::CheckpointConflict { .. } => Some(409),
            Self::DocumentMissingOnPeer { .. } => Some(404),
            _ => None,
        }
    }
}

/// Picks a readable message out of a CouchDB-style error body.
fn error_message(status: u16, body: &[u8]) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_slice(body).ok();
    let field = |name: &str| {
        parsed
            .as_ref()
            .and_then(|value| value.get(name))
            .and_then(|value| value.as_str())
            .map(str::to_string)
    };
    field("reason")
        .or_else(|| field("error"))
        .unwrap_or_else(|| format!("HTTP status {status}"))
}

impl From<TransportError> for ReplicationError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Io(message) => Self::transient(message),
            TransportError::Timeout => Self::transient("request timed out"),
            TransportError::Other(message) => Self::Protocol { status: 0, message },
        }
    }
}

impl From<ProtocolError> for ReplicationError {
    fn from(error: ProtocolError) -> Self {
        Self::Codec(error.to_string())
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(error: serde_json::Error) -> Self {
        Self::Codec(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(ReplicationError::from_status(503, b"").is_retryable());
        assert!(ReplicationError::from_status(500, b"").is_retryable());
        assert!(ReplicationError::from_status(429, b"").is_retryable());
        assert!(ReplicationError::from_status(408, b"").is_retryable());
        assert!(!ReplicationError::from_status(400, b"").is_retryable());
        assert!(!ReplicationError::from_status(404, b"").is_retryable());
        assert!(matches!(
            ReplicationError::from_status(401, b""),
            ReplicationError::Authentication { .. }
        ));
        assert!(ReplicationError::from_status(403, b"").is_terminal());
    }

    #[test]
    fn transport_errors() {
        assert!(ReplicationError::from(TransportError::Io("reset".into())).is_retryable());
        assert!(ReplicationError::from(TransportError::Timeout).is_retryable());
        assert!(!ReplicationError::from(TransportError::Other("bad url".into())).is_retryable());
    }

    #[test]
    fn message_from_body() {
        let err = ReplicationError::from_status(404, br#"{"error":"not_found","reason":"missing"}"#);
        assert_eq!(err.to_string(), "protocol error (HTTP 404): missing");
        let err = ReplicationError::from_status(412, b"garbage");
        assert!(err.to_string().contains("HTTP status 412"));
    }

    #[test]
    fn challenge_attached_from_response() {
        let response = HttpResponse::new(401)
            .with_header("WWW-Authenticate", "Basic realm=Couchbase");
        match ReplicationError::from_response(&response) {
            ReplicationError::Authentication {
                challenge: Some(challenge),
                ..
            } => assert_eq!(challenge["realm"], "Couchbase"),
            other => unreachable!("unexpected {other:?}"),
        }
    }

    #[test]
    fn terminal_and_document_level() {
        assert!(ReplicationError::LocalStorage("disk".into()).is_terminal());
        assert!(!ReplicationError::transient("x").is_terminal());
        let missing = ReplicationError::DocumentMissingOnPeer {
            doc_id: "d".into(),
            rev: None,
        };
        assert!(missing.is_document_level());
        assert_eq!(missing.status(), Some(404));
    }

    #[test]
    fn codec_errors_are_permanent() {
        let err: ReplicationError = serde_json::from_slice::<serde_json::Value>(b"{")
            .unwrap_err()
            .into();
        assert!(!err.is_retryable());
        assert!(matches!(err, ReplicationError::Codec(_)));
    }
}
