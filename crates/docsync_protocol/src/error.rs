//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while building or parsing protocol messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A revision ID did not have the `<generation>-<digest>` shape.
    #[error("invalid revision id: {0:?}")]
    InvalidRevId(String),

    /// A JSON payload could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A JSON payload had the wrong structure.
    #[error("invalid structure: {0}")]
    InvalidStructure(String),

    /// A multipart body could not be framed or split.
    #[error("multipart error: {0}")]
    Multipart(String),
}

impl ProtocolError {
    /// Creates an invalid-structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::InvalidRevId("abc".into());
        assert_eq!(err.to_string(), "invalid revision id: \"abc\"");

        let err = ProtocolError::invalid_structure("expected object");
        assert!(err.to_string().contains("expected object"));
    }
}
