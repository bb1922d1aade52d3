//! Error types for plan decoding.

use thiserror::Error;

/// Errors that can occur when encoding or decoding plan protocol messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// The peer closed the stream before a complete message arrived.
    #[error("connection closed before a complete message was received")]
    ConnectionClosed,

    /// A message arrived that is valid JSON but not the one expected.
    #[error("unexpected message: expected '{expected}', got '{actual}'")]
    UnexpectedMessage {
        expected: &'static str,
        actual: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PlanError {
    fn from(err: serde_json::Error) -> Self {
        PlanError::Serialization(err.to_string())
    }
}
