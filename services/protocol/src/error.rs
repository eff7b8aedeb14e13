//! Errors raised while parsing or validating protocol messages.

use thiserror::Error;

/// Protocol violations detected at the wire boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown classification label: {0}")]
    UnknownLabel(String),

    #[error("Malformed request body: {0}")]
    MalformedRequest(String),

    #[error("Invalid trigger value: {0}")]
    InvalidTriggerValue(i64),

    #[error("Missing trigger value")]
    MissingTriggerValue,
}
