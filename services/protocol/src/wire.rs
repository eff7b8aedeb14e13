//! Request and reply messages exchanged between the edge and the server.

use crate::error::ProtocolError;
use crate::label::{ActuationCommand, BinIndex, Label};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only trigger value the current protocol accepts.
pub const TRIGGER_VALUE: i64 = 1;

/// Message returned with every rejected trigger request.
pub const INVALID_VALUE_MESSAGE: &str = "Invalid value. Send {'value': 1} to run the code.";

/// Trigger request sent by the edge node when an item is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRequest {
    pub value: i64,
}

impl ClassificationRequest {
    /// The request the edge sends for every presence event.
    pub fn trigger() -> Self {
        Self {
            value: TRIGGER_VALUE,
        }
    }

    /// Parse a raw request body.
    ///
    /// Parsing is lenient about the JSON shape so that a missing or
    /// non-integer `value` surfaces as a [`ProtocolError`] the server can turn
    /// into a structured rejection, instead of an extractor failure.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let raw: Value = serde_json::from_slice(body)
            .map_err(|e| ProtocolError::MalformedRequest(e.to_string()))?;

        match raw.get("value") {
            None | Some(Value::Null) => Err(ProtocolError::MissingTriggerValue),
            Some(v) => v
                .as_i64()
                .map(|value| Self { value })
                .ok_or_else(|| {
                    ProtocolError::MalformedRequest(format!("value must be an integer, got {}", v))
                }),
        }
    }

    /// Check that this request asks for a classification run.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.value == TRIGGER_VALUE {
            Ok(())
        } else {
            Err(ProtocolError::InvalidTriggerValue(self.value))
        }
    }
}

/// Structured error body, `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Tokens the edge node knows how to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTable {
    entries: Vec<(String, BinIndex)>,
}

impl TokenTable {
    /// Table recognizing only the given labels.
    pub fn new(labels: &[Label]) -> Self {
        let mut entries: Vec<(String, BinIndex)> = labels
            .iter()
            .map(|label| (label.token(), label.bin_index()))
            .collect();
        entries.sort();
        entries.dedup();
        Self { entries }
    }

    /// Table recognizing every label.
    pub fn full() -> Self {
        Self::new(&Label::ALL)
    }

    /// Bin for a token, if the token is wired.
    pub fn lookup(&self, token: &str) -> Option<BinIndex> {
        self.entries
            .iter()
            .find(|(t, _)| t == token)
            .map(|(_, bin)| *bin)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A server reply, decoded at the edge boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A token the edge is wired to actuate.
    Recognized(ActuationCommand),
    /// The server reported a failure.
    Error(String),
    /// A success reply carrying a token the edge does not act on.
    Unknown(String),
}

impl Reply {
    /// Decode a raw HTTP reply.
    ///
    /// Success bodies are the bare token. A `{"message": "<token>"}` envelope
    /// is also accepted so older servers keep working.
    pub fn decode(status: u16, body: &str, table: &TokenTable) -> Reply {
        let body = body.trim();

        if !(200..300).contains(&status) {
            return match serde_json::from_str::<ErrorBody>(body) {
                Ok(err) => Reply::Error(err.error),
                Err(_) => Reply::Error(format!("status {}: {}", status, body)),
            };
        }

        let token = match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => match map.get("message").and_then(Value::as_str) {
                Some(message) => message.to_string(),
                None => body.to_string(),
            },
            _ => body.to_string(),
        };

        match table.lookup(&token) {
            Some(bin_index) => Reply::Recognized(ActuationCommand { bin_index }),
            None => Reply::Unknown(token),
        }
    }
}
