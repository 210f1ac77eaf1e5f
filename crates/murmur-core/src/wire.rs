//! JSON frames exchanged over the WebSocket.
//!
//! Client → server: `{"text": "..."}`.
//! Server → client: `{"type":"token","value":"..."}`, `{"type":"done"}` or
//! `{"type":"error","message":"..."}`.

use serde::{Deserialize, Deserializer, Serialize};

/// A user message sent by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRequest {
    /// A missing or null field deserializes as empty text and fails validation.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub text: String,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl InboundRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// True when the text is empty after trimming whitespace.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// One event of the server's response stream.
///
/// Per request the sequence is `Token*` followed by exactly one of `Done` or
/// `Error`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Token { value: String },
    Done,
    Error { message: String },
}

impl OutboundEvent {
    pub fn token(value: impl Into<String>) -> Self {
        Self::Token { value: value.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }

    /// Short tag used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::Done => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
