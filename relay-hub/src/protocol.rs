//! Payload model and wire encodings.
//!
//! The relay never interprets what clients send. A [`Payload`] is either a
//! text frame or a binary frame and is passed through untouched.
//!
//! Two encodings live here:
//! ```text
//! durable log line:  [<unix-epoch-millis>] <payload-as-text>
//! history replay:    ["text", {"type":"Buffer","data":[1,2,3]}, ...]
//! ```
//! The replay is a single text frame holding a JSON array of the last H
//! payloads, oldest first.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("failed to encode history replay: {0}")]
    ReplayEncoding(#[from] serde_json::Error),
}

/// An opaque message relayed between clients.
///
/// Cloning is cheap: each peer in a fan-out gets a reference-counted handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(Arc<str>),
    Binary(Arc<[u8]>),
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Payload::Text(Arc::from(text.into()))
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Payload::Binary(Arc::from(bytes.into()))
    }

    /// Convert an inbound WebSocket frame. Control frames yield `None`.
    pub fn from_ws(msg: &Message) -> Option<Self> {
        match msg {
            Message::Text(text) => Some(Payload::Text(Arc::from(text.as_str()))),
            Message::Binary(bytes) => Some(Payload::Binary(Arc::from(&bytes[..]))),
            _ => None,
        }
    }

    /// Frame for the outbound side of a WebSocket session.
    pub fn to_ws(&self) -> Message {
        match self {
            Payload::Text(text) => Message::text(text.to_string()),
            Payload::Binary(bytes) => Message::binary(bytes.to_vec()),
        }
    }

    /// Text form written to the durable log. Binary is rendered lossily.
    pub fn as_log_text(&self) -> Cow<'_, str> {
        match self {
            Payload::Text(text) => Cow::Borrowed(text),
            Payload::Binary(bytes) => String::from_utf8_lossy(bytes),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Payload::Text(text) => serializer.serialize_str(text),
            Payload::Binary(bytes) => {
                let mut state = serializer.serialize_struct("Buffer", 2)?;
                state.serialize_field("type", "Buffer")?;
                state.serialize_field("data", &bytes[..])?;
                state.end()
            }
        }
    }
}

/// Encode a history window as the single replay frame sent on join.
pub fn encode_replay(entries: &[Payload]) -> Result<Payload, ProtocolError> {
    let json = serde_json::to_string(entries)?;
    Ok(Payload::text(json))
}

/// Format one durable-log line (without the trailing newline).
pub fn log_line(payload: &Payload, timestamp_ms: u64) -> String {
    format!("[{timestamp_ms}] {}", payload.as_log_text())
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
