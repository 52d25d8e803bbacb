//! Wire frame exchanged with connected clients.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::FrameError;

/// Recognised frame types. The set is open: anything else is [`FrameKind::Other`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// Subscribe the sender to `channel`.
    Join,
    /// Fan the frame out to `channel`, or to everyone when `channel` is empty.
    Chat,
    /// Liveness check; answered with a `pong` to the sender only.
    Ping,
    /// Reply to `ping`.
    Pong,
    /// Unrecognised type. Ignored on input.
    Other,
}

impl FrameKind {
    /// Classify a `type` string.
    pub fn parse(kind: &str) -> Self {
        match kind {
            "join" => Self::Join,
            "chat" => Self::Chat,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            _ => Self::Other,
        }
    }
}

/// One JSON message unit.
///
/// `content`, `data` and `timestamp` are opaque and passed through untouched.
/// `from` is always stamped by the server before fan-out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Message type, see [`FrameKind`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Target channel; absent or empty means every registered session.
    #[serde(default, skip_serializing_if = "is_blank")]
    pub channel: Option<String>,
    /// Sender session id.
    #[serde(default, skip_serializing_if = "is_blank")]
    pub from: Option<String>,
    /// Text payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Arbitrary JSON payload. A present `null` is kept as `Some(Value::Null)`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<serde_json::Value>,
    /// Client- or server-supplied timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

#[allow(clippy::ref_option)]
fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(str::is_empty)
}

impl Frame {
    /// Empty frame of the given type.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            channel: None,
            from: None,
            content: None,
            data: None,
            timestamp: None,
        }
    }

    /// `{"type":"pong"}`.
    pub fn pong() -> Self {
        Self::new("pong")
    }

    /// Greeting sent on connect, carrying the server-assigned session id.
    pub fn connected(session_id: &str) -> Self {
        Self {
            from: Some(session_id.to_string()),
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
            ..Self::new("connected")
        }
    }

    /// Set the target channel.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Set the text payload.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Classified type.
    pub fn kind(&self) -> FrameKind {
        FrameKind::parse(&self.kind)
    }

    /// Target channel, treating an empty string as "no channel".
    pub fn target_channel(&self) -> Option<&str> {
        self.channel.as_deref().filter(|c| !c.is_empty())
    }

    /// Parse inbound text.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        serde_json::from_str(text).map_err(FrameError::Decode)
    }

    /// Serialize once for fan-out; the result is shared across recipients.
    pub fn encode(&self) -> Result<Arc<str>, FrameError> {
        serde_json::to_string(self)
            .map(Arc::from)
            .map_err(FrameError::Encode)
    }
}
