//! Change records and the streaming wire format.
//!
//! Every frame on the stream is one JSON text message:
//! ```text
//! { "event": "update", "id": 42, "data": { ...entity identity + new state... } }
//! ```
//!
//! `id` is the resumption cursor. Clients replay the last id they processed
//! verbatim as `?since=<id>` when they reconnect.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;
use thiserror::Error;

/// Kind of a change record stored in the update log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Create,
    Update,
    Delete,
    /// Keep-alive record; advances cursors, never dispatched
    Heartbeat,
    /// A user account appeared; consumers refresh their roster
    UserCreated,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Heartbeat => "heartbeat",
            Self::UserCreated => "user_created",
        }
    }
}

/// An immutable entry of the update log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// Strictly increasing, assigned at append time
    pub id: u64,
    pub kind: UpdateKind,
    /// Opaque domain data supplied by the entity store
    pub payload: Value,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
}

impl UpdateRecord {
    pub fn new(id: u64, kind: UpdateKind, payload: Value) -> Self {
        Self {
            id,
            kind,
            payload,
            created_at: now_millis(),
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Named event carried by a stream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameEvent {
    Create,
    Update,
    Delete,
    Heartbeat,
    /// Server asks the client to re-establish the connection now
    Reconnect,
    UserCreated,
    /// Server is dropping the connection because the client fell behind
    Timeout,
}

impl From<UpdateKind> for FrameEvent {
    fn from(kind: UpdateKind) -> Self {
        match kind {
            UpdateKind::Create => Self::Create,
            UpdateKind::Update => Self::Update,
            UpdateKind::Delete => Self::Delete,
            UpdateKind::Heartbeat => Self::Heartbeat,
            UpdateKind::UserCreated => Self::UserCreated,
        }
    }
}

impl FrameEvent {
    /// The log record kind behind this event, `None` for control directives.
    pub fn record_kind(&self) -> Option<UpdateKind> {
        match self {
            Self::Create => Some(UpdateKind::Create),
            Self::Update => Some(UpdateKind::Update),
            Self::Delete => Some(UpdateKind::Delete),
            Self::Heartbeat => Some(UpdateKind::Heartbeat),
            Self::UserCreated => Some(UpdateKind::UserCreated),
            Self::Reconnect | Self::Timeout => None,
        }
    }
}

/// One frame of the push stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: FrameEvent,
    pub id: u64,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn from_record(record: &UpdateRecord) -> Self {
        Self {
            event: record.kind.into(),
            id: record.id,
            data: record.payload.clone(),
        }
    }

    /// Reconnect directive. `cursor` is the last id delivered on this connection.
    pub fn reconnect(cursor: u64) -> Self {
        Self {
            event: FrameEvent::Reconnect,
            id: cursor,
            data: Value::Null,
        }
    }

    /// Slow-consumer notice sent just before the server closes the connection.
    pub fn timeout(cursor: u64) -> Self {
        Self {
            event: FrameEvent::Timeout,
            id: cursor,
            data: Value::Null,
        }
    }

    /// Serialize to a JSON text message.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse a JSON text message.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Wire protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Frame encode error: {0}")]
    Encode(String),
    #[error("Frame decode error: {0}")]
    Decode(String),
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Extract the `since` cursor from an upgrade request URI such as
/// `/stream?since=42`. A missing or empty parameter means "latest".
pub fn parse_since(query: Option<&str>) -> Result<Option<u64>, ProtocolError> {
    let Some(query) = query else {
        return Ok(None);
    };
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some("since") {
            let value = parts.next().unwrap_or("");
            if value.is_empty() || value == "latest" {
                return Ok(None);
            }
            return value
                .parse::<u64>()
                .map(Some)
                .map_err(|_| ProtocolError::InvalidFrame(format!("bad since value {value:?}")));
        }
    }
    Ok(None)
}
