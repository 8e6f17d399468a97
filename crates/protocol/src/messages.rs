//! Text message records exchanged with cameras and viewers.
//!
//! Messages are flat JSON objects tagged by a `type` field. Inbound parsing
//! peeks at the tag first and then deserializes the matching record, so an
//! unknown tag is ignored rather than rejected.

use serde::{Deserialize, Serialize};

use crate::constants::MessageType;
use crate::types::Stats;

// ---------------------------------------------------------------------------
// Inbound records
// ---------------------------------------------------------------------------

/// Announces the role of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub device: String,
}

/// Opens a chunked frame transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImgStart {
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub chunks: u32,
}

/// Closes a chunked frame transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImgEnd {
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub success: bool,
}

/// Asks the relay to forward a command to the camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub cmd: String,
    #[serde(default)]
    pub val: serde_json::Value,
}

impl CommandRequest {
    /// Returns the command value as text.
    ///
    /// Strings pass through unchanged, `null` becomes empty, and any other
    /// JSON value is rendered as compact JSON (`5`, `true`, `1.5`).
    pub fn val_text(&self) -> String {
        match &self.val {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A parsed inbound text message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Register(RegisterRequest),
    ImgStart(ImgStart),
    ImgEnd(ImgEnd),
    Command(CommandRequest),
    /// Camera health report, kept verbatim for relaying to viewers.
    Health(serde_json::Value),
    RequestStats,
    /// Recognized JSON with a tag this relay does not handle.
    Ignored(MessageType),
}

#[derive(Deserialize)]
struct TypePeek {
    #[serde(rename = "type")]
    msg_type: Option<MessageType>,
}

/// Errors from inbound message parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid message JSON: {0}")]
    InvalidJson(String),

    #[error("message has no type field")]
    MissingType,

    #[error("invalid {msg_type:?} message: {reason}")]
    InvalidFields {
        msg_type: MessageType,
        reason: String,
    },
}

/// Parses a text WebSocket message into an [`Inbound`] record.
pub fn parse_inbound(text: &str) -> Result<Inbound, ParseError> {
    let peek: TypePeek =
        serde_json::from_str(text).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    let msg_type = peek.msg_type.ok_or(ParseError::MissingType)?;

    let fields = |e: serde_json::Error| ParseError::InvalidFields {
        msg_type,
        reason: e.to_string(),
    };

    let msg = match msg_type {
        MessageType::Register => Inbound::Register(serde_json::from_str(text).map_err(fields)?),
        MessageType::ImgStart => Inbound::ImgStart(serde_json::from_str(text).map_err(fields)?),
        MessageType::ImgEnd => Inbound::ImgEnd(serde_json::from_str(text).map_err(fields)?),
        MessageType::Command => Inbound::Command(serde_json::from_str(text).map_err(fields)?),
        MessageType::Health => Inbound::Health(serde_json::from_str(text).map_err(fields)?),
        MessageType::RequestStats => Inbound::RequestStats,
        other => Inbound::Ignored(other),
    };
    Ok(msg)
}

// ---------------------------------------------------------------------------
// Outbound records
// ---------------------------------------------------------------------------

/// Command forwarded to the camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCommand {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub cmd: String,
    pub val: String,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl CameraCommand {
    pub fn new(cmd: impl Into<String>, val: impl Into<String>, source: Option<String>) -> Self {
        Self {
            msg_type: MessageType::Command,
            cmd: cmd.into(),
            val: val.into(),
            timestamp: unix_timestamp(),
            source,
        }
    }
}

/// Reply to a camera that registered explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub status: String,
    pub message: String,
    pub server_time: String,
}

impl RegisterAck {
    pub fn camera() -> Self {
        Self {
            status: "ok".into(),
            message: "Camera registered".into(),
            server_time: local_iso_timestamp(),
        }
    }
}

/// Acknowledges an `img_start`; the camera may begin sending chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImgAck {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub status: String,
    pub timestamp: f64,
}

impl ImgAck {
    pub fn ready() -> Self {
        Self {
            msg_type: MessageType::ImgAck,
            status: "ready".into(),
            timestamp: unix_timestamp(),
        }
    }
}

/// Camera presence and statistics, pushed to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub camera_connected: bool,
    pub stats: Stats,
}

impl StatusEvent {
    pub fn new(stats: Stats) -> Self {
        Self {
            msg_type: MessageType::Status,
            camera_connected: stats.connected,
            stats,
        }
    }
}

/// Camera health report relayed to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraHealthEvent {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub data: serde_json::Value,
    pub server_time: String,
}

impl CameraHealthEvent {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            msg_type: MessageType::CameraHealth,
            data,
            server_time: local_iso_timestamp(),
        }
    }
}

/// Reply to `request_stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatsEvent {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub data: Stats,
    pub timestamp: f64,
}

impl ServerStatsEvent {
    pub fn new(data: Stats) -> Self {
        Self {
            msg_type: MessageType::ServerStats,
            data,
            timestamp: unix_timestamp(),
        }
    }
}

/// Current UNIX time in fractional seconds.
pub fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Current local time as ISO-8601 with microseconds and no offset.
pub fn local_iso_timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}
