use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default WebSocket port for camera and viewer connections.
pub const WS_PORT: u16 = 6972;

/// Maximum frame (and WebSocket message) size in bytes (5 MB).
pub const MAX_FRAME_SIZE: usize = 5 * 1024 * 1024;

/// How often the server pings each connection.
pub const WS_PING_INTERVAL: Duration = Duration::from_secs(20);

/// How long a ping may go unanswered before the connection is dropped.
pub const WS_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for a chunked transfer to complete.
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(10);

/// How often stale chunked transfers are swept.
pub const CHUNK_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// How often the command queue is drained towards the camera.
pub const QUEUE_DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// Minimum size of a frame accepted as a complete JPEG.
pub const MIN_FRAME_SIZE: usize = 100;

/// How many trailing bytes are searched for the JPEG EOI marker.
pub const EOI_SEARCH_WINDOW: usize = 100;

/// Device name a camera registers with.
pub const DEVICE_CAMERA: &str = "camera";

/// Device name a viewer registers with.
pub const DEVICE_BROWSER: &str = "browser";

/// Message type tag carried in the `type` field of every text message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Inbound from camera or viewer
    #[serde(rename = "register")]
    Register,
    #[serde(rename = "img_start")]
    ImgStart,
    #[serde(rename = "img_end")]
    ImgEnd,
    #[serde(rename = "command")]
    Command,
    #[serde(rename = "health")]
    Health,
    #[serde(rename = "request_stats")]
    RequestStats,

    // Outbound to camera or viewers
    #[serde(rename = "img_ack")]
    ImgAck,
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "camera_health")]
    CameraHealth,
    #[serde(rename = "server_stats")]
    ServerStats,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_serialization() {
        assert_eq!(
            serde_json::to_string(&MessageType::ImgStart).unwrap(),
            "\"img_start\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::RequestStats).unwrap(),
            "\"request_stats\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::CameraHealth).unwrap(),
            "\"camera_health\""
        );
    }

    #[test]
    fn message_type_deserialization() {
        let mt: MessageType = serde_json::from_str("\"img_end\"").unwrap();
        assert_eq!(mt, MessageType::ImgEnd);
    }

    #[test]
    fn unknown_message_type() {
        let mt: MessageType = serde_json::from_str("\"firmware_update\"").unwrap();
        assert_eq!(mt, MessageType::Unknown);
    }
}
