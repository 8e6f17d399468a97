use serde::{Deserialize, Serialize};

/// Point-in-time snapshot of relay statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// Whether a camera connection is currently registered.
    pub connected: bool,
    pub frames_received: u64,
    pub frames_chunked: u64,
    pub frames_failed: u64,
    pub total_bytes: u64,
    pub fps: f64,
    /// ISO-8601 local time of the last accepted frame.
    pub last_frame_time: Option<String>,
    pub camera_ip: Option<String>,
    pub browsers_connected: usize,
    /// UNIX timestamp (seconds) when the relay started.
    pub start_time: f64,
    pub pending_commands: usize,
    /// Seconds since `start_time`.
    pub uptime: f64,
    /// Uptime as `HH:MM:SS`.
    pub uptime_formatted: String,
}

/// Formats a duration in seconds as `HH:MM:SS` (hours may exceed 24).
pub fn format_uptime(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
