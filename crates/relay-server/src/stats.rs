//! Process-lifetime relay counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use camrelay_protocol::Stats;
use camrelay_protocol::messages::{local_iso_timestamp, unix_timestamp};
use camrelay_protocol::types::format_uptime;

use crate::fps::FpsCounter;

/// Counters mutated by connection handlers and sweepers.
///
/// Camera presence, viewer count and queue depth live elsewhere and are
/// supplied when a [`Stats`] snapshot is taken.
pub struct StatsCounters {
    frames_received: AtomicU64,
    frames_chunked: AtomicU64,
    frames_failed: AtomicU64,
    total_bytes: AtomicU64,
    last_frame_time: Mutex<Option<String>>,
    fps: FpsCounter,
    start_time: f64,
}

impl Default for StatsCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCounters {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            frames_chunked: AtomicU64::new(0),
            frames_failed: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            last_frame_time: Mutex::new(None),
            fps: FpsCounter::default(),
            start_time: unix_timestamp(),
        }
    }

    /// Records an accepted frame of `len` bytes and returns the new total.
    pub fn record_frame(&self, len: usize) -> u64 {
        self.total_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.fps.tick();
        *self
            .last_frame_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(local_iso_timestamp());
        self.frames_received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_chunked(&self) {
        self.frames_chunked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.frames_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn frames_failed(&self) -> u64 {
        self.frames_failed.load(Ordering::Relaxed)
    }

    pub fn fps(&self) -> f64 {
        self.fps.current()
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Builds a snapshot, combining the counters with registry state.
    pub fn snapshot(
        &self,
        camera_ip: Option<String>,
        browsers_connected: usize,
        pending_commands: usize,
    ) -> Stats {
        let uptime = (unix_timestamp() - self.start_time).max(0.0);
        Stats {
            connected: camera_ip.is_some(),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_chunked: self.frames_chunked.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            fps: self.fps.current(),
            last_frame_time: self
                .last_frame_time
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            camera_ip,
            browsers_connected,
            start_time: self.start_time,
            pending_commands,
            uptime,
            uptime_formatted: format_uptime(uptime),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_feed_snapshot() {
        let stats = StatsCounters::new();
        assert_eq!(stats.record_frame(1000), 1);
        assert_eq!(stats.record_frame(500), 2);
        stats.record_chunked();
        stats.record_failed();
        stats.record_failed();

        let snap = stats.snapshot(Some("10.0.0.7".into()), 3, 4);
        assert!(snap.connected);
        assert_eq!(snap.frames_received, 2);
        assert_eq!(snap.frames_chunked, 1);
        assert_eq!(snap.frames_failed, 2);
        assert_eq!(snap.total_bytes, 1500);
        assert_eq!(snap.fps, 2.0);
        assert!(snap.last_frame_time.is_some());
        assert_eq!(snap.camera_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(snap.browsers_connected, 3);
        assert_eq!(snap.pending_commands, 4);
        assert!(snap.uptime >= 0.0);
    }

    #[tokio::test]
    async fn empty_snapshot() {
        let snap = StatsCounters::new().snapshot(None, 0, 0);
        assert!(!snap.connected);
        assert!(snap.last_frame_time.is_none());
        assert_eq!(snap.fps, 0.0);
        assert!(snap.start_time > 0.0);
    }
}
