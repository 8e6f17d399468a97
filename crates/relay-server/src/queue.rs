//! Priority-ordered holding area for camera commands.
//!
//! Commands wait here when no camera is connected or a direct send failed.
//! Dequeue order is priority ascending, then arrival order.

use std::collections::BTreeMap;

use camrelay_protocol::Priority;
use camrelay_protocol::messages::CameraCommand;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// A command waiting for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub command: CameraCommand,
}

impl QueuedCommand {
    pub fn cmd(&self) -> &str {
        &self.command.cmd
    }

    pub fn val(&self) -> &str {
        &self.command.val
    }
}

#[derive(Default)]
struct QueueInner {
    /// Keyed by `(priority, arrival sequence)`.
    entries: BTreeMap<(Priority, u64), QueuedCommand>,
    next_seq: u64,
}

/// Thread-safe command priority queue. No duplicate suppression.
#[derive(Default)]
pub struct CommandQueue {
    inner: Mutex<QueueInner>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `command` in priority order.
    pub async fn enqueue(&self, command: CameraCommand, priority: Priority) {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        if priority == Priority::Critical {
            tracing::warn!(cmd = %command.cmd, "CRITICAL command queued");
        }

        inner.entries.insert(
            (priority, seq),
            QueuedCommand {
                priority,
                enqueued_at: Instant::now(),
                command,
            },
        );
    }

    /// Removes and returns the highest-priority, oldest command.
    pub async fn dequeue(&self) -> Option<QueuedCommand> {
        self.inner
            .lock()
            .await
            .entries
            .pop_first()
            .map(|(_, cmd)| cmd)
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.size().await == 0
    }

    /// Drops every queued command and returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let n = inner.entries.len();
        inner.entries.clear();
        n
    }
}
