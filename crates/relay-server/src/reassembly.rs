//! Per-connection reassembly of chunked frame transfers.
//!
//! A transfer is opened by `img_start`, fed by binary chunks and closed by
//! reaching the declared size, an explicit abort, a superseding `img_start`,
//! disconnect, or the expiry sweep.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::connection::ConnId;

/// In-progress chunked transfer for one connection.
#[derive(Debug)]
pub struct ReassemblyState {
    expected_size: u64,
    expected_chunks: u32,
    buffer: Vec<u8>,
    bytes_received: u64,
    chunks_received: u32,
    started_at: Instant,
}

impl ReassemblyState {
    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    pub fn expected_chunks(&self) -> u32 {
        self.expected_chunks
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn chunks_received(&self) -> u32 {
        self.chunks_received
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    fn is_complete(&self) -> bool {
        self.bytes_received >= self.expected_size
    }
}

/// Result of feeding a chunk into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// More bytes are needed.
    Pending { received: u64, expected: u64 },
    /// The declared size has been reached; call [`ReassemblyTable::take_completed`].
    Complete,
    /// No transfer is open for this connection.
    NoTransfer,
}

/// Errors from opening a transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("invalid transfer: size={size} chunks={chunks}")]
    InvalidTransfer { size: u64, chunks: u32 },
}

/// Reassembly state keyed by connection id. At most one transfer per id.
#[derive(Debug, Default)]
pub struct ReassemblyTable {
    states: HashMap<ConnId, ReassemblyState>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a transfer, discarding any transfer already open for `id`.
    ///
    /// Returns `true` if an existing transfer was discarded.
    pub fn begin(&mut self, id: &ConnId, size: u64, chunks: u32) -> Result<bool, ReassemblyError> {
        if size == 0 || chunks == 0 {
            return Err(ReassemblyError::InvalidTransfer { size, chunks });
        }

        let state = ReassemblyState {
            expected_size: size,
            expected_chunks: chunks,
            buffer: Vec::new(),
            bytes_received: 0,
            chunks_received: 0,
            started_at: Instant::now(),
        };

        let replaced = self.states.insert(id.clone(), state);
        if let Some(old) = &replaced {
            tracing::warn!(
                conn_id = %id,
                received = old.bytes_received,
                expected = old.expected_size,
                "discarding unfinished transfer superseded by img_start"
            );
        }
        Ok(replaced.is_some())
    }

    /// Appends a chunk to the open transfer for `id`.
    ///
    /// The buffer never grows beyond the declared size; surplus bytes of the
    /// final chunk are counted but dropped.
    pub fn append(&mut self, id: &ConnId, chunk: &[u8]) -> AppendOutcome {
        let Some(state) = self.states.get_mut(id) else {
            return AppendOutcome::NoTransfer;
        };

        let room = (state.expected_size as usize).saturating_sub(state.buffer.len());
        let keep = chunk.len().min(room);
        state.buffer.extend_from_slice(&chunk[..keep]);
        state.bytes_received += chunk.len() as u64;
        state.chunks_received += 1;

        if state.is_complete() {
            AppendOutcome::Complete
        } else {
            AppendOutcome::Pending {
                received: state.bytes_received,
                expected: state.expected_size,
            }
        }
    }

    /// Removes a completed transfer and returns exactly `expected_size` bytes.
    ///
    /// Returns `None` (and keeps the state) if the transfer is missing or not
    /// yet complete.
    pub fn take_completed(&mut self, id: &ConnId) -> Option<Vec<u8>> {
        if !self.states.get(id)?.is_complete() {
            return None;
        }
        let mut state = self.states.remove(id)?;
        state.buffer.truncate(state.expected_size as usize);
        Some(state.buffer)
    }

    /// Drops the transfer for `id` without producing a frame.
    ///
    /// Returns `true` if a transfer was open.
    pub fn abort(&mut self, id: &ConnId) -> bool {
        self.states.remove(id).is_some()
    }

    /// Removes every transfer started more than `timeout` ago and returns
    /// them with their connection ids.
    pub fn expire_stale(&mut self, timeout: Duration) -> Vec<(ConnId, ReassemblyState)> {
        let now = Instant::now();
        let stale: Vec<ConnId> = self
            .states
            .iter()
            .filter(|(_, s)| now.duration_since(s.started_at) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.states.remove(&id).map(|state| (id, state)))
            .collect()
    }

    pub fn contains(&self, id: &ConnId) -> bool {
        self.states.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ConnId {
        ConnId::from(s)
    }

    #[test]
    fn begin_rejects_zero_size_or_chunks() {
        let mut table = ReassemblyTable::new();
        assert!(table.begin(&id("a"), 0, 3).is_err());
        assert!(table.begin(&id("a"), 100, 0).is_err());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn chunks_summing_to_size_complete() {
        let mut table = ReassemblyTable::new();
        let conn = id("10.0.0.2:5000");
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        assert_eq!(table.begin(&conn, 1000, 3), Ok(false));
        assert_eq!(
            table.append(&conn, &data[..400]),
            AppendOutcome::Pending {
                received: 400,
                expected: 1000
            }
        );
        assert!(table.take_completed(&conn).is_none());
        assert_eq!(
            table.append(&conn, &data[400..800]),
            AppendOutcome::Pending {
                received: 800,
                expected: 1000
            }
        );
        assert_eq!(table.append(&conn, &data[800..]), AppendOutcome::Complete);

        let out = table.take_completed(&conn).unwrap();
        assert_eq!(out, data);
        assert!(!table.contains(&conn));
    }

    #[tokio::test]
    async fn surplus_bytes_are_truncated() {
        let mut table = ReassemblyTable::new();
        let conn = id("c");
        table.begin(&conn, 10, 2).unwrap();
        table.append(&conn, &[1; 6]);
        assert_eq!(table.append(&conn, &[2; 8]), AppendOutcome::Complete);

        let out = table.take_completed(&conn).unwrap();
        assert_eq!(out.len(), 10);
        assert_eq!(&out[6..], &[2; 4]);
    }

    #[test]
    fn append_without_transfer() {
        let mut table = ReassemblyTable::new();
        assert_eq!(table.append(&id("x"), b"data"), AppendOutcome::NoTransfer);
    }

    #[tokio::test]
    async fn superseding_begin_discards_previous() {
        let mut table = ReassemblyTable::new();
        let conn = id("c");
        table.begin(&conn, 100, 2).unwrap();
        table.append(&conn, &[7; 50]);

        assert_eq!(table.begin(&conn, 20, 1), Ok(true));
        assert_eq!(table.len(), 1);
        assert_eq!(table.append(&conn, &[9; 20]), AppendOutcome::Complete);
        assert_eq!(table.take_completed(&conn).unwrap(), vec![9; 20]);
    }

    #[tokio::test]
    async fn abort_removes_state() {
        let mut table = ReassemblyTable::new();
        let conn = id("c");
        table.begin(&conn, 100, 2).unwrap();
        assert!(table.abort(&conn));
        assert!(!table.abort(&conn));
        assert_eq!(table.append(&conn, &[1; 10]), AppendOutcome::NoTransfer);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_transfer_expires_and_restart_is_clean() {
        let mut table = ReassemblyTable::new();
        let stale = id("stale");
        let fresh = id("fresh");
        let timeout = Duration::from_secs(10);

        table.begin(&stale, 1000, 4).unwrap();
        table.append(&stale, &[1; 300]);

        tokio::time::advance(Duration::from_secs(8)).await;
        table.begin(&fresh, 1000, 4).unwrap();
        assert!(table.expire_stale(timeout).is_empty());

        tokio::time::advance(Duration::from_secs(3)).await;
        let expired = table.expire_stale(timeout);
        assert_eq!(expired.len(), 1);
        let (expired_id, state) = &expired[0];
        assert_eq!(expired_id, &stale);
        assert_eq!(state.bytes_received(), 300);
        assert_eq!(state.chunks_received(), 1);
        assert_eq!(state.expected_chunks(), 4);
        assert_eq!(state.started_at().elapsed(), Duration::from_secs(11));
        assert!(!table.contains(&stale));
        assert!(table.contains(&fresh));

        table.begin(&stale, 50, 1).unwrap();
        assert_eq!(table.append(&stale, &[5; 50]), AppendOutcome::Complete);
        assert_eq!(table.take_completed(&stale).unwrap(), vec![5; 50]);
    }
}
