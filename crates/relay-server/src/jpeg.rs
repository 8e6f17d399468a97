//! JPEG completeness heuristic.
//!
//! A buffer is treated as a complete frame when it is large enough, starts
//! with the SOI marker and carries an EOI marker somewhere in its trailing
//! window. This is not a JPEG parser: corrupt data between the markers
//! passes.

use bytes::Bytes;

use camrelay_protocol::constants::{EOI_SEARCH_WINDOW, MIN_FRAME_SIZE};

/// Start-of-Image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// End-of-Image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Why a buffer was not accepted as a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameDefect {
    #[error("frame too small ({0} bytes)")]
    TooSmall(usize),

    #[error("missing SOI marker")]
    MissingSoi,

    #[error("missing EOI marker")]
    MissingEoi,
}

/// Checks the buffer against the completeness heuristic.
pub fn check_jpeg(buf: &[u8]) -> Result<(), FrameDefect> {
    if buf.len() < MIN_FRAME_SIZE {
        return Err(FrameDefect::TooSmall(buf.len()));
    }
    if buf[..2] != SOI {
        return Err(FrameDefect::MissingSoi);
    }

    let tail = &buf[buf.len().saturating_sub(EOI_SEARCH_WINDOW)..];
    if !tail.windows(2).rev().any(|w| w == EOI) {
        return Err(FrameDefect::MissingEoi);
    }
    Ok(())
}

/// Returns `true` if `buf` looks like one complete JPEG image.
pub fn is_complete_jpeg(buf: &[u8]) -> bool {
    check_jpeg(buf).is_ok()
}

/// A validated, immutable JPEG frame. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    /// Validates `data` and wraps it as a frame.
    pub fn new(data: impl Into<Bytes>) -> Result<Self, FrameDefect> {
        let data = data.into();
        check_jpeg(&data)?;
        Ok(Self(data))
    }

    pub fn bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Builds a synthetic JPEG-shaped buffer of `len` bytes for tests.
#[cfg(test)]
pub(crate) fn fake_jpeg(len: usize) -> Vec<u8> {
    assert!(len >= 4);
    let mut buf = vec![0x42; len];
    buf[..2].copy_from_slice(&SOI);
    buf[len - 2..].copy_from_slice(&EOI);
    buf
}
