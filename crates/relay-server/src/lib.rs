//! WebSocket relay core for a single camera.
//!
//! Receives JPEG frames from one camera connection, whole or in chunks,
//! and fans them out to any number of viewer connections. Commands from
//! viewers or collaborators travel the other way, through a priority queue
//! when no camera is available.

mod connection;
mod engine;
mod fps;
mod handler;
mod jpeg;
mod queue;
mod reassembly;
mod registry;
mod server;
mod stats;
mod sweeper;

pub use connection::{ConnId, SendError, Sender};
pub use engine::{CameraEngine, EngineConfig, FrameHook, FrameHookError, SubmitOutcome};
pub use fps::FpsCounter;
pub use handler::{Handler, HandlerFuture, Role, Session};
pub use jpeg::{Frame, FrameDefect, check_jpeg, is_complete_jpeg};
pub use queue::{CommandQueue, QueuedCommand};
pub use reassembly::{AppendOutcome, ReassemblyError, ReassemblyState, ReassemblyTable};
pub use registry::{CameraSlot, Departed, SessionRegistry};
pub use server::{RelayServer, ServerConfig};
pub use stats::StatsCounters;

/// Per-connection send buffer capacity.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the relay server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
