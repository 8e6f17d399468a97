//! The camera relay engine.
//!
//! [`CameraEngine`] owns the session registry, reassembly table, command
//! queue and statistics, implements [`Handler`] for every connection and
//! runs the background sweepers. Collaborators submit commands and read
//! snapshots through it.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use camrelay_protocol::constants::{
    CHUNK_CLEANUP_INTERVAL, CHUNK_TIMEOUT, DEVICE_BROWSER, DEVICE_CAMERA,
    MAX_FRAME_SIZE, QUEUE_DRAIN_INTERVAL,
};
use camrelay_protocol::messages::{
    CameraCommand, CameraHealthEvent, ImgAck, ImgEnd, ImgStart, Inbound, RegisterAck,
    ServerStatsEvent, StatusEvent, parse_inbound,
};
use camrelay_protocol::{CommandTable, Priority, Stats};

use crate::ServerError;
use crate::connection::ConnId;
use crate::handler::{Handler, HandlerFuture, Role, Session};
use crate::jpeg::Frame;
use crate::queue::CommandQueue;
use crate::reassembly::{AppendOutcome, ReassemblyTable};
use crate::registry::{Departed, SessionRegistry};
use crate::server::{RelayServer, ServerConfig};
use crate::stats::StatsCounters;
use crate::sweeper;

/// An accepted frame is summarized in the log every this many frames.
const FRAME_LOG_EVERY: u64 = 50;

/// Error type returned by frame hooks.
pub type FrameHookError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked once per accepted frame.
pub type FrameHook = Box<dyn Fn(&Frame) -> Result<(), FrameHookError> + Send + Sync>;

/// Engine limits and timings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Largest frame a chunked transfer may declare.
    pub max_frame_size: usize,
    /// Age after which an unfinished transfer is discarded.
    pub chunk_timeout: Duration,
    pub chunk_sweep_interval: Duration,
    pub queue_drain_interval: Duration,
    pub commands: CommandTable,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            chunk_timeout: CHUNK_TIMEOUT,
            chunk_sweep_interval: CHUNK_CLEANUP_INTERVAL,
            queue_drain_interval: QUEUE_DRAIN_INTERVAL,
            commands: CommandTable::default(),
        }
    }
}

/// How a submitted command was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Written to the camera connection's send buffer.
    Sent,
    /// Held in the command queue until a camera can take it.
    Enqueued,
}

/// Single-camera relay: frames in from the camera, out to viewers;
/// commands the other way.
pub struct CameraEngine {
    config: EngineConfig,
    registry: SessionRegistry,
    queue: CommandQueue,
    transfers: Mutex<ReassemblyTable>,
    stats: StatsCounters,
    hooks: RwLock<Vec<FrameHook>>,
    cancel: CancellationToken,
}

impl CameraEngine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: SessionRegistry::new(),
            queue: CommandQueue::new(),
            transfers: Mutex::new(ReassemblyTable::new()),
            stats: StatsCounters::new(),
            hooks: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Binds the configured port and runs the listener and both sweepers
    /// until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>, config: ServerConfig) -> Result<(), ServerError> {
        let cancel = self.cancel.child_token();
        let server = RelayServer::new(config, Arc::clone(self), cancel.clone());
        self.with_sweepers(cancel, server.run()).await
    }

    /// Like [`run`](Self::run) but on an already bound listener.
    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        config: ServerConfig,
    ) -> Result<(), ServerError> {
        let cancel = self.cancel.child_token();
        let server = RelayServer::new(config, Arc::clone(self), cancel.clone());
        self.with_sweepers(cancel, server.serve(listener)).await
    }

    async fn with_sweepers<F>(
        self: &Arc<Self>,
        cancel: CancellationToken,
        server: F,
    ) -> Result<(), ServerError>
    where
        F: Future<Output = Result<(), ServerError>>,
    {
        let sweepers = [
            tokio::spawn(sweeper::chunk_sweeper(
                Arc::clone(self),
                self.config.chunk_sweep_interval,
                cancel.clone(),
            )),
            tokio::spawn(sweeper::queue_drainer(
                Arc::clone(self),
                self.config.queue_drain_interval,
                cancel.clone(),
            )),
        ];

        let result = server.await;
        cancel.cancel();
        for handle in sweepers {
            let _ = handle.await;
        }
        result
    }

    /// Stops the listener, every connection and both sweepers.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Registers a callback run once per accepted frame.
    ///
    /// Hook failures are logged and otherwise ignored.
    pub fn on_frame_accepted<F>(&self, hook: F)
    where
        F: Fn(&Frame) -> Result<(), FrameHookError> + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(hook));
    }

    /// Sends a command to the camera, or queues it when no camera is
    /// connected or the send fails.
    pub async fn submit_command(
        &self,
        cmd: &str,
        val: &str,
        source: Option<String>,
    ) -> SubmitOutcome {
        self.dispatch_command(cmd, val, source, None).await
    }

    /// Drops every queued command and returns how many were removed.
    pub async fn clear_commands(&self) -> usize {
        let n = self.queue.clear().await;
        tracing::info!(cleared = n, "command queue cleared");
        n
    }

    pub async fn pending_commands(&self) -> usize {
        self.queue.size().await
    }

    /// Point-in-time statistics.
    pub async fn snapshot(&self) -> Stats {
        let camera_ip = self.registry.camera_ip().await.map(|ip| ip.to_string());
        let viewers = self.registry.viewer_count().await;
        let pending = self.queue.size().await;
        self.stats.snapshot(camera_ip, viewers, pending)
    }

    pub async fn latest_frame(&self) -> Option<Frame> {
        self.registry.latest_frame().await
    }

    pub async fn viewer_count(&self) -> usize {
        self.registry.viewer_count().await
    }

    pub async fn has_camera(&self) -> bool {
        self.registry.has_camera().await
    }

    // -----------------------------------------------------------------------
    // Sweeper steps
    // -----------------------------------------------------------------------

    /// Discards transfers older than the chunk timeout, counting each as a
    /// failed frame. Returns how many were discarded.
    pub(crate) async fn expire_stale_transfers(&self) -> usize {
        let expired = self
            .transfers
            .lock()
            .await
            .expire_stale(self.config.chunk_timeout);
        for (id, state) in &expired {
            self.stats.record_failed();
            tracing::warn!(
                conn_id = %id,
                received = state.bytes_received(),
                expected = state.expected_size(),
                chunks = state.chunks_received(),
                expected_chunks = state.expected_chunks(),
                age_ms = state.started_at().elapsed().as_millis() as u64,
                "chunk transfer timed out"
            );
        }
        expired.len()
    }

    /// Moves one queued command to the camera. Returns `true` if a command
    /// was delivered; a failed send drops the command.
    pub(crate) async fn drain_one_command(&self) -> bool {
        let Some(camera) = self.registry.camera().await else {
            return false;
        };
        let Some(queued) = self.queue.dequeue().await else {
            return false;
        };

        match camera.sender.send_json(&queued.command) {
            Ok(()) => {
                tracing::info!(cmd = queued.cmd(), priority = %queued.priority, "queued command sent");
                true
            }
            Err(e) => {
                tracing::error!(cmd = queued.cmd(), "dropping queued command: {e}");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Message handling
    // -----------------------------------------------------------------------

    async fn handle_text(&self, session: &mut Session, text: &str) {
        let msg = match parse_inbound(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(conn_id = %session.id, "dropping malformed message: {e}");
                return;
            }
        };

        match msg {
            Inbound::Register(req) => self.handle_register(session, &req.device).await,
            Inbound::ImgStart(req) => self.handle_img_start(session, req).await,
            Inbound::ImgEnd(req) => self.handle_img_end(session, req).await,
            Inbound::Command(req) => {
                let val = req.val_text();
                self.dispatch_command(&req.cmd, &val, None, Some(&session.id))
                    .await;
            }
            Inbound::Health(data) => {
                tracing::info!(
                    conn_id = %session.id,
                    frames = data.get("frames").and_then(|v| v.as_u64()).unwrap_or(0),
                    "camera health report"
                );
                if let Err(e) = self
                    .registry
                    .broadcast_json(&CameraHealthEvent::new(data))
                    .await
                {
                    tracing::error!("failed to relay health report: {e}");
                }
            }
            Inbound::RequestStats => {
                let reply = ServerStatsEvent::new(self.snapshot().await);
                if let Err(e) = session.sender.send_json(&reply) {
                    tracing::debug!(conn_id = %session.id, "stats reply not sent: {e}");
                }
            }
            Inbound::Ignored(msg_type) => {
                tracing::debug!(conn_id = %session.id, ?msg_type, "ignoring message");
            }
        }
    }

    async fn handle_register(&self, session: &mut Session, device: &str) {
        match device {
            DEVICE_CAMERA if session.role != Role::Viewer => {
                self.promote_to_camera(session, true).await;
            }
            DEVICE_BROWSER if session.role != Role::Camera => {
                session.role = Role::Viewer;
                let viewers = self.registry.register_viewer(session.sender.clone()).await;
                tracing::info!(conn_id = %session.id, viewers, "viewer registered");

                let status = StatusEvent::new(self.snapshot().await);
                if let Err(e) = session.sender.send_json(&status) {
                    tracing::debug!(conn_id = %session.id, "initial status not sent: {e}");
                }
            }
            DEVICE_CAMERA | DEVICE_BROWSER => {
                tracing::warn!(
                    conn_id = %session.id,
                    role = ?session.role,
                    device,
                    "ignoring registration for a different role"
                );
            }
            other => {
                tracing::debug!(conn_id = %session.id, device = other, "ignoring unknown device type");
            }
        }
    }

    /// Makes the session's connection the camera and tells the viewers.
    async fn promote_to_camera(&self, session: &mut Session, explicit: bool) {
        if session.role == Role::Viewer {
            tracing::info!(conn_id = %session.id, "viewer promoted to camera by frame");
        }
        session.role = Role::Camera;

        // Ack before the camera becomes visible to the queue drainer.
        if explicit {
            if let Err(e) = session.sender.send_json(&RegisterAck::camera()) {
                tracing::debug!(conn_id = %session.id, "register ack not sent: {e}");
            }
        }

        let previous = self
            .registry
            .register_camera(session.sender.clone(), session.ip())
            .await;
        if let Some(old) = previous {
            tracing::info!(old = %old.sender.id(), new = %session.id, "replacing camera connection");
        }

        let pending = self.queue.size().await;
        if explicit {
            tracing::info!(conn_id = %session.id, pending, "camera registered");
        } else {
            tracing::info!(conn_id = %session.id, pending, "camera auto-registered");
        }

        self.broadcast_status().await;
    }

    async fn broadcast_status(&self) {
        let status = StatusEvent::new(self.snapshot().await);
        if let Err(e) = self.registry.broadcast_json(&status).await {
            tracing::error!("failed to broadcast status: {e}");
        }
    }

    async fn handle_img_start(&self, session: &mut Session, req: ImgStart) {
        if req.size > self.config.max_frame_size as u64 {
            tracing::warn!(
                conn_id = %session.id,
                size = req.size,
                chunks = req.chunks,
                "rejecting oversized chunked transfer"
            );
            return;
        }

        if let Err(e) = self
            .transfers
            .lock()
            .await
            .begin(&session.id, req.size, req.chunks)
        {
            tracing::warn!(conn_id = %session.id, "img_start rejected: {e}");
            return;
        }

        self.stats.record_chunked();
        tracing::info!(
            conn_id = %session.id,
            size = req.size,
            chunks = req.chunks,
            "chunked transfer started"
        );
        if let Err(e) = session.sender.send_json(&ImgAck::ready()) {
            tracing::debug!(conn_id = %session.id, "img_ack not sent: {e}");
        }
    }

    async fn handle_img_end(&self, session: &mut Session, req: ImgEnd) {
        if req.success {
            tracing::debug!(conn_id = %session.id, size = req.size, "camera reports transfer complete");
            return;
        }
        if self.transfers.lock().await.abort(&session.id) {
            self.stats.record_failed();
            tracing::warn!(conn_id = %session.id, "chunked transfer aborted by camera");
        }
    }

    async fn handle_binary(&self, session: &mut Session, data: Bytes) {
        let candidate = {
            let mut transfers = self.transfers.lock().await;
            match transfers.append(&session.id, &data) {
                AppendOutcome::NoTransfer => Some(data),
                AppendOutcome::Pending { received, expected } => {
                    tracing::debug!(conn_id = %session.id, received, expected, "chunk received");
                    None
                }
                AppendOutcome::Complete => transfers.take_completed(&session.id).map(Bytes::from),
            }
        };
        let Some(candidate) = candidate else {
            return;
        };

        match Frame::new(candidate) {
            Ok(frame) => self.accept_frame(session, frame).await,
            Err(defect) => {
                self.stats.record_failed();
                tracing::warn!(conn_id = %session.id, "dropping invalid frame: {defect}");
            }
        }
    }

    async fn accept_frame(&self, session: &mut Session, frame: Frame) {
        if !self.registry.is_camera(&session.id).await {
            self.promote_to_camera(session, false).await;
        }

        let total = self.stats.record_frame(frame.len());
        self.registry.set_latest_frame(frame.clone()).await;
        self.run_hooks(&frame);
        self.registry.broadcast_frame(&frame).await;

        if total % FRAME_LOG_EVERY == 0 {
            let viewers = self.registry.viewer_count().await;
            tracing::info!(
                frames = total,
                failed = self.stats.frames_failed(),
                fps = self.stats.fps(),
                size = frame.len(),
                viewers,
                "frame stats"
            );
        }
    }

    fn run_hooks(&self, frame: &Frame) {
        let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner);
        for hook in hooks.iter() {
            if let Err(e) = hook(frame) {
                tracing::error!("frame hook failed: {e}");
            }
        }
    }

    /// Direct send when a camera other than `origin` is connected, queue
    /// otherwise.
    async fn dispatch_command(
        &self,
        cmd: &str,
        val: &str,
        source: Option<String>,
        origin: Option<&ConnId>,
    ) -> SubmitOutcome {
        let cmd = cmd.to_lowercase();
        let priority = self.config.commands.priority_of(&cmd);
        let command = CameraCommand::new(cmd.as_str(), val, source);
        let critical = priority == Priority::Critical;

        if critical {
            tracing::warn!(cmd = %cmd, "CRITICAL command submitted");
        }

        let camera = self
            .registry
            .camera()
            .await
            .filter(|c| Some(c.sender.id()) != origin);
        if let Some(camera) = camera {
            match camera.sender.send_json(&command) {
                Ok(()) => {
                    if critical {
                        tracing::warn!(cmd = %cmd, "CRITICAL command sent immediately");
                    } else {
                        tracing::info!(cmd = %cmd, val, "command sent");
                    }
                    return SubmitOutcome::Sent;
                }
                Err(e) => {
                    tracing::error!(cmd = %cmd, "command send failed, queueing: {e}");
                }
            }
        }

        self.queue.enqueue(command, priority).await;
        if !critical {
            tracing::info!(cmd = %cmd, val, %priority, "command queued");
        }
        SubmitOutcome::Enqueued
    }
}

impl Handler for CameraEngine {
    fn on_connected<'a>(&'a self, session: &'a mut Session) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.transfers.lock().await.abort(&session.id);
            tracing::info!(conn_id = %session.id, "new connection");
        })
    }

    fn on_text<'a>(&'a self, session: &'a mut Session, text: &'a str) -> HandlerFuture<'a> {
        Box::pin(self.handle_text(session, text))
    }

    fn on_binary<'a>(&'a self, session: &'a mut Session, data: Bytes) -> HandlerFuture<'a> {
        Box::pin(self.handle_binary(session, data))
    }

    fn on_disconnected<'a>(&'a self, session: &'a Session) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.transfers.lock().await.abort(&session.id);
            match self.registry.deregister(&session.id).await {
                Departed::Camera => {
                    tracing::info!(conn_id = %session.id, "camera disconnected");
                    self.broadcast_status().await;
                }
                Departed::Viewer => {
                    tracing::info!(conn_id = %session.id, "viewer disconnected");
                }
                Departed::Unknown => {}
            }
        })
    }
}
