//! Per-connection plumbing: read/write pumps, ping/pong, send buffering.

use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::handler::{Handler, Session};
use crate::jpeg::Frame;

/// Stable identifier of one physical connection, derived from its remote
/// address (`ip:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(String);

impl ConnId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SocketAddr> for ConnId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl From<&str> for ConnId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error returned when a message cannot be queued for a connection.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("send failed: buffer full")]
    Full,

    #[error("send failed: connection closed")]
    Closed,

    #[error("send failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Handle for sending messages to one connection.
///
/// Cloneable and cheap: wraps an `mpsc::Sender` drained by the write pump.
/// Sends never wait; a full or closed buffer is reported as [`SendError`].
#[derive(Clone)]
pub struct Sender {
    id: ConnId,
    tx: mpsc::Sender<WsMessage>,
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").field("id", &self.id).finish()
    }
}

impl Sender {
    /// Wraps the sending half of a connection's outbound channel.
    pub fn new(id: ConnId, tx: mpsc::Sender<WsMessage>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> &ConnId {
        &self.id
    }

    /// Queues a raw WebSocket message.
    pub fn send(&self, msg: WsMessage) -> Result<(), SendError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Serializes `msg` and queues it as a text message.
    pub fn send_json<T: Serialize>(&self, msg: &T) -> Result<(), SendError> {
        let json = serde_json::to_string(msg)?;
        self.send(WsMessage::Text(json.into()))
    }

    /// Queues a frame as a binary message.
    pub fn send_frame(&self, frame: &Frame) -> Result<(), SendError> {
        self.send(WsMessage::Binary(frame.bytes().clone()))
    }
}

/// Timing and size limits applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    pub ping_interval: Duration,
    /// Read deadline: the connection is dropped when nothing arrives for
    /// this long.
    pub pong_wait: Duration,
    pub max_message_size: usize,
}

/// Starts the read and write pumps for an accepted WebSocket.
///
/// Returns the connection's [`Sender`]. The pumps run as background tokio
/// tasks and stop when the peer goes away or `cancel` is triggered; the
/// handler's `on_disconnected` runs exactly once afterwards.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    peer: SocketAddr,
    handler: Arc<H>,
    config: PumpConfig,
    cancel: CancellationToken,
) -> Sender
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let sender = Sender::new(ConnId::from(peer), tx);

    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, config.ping_interval, cancel.clone()));

    let mut session = Session::new(peer, sender.clone());
    tokio::spawn(async move {
        handler.on_connected(&mut session).await;
        read_pump(ws_stream, &mut session, &handler, config, cancel.clone()).await;
        // When the read pump exits, stop the write pump too.
        cancel.cancel();
        handler.on_disconnected(&session).await;
        tracing::info!(conn_id = %session.id, role = ?session.role, "connection closed");
    });

    sender
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<WsMessage>,
    ping_interval: Duration,
    cancel: CancellationToken,
) where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let start = tokio::time::Instant::now() + ping_interval;
    let mut ping_ticker = tokio::time::interval_at(start, ping_interval);
    ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::debug!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = ping_ticker.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::debug!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches them to the handler.
///
/// Any incoming message resets the read deadline; if nothing arrives within
/// `pong_wait` the connection is considered dead.
async fn read_pump<S, H>(
    mut stream: S,
    session: &mut Session,
    handler: &Arc<H>,
    config: PumpConfig,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let deadline = tokio::time::sleep(config.pong_wait);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                tracing::warn!(conn_id = %session.id, "pong timeout, closing connection");
                break;
            }

            frame = stream.next() => {
                let ws_msg = match frame {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        tracing::debug!(conn_id = %session.id, "read pump error: {e}");
                        break;
                    }
                    None => break, // Stream ended.
                };
                deadline.as_mut().reset(tokio::time::Instant::now() + config.pong_wait);

                match ws_msg {
                    WsMessage::Text(text) => {
                        if text.len() > config.max_message_size {
                            tracing::error!("message exceeds max size ({} > {})", text.len(), config.max_message_size);
                            continue;
                        }
                        let fut = handler.on_text(session, text.as_str());
                        if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                            tracing::error!(conn_id = %session.id, "text handler panicked, message dropped");
                        }
                    }
                    WsMessage::Binary(data) => {
                        if data.len() > config.max_message_size {
                            tracing::error!("binary message exceeds max size ({} > {})", data.len(), config.max_message_size);
                            continue;
                        }
                        let fut = handler.on_binary(session, data);
                        if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                            tracing::error!(conn_id = %session.id, "binary handler panicked, message dropped");
                        }
                    }
                    WsMessage::Ping(data) => {
                        let _ = session.sender.send(WsMessage::Pong(data));
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => {
                        tracing::debug!(conn_id = %session.id, "received close frame");
                        break;
                    }
                    WsMessage::Frame(_) => {} // Raw frames ignored.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerFuture;
    use bytes::Bytes;
    use futures_util::stream;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        texts: Mutex<Vec<String>>,
        binaries: Mutex<Vec<usize>>,
        panic_on: Option<&'static str>,
    }

    impl Handler for Recorder {
        fn on_text<'a>(&'a self, _session: &'a mut Session, text: &'a str) -> HandlerFuture<'a> {
            Box::pin(async move {
                if self.panic_on == Some(text) {
                    panic!("boom");
                }
                self.texts.lock().unwrap().push(text.to_string());
            })
        }

        fn on_binary<'a>(&'a self, _session: &'a mut Session, data: Bytes) -> HandlerFuture<'a> {
            Box::pin(async move {
                self.binaries.lock().unwrap().push(data.len());
            })
        }
    }

    fn test_session() -> (Session, mpsc::Receiver<WsMessage>) {
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let (tx, rx) = mpsc::channel(8);
        (Session::new(peer, Sender::new(ConnId::from(peer), tx)), rx)
    }

    fn pump_config() -> PumpConfig {
        PumpConfig {
            ping_interval: Duration::from_secs(20),
            pong_wait: Duration::from_secs(30),
            max_message_size: 1024,
        }
    }

    #[test]
    fn conn_id_from_socket_addr() {
        let addr: SocketAddr = "192.168.1.50:51234".parse().unwrap();
        assert_eq!(ConnId::from(addr).as_str(), "192.168.1.50:51234");
    }

    #[tokio::test]
    async fn sender_reports_closed_and_full() {
        let (tx, rx) = mpsc::channel(1);
        let sender = Sender::new(ConnId::from("a"), tx);
        sender.send(WsMessage::Text(String::from("one").into())).unwrap();
        assert!(matches!(
            sender.send(WsMessage::Text(String::from("two").into())),
            Err(SendError::Full)
        ));
        drop(rx);
        assert!(matches!(
            sender.send(WsMessage::Text(String::from("three").into())),
            Err(SendError::Closed)
        ));
    }

    #[tokio::test]
    async fn read_pump_dispatches_and_survives_panic() {
        let handler = Arc::new(Recorder {
            panic_on: Some("explode"),
            ..Default::default()
        });
        let (mut session, _rx) = test_session();
        let frames = stream::iter(vec![
            Ok(WsMessage::Text(String::from("first").into())),
            Ok(WsMessage::Text(String::from("explode").into())),
            Ok(WsMessage::Binary(Bytes::from(vec![0u8; 16]))),
            Ok(WsMessage::Binary(Bytes::from(vec![0u8; 4096]))),
            Ok(WsMessage::Text(String::from("last").into())),
        ]);

        read_pump(
            frames,
            &mut session,
            &handler,
            pump_config(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(*handler.texts.lock().unwrap(), vec!["first", "last"]);
        // The oversized binary message is dropped.
        assert_eq!(*handler.binaries.lock().unwrap(), vec![16]);
    }

    #[tokio::test]
    async fn read_pump_answers_ping() {
        let handler = Arc::new(Recorder::default());
        let (mut session, mut rx) = test_session();
        let frames = stream::iter(vec![Ok(WsMessage::Ping(Bytes::from_static(b"hi")))]);

        read_pump(
            frames,
            &mut session,
            &handler,
            pump_config(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(
            rx.recv().await.unwrap(),
            WsMessage::Pong(Bytes::from_static(b"hi"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn read_pump_times_out_on_silence() {
        let handler = Arc::new(Recorder::default());
        let (mut session, _rx) = test_session();
        let silent = stream::pending::<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>();

        // With paused time the deadline auto-advances and the pump returns.
        read_pump(
            silent,
            &mut session,
            &handler,
            pump_config(),
            CancellationToken::new(),
        )
        .await;
        assert!(handler.texts.lock().unwrap().is_empty());
    }
}
