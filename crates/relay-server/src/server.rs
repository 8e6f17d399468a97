//! Relay WebSocket listener.
//!
//! Accepts any number of connections on a TCP port, upgrades each to
//! WebSocket and hands it to [`connection::spawn_connection`] with the
//! shared [`Handler`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use camrelay_protocol::constants::{MAX_FRAME_SIZE, WS_PING_INTERVAL, WS_PING_TIMEOUT, WS_PORT};

use crate::ServerError;
use crate::connection::{self, PumpConfig};
use crate::handler::Handler;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Interval between outbound WebSocket pings.
    pub ping_interval: Duration,
    /// A connection silent for this long is closed.
    pub pong_wait: Duration,
    /// Largest accepted WebSocket message or frame.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: WS_PORT,
            ping_interval: WS_PING_INTERVAL,
            pong_wait: WS_PING_INTERVAL + WS_PING_TIMEOUT,
            max_message_size: MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            ping_interval: self.ping_interval,
            pong_wait: self.pong_wait,
            max_message_size: self.max_message_size,
        }
    }
}

/// The relay WebSocket server.
pub struct RelayServer<H: Handler> {
    config: ServerConfig,
    handler: Arc<H>,
    cancel: CancellationToken,
}

impl<H: Handler> RelayServer<H> {
    /// Creates a server dispatching to `handler`.
    ///
    /// Cancelling `cancel` stops the accept loop and every connection.
    pub fn new(config: ServerConfig, handler: Arc<H>, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            cancel,
        })
    }

    /// Stops accepting and closes all connections.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Binds the configured port on all interfaces and serves until
    /// cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.port).into();
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until cancellation.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        tracing::info!("relay server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection and starts its pumps.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);
        ws_config.max_frame_size = Some(self.config.max_message_size);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;
        tracing::info!(%peer_addr, "WebSocket connection established");

        connection::spawn_connection(
            ws_stream,
            peer_addr,
            Arc::clone(&self.handler),
            self.config.pump_config(),
            self.cancel.child_token(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;
    use crate::handler::{HandlerFuture, Session};

    /// Echoes text back and counts connections.
    #[derive(Default)]
    struct EchoHandler {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl Handler for EchoHandler {
        fn on_connected<'a>(&'a self, _session: &'a mut Session) -> HandlerFuture<'a> {
            self.connected.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }

        fn on_text<'a>(&'a self, session: &'a mut Session, text: &'a str) -> HandlerFuture<'a> {
            Box::pin(async move {
                let _ = session
                    .sender
                    .send(WsMessage::Text(format!("echo:{text}").into()));
            })
        }

        fn on_binary<'a>(&'a self, session: &'a mut Session, data: Bytes) -> HandlerFuture<'a> {
            Box::pin(async move {
                let _ = session.sender.send(WsMessage::Binary(data));
            })
        }

        fn on_disconnected<'a>(&'a self, _session: &'a Session) -> HandlerFuture<'a> {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            max_message_size: 4096,
            ..Default::default()
        }
    }

    async fn start() -> (Arc<RelayServer<EchoHandler>>, tokio::task::JoinHandle<()>, String) {
        let server = RelayServer::new(
            test_config(),
            Arc::new(EchoHandler::default()),
            CancellationToken::new(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server2 = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            server2.serve(listener).await.unwrap();
        });
        (server, handle, format!("ws://127.0.0.1:{port}"))
    }

    #[test]
    fn default_config_matches_protocol() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 6972);
        assert_eq!(config.pong_wait, Duration::from_secs(30));
        assert_eq!(config.max_message_size, 5 * 1024 * 1024);
    }

    #[tokio::test]
    async fn run_binds_and_stops_on_shutdown() {
        let server = RelayServer::new(
            test_config(),
            Arc::new(EchoHandler::default()),
            CancellationToken::new(),
        );
        let server2 = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished(), "should still be serving");

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("should stop after shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn server_accepts_many_connections() {
        let (server, handle, url) = start().await;

        let (mut ws1, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (mut ws2, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        ws1.send(WsMessage::Text(String::from("one").into())).await.unwrap();
        ws2.send(WsMessage::Text(String::from("two").into())).await.unwrap();

        assert_eq!(
            ws1.next().await.unwrap().unwrap(),
            WsMessage::Text(String::from("echo:one").into())
        );
        assert_eq!(
            ws2.next().await.unwrap().unwrap(),
            WsMessage::Text(String::from("echo:two").into())
        );
        assert_eq!(server.handler.connected.load(Ordering::SeqCst), 2);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_runs_cleanup_once() {
        let (server, handle, url) = start().await;

        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws.send(WsMessage::Binary(Bytes::from_static(b"abc"))).await.unwrap();
        assert_eq!(
            ws.next().await.unwrap().unwrap(),
            WsMessage::Binary(Bytes::from_static(b"abc"))
        );
        ws.close(None).await.unwrap();
        drop(ws);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.handler.disconnected.load(Ordering::SeqCst), 1);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_connections() {
        let (server, handle, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown();
        handle.await.unwrap();

        // The client sees a close frame or the end of the stream.
        let next = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("connection should close");
        assert!(matches!(next, None | Some(Ok(WsMessage::Close(_))) | Some(Err(_))));
    }
}
