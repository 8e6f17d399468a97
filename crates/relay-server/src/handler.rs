//! Handler trait for processing WebSocket messages.
//!
//! Implementors provide the relay logic while the connection pumps handle
//! framing, ping/pong and the per-connection task lifecycle.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;

use bytes::Bytes;

use crate::connection::{ConnId, Sender};

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Role held by a connection.
///
/// Set once by the first registration or the first accepted frame; a
/// viewer can still be promoted to camera by sending a valid frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unassigned,
    Camera,
    Viewer,
}

/// Per-connection state owned by the read loop.
#[derive(Debug)]
pub struct Session {
    pub id: ConnId,
    pub peer: SocketAddr,
    pub sender: Sender,
    pub role: Role,
}

impl Session {
    pub fn new(peer: SocketAddr, sender: Sender) -> Self {
        Self {
            id: sender.id().clone(),
            peer,
            sender,
            role: Role::Unassigned,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.peer.ip()
    }
}

/// Trait for handling messages from one connection.
///
/// Methods are awaited in order for a given connection; different
/// connections run concurrently. Failures are handled inside the
/// implementation: a method never ends the connection.
pub trait Handler: Send + Sync + 'static {
    /// Called once after the WebSocket handshake.
    fn on_connected<'a>(&'a self, session: &'a mut Session) -> HandlerFuture<'a> {
        let _ = session;
        Box::pin(async {})
    }

    /// Called for each text message.
    fn on_text<'a>(&'a self, session: &'a mut Session, text: &'a str) -> HandlerFuture<'a>;

    /// Called for each binary message.
    fn on_binary<'a>(&'a self, session: &'a mut Session, data: Bytes) -> HandlerFuture<'a>;

    /// Called once when the connection ends (cleanup hook).
    fn on_disconnected<'a>(&'a self, session: &'a Session) -> HandlerFuture<'a> {
        let _ = session;
        Box::pin(async {})
    }
}
