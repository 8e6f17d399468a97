//! Camera slot, viewer set and latest-frame slot.
//!
//! Holds at most one camera sender and any number of viewer senders. The
//! registry only mutates membership and delivers payloads; status events
//! are composed by the engine, which knows the statistics.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::connection::{ConnId, SendError, Sender};
use crate::jpeg::Frame;

/// The connection currently acting as camera.
#[derive(Debug, Clone)]
pub struct CameraSlot {
    pub sender: Sender,
    pub ip: IpAddr,
}

/// What [`SessionRegistry::deregister`] removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departed {
    Camera,
    Viewer,
    Unknown,
}

#[derive(Default)]
struct RegistryInner {
    camera: Option<CameraSlot>,
    viewers: HashMap<ConnId, Sender>,
    latest_frame: Option<Frame>,
}

/// Shared session state for all connections.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `sender` the camera, replacing any previous camera.
    ///
    /// The replaced connection is not closed; it is returned so the caller
    /// can log it. A connection promoted from viewer leaves the viewer set.
    pub async fn register_camera(&self, sender: Sender, ip: IpAddr) -> Option<CameraSlot> {
        let id = sender.id().clone();
        let mut inner = self.inner.lock().await;
        inner.viewers.remove(&id);
        let previous = inner.camera.replace(CameraSlot { sender, ip });
        previous.filter(|old| *old.sender.id() != id)
    }

    /// Adds a viewer and sends it the latest frame, if one exists.
    ///
    /// Returns the new viewer count.
    pub async fn register_viewer(&self, sender: Sender) -> usize {
        let mut inner = self.inner.lock().await;
        if let Some(frame) = &inner.latest_frame {
            if let Err(e) = sender.send_frame(frame) {
                tracing::debug!(conn_id = %sender.id(), "initial frame not delivered: {e}");
            }
        }
        inner.viewers.insert(sender.id().clone(), sender);
        inner.viewers.len()
    }

    /// Removes `id` from whichever role it holds.
    ///
    /// The camera slot is only cleared if `id` is still the current camera;
    /// a camera that was already replaced leaves the new one untouched.
    pub async fn deregister(&self, id: &ConnId) -> Departed {
        let mut inner = self.inner.lock().await;
        if inner.camera.as_ref().is_some_and(|c| c.sender.id() == id) {
            inner.camera = None;
            return Departed::Camera;
        }
        if inner.viewers.remove(id).is_some() {
            return Departed::Viewer;
        }
        Departed::Unknown
    }

    /// Replaces the latest frame. Previous frames are not retained.
    pub async fn set_latest_frame(&self, frame: Frame) {
        self.inner.lock().await.latest_frame = Some(frame);
    }

    pub async fn latest_frame(&self) -> Option<Frame> {
        self.inner.lock().await.latest_frame.clone()
    }

    /// Sends `msg` to every viewer.
    ///
    /// Viewers whose send fails are removed after the pass. Returns the
    /// number of viewers removed.
    pub async fn broadcast(&self, msg: WsMessage) -> usize {
        let mut inner = self.inner.lock().await;
        let failed: Vec<ConnId> = inner
            .viewers
            .iter()
            .filter_map(|(id, viewer)| match viewer.send(msg.clone()) {
                Ok(()) => None,
                Err(e) => {
                    tracing::debug!(conn_id = %id, "dropping viewer: {e}");
                    Some(id.clone())
                }
            })
            .collect();

        for id in &failed {
            inner.viewers.remove(id);
        }
        failed.len()
    }

    /// Broadcasts a frame as a binary message.
    pub async fn broadcast_frame(&self, frame: &Frame) -> usize {
        self.broadcast(WsMessage::Binary(frame.bytes().clone())).await
    }

    /// Serializes `msg` once and broadcasts it as text.
    pub async fn broadcast_json<T: Serialize>(&self, msg: &T) -> Result<usize, SendError> {
        let json = serde_json::to_string(msg)?;
        Ok(self.broadcast(WsMessage::Text(json.into())).await)
    }

    /// Returns the current camera, if any.
    pub async fn camera(&self) -> Option<CameraSlot> {
        self.inner.lock().await.camera.clone()
    }

    pub async fn camera_ip(&self) -> Option<IpAddr> {
        self.inner.lock().await.camera.as_ref().map(|c| c.ip)
    }

    pub async fn has_camera(&self) -> bool {
        self.inner.lock().await.camera.is_some()
    }

    pub async fn is_camera(&self, id: &ConnId) -> bool {
        self.inner
            .lock()
            .await
            .camera
            .as_ref()
            .is_some_and(|c| c.sender.id() == id)
    }

    pub async fn viewer_count(&self) -> usize {
        self.inner.lock().await.viewers.len()
    }
}
