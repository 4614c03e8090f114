//! Connection registry: the live set of client sessions.
//!
//! The transport owns each session. The registry only holds a sink per
//! connection so the broadcast engine can push payloads to it; registering
//! and removing happens when the transport reports a session opening or
//! closing.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::Payload;

/// Identity of one client session.
///
/// Two sessions from the same network peer get distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection is closed")]
    Closed,
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Outbound side of a connection as seen by the relay core.
pub trait PeerSink: Send + Sync {
    /// Whether the session still accepts payloads.
    fn is_open(&self) -> bool;

    /// Queue a payload for the session. Must not block.
    fn send(&self, payload: Payload) -> Result<(), DeliveryError>;
}

/// [`PeerSink`] backed by an unbounded channel drained by the session's
/// writer half.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Payload>,
    open: AtomicBool,
}

impl ChannelSink {
    /// Create a sink and the receiver its session task should drain.
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Payload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            tx,
            open: AtomicBool::new(true),
        });
        (sink, rx)
    }

    /// Mark the session closed; later sends fail with [`DeliveryError::Closed`].
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl PeerSink for ChannelSink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    fn send(&self, payload: Payload) -> Result<(), DeliveryError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(DeliveryError::Closed);
        }
        self.tx.send(payload).map_err(|_| DeliveryError::Closed)
    }
}

/// Live set of connected clients.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<dyn PeerSink>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns `false` if the id was already present.
    pub async fn register(&self, id: ConnectionId, sink: Arc<dyn PeerSink>) -> bool {
        let mut connections = self.connections.write().await;
        connections.insert(id, sink).is_none()
    }

    /// Remove a connection. Returns whether it was registered.
    pub async fn remove(&self, id: &ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        connections.remove(id).is_some()
    }

    /// Connections registered at the moment of the call.
    pub async fn live(&self) -> Vec<(ConnectionId, Arc<dyn PeerSink>)> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(id, sink)| (*id, sink.clone()))
            .collect()
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
