use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::SyncMessage;

pub type PeerId = String;

/// Lifecycle and data callbacks from the peer layer, delivered as values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    ItemChanged {
        path: String,
        payload: Vec<u8>,
    },
    MessageReceived {
        from: PeerId,
        path: String,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no peer connected")]
    NotConnected,
    #[error("transport call timed out")]
    Timeout,
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("push rejected: {0}")]
    Rejected(String),
}

/// Outbound half of the peer layer. Best effort: no ordering across calls, no acknowledgement.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn push_item(&self, path: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn send_message(
        &self,
        peer: &str,
        path: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;
}

/// Encode and push a message as a data item, bounded by `timeout`.
pub async fn push_sync_message(
    transport: &dyn PeerTransport,
    message: &SyncMessage,
    timeout: Duration,
) -> Result<(), TransportError> {
    let payload = message
        .encode()
        .map_err(|e| TransportError::Rejected(e.to_string()))?;
    tokio::time::timeout(timeout, transport.push_item(message.path(), payload))
        .await
        .map_err(|_| TransportError::Timeout)?
}

/// Encode and send a message to one peer, bounded by `timeout`.
pub async fn send_sync_message(
    transport: &dyn PeerTransport,
    peer: &str,
    message: &SyncMessage,
    timeout: Duration,
) -> Result<(), TransportError> {
    let payload = message
        .encode()
        .map_err(|e| TransportError::Rejected(e.to_string()))?;
    tokio::time::timeout(timeout, transport.send_message(peer, message.path(), payload))
        .await
        .map_err(|_| TransportError::Timeout)?
}

// --- In-memory link ---

struct LinkState {
    connected: AtomicBool,
    rejecting: AtomicBool,
}

/// One side of an [`InMemoryLink`].
pub struct LinkEndpoint {
    local: PeerId,
    remote: PeerId,
    state: Arc<LinkState>,
    to_remote: mpsc::Sender<TransportEvent>,
}

impl LinkEndpoint {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn check_link(&self) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.state.rejecting.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("link is rejecting pushes".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for LinkEndpoint {
    async fn push_item(&self, path: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.check_link()?;
        self.to_remote
            .send(TransportEvent::ItemChanged {
                path: path.to_string(),
                payload,
            })
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn send_message(
        &self,
        peer: &str,
        path: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        if peer != self.remote {
            return Err(TransportError::NotConnected);
        }
        self.check_link()?;
        self.to_remote
            .send(TransportEvent::MessageReceived {
                from: self.local.clone(),
                path: path.to_string(),
                payload,
            })
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }
}

pub struct LinkSide {
    pub endpoint: Arc<LinkEndpoint>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// A pair of in-process endpoints joined by bounded channels, with a switchable link.
pub struct InMemoryLink {
    a: PeerId,
    b: PeerId,
    state: Arc<LinkState>,
    to_a: mpsc::Sender<TransportEvent>,
    to_b: mpsc::Sender<TransportEvent>,
}

impl InMemoryLink {
    /// Creates a disconnected link between peers `a` and `b`.
    #[must_use]
    pub fn new(a: &str, b: &str, capacity: usize) -> (Self, LinkSide, LinkSide) {
        let state = Arc::new(LinkState {
            connected: AtomicBool::new(false),
            rejecting: AtomicBool::new(false),
        });
        let (to_a, a_events) = mpsc::channel(capacity);
        let (to_b, b_events) = mpsc::channel(capacity);

        let side_a = LinkSide {
            endpoint: Arc::new(LinkEndpoint {
                local: a.to_string(),
                remote: b.to_string(),
                state: state.clone(),
                to_remote: to_b.clone(),
            }),
            events: a_events,
        };
        let side_b = LinkSide {
            endpoint: Arc::new(LinkEndpoint {
                local: b.to_string(),
                remote: a.to_string(),
                state: state.clone(),
                to_remote: to_a.clone(),
            }),
            events: b_events,
        };
        let link = Self {
            a: a.to_string(),
            b: b.to_string(),
            state,
            to_a,
            to_b,
        };
        (link, side_a, side_b)
    }

    /// Brings the link up and signals both sides. No-op if already up.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.state.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.notify(
            TransportEvent::PeerConnected(self.b.clone()),
            TransportEvent::PeerConnected(self.a.clone()),
        )
        .await
    }

    /// Drops the link and signals both sides. No-op if already down.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.state.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.notify(
            TransportEvent::PeerDisconnected(self.b.clone()),
            TransportEvent::PeerDisconnected(self.a.clone()),
        )
        .await
    }

    /// While set, every push and send fails with [`TransportError::Rejected`].
    pub fn set_rejecting(&self, rejecting: bool) {
        self.state.rejecting.store(rejecting, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn notify(
        &self,
        for_a: TransportEvent,
        for_b: TransportEvent,
    ) -> Result<(), TransportError> {
        self.to_a
            .send(for_a)
            .await
            .map_err(|_| TransportError::ChannelClosed)?;
        self.to_b
            .send(for_b)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }
}
