use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use stepsync_core::transport::{PeerId, PeerTransport, TransportError};

const OUTBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxKind {
    Item,
    Message,
}

/// A push or message waiting for the sensor unit to poll it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxItem {
    pub kind: OutboxKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerId>,
    pub path: String,
    pub payload: serde_json::Value,
}

struct PeerState {
    peer: Option<PeerId>,
    outbox: VecDeque<OutboxItem>,
}

/// Handheld side of the HTTP peer link. Outbound traffic is queued until the
/// sensor unit drains it from `GET /api/peer/outbox`.
pub struct HttpPeerTransport {
    state: Mutex<PeerState>,
    capacity: usize,
}

impl HttpPeerTransport {
    pub fn new() -> Self {
        Self::with_capacity(OUTBOX_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PeerState {
                peer: None,
                outbox: VecDeque::new(),
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn connect(&self, peer: &str) {
        self.lock().peer = Some(peer.to_string());
    }

    /// Forget the peer and anything still queued for it.
    pub fn disconnect(&self) -> Option<PeerId> {
        let mut state = self.lock();
        state.outbox.clear();
        state.peer.take()
    }

    pub fn connected_peer(&self) -> Option<PeerId> {
        self.lock().peer.clone()
    }

    pub fn drain(&self) -> Vec<OutboxItem> {
        self.lock().outbox.drain(..).collect()
    }

    fn enqueue(
        &self,
        kind: OutboxKind,
        peer: Option<&str>,
        path: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let payload = if payload.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(payload)
                .map_err(|e| TransportError::Rejected(format!("payload is not JSON: {e}")))?
        };

        let mut state = self.lock();
        let Some(connected) = state.peer.as_deref() else {
            return Err(TransportError::NotConnected);
        };
        if peer.is_some_and(|p| p != connected) {
            return Err(TransportError::NotConnected);
        }
        if state.outbox.len() >= self.capacity {
            return Err(TransportError::Rejected("outbox full".to_string()));
        }
        state.outbox.push_back(OutboxItem {
            kind,
            peer: peer.map(str::to_string),
            path: path.to_string(),
            payload,
        });
        Ok(())
    }
}

impl Default for HttpPeerTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn push_item(&self, path: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.enqueue(OutboxKind::Item, None, path, &payload)
    }

    async fn send_message(
        &self,
        peer: &str,
        path: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.enqueue(OutboxKind::Message, Some(peer), path, &payload)
    }
}
