//! Connection registry: live control connections keyed by peer identity. In memory only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lanchat_core::wire::encode_frame;
use lanchat_core::{Envelope, FrameEncodeError, PeerId};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("connection closed")]
    Closed,
}

/// Write side of one control connection. Frames queued here are written by the connection's
/// writer task; cancelling the token stops both of its tasks and drops the socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    token: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            addr,
            tx,
            token,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        let frame = encode_frame(envelope)?;
        if self.token.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.tx.send(frame).map_err(|_| SendError::Closed)
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_closed()
    }
}

/// Peer → live control connection. One lock guards the whole map.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<PeerId, ConnectionHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for a new connection handle. Lets `remove` tell a superseded connection from its
    /// successor.
    pub fn next_conn_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `handle` for `peer`. A connection already registered for the peer is closed
    /// and returned.
    pub async fn register(&self, peer: PeerId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let replaced = self.inner.lock().await.insert(peer.clone(), handle);
        if let Some(old) = &replaced {
            debug!(peer = %peer, conn = old.id, "closing superseded connection");
            old.close();
        }
        replaced
    }

    pub async fn get(&self, peer: &PeerId) -> Option<ConnectionHandle> {
        self.inner.lock().await.get(peer).cloned()
    }

    /// Remove `peer` only if `conn_id` is still the registered connection. Returns whether an
    /// entry was removed.
    pub async fn remove(&self, peer: &PeerId, conn_id: u64) -> bool {
        let mut map = self.inner.lock().await;
        match map.get(peer) {
            Some(h) if h.id == conn_id => {
                map.remove(peer);
                true
            }
            _ => false,
        }
    }

    pub async fn all(&self) -> Vec<(PeerId, ConnectionHandle)> {
        self.inner
            .lock()
            .await
            .iter()
            .map(|(p, h)| (p.clone(), h.clone()))
            .collect()
    }

    pub async fn contains(&self, peer: &PeerId) -> bool {
        self.inner.lock().await.contains_key(peer)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Close and forget every connection.
    pub async fn close_all(&self) {
        let drained: Vec<ConnectionHandle> =
            self.inner.lock().await.drain().map(|(_, h)| h).collect();
        for h in drained {
            h.close();
        }
    }
}
