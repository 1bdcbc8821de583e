//! Control channel: inbound and outbound handshakes, then one reader and one writer task per
//! registered connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lanchat_core::wire::encode_frame;
use lanchat_core::{Envelope, Hello, PeerId};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::framing;
use crate::node::Shared;
use crate::poller::PollEvent;
use crate::registry::ConnectionHandle;

/// Budget for the first envelope on a new connection (either side).
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Budget for an outbound TCP connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle a freshly accepted control connection. Anything but a valid `connect` as the first
/// envelope, or nothing within the handshake timeout, drops the connection without reply.
pub(crate) async fn accept(shared: Arc<Shared>, mut stream: TcpStream, addr: SocketAddr) {
    let first = tokio::select! {
        _ = shared.shutdown.cancelled() => return,
        r = tokio::time::timeout(HANDSHAKE_TIMEOUT, framing::read_envelope(&mut stream)) => r,
    };
    let hello = match first {
        Ok(Ok(Some(Ok(Envelope::Connect(hello))))) => hello,
        Ok(Ok(Some(Ok(other)))) => {
            debug!(%addr, kind = other.kind(), "first envelope is not connect, dropping");
            return;
        }
        Ok(Ok(Some(Err(e)))) => {
            debug!(%addr, "undecodable handshake, dropping: {}", e);
            return;
        }
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            debug!(%addr, "handshake read failed: {}", e);
            return;
        }
        Err(_) => {
            debug!(%addr, "no handshake within {:?}, dropping", HANDSHAKE_TIMEOUT);
            return;
        }
    };

    // The envelope carries no control port: keep the one already known, else the default.
    let (actions, ack) = {
        let mut core = shared.core.lock().await;
        let port = core.known_control_port(&hello.user_id);
        match core.on_handshake(&hello, port, Utc::now()) {
            Ok(actions) => (actions, Envelope::ConnectAck(core.hello())),
            Err(e) => {
                warn!(%addr, "refusing handshake: {}", e);
                return;
            }
        }
    };
    let ack = match encode_frame(&ack) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%addr, "encoding connect_ack: {}", e);
            return;
        }
    };
    info!(peer = %hello.user_id, name = %hello.name, %addr, "inbound connection");
    attach(&shared, stream, hello.user_id.clone(), addr, Some(ack)).await;
    shared.dispatch(actions).await;
}

/// Dial `addr`, send `connect` and wait for `connect_ack`. On success the connection is
/// registered exactly as an inbound one would be.
pub(crate) async fn connect(shared: &Arc<Shared>, addr: SocketAddr) -> Result<PeerId, NodeError> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| NodeError::ConnectTimeout(addr))??;
    let hello = shared.core.lock().await.hello();
    framing::write_envelope(&mut stream, &Envelope::Connect(hello)).await?;

    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, framing::read_envelope(&mut stream))
        .await
        .map_err(|_| NodeError::HandshakeTimeout { addr })??;
    let peer: Hello = match reply {
        Some(Ok(Envelope::ConnectAck(hello))) => hello,
        Some(Ok(other)) => {
            return Err(NodeError::Handshake {
                addr,
                reason: format!("expected connect_ack, got {}", other.kind()),
            })
        }
        Some(Err(e)) => {
            return Err(NodeError::Handshake {
                addr,
                reason: format!("undecodable reply: {}", e),
            })
        }
        None => {
            return Err(NodeError::Handshake {
                addr,
                reason: "connection closed before connect_ack".into(),
            })
        }
    };

    let actions = shared
        .core
        .lock()
        .await
        .on_handshake(&peer, addr.port(), Utc::now())?;
    info!(peer = %peer.user_id, name = %peer.name, %addr, "outbound connection");
    attach(shared, stream, peer.user_id.clone(), addr, None).await;
    shared.dispatch(actions).await;
    Ok(peer.user_id)
}

/// Register the connection for `peer` and start its tasks. `greeting` is written before
/// anything else queued on the connection.
async fn attach(
    shared: &Arc<Shared>,
    stream: TcpStream,
    peer: PeerId,
    addr: SocketAddr,
    greeting: Option<Vec<u8>>,
) -> ConnectionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let token = shared.shutdown.child_token();
    let conn = ConnectionHandle::new(shared.registry.next_conn_id(), addr, tx.clone(), token.clone());
    if let Some(frame) = greeting {
        let _ = tx.send(frame);
    }
    if let Some(old) = shared.registry.register(peer.clone(), conn.clone()).await {
        info!(peer = %peer, old = %old.addr(), new = %addr, "replaced existing connection");
    }
    let (reader, writer) = stream.into_split();
    tokio::spawn(write_loop(writer, rx, token.clone(), peer.clone()));
    tokio::spawn(read_loop(
        reader,
        peer,
        conn.id(),
        token,
        shared.inbox.clone(),
    ));
    conn
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    token: CancellationToken,
    peer: PeerId,
) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            f = rx.recv() => match f {
                Some(f) => f,
                None => break,
            },
        };
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            debug!(peer = %peer, "write failed: {}", e);
            token.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    peer: PeerId,
    conn: u64,
    token: CancellationToken,
    inbox: mpsc::UnboundedSender<PollEvent>,
) {
    loop {
        let read = tokio::select! {
            _ = token.cancelled() => break,
            r = framing::read_envelope(&mut reader) => r,
        };
        match read {
            Ok(Some(Ok(envelope))) => {
                if inbox
                    .send(PollEvent::Frame {
                        peer: peer.clone(),
                        conn,
                        envelope,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Ok(Some(Err(e))) => debug!(peer = %peer, "discarding undecodable envelope: {}", e),
            Ok(None) => {
                debug!(peer = %peer, "peer closed control connection");
                break;
            }
            Err(e) => {
                debug!(peer = %peer, "control read failed: {}", e);
                break;
            }
        }
    }
    token.cancel();
    let _ = inbox.send(PollEvent::Closed { peer, conn });
}
