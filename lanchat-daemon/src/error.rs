use std::net::SocketAddr;
use std::path::PathBuf;

use lanchat_core::{HandshakeError, PeerId, TransferError};

use crate::config::ConfigError;
use crate::registry::SendError;
use crate::store::StoreError;

/// Errors returned by the `Node` API.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no display name configured; pass --name on first run")]
    MissingName,
    #[error("connecting to {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("{addr}: no connect_ack within the handshake timeout")]
    HandshakeTimeout { addr: SocketAddr },
    #[error("{addr}: handshake failed: {reason}")]
    Handshake { addr: SocketAddr, reason: String },
    #[error(transparent)]
    Identity(#[from] HandshakeError),
    #[error("refusing to connect to ourselves")]
    SelfConnect,
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("bad address for peer {peer}: {addr}")]
    BadAddress { peer: PeerId, addr: String },
    #[error("{0} is not a regular file")]
    NotAFile(PathBuf),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("receiving files is disabled")]
    ReceivingDisabled,
    #[error("node is shutting down")]
    ShuttingDown,
}
