//! Notifications for the front end. The core never touches UI state; hosts marshal these to
//! whatever runs the interface.

use std::path::PathBuf;

use crate::identity::PeerId;
use crate::transfer::{Direction, TransferId, TransferStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A handshake completed in either direction.
    PeerConnected { peer: PeerId, name: String },
    PeerDisconnected { peer: PeerId },
    /// Text from the focused peer, for display in the open conversation.
    Message {
        from: PeerId,
        from_name: String,
        text: String,
        timestamp: String,
    },
    /// Text from a peer that is not focused. Carries the text so the host can queue it.
    NewMessageNotice {
        from: PeerId,
        from_name: String,
        text: String,
    },
    /// Decision point: answer with accept or reject for (from, transfer_id).
    FileRequest {
        from: PeerId,
        from_name: String,
        filename: String,
        size: u64,
        transfer_id: TransferId,
    },
    TransferProgress {
        peer: PeerId,
        transfer_id: TransferId,
        direction: Direction,
        transferred: u64,
        total: u64,
        percent: f64,
    },
    /// Terminal outcome of a transfer on this side.
    TransferFinished {
        peer: PeerId,
        transfer_id: TransferId,
        direction: Direction,
        filename: String,
        status: TransferStatus,
        reason: Option<String>,
    },
    FileReceived {
        from: PeerId,
        from_name: String,
        transfer_id: TransferId,
        filename: String,
        path: PathBuf,
    },
    /// One-off status line (subsystem disabled, peer not connected, ...).
    Notice(String),
}
