//! LanChat protocol core.
//! Host-driven: no I/O; host passes envelopes and receives actions.

pub mod core;
pub mod directory;
pub mod event;
pub mod identity;
pub mod protocol;
pub mod transfer;
pub mod wire;

pub use crate::core::{Action, ChatCore, HandshakeError, DECISION_TIMEOUT, START_TIMEOUT};
pub use directory::{DirectoryEntry, PeerDirectory, Upsert};
pub use event::Event;
pub use identity::{LocalProfile, PeerId};
pub use protocol::{Envelope, FileMetadata, Hello, DEFAULT_CONTROL_PORT, DEFAULT_FILE_PORT};
pub use transfer::{
    Direction, TransferError, TransferId, TransferKey, TransferRecord, TransferStatus,
    TransferTable, CHUNK_SIZE, MAX_FILE_SIZE,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
