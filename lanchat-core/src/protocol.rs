//! LanChat wire protocol: control envelopes, data-channel metadata and ack tokens.

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::transfer::TransferId;

/// Default TCP port for control envelopes.
pub const DEFAULT_CONTROL_PORT: u16 = 12345;
/// Default TCP port for file payloads.
pub const DEFAULT_FILE_PORT: u16 = 12346;

/// Receiver is ready for the raw file bytes.
pub const READY: &[u8] = b"READY";
/// Receiver got exactly the declared number of bytes.
pub const COMPLETE: &[u8] = b"COMPLETE";

fn default_file_port() -> u16 {
    DEFAULT_FILE_PORT
}

/// Handshake body shared by `connect` and `connect_ack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub user_id: PeerId,
    pub name: String,
    pub ip: String,
    #[serde(default = "default_file_port")]
    pub file_port: u16,
}

/// One unit of control-channel traffic. JSON object with a `type` discriminator; framing is
/// length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First envelope on a new control connection.
    Connect(Hello),
    /// Reply to `connect` with the accepting side's own details.
    ConnectAck(Hello),
    /// Text message. `timestamp` is RFC 3339 as produced by the sender.
    Message {
        from_id: PeerId,
        from_name: String,
        message: String,
        timestamp: String,
    },
    /// Offer of a file; the receiver answers with `file_accept` or `file_reject`.
    FileRequest {
        from_id: PeerId,
        from_name: String,
        filename: String,
        filesize: u64,
        transfer_id: TransferId,
    },
    FileAccept {
        transfer_id: TransferId,
    },
    FileReject {
        transfer_id: TransferId,
    },
}

impl Envelope {
    /// Discriminator as it appears on the wire. Used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Connect(_) => "connect",
            Envelope::ConnectAck(_) => "connect_ack",
            Envelope::Message { .. } => "message",
            Envelope::FileRequest { .. } => "file_request",
            Envelope::FileAccept { .. } => "file_accept",
            Envelope::FileReject { .. } => "file_reject",
        }
    }
}

/// Metadata block opening a data connection: 4-byte BE length, then this object as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "file_metadata")]
pub struct FileMetadata {
    pub filename: String,
    pub filesize: u64,
    pub transfer_id: TransferId,
    pub sender_id: PeerId,
    #[serde(default = "unknown_sender")]
    pub sender_name: String,
}

fn unknown_sender() -> String {
    "Unknown".to_string()
}
