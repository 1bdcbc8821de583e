//! Peer identity: short opaque key derived once at first run, plus the local profile.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::protocol::Hello;

/// Length of a generated peer ID in hex characters.
pub const PEER_ID_LEN: usize = 8;

/// Peer identity. Generated locally as 8 hex chars; remote IDs are taken as-is from the wire.
/// A routing and display key only. Not unique by construction and never a credential.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an ID received from a peer or loaded from storage.
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Derive a new ID from display name, host name and time: first 4 bytes of SHA-256, hex.
    pub fn generate(display_name: &str, host_name: &str, now: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(display_name.as_bytes());
        hasher.update(b"_");
        hasher.update(host_name.as_bytes());
        hasher.update(b"_");
        hasher.update(now.timestamp_micros().to_le_bytes());
        let digest = hasher.finalize();
        let id = digest[..PEER_ID_LEN / 2]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        PeerId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// This instance as advertised to peers: identity, name, reachable address and ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalProfile {
    pub id: PeerId,
    pub name: String,
    pub ip: String,
    pub control_port: u16,
    pub file_port: u16,
}

impl LocalProfile {
    /// Handshake body sent in `connect` and `connect_ack`.
    pub fn hello(&self) -> Hello {
        Hello {
            user_id: self.id.clone(),
            name: self.name.clone(),
            ip: self.ip.clone(),
            file_port: self.file_port,
        }
    }
}
