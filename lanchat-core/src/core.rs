//! Host-driven API: ChatCore receives decoded envelopes and local commands, returns actions.
//! The host owns sockets, storage and the UI; the core owns the directory and transfer table.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::directory::{DirectoryEntry, PeerDirectory};
use crate::event::Event;
use crate::identity::{LocalProfile, PeerId};
use crate::protocol::{Envelope, Hello};
use crate::transfer::{TransferError, TransferId, TransferKey, TransferStatus, TransferTable};

/// Inbound file requests left undecided this long are rejected.
pub const DECISION_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepted inbound transfers whose sender has not connected this long after acceptance fail.
pub const START_TIMEOUT: Duration = Duration::from_secs(30);

/// What the host must do after the core processed an input.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Hand to the UI gateway.
    Notify(Event),
    /// Write an envelope on the peer's control connection.
    Send(PeerId, Envelope),
    /// Directory learned something from a handshake; save it.
    Persist,
    /// Open (true) or close (false) the gate a sending worker waits on.
    ResolveUpload(TransferKey, bool),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum HandshakeError {
    #[error("peer announced our own identity {0}")]
    SelfIdentity(PeerId),
    #[error("empty peer identity")]
    EmptyIdentity,
}

/// Main coordinator. Host passes envelopes; core returns actions.
pub struct ChatCore {
    profile: LocalProfile,
    directory: PeerDirectory,
    transfers: TransferTable,
    focused: Option<PeerId>,
}

impl ChatCore {
    /// Takes over a directory loaded from storage and records self in it.
    pub fn new(profile: LocalProfile, mut directory: PeerDirectory) -> Self {
        directory.upsert(DirectoryEntry {
            id: profile.id.clone(),
            name: profile.name.clone(),
            ip: profile.ip.clone(),
            port: profile.control_port,
            file_port: profile.file_port,
            last_seen: Some(Utc::now()),
            is_online: true,
        });
        Self {
            profile,
            directory,
            transfers: TransferTable::new(),
            focused: None,
        }
    }

    pub fn profile(&self) -> &LocalProfile {
        &self.profile
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.profile.id
    }

    /// Handshake body for `connect` / `connect_ack`.
    pub fn hello(&self) -> Hello {
        self.profile.hello()
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn directory_mut(&mut self) -> &mut PeerDirectory {
        &mut self.directory
    }

    pub fn transfers(&self) -> &TransferTable {
        &self.transfers
    }

    pub fn transfers_mut(&mut self) -> &mut TransferTable {
        &mut self.transfers
    }

    /// Peer whose conversation is open. Messages from it are delivered, others are notices.
    pub fn set_focus(&mut self, peer: Option<PeerId>) {
        self.focused = peer;
    }

    pub fn focused(&self) -> Option<&PeerId> {
        self.focused.as_ref()
    }

    /// Control port to record for a peer whose handshake did not say: the one already known,
    /// else the default.
    pub fn known_control_port(&self, peer: &PeerId) -> u16 {
        self.directory
            .lookup(peer)
            .map(|e| e.port)
            .unwrap_or(crate::protocol::DEFAULT_CONTROL_PORT)
    }

    /// A `connect` or `connect_ack` was observed. `control_port` is where the peer can be
    /// reached for control traffic (the dialled port outbound, the default port inbound).
    pub fn on_handshake(
        &mut self,
        hello: &Hello,
        control_port: u16,
        now: DateTime<Utc>,
    ) -> Result<Vec<Action>, HandshakeError> {
        if hello.user_id.as_str().is_empty() {
            return Err(HandshakeError::EmptyIdentity);
        }
        if hello.user_id == self.profile.id {
            return Err(HandshakeError::SelfIdentity(hello.user_id.clone()));
        }
        let upsert = self.directory.upsert(DirectoryEntry {
            id: hello.user_id.clone(),
            name: hello.name.clone(),
            ip: hello.ip.clone(),
            port: control_port,
            file_port: hello.file_port,
            last_seen: Some(now),
            is_online: true,
        });
        debug!(peer = %hello.user_id, ?upsert, "handshake observed");
        Ok(vec![
            Action::Persist,
            Action::Notify(Event::PeerConnected {
                peer: hello.user_id.clone(),
                name: hello.name.clone(),
            }),
        ])
    }

    /// Route one envelope read from the control connection registered for `from`.
    pub fn on_envelope(
        &mut self,
        from: &PeerId,
        envelope: Envelope,
        now: DateTime<Utc>,
        at: Instant,
    ) -> Vec<Action> {
        match envelope {
            Envelope::Connect(hello) | Envelope::ConnectAck(hello) => {
                if hello.user_id != *from {
                    warn!(
                        peer = %from,
                        announced = %hello.user_id,
                        "handshake for another identity on this connection, ignoring"
                    );
                    return Vec::new();
                }
                let port = self.known_control_port(&hello.user_id);
                match self.on_handshake(&hello, port, now) {
                    Ok(actions) => actions,
                    Err(e) => {
                        warn!(peer = %from, "ignoring handshake: {}", e);
                        Vec::new()
                    }
                }
            }
            Envelope::Message {
                from_id,
                from_name,
                message,
                timestamp,
            } => {
                self.directory.touch(&from_id, now);
                let event = if self.focused.as_ref() == Some(&from_id) {
                    Event::Message {
                        from: from_id,
                        from_name,
                        text: message,
                        timestamp,
                    }
                } else {
                    Event::NewMessageNotice {
                        from: from_id,
                        from_name,
                        text: message,
                    }
                };
                vec![Action::Notify(event)]
            }
            Envelope::FileRequest {
                from_id,
                from_name,
                filename,
                filesize,
                transfer_id,
            } => {
                self.directory.touch(&from_id, now);
                match self
                    .transfers
                    .offer_received(from.clone(), transfer_id, filename.clone(), filesize, at)
                {
                    Ok(_) => vec![Action::Notify(Event::FileRequest {
                        from: from.clone(),
                        from_name,
                        filename,
                        size: filesize,
                        transfer_id,
                    })],
                    Err(TransferError::TooLarge { size, max }) => vec![
                        Action::Send(from.clone(), Envelope::FileReject { transfer_id }),
                        Action::Notify(Event::Notice(format!(
                            "Refused {} from {}: {} bytes exceeds the {} byte limit",
                            filename, from_name, size, max
                        ))),
                    ],
                    Err(e) => {
                        warn!(peer = %from, transfer_id, "ignoring file request: {}", e);
                        Vec::new()
                    }
                }
            }
            Envelope::FileAccept { transfer_id } => {
                let key = TransferKey::sending(transfer_id, from.clone());
                match self.transfers.accept(&key, at) {
                    Ok(()) => vec![Action::ResolveUpload(key, true)],
                    Err(e) => {
                        debug!(peer = %from, transfer_id, "stray file_accept: {}", e);
                        Vec::new()
                    }
                }
            }
            Envelope::FileReject { transfer_id } => {
                let key = TransferKey::sending(transfer_id, from.clone());
                match self.transfers.reject(&key) {
                    Ok(()) => {
                        let mut actions = vec![Action::ResolveUpload(key.clone(), false)];
                        actions.extend(self.finished_event(&key).map(Action::Notify));
                        actions
                    }
                    Err(e) => {
                        debug!(peer = %from, transfer_id, "stray file_reject: {}", e);
                        Vec::new()
                    }
                }
            }
        }
    }

    /// Control connection to `peer` is gone. Marks it offline and fails transfers that still
    /// needed the control channel to get started.
    pub fn on_disconnect(&mut self, peer: &PeerId) -> Vec<Action> {
        self.directory.mark_offline(peer);
        let mut actions = vec![Action::Notify(Event::PeerDisconnected { peer: peer.clone() })];
        for key in self.transfers.pending_for_peer(peer) {
            if self.transfers.fail(&key, "peer disconnected").is_ok() {
                if key.direction == crate::transfer::Direction::Sending {
                    actions.push(Action::ResolveUpload(key.clone(), false));
                }
                actions.extend(self.finished_event(&key).map(Action::Notify));
            }
        }
        actions
    }

    pub fn compose_message(&self, text: &str, now: DateTime<Utc>) -> Envelope {
        Envelope::Message {
            from_id: self.profile.id.clone(),
            from_name: self.profile.name.clone(),
            message: text.to_string(),
            timestamp: now.to_rfc3339(),
        }
    }

    /// Create the sending record and the `file_request` to put on the control channel.
    pub fn request_file(
        &mut self,
        peer: &PeerId,
        path: PathBuf,
        filename: String,
        size: u64,
        at: Instant,
    ) -> Result<(TransferKey, Envelope), TransferError> {
        let key = self
            .transfers
            .start_send(peer.clone(), filename.clone(), size, path, at)?;
        let envelope = Envelope::FileRequest {
            from_id: self.profile.id.clone(),
            from_name: self.profile.name.clone(),
            filename,
            filesize: size,
            transfer_id: key.id,
        };
        Ok((key, envelope))
    }

    /// Local answer to an inbound `file_request`.
    pub fn decide_file_request(
        &mut self,
        peer: &PeerId,
        transfer_id: TransferId,
        accept: bool,
        at: Instant,
    ) -> Result<Vec<Action>, TransferError> {
        let key = TransferKey::receiving(transfer_id, peer.clone());
        if accept {
            self.transfers.accept(&key, at)?;
            return Ok(vec![Action::Send(
                peer.clone(),
                Envelope::FileAccept { transfer_id },
            )]);
        }
        self.transfers.reject(&key)?;
        let mut actions = vec![Action::Send(
            peer.clone(),
            Envelope::FileReject { transfer_id },
        )];
        actions.extend(self.finished_event(&key).map(Action::Notify));
        Ok(actions)
    }

    /// Reject inbound requests nobody answered within `DECISION_TIMEOUT`, and fail accepted
    /// ones whose sender never opened the data connection within `START_TIMEOUT`.
    pub fn expire_requests(&mut self, at: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        for key in self.transfers.expired_offers(at, DECISION_TIMEOUT) {
            match self.decide_file_request(&key.peer, key.id, false, at) {
                Ok(a) => actions.extend(a),
                Err(e) => debug!(transfer_id = key.id, "expire skipped: {}", e),
            }
        }
        for key in self.transfers.stalled_downloads(at, START_TIMEOUT) {
            let reason = format!("sender did not connect within {}s", START_TIMEOUT.as_secs());
            if let Some(event) = self.finish_transfer(&key, Err(reason)) {
                warn!(peer = %key.peer, transfer_id = key.id, "accepted download never started");
                actions.push(Action::Notify(event));
            }
        }
        actions
    }

    /// Byte count after a chunk. Returns the progress event, or None if the record is not
    /// streaming any more.
    pub fn record_progress(&mut self, key: &TransferKey, transferred: u64) -> Option<Event> {
        let percent = self.transfers.progress(key, transferred).ok()?;
        let rec = self.transfers.get(key)?;
        Some(Event::TransferProgress {
            peer: key.peer.clone(),
            transfer_id: key.id,
            direction: key.direction,
            transferred,
            total: rec.size,
            percent,
        })
    }

    /// Settle a transfer: completed on `Ok`, failed with the reason on `Err`. Returns the
    /// outcome event, or None if the record had already reached a terminal state.
    pub fn finish_transfer(
        &mut self,
        key: &TransferKey,
        outcome: Result<(), String>,
    ) -> Option<Event> {
        let settled = match outcome {
            Ok(()) => self.transfers.complete(key),
            Err(reason) => self.transfers.fail(key, reason),
        };
        if let Err(e) = settled {
            debug!(transfer_id = key.id, "finish skipped: {}", e);
            return None;
        }
        self.finished_event(key)
    }

    fn finished_event(&self, key: &TransferKey) -> Option<Event> {
        let rec = self.transfers.get(key)?;
        if !rec.status.is_terminal() {
            return None;
        }
        Some(Event::TransferFinished {
            peer: key.peer.clone(),
            transfer_id: key.id,
            direction: key.direction,
            filename: rec.filename.clone(),
            status: rec.status,
            reason: match rec.status {
                TransferStatus::Failed => rec.error.clone(),
                _ => None,
            },
        })
    }
}
