//! File transfer records: one per (transfer id, peer, direction), driven through
//! `pending → uploading/downloading → completed | failed` (or `rejected` before streaming).

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Transfer id chosen by the sender from a local counter. Not namespaced per peer.
pub type TransferId = u64;

/// Hard cap on a single file, enforced by sender and receiver.
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Streaming chunk size on the data channel.
pub const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sending,
    Receiving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Uploading,
    Downloading,
    Completed,
    Failed,
    Rejected,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Rejected
        )
    }

    pub fn is_streaming(self) -> bool {
        matches!(self, TransferStatus::Uploading | TransferStatus::Downloading)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Uploading => "uploading",
            TransferStatus::Downloading => "downloading",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Records are scoped to (id, peer, direction): two senders picking the same id never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub id: TransferId,
    pub peer: PeerId,
    pub direction: Direction,
}

impl TransferKey {
    pub fn sending(id: TransferId, peer: PeerId) -> Self {
        Self {
            id,
            peer,
            direction: Direction::Sending,
        }
    }

    pub fn receiving(id: TransferId, peer: PeerId) -> Self {
        Self {
            id,
            peer,
            direction: Direction::Receiving,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub id: TransferId,
    pub direction: Direction,
    pub peer: PeerId,
    pub filename: String,
    /// Declared total size in bytes.
    pub size: u64,
    pub transferred: u64,
    pub status: TransferStatus,
    /// Source file when sending; destination once a download has started.
    pub path: Option<PathBuf>,
    /// The receiving user said yes (receiver), or the peer sent `file_accept` (sender).
    pub accepted: bool,
    pub error: Option<String>,
    pub requested_at: Instant,
    pub accepted_at: Option<Instant>,
}

impl TransferRecord {
    pub fn key(&self) -> TransferKey {
        TransferKey {
            id: self.id,
            peer: self.peer.clone(),
            direction: self.direction,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.size == 0 {
            return if self.status == TransferStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.transferred as f64 / self.size as f64) * 100.0
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TransferError {
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("unknown transfer {0}")]
    Unknown(TransferId),
    #[error("transfer {0} already in progress")]
    Duplicate(TransferId),
    #[error("transfer {id} is {status}, cannot {op}")]
    InvalidState {
        id: TransferId,
        status: TransferStatus,
        op: &'static str,
    },
}

/// Reject sizes over `MAX_FILE_SIZE`. Exactly the cap is allowed.
pub fn check_size(size: u64) -> Result<(), TransferError> {
    if size > MAX_FILE_SIZE {
        return Err(TransferError::TooLarge {
            size,
            max: MAX_FILE_SIZE,
        });
    }
    Ok(())
}

/// Keep alphanumerics, space, dot, underscore and hyphen; drop everything else (path
/// separators included). Trailing whitespace is trimmed.
pub fn sanitize_filename(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-'))
        .collect();
    let kept = kept.trim_end().to_string();
    if kept.is_empty() || kept.chars().all(|c| c == '.') {
        return "file".to_string();
    }
    kept
}

/// Name a received file is stored under: `YYYYmmdd_HHMMSS_<sanitized>`.
pub fn stored_filename(now: NaiveDateTime, name: &str) -> String {
    format!("{}_{}", now.format("%Y%m%d_%H%M%S"), sanitize_filename(name))
}

/// `n`th alternative to a taken `name`: `report_1.pdf`, `report_2.pdf`, ...
pub fn numbered_filename(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &name[..dot], n, &name[dot..]),
        _ => format!("{}_{}", name, n),
    }
}

/// All transfer records of this instance, both directions.
#[derive(Debug, Default)]
pub struct TransferTable {
    next_id: TransferId,
    records: HashMap<TransferKey, TransferRecord>,
    /// Terminal records displaced by a later transfer reusing the same key.
    archived: Vec<TransferRecord>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id from the local monotonically increasing counter.
    pub fn allocate_id(&mut self) -> TransferId {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        id
    }

    /// Create a pending sending record. Size is checked before an id is spent.
    pub fn start_send(
        &mut self,
        peer: PeerId,
        filename: String,
        size: u64,
        path: PathBuf,
        now: Instant,
    ) -> Result<TransferKey, TransferError> {
        check_size(size)?;
        let id = self.allocate_id();
        let key = TransferKey::sending(id, peer.clone());
        self.records.insert(
            key.clone(),
            TransferRecord {
                id,
                direction: Direction::Sending,
                peer,
                filename,
                size,
                transferred: 0,
                status: TransferStatus::Pending,
                path: Some(path),
                accepted: false,
                error: None,
                requested_at: now,
                accepted_at: None,
            },
        );
        Ok(key)
    }

    /// Create a pending receiving record for an inbound `file_request`.
    pub fn offer_received(
        &mut self,
        peer: PeerId,
        id: TransferId,
        filename: String,
        size: u64,
        now: Instant,
    ) -> Result<TransferKey, TransferError> {
        check_size(size)?;
        let key = TransferKey::receiving(id, peer.clone());
        if let Some(existing) = self.records.get(&key) {
            if !existing.status.is_terminal() {
                return Err(TransferError::Duplicate(id));
            }
            if let Some(old) = self.records.remove(&key) {
                self.archived.push(old);
            }
        }
        self.records.insert(
            key.clone(),
            TransferRecord {
                id,
                direction: Direction::Receiving,
                peer,
                filename,
                size,
                transferred: 0,
                status: TransferStatus::Pending,
                path: None,
                accepted: false,
                error: None,
                requested_at: now,
                accepted_at: None,
            },
        );
        Ok(key)
    }

    pub fn get(&self, key: &TransferKey) -> Option<&TransferRecord> {
        self.records.get(key)
    }

    fn pending_mut(
        &mut self,
        key: &TransferKey,
        op: &'static str,
    ) -> Result<&mut TransferRecord, TransferError> {
        let rec = self
            .records
            .get_mut(key)
            .ok_or(TransferError::Unknown(key.id))?;
        if rec.status != TransferStatus::Pending {
            return Err(TransferError::InvalidState {
                id: key.id,
                status: rec.status,
                op,
            });
        }
        Ok(rec)
    }

    /// Mark a pending transfer as cleared to stream.
    pub fn accept(&mut self, key: &TransferKey, now: Instant) -> Result<(), TransferError> {
        let rec = self.pending_mut(key, "accept")?;
        rec.accepted = true;
        rec.accepted_at = Some(now);
        Ok(())
    }

    pub fn reject(&mut self, key: &TransferKey) -> Result<(), TransferError> {
        let rec = self.pending_mut(key, "reject")?;
        rec.status = TransferStatus::Rejected;
        Ok(())
    }

    /// Data connection is up: pending and accepted → uploading/downloading.
    pub fn begin(&mut self, key: &TransferKey, path: Option<PathBuf>) -> Result<(), TransferError> {
        let rec = self.pending_mut(key, "begin")?;
        if !rec.accepted {
            return Err(TransferError::InvalidState {
                id: key.id,
                status: rec.status,
                op: "begin before accept",
            });
        }
        rec.status = match rec.direction {
            Direction::Sending => TransferStatus::Uploading,
            Direction::Receiving => TransferStatus::Downloading,
        };
        if path.is_some() {
            rec.path = path;
        }
        Ok(())
    }

    /// Update the byte count of a streaming transfer. Returns the new percentage.
    pub fn progress(&mut self, key: &TransferKey, transferred: u64) -> Result<f64, TransferError> {
        let rec = self
            .records
            .get_mut(key)
            .ok_or(TransferError::Unknown(key.id))?;
        if !rec.status.is_streaming() {
            return Err(TransferError::InvalidState {
                id: key.id,
                status: rec.status,
                op: "progress",
            });
        }
        rec.transferred = transferred;
        Ok(rec.percent())
    }

    pub fn complete(&mut self, key: &TransferKey) -> Result<(), TransferError> {
        let rec = self
            .records
            .get_mut(key)
            .ok_or(TransferError::Unknown(key.id))?;
        if !rec.status.is_streaming() {
            return Err(TransferError::InvalidState {
                id: key.id,
                status: rec.status,
                op: "complete",
            });
        }
        rec.transferred = rec.size;
        rec.status = TransferStatus::Completed;
        Ok(())
    }

    /// Any non-terminal record may fail. Terminal records are left as they are.
    pub fn fail(&mut self, key: &TransferKey, reason: impl Into<String>) -> Result<(), TransferError> {
        let rec = self
            .records
            .get_mut(key)
            .ok_or(TransferError::Unknown(key.id))?;
        if rec.status.is_terminal() {
            return Err(TransferError::InvalidState {
                id: key.id,
                status: rec.status,
                op: "fail",
            });
        }
        rec.status = TransferStatus::Failed;
        rec.error = Some(reason.into());
        Ok(())
    }

    /// Current records, oldest first.
    pub fn list(&self) -> Vec<&TransferRecord> {
        let mut out: Vec<&TransferRecord> = self.records.values().collect();
        out.sort_by_key(|r| r.requested_at);
        out
    }

    /// Pending or streaming transfers.
    pub fn active_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| !r.status.is_terminal())
            .count()
    }

    /// Inbound offers still waiting for a local decision after `timeout`.
    pub fn expired_offers(&self, now: Instant, timeout: Duration) -> Vec<TransferKey> {
        self.records
            .values()
            .filter(|r| {
                r.direction == Direction::Receiving
                    && r.status == TransferStatus::Pending
                    && !r.accepted
                    && now.saturating_duration_since(r.requested_at) >= timeout
            })
            .map(|r| r.key())
            .collect()
    }

    /// Inbound transfers accepted here whose sender has not opened the data connection within
    /// `timeout` of the acceptance.
    pub fn stalled_downloads(&self, now: Instant, timeout: Duration) -> Vec<TransferKey> {
        self.records
            .values()
            .filter(|r| {
                r.direction == Direction::Receiving
                    && r.status == TransferStatus::Pending
                    && r.accepted_at
                        .is_some_and(|at| now.saturating_duration_since(at) >= timeout)
            })
            .map(|r| r.key())
            .collect()
    }

    /// Pending (not yet streaming) transfers with `peer`. These depend on its control connection.
    pub fn pending_for_peer(&self, peer: &PeerId) -> Vec<TransferKey> {
        self.records
            .values()
            .filter(|r| &r.peer == peer && r.status == TransferStatus::Pending)
            .map(|r| r.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn peer() -> PeerId {
        PeerId::from("aaaa1111")
    }

    #[test]
    fn size_cap_boundary() {
        assert!(check_size(MAX_FILE_SIZE).is_ok());
        assert_eq!(
            check_size(MAX_FILE_SIZE + 1),
            Err(TransferError::TooLarge {
                size: MAX_FILE_SIZE + 1,
                max: MAX_FILE_SIZE
            })
        );
    }

    #[test]
    fn too_large_send_does_not_spend_an_id() {
        let mut t = TransferTable::new();
        let now = Instant::now();
        assert!(t
            .start_send(peer(), "big".into(), MAX_FILE_SIZE + 1, "big".into(), now)
            .is_err());
        let key = t
            .start_send(peer(), "a.txt".into(), 10, "a.txt".into(), now)
            .unwrap();
        assert_eq!(key.id, 0);
        assert_eq!(t.allocate_id(), 1);
    }

    #[test]
    fn sender_lifecycle() {
        let mut t = TransferTable::new();
        let key = t
            .start_send(peer(), "a.txt".into(), 10, "/tmp/a.txt".into(), Instant::now())
            .unwrap();
        assert!(matches!(
            t.begin(&key, None),
            Err(TransferError::InvalidState { .. })
        ));
        t.accept(&key, Instant::now()).unwrap();
        t.begin(&key, None).unwrap();
        assert_eq!(t.get(&key).unwrap().status, TransferStatus::Uploading);
        assert_eq!(t.progress(&key, 5).unwrap(), 50.0);
        t.complete(&key).unwrap();
        let rec = t.get(&key).unwrap();
        assert_eq!(rec.status, TransferStatus::Completed);
        assert_eq!(rec.percent(), 100.0);
        assert_eq!(t.active_count(), 0);
    }

    #[test]
    fn terminal_records_are_never_resurrected() {
        let mut t = TransferTable::new();
        let key = t
            .offer_received(peer(), 7, "a.txt".into(), 10, Instant::now())
            .unwrap();
        t.reject(&key).unwrap();
        assert!(t.accept(&key, Instant::now()).is_err());
        assert!(t.begin(&key, None).is_err());
        assert!(t.fail(&key, "late").is_err());
        assert!(t.complete(&key).is_err());
        assert_eq!(t.get(&key).unwrap().status, TransferStatus::Rejected);
    }

    #[test]
    fn duplicate_offer_refused_while_pending() {
        let mut t = TransferTable::new();
        let now = Instant::now();
        let key = t.offer_received(peer(), 7, "a.txt".into(), 10, now).unwrap();
        assert_eq!(
            t.offer_received(peer(), 7, "b.txt".into(), 10, now),
            Err(TransferError::Duplicate(7))
        );
        // Same id from another peer is a different record.
        assert!(t
            .offer_received(PeerId::from("bbbb2222"), 7, "c.txt".into(), 1, now)
            .is_ok());
        t.fail(&key, "dropped").unwrap();
        // Reusing a finished key archives the old record and starts fresh.
        let again = t.offer_received(peer(), 7, "d.txt".into(), 3, now).unwrap();
        let rec = t.get(&again).unwrap();
        assert_eq!(rec.filename, "d.txt");
        assert_eq!(rec.status, TransferStatus::Pending);
    }

    #[test]
    fn offer_over_cap_refused() {
        let mut t = TransferTable::new();
        assert!(matches!(
            t.offer_received(peer(), 1, "x".into(), MAX_FILE_SIZE + 1, Instant::now()),
            Err(TransferError::TooLarge { .. })
        ));
        assert!(t.list().is_empty());
    }

    #[test]
    fn expired_offers_only_undecided() {
        let mut t = TransferTable::new();
        let start = Instant::now();
        let a = t.offer_received(peer(), 1, "a".into(), 1, start).unwrap();
        let b = t.offer_received(peer(), 2, "b".into(), 1, start).unwrap();
        t.accept(&b, start).unwrap();
        let later = start + Duration::from_secs(31);
        assert_eq!(t.expired_offers(later, Duration::from_secs(30)), vec![a]);
        assert!(t.expired_offers(start, Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn accepted_downloads_stall_from_acceptance() {
        let mut t = TransferTable::new();
        let start = Instant::now();
        let waiting = t.offer_received(peer(), 1, "a".into(), 1, start).unwrap();
        let started = t.offer_received(peer(), 2, "b".into(), 1, start).unwrap();
        let undecided = t.offer_received(peer(), 3, "c".into(), 1, start).unwrap();
        let accepted_at = start + Duration::from_secs(20);
        t.accept(&waiting, accepted_at).unwrap();
        t.accept(&started, accepted_at).unwrap();
        t.begin(&started, None).unwrap();

        let timeout = Duration::from_secs(30);
        assert!(t.stalled_downloads(start + Duration::from_secs(31), timeout).is_empty());
        assert_eq!(
            t.stalled_downloads(accepted_at + timeout, timeout),
            vec![waiting]
        );
        assert!(!t.stalled_downloads(accepted_at + timeout, timeout).contains(&undecided));
    }

    #[test]
    fn sanitize_strips_separators_and_symbols() {
        assert_eq!(sanitize_filename("a.txt"), "a.txt");
        assert_eq!(sanitize_filename("../../etc/passwd"), "....etcpasswd");
        assert_eq!(sanitize_filename("my report (v2)?.pdf"), "my report v2.pdf");
        assert_eq!(sanitize_filename("C:\\x\\y.doc"), "Cxy.doc");
        assert_eq!(sanitize_filename("name  "), "name");
        assert_eq!(sanitize_filename("/"), "file");
        assert_eq!(sanitize_filename(".."), "file");
    }

    #[test]
    fn stored_name_is_timestamp_prefixed() {
        let ts = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(13, 4, 5)
            .unwrap();
        assert_eq!(stored_filename(ts, "a.txt"), "20240501_130405_a.txt");
        assert_eq!(stored_filename(ts, "../a.txt"), "20240501_130405_..a.txt");
    }

    #[test]
    fn numbered_name_goes_before_extension() {
        assert_eq!(numbered_filename("20240501_130405_a.txt", 1), "20240501_130405_a_1.txt");
        assert_eq!(numbered_filename("20240501_130405_a.tar.gz", 2), "20240501_130405_a.tar_2.gz");
        assert_eq!(numbered_filename("20240501_130405_notes", 3), "20240501_130405_notes_3");
    }
}
