//! Peer directory: every peer ever seen, how to reach it, and whether it is online.
//! Entries are never removed, only marked offline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::protocol::{DEFAULT_CONTROL_PORT, DEFAULT_FILE_PORT};

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_file_port() -> u16 {
    DEFAULT_FILE_PORT
}

/// One known peer. Serialized as a value in `contacts.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub id: PeerId,
    pub name: String,
    pub ip: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
    #[serde(default = "default_file_port")]
    pub file_port: u16,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_online: bool,
}

/// Outcome of an upsert: whether the directory learned something new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    /// Name, address, ports or online flag changed.
    Updated,
    /// Only last-seen moved.
    Refreshed,
}

/// Peer ID → entry. The local instance keeps an entry for itself.
#[derive(Debug, Clone)]
pub struct PeerDirectory {
    local: PeerId,
    entries: HashMap<PeerId, DirectoryEntry>,
}

impl PeerDirectory {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            entries: HashMap::new(),
        }
    }

    /// Rebuild from stored entries. Nothing is connected yet, so everyone starts offline.
    pub fn from_entries(local: PeerId, entries: impl IntoIterator<Item = DirectoryEntry>) -> Self {
        let mut dir = Self::new(local);
        for mut e in entries {
            e.is_online = false;
            dir.entries.insert(e.id.clone(), e);
        }
        dir
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    /// Merge an observation keyed by peer ID; fields of `entry` overwrite what was known.
    pub fn upsert(&mut self, entry: DirectoryEntry) -> Upsert {
        match self.entries.get_mut(&entry.id) {
            None => {
                self.entries.insert(entry.id.clone(), entry);
                Upsert::Inserted
            }
            Some(existing) => {
                let changed = existing.name != entry.name
                    || existing.ip != entry.ip
                    || existing.port != entry.port
                    || existing.file_port != entry.file_port
                    || existing.is_online != entry.is_online;
                *existing = entry;
                if changed {
                    Upsert::Updated
                } else {
                    Upsert::Refreshed
                }
            }
        }
    }

    pub fn lookup(&self, id: &PeerId) -> Option<&DirectoryEntry> {
        self.entries.get(id)
    }

    /// Record activity from a peer: last-seen now, online. Returns false for unknown peers.
    pub fn touch(&mut self, id: &PeerId, now: DateTime<Utc>) -> bool {
        match self.entries.get_mut(id) {
            Some(e) => {
                e.last_seen = Some(now);
                e.is_online = true;
                true
            }
            None => false,
        }
    }

    /// Returns true if the peer was known and online.
    pub fn mark_offline(&mut self, id: &PeerId) -> bool {
        match self.entries.get_mut(id) {
            Some(e) if e.is_online => {
                e.is_online = false;
                true
            }
            _ => false,
        }
    }

    /// All entries including self, in no particular order.
    pub fn list_all(&self) -> Vec<&DirectoryEntry> {
        self.entries.values().collect()
    }

    /// Owned copy of every entry, for persistence.
    pub fn snapshot(&self) -> Vec<DirectoryEntry> {
        let mut out: Vec<DirectoryEntry> = self.entries.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Everyone except self: online first, then by name.
    pub fn contacts(&self) -> Vec<&DirectoryEntry> {
        let mut out: Vec<&DirectoryEntry> = self
            .entries
            .values()
            .filter(|e| e.id != self.local)
            .collect();
        out.sort_by(|a, b| {
            b.is_online
                .cmp(&a.is_online)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// Case-insensitive substring match on name or ID, excluding self. Same order as `contacts`.
    pub fn search(&self, term: &str) -> Vec<&DirectoryEntry> {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return self.contacts();
        }
        self.contacts()
            .into_iter()
            .filter(|e| {
                e.name.to_lowercase().contains(&term) || e.id.as_str().to_lowercase().contains(&term)
            })
            .collect()
    }

    /// (online, offline) counts over contacts.
    pub fn counts(&self) -> (usize, usize) {
        let contacts = self.contacts();
        let online = contacts.iter().filter(|e| e.is_online).count();
        (online, contacts.len() - online)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, name: &str, online: bool) -> DirectoryEntry {
        DirectoryEntry {
            id: PeerId::from(id),
            name: name.into(),
            ip: "10.0.0.5".into(),
            port: DEFAULT_CONTROL_PORT,
            file_port: DEFAULT_FILE_PORT,
            last_seen: None,
            is_online: online,
        }
    }

    #[test]
    fn upsert_merges_by_id() {
        let mut dir = PeerDirectory::new(PeerId::from("self0000"));
        assert_eq!(dir.upsert(entry("aaaa1111", "Alice", true)), Upsert::Inserted);
        assert_eq!(dir.upsert(entry("aaaa1111", "Alice", true)), Upsert::Refreshed);
        let mut moved = entry("aaaa1111", "Alice", true);
        moved.ip = "10.0.0.9".into();
        assert_eq!(dir.upsert(moved), Upsert::Updated);
        assert_eq!(dir.list_all().len(), 1);
        assert_eq!(dir.lookup(&PeerId::from("aaaa1111")).unwrap().ip, "10.0.0.9");
    }

    #[test]
    fn mark_offline_keeps_entry() {
        let mut dir = PeerDirectory::new(PeerId::from("self0000"));
        dir.upsert(entry("aaaa1111", "Alice", true));
        assert!(dir.mark_offline(&PeerId::from("aaaa1111")));
        assert!(!dir.mark_offline(&PeerId::from("aaaa1111")));
        let e = dir.lookup(&PeerId::from("aaaa1111")).unwrap();
        assert!(!e.is_online);
        assert!(!dir.mark_offline(&PeerId::from("missing0")));
    }

    #[test]
    fn touch_sets_last_seen_and_online() {
        let mut dir = PeerDirectory::new(PeerId::from("self0000"));
        dir.upsert(entry("aaaa1111", "Alice", false));
        let now = Utc::now();
        assert!(dir.touch(&PeerId::from("aaaa1111"), now));
        let e = dir.lookup(&PeerId::from("aaaa1111")).unwrap();
        assert!(e.is_online);
        assert_eq!(e.last_seen, Some(now));
        assert!(!dir.touch(&PeerId::from("nobody00"), now));
    }

    #[test]
    fn loaded_entries_start_offline() {
        let dir = PeerDirectory::from_entries(
            PeerId::from("self0000"),
            vec![entry("aaaa1111", "Alice", true)],
        );
        assert!(!dir.lookup(&PeerId::from("aaaa1111")).unwrap().is_online);
    }

    #[test]
    fn contacts_online_first_without_self() {
        let mut dir = PeerDirectory::new(PeerId::from("self0000"));
        dir.upsert(entry("self0000", "Me", true));
        dir.upsert(entry("cccc3333", "carol", false));
        dir.upsert(entry("bbbb2222", "Bob", true));
        dir.upsert(entry("aaaa1111", "Alice", false));
        let names: Vec<&str> = dir.contacts().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Bob", "Alice", "carol"]);
        assert_eq!(dir.counts(), (1, 2));
    }

    #[test]
    fn search_by_name_or_id() {
        let mut dir = PeerDirectory::new(PeerId::from("self0000"));
        dir.upsert(entry("self0000", "Alicia (me)", true));
        dir.upsert(entry("aaaa1111", "Alice", true));
        dir.upsert(entry("bbbb2222", "Bob", false));
        let hits: Vec<&str> = dir.search("ALI").iter().map(|e| e.id.as_str()).collect();
        assert_eq!(hits, vec!["aaaa1111"]);
        let hits: Vec<&str> = dir.search("2222").iter().map(|e| e.id.as_str()).collect();
        assert_eq!(hits, vec!["bbbb2222"]);
        assert!(dir.search("zed").is_empty());
        assert_eq!(dir.search("  ").len(), 2);
    }
}
