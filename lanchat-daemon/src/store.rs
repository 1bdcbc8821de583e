//! Durable key-value store: local identity/settings and the peer directory, as JSON files in
//! the data directory. Every write goes to a temp file first and is renamed into place.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use lanchat_core::{DirectoryEntry, PeerId};
use serde::{Deserialize, Serialize};

const SETTINGS_FILE: &str = "settings.json";
const CONTACTS_FILE: &str = "contacts.json";

/// Persisted local identity. The ID is generated once and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub username: String,
    pub user_id: PeerId,
    #[serde(default)]
    pub user_ip: Option<String>,
    pub port: u16,
    pub file_port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    /// Use `dir` for storage, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load_settings(&self) -> Result<Option<Settings>, StoreError> {
        self.read_json(SETTINGS_FILE)
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        self.write_json(SETTINGS_FILE, settings)
    }

    /// Stored directory entries. A missing file is an empty directory.
    pub fn load_directory(&self) -> Result<Vec<DirectoryEntry>, StoreError> {
        let map: Option<BTreeMap<PeerId, DirectoryEntry>> = self.read_json(CONTACTS_FILE)?;
        Ok(map.map(|m| m.into_values().collect()).unwrap_or_default())
    }

    /// Write the directory as a map keyed by peer ID.
    pub fn save_directory(&self, entries: &[DirectoryEntry]) -> Result<(), StoreError> {
        let map: BTreeMap<&PeerId, &DirectoryEntry> = entries.iter().map(|e| (&e.id, e)).collect();
        self.write_json(CONTACTS_FILE, &map)
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let path = self.dir.join(name);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Json { path, source })
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let path = self.dir.join(name);
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        let tmp = self.dir.join(format!(".{}.tmp", name));
        std::fs::write(&tmp, &bytes).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> DirectoryEntry {
        DirectoryEntry {
            id: PeerId::from(id),
            name: format!("peer {}", id),
            ip: "192.168.1.20".into(),
            port: 12345,
            file_port: 12346,
            last_seen: Some(chrono::Utc::now()),
            is_online: true,
        }
    }

    #[test]
    fn missing_files_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("nested")).unwrap();
        assert!(store.load_settings().unwrap().is_none());
        assert!(store.load_directory().unwrap().is_empty());
    }

    #[test]
    fn settings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            username: "Alice".into(),
            user_id: PeerId::from("aaaa1111"),
            user_ip: Some("10.0.0.5".into()),
            port: 12345,
            file_port: 12346,
        };
        Store::open(dir.path()).unwrap().save_settings(&settings).unwrap();
        let loaded = Store::open(dir.path()).unwrap().load_settings().unwrap();
        assert_eq!(loaded, Some(settings));
    }

    #[test]
    fn directory_stored_as_map_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .save_directory(&[entry("bbbb2222"), entry("aaaa1111")])
            .unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(CONTACTS_FILE)).unwrap())
                .unwrap();
        assert_eq!(raw["aaaa1111"]["ip"], "192.168.1.20");
        let mut loaded = store.load_directory().unwrap();
        loaded.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, PeerId::from("aaaa1111"));
        assert!(!dir.path().join(".contacts.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), b"not json").unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(matches!(store.load_settings(), Err(StoreError::Json { .. })));
    }
}
