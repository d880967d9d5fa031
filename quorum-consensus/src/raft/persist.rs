use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use quorum_common::error::{QuorumError, Result};
use quorum_common::types::{NodeId, Term};
use serde::{Deserialize, Serialize};

use super::log::RaftLog;

/// Layout version written at the front of every saved blob.
pub const FORMAT_VERSION: u32 = 1;

/// The durable part of a replica: everything that must survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: Vec<(Term, Bytes)>, // Index is implicit: position + 1
}

#[derive(Serialize, Deserialize)]
struct Versioned<T> {
    version: u32,
    state: T,
}

#[derive(Serialize)]
struct VersionedRef<'a> {
    version: u32,
    state: &'a PersistentState,
}

impl PersistentState {
    pub fn capture(current_term: Term, voted_for: Option<NodeId>, log: &RaftLog) -> Self {
        Self {
            current_term,
            voted_for,
            log: log.iter().map(|e| (e.term, e.command.clone())).collect(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let blob = VersionedRef {
            version: FORMAT_VERSION,
            state: self,
        };
        Ok(bincode::serialize(&blob)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        // The version is always the leading u32, whatever follows it.
        let version: u32 = bincode::deserialize(bytes)?;
        if version != FORMAT_VERSION {
            return Err(QuorumError::UnsupportedFormat(version));
        }
        let blob: Versioned<PersistentState> = bincode::deserialize(bytes)?;
        Ok(blob.state)
    }

    pub fn into_log(self) -> RaftLog {
        RaftLog::from_terms_and_commands(self.log)
    }
}

/// An opaque durable byte store. `save` returns only once the blob is durable.
pub trait Persister: Send + Sync {
    fn save(&self, blob: &[u8]) -> Result<()>;
    fn load(&self) -> Result<Option<Vec<u8>>>;
}

/// Keeps the blob in shared memory. Clones share the same bytes, so a test
/// can drop a replica and restart it from what it last saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersister {
    blob: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemoryPersister {
    fn save(&self, blob: &[u8]) -> Result<()> {
        let mut slot = self
            .blob
            .lock()
            .map_err(|_| QuorumError::Io(std::io::Error::other("persister lock poisoned")))?;
        *slot = Some(blob.to_vec());
        Ok(())
    }

    fn load(&self) -> Result<Option<Vec<u8>>> {
        let slot = self
            .blob
            .lock()
            .map_err(|_| QuorumError::Io(std::io::Error::other("persister lock poisoned")))?;
        Ok(slot.clone())
    }
}

/// Saves the blob as a binary file, replacing it atomically.
pub struct FilePersister {
    pub path: PathBuf,
}

impl FilePersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }
}

impl Persister for FilePersister {
    fn save(&self, blob: &[u8]) -> Result<()> {
        let temp = self.temp_path();
        let mut file = File::create(&temp)?;
        file.write_all(blob)?;
        file.sync_all()?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<Vec<u8>>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&self.path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> PersistentState {
        PersistentState {
            current_term: 3,
            voted_for: Some(2),
            log: vec![(1, Bytes::from_static(b"a")), (3, Bytes::from_static(b"b"))],
        }
    }

    #[test]
    fn test_file_persister_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersister::new(dir.path().join("raft-state.bin"));
        assert!(store.load().unwrap().is_none());

        let state = sample_state();
        store.save(&state.encode().unwrap()).expect("Failed to save state");
        let loaded = store.load().expect("Failed to load state").unwrap();

        assert_eq!(PersistentState::decode(&loaded).unwrap(), state);
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_memory_persister_clones_share_bytes() {
        let store = MemoryPersister::new();
        let survivor = store.clone();
        store.save(b"blob").unwrap();
        drop(store);

        assert_eq!(survivor.load().unwrap(), Some(b"blob".to_vec()));
    }

    #[test]
    fn test_restored_log_has_contiguous_indices() {
        let log = sample_state().into_log();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.get(2).unwrap().term, 3);
        assert_eq!(log.get(2).unwrap().index, 2);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let bytes = bincode::serialize(&Versioned {
            version: 99,
            state: sample_state(),
        })
        .unwrap();

        assert!(matches!(
            PersistentState::decode(&bytes),
            Err(QuorumError::UnsupportedFormat(99))
        ));
    }
}
