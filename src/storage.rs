//! load/save hooks for transcripts. the accumulator never touches ambient
//! storage itself; callers inject one of these.

use crate::error::ChatError;
use crate::session::Turn;
use std::sync::{Arc, Mutex};

pub trait TranscriptStore: Send + Sync {
    fn load(&self) -> Result<Vec<Turn>, ChatError>;
    fn save(&self, transcript: &[Turn]) -> Result<(), ChatError>;
}

/// in-process store; clones share the same slot.
#[derive(Clone, Default)]
pub struct MemoryStore {
    slot: Arc<Mutex<Vec<Turn>>>,
}

impl MemoryStore {
    pub fn new(initial: Vec<Turn>) -> Self {
        Self { slot: Arc::new(Mutex::new(initial)) }
    }

    pub fn snapshot(&self) -> Vec<Turn> {
        self.slot.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl TranscriptStore for MemoryStore {
    fn load(&self) -> Result<Vec<Turn>, ChatError> {
        self.slot
            .lock()
            .map(|g| g.clone())
            .map_err(|e| ChatError::Storage(e.to_string()))
    }

    fn save(&self, transcript: &[Turn]) -> Result<(), ChatError> {
        let mut g = self.slot.lock().map_err(|e| ChatError::Storage(e.to_string()))?;
        *g = transcript.to_vec();
        Ok(())
    }
}

/// transcript kept as a json array on disk. a missing file loads as empty.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: std::path::PathBuf,
}

#[cfg(not(target_arch = "wasm32"))]
impl JsonFileStore {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl TranscriptStore for JsonFileStore {
    fn load(&self) -> Result<Vec<Turn>, ChatError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, transcript: &[Turn]) -> Result<(), ChatError> {
        let json = serde_json::to_vec_pretty(transcript)?;
        // write-then-rename so a crash never leaves half a file behind
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn memory_store_shares_between_clones() {
        let a = MemoryStore::default();
        let b = a.clone();
        a.save(&[Turn::user("hi")]).unwrap();
        assert_eq!(b.load().unwrap(), vec![Turn::user("hi")]);
    }

    #[test]
    fn file_store_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("history.json"));
        assert!(store.load().unwrap().is_empty());

        let turns = vec![Turn::user("q"), Turn::assistant("a")];
        store.save(&turns).unwrap();
        assert_eq!(store.load().unwrap(), turns);
    }

    #[test]
    fn file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(JsonFileStore::new(path).load(), Err(ChatError::Serde(_))));
    }
}
