//! Persistent worker state
//!
//! Small per-worker recovery records (hardware availability and fallback
//! time) kept in a single JSON document. The whole document is rewritten on
//! every change and read once at startup.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors from loading or persisting worker state
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to read state file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("Failed to parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to write state file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Recovery state of one worker
///
/// `fallback_timestamp` is set exactly when `hwaccel_available` is false.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub hwaccel_available: bool,
    /// Unix epoch seconds at which the worker fell back to software
    pub fallback_timestamp: Option<f64>,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            hwaccel_available: true,
            fallback_timestamp: None,
        }
    }
}

impl WorkerState {
    /// State after a hardware failure at `now`
    pub fn fallen_back(now: f64) -> Self {
        Self {
            hwaccel_available: false,
            fallback_timestamp: Some(now),
        }
    }

    pub fn in_fallback(&self) -> bool {
        self.fallback_timestamp.is_some()
    }

    /// Whether enough time has passed since the fallback to retry hardware
    pub fn reprobe_due(&self, now: f64, retry_after_secs: u64) -> bool {
        match self.fallback_timestamp {
            Some(at) => now - at >= retry_after_secs as f64,
            None => false,
        }
    }
}

/// Current time as fractional Unix epoch seconds
pub fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

struct Records {
    entries: BTreeMap<String, WorkerState>,
    generation: u64,
}

/// Durable map of worker identity to [`WorkerState`]
///
/// Mutations update the in-memory map under a short lock, then the document
/// is written under a separate file lock so readers never wait on disk I/O.
/// A write is skipped when a newer generation has already been persisted.
pub struct StateStore {
    path: Option<PathBuf>,
    records: Mutex<Records>,
    written_generation: Mutex<u64>,
}

pub type SharedStateStore = Arc<StateStore>;

impl StateStore {
    /// Load the store from `path`; a missing file yields an empty store
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StateError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|source| StateError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StateError::Read { path, source }),
        };

        Ok(Self::with_entries(Some(path), entries))
    }

    /// Store that never touches disk
    pub fn in_memory() -> Self {
        Self::with_entries(None, BTreeMap::new())
    }

    fn with_entries(path: Option<PathBuf>, entries: BTreeMap<String, WorkerState>) -> Self {
        Self {
            path,
            records: Mutex::new(Records {
                entries,
                generation: 0,
            }),
            written_generation: Mutex::new(0),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<WorkerState> {
        self.records.lock().entries.get(name).copied()
    }

    /// Stored state, or defaults when the worker has no record
    pub fn get_or_default(&self, name: &str) -> WorkerState {
        self.get(name).unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, WorkerState> {
        self.records.lock().entries.clone()
    }

    /// Insert or replace a worker's state and persist
    pub fn put(&self, name: &str, state: WorkerState) -> Result<(), StateError> {
        self.mutate(|entries| {
            entries.insert(name.to_string(), state);
        })
    }

    /// Delete a worker's state and persist. Missing records are not an error.
    pub fn remove(&self, name: &str) -> Result<(), StateError> {
        self.mutate(|entries| {
            entries.remove(name);
        })
    }

    /// Rewrite the document with the current contents
    pub fn flush(&self) -> Result<(), StateError> {
        self.mutate(|_| {})
    }

    fn mutate<F>(&self, apply: F) -> Result<(), StateError>
    where
        F: FnOnce(&mut BTreeMap<String, WorkerState>),
    {
        let (generation, document) = {
            let mut records = self.records.lock();
            apply(&mut records.entries);
            records.generation += 1;
            let document = match self.path {
                Some(_) => Some(serde_json::to_string_pretty(&records.entries)?),
                None => None,
            };
            (records.generation, document)
        };

        let (Some(path), Some(document)) = (self.path.as_deref(), document) else {
            return Ok(());
        };

        let mut written = self.written_generation.lock();
        if *written >= generation {
            return Ok(());
        }
        write_atomically(path, &document).map_err(|source| StateError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        *written = generation;
        Ok(())
    }
}

/// Write to a sibling temp file, then rename over the target
fn write_atomically(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_state_has_hardware() {
        let state = WorkerState::default();
        assert!(state.hwaccel_available);
        assert!(!state.in_fallback());
    }

    #[test]
    fn test_fallback_invariant() {
        let state = WorkerState::fallen_back(1_000.0);
        assert!(!state.hwaccel_available);
        assert_eq!(state.fallback_timestamp, Some(1_000.0));
        assert!(state.in_fallback());
    }

    #[test]
    fn test_reprobe_due() {
        let state = WorkerState::fallen_back(1_000.0);
        assert!(!state.reprobe_due(1_599.0, 600));
        assert!(state.reprobe_due(1_600.0, 600));
        assert!(state.reprobe_due(5_000.0, 600));
        assert!(!WorkerState::default().reprobe_due(5_000.0, 600));
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load(dir.path().join("state.json")).unwrap();
        assert!(store.snapshot().is_empty());
        assert_eq!(store.get_or_default("x"), WorkerState::default());
    }

    #[test]
    fn test_put_persists_whole_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = StateStore::load(&path).unwrap();

        store.put("front", WorkerState::fallen_back(42.5)).unwrap();
        store.put("back", WorkerState::default()).unwrap();

        let reloaded = StateStore::load(&path).unwrap();
        assert_eq!(reloaded.get("front"), Some(WorkerState::fallen_back(42.5)));
        assert_eq!(reloaded.get("back"), Some(WorkerState::default()));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_remove_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::load(&path).unwrap();
        store.put("front", WorkerState::default()).unwrap();
        store.remove("front").unwrap();
        store.remove("never-existed").unwrap();

        let reloaded = StateStore::load(&path).unwrap();
        assert!(reloaded.get("front").is_none());
    }

    #[test]
    fn test_reads_null_timestamp_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{"cam1": {"hwaccel_available": true, "fallback_timestamp": null},
                "cam2": {"hwaccel_available": false, "fallback_timestamp": 1700000000.25}}"#,
        )
        .unwrap();

        let store = StateStore::load(&path).unwrap();
        assert_eq!(store.get("cam1"), Some(WorkerState::default()));
        assert_eq!(
            store.get("cam2"),
            Some(WorkerState::fallen_back(1_700_000_000.25))
        );
    }

    #[test]
    fn test_corrupt_document_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            StateStore::load(&path),
            Err(StateError::Parse { .. })
        ));
    }

    #[test]
    fn test_in_memory_store_never_writes() {
        let store = StateStore::in_memory();
        store.put("a", WorkerState::fallen_back(1.0)).unwrap();
        assert!(store.path().is_none());
        assert_eq!(store.get("a"), Some(WorkerState::fallen_back(1.0)));
    }

    #[test]
    fn test_concurrent_puts_leave_consistent_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = Arc::new(StateStore::load(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..20 {
                        let name = format!("cam{}", i);
                        store.put(&name, WorkerState::fallen_back(j as f64)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reloaded = StateStore::load(&path).unwrap();
        assert_eq!(reloaded.snapshot(), store.snapshot());
        assert_eq!(reloaded.snapshot().len(), 8);
    }
}
