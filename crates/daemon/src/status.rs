//! Status store
//!
//! Last-known status and descriptive details per worker. Each entry is written
//! only by the owning worker (and merged into by the media-router poller);
//! external callers read snapshots.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Lifecycle status of a worker as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerStatus {
    #[default]
    Unknown,
    Connecting,
    Online,
    Error,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Unknown => "UNKNOWN",
            WorkerStatus::Connecting => "CONNECTING",
            WorkerStatus::Online => "ONLINE",
            WorkerStatus::Error => "ERROR",
            WorkerStatus::Offline => "OFFLINE",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status plus free-form details (resolution, bitrate, codec, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StatusRecord {
    pub status: WorkerStatus,
    #[serde(flatten)]
    pub details: BTreeMap<String, String>,
}

impl StatusRecord {
    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }
}

/// Concurrent map of worker identity to status record
///
/// Cloning is cheap and every clone shares the same entries. All operations
/// are short and self-contained; the lock is never held across an await.
#[derive(Debug, Clone, Default)]
pub struct StatusStore {
    inner: Arc<RwLock<BTreeMap<String, StatusRecord>>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status record for a worker, `UNKNOWN` if absent
    pub fn get(&self, name: &str) -> StatusRecord {
        self.inner.read().get(name).cloned().unwrap_or_default()
    }

    /// Snapshot of every record
    pub fn get_all(&self) -> BTreeMap<String, StatusRecord> {
        self.inner.read().clone()
    }

    pub fn set_status(&self, name: &str, status: WorkerStatus) {
        let mut entries = self.inner.write();
        entries.entry(name.to_string()).or_default().status = status;
    }

    /// Merge details into a worker's record, creating it if needed
    pub fn update_details<I>(&self, name: &str, details: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut entries = self.inner.write();
        entries
            .entry(name.to_string())
            .or_default()
            .details
            .extend(details);
    }

    /// Merge details only if the worker already has a record
    ///
    /// Returns whether the record existed.
    pub fn update_existing_details<I>(&self, name: &str, details: I) -> bool
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut entries = self.inner.write();
        match entries.get_mut(name) {
            Some(record) => {
                record.details.extend(details);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, name: &str) {
        self.inner.write().remove(name);
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_worker_is_unknown() {
        let store = StatusStore::new();
        let record = store.get("nope");
        assert_eq!(record.status, WorkerStatus::Unknown);
        assert!(record.details.is_empty());
    }

    #[test]
    fn test_status_and_details_merge() {
        let store = StatusStore::new();
        store.set_status("front", WorkerStatus::Connecting);
        store.update_details("front", details(&[("codec", "copy"), ("resolution", "N/A")]));
        store.update_details("front", details(&[("resolution", "1920x1080")]));
        store.set_status("front", WorkerStatus::Online);

        let record = store.get("front");
        assert_eq!(record.status, WorkerStatus::Online);
        assert_eq!(record.detail("codec"), Some("copy"));
        assert_eq!(record.detail("resolution"), Some("1920x1080"));
    }

    #[test]
    fn test_update_existing_details_does_not_create() {
        let store = StatusStore::new();
        assert!(!store.update_existing_details("ghost", details(&[("bitrate", "1")])));
        assert!(store.get_all().is_empty());

        store.set_status("real", WorkerStatus::Online);
        assert!(store.update_existing_details("real", details(&[("bitrate", "812")])));
        assert_eq!(store.get("real").detail("bitrate"), Some("812"));
    }

    #[test]
    fn test_remove_and_clones_share_state() {
        let store = StatusStore::new();
        let other = store.clone();
        store.set_status("a", WorkerStatus::Error);
        assert_eq!(other.get("a").status, WorkerStatus::Error);

        other.remove("a");
        assert_eq!(store.get("a").status, WorkerStatus::Unknown);
    }

    #[test]
    fn test_record_serializes_flat() {
        let record = StatusRecord {
            status: WorkerStatus::Online,
            details: details(&[("codec", "h264")]).into_iter().collect(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json, serde_json::json!({"status": "ONLINE", "codec": "h264"}));

        let back: StatusRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
