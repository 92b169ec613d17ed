//! Config file watcher
//!
//! Polls the configuration file's modification stamp and triggers a
//! reconciliation pass whenever it changes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::reconcile::WorkerManager;

/// Identity of one version of a file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

impl FileStamp {
    /// Read the current stamp, `None` if the file cannot be inspected.
    pub async fn read(path: &Path) -> Option<FileStamp> {
        let metadata = tokio::fs::metadata(path).await.ok()?;
        Some(FileStamp {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        })
    }
}

/// Decide whether a file changed between two observations.
///
/// A file that disappears is not a change; editors often replace files by
/// removing and rewriting them, and the rewrite is picked up on a later
/// poll. A file that appears is.
#[inline]
pub fn has_changed(previous: Option<FileStamp>, current: Option<FileStamp>) -> bool {
    match (previous, current) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(prev), Some(cur)) => prev != cur,
    }
}

/// Watch `path` every `interval` and reconcile on change until cancelled.
pub async fn watch_config(
    path: PathBuf,
    manager: Arc<WorkerManager>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut last = FileStamp::read(&path).await;
    info!(path = %path.display(), "Watching configuration file");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(interval) => {}
        }

        let current = FileStamp::read(&path).await;
        if !has_changed(last, current) {
            continue;
        }
        last = current;

        info!(path = %path.display(), "Configuration file changed, reconciling");
        match manager.reconcile_from_file(&path).await {
            Ok(report) => debug!(?report, "Reconciliation finished"),
            Err(e) => error!(error = %e, "Reconciliation aborted, running workers left unchanged"),
        }
    }

    debug!("Configuration watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;
    use crate::status::StatusStore;
    use crate::supervisor::tests::{wait_until, ScriptedLauncher};
    use crate::supervisor::{SupervisorContext, SupervisorSettings};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn stamp(secs: u64, len: u64) -> Option<FileStamp> {
        Some(FileStamp {
            modified: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)),
            len,
        })
    }

    #[test]
    fn test_has_changed() {
        assert!(!has_changed(stamp(1, 10), stamp(1, 10)));
        assert!(has_changed(stamp(1, 10), stamp(2, 10)));
        assert!(has_changed(stamp(1, 10), stamp(1, 11)));
        assert!(has_changed(None, stamp(1, 10)));
        assert!(!has_changed(stamp(1, 10), None));
        assert!(!has_changed(None, None));
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(FileStamp::read(&dir.path().join("absent.toml")).await.is_none());
    }

    #[tokio::test]
    async fn test_change_triggers_reconcile() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();

        let ctx = SupervisorContext {
            status: StatusStore::new(),
            state: Arc::new(StateStore::in_memory()),
            launcher: Arc::new(ScriptedLauncher::running()),
            settings: SupervisorSettings::default(),
        };
        let manager = Arc::new(WorkerManager::new(ctx, Duration::from_secs(2)));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(watch_config(
            path.clone(),
            manager.clone(),
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        // Let the watcher take its first stamp. Length changes even when
        // mtime granularity is coarse.
        sleep(Duration::from_millis(100)).await;
        std::fs::write(&path, "[[sources]]\nname = \"front\"\naddress = \"10.0.0.2\"\n").unwrap();

        let mut running = Vec::new();
        for _ in 0..500 {
            running = manager.running_names().await;
            if !running.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(running, vec!["front".to_string()]);

        shutdown.cancel();
        task.await.unwrap();
        manager.shutdown().await;
        wait_until(|| manager.get_all_statuses().is_empty()).await;
    }

    proptest! {
        #[test]
        fn prop_identical_stamps_never_change(secs in 0u64..1_000_000, len in 0u64..1_000_000) {
            prop_assert!(!has_changed(stamp(secs, len), stamp(secs, len)));
        }
    }
}
