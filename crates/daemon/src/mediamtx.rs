//! Media router poller
//!
//! Periodically lists published paths from the MediaMTX API and merges the
//! observed resolution and bitrate into the status of running workers.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::reconcile::WorkerManager;

/// Per-request timeout for the path list
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Suffixes checked for each worker, in order
const PATH_SUFFIXES: [&str; 3] = ["", "_part1", "_part2"];

#[derive(Debug, Error)]
pub enum PollError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unexpected status {0}")]
    Status(reqwest::StatusCode),
}

/// `GET /v2/paths/list` response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathList {
    #[serde(default)]
    pub items: Vec<PathItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathItem {
    pub name: String,
    #[serde(default)]
    pub bytes_per_second: Option<f64>,
    #[serde(default)]
    pub medias: Vec<Media>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Media {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Details observed for one worker
///
/// The first existing path among `<name>`, `<name>_part1` and `<name>_part2`
/// is used. `bitrate` is in kbit/s and reads `0` when nothing is published;
/// `resolution` is only reported when the router knows it.
pub fn extract_stream_details(
    paths: &HashMap<&str, &PathItem>,
    camera: &str,
) -> BTreeMap<String, String> {
    let mut details = BTreeMap::new();
    let mut bitrate = 0;

    let found = PATH_SUFFIXES
        .iter()
        .find_map(|suffix| paths.get(format!("{}{}", camera, suffix).as_str()));

    if let Some(path) = found {
        if let Some(video) = path.medias.iter().find(|m| m.kind == "video") {
            if let (Some(w), Some(h)) = (video.width, video.height) {
                details.insert("resolution".to_string(), format!("{}x{}", w, h));
            }
            if let Some(bytes) = path.bytes_per_second {
                bitrate = (bytes * 8.0 / 1000.0).round() as u64;
            }
        }
    }

    details.insert("bitrate".to_string(), bitrate.to_string());
    details
}

/// Fetch the current path list
pub async fn fetch_paths(client: &reqwest::Client, api_url: &str) -> Result<PathList, PollError> {
    let response = client.get(api_url).send().await?;
    if !response.status().is_success() {
        return Err(PollError::Status(response.status()));
    }
    Ok(response.json().await?)
}

/// Merge one path list into the status of every running worker
///
/// Workers without a status entry are skipped so a poll racing a stop never
/// resurrects a removed record.
pub async fn apply_paths(manager: &WorkerManager, list: &PathList) {
    let by_name: HashMap<&str, &PathItem> =
        list.items.iter().map(|p| (p.name.as_str(), p)).collect();

    for camera in manager.running_names().await {
        let details = extract_stream_details(&by_name, &camera);
        manager
            .context()
            .status
            .update_existing_details(&camera, details);
    }
}

/// Poll `api_url` every `interval` until cancelled
pub async fn poll_mediamtx(
    manager: Arc<WorkerManager>,
    api_url: String,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let client = match reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to create MediaMTX client, poller disabled");
            return;
        }
    };

    loop {
        match fetch_paths(&client, &api_url).await {
            Ok(list) => apply_paths(&manager, &list).await,
            Err(e) => debug!(error = %e, url = %api_url, "Could not reach MediaMTX API"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    debug!("MediaMTX poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::state::StateStore;
    use crate::status::{StatusStore, WorkerStatus};
    use crate::supervisor::tests::{wait_until, ScriptedLauncher};
    use crate::supervisor::{SupervisorContext, SupervisorSettings};

    const SAMPLE: &str = r#"{
        "itemCount": 3,
        "items": [
            {
                "name": "garage",
                "bytesPerSecond": 101500,
                "medias": [
                    {"type": "video", "width": 1920, "height": 1080},
                    {"type": "audio"}
                ]
            },
            {
                "name": "yard_part1",
                "bytesPerSecond": 50000,
                "medias": [{"type": "video", "width": 1280, "height": 1440}]
            },
            {
                "name": "yard_part2",
                "bytesPerSecond": 90000,
                "medias": [{"type": "video", "width": 1280, "height": 1440}]
            },
            {"name": "idle"}
        ]
    }"#;

    fn details_for(camera: &str) -> BTreeMap<String, String> {
        let list: PathList = serde_json::from_str(SAMPLE).unwrap();
        let by_name: HashMap<&str, &PathItem> =
            list.items.iter().map(|p| (p.name.as_str(), p)).collect();
        extract_stream_details(&by_name, camera)
    }

    #[test]
    fn test_plain_stream_details() {
        let details = details_for("garage");
        assert_eq!(details["resolution"], "1920x1080");
        assert_eq!(details["bitrate"], "812");
    }

    #[test]
    fn test_split_stream_uses_first_part() {
        let details = details_for("yard");
        assert_eq!(details["resolution"], "1280x1440");
        assert_eq!(details["bitrate"], "400");
    }

    #[test]
    fn test_path_without_video_reports_zero() {
        let details = details_for("idle");
        assert_eq!(details["bitrate"], "0");
        assert!(!details.contains_key("resolution"));
    }

    #[test]
    fn test_unpublished_camera_reports_zero() {
        let details = details_for("nowhere");
        assert_eq!(details.len(), 1);
        assert_eq!(details["bitrate"], "0");
    }

    #[test]
    fn test_empty_document_parses() {
        let list: PathList = serde_json::from_str("{}").unwrap();
        assert!(list.items.is_empty());
    }

    #[tokio::test]
    async fn test_apply_merges_into_running_workers_only() {
        let ctx = SupervisorContext {
            status: StatusStore::new(),
            state: Arc::new(StateStore::in_memory()),
            launcher: Arc::new(ScriptedLauncher::running()),
            settings: SupervisorSettings::default(),
        };
        let manager = WorkerManager::new(ctx, Duration::from_secs(2));
        manager
            .start_worker(SourceConfig::new("garage", "10.0.0.4"), None)
            .await;
        wait_until(|| manager.get_status("garage").status == WorkerStatus::Online).await;

        let list: PathList = serde_json::from_str(SAMPLE).unwrap();
        apply_paths(&manager, &list).await;

        let record = manager.get_status("garage");
        assert_eq!(record.status, WorkerStatus::Online);
        assert_eq!(record.detail("bitrate"), Some("812"));
        assert_eq!(record.detail("resolution"), Some("1920x1080"));
        assert!(!manager.get_all_statuses().contains_key("yard"));
        manager.shutdown().await;
    }
}
