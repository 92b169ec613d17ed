//! Source probing with ffprobe
//!
//! Best-effort discovery of a camera's native resolution before each run.
//! Failures are reported as [`ProbeError`] and callers fall back to
//! [`RESOLUTION_UNKNOWN`].

use ffprobe_json::FfprobeOutput;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Placeholder used when the resolution cannot be determined
pub const RESOLUTION_UNKNOWN: &str = "N/A";

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe ran but reported failure.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// No video stream with dimensions in the output.
    #[error("No video stream with a resolution found")]
    NoVideoStream,

    /// ffprobe did not finish in time.
    #[error("ffprobe timed out after {0:?}")]
    Timeout(Duration),

    /// IO error launching ffprobe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
    }
}

/// Extract `WIDTHxHEIGHT` of the first video stream from ffprobe JSON.
pub fn parse_resolution(json_str: &str) -> Result<String, ProbeError> {
    let output: FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    output
        .streams
        .unwrap_or_default()
        .into_iter()
        .filter(|s| s.codec_type.as_deref() == Some("video"))
        .find_map(|s| match (s.width, s.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(format!("{}x{}", w, h)),
            _ => None,
        })
        .ok_or(ProbeError::NoVideoStream)
}

/// Arguments for probing an RTSP source, excluding the program
pub fn probe_args(input_url: &str) -> Vec<String> {
    [
        "-rtsp_transport",
        "tcp",
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_streams",
        input_url,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Probe an RTSP source for its resolution.
///
/// Runs `ffprobe -rtsp_transport tcp -v quiet -print_format json -show_streams <url>`
/// and gives up after `timeout`; the child is killed when the wait is abandoned.
pub async fn probe_resolution(
    ffprobe_path: &str,
    input_url: &str,
    timeout: Duration,
) -> Result<String, ProbeError> {
    let child = Command::new(ffprobe_path)
        .args(probe_args(input_url))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    parse_resolution(&String::from_utf8_lossy(&output.stdout))
}
