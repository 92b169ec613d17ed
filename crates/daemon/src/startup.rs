//! Startup checks
//!
//! Preflight checks run before any worker starts:
//! - ffmpeg is installed and reports a parseable version
//! - ffprobe is installed

use crate::config::Config;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),
}

/// Parse `<tool> -version` output and extract the major version number
///
/// Handles various version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n7.0-... ..."
/// - ffprobe: "ffprobe version 6.1.1 ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output.lines().find(|line| {
        let lower = line.to_lowercase();
        lower.contains("ffmpeg version") || lower.contains("ffprobe version")
    })?;

    let version_part = version_line
        .to_lowercase()
        .split(" version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    // Handle n-prefixed versions (e.g., "n7.0-...")
    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Run `<program> -version`, returning its stdout
fn run_version(program: &str) -> Result<String, String> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| format!("{} -version failed; is it installed and in PATH? Error: {}", program, e))?;

    if !output.status.success() {
        return Err(format!("{} -version exited with {}", program, output.status));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that ffmpeg runs, returning its major version when it can be parsed
pub fn check_ffmpeg_available(ffmpeg_path: &str) -> Result<Option<u32>, StartupError> {
    let output = run_version(ffmpeg_path).map_err(StartupError::FfmpegUnavailable)?;
    let major = parse_ffmpeg_version(&output);
    match major {
        Some(major) => info!(path = %ffmpeg_path, major, "Found ffmpeg"),
        None => warn!(
            path = %ffmpeg_path,
            first_line = %output.lines().next().unwrap_or("(empty)"),
            "Could not parse ffmpeg version"
        ),
    }
    Ok(major)
}

/// Check that ffprobe runs
pub fn check_ffprobe_available(ffprobe_path: &str) -> Result<(), StartupError> {
    run_version(ffprobe_path).map_err(StartupError::FfprobeUnavailable)?;
    info!(path = %ffprobe_path, "Found ffprobe");
    Ok(())
}

/// Run all startup checks in order
///
/// 1. ffmpeg availability
/// 2. ffprobe availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_ffmpeg_available(&cfg.manager.ffmpeg_path)?;
    check_ffprobe_available(&cfg.manager.ffprobe_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_ffmpeg_version_standard() {
        let output = "ffmpeg version 6.1.1 Copyright (c) 2000-2023 the FFmpeg developers";
        assert_eq!(parse_ffmpeg_version(output), Some(6));
    }

    #[test]
    fn test_parse_ffmpeg_version_n_prefixed() {
        let output = "ffmpeg version n7.0-12-gabcdef Copyright (c) 2000-2024";
        assert_eq!(parse_ffmpeg_version(output), Some(7));
    }

    #[test]
    fn test_parse_ffprobe_version() {
        let output = "ffprobe version 5.1.4-0+deb12u1 Copyright (c) 2007-2023";
        assert_eq!(parse_ffmpeg_version(output), Some(5));
    }

    #[test]
    fn test_parse_ffmpeg_version_multiline() {
        let output = "\nffmpeg version 8.0 Copyright (c) 2000-2025\nbuilt with gcc 13\nconfiguration: --enable-nvenc";
        assert_eq!(parse_ffmpeg_version(output), Some(8));
    }

    #[test]
    fn test_parse_ffmpeg_version_invalid() {
        assert_eq!(parse_ffmpeg_version("not ffmpeg output"), None);
        assert_eq!(parse_ffmpeg_version("ffmpeg version garbage"), None);
        assert_eq!(parse_ffmpeg_version(""), None);
    }

    #[test]
    fn test_missing_binaries_are_reported() {
        assert!(matches!(
            check_ffmpeg_available("/nonexistent/ffmpeg"),
            Err(StartupError::FfmpegUnavailable(_))
        ));
        assert!(matches!(
            check_ffprobe_available("/nonexistent/ffprobe"),
            Err(StartupError::FfprobeUnavailable(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_parse_major_version(major in 0u32..100, minor in 0u32..10, n_prefix in any::<bool>()) {
            let prefix = if n_prefix { "n" } else { "" };
            let output = format!("ffmpeg version {}{}.{} Copyright", prefix, major, minor);
            prop_assert_eq!(parse_ffmpeg_version(&output), Some(major));
        }
    }
}
