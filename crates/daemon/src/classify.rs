//! Exit classification for pipeline processes.
//!
//! Decides what the supervisor does after its process ends: fall back to
//! software, back off and retry, or nothing at all when the exit was
//! requested. Hardware failure detection is a substring heuristic on the
//! captured diagnostic output and will miss some failures; those take the
//! generic retry path.

use crate::process::ProcessExit;

/// Substrings in diagnostic output that point at the hardware codec path.
pub const HWACCEL_FAILURE_MARKERS: &[&str] = &["cuda", "cuvid", "nvenc"];

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// The supervisor asked the process to stop.
    Requested,
    /// Zero exit nobody asked for, usually the upstream source ended.
    CleanExit,
    /// Non-zero exit with hardware acceleration active and a matching marker.
    HwAccelFailure { marker: &'static str },
    /// Any other non-zero or signal exit.
    Crashed { code: Option<i32> },
}

impl ExitClass {
    /// Whether the next run should start without a backoff delay.
    pub fn retry_immediately(&self) -> bool {
        matches!(self, ExitClass::HwAccelFailure { .. })
    }
}

impl std::fmt::Display for ExitClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitClass::Requested => write!(f, "requested"),
            ExitClass::CleanExit => write!(f, "clean_exit"),
            ExitClass::HwAccelFailure { marker } => write!(f, "hwaccel_failure({})", marker),
            ExitClass::Crashed { code: Some(code) } => write!(f, "crashed(code {})", code),
            ExitClass::Crashed { code: None } => write!(f, "crashed(signal)"),
        }
    }
}

/// Find the first hardware failure marker in `diagnostics`, ignoring case.
pub fn detect_hwaccel_failure(diagnostics: &str) -> Option<&'static str> {
    let lowered = diagnostics.to_lowercase();
    HWACCEL_FAILURE_MARKERS
        .iter()
        .copied()
        .find(|marker| lowered.contains(marker))
}

/// Classify a finished run.
///
/// A stop request always wins, so intentional shutdowns never surface as
/// errors even if the process crashed on the way out.
pub fn classify_exit(exit: &ProcessExit, hwaccel_active: bool, stop_requested: bool) -> ExitClass {
    if stop_requested {
        return ExitClass::Requested;
    }

    if exit.success() {
        return ExitClass::CleanExit;
    }

    if hwaccel_active {
        if let Some(marker) = detect_hwaccel_failure(&exit.stderr) {
            return ExitClass::HwAccelFailure { marker };
        }
    }

    ExitClass::Crashed { code: exit.code }
}
