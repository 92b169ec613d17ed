//! Worker supervision
//!
//! One [`WorkerSupervisor`] owns one source's pipeline for its whole life:
//! it compiles a command for the current acceleration state, launches it,
//! watches it, and decides between a software fallback, a delayed restart,
//! or stopping for good when its cancellation token fires.

use crate::classify::{classify_exit, ExitClass};
use crate::config::{ManagerConfig, SourceConfig};
use crate::encode::{build_ffmpeg_command, input_url, redact_arg, sanitized_command_line};
use crate::probe::RESOLUTION_UNKNOWN;
use crate::process::{shutdown_process, PipelineLauncher, ProcessError};
use crate::state::{epoch_secs, SharedStateStore, WorkerState};
use crate::status::{StatusStore, WorkerStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lines of diagnostic output included when logging a crash
const STDERR_TAIL_LINES: usize = 5;

/// Timing policy shared by all workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Delay before restarting after a crash or unexpected exit
    pub restart_delay: Duration,
    /// Seconds spent in software fallback before hardware is tried again
    pub fallback_retry_secs: u64,
    /// How long a stopping pipeline gets to quit before it is killed
    pub kill_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(15),
            fallback_retry_secs: 600,
            kill_timeout: Duration::from_secs(10),
        }
    }
}

impl SupervisorSettings {
    pub fn from_manager(manager: &ManagerConfig) -> Self {
        Self {
            restart_delay: Duration::from_secs(manager.restart_delay_secs),
            fallback_retry_secs: manager.fallback_retry_secs,
            kill_timeout: Duration::from_secs(manager.kill_timeout_secs),
        }
    }

    /// Restart delay for a source, honouring its own override
    pub fn restart_delay_for(&self, source: &SourceConfig) -> Duration {
        source
            .processing
            .restart_delay_secs
            .map(Duration::from_secs)
            .unwrap_or(self.restart_delay)
    }
}

/// Everything a supervisor shares with the rest of the process
#[derive(Clone)]
pub struct SupervisorContext {
    pub status: StatusStore,
    pub state: SharedStateStore,
    pub launcher: Arc<dyn PipelineLauncher>,
    pub settings: SupervisorSettings,
}

/// What the loop does after one launch-monitor-teardown cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    /// Start the next run right away (software fallback)
    RetryNow,
    /// Wait out the restart delay first
    Backoff,
    /// Stop requested, leave the loop
    Stopped,
}

/// Label shown for the acceleration mode of a run
pub fn hwaccel_label(preferred: bool, available: bool) -> &'static str {
    match (preferred, available) {
        (true, true) => "Enabled",
        (true, false) => "CPU Fallback",
        (false, _) => "Disabled",
    }
}

pub struct WorkerSupervisor {
    source: SourceConfig,
    ctx: SupervisorContext,
    cancel: CancellationToken,
}

impl WorkerSupervisor {
    pub fn new(source: SourceConfig, ctx: SupervisorContext, cancel: CancellationToken) -> Self {
        Self {
            source,
            ctx,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.source.name
    }

    /// Supervise until cancelled, then clear this worker's status entry
    pub async fn run(self) {
        info!(camera = %self.name(), "Worker started");

        loop {
            match self.run_once().await {
                Iteration::RetryNow => continue,
                Iteration::Backoff => {
                    if !self.backoff().await {
                        break;
                    }
                }
                Iteration::Stopped => break,
            }
        }

        self.ctx.status.set_status(self.name(), WorkerStatus::Offline);
        self.ctx.status.remove(self.name());
        info!(camera = %self.name(), "Worker stopped");
    }

    /// One launch-monitor-teardown cycle
    pub async fn run_once(&self) -> Iteration {
        let name = self.name();
        if self.cancel.is_cancelled() {
            return Iteration::Stopped;
        }

        let state = self.current_state();

        self.ctx.status.set_status(name, WorkerStatus::Connecting);
        let url = input_url(&self.source);
        info!(camera = %name, url = %redact_arg(&url), "Connecting to source");

        let resolution = select! {
            _ = self.cancel.cancelled() => return Iteration::Stopped,
            probed = self.ctx.launcher.probe_resolution(&url) => match probed {
                Ok(resolution) => resolution,
                Err(e) => {
                    warn!(camera = %name, error = %e, "Could not probe source resolution");
                    RESOLUTION_UNKNOWN.to_string()
                }
            },
        };

        let preferred = self.source.processing.hwaccel;
        let hwaccel = preferred && state.hwaccel_available;
        let command = match build_ffmpeg_command(&self.source, hwaccel) {
            Ok(command) => command,
            Err(e) => {
                error!(camera = %name, error = %e, "Failed to build pipeline command");
                self.ctx.status.set_status(name, WorkerStatus::Error);
                return Iteration::Backoff;
            }
        };

        let mut details = command.details.clone();
        details.insert("resolution".to_string(), resolution);
        details.insert(
            "hwaccel".to_string(),
            hwaccel_label(preferred, state.hwaccel_available).to_string(),
        );
        info!(
            camera = %name,
            resolution = %details["resolution"],
            hwaccel = %details["hwaccel"],
            codec = %details.get("codec").map(String::as_str).unwrap_or("copy"),
            bitrate = %details.get("bitrate").map(String::as_str).unwrap_or("source"),
            splitting = %details.get("splitting").map(String::as_str).unwrap_or("Disabled"),
            audio = %details.get("audio").map(String::as_str).unwrap_or("copy"),
            "Processing summary"
        );
        self.ctx.status.update_details(name, details);
        debug!(camera = %name, command = %sanitized_command_line(&command.argv()), "Pipeline command");

        let mut process = match self.ctx.launcher.launch(&command) {
            Ok(process) => process,
            Err(e) => {
                error!(camera = %name, error = %e, "Failed to launch pipeline");
                self.ctx.status.set_status(name, WorkerStatus::Error);
                return Iteration::Backoff;
            }
        };

        self.ctx.status.set_status(name, WorkerStatus::Online);
        info!(camera = %name, pid = ?process.pid(), "Pipeline online");

        let exited = select! {
            _ = self.cancel.cancelled() => None,
            exited = process.wait() => Some(exited),
        };

        let exit = match exited {
            None => {
                match shutdown_process(process.as_mut(), self.ctx.settings.kill_timeout).await {
                    Ok(exit) => debug!(camera = %name, code = ?exit.code, "Pipeline stopped"),
                    Err(ProcessError::Hung(grace)) => {
                        warn!(camera = %name, ?grace, "Pipeline ignored quit request and was killed")
                    }
                    Err(e) => warn!(camera = %name, error = %e, "Error while stopping pipeline"),
                }
                return Iteration::Stopped;
            }
            Some(Err(e)) => {
                if self.cancel.is_cancelled() {
                    return Iteration::Stopped;
                }
                error!(camera = %name, error = %e, "Lost track of pipeline process");
                self.ctx.status.set_status(name, WorkerStatus::Error);
                return Iteration::Backoff;
            }
            Some(Ok(exit)) => exit,
        };

        match classify_exit(&exit, hwaccel, self.cancel.is_cancelled()) {
            ExitClass::Requested => Iteration::Stopped,
            ExitClass::HwAccelFailure { marker } => {
                warn!(
                    camera = %name,
                    code = ?exit.code,
                    marker,
                    "Hardware acceleration failed, falling back to software"
                );
                self.persist(WorkerState::fallen_back(epoch_secs()));
                self.ctx.status.set_status(name, WorkerStatus::Error);
                Iteration::RetryNow
            }
            ExitClass::Crashed { code } => {
                error!(
                    camera = %name,
                    ?code,
                    stderr = %stderr_tail(&exit.stderr, STDERR_TAIL_LINES),
                    "Pipeline exited with an error"
                );
                self.ctx.status.set_status(name, WorkerStatus::Error);
                Iteration::Backoff
            }
            ExitClass::CleanExit => {
                warn!(camera = %name, "Pipeline exited cleanly, source may have ended");
                Iteration::Backoff
            }
        }
    }

    /// Durable state for this run, restoring hardware once the re-probe is due
    fn current_state(&self) -> WorkerState {
        let state = self.ctx.state.get_or_default(self.name());
        if state.reprobe_due(epoch_secs(), self.ctx.settings.fallback_retry_secs) {
            info!(camera = %self.name(), "Retrying hardware acceleration");
            let restored = WorkerState::default();
            self.persist(restored);
            return restored;
        }
        state
    }

    fn persist(&self, state: WorkerState) {
        if let Err(e) = self.ctx.state.put(self.name(), state) {
            error!(camera = %self.name(), error = %e, "Failed to persist worker state");
        }
    }

    /// Go offline and wait out the restart delay. Returns false when stopped.
    async fn backoff(&self) -> bool {
        self.ctx.status.set_status(self.name(), WorkerStatus::Offline);
        let delay = self.ctx.settings.restart_delay_for(&self.source);
        info!(camera = %self.name(), ?delay, "Restarting after delay");

        select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.cancel.cancelled() => false,
        }
    }
}

fn stderr_tail(stderr: &str, lines: usize) -> String {
    let all: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    all[all.len().saturating_sub(lines)..]
        .iter()
        .map(|line| redact_arg(line))
        .collect::<Vec<_>>()
        .join(" | ")
}
