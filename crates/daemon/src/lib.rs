//! Camera fleet transcoding supervisor
//!
//! Keeps one ffmpeg relay per configured camera alive, falls back to
//! software encoding when the GPU path fails, and reconciles the running
//! fleet against the configuration file.

pub mod api;
pub mod classify;
pub mod daemon;
pub mod encode;
pub mod mediamtx;
pub mod probe;
pub mod process;
pub mod reconcile;
pub mod startup;
pub mod state;
pub mod status;
pub mod supervisor;
pub mod watcher;

pub use camfleet_config as config;
pub use camfleet_config::Config;
pub use api::{create_api_router, run_api_server, ServerError};
pub use classify::{classify_exit, detect_hwaccel_failure, ExitClass, HWACCEL_FAILURE_MARKERS};
pub use daemon::{wait_for_shutdown_signal, Daemon, DaemonError};
pub use encode::{
    build_ffmpeg_command, parse_bitrate_k, sanitize_command, CompileError, CompiledCommand,
};
pub use probe::{ProbeError, RESOLUTION_UNKNOWN};
pub use process::{FfmpegLauncher, PipelineLauncher, PipelineProcess, ProcessError, ProcessExit};
pub use reconcile::{ReconcileError, ReconcileReport, WorkerManager};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError};
pub use state::{SharedStateStore, StateError, StateStore, WorkerState};
pub use status::{StatusRecord, StatusStore, WorkerStatus};
pub use supervisor::{SupervisorContext, SupervisorSettings, WorkerSupervisor};
