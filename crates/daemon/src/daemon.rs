//! Daemon startup and main loop
//!
//! Wires the stores, the worker manager and the surrounding services
//! together, runs the initial reconciliation, and shuts everything down on
//! a termination signal.

use crate::api::{run_api_server, ServerError};
use crate::config::{Config, ConfigError};
use crate::mediamtx::poll_mediamtx;
use crate::process::{FfmpegLauncher, PipelineLauncher};
use crate::reconcile::WorkerManager;
use crate::startup::{run_startup_checks, StartupError};
use crate::state::{StateError, StateStore};
use crate::status::StatusStore;
use crate::supervisor::{SupervisorContext, SupervisorSettings};
use crate::watcher::watch_config;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long background services get to finish after shutdown begins
const SERVICE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Durable worker state could not be loaded
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// Signal handlers could not be installed
    #[error("Failed to install signal handlers: {0}")]
    Signal(std::io::Error),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// File re-read on every change
    config_path: PathBuf,
    manager: Arc<WorkerManager>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Initialize the daemon from a config file
    ///
    /// Loads the file with environment overrides, runs the startup checks,
    /// and loads durable worker state.
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(&config_path)?;
        run_startup_checks(&config)?;
        Self::new_without_checks(config, config_path.as_ref().to_path_buf())
    }

    /// Initialize the daemon without running startup checks
    pub fn new_without_checks(config: Config, config_path: PathBuf) -> Result<Self, DaemonError> {
        let launcher = Arc::new(FfmpegLauncher::new(
            config.manager.ffmpeg_path.clone(),
            config.manager.ffprobe_path.clone(),
            Duration::from_secs(config.manager.probe_timeout_secs),
        ));
        Self::with_launcher(config, config_path, launcher)
    }

    /// Initialize the daemon with a custom pipeline launcher
    pub fn with_launcher(
        config: Config,
        config_path: PathBuf,
        launcher: Arc<dyn PipelineLauncher>,
    ) -> Result<Self, DaemonError> {
        let state = StateStore::load(&config.manager.state_path)?;
        info!(
            path = %config.manager.state_path.display(),
            workers = state.snapshot().len(),
            "Loaded worker state"
        );

        let ctx = SupervisorContext {
            status: StatusStore::new(),
            state: Arc::new(state),
            launcher,
            settings: SupervisorSettings::from_manager(&config.manager),
        };
        let manager = Arc::new(WorkerManager::new(
            ctx,
            Duration::from_secs(config.manager.stop_timeout_secs),
        ));

        Ok(Self {
            config,
            config_path,
            manager,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn manager(&self) -> Arc<WorkerManager> {
        self.manager.clone()
    }

    /// Token that stops [`Daemon::run`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn spawn_services(&self) -> Vec<JoinHandle<()>> {
        let mut services = Vec::new();

        if self.config.server.enabled {
            let manager = self.manager.clone();
            let bind = self.config.server.bind.clone();
            let shutdown = self.shutdown.clone();
            services.push(tokio::spawn(async move {
                if let Err(e) = run_api_server(manager, &bind, shutdown).await {
                    error!(error = %e, "Status API stopped");
                }
            }));
        }

        if self.config.watcher.enabled {
            services.push(tokio::spawn(watch_config(
                self.config_path.clone(),
                self.manager.clone(),
                Duration::from_secs(self.config.watcher.poll_interval_secs),
                self.shutdown.clone(),
            )));
        }

        if self.config.mediamtx.enabled {
            info!(url = %self.config.mediamtx.api_url, "Starting MediaMTX poller");
            services.push(tokio::spawn(poll_mediamtx(
                self.manager.clone(),
                self.config.mediamtx.api_url.clone(),
                Duration::from_secs(self.config.mediamtx.poll_interval_secs),
                self.shutdown.clone(),
            )));
        }

        services
    }

    /// Run until a termination signal or the shutdown token fires
    ///
    /// Starts every configured worker and the enabled services, then on
    /// shutdown stops all workers while keeping their durable state.
    pub async fn run(&self) -> Result<(), DaemonError> {
        info!(
            sources = self.config.sources.len(),
            config = %self.config_path.display(),
            "Camera fleet manager starting"
        );

        if let Err(e) = self.manager.reconcile(&self.config.sources).await {
            error!(error = %e, "Initial reconciliation failed, waiting for a valid configuration");
        }

        let services = self.spawn_services();

        let signal = tokio::select! {
            result = wait_for_shutdown_signal() => result,
            _ = self.shutdown.cancelled() => Ok(()),
        };
        warn!("Shutdown requested, stopping all workers");

        self.shutdown.cancel();
        self.manager.shutdown().await;

        for service in services {
            if tokio::time::timeout(SERVICE_SHUTDOWN_TIMEOUT, service)
                .await
                .is_err()
            {
                warn!("Background service did not stop in time");
            }
        }

        info!("Shutdown complete");
        signal.map_err(DaemonError::Signal)
    }
}

/// Waits for SIGINT, SIGTERM, SIGQUIT or Ctrl-C.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Waits for Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::state::WorkerState;
    use crate::status::WorkerStatus;
    use crate::supervisor::tests::{wait_until, ScriptedLauncher};
    use tempfile::TempDir;

    fn create_test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.manager.state_path = dir.path().join("state.json");
        config.server.enabled = false;
        config.watcher.enabled = false;
        config.mediamtx.enabled = false;
        config.sources = vec![
            SourceConfig::new("front", "10.0.0.2"),
            SourceConfig::new("back", "10.0.0.3"),
        ];
        config
    }

    #[test]
    fn test_daemon_initialization_without_checks() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir);
        let daemon =
            Daemon::new_without_checks(config.clone(), dir.path().join("config.toml")).unwrap();
        assert_eq!(daemon.config, config);
    }

    #[test]
    fn test_corrupt_state_fails_initialization() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir);
        std::fs::write(&config.manager.state_path, "{oops").unwrap();
        assert!(matches!(
            Daemon::new_without_checks(config, dir.path().join("config.toml")),
            Err(DaemonError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_config_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Daemon::new(dir.path().join("absent.toml")).await,
            Err(DaemonError::Config(ConfigError::Io(_)))
        ));
    }

    #[tokio::test]
    async fn test_run_starts_workers_and_keeps_state_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir);
        let state_path = config.manager.state_path.clone();
        let daemon = Arc::new(
            Daemon::with_launcher(
                config,
                dir.path().join("config.toml"),
                Arc::new(ScriptedLauncher::running()),
            )
            .unwrap(),
        );
        let manager = daemon.manager();

        let runner = daemon.clone();
        let task = tokio::spawn(async move { runner.run().await });

        wait_until(|| {
            let all = manager.get_all_statuses();
            all.len() == 2 && all.values().all(|r| r.status == WorkerStatus::Online)
        })
        .await;

        daemon.shutdown_token().cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(manager.running_names().await.is_empty());
        let reloaded = StateStore::load(&state_path).unwrap();
        assert_eq!(reloaded.get("front"), Some(WorkerState::default()));
        assert_eq!(reloaded.get("back"), Some(WorkerState::default()));
    }
}
