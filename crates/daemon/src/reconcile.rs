//! Reconciliation of running workers against desired configuration
//!
//! [`WorkerManager`] owns the set of running supervisors. Every operation
//! that changes that set (reconcile passes, single-worker restarts, manual
//! start/stop and shutdown) takes the same async lock, so config-change
//! triggers and API restarts never interleave.

use crate::config::{Config, ConfigError, SourceConfig};
use crate::encode::{build_ffmpeg_command, CompileError};
use crate::state::WorkerState;
use crate::status::StatusRecord;
use crate::supervisor::{SupervisorContext, WorkerSupervisor};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Errors that abort a reconciliation pass before anything is changed
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The configuration document could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Two desired sources share a name
    #[error("Duplicate source name '{0}'")]
    DuplicateSource(String),

    /// A desired source has an empty name
    #[error("Source with empty name")]
    EmptyName,

    /// A desired source cannot be compiled into a pipeline command
    #[error("Source '{name}' is invalid: {source}")]
    InvalidSource { name: String, source: CompileError },
}

/// What a reconciliation pass changed, by worker name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub restarted: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.restarted.is_empty()
    }
}

/// A running supervisor and the config snapshot it was started with
struct WorkerRuntime {
    source: SourceConfig,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Check a desired source list without touching any running worker
pub fn validate_desired(desired: &[SourceConfig]) -> Result<(), ReconcileError> {
    let mut seen = HashSet::new();
    for source in desired {
        if source.name.trim().is_empty() {
            return Err(ReconcileError::EmptyName);
        }
        if !seen.insert(source.name.as_str()) {
            return Err(ReconcileError::DuplicateSource(source.name.clone()));
        }
        build_ffmpeg_command(source, source.processing.hwaccel).map_err(|e| {
            ReconcileError::InvalidSource {
                name: source.name.clone(),
                source: e,
            }
        })?;
    }
    Ok(())
}

pub struct WorkerManager {
    workers: Mutex<HashMap<String, WorkerRuntime>>,
    ctx: SupervisorContext,
    stop_timeout: Duration,
}

impl WorkerManager {
    /// `stop_timeout` bounds how long a stop waits for a supervisor to exit
    pub fn new(ctx: SupervisorContext, stop_timeout: Duration) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            ctx,
            stop_timeout,
        }
    }

    pub fn context(&self) -> &SupervisorContext {
        &self.ctx
    }

    /// Begin supervising a source
    ///
    /// The worker starts from `initial` if given, else from its durable
    /// record, else from defaults. Starting a name that is already running
    /// is ignored.
    pub async fn start_worker(&self, source: SourceConfig, initial: Option<WorkerState>) {
        let mut workers = self.workers.lock().await;
        self.start_locked(&mut workers, source, initial);
    }

    /// Stop a worker for good, deleting its durable and status records
    ///
    /// Unknown names are a no-op.
    pub async fn stop_worker(&self, name: &str) {
        let mut workers = self.workers.lock().await;
        self.stop_locked(&mut workers, name).await;
    }

    /// Stop and start a worker with its current config and state
    ///
    /// Returns false if no worker with that name is running.
    pub async fn restart_worker(&self, name: &str) -> bool {
        let mut workers = self.workers.lock().await;
        let Some(runtime) = workers.remove(name) else {
            return false;
        };

        info!(camera = %name, "Restarting worker");
        let source = runtime.source.clone();
        self.halt(name, runtime).await;
        // Read after the halt so a fallback persisted while stopping survives
        let state = self.ctx.state.get_or_default(name);
        self.ctx.status.remove(name);
        self.start_locked(&mut workers, source, Some(state));
        true
    }

    /// Converge running workers to `desired`
    ///
    /// The whole list is validated first; an invalid list leaves every
    /// running worker untouched. Changed sources restart from fresh state.
    pub async fn reconcile(&self, desired: &[SourceConfig]) -> Result<ReconcileReport, ReconcileError> {
        validate_desired(desired)?;

        let mut workers = self.workers.lock().await;
        let mut report = ReconcileReport::default();
        let wanted: HashSet<&str> = desired.iter().map(|s| s.name.as_str()).collect();

        let mut removed: Vec<String> = workers
            .keys()
            .filter(|name| !wanted.contains(name.as_str()))
            .cloned()
            .collect();
        removed.sort();
        for name in removed {
            self.stop_locked(&mut workers, &name).await;
            report.stopped.push(name);
        }

        for source in desired {
            let name = source.name.clone();
            let changed = workers.get(&name).map(|runtime| runtime.source != *source);
            match changed {
                None => {
                    self.start_locked(&mut workers, source.clone(), None);
                    report.started.push(name);
                }
                Some(true) => {
                    info!(camera = %name, "Configuration changed");
                    self.stop_locked(&mut workers, &name).await;
                    self.start_locked(&mut workers, source.clone(), None);
                    report.restarted.push(name);
                }
                Some(false) => report.unchanged.push(name),
            }
        }

        if !report.is_noop() {
            info!(
                started = report.started.len(),
                stopped = report.stopped.len(),
                restarted = report.restarted.len(),
                unchanged = report.unchanged.len(),
                "Reconciliation complete"
            );
        }
        Ok(report)
    }

    /// Re-read the config file and reconcile against its sources
    pub async fn reconcile_from_file<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<ReconcileReport, ReconcileError> {
        let config = Config::load_from_file(path)?;
        self.reconcile(&config.sources).await
    }

    pub fn get_status(&self, name: &str) -> StatusRecord {
        self.ctx.status.get(name)
    }

    pub fn get_all_statuses(&self) -> BTreeMap<String, StatusRecord> {
        self.ctx.status.get_all()
    }

    /// Names of running workers, sorted
    pub async fn running_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every worker, keeping durable state for the next start
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        let mut drained: Vec<(String, WorkerRuntime)> = workers.drain().collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));

        info!(workers = drained.len(), "Stopping all workers");
        for (_, runtime) in &drained {
            runtime.cancel.cancel();
        }
        for (name, runtime) in drained {
            self.halt(&name, runtime).await;
            self.ctx.status.remove(&name);
        }

        if let Err(e) = self.ctx.state.flush() {
            error!(error = %e, "Failed to persist worker state on shutdown");
        }
    }

    fn start_locked(
        &self,
        workers: &mut HashMap<String, WorkerRuntime>,
        source: SourceConfig,
        initial: Option<WorkerState>,
    ) {
        let name = source.name.clone();
        if workers.contains_key(&name) {
            warn!(camera = %name, "Worker already running");
            return;
        }

        let state = initial
            .or_else(|| self.ctx.state.get(&name))
            .unwrap_or_default();
        if let Err(e) = self.ctx.state.put(&name, state) {
            error!(camera = %name, error = %e, "Failed to persist worker state");
        }

        let cancel = CancellationToken::new();
        let supervisor = WorkerSupervisor::new(source.clone(), self.ctx.clone(), cancel.clone());
        let handle = tokio::spawn(supervisor.run());

        workers.insert(
            name,
            WorkerRuntime {
                source,
                cancel,
                handle,
            },
        );
    }

    async fn stop_locked(&self, workers: &mut HashMap<String, WorkerRuntime>, name: &str) {
        let Some(runtime) = workers.remove(name) else {
            return;
        };

        info!(camera = %name, "Stopping worker");
        self.halt(name, runtime).await;
        if let Err(e) = self.ctx.state.remove(name) {
            error!(camera = %name, error = %e, "Failed to delete worker state");
        }
        self.ctx.status.remove(name);
    }

    /// Cancel a supervisor and wait for it, aborting it after the stop timeout
    async fn halt(&self, name: &str, runtime: WorkerRuntime) {
        runtime.cancel.cancel();
        let mut handle = runtime.handle;
        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(camera = %name, error = %e, "Worker task failed"),
            Err(_) => {
                warn!(camera = %name, timeout = ?self.stop_timeout, "Worker did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}
