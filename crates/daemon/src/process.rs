//! Pipeline process management
//!
//! The supervisor talks to the outside world only through [`PipelineLauncher`]
//! and [`PipelineProcess`], so tests can substitute scripted processes.

use crate::encode::CompiledCommand;
use crate::probe::{self, ProbeError};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

/// Upper bound on captured diagnostic output per stream
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// Errors from launching or controlling a pipeline process
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be started
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },

    /// Waiting on the process failed
    #[error("Failed to wait for pipeline process: {0}")]
    Wait(std::io::Error),

    /// The process ignored termination for longer than allowed
    #[error("Pipeline process did not exit within {0:?}")]
    Hung(Duration),
}

/// How a pipeline process ended
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessExit {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Starts pipeline processes and probes sources
#[async_trait]
pub trait PipelineLauncher: Send + Sync {
    /// Discover the source's native resolution as `WIDTHxHEIGHT`
    async fn probe_resolution(&self, input_url: &str) -> Result<String, ProbeError>;

    /// Start the compiled command
    fn launch(&self, command: &CompiledCommand) -> Result<Box<dyn PipelineProcess>, ProcessError>;
}

/// A running pipeline process
#[async_trait]
pub trait PipelineProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit. Cancel-safe.
    async fn wait(&mut self) -> Result<ProcessExit, ProcessError>;

    /// Ask the process to shut down cleanly
    async fn terminate(&mut self);

    /// Kill the process and reap it
    async fn kill(&mut self);
}

/// Launcher backed by real ffmpeg/ffprobe binaries
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    ffmpeg_path: String,
    ffprobe_path: String,
    probe_timeout: Duration,
}

impl FfmpegLauncher {
    pub fn new(
        ffmpeg_path: impl Into<String>,
        ffprobe_path: impl Into<String>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
            probe_timeout,
        }
    }
}

#[async_trait]
impl PipelineLauncher for FfmpegLauncher {
    async fn probe_resolution(&self, input_url: &str) -> Result<String, ProbeError> {
        probe::probe_resolution(&self.ffprobe_path, input_url, self.probe_timeout).await
    }

    fn launch(&self, command: &CompiledCommand) -> Result<Box<dyn PipelineProcess>, ProcessError> {
        let mut child = Command::new(&self.ffmpeg_path)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Launch {
                program: self.ffmpeg_path.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(spawn_capture);
        let stderr = child.stderr.take().map(spawn_capture);

        Ok(Box::new(FfmpegProcess {
            child,
            stdin,
            stdout,
            stderr,
        }))
    }
}

/// Drain a pipe in the background, keeping the last [`MAX_CAPTURE_BYTES`]
fn spawn_capture<R>(mut reader: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut captured = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    captured.extend_from_slice(&buf[..n]);
                    if captured.len() > MAX_CAPTURE_BYTES {
                        let excess = captured.len() - MAX_CAPTURE_BYTES;
                        captured.drain(..excess);
                    }
                }
            }
        }
        String::from_utf8_lossy(&captured).into_owned()
    })
}

async fn collect(handle: &mut Option<JoinHandle<String>>) -> String {
    let output = match handle.as_mut() {
        Some(task) => task.await.unwrap_or_default(),
        None => return String::new(),
    };
    *handle = None;
    output
}

struct FfmpegProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
}

#[async_trait]
impl PipelineProcess for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<ProcessExit, ProcessError> {
        let status = self.child.wait().await.map_err(ProcessError::Wait)?;
        let stdout = collect(&mut self.stdout).await;
        let stderr = collect(&mut self.stderr).await;

        Ok(ProcessExit {
            code: status.code(),
            stdout,
            stderr,
        })
    }

    async fn terminate(&mut self) {
        // ffmpeg finishes its outputs and exits on "q" from stdin
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }
    }

    async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

/// Ask a process to stop, escalating to a kill after `grace`
///
/// Returns the exit when the process stopped within the grace period, or
/// [`ProcessError::Hung`] after it had to be killed.
pub async fn shutdown_process(
    process: &mut dyn PipelineProcess,
    grace: Duration,
) -> Result<ProcessExit, ProcessError> {
    process.terminate().await;
    match tokio::time::timeout(grace, process.wait()).await {
        Ok(result) => result,
        Err(_) => {
            process.kill().await;
            Err(ProcessError::Hung(grace))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(args: &[&str]) -> CompiledCommand {
        CompiledCommand {
            program: "ffmpeg".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            details: Default::default(),
        }
    }

    #[test]
    fn test_process_exit_success() {
        let ok = ProcessExit {
            code: Some(0),
            ..Default::default()
        };
        assert!(ok.success());
        assert!(!ProcessExit::default().success());
    }

    #[tokio::test]
    async fn test_launch_missing_binary() {
        let launcher = FfmpegLauncher::new("/nonexistent/ffmpeg", "ffprobe", Duration::from_secs(1));
        match launcher.launch(&command(&["-version"])) {
            Err(ProcessError::Launch { program, .. }) => {
                assert_eq!(program, "/nonexistent/ffmpeg")
            }
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("launch should fail"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_exit_code_and_stderr() {
        let launcher = FfmpegLauncher::new("sh", "ffprobe", Duration::from_secs(1));
        let mut process = launcher
            .launch(&command(&["-c", "echo out; echo 'nvenc broke' >&2; exit 3"]))
            .unwrap();

        let exit = process.wait().await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.stdout.trim(), "out");
        assert_eq!(exit.stderr.trim(), "nvenc broke");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_graceful_quit_via_stdin() {
        let launcher = FfmpegLauncher::new("sh", "ffprobe", Duration::from_secs(1));
        // Exits once stdin delivers the quit key and closes
        let mut process = launcher
            .launch(&command(&["-c", "read key; exit 0"]))
            .unwrap();

        let exit = shutdown_process(process.as_mut(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(exit.code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_process_is_killed() {
        let launcher = FfmpegLauncher::new("sh", "ffprobe", Duration::from_secs(1));
        let mut process = launcher
            .launch(&command(&["-c", "exec sleep 30 < /dev/null"]))
            .unwrap();

        let started = std::time::Instant::now();
        let result = shutdown_process(process.as_mut(), Duration::from_millis(200)).await;
        assert!(matches!(result, Err(ProcessError::Hung(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
