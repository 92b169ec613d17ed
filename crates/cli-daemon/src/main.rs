//! CLI entry point for the camera fleet manager
//!
//! Parses command line arguments, sets up logging and runs the daemon.

use camfleet::{Config, Daemon};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Supervises one ffmpeg relay per configured camera
#[derive(Parser, Debug)]
#[command(name = "camfleet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/config/config.toml")]
    config: PathBuf,

    /// Skip startup checks (ffmpeg, ffprobe). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    info!(config = %args.config.display(), "camfleet starting");

    let daemon_result = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        Config::load(&args.config)
            .map_err(Into::into)
            .and_then(|config| Daemon::new_without_checks(config, args.config.clone()))
    } else {
        Daemon::new(&args.config).await
    };

    match daemon_result {
        Ok(daemon) => {
            if daemon.config.server.enabled {
                info!(bind = %daemon.config.server.bind, "Status API enabled");
            }

            if let Err(e) = daemon.run().await {
                error!(error = %e, "Daemon error");
                return ExitCode::FAILURE;
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize daemon");
            ExitCode::FAILURE
        }
    }
}
