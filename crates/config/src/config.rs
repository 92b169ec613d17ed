//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Document parsed but is semantically unusable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Codec of the incoming camera stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputCodec {
    #[default]
    H264,
    H265,
}

/// Codec of the published stream(s)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputCodec {
    /// Pass the video through untouched
    #[default]
    Copy,
    H264,
    H265,
}

impl OutputCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputCodec::Copy => "copy",
            OutputCodec::H264 => "h264",
            OutputCodec::H265 => "h265",
        }
    }
}

/// How a split source is cut in two
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SplitOrientation {
    /// Left and right halves
    #[default]
    Vertical,
    /// Top and bottom halves
    Horizontal,
}

/// Optional stream splitting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SplitSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, alias = "type")]
    pub orientation: SplitOrientation,
}

/// Declarative processing options for one source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingSpec {
    #[serde(default)]
    pub input_codec: InputCodec,
    #[serde(default)]
    pub output_codec: OutputCodec,
    /// Target video bitrate, e.g. "2M" or "1500k"
    #[serde(default = "default_bitrate")]
    pub bitrate: String,
    /// Peak video bitrate; the encoder buffer is sized at twice this value
    #[serde(default = "default_maxrate")]
    pub maxrate: String,
    /// GOP length in frames
    #[serde(default)]
    pub keyframe_interval: Option<u32>,
    /// Prefer hardware-accelerated decode/encode (default true)
    #[serde(default = "default_hwaccel")]
    pub hwaccel: bool,
    /// Per-source override of `manager.restart_delay_secs`
    #[serde(default, alias = "restart_delay")]
    pub restart_delay_secs: Option<u64>,
    #[serde(default)]
    pub split: SplitSpec,
}

fn default_bitrate() -> String {
    "2M".to_string()
}

fn default_maxrate() -> String {
    "4M".to_string()
}

fn default_hwaccel() -> bool {
    true
}

impl Default for ProcessingSpec {
    fn default() -> Self {
        Self {
            input_codec: InputCodec::default(),
            output_codec: OutputCodec::default(),
            bitrate: default_bitrate(),
            maxrate: default_maxrate(),
            keyframe_interval: None,
            hwaccel: default_hwaccel(),
            restart_delay_secs: None,
            split: SplitSpec::default(),
        }
    }
}

/// One camera source. `name` is the worker identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    pub name: String,
    /// Host or IP of the camera
    #[serde(alias = "ip")]
    pub address: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, alias = "pass")]
    pub password: Option<String>,
    /// RTSP path, may carry inline `user=`/`password=` parameters
    #[serde(default = "default_path", alias = "rtsp_path")]
    pub path: String,
    #[serde(default)]
    pub processing: ProcessingSpec,
}

fn default_path() -> String {
    "/stream1".to_string()
}

impl SourceConfig {
    /// Minimal source with default processing, mostly useful in tests
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            user: None,
            password: None,
            path: default_path(),
            processing: ProcessingSpec::default(),
        }
    }
}

/// Supervision settings shared by every worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagerConfig {
    /// Where per-worker recovery state is persisted
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
    /// How long a worker stays on software encoding before retrying hardware
    #[serde(default = "default_fallback_retry_secs")]
    pub fallback_retry_secs: u64,
    /// Upper bound on waiting for a worker task to finish after a stop
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Upper bound on waiting for the pipeline process after a graceful quit
    #[serde(default = "default_kill_timeout_secs")]
    pub kill_timeout_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/config/state.json")
}

fn default_restart_delay_secs() -> u64 {
    15
}

fn default_fallback_retry_secs() -> u64 {
    600
}

fn default_stop_timeout_secs() -> u64 {
    15
}

fn default_kill_timeout_secs() -> u64 {
    10
}

fn default_probe_timeout_secs() -> u64 {
    60
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            restart_delay_secs: default_restart_delay_secs(),
            fallback_retry_secs: default_fallback_retry_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            kill_timeout_secs: default_kill_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

/// Status API server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_true() -> bool {
    true
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

/// MediaMTX path-list poller configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaMtxConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_mediamtx_poll_secs")]
    pub poll_interval_secs: u64,
}

fn default_api_url() -> String {
    "http://mediamtx:9997/v2/paths/list".to_string()
}

fn default_mediamtx_poll_secs() -> u64 {
    10
}

impl Default for MediaMtxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: default_api_url(),
            poll_interval_secs: default_mediamtx_poll_secs(),
        }
    }
}

/// Config file watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatcherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_watch_poll_secs")]
    pub poll_interval_secs: u64,
}

fn default_watch_poll_secs() -> u64 {
    2
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_watch_poll_secs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mediamtx: MediaMtxConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    /// Desired sources, in document order
    #[serde(default, alias = "cameras")]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses and validates the file. Missing optional fields take defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject documents whose sources cannot be keyed by identity
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "source with empty name".to_string(),
                ));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
        }
        Ok(())
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - CAMFLEET_STATE_PATH -> manager.state_path
    /// - CAMFLEET_RESTART_DELAY_SECS -> manager.restart_delay_secs
    /// - CAMFLEET_FALLBACK_RETRY_SECS -> manager.fallback_retry_secs
    /// - CAMFLEET_FFMPEG_PATH -> manager.ffmpeg_path
    /// - CAMFLEET_FFPROBE_PATH -> manager.ffprobe_path
    /// - CAMFLEET_SERVER_BIND -> server.bind
    /// - CAMFLEET_MEDIAMTX_API_URL -> mediamtx.api_url
    /// - CAMFLEET_MEDIAMTX_ENABLED -> mediamtx.enabled
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CAMFLEET_STATE_PATH") {
            if !val.is_empty() {
                self.manager.state_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("CAMFLEET_RESTART_DELAY_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.manager.restart_delay_secs = secs;
            }
        }

        if let Ok(val) = env::var("CAMFLEET_FALLBACK_RETRY_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.manager.fallback_retry_secs = secs;
            }
        }

        if let Ok(val) = env::var("CAMFLEET_FFMPEG_PATH") {
            if !val.is_empty() {
                self.manager.ffmpeg_path = val;
            }
        }

        if let Ok(val) = env::var("CAMFLEET_FFPROBE_PATH") {
            if !val.is_empty() {
                self.manager.ffprobe_path = val;
            }
        }

        if let Ok(val) = env::var("CAMFLEET_SERVER_BIND") {
            if !val.is_empty() {
                self.server.bind = val;
            }
        }

        if let Ok(val) = env::var("CAMFLEET_MEDIAMTX_API_URL") {
            if !val.is_empty() {
                self.mediamtx.api_url = val;
            }
        }

        if let Ok(val) = env::var("CAMFLEET_MEDIAMTX_ENABLED") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.mediamtx.enabled = true,
                "false" | "0" | "no" => self.mediamtx.enabled = false,
                _ => {}
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}
