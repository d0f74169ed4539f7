use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from watchdog.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub stream: StreamConfig,
    pub capture: CaptureConfig,
    pub watchdog: CheckConfig,
    pub observer: ObserverConfig,
    pub shutdown: ShutdownConfig,
    pub heartbeat: HeartbeatConfig,
    pub retention: RetentionConfig,
    pub probe: ProbeConfig,
    pub serve: ServeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    pub source_url: String,
}

/// How the segmenter is launched. `args` may contain the placeholders
/// `{source}`, `{output_pattern}`, `{segment_time}`, `{format}`,
/// `{resolution}` and `{fps}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub command: String,
    pub args: Vec<String>,
    pub output_dir: PathBuf,
    pub extension: String,
    pub segment_prefix: String,
    pub segment_duration_secs: u64,
    pub resolution: String,
    pub fps: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CheckConfig {
    pub check_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub startup_grace_secs: u64,
    pub suppression_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub poll_interval_secs: u64,
    pub settle_interval_ms: u64,
    pub min_segment_bytes: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_period_secs: u64,
    pub restart_delay_secs: u64,
    pub join_timeout_secs: u64,
    pub stop_file: PathBuf,
}

/// Paths for the heartbeat log and status file. Relative paths are
/// resolved against `capture.output_dir`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub log_file: PathBuf,
    pub status_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Number of logged segments kept besides the two newest. 0 disables cleanup.
    pub keep_segments: usize,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub enabled: bool,
    pub command: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServeConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

// --- Default implementations ---

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            source_url: "rtsp://localhost:8554/live/stream".to_string(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            command: "ffmpeg".to_string(),
            args: [
                "-y",
                "-loglevel",
                "error",
                "-nostdin",
                "-rtsp_transport",
                "tcp",
                "-rtbufsize",
                "400M",
                "-i",
                "{source}",
                "-c:v",
                "libx264",
                "-preset",
                "ultrafast",
                "-s",
                "{resolution}",
                "-r",
                "{fps}",
                "-f",
                "segment",
                "-segment_time",
                "{segment_time}",
                "-segment_format",
                "{format}",
                "-segment_start_number",
                "0",
                "-reset_timestamps",
                "1",
                "{output_pattern}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            output_dir: PathBuf::from("./videos"),
            extension: "mp4".to_string(),
            segment_prefix: "seg".to_string(),
            segment_duration_secs: 15,
            resolution: "1280x720".to_string(),
            fps: 30,
        }
    }
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 5,
            stale_threshold_secs: 45,
            startup_grace_secs: 60,
            suppression_secs: 15,
        }
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            settle_interval_ms: 1000,
            min_segment_bytes: 0,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 5,
            restart_delay_secs: 2,
            join_timeout_secs: 10,
            stop_file: PathBuf::from("STOP"),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("heartbeat.log"),
            status_file: PathBuf::from("watchdog.status"),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_segments: 0,
            interval_secs: 300,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "ffprobe".to_string(),
            timeout_secs: 15,
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".to_string(),
            port: 8480,
        }
    }
}

// --- Derived values ---

impl CheckConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn suppression(&self) -> Duration {
        Duration::from_secs(self.suppression_secs)
    }
}

impl ObserverConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

impl WatchdogConfig {
    /// Heartbeat log path, resolved against the output directory when relative.
    pub fn log_path(&self) -> PathBuf {
        self.resolve(&self.heartbeat.log_file)
    }

    /// Status file path, resolved against the output directory when relative.
    pub fn status_path(&self) -> PathBuf {
        self.resolve(&self.heartbeat.status_file)
    }

    /// Stop file path, resolved against the output directory when relative.
    pub fn stop_file_path(&self) -> PathBuf {
        self.resolve(&self.shutdown.stop_file)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.capture.output_dir.join(path)
        }
    }

    /// Reject settings the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.capture.command.trim().is_empty() {
            return invalid("capture.command must not be empty");
        }
        if self.capture.extension.trim().is_empty() {
            return invalid("capture.extension must not be empty");
        }
        if self.capture.extension.starts_with('.') {
            return invalid("capture.extension must not start with '.'");
        }
        if self.stream.source_url.trim().is_empty() {
            return invalid("stream.source_url must not be empty");
        }
        if self.watchdog.check_interval_secs == 0 {
            return invalid("watchdog.check_interval_secs must be greater than 0");
        }
        if self.watchdog.stale_threshold_secs == 0 {
            return invalid("watchdog.stale_threshold_secs must be greater than 0");
        }
        if self.observer.poll_interval_secs == 0 {
            return invalid("observer.poll_interval_secs must be greater than 0");
        }
        if self.retention.keep_segments > 0 && self.retention.interval_secs == 0 {
            return invalid("retention.interval_secs must be greater than 0 when cleanup is on");
        }
        Ok(())
    }
}

/// Load configuration from a TOML file. A missing file yields the defaults.
pub fn load(path: &Path) -> Result<WatchdogConfig, ConfigError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        return Ok(WatchdogConfig::default());
    }

    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config: WatchdogConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}
