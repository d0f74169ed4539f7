/// Capture process lifecycle: spawn the segmenter with a per-session output
/// pattern, stop it gracefully (SIGTERM, then SIGKILL after the grace
/// period), and restart it.
use crate::config::{CaptureConfig, WatchdogConfig};
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant, SystemTime};
use tokio::process::{Child, Command};

/// Token format embedded in every segment filename of a session.
const TOKEN_FORMAT: &str = "%Y%m%d_%H%M%S";

/// File in the output directory that receives the child's stderr.
const STDERR_LOG: &str = "capture.stderr.log";

/// Everything needed to launch one capture session.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub source_url: String,
    pub output_dir: PathBuf,
    pub extension: String,
    pub segment_prefix: String,
    pub segment_duration_secs: u64,
    pub resolution: String,
    pub fps: u32,
}

impl LaunchSpec {
    pub fn from_config(config: &WatchdogConfig) -> Self {
        let CaptureConfig {
            command,
            args,
            output_dir,
            extension,
            segment_prefix,
            segment_duration_secs,
            resolution,
            fps,
        } = config.capture.clone();
        Self {
            command,
            args,
            source_url: config.stream.source_url.clone(),
            output_dir,
            extension,
            segment_prefix,
            segment_duration_secs,
            resolution,
            fps,
        }
    }

    /// Output filename pattern for a session: `{prefix}_{token}_%05d.{ext}`.
    pub fn output_pattern(&self, token: &str) -> PathBuf {
        self.output_dir.join(format!(
            "{}_{}_%05d.{}",
            self.segment_prefix, token, self.extension
        ))
    }

    /// Substitute placeholders in the argument template.
    fn build_args(&self, output_pattern: &Path) -> Vec<String> {
        let pattern = output_pattern.to_string_lossy();
        let segment_time = self.segment_duration_secs.to_string();
        let fps = self.fps.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{source}", &self.source_url)
                    .replace("{output_pattern}", &pattern)
                    .replace("{segment_time}", &segment_time)
                    .replace("{format}", &self.extension)
                    .replace("{resolution}", &self.resolution)
                    .replace("{fps}", &fps)
            })
            .collect()
    }

    /// True if any file from a session with this token is already on disk.
    fn token_in_use(&self, token: &str) -> bool {
        let dir = glob::Pattern::escape(&self.output_dir.to_string_lossy());
        let pattern = format!("{dir}/{}_{token}_*", self.segment_prefix);
        match glob::glob(&pattern) {
            Ok(mut paths) => paths.next().is_some(),
            Err(_) => false,
        }
    }
}

/// One live child process.
#[derive(Debug)]
pub struct CaptureSession {
    child: Child,
    pub pid: u32,
    /// UTC wall-clock start, comparable with heartbeat log timestamps.
    pub started_at: NaiveDateTime,
    /// Monotonic start, immune to clock steps.
    pub started: Instant,
    /// Taken just before the spawn; files last written earlier belong to
    /// a previous session.
    pub spawned_at: SystemTime,
    pub token: String,
}

/// How a session ended when `stop()` was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// There was no session.
    NotRunning,
    /// The child had already exited on its own.
    Exited,
    /// The child exited within the grace period after SIGTERM.
    Graceful,
    /// The grace period ran out and the child was killed.
    Killed,
}

/// Owner of the single capture child process.
pub struct CaptureProcess {
    spec: LaunchSpec,
    grace_period: Duration,
    restart_delay: Duration,
    session: Option<CaptureSession>,
    last_token: Option<String>,
}

impl CaptureProcess {
    pub fn new(spec: LaunchSpec, grace_period: Duration, restart_delay: Duration) -> Self {
        Self {
            spec,
            grace_period,
            restart_delay,
            session: None,
            last_token: None,
        }
    }

    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self::new(
            LaunchSpec::from_config(config),
            config.shutdown.grace_period(),
            config.shutdown.restart_delay(),
        )
    }

    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    /// Spawn a new session. Any session still alive is stopped first, so
    /// at most one child ever writes into the output directory.
    pub async fn start(&mut self) -> Result<&CaptureSession, CaptureError> {
        if self.session.is_some() {
            tracing::warn!("start requested while a session is live, stopping it first");
            self.stop().await;
        }

        let spawned_at = SystemTime::now();
        let now = DateTime::<Utc>::from(spawned_at).naive_utc();
        let started_at = now.with_nanosecond(0).unwrap_or(now);
        let token = self.next_token(&started_at.format(TOKEN_FORMAT).to_string());
        let output_pattern = self.spec.output_pattern(&token);
        let args = self.spec.build_args(&output_pattern);

        tracing::info!(
            command = %self.spec.command,
            args = ?args,
            output = %output_pattern.display(),
            "spawning capture process"
        );

        let child = Command::new(&self.spec.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(self.stderr_target())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaptureError::SpawnFailed {
                command: self.spec.command.clone(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(pid, token = %token, "capture process started");

        self.last_token = Some(token.clone());
        let session = self.session.insert(CaptureSession {
            child,
            pid,
            started_at,
            started: Instant::now(),
            spawned_at,
            token,
        });
        Ok(&*session)
    }

    /// Stop the live session, escalating to SIGKILL after the grace period.
    /// Returns once the slot is empty; a no-op without a session.
    pub async fn stop(&mut self) -> StopOutcome {
        let Some(mut session) = self.session.take() else {
            return StopOutcome::NotRunning;
        };

        if let Ok(Some(status)) = session.child.try_wait() {
            tracing::info!(pid = session.pid, %status, "capture process had already exited");
            return StopOutcome::Exited;
        }

        signal_group(session.pid, Signal::SIGTERM);

        match tokio::time::timeout(self.grace_period, session.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid = session.pid, %status, "capture process stopped");
                StopOutcome::Graceful
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    pid = session.pid,
                    error = %e,
                    "failed to wait for capture process, killing"
                );
                force_kill(&mut session).await;
                StopOutcome::Killed
            }
            Err(_) => {
                tracing::warn!(
                    pid = session.pid,
                    grace_secs = self.grace_period.as_secs_f64(),
                    "capture process ignored SIGTERM, killing"
                );
                force_kill(&mut session).await;
                StopOutcome::Killed
            }
        }
    }

    /// Stop, wait the restart delay, start again. On failure the slot stays
    /// empty and the error is returned.
    pub async fn restart(&mut self) -> Result<&CaptureSession, CaptureError> {
        let outcome = self.stop().await;
        tracing::debug!(?outcome, "previous capture session stopped");
        tokio::time::sleep(self.restart_delay).await;
        self.start().await
    }

    /// If the child has exited on its own, clear the slot and return its status.
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        let session = self.session.as_mut()?;
        match session.child.try_wait() {
            Ok(Some(status)) => {
                tracing::warn!(pid = session.pid, %status, "capture process exited");
                self.session = None;
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(pid = session.pid, error = %e, "cannot check capture process");
                None
            }
        }
    }

    /// Pick a token no earlier session has used.
    fn next_token(&self, base: &str) -> String {
        let mut token = base.to_string();
        let mut n = 1;
        while self.last_token.as_deref() == Some(token.as_str()) || self.spec.token_in_use(&token) {
            token = format!("{base}-{n}");
            n += 1;
        }
        token
    }

    fn stderr_target(&self) -> Stdio {
        let path = self.spec.output_dir.join(STDERR_LOG);
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "cannot open capture stderr log"
                );
                Stdio::null()
            }
        }
    }
}

/// SIGKILL the whole process group led by `pid`. Used when the owning
/// [`CaptureProcess`] was dropped without a clean stop.
pub fn kill_group(pid: u32) {
    signal_group(pid, Signal::SIGKILL);
}

fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw <= 0 {
        return;
    }
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        tracing::debug!(pid, ?signal, error = %e, "failed to signal capture process group");
    }
}

async fn force_kill(session: &mut CaptureSession) {
    signal_group(session.pid, Signal::SIGKILL);
    if let Err(e) = session.child.kill().await {
        tracing::debug!(pid = session.pid, error = %e, "kill after SIGKILL reported an error");
    }
}

/// Errors that can occur while starting a capture session.
#[derive(Debug)]
pub enum CaptureError {
    /// The segmenter binary could not be spawned.
    SpawnFailed {
        command: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::SpawnFailed { command, source } => {
                write!(f, "failed to spawn capture process {command}: {source}")
            }
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::SpawnFailed { source, .. } => Some(source),
        }
    }
}
