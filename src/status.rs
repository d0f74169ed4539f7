/// Status file: writes `watchdog.status` as JSON on every supervisor state
/// transition and restart.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::capture::CaptureSession;
use crate::heartbeat::LogEntry;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// Supervisor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Restarting,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: SupervisorState,
    pub session_pid: Option<u32>,
    pub session_started_at: Option<NaiveDateTime>,
    pub session_token: Option<String>,
    pub restarts: u64,
    pub consecutive_failures: u32,
    pub last_segment: Option<String>,
    pub last_segment_at: Option<NaiveDateTime>,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    /// Create a new StatusFile writer for the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// to ensure readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StatusError::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| StatusError::Write {
                path: tmp.path().to_path_buf(),
                source: e,
            })?;

        let from = tmp.path().to_path_buf();
        tmp.persist(&self.path).map_err(|e| StatusError::Rename {
            from,
            to: self.path.clone(),
            source: e.error,
        })?;

        Ok(())
    }

    /// Read the current status, if any.
    pub fn read(&self) -> Result<Option<StatusData>, StatusError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StatusError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| StatusError::Serialize { source: e })
    }

    /// Remove the status file (on clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    /// Path to the status file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Mutable state tracker that builds StatusData for each update and
/// publishes the state to the supervisor.
pub struct StatusTracker {
    file: StatusFile,
    state_tx: Arc<watch::Sender<SupervisorState>>,
    pid: u32,
    session_pid: Option<u32>,
    session_started_at: Option<NaiveDateTime>,
    session_token: Option<String>,
    restarts: u64,
    consecutive_failures: u32,
    last_segment: Option<LogEntry>,
}

impl StatusTracker {
    /// Create a new tracker.
    pub fn new(status_path: PathBuf, state_tx: Arc<watch::Sender<SupervisorState>>) -> Self {
        Self {
            file: StatusFile::new(status_path),
            state_tx,
            pid: std::process::id(),
            session_pid: None,
            session_started_at: None,
            session_token: None,
            restarts: 0,
            consecutive_failures: 0,
            last_segment: None,
        }
    }

    /// Publish `state` and write the status file.
    pub fn update(&self, state: SupervisorState) {
        self.state_tx.send_replace(state);

        let data = StatusData {
            pid: self.pid,
            state,
            session_pid: self.session_pid,
            session_started_at: self.session_started_at,
            session_token: self.session_token.clone(),
            restarts: self.restarts,
            consecutive_failures: self.consecutive_failures,
            last_segment: self.last_segment.as_ref().map(|e| e.filename.clone()),
            last_segment_at: self.last_segment.as_ref().map(|e| e.completed_at),
            last_update: Utc::now(),
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    /// Record the live session.
    pub fn set_session(&mut self, session: &CaptureSession) {
        self.session_pid = Some(session.pid);
        self.session_started_at = Some(session.started_at);
        self.session_token = Some(session.token.clone());
    }

    /// Forget the session (stopped or failed to start).
    pub fn clear_session(&mut self) {
        self.session_pid = None;
        self.session_started_at = None;
        self.session_token = None;
    }

    pub fn set_last_segment(&mut self, entry: Option<LogEntry>) {
        self.last_segment = entry;
    }

    /// Count a restart attempt and its outcome.
    pub fn record_restart(&mut self, succeeded: bool) {
        self.restarts += 1;
        if succeeded {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
    }

    /// Last published state.
    #[cfg(test)]
    pub fn state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Remove the status file.
    pub fn remove(&self) {
        self.file.remove();
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to encode status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
            StatusError::Read { path, source } => {
                write!(f, "failed to read status file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
            StatusError::Read { source, .. } => Some(source),
        }
    }
}
