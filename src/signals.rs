/// Shutdown triggers: SIGINT (Ctrl-C), SIGTERM, and STOP file detection.
///
/// Every trigger leads to the same `Supervisor::stop()` path, so the capture
/// process is never orphaned.
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

/// How often the stop file is checked for.
const STOP_FILE_POLL: Duration = Duration::from_secs(1);

/// What asked the supervisor to shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Interrupt,
    Terminate,
    StopFile(PathBuf),
}

impl std::fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownTrigger::Interrupt => write!(f, "SIGINT"),
            ShutdownTrigger::Terminate => write!(f, "SIGTERM"),
            ShutdownTrigger::StopFile(path) => write!(f, "stop file {}", path.display()),
        }
    }
}

/// Installed signal listeners.
pub struct SignalHandler {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    stop_file: PathBuf,
}

impl SignalHandler {
    /// Install SIGINT/SIGTERM handlers. Must be called inside a tokio runtime.
    pub fn install(stop_file: PathBuf) -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            stop_file,
        })
    }

    /// Resolve on the first shutdown trigger. A detected stop file is removed.
    pub async fn wait(&mut self) -> ShutdownTrigger {
        let trigger = tokio::select! {
            _ = self.interrupt.recv() => ShutdownTrigger::Interrupt,
            _ = self.terminate.recv() => ShutdownTrigger::Terminate,
            path = wait_for_stop_file(&self.stop_file) => ShutdownTrigger::StopFile(path),
        };
        tracing::info!(%trigger, "shutdown requested");
        trigger
    }
}

async fn wait_for_stop_file(path: &Path) -> PathBuf {
    let mut ticker = tokio::time::interval(STOP_FILE_POLL);
    loop {
        ticker.tick().await;
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove stop file");
            }
            return path.to_path_buf();
        }
    }
}
