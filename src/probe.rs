//! Pre-flight connectivity check: ask ffprobe to open the stream once
//! before the segmenter is launched.

use crate::config::ProbeConfig;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Arguments for probing `source`. The `-timeout` value is in microseconds.
fn probe_args(source: &str) -> Vec<String> {
    let mut args = vec!["-v", "quiet"];
    if source.starts_with("rtsp://") || source.starts_with("rtsps://") {
        args.extend(["-rtsp_transport", "tcp"]);
    }
    args.extend([
        "-timeout",
        "10000000",
        "-i",
        source,
        "-show_entries",
        "format=duration",
        "-of",
        "csv=p=0",
    ]);
    args.into_iter().map(String::from).collect()
}

/// Probe the stream source. `Ok(())` when the prober exits successfully.
pub async fn probe_source(config: &ProbeConfig, source: &str) -> Result<(), ProbeError> {
    let timeout = Duration::from_secs(config.timeout_secs);
    tracing::info!(source, command = %config.command, "probing stream source");

    let child = Command::new(&config.command)
        .args(probe_args(source))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ProbeError::Spawn {
            command: config.command.clone(),
            source: e,
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| ProbeError::Spawn {
            command: config.command.clone(),
            source: e,
        })?,
        Err(_) => return Err(ProbeError::Timeout { timeout }),
    };

    if output.status.success() {
        tracing::info!("stream source reachable");
        Ok(())
    } else {
        Err(ProbeError::Failed {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[derive(Debug)]
pub enum ProbeError {
    Spawn {
        command: String,
        source: std::io::Error,
    },
    Timeout {
        timeout: Duration,
    },
    Failed {
        code: Option<i32>,
        stderr: String,
    },
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Spawn { command, source } => {
                write!(f, "failed to run probe {command}: {source}")
            }
            ProbeError::Timeout { timeout } => {
                write!(f, "probe timed out after {}s", timeout.as_secs())
            }
            ProbeError::Failed { code, stderr } => {
                write!(f, "probe failed (exit code {code:?})")?;
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &str, timeout_secs: u64) -> ProbeConfig {
        ProbeConfig {
            enabled: true,
            command: command.to_string(),
            timeout_secs,
        }
    }

    #[test]
    fn test_rtsp_sources_force_tcp() {
        let args = probe_args("rtsp://cam/stream");
        assert!(args.windows(2).any(|w| w == ["-rtsp_transport", "tcp"]));
        assert_eq!(args.last().unwrap(), "csv=p=0");

        let args = probe_args("rtmp://localhost/live/stream");
        assert!(!args.iter().any(|a| a == "-rtsp_transport"));
        assert!(args.iter().any(|a| a == "rtmp://localhost/live/stream"));
    }

    #[tokio::test]
    async fn test_successful_probe() {
        assert!(probe_source(&config("true", 5), "rtsp://x").await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_probe_reports_exit_code() {
        let err = probe_source(&config("false", 5), "rtsp://x").await.unwrap_err();
        assert!(matches!(err, ProbeError::Failed { code: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_missing_prober() {
        let err = probe_source(&config("nonexistent-ffprobe-xyz", 5), "rtsp://x")
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Spawn { .. }));
    }
}
