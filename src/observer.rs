//! Output observer: polls the output directory for segments that have
//! finished writing and records each one in the heartbeat log.
//!
//! Completion is decided by a [`CompletionDetector`]. The default,
//! [`SettleBySize`], samples every candidate's size, waits the settle
//! interval once, and samples again; unchanged files are complete.

use crate::config::WatchdogConfig;
use crate::heartbeat::{HeartbeatLog, LogEntry};
use chrono::{Timelike, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;

/// Allowance for file timestamps, which come from a coarser kernel clock.
const MTIME_SLACK: Duration = Duration::from_millis(20);

/// A candidate judged complete, with its final size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Strategy for deciding which candidate files are done being written.
pub trait CompletionDetector: Send + Sync + 'static {
    /// Return the subset of `candidates` that are complete. Files that
    /// vanish or cannot be stat'ed are left out, not reported as errors.
    fn settled(&self, candidates: Vec<PathBuf>) -> impl Future<Output = Vec<SettledFile>> + Send;
}

/// Two-sample size comparison across a settle interval.
#[derive(Debug, Clone, Copy)]
pub struct SettleBySize {
    pub settle: Duration,
}

impl CompletionDetector for SettleBySize {
    async fn settled(&self, candidates: Vec<PathBuf>) -> Vec<SettledFile> {
        let mut first = Vec::with_capacity(candidates.len());
        for path in candidates {
            match tokio::fs::metadata(&path).await {
                Ok(meta) => first.push((path, meta.len())),
                Err(e) => {
                    tracing::debug!(file = %path.display(), error = %e, "stat failed, deferring");
                }
            }
        }
        if first.is_empty() {
            return Vec::new();
        }

        tokio::time::sleep(self.settle).await;

        let mut done = Vec::new();
        for (path, before) in first {
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.len() == before => done.push(SettledFile { path, size: before }),
                Ok(meta) => {
                    tracing::debug!(
                        file = %path.display(),
                        before,
                        after = meta.len(),
                        "segment still growing"
                    );
                }
                Err(e) => {
                    tracing::debug!(file = %path.display(), error = %e, "stat failed, deferring");
                }
            }
        }
        done
    }
}

/// Observer settings, usually derived from [`WatchdogConfig`].
#[derive(Debug, Clone)]
pub struct ObserverSettings {
    pub dir: PathBuf,
    pub extension: String,
    pub poll_interval: Duration,
    pub min_segment_bytes: u64,
    /// Logged segments kept besides the two newest; 0 disables cleanup.
    pub keep_segments: usize,
    pub retention_interval: Duration,
}

impl ObserverSettings {
    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self {
            dir: config.capture.output_dir.clone(),
            extension: config.capture.extension.clone(),
            poll_interval: config.observer.poll_interval(),
            min_segment_bytes: config.observer.min_segment_bytes,
            keep_segments: config.retention.keep_segments,
            retention_interval: Duration::from_secs(config.retention.interval_secs),
        }
    }
}

pub struct OutputObserver<D = SettleBySize> {
    settings: ObserverSettings,
    pattern: glob::Pattern,
    log: HeartbeatLog,
    detector: D,
    /// Spawn time of the current capture session. Files last modified
    /// before it belong to an earlier session or run.
    baseline: watch::Receiver<SystemTime>,
    seen: HashSet<PathBuf>,
    last_cleanup: Option<Instant>,
}

impl<D: CompletionDetector> OutputObserver<D> {
    pub fn new(
        settings: ObserverSettings,
        log: HeartbeatLog,
        detector: D,
        baseline: watch::Receiver<SystemTime>,
    ) -> Self {
        let pattern = glob::Pattern::new(&format!(
            "*.{}",
            glob::Pattern::escape(&settings.extension)
        ))
        .unwrap_or_default();
        Self {
            settings,
            pattern,
            log,
            detector,
            baseline,
            seen: HashSet::new(),
            last_cleanup: None,
        }
    }

    /// Number of files recorded (or skipped as pre-existing) so far.
    #[cfg(test)]
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// One scan of the output directory. Returns how many segments were logged.
    pub async fn poll_once(&mut self) -> usize {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return 0;
        }

        let mut settled = self.detector.settled(candidates).await;
        settled.sort_by(|a, b| a.path.cmp(&b.path));

        // The session may have been replaced while the detector waited.
        let baseline = *self.baseline.borrow();
        let mut logged = 0;
        for file in settled {
            if modified_before(&file.path, baseline) {
                tracing::debug!(
                    file = %file.path.display(),
                    "segment from a replaced session, not logged"
                );
                self.seen.insert(file.path);
                continue;
            }
            if file.size < self.settings.min_segment_bytes {
                tracing::debug!(
                    file = %file.path.display(),
                    size = file.size,
                    min = self.settings.min_segment_bytes,
                    "segment below minimum size, not logged yet"
                );
                continue;
            }
            let Some(filename) = file_name(&file.path) else {
                continue;
            };

            let now = Utc::now().naive_utc();
            let entry = LogEntry::new(filename, now.with_nanosecond(0).unwrap_or(now));
            match self.log.append(&entry) {
                Ok(()) => {
                    tracing::info!(file = %entry.filename, size = file.size, "segment complete");
                    self.seen.insert(file.path);
                    logged += 1;
                }
                Err(e) => {
                    // Left out of `seen`, so the next poll tries again.
                    tracing::warn!(error = %e, file = %entry.filename, "failed to record segment");
                }
            }
        }
        logged
    }

    /// Matching, unseen files in the output directory.
    fn candidates(&mut self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.settings.dir) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(
                    dir = %self.settings.dir.display(),
                    error = %e,
                    "failed to list output directory"
                );
                return Vec::new();
            }
        };

        let baseline = *self.baseline.borrow();
        let mut candidates = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if self.seen.contains(&path) {
                continue;
            }
            let Some(name) = file_name(&path) else {
                continue;
            };
            if !self.pattern.matches(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            if meta.modified().is_ok_and(|m| m + MTIME_SLACK < baseline) {
                tracing::debug!(file = %name, "ignoring segment from an earlier session");
                self.seen.insert(path);
                continue;
            }
            candidates.push(path);
        }
        candidates.sort();
        candidates
    }

    /// Delete the oldest logged segments beyond `keep_segments + 2`.
    /// Files not yet logged are never touched. Returns the number removed.
    pub fn enforce_retention(&mut self) -> usize {
        if self.settings.keep_segments == 0 {
            return 0;
        }
        let entries = match std::fs::read_dir(&self.settings.dir) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read output directory for cleanup");
                return 0;
            }
        };

        let mut files: Vec<(SystemTime, PathBuf)> = entries
            .flatten()
            .filter(|e| file_name(&e.path()).is_some_and(|n| self.pattern.matches(&n)))
            .filter_map(|e| {
                let modified = e.metadata().ok()?.modified().ok()?;
                Some((modified, e.path()))
            })
            .collect();
        // Newest first; name breaks ties within one mtime tick.
        files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        let keep = self.settings.keep_segments + 2;
        let mut removed = 0;
        for (_, path) in files.into_iter().skip(keep) {
            if !self.seen.contains(&path) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!(file = %path.display(), "removed old segment");
                    self.seen.remove(&path);
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        file = %path.display(),
                        error = %e,
                        "failed to remove old segment"
                    );
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "segment cleanup finished");
        }
        removed
    }

    fn cleanup_due(&self, now: Instant) -> bool {
        if self.settings.keep_segments == 0 {
            return false;
        }
        match self.last_cleanup {
            Some(at) => now.saturating_duration_since(at) >= self.settings.retention_interval,
            None => true,
        }
    }

    /// Poll until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::debug!(dir = %self.settings.dir.display(), "output observer started");

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = self.poll_once() => {}
            }
            let now = Instant::now();
            if self.cleanup_due(now) {
                self.enforce_retention();
                self.last_cleanup = Some(now);
            }
        }
        tracing::debug!("output observer stopped");
    }
}

fn modified_before(path: &Path, baseline: SystemTime) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .is_ok_and(|m| m + MTIME_SLACK < baseline)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
}
