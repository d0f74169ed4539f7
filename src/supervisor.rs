//! Supervisor: owns the capture process and the two background loops.
//!
//! While running, the check loop task owns the [`CaptureProcess`] outright
//! and hands it back through its join handle on shutdown. The observer is
//! the only writer of the heartbeat log; the check loop only reads its tail.

use crate::capture::{self, CaptureError, CaptureProcess};
use crate::config::WatchdogConfig;
use crate::heartbeat::{HeartbeatLog, LogIoError};
use crate::observer::{ObserverSettings, OutputObserver, SettleBySize};
use crate::staleness::{
    HeartbeatClock, StaleReason, StalenessPolicy, StalenessVerdict, SuppressionWindow,
};
use crate::status::{StatusData, StatusFile, StatusTracker, SupervisorState};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Result of one check tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Inside the initial suppression window; nothing evaluated.
    Suppressed,
    /// The heartbeat log could not be read; retried next tick.
    Skipped,
    Healthy(StalenessVerdict),
    Restarted {
        verdict: StalenessVerdict,
        succeeded: bool,
    },
}

/// Periodic staleness check plus the capture process it restarts.
pub struct CheckLoop {
    capture: CaptureProcess,
    log: HeartbeatLog,
    policy: StalenessPolicy,
    suppression: SuppressionWindow,
    suppression_len: Duration,
    interval: Duration,
    tracker: StatusTracker,
    /// Monotonic heartbeat progress of the current session.
    clock: HeartbeatClock,
    /// Spawn time of the current session, read by the observer.
    baseline: watch::Sender<SystemTime>,
}

impl CheckLoop {
    pub fn new(
        capture: CaptureProcess,
        log: HeartbeatLog,
        policy: StalenessPolicy,
        interval: Duration,
        suppression: Duration,
        tracker: StatusTracker,
    ) -> Self {
        let now = Instant::now();
        let (baseline, _) = watch::channel(SystemTime::now());
        Self {
            capture,
            log,
            policy,
            suppression: SuppressionWindow::new(now, suppression),
            suppression_len: suppression,
            interval,
            tracker,
            clock: HeartbeatClock::new(now, None),
            baseline,
        }
    }

    /// Receiver for the observer: moves forward with every new session.
    pub fn observer_baseline(&self) -> watch::Receiver<SystemTime> {
        self.baseline.subscribe()
    }

    /// Start the capture process and reset per-session tracking.
    pub async fn start_capture(&mut self) -> Result<(), CaptureError> {
        let started = self.capture.start().await.map(|_| ());
        self.after_spawn_attempt(started.is_ok());
        started
    }

    fn after_spawn_attempt(&mut self, succeeded: bool) {
        let Some(session) = self.capture.session().filter(|_| succeeded) else {
            // Whatever the old session still leaves behind is not a heartbeat.
            self.baseline.send_replace(SystemTime::now());
            self.tracker.clear_session();
            return;
        };
        self.baseline.send_replace(session.spawned_at);
        let newest = match self.log.last_entry() {
            Ok(entry) => entry.map(|e| e.filename),
            Err(e) => {
                log_read_failure(&e);
                None
            }
        };
        self.clock = HeartbeatClock::new(session.started, newest);
        self.tracker.set_session(session);
    }

    /// Restart the suppression window from `now`.
    fn arm_suppression(&mut self, now: Instant) {
        self.suppression = SuppressionWindow::new(now, self.suppression_len);
    }

    /// Current verdict, or `None` when the log cannot be read.
    ///
    /// The timestamp verdict is checked against monotonic heartbeat ages; a
    /// stepped wall clock can hide a stall from the former but not the latter.
    fn verdict(&mut self, now: Instant) -> Option<StalenessVerdict> {
        if self.capture.poll_exit().is_some() {
            self.tracker.clear_session();
            return Some(StalenessVerdict::stale(StaleReason::ProcessExited, 0));
        }
        let started_at = match self.capture.session() {
            Some(session) => session.started_at,
            None => return Some(StalenessVerdict::stale(StaleReason::NoSession, 0)),
        };

        let last = match self.log.last_entry() {
            Ok(last) => last,
            Err(e) => {
                log_read_failure(&e);
                return None;
            }
        };
        let wall = self
            .policy
            .evaluate(last.as_ref(), started_at, Utc::now().naive_utc());
        self.clock.observe(last.as_ref(), now);
        let steady = self.policy.evaluate_elapsed(
            self.clock.since_heartbeat(now),
            self.clock.since_start(now),
        );
        self.tracker.set_last_segment(last);

        if steady.is_stale && !wall.is_stale {
            tracing::warn!(
                wall_elapsed_secs = wall.elapsed_secs,
                steady_elapsed_secs = steady.elapsed_secs,
                "wall clock disagrees with heartbeat age, trusting the monotonic clock"
            );
            return Some(steady);
        }
        Some(wall)
    }

    /// Evaluate once and restart the capture process if the stream is stale.
    pub async fn tick(&mut self, now: Instant) -> TickOutcome {
        if self.suppression.is_active(now) {
            tracing::debug!(
                remaining_secs = self.suppression.remaining(now).as_secs(),
                "staleness checks suppressed"
            );
            return TickOutcome::Suppressed;
        }

        let Some(verdict) = self.verdict(now) else {
            return TickOutcome::Skipped;
        };
        if !verdict.is_stale {
            tracing::debug!(
                reason = ?verdict.reason,
                elapsed_secs = verdict.elapsed_secs,
                "stream healthy"
            );
            return TickOutcome::Healthy(verdict);
        }

        tracing::warn!(
            reason = ?verdict.reason,
            elapsed_secs = verdict.elapsed_secs,
            "stream stale, restarting capture"
        );
        self.tracker.update(SupervisorState::Restarting);

        let restarted = self.capture.restart().await.map(|_| ());
        let succeeded = restarted.is_ok();
        self.after_spawn_attempt(succeeded);
        if let Err(e) = restarted {
            // Unbounded retry: the next tick tries again.
            tracing::error!(error = %e, "capture restart failed, retrying next tick");
        }
        self.tracker.record_restart(succeeded);
        if succeeded {
            tracing::info!(restarts = self.tracker.restarts(), "capture restarted");
        } else {
            tracing::warn!(
                consecutive_failures = self.tracker.consecutive_failures(),
                "capture still down"
            );
        }
        self.tracker.update(SupervisorState::Running);

        TickOutcome::Restarted { verdict, succeeded }
    }

    /// Tick every `interval` until `shutdown` flips, then return self so the
    /// caller can stop the capture process.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::debug!(interval_secs = self.interval.as_secs_f64(), "check loop started");

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {}
            }
            // A restart in progress is allowed to finish.
            self.tick(Instant::now()).await;
        }
        tracing::debug!("check loop stopped");
        self
    }
}

fn log_read_failure(e: &LogIoError) {
    tracing::warn!(error = %e, "cannot read heartbeat log, skipping check");
}

/// Errors surfaced by [`Supervisor::start`].
#[derive(Debug)]
pub enum StartError {
    OutputDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    Log(LogIoError),
    Capture(CaptureError),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::OutputDir { path, source } => {
                write!(f, "cannot create output directory {}: {source}", path.display())
            }
            StartError::Log(e) => write!(f, "{e}"),
            StartError::Capture(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::OutputDir { source, .. } => Some(source),
            StartError::Log(e) => Some(e),
            StartError::Capture(e) => Some(e),
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    check: JoinHandle<CheckLoop>,
    observer: JoinHandle<()>,
}

/// Composition root: capture process, output observer, and check loop.
pub struct Supervisor {
    config: WatchdogConfig,
    state: Arc<watch::Sender<SupervisorState>>,
    /// The check loop while no task owns it.
    idle: Option<CheckLoop>,
    running: Option<Running>,
}

impl Supervisor {
    pub fn new(config: WatchdogConfig) -> Self {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        Self {
            config,
            state: Arc::new(state),
            idle: None,
            running: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    fn build_check_loop(&self, log: HeartbeatLog) -> CheckLoop {
        let cfg = &self.config;
        CheckLoop::new(
            CaptureProcess::from_config(cfg),
            log,
            StalenessPolicy::new(
                Duration::from_secs(cfg.watchdog.stale_threshold_secs),
                Duration::from_secs(cfg.watchdog.startup_grace_secs),
            ),
            cfg.watchdog.check_interval(),
            cfg.watchdog.suppression(),
            StatusTracker::new(cfg.status_path(), self.state.clone()),
        )
    }

    /// Start the capture process, then the observer and check loop.
    /// On failure the supervisor stays stopped and can be started again.
    pub async fn start(&mut self) -> Result<(), StartError> {
        if self.running.is_some() {
            tracing::warn!("supervisor already running");
            return Ok(());
        }

        let output_dir = self.config.capture.output_dir.clone();
        std::fs::create_dir_all(&output_dir).map_err(|e| StartError::OutputDir {
            path: output_dir.clone(),
            source: e,
        })?;
        let log = HeartbeatLog::open(self.config.log_path()).map_err(StartError::Log)?;

        let mut check = match self.idle.take() {
            Some(check) => check,
            None => self.build_check_loop(log.clone()),
        };
        check.tracker.update(SupervisorState::Starting);

        if let Err(e) = check.start_capture().await {
            tracing::error!(error = %e, "initial capture start failed");
            check.tracker.update(SupervisorState::Stopped);
            self.idle = Some(check);
            return Err(StartError::Capture(e));
        }
        check.arm_suppression(Instant::now());

        let observer = OutputObserver::new(
            ObserverSettings::from_config(&self.config),
            log,
            SettleBySize {
                settle: self.config.observer.settle_interval(),
            },
            check.observer_baseline(),
        );

        let (shutdown, rx) = watch::channel(false);
        check.tracker.update(SupervisorState::Running);
        let observer = tokio::spawn(observer.run(rx.clone()));
        let check = tokio::spawn(check.run(rx));
        self.running = Some(Running {
            shutdown,
            check,
            observer,
        });

        tracing::info!(output_dir = %output_dir.display(), "supervisor running");
        Ok(())
    }

    /// Stop both loops, wait for them (bounded), then stop the capture
    /// process. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let Running {
                shutdown,
                mut check,
                mut observer,
            } = running;
            let _ = shutdown.send(true);
            let join_timeout = self.config.shutdown.join_timeout();

            match tokio::time::timeout(join_timeout, &mut observer).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "output observer task failed"),
                Err(_) => {
                    tracing::warn!(
                        timeout_secs = join_timeout.as_secs(),
                        "output observer did not stop in time, aborting"
                    );
                    observer.abort();
                    let _ = observer.await;
                }
            }

            match tokio::time::timeout(join_timeout, &mut check).await {
                Ok(Ok(check)) => self.idle = Some(check),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "check loop task failed");
                    self.reap_lost_session();
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_secs = join_timeout.as_secs(),
                        "check loop did not stop in time, aborting"
                    );
                    check.abort();
                    let _ = check.await;
                    self.reap_lost_session();
                }
            }
        }

        match self.idle.as_mut() {
            Some(check) => {
                let outcome = check.capture.stop().await;
                tracing::info!(?outcome, "capture process stopped");
                check.tracker.clear_session();
                check.tracker.update(SupervisorState::Stopped);
                check.tracker.remove();
            }
            None => {
                self.state.send_replace(SupervisorState::Stopped);
            }
        }
        tracing::info!("supervisor stopped");
    }

    /// The check loop task died with the capture process inside it. Its
    /// child only got SIGKILL on drop, so kill the whole group using the
    /// pid last published in the status file, then drop the file.
    fn reap_lost_session(&self) {
        let status = StatusFile::new(self.config.status_path());
        match status.read() {
            Ok(Some(StatusData {
                session_pid: Some(pid),
                ..
            })) => {
                tracing::warn!(pid, "killing capture process group of the lost check loop");
                capture::kill_group(pid);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "cannot read status file to find the capture pid");
            }
        }
        status.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::LaunchSpec;
    use crate::heartbeat::LogEntry;
    use crate::status::StatusFile;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn launch(dir: &Path, command: &str, script: &str) -> LaunchSpec {
        LaunchSpec {
            command: command.to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            source_url: "rtsp://cam.local/stream".to_string(),
            output_dir: dir.to_path_buf(),
            extension: "mp4".to_string(),
            segment_prefix: "seg".to_string(),
            segment_duration_secs: 1,
            resolution: "640x480".to_string(),
            fps: 10,
        }
    }

    fn check_loop(
        dir: &TempDir,
        spec: LaunchSpec,
        startup_grace: Duration,
        suppression: Duration,
    ) -> CheckLoop {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        CheckLoop::new(
            CaptureProcess::new(spec, Duration::from_secs(1), Duration::ZERO),
            HeartbeatLog::open(dir.path().join("heartbeat.log")).unwrap(),
            StalenessPolicy::new(Duration::from_secs(45), startup_grace),
            Duration::from_millis(100),
            suppression,
            StatusTracker::new(dir.path().join("watchdog.status"), Arc::new(state)),
        )
    }

    fn config(dir: &Path, script: &str) -> WatchdogConfig {
        let mut config = WatchdogConfig::default();
        config.capture.command = "sh".to_string();
        config.capture.args = vec!["-c".to_string(), script.to_string()];
        config.capture.output_dir = dir.to_path_buf();
        config.watchdog.check_interval_secs = 1;
        config.watchdog.suppression_secs = 0;
        config.watchdog.startup_grace_secs = 1;
        config.shutdown.grace_period_secs = 1;
        config.shutdown.restart_delay_secs = 0;
        config.observer.poll_interval_secs = 1;
        config.observer.settle_interval_ms = 50;
        config
    }

    fn pid_alive(pid: u32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }

    /// Like `pid_alive`, but a zombie waiting for its reaper counts as gone.
    fn process_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z' && state != 'X'),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_tick_suppressed_inside_window() {
        let dir = tempdir().unwrap();
        let mut check = check_loop(
            &dir,
            launch(dir.path(), "sh", "exec sleep 30"),
            Duration::ZERO,
            Duration::from_secs(60),
        );
        check.start_capture().await.unwrap();
        let pid = check.capture.session().unwrap().pid;
        check.arm_suppression(Instant::now());
        tokio::time::sleep(Duration::from_millis(1100)).await;

        // Grace is zero, so this would be stale if it were evaluated.
        assert_eq!(check.tick(Instant::now()).await, TickOutcome::Suppressed);
        assert_eq!(check.capture.session().unwrap().pid, pid);

        let later = Instant::now() + Duration::from_secs(61);
        assert!(matches!(
            check.tick(later).await,
            TickOutcome::Restarted { succeeded: true, .. }
        ));
        assert_ne!(check.capture.session().unwrap().pid, pid);
        check.capture.stop().await;
    }

    #[tokio::test]
    async fn test_tick_healthy_with_fresh_segment() {
        let dir = tempdir().unwrap();
        let mut check = check_loop(
            &dir,
            launch(dir.path(), "sh", "exec sleep 30"),
            Duration::ZERO,
            Duration::ZERO,
        );
        check.start_capture().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        check
            .log
            .append(&LogEntry::new("seg_a_00000.mp4", Utc::now().naive_utc()))
            .unwrap();

        match check.tick(Instant::now()).await {
            TickOutcome::Healthy(verdict) => assert_eq!(verdict.reason, StaleReason::Fresh),
            other => panic!("expected healthy, got {other:?}"),
        }
        check.capture.stop().await;
    }

    #[tokio::test]
    async fn test_tick_restarts_after_startup_grace() {
        let dir = tempdir().unwrap();
        let mut check = check_loop(
            &dir,
            launch(dir.path(), "sh", "exec sleep 30"),
            Duration::ZERO,
            Duration::ZERO,
        );
        check.start_capture().await.unwrap();
        let first = check.capture.session().unwrap().pid;
        tokio::time::sleep(Duration::from_millis(1100)).await;

        match check.tick(Instant::now()).await {
            TickOutcome::Restarted { verdict, succeeded } => {
                assert!(succeeded);
                assert_eq!(verdict.reason, StaleReason::StartupGraceExceeded);
            }
            other => panic!("expected restart, got {other:?}"),
        }
        let second = check.capture.session().unwrap().pid;
        assert_ne!(first, second);
        assert!(!pid_alive(first));
        assert_eq!(check.tracker.restarts(), 1);
        check.capture.stop().await;
    }

    #[tokio::test]
    async fn test_tick_restarts_exited_process() {
        let dir = tempdir().unwrap();
        let mut check = check_loop(
            &dir,
            launch(dir.path(), "sh", "exit 1"),
            Duration::from_secs(60),
            Duration::ZERO,
        );
        check.start_capture().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        match check.tick(Instant::now()).await {
            TickOutcome::Restarted { verdict, .. } => {
                assert_eq!(verdict.reason, StaleReason::ProcessExited)
            }
            other => panic!("expected restart, got {other:?}"),
        }
        check.capture.stop().await;
    }

    #[tokio::test]
    async fn test_failed_restart_retried_until_binary_returns() {
        let dir = tempdir().unwrap();
        let segmenter = dir.path().join("segmenter");
        std::os::unix::fs::symlink("/bin/sh", &segmenter).unwrap();
        let mut check = check_loop(
            &dir,
            launch(dir.path(), segmenter.to_str().unwrap(), "exit 0"),
            Duration::from_secs(60),
            Duration::ZERO,
        );
        check.start_capture().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::remove_file(&segmenter).unwrap();

        assert!(matches!(
            check.tick(Instant::now()).await,
            TickOutcome::Restarted {
                succeeded: false,
                ..
            }
        ));
        assert!(check.capture.session().is_none());
        assert_eq!(check.tracker.state(), SupervisorState::Running);

        match check.tick(Instant::now()).await {
            TickOutcome::Restarted { verdict, succeeded } => {
                assert!(!succeeded);
                assert_eq!(verdict.reason, StaleReason::NoSession);
            }
            other => panic!("expected restart attempt, got {other:?}"),
        }
        assert_eq!(check.tracker.consecutive_failures(), 2);

        std::os::unix::fs::symlink("/bin/sh", &segmenter).unwrap();
        assert!(matches!(
            check.tick(Instant::now()).await,
            TickOutcome::Restarted {
                succeeded: true,
                ..
            }
        ));
        assert_eq!(check.tracker.consecutive_failures(), 0);
        check.capture.stop().await;
    }

    #[tokio::test]
    async fn test_tick_skipped_when_log_unreadable() {
        let dir = tempdir().unwrap();
        let mut check = check_loop(
            &dir,
            launch(dir.path(), "sh", "exec sleep 30"),
            Duration::ZERO,
            Duration::ZERO,
        );
        check.start_capture().await.unwrap();
        std::fs::remove_file(dir.path().join("heartbeat.log")).unwrap();

        assert_eq!(check.tick(Instant::now()).await, TickOutcome::Skipped);
        assert!(check.capture.session().is_some());
        check.capture.stop().await;
    }

    #[tokio::test]
    async fn test_restart_moves_observer_baseline() {
        let dir = tempdir().unwrap();
        let mut check = check_loop(
            &dir,
            launch(dir.path(), "sh", "exec sleep 30"),
            Duration::ZERO,
            Duration::ZERO,
        );
        let baseline = check.observer_baseline();
        check.start_capture().await.unwrap();
        let first = check.capture.session().unwrap().spawned_at;
        assert_eq!(*baseline.borrow(), first);

        let later = Instant::now() + Duration::from_secs(5);
        assert!(matches!(
            check.tick(later).await,
            TickOutcome::Restarted { succeeded: true, .. }
        ));
        let second = check.capture.session().unwrap().spawned_at;
        assert!(second > first);
        assert_eq!(*baseline.borrow(), second);
        check.capture.stop().await;
    }

    #[tokio::test]
    async fn test_tick_stale_by_heartbeat_age_when_wall_clock_looks_fresh() {
        let dir = tempdir().unwrap();
        let mut check = check_loop(
            &dir,
            launch(dir.path(), "sh", "exec sleep 30"),
            Duration::from_secs(60),
            Duration::ZERO,
        );
        check.start_capture().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        check
            .log
            .append(&LogEntry::new("seg_a_00000.mp4", Utc::now().naive_utc()))
            .unwrap();
        let now = Instant::now();
        assert!(matches!(check.tick(now).await, TickOutcome::Healthy(_)));

        // The entry's timestamp still reads as fresh on the wall clock, but
        // no new segment has shown up for 46 monotonic seconds.
        match check.tick(now + Duration::from_secs(46)).await {
            TickOutcome::Restarted { verdict, succeeded } => {
                assert!(succeeded);
                assert_eq!(verdict.reason, StaleReason::SegmentTooOld);
                assert_eq!(verdict.elapsed_secs, 46);
            }
            other => panic!("expected restart, got {other:?}"),
        }
        check.capture.stop().await;
    }

    #[tokio::test]
    async fn test_aborted_check_loop_kills_group_and_removes_status() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        let script = format!(
            "trap '' TERM; sleep 30 & echo $! > {}; wait",
            pid_file.display()
        );
        let mut config = config(dir.path(), &script);
        config.shutdown.grace_period_secs = 5;
        config.shutdown.join_timeout_secs = 1;
        let status = StatusFile::new(config.status_path());
        let mut supervisor = Supervisor::new(config);
        supervisor.start().await.unwrap();

        // The segmenter ignores SIGTERM, so the restart sits in its grace
        // period and the check loop cannot answer shutdown in time.
        let mut restarting = false;
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(Some(data)) = status.read() {
                if data.state == SupervisorState::Restarting {
                    restarting = true;
                    break;
                }
            }
        }
        assert!(restarting, "stale segmenter should be mid-restart");
        let child: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(process_running(child));

        tokio::time::timeout(Duration::from_secs(4), supervisor.stop())
            .await
            .expect("stop should not wait out the restart grace period");
        let mut gone = false;
        for _ in 0..20 {
            if !process_running(child) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "grandchild in the capture group should be killed");
        assert!(status.read().unwrap().is_none());
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_supervisor_start_stop_lifecycle() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), "exec sleep 30");
        config.watchdog.startup_grace_secs = 60;
        let status = StatusFile::new(config.status_path());
        let mut supervisor = Supervisor::new(config);
        assert_eq!(supervisor.state(), SupervisorState::Stopped);

        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Running);
        let data = status.read().unwrap().unwrap();
        assert_eq!(data.state, SupervisorState::Running);
        let pid = data.session_pid.unwrap();
        assert!(pid_alive(pid));

        // A second start while running is a no-op.
        supervisor.start().await.unwrap();
        assert_eq!(status.read().unwrap().unwrap().session_pid, Some(pid));

        tokio::time::timeout(Duration::from_secs(5), supervisor.stop())
            .await
            .expect("stop should finish within the join timeout");
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(!pid_alive(pid));
        assert!(status.read().unwrap().is_none());

        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_then_start_never_overlaps_sessions() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), "exec sleep 30");
        config.watchdog.startup_grace_secs = 60;
        let status = StatusFile::new(config.status_path());
        let mut supervisor = Supervisor::new(config);

        supervisor.start().await.unwrap();
        let first = status.read().unwrap().unwrap().session_pid.unwrap();
        supervisor.stop().await;
        assert!(!pid_alive(first));

        supervisor.start().await.unwrap();
        let second = status.read().unwrap().unwrap().session_pid.unwrap();
        assert_ne!(first, second);
        assert!(!pid_alive(first));
        assert!(pid_alive(second));
        supervisor.stop().await;
        assert!(!pid_alive(second));
    }

    #[tokio::test]
    async fn test_start_failure_then_manual_start_succeeds() {
        let dir = tempdir().unwrap();
        let segmenter = dir.path().join("segmenter");
        let mut config = config(dir.path(), "exec sleep 30");
        config.capture.command = segmenter.to_string_lossy().to_string();
        let mut supervisor = Supervisor::new(config);

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, StartError::Capture(CaptureError::SpawnFailed { .. })));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);

        std::os::unix::fs::symlink("/bin/sh", &segmenter).unwrap();
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Running);
        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_supervisor_restarts_silent_segmenter() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), "exec sleep 30");
        let status = StatusFile::new(config.status_path());
        let mut supervisor = Supervisor::new(config);
        supervisor.start().await.unwrap();
        let first = status.read().unwrap().unwrap().session_pid.unwrap();

        // Grace is 1s and ticks are 1s apart, so a restart lands within ~3s.
        let mut restarted = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(Some(data)) = status.read() {
                if data.restarts > 0 && data.session_pid.is_some_and(|p| p != first) {
                    restarted = true;
                    break;
                }
            }
        }
        assert!(restarted, "silent segmenter should have been restarted");
        assert!(!pid_alive(first));
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_supervisor_logs_segments_written_by_child() {
        let dir = tempdir().unwrap();
        let mut config = config(
            dir.path(),
            "i=0; while true; do printf data > \"$0_$i.mp4\"; i=$((i+1)); sleep 0.3; done",
        );
        // $0 is the first argument after the script: the output directory prefix.
        config.capture.args.push(dir.path().join("seg_test").to_string_lossy().to_string());
        config.watchdog.startup_grace_secs = 60;
        let log_path = config.log_path();
        let mut supervisor = Supervisor::new(config);
        supervisor.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        supervisor.stop().await;

        let entries = HeartbeatLog::open(log_path).unwrap().entries().unwrap();
        assert!(!entries.is_empty());
        let mut names: Vec<_> = entries.iter().map(|e| e.filename.clone()).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total, "each segment is logged once");
    }
}
