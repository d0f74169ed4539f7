use crate::heartbeat::LogEntry;
use chrono::NaiveDateTime;
use std::time::{Duration, Instant};

/// Why a stream was judged stale (or not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The newest segment is recent enough.
    Fresh,
    /// No segment since the session started, still inside the startup grace.
    AwaitingFirstSegment,
    /// The newest segment is older than the stale threshold.
    SegmentTooOld,
    /// No segment appeared within the startup grace.
    StartupGraceExceeded,
    /// The child exited on its own.
    ProcessExited,
    /// There is no live session (a previous start failed).
    NoSession,
}

/// Outcome of one staleness check. Derived on every tick, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessVerdict {
    pub is_stale: bool,
    pub reason: StaleReason,
    /// Seconds since the reference point (last segment or session start).
    pub elapsed_secs: i64,
}

impl StalenessVerdict {
    pub fn stale(reason: StaleReason, elapsed_secs: i64) -> Self {
        Self {
            is_stale: true,
            reason,
            elapsed_secs,
        }
    }
}

/// Pure staleness decision.
///
/// A stream is stale when the newest segment of the current session is more
/// than `stale_threshold` old, or when the session has produced nothing for
/// more than `startup_grace`. Both comparisons are strict: an elapsed time
/// exactly equal to the limit is still healthy.
#[derive(Debug, Clone, Copy)]
pub struct StalenessPolicy {
    pub stale_threshold: Duration,
    pub startup_grace: Duration,
}

impl StalenessPolicy {
    pub fn new(stale_threshold: Duration, startup_grace: Duration) -> Self {
        Self {
            stale_threshold,
            startup_grace,
        }
    }

    /// Judge from heartbeat log timestamps. All three arguments must come
    /// from the same clock (UTC).
    pub fn evaluate(
        &self,
        last_entry: Option<&LogEntry>,
        session_started_at: NaiveDateTime,
        now: NaiveDateTime,
    ) -> StalenessVerdict {
        // Entries left over from an earlier session are audit trail, not a
        // heartbeat for this one.
        let current = last_entry.filter(|e| e.completed_at >= session_started_at);

        match current {
            Some(entry) => self.judge_segment((now - entry.completed_at).num_seconds()),
            None => self.judge_startup((now - session_started_at).num_seconds()),
        }
    }

    /// Same rules applied to monotonic ages, for when the wall clock has
    /// been stepped. `since_segment` is `None` until the session's first
    /// heartbeat.
    pub fn evaluate_elapsed(
        &self,
        since_segment: Option<Duration>,
        since_start: Duration,
    ) -> StalenessVerdict {
        match since_segment {
            Some(age) => self.judge_segment(whole_secs(age)),
            None => self.judge_startup(whole_secs(since_start)),
        }
    }

    fn judge_segment(&self, elapsed: i64) -> StalenessVerdict {
        let is_stale = exceeds(elapsed, self.stale_threshold);
        StalenessVerdict {
            is_stale,
            reason: if is_stale {
                StaleReason::SegmentTooOld
            } else {
                StaleReason::Fresh
            },
            elapsed_secs: elapsed,
        }
    }

    fn judge_startup(&self, elapsed: i64) -> StalenessVerdict {
        let is_stale = exceeds(elapsed, self.startup_grace);
        StalenessVerdict {
            is_stale,
            reason: if is_stale {
                StaleReason::StartupGraceExceeded
            } else {
                StaleReason::AwaitingFirstSegment
            },
            elapsed_secs: elapsed,
        }
    }
}

fn exceeds(elapsed_secs: i64, limit: Duration) -> bool {
    elapsed_secs > 0 && elapsed_secs as u64 > limit.as_secs()
}

fn whole_secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

/// Monotonic record of heartbeat progress within one session.
///
/// Tracks when the newest log entry last changed, as seen by the check loop.
/// Ages measured here lag the true age by at most one check interval, so
/// they can only under-report staleness.
#[derive(Debug, Clone)]
pub struct HeartbeatClock {
    session_started: Instant,
    newest: Option<String>,
    changed_at: Option<Instant>,
}

impl HeartbeatClock {
    /// `newest` is the log's newest filename when the session started; it
    /// does not count as a heartbeat of the new session.
    pub fn new(session_started: Instant, newest: Option<String>) -> Self {
        Self {
            session_started,
            newest,
            changed_at: None,
        }
    }

    pub fn observe(&mut self, newest: Option<&LogEntry>, now: Instant) {
        let Some(entry) = newest else {
            return;
        };
        if self.newest.as_deref() != Some(entry.filename.as_str()) {
            self.newest = Some(entry.filename.clone());
            self.changed_at = Some(now);
        }
    }

    pub fn since_heartbeat(&self, now: Instant) -> Option<Duration> {
        self.changed_at.map(|at| now.saturating_duration_since(at))
    }

    pub fn since_start(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.session_started)
    }
}

/// Window after supervisor start during which verdicts are not acted upon.
#[derive(Debug, Clone, Copy)]
pub struct SuppressionWindow {
    started: Instant,
    length: Duration,
}

impl SuppressionWindow {
    pub fn new(started: Instant, length: Duration) -> Self {
        Self { started, length }
    }

    pub fn is_active(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) < self.length
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.length
            .saturating_sub(now.saturating_duration_since(self.started))
    }
}
