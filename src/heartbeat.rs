//! Append-only heartbeat log: one `filename|YYYY-MM-DD HH:MM:SS` line per
//! completed segment. Timestamps are UTC.
//!
//! The observer is the only writer. Readers (check loop, status endpoint)
//! open the file independently and only ever look at the tail.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Timestamp format used on disk.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Bytes read from the end of the file when looking for the last entry.
const TAIL_CHUNK: u64 = 4096;

/// One completed segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub filename: String,
    /// UTC detection time.
    pub completed_at: NaiveDateTime,
}

impl LogEntry {
    pub fn new(filename: impl Into<String>, completed_at: NaiveDateTime) -> Self {
        Self {
            filename: filename.into(),
            completed_at,
        }
    }

    /// Parse a single log line. Returns `None` for blank or malformed lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        // Filenames may themselves contain '|', the timestamp never does.
        let (filename, timestamp) = line.rsplit_once('|')?;
        if filename.is_empty() {
            return None;
        }
        let completed_at = NaiveDateTime::parse_from_str(timestamp.trim(), TIMESTAMP_FORMAT).ok()?;
        Some(Self::new(filename, completed_at))
    }

    /// Render as a log line (without trailing newline).
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}",
            self.filename,
            self.completed_at.format(TIMESTAMP_FORMAT)
        )
    }
}

/// Handle on the heartbeat log file.
#[derive(Debug, Clone)]
pub struct HeartbeatLog {
    path: PathBuf,
}

impl HeartbeatLog {
    /// Reference the log at `path`, creating an empty file if none exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogIoError> {
        let path = path.into();
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LogIoError::Open {
                path: path.clone(),
                source: e,
            })?;
        Ok(Self { path })
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Append one entry.
    pub fn append(&self, entry: &LogEntry) -> Result<(), LogIoError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LogIoError::Open {
                path: self.path.clone(),
                source: e,
            })?;
        writeln!(file, "{}", entry.to_line()).map_err(|e| LogIoError::Write {
            path: self.path.clone(),
            source: e,
        })
    }

    /// All parseable entries in append order.
    pub fn entries(&self) -> Result<Vec<LogEntry>, LogIoError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| self.read_error(e))?;
        Ok(parse_lines(&contents))
    }

    /// The last `limit` entries in append order.
    pub fn tail(&self, limit: usize) -> Result<Vec<LogEntry>, LogIoError> {
        let entries = self.entries()?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }

    /// The most recent entry, reading only the end of the file.
    pub fn last_entry(&self) -> Result<Option<LogEntry>, LogIoError> {
        let mut file = std::fs::File::open(&self.path).map_err(|e| self.read_error(e))?;
        let len = file.metadata().map_err(|e| self.read_error(e))?.len();
        let start = len.saturating_sub(TAIL_CHUNK);
        file.seek(SeekFrom::Start(start))
            .map_err(|e| self.read_error(e))?;

        let mut buf = Vec::with_capacity((len - start) as usize);
        file.read_to_end(&mut buf).map_err(|e| self.read_error(e))?;
        let chunk = String::from_utf8_lossy(&buf);

        // When the chunk starts mid-file its first line may be cut off.
        let mut lines: Vec<&str> = chunk.lines().collect();
        if start > 0 && !lines.is_empty() {
            lines.remove(0);
        }
        if let Some(entry) = lines.iter().rev().find_map(|l| LogEntry::parse(l)) {
            return Ok(Some(entry));
        }
        if start == 0 {
            return Ok(None);
        }

        // The tail held only garbage or blank lines; fall back to a full scan.
        Ok(self.entries()?.pop())
    }

    fn read_error(&self, source: std::io::Error) -> LogIoError {
        LogIoError::Read {
            path: self.path.clone(),
            source,
        }
    }
}

fn parse_lines(contents: &str) -> Vec<LogEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let entry = LogEntry::parse(line);
            if entry.is_none() && !line.trim().is_empty() {
                tracing::debug!(line, "skipping malformed heartbeat line");
            }
            entry
        })
        .collect()
}

/// Errors from heartbeat log I/O.
#[derive(Debug)]
pub enum LogIoError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LogIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogIoError::Open { path, source } => {
                write!(f, "failed to open heartbeat log {}: {source}", path.display())
            }
            LogIoError::Write { path, source } => {
                write!(f, "failed to append to heartbeat log {}: {source}", path.display())
            }
            LogIoError::Read { path, source } => {
                write!(f, "failed to read heartbeat log {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LogIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogIoError::Open { source, .. } => Some(source),
            LogIoError::Write { source, .. } => Some(source),
            LogIoError::Read { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap()
    }

    #[test]
    fn test_parse_line() {
        let entry = LogEntry::parse("seg_0001.mp4|2024-01-01 10:00:00").unwrap();
        assert_eq!(entry.filename, "seg_0001.mp4");
        assert_eq!(entry.completed_at, ts("2024-01-01 10:00:00"));
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(LogEntry::parse("").is_none());
        assert!(LogEntry::parse("   ").is_none());
        assert!(LogEntry::parse("seg_0001.mp4").is_none());
        assert!(LogEntry::parse("|2024-01-01 10:00:00").is_none());
        assert!(LogEntry::parse("seg.mp4|yesterday").is_none());
    }

    #[test]
    fn test_parse_filename_containing_pipe() {
        let entry = LogEntry::parse("odd|name.mp4|2024-01-01 10:00:00").unwrap();
        assert_eq!(entry.filename, "odd|name.mp4");
    }

    #[test]
    fn test_to_line_format() {
        let entry = LogEntry::new("seg_0002.mp4", ts("2024-01-01 10:00:15"));
        assert_eq!(entry.to_line(), "seg_0002.mp4|2024-01-01 10:00:15");
    }

    #[test]
    fn test_open_creates_empty_log() {
        let dir = tempdir().unwrap();
        let log = HeartbeatLog::open(dir.path().join("heartbeat.log")).unwrap();
        assert!(log.path().exists());
        assert!(log.entries().unwrap().is_empty());
        assert_eq!(log.last_entry().unwrap(), None);
    }

    #[test]
    fn test_append_preserves_order() {
        let dir = tempdir().unwrap();
        let log = HeartbeatLog::open(dir.path().join("heartbeat.log")).unwrap();
        log.append(&LogEntry::new("a.mp4", ts("2024-01-01 10:00:00")))
            .unwrap();
        log.append(&LogEntry::new("b.mp4", ts("2024-01-01 10:00:15")))
            .unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].filename, "a.mp4");
        assert_eq!(entries[1].filename, "b.mp4");
        assert_eq!(log.last_entry().unwrap().unwrap().filename, "b.mp4");

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(
            contents,
            "a.mp4|2024-01-01 10:00:00\nb.mp4|2024-01-01 10:00:15\n"
        );
    }

    #[test]
    fn test_reopen_keeps_existing_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heartbeat.log");
        HeartbeatLog::open(&path)
            .unwrap()
            .append(&LogEntry::new("a.mp4", ts("2024-01-01 10:00:00")))
            .unwrap();

        let log = HeartbeatLog::open(&path).unwrap();
        assert_eq!(log.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_trailing_blank_lines_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heartbeat.log");
        std::fs::write(&path, "a.mp4|2024-01-01 10:00:00\n\n\n   \n").unwrap();

        let log = HeartbeatLog::open(&path).unwrap();
        assert_eq!(log.entries().unwrap().len(), 1);
        assert_eq!(log.last_entry().unwrap().unwrap().filename, "a.mp4");
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heartbeat.log");
        std::fs::write(
            &path,
            "a.mp4|2024-01-01 10:00:00\ngarbage\nb.mp4|2024-01-01 10:00:15\nhalf|2024-0",
        )
        .unwrap();

        let log = HeartbeatLog::open(&path).unwrap();
        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(log.last_entry().unwrap().unwrap().filename, "b.mp4");
    }

    #[test]
    fn test_last_entry_on_large_log_reads_tail() {
        let dir = tempdir().unwrap();
        let log = HeartbeatLog::open(dir.path().join("heartbeat.log")).unwrap();
        let base = ts("2024-01-01 00:00:00");
        for i in 0..500 {
            let at = base + chrono::Duration::seconds(i * 15);
            log.append(&LogEntry::new(format!("seg_{i:05}.mp4"), at))
                .unwrap();
        }
        assert!(std::fs::metadata(log.path()).unwrap().len() > TAIL_CHUNK);

        let last = log.last_entry().unwrap().unwrap();
        assert_eq!(last.filename, "seg_00499.mp4");
        assert_eq!(last.completed_at, base + chrono::Duration::seconds(499 * 15));

        let tail = log.tail(3).unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].filename, "seg_00497.mp4");
    }

    #[test]
    fn test_last_entry_falls_back_when_tail_is_blank() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heartbeat.log");
        let mut contents = String::from("a.mp4|2024-01-01 10:00:00\n");
        contents.push_str(&"\n".repeat(TAIL_CHUNK as usize + 10));
        std::fs::write(&path, contents).unwrap();

        let log = HeartbeatLog::open(&path).unwrap();
        assert_eq!(log.last_entry().unwrap().unwrap().filename, "a.mp4");
    }

    #[test]
    fn test_append_to_missing_dir_fails() {
        let log = HeartbeatLog {
            path: PathBuf::from("/nonexistent-dir/heartbeat.log"),
        };
        let err = log
            .append(&LogEntry::new("a.mp4", ts("2024-01-01 10:00:00")))
            .unwrap_err();
        assert!(matches!(err, LogIoError::Open { .. }));
        assert!(err.to_string().contains("heartbeat log"));
    }
}
