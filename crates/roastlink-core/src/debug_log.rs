//! Bounded in-memory diagnostic log for support triage.
//!
//! The recorder taps every stage of the pipeline (scan, connect, session,
//! save) without influencing it: appends never block on I/O and never fail.
//! Entries beyond the capacity evict the oldest.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Default number of entries kept.
pub const DEFAULT_CAPACITY: usize = 500;

/// One recorded line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugLogEntry {
    /// When the entry was appended (UTC).
    pub timestamp: OffsetDateTime,
    /// Free-form message.
    pub message: String,
}

impl DebugLogEntry {
    /// Render as `RFC3339 timestamp  message`.
    pub fn to_line(&self) -> String {
        let ts = self
            .timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.timestamp.unix_timestamp().to_string());
        format!("{}  {}", ts, self.message)
    }
}

/// Cloneable handle to a shared ring buffer of [`DebugLogEntry`].
#[derive(Debug, Clone)]
pub struct DebugRecorder {
    inner: Arc<Mutex<VecDeque<DebugLogEntry>>>,
    capacity: usize,
}

impl Default for DebugRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DebugRecorder {
    /// Create a recorder holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    // A panic while holding the lock cannot leave the deque inconsistent,
    // so a poisoned lock is simply taken over.
    fn lock(&self) -> MutexGuard<'_, VecDeque<DebugLogEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message stamped with the current time.
    pub fn append(&self, message: impl Into<String>) {
        let entry = DebugLogEntry {
            timestamp: OffsetDateTime::now_utc(),
            message: message.into(),
        };
        let mut entries = self.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Snapshot of all entries, oldest first.
    pub fn all(&self) -> Vec<DebugLogEntry> {
        self.lock().iter().cloned().collect()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Render the whole log, one entry per line.
    pub fn export_text(&self) -> String {
        let entries = self.lock();
        let mut out = String::new();
        for entry in entries.iter() {
            out.push_str(&entry.to_line());
            out.push('\n');
        }
        out
    }

    /// Write [`export_text`](Self::export_text) to a file.
    pub fn write_to(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, self.export_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_export() {
        let log = DebugRecorder::default();
        assert!(log.is_empty());
        log.append("scan started");
        log.append("found CoffeeLab 2041");

        let lines: Vec<String> = log.export_text().lines().map(String::from).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("  scan started"));
        // RFC3339 timestamps start with the year
        assert!(lines[0].starts_with("20"));
        assert!(lines[1].contains("found CoffeeLab 2041"));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let log = DebugRecorder::new(3);
        for i in 0..5 {
            log.append(format!("entry {i}"));
        }
        let entries = log.all();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "entry 2");
        assert_eq!(entries[2].message, "entry 4");
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let log = DebugRecorder::new(0);
        log.append("a");
        log.append("b");
        assert_eq!(log.len(), 1);
        assert_eq!(log.all()[0].message, "b");
    }

    #[test]
    fn test_clones_share_buffer() {
        let log = DebugRecorder::default();
        let other = log.clone();
        other.append("from clone");
        assert_eq!(log.len(), 1);
        log.clear();
        assert!(other.is_empty());
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let log = DebugRecorder::default();
        let clone = log.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.inner.lock().unwrap();
            panic!("poison");
        })
        .join();

        log.append("still works");
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug.log");

        let log = DebugRecorder::default();
        log.append("connect ok");
        log.write_to(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("connect ok"));
    }
}
