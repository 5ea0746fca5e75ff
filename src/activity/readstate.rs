//! Per-thread read-state tracking and reconciliation.
//!
//! The tracker keeps `last_read_at` per thread. A thread is unread iff its
//! most recent notification time is strictly after `last_read_at`; a thread
//! absent from the map has never been read and is unread since the epoch.
//!
//! Local marks are optimistic: `mark_read` takes effect immediately and is
//! propagated to the provider out-of-band. The provider's unread list is
//! authoritative: reconciliation diffs it against the previous poll, emits
//! became-read transitions, and replaces local predictions wholesale.
//!
//! The `last_read_at` map is checkpointed to a JSON file that round-trips
//! exactly.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ThreadKey;
use crate::error::AppError;

/// Source of the externally-authoritative unread-thread list.
#[async_trait]
pub trait UnreadSource: Send + Sync {
    async fn unread_threads(&self) -> Result<Vec<ThreadKey>, AppError>;
}

/// Propagates a local read mark to the provider. Failure leaves the
/// optimistic local mark standing.
#[async_trait]
pub trait ReadMarker: Send + Sync {
    async fn propagate_read(&self, thread: &ThreadKey) -> Result<(), AppError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointEntry {
    thread: ThreadKey,
    last_read_at: DateTime<Utc>,
}

/// Tracks `last_read_at` per thread plus the last authoritative unread set.
#[derive(Debug, Default)]
pub struct ReadStateTracker {
    last_read: HashMap<ThreadKey, DateTime<Utc>>,
    unread: HashSet<ThreadKey>,
}

impl ReadStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local read mark. Monotonic: an earlier timestamp never
    /// lowers an existing mark.
    pub fn mark_read(&mut self, thread: &ThreadKey, at: DateTime<Utc>) {
        let entry = self
            .last_read
            .entry(thread.clone())
            .or_insert(DateTime::UNIX_EPOCH);
        if at > *entry {
            *entry = at;
        }
        self.unread.remove(thread);
    }

    pub fn last_read_at(&self, thread: &ThreadKey) -> Option<DateTime<Utc>> {
        self.last_read.get(thread).copied()
    }

    /// Whether a thread whose most recent notification is at `latest` is
    /// unread. Absence from the map means never read.
    pub fn is_unread(&self, thread: &ThreadKey, latest: DateTime<Utc>) -> bool {
        let last_read = self
            .last_read
            .get(thread)
            .copied()
            .unwrap_or(DateTime::UNIX_EPOCH);
        latest > last_read
    }

    /// Replace predicted state with the authoritative unread set, returning
    /// the threads that became read (`U_old \ U_new`, sorted).
    ///
    /// Threads leaving the unread set get `last_read_at` raised to `now`;
    /// threads the authority still reports unread have any optimistic local
    /// mark cleared.
    pub fn reconcile(
        &mut self,
        new_unread: HashSet<ThreadKey>,
        now: DateTime<Utc>,
    ) -> Vec<ThreadKey> {
        let mut became_read: Vec<ThreadKey> =
            self.unread.difference(&new_unread).cloned().collect();
        became_read.sort();

        for thread in &became_read {
            self.mark_read(thread, now);
        }
        for thread in &new_unread {
            self.last_read.remove(thread);
        }
        self.unread = new_unread;

        became_read
    }

    /// Serialize the `last_read_at` map for checkpointing.
    pub fn checkpoint(&self) -> Result<String, AppError> {
        let mut entries: Vec<CheckpointEntry> = self
            .last_read
            .iter()
            .map(|(thread, &last_read_at)| CheckpointEntry {
                thread: thread.clone(),
                last_read_at,
            })
            .collect();
        entries.sort_by(|a, b| a.thread.cmp(&b.thread));
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    /// Restore a tracker from checkpoint contents.
    pub fn restore(contents: &str) -> Result<Self, AppError> {
        let entries: Vec<CheckpointEntry> = serde_json::from_str(contents)?;
        let last_read = entries
            .into_iter()
            .map(|e| (e.thread, e.last_read_at))
            .collect();
        Ok(Self {
            last_read,
            unread: HashSet::new(),
        })
    }

    /// Write the checkpoint file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), AppError> {
        std::fs::write(path, self.checkpoint()?)?;
        Ok(())
    }

    /// Load a tracker from the checkpoint file; a missing file yields an
    /// empty tracker.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::restore(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ThreadKind;
    use chrono::TimeZone;

    fn thread(id: u64) -> ThreadKey {
        ThreadKey::new("github.com/a/b", ThreadKind::Issue, id)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_absent_thread_is_unread() {
        let tracker = ReadStateTracker::new();
        assert!(tracker.is_unread(&thread(1), at(10)));
    }

    #[test]
    fn test_mark_read_excludes_thread() {
        let mut tracker = ReadStateTracker::new();
        tracker.mark_read(&thread(1), at(100));
        assert!(!tracker.is_unread(&thread(1), at(50)));
        // Strictly-after semantics: same instant is read
        assert!(!tracker.is_unread(&thread(1), at(100)));
        assert!(tracker.is_unread(&thread(1), at(101)));
    }

    #[test]
    fn test_mark_read_is_monotonic() {
        let mut tracker = ReadStateTracker::new();
        tracker.mark_read(&thread(1), at(100));
        tracker.mark_read(&thread(1), at(50));
        assert_eq!(tracker.last_read_at(&thread(1)), Some(at(100)));
        tracker.mark_read(&thread(1), at(200));
        assert_eq!(tracker.last_read_at(&thread(1)), Some(at(200)));
    }

    #[test]
    fn test_reconcile_emits_old_minus_new() {
        let mut tracker = ReadStateTracker::new();
        let old: HashSet<ThreadKey> = [thread(1), thread(2), thread(3)].into_iter().collect();
        assert!(tracker.reconcile(old, at(10)).is_empty());

        let new: HashSet<ThreadKey> = [thread(2), thread(4)].into_iter().collect();
        let became_read = tracker.reconcile(new, at(20));
        assert_eq!(became_read, vec![thread(1), thread(3)]);
    }

    #[test]
    fn test_reconcile_overrides_optimistic_mark() {
        let mut tracker = ReadStateTracker::new();
        tracker.mark_read(&thread(1), at(100));

        // The authority still reports the thread unread
        let new: HashSet<ThreadKey> = [thread(1)].into_iter().collect();
        tracker.reconcile(new, at(200));
        assert!(tracker.is_unread(&thread(1), at(50)));
    }

    #[test]
    fn test_reconcile_marks_departed_threads_read() {
        let mut tracker = ReadStateTracker::new();
        let old: HashSet<ThreadKey> = [thread(1)].into_iter().collect();
        tracker.reconcile(old, at(10));
        tracker.reconcile(HashSet::new(), at(20));
        assert!(!tracker.is_unread(&thread(1), at(15)));
    }

    #[test]
    fn test_checkpoint_round_trips_exactly() {
        let mut tracker = ReadStateTracker::new();
        tracker.mark_read(&thread(1), at(100));
        tracker.mark_read(
            &ThreadKey::new("example.org/review/x", ThreadKind::Change, 7),
            at(250),
        );

        let contents = tracker.checkpoint().unwrap();
        let restored = ReadStateTracker::restore(&contents).unwrap();
        assert_eq!(restored.last_read_at(&thread(1)), Some(at(100)));
        assert_eq!(restored.checkpoint().unwrap(), contents);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let tracker = ReadStateTracker::load(dir.path().join("absent.json")).unwrap();
        assert!(tracker.last_read.is_empty());
    }
}
