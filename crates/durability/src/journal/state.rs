//! In-memory journal state.
//!
//! A bounded double-ended sequence of entries with a cursor marking the
//! boundary between applied-but-reversible (undo) and
//! reversed-but-replayable (redo) entries. Appending drops the redo tail;
//! retention evicts from the front and drags the cursor along.

use std::collections::VecDeque;

use super::entry::JournalEntry;

/// Count and byte bounds for retained entries. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Maximum retained entries; 0 = unlimited.
    pub max_entries: usize,
    /// Maximum retained bytes; 0 = unlimited.
    pub max_bytes: usize,
}

/// Aggregate counters over the journal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalStats {
    /// All retained entries.
    pub total_entries: usize,
    /// Entries before the cursor.
    pub undo_count: usize,
    /// Entries at or after the cursor.
    pub redo_count: usize,
    /// Estimated bytes across all retained entries.
    pub total_bytes: usize,
    /// Estimated bytes across undo entries.
    pub undo_bytes: usize,
    /// Estimated bytes across redo entries.
    pub redo_bytes: usize,
    /// Entries evicted by retention since creation.
    pub trimmed_entries: usize,
    /// Bytes evicted by retention since creation.
    pub trimmed_bytes: usize,
}

/// The ordered journal with its cursor and retention policy.
#[derive(Debug, Default)]
pub struct JournalState {
    entries: VecDeque<JournalEntry>,
    cursor: usize,
    retention: RetentionPolicy,
    total_bytes: usize,
    trimmed_entries: usize,
    trimmed_bytes: usize,
}

impl JournalState {
    /// An empty journal with unlimited retention.
    pub fn new() -> Self {
        JournalState::default()
    }

    /// An empty journal with the given retention policy.
    pub fn with_policy(policy: RetentionPolicy) -> Self {
        JournalState {
            retention: policy,
            ..JournalState::default()
        }
    }

    /// Drop every entry and reset all counters.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
        self.total_bytes = 0;
        self.trimmed_entries = 0;
        self.trimmed_bytes = 0;
    }

    /// Replace the retention policy and re-enforce it immediately.
    pub fn set_retention_policy(&mut self, policy: RetentionPolicy) {
        self.retention = policy;
        self.enforce_retention();
    }

    /// The active retention policy.
    pub fn policy(&self) -> RetentionPolicy {
        self.retention
    }

    /// Append an entry at the cursor, dropping the redo tail.
    pub fn append(&mut self, entry: JournalEntry, enforce_retention: bool) {
        self.drop_redo_tail();
        self.total_bytes += Self::entry_bytes(&entry);
        self.entries.push_back(entry);
        self.cursor = self.entries.len();
        if enforce_retention {
            self.enforce_retention();
        }
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the journal is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current cursor position.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Whether an undo step is available.
    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    /// Whether a redo step is available.
    pub fn can_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    /// The entry the next undo would revert.
    pub fn peek_undo(&self) -> Option<&JournalEntry> {
        if !self.can_undo() {
            return None;
        }
        self.entries.get(self.cursor - 1)
    }

    /// The entry the next redo would replay.
    pub fn peek_redo(&self) -> Option<&JournalEntry> {
        self.entries.get(self.cursor)
    }

    /// Step the cursor backward and return the reverted entry.
    /// Fails softly at the boundary.
    pub fn undo(&mut self) -> Option<&JournalEntry> {
        if !self.can_undo() {
            return None;
        }
        self.cursor -= 1;
        self.entries.get(self.cursor)
    }

    /// Step the cursor forward and return the replayed entry.
    /// Fails softly at the boundary.
    pub fn redo(&mut self) -> Option<&JournalEntry> {
        if !self.can_redo() {
            return None;
        }
        let entry = self.entries.get(self.cursor);
        self.cursor += 1;
        entry
    }

    /// The entry at `index`, oldest first.
    pub fn entry_at(&self, index: usize) -> Option<&JournalEntry> {
        self.entries.get(index)
    }

    /// Iterate retained entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter()
    }

    /// Aggregate counters.
    pub fn stats(&self) -> JournalStats {
        let undo_bytes: usize = self
            .entries
            .iter()
            .take(self.cursor)
            .map(Self::entry_bytes)
            .sum();
        JournalStats {
            total_entries: self.entries.len(),
            undo_count: self.cursor,
            redo_count: self.entries.len() - self.cursor,
            total_bytes: self.total_bytes,
            undo_bytes,
            redo_bytes: self.total_bytes.saturating_sub(undo_bytes),
            trimmed_entries: self.trimmed_entries,
            trimmed_bytes: self.trimmed_bytes,
        }
    }

    /// Estimated in-memory footprint of one entry: fixed scalars, path,
    /// tag with its length prefix, and both payload bodies.
    pub fn entry_bytes(entry: &JournalEntry) -> usize {
        let fixed = 1 /* operation */ + 8 /* timestamp_ms */ + 8 /* monotonic_ns */
            + 8 /* sequence */ + 1 /* barrier */;
        fixed
            + entry.path.len()
            + 4
            + entry.tag.len()
            + entry.value.bytes.len()
            + entry.inverse_value.bytes.len()
    }

    fn drop_redo_tail(&mut self) {
        while self.entries.len() > self.cursor {
            if let Some(entry) = self.entries.pop_back() {
                self.total_bytes -= Self::entry_bytes(&entry);
            }
        }
    }

    fn enforce_retention(&mut self) {
        let RetentionPolicy {
            max_entries,
            max_bytes,
        } = self.retention;

        loop {
            let over_entries = max_entries != 0 && self.entries.len() > max_entries;
            let over_bytes = max_bytes != 0 && self.total_bytes > max_bytes;
            if !over_entries && !over_bytes {
                break;
            }
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            let bytes = Self::entry_bytes(&entry);
            self.total_bytes -= bytes;
            self.trimmed_entries += 1;
            self.trimmed_bytes += bytes;
            if self.cursor > 0 {
                self.cursor -= 1;
            }
        }

        if self.cursor > self.entries.len() {
            self.cursor = self.entries.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::entry::{
        deserialize_entry, serialize_entry, OperationKind, SerializedPayload,
    };

    fn make_entry(seq: u64, suffix: &str) -> JournalEntry {
        JournalEntry {
            operation: OperationKind::Insert,
            path: format!("/doc/{suffix}"),
            timestamp_ms: 1000 + seq,
            monotonic_ns: seq * 10,
            sequence: seq,
            ..JournalEntry::default()
        }
    }

    fn make_sized_entry(seq: u64, payload_bytes: usize) -> JournalEntry {
        JournalEntry {
            value: SerializedPayload::from_bytes(vec![0; payload_bytes]),
            ..make_entry(seq, "large")
        }
    }

    #[test]
    fn test_append_tracks_undo_and_redo_cursors() {
        let mut state = JournalState::new();
        state.append(make_entry(1, "a"), true);
        state.append(make_entry(2, "b"), true);

        assert_eq!(state.len(), 2);
        assert!(state.can_undo());
        assert!(!state.can_redo());

        let undone = state.undo().unwrap();
        assert_eq!(undone.sequence, 2);
        assert!(state.can_redo());

        let redone = state.redo().unwrap();
        assert_eq!(redone.sequence, 2);
        assert!(!state.can_redo());
    }

    #[test]
    fn test_append_clears_redo_tail() {
        let mut state = JournalState::new();
        state.append(make_entry(1, "a"), true);
        state.append(make_entry(2, "b"), true);

        state.undo().unwrap();
        assert!(state.can_redo());

        state.append(make_entry(3, "c"), true);
        assert!(!state.can_redo());
        assert_eq!(state.len(), 2); // one redo entry dropped, new entry appended
        assert_eq!(state.peek_undo().unwrap().sequence, 3);
    }

    #[test]
    fn test_retention_trims_oldest_by_count() {
        let mut state = JournalState::with_policy(RetentionPolicy {
            max_entries: 2,
            max_bytes: 0,
        });
        state.append(make_entry(1, "a"), true);
        state.append(make_entry(2, "b"), true);
        state.append(make_entry(3, "c"), true);

        assert_eq!(state.len(), 2);
        assert_eq!(state.entry_at(0).unwrap().sequence, 2);
        assert_eq!(state.entry_at(1).unwrap().sequence, 3);

        let stats = state.stats();
        assert_eq!(stats.trimmed_entries, 1);
        assert_eq!(stats.undo_count, 2);
        assert_eq!(stats.redo_count, 0);
    }

    #[test]
    fn test_retention_trims_by_byte_budget() {
        let mut state = JournalState::with_policy(RetentionPolicy {
            max_entries: 0,
            max_bytes: 128,
        });
        state.append(make_sized_entry(1, 80), true);
        state.append(make_sized_entry(2, 80), true);
        state.append(make_sized_entry(3, 80), true);

        assert!(state.len() >= 1);
        assert!(state.len() <= 2);
        assert_eq!(state.entry_at(state.len() - 1).unwrap().sequence, 3);
        assert!(state.stats().trimmed_entries >= 1);
    }

    #[test]
    fn test_cursor_stays_aligned_after_retention() {
        let mut state = JournalState::with_policy(RetentionPolicy {
            max_entries: 3,
            max_bytes: 0,
        });
        state.append(make_entry(1, "a"), true);
        state.append(make_entry(2, "b"), true);
        state.append(make_entry(3, "c"), true);

        assert_eq!(state.undo().unwrap().sequence, 3);

        state.append(make_entry(4, "d"), true); // clears redo tail
        state.append(make_entry(5, "e"), true); // may trim old entries

        assert!(state.can_undo());
        assert_eq!(state.undo().unwrap().sequence, 5);
    }

    #[test]
    fn test_undo_bytes_split_follows_cursor() {
        let mut state = JournalState::new();
        state.append(make_sized_entry(1, 100), true);
        state.append(make_sized_entry(2, 100), true);

        let all_undo = state.stats();
        assert_eq!(all_undo.redo_bytes, 0);
        assert_eq!(all_undo.undo_bytes, all_undo.total_bytes);

        state.undo().unwrap();
        let split = state.stats();
        assert_eq!(split.undo_count, 1);
        assert_eq!(split.redo_count, 1);
        assert_eq!(split.undo_bytes + split.redo_bytes, split.total_bytes);
        assert!(split.redo_bytes > 0);
    }

    #[test]
    fn test_serialization_round_trips_journal_entries() {
        let mut state = JournalState::new();
        state.append(make_entry(1, "a"), true);
        state.append(make_entry(2, "b"), true);
        state.append(make_entry(3, "c"), true);

        let mut restored = JournalState::new();
        for entry in state.iter() {
            let bytes = serialize_entry(entry).unwrap();
            restored.append(deserialize_entry(&bytes).unwrap(), true);
        }

        assert_eq!(restored.len(), state.len());
        assert_eq!(restored.stats().undo_count, restored.len());
        assert_eq!(restored.undo().unwrap().sequence, 3);
        assert_eq!(restored.redo().unwrap().sequence, 3);
    }

    #[test]
    fn test_clear_resets_counters() {
        let mut state = JournalState::with_policy(RetentionPolicy {
            max_entries: 1,
            max_bytes: 0,
        });
        state.append(make_entry(1, "a"), true);
        state.append(make_entry(2, "b"), true);
        assert_eq!(state.stats().trimmed_entries, 1);

        state.clear();
        let stats = state.stats();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.trimmed_entries, 0);
        assert_eq!(state.cursor(), 0);
    }
}
