//! Per-root state.
//!
//! One registered history root owns everything below one mutex: options,
//! the engine-mode data (snapshot stacks or the journal), telemetry, the
//! persistence bookkeeping, and the active transaction record. The
//! `active_transaction` field is cooperative locking across calls; the
//! mutex only guards individual state transitions.

use std::path::PathBuf;
use std::thread::ThreadId;

use parking_lot::Mutex;

use histree_core::{clock, HistoryLastOperation, HistoryOptions, StorePath};
use histree_durability::{JournalFileWriter, JournalState};

use crate::cow::{CowPrototype, Snapshot};

pub(crate) const MAX_UNSUPPORTED_LOG_ENTRIES: usize = 16;

pub(crate) const UNSUPPORTED_NESTED_MESSAGE: &str =
    "History does not yet support nested stores";
pub(crate) const UNSUPPORTED_EXECUTION_MESSAGE: &str =
    "History does not yet support nodes containing tasks or futures";
pub(crate) const UNSUPPORTED_SERIALIZATION_MESSAGE: &str =
    "Unable to serialize node payload for history";

/// One rejected payload in the bounded unsupported ring.
#[derive(Debug, Clone)]
pub(crate) struct UnsupportedRecord {
    pub(crate) path: String,
    pub(crate) reason: String,
    pub(crate) occurrences: usize,
    pub(crate) last_timestamp_ms: u64,
}

/// Telemetry shared by both engine modes.
#[derive(Debug, Clone, Default)]
pub(crate) struct Telemetry {
    pub(crate) undo_bytes: usize,
    pub(crate) redo_bytes: usize,
    pub(crate) trim_operations: usize,
    pub(crate) trimmed_entries: usize,
    pub(crate) trimmed_bytes: usize,
    pub(crate) last_trim_timestamp_ms: Option<u64>,
    pub(crate) last_operation: Option<HistoryLastOperation>,
    pub(crate) disk_bytes: usize,
    pub(crate) disk_entries: usize,
    pub(crate) cached_undo: usize,
    pub(crate) cached_redo: usize,
    pub(crate) persistence_dirty: bool,
    pub(crate) unsupported_total: usize,
    pub(crate) unsupported_log: Vec<UnsupportedRecord>,
    pub(crate) compaction_runs: usize,
    pub(crate) compaction_entries: usize,
    pub(crate) compaction_bytes: usize,
    pub(crate) last_compaction_timestamp_ms: Option<u64>,
}

impl Telemetry {
    /// Record a rejected payload. Duplicate (path, reason) pairs bump
    /// `occurrences` and move to the tail; the ring holds at most
    /// [`MAX_UNSUPPORTED_LOG_ENTRIES`] records.
    pub(crate) fn record_unsupported(&mut self, path: &str, reason: &str) {
        let now = clock::now_millis();
        self.unsupported_total += 1;

        if let Some(index) = self
            .unsupported_log
            .iter()
            .position(|r| r.path == path && r.reason == reason)
        {
            let mut record = self.unsupported_log.remove(index);
            record.occurrences += 1;
            record.last_timestamp_ms = now;
            self.unsupported_log.push(record);
            return;
        }

        self.unsupported_log.push(UnsupportedRecord {
            path: path.to_string(),
            reason: reason.to_string(),
            occurrences: 1,
            last_timestamp_ms: now,
        });
        if self.unsupported_log.len() > MAX_UNSUPPORTED_LOG_ENTRIES {
            self.unsupported_log.remove(0);
        }
    }
}

/// One snapshot held on an undo or redo stack.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotEntryState {
    pub(crate) snapshot: Snapshot,
    pub(crate) bytes: usize,
    pub(crate) timestamp_ms: u64,
    /// The generation's files exist on disk.
    pub(crate) persisted: bool,
    /// The tree is materialized in RAM.
    pub(crate) cached: bool,
}

/// The active transaction of a snapshot root.
#[derive(Debug)]
pub(crate) struct SnapshotTransaction {
    pub(crate) owner: ThreadId,
    pub(crate) depth: usize,
    pub(crate) dirty: bool,
    pub(crate) pre_image: Snapshot,
    pub(crate) pre_image_bytes: usize,
}

/// Filesystem bookkeeping for a persisted snapshot root.
#[derive(Debug, Default)]
pub(crate) struct SnapshotPersistence {
    pub(crate) enabled: bool,
    pub(crate) root_dir: PathBuf,
    pub(crate) entries_dir: PathBuf,
    pub(crate) encoded_root: String,
    pub(crate) state_dirty: bool,
    pub(crate) has_persistent_state: bool,
}

/// Mutable state of a snapshot-mode root.
#[derive(Debug)]
pub(crate) struct SnapshotRootInner {
    pub(crate) options: HistoryOptions,
    pub(crate) prototype: CowPrototype,
    pub(crate) undo_stack: Vec<SnapshotEntryState>,
    pub(crate) redo_stack: Vec<SnapshotEntryState>,
    pub(crate) live_snapshot: Snapshot,
    pub(crate) live_bytes: usize,
    pub(crate) telemetry: Telemetry,
    pub(crate) persistence: SnapshotPersistence,
    pub(crate) active_transaction: Option<SnapshotTransaction>,
}

/// A registered snapshot-mode history root.
#[derive(Debug)]
pub(crate) struct SnapshotRoot {
    pub(crate) path: StorePath,
    pub(crate) components: Vec<String>,
    pub(crate) opt_out_prefixes: Vec<String>,
    pub(crate) inner: Mutex<SnapshotRootInner>,
}

/// The active transaction of a journal root.
#[derive(Debug)]
pub(crate) struct JournalTransaction {
    pub(crate) owner: ThreadId,
    pub(crate) depth: usize,
    pub(crate) dirty: bool,
    /// Set by `begin_transaction`; implicit per-mutation transactions
    /// leave it clear. The first entry of an explicit batch carries the
    /// barrier flag.
    pub(crate) explicit: bool,
    pub(crate) entries_recorded: usize,
}

/// Filesystem bookkeeping for a persisted journal root.
#[derive(Debug, Default)]
pub(crate) struct JournalPersistence {
    pub(crate) enabled: bool,
    pub(crate) root_dir: PathBuf,
    pub(crate) journal_path: PathBuf,
    pub(crate) encoded_root: String,
    pub(crate) state_dirty: bool,
    pub(crate) persistence_dirty: bool,
    pub(crate) writer: Option<JournalFileWriter>,
}

/// Mutable state of a journal-mode root.
#[derive(Debug)]
pub(crate) struct JournalRootInner {
    pub(crate) options: HistoryOptions,
    pub(crate) journal: JournalState,
    pub(crate) telemetry: Telemetry,
    pub(crate) live_bytes: usize,
    pub(crate) next_sequence: u64,
    pub(crate) current_tag: String,
    pub(crate) persistence: JournalPersistence,
    pub(crate) active_transaction: Option<JournalTransaction>,
}

/// A registered journal-mode history root.
#[derive(Debug)]
pub(crate) struct JournalRoot {
    pub(crate) path: StorePath,
    pub(crate) components: Vec<String>,
    pub(crate) opt_out_prefixes: Vec<String>,
    pub(crate) inner: Mutex<JournalRootInner>,
}

/// Captures the before-side of one operation record; `finish` completes
/// and installs it. Every exit path of an operation calls `finish` exactly
/// once.
#[derive(Debug)]
pub(crate) struct OpScope {
    op_type: String,
    tag: String,
    started: std::time::Instant,
    undo_before: usize,
    redo_before: usize,
    bytes_before: usize,
}

impl OpScope {
    pub(crate) fn begin(
        op_type: &str,
        tag: &str,
        undo_before: usize,
        redo_before: usize,
        bytes_before: usize,
    ) -> Self {
        OpScope {
            op_type: op_type.to_string(),
            tag: tag.to_string(),
            started: std::time::Instant::now(),
            undo_before,
            redo_before,
            bytes_before,
        }
    }

    pub(crate) fn finish(
        &self,
        telemetry: &mut Telemetry,
        undo_after: usize,
        redo_after: usize,
        bytes_after: usize,
        success: bool,
        message: impl Into<String>,
    ) {
        telemetry.last_operation = Some(HistoryLastOperation {
            op_type: self.op_type.clone(),
            timestamp_ms: clock::now_millis(),
            duration_ms: self.started.elapsed().as_millis().min(u64::MAX as u128) as u64,
            success,
            undo_count_before: self.undo_before,
            undo_count_after: undo_after,
            redo_count_before: self.redo_before,
            redo_count_after: redo_after,
            bytes_before: self.bytes_before,
            bytes_after,
            tag: self.tag.clone(),
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_ring_dedups_and_moves_to_tail() {
        let mut telemetry = Telemetry::default();
        telemetry.record_unsupported("/doc/a", "nested");
        telemetry.record_unsupported("/doc/b", "tasks");
        telemetry.record_unsupported("/doc/a", "nested");

        assert_eq!(telemetry.unsupported_total, 3);
        assert_eq!(telemetry.unsupported_log.len(), 2);
        let last = telemetry.unsupported_log.last().unwrap();
        assert_eq!(last.path, "/doc/a");
        assert_eq!(last.occurrences, 2);
    }

    #[test]
    fn test_unsupported_ring_is_bounded() {
        let mut telemetry = Telemetry::default();
        for i in 0..(MAX_UNSUPPORTED_LOG_ENTRIES + 4) {
            telemetry.record_unsupported(&format!("/doc/{i}"), "reason");
        }
        assert_eq!(telemetry.unsupported_log.len(), MAX_UNSUPPORTED_LOG_ENTRIES);
        // Oldest records were evicted.
        assert_eq!(telemetry.unsupported_log[0].path, "/doc/4");
    }
}
