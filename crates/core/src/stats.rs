//! History telemetry value types
//!
//! These are the read-only structures surfaced by `history_stats` and the
//! `<root>/_history/...` virtual namespace.

/// Entry counts and cache/disk counts for one root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryCounts {
    /// Entries that can be undone.
    pub undo: usize,
    /// Entries that can be redone.
    pub redo: usize,
    /// Whether retention only runs on explicit command.
    pub manual_garbage_collect: bool,
    /// Entries with on-disk artifacts.
    pub disk_entries: usize,
    /// Undo entries currently materialized in RAM.
    pub cached_undo: usize,
    /// Redo entries currently materialized in RAM.
    pub cached_redo: usize,
}

/// Byte accounting for one root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryBytes {
    /// undo + redo + live.
    pub total: usize,
    /// Estimated bytes retained by undo entries.
    pub undo: usize,
    /// Estimated bytes retained by redo entries.
    pub redo: usize,
    /// Estimated payload bytes of the current subtree.
    pub live: usize,
    /// Bytes of on-disk artifacts.
    pub disk: usize,
}

/// Trim/retention telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryTrimMetrics {
    /// Number of operations that evicted at least one entry.
    pub operation_count: usize,
    /// Total entries evicted.
    pub entries: usize,
    /// Total bytes evicted.
    pub bytes: usize,
    /// Wall-clock milliseconds of the most recent trim, 0 if none.
    pub last_timestamp_ms: u64,
}

/// The configured limits, echoed back for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryLimitMetrics {
    /// Maximum retained entries; 0 = unlimited.
    pub max_entries: usize,
    /// Byte budget; 0 = unlimited.
    pub max_bytes_retained: usize,
    /// Advisory age floor in milliseconds.
    pub keep_latest_for_ms: u64,
    /// Materialized cache slots per stack.
    pub ram_cache_entries: usize,
    /// Advisory disk byte budget.
    pub max_disk_bytes: usize,
    /// Whether persistence is enabled.
    pub persist_history: bool,
    /// Whether enable restores persisted state into the store.
    pub restore_from_persistence: bool,
}

/// Journal-file compaction telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryCompactionMetrics {
    /// Completed compaction runs.
    pub runs: usize,
    /// Entries written across all runs.
    pub entries: usize,
    /// Bytes written across all runs.
    pub bytes: usize,
    /// Wall-clock milliseconds of the most recent run, 0 if none.
    pub last_timestamp_ms: u64,
}

/// Record of the most recent history operation on a root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryLastOperation {
    /// Operation name: `commit`, `undo`, `redo`, `trim`,
    /// `garbage_collect`, `set_manual_gc`, `set_tag`, `restore`.
    pub op_type: String,
    /// Wall-clock milliseconds when the operation finished.
    pub timestamp_ms: u64,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Undo count before the operation.
    pub undo_count_before: usize,
    /// Undo count after the operation.
    pub undo_count_after: usize,
    /// Redo count before the operation.
    pub redo_count_before: usize,
    /// Redo count after the operation.
    pub redo_count_after: usize,
    /// Retained bytes before the operation.
    pub bytes_before: usize,
    /// Retained bytes after the operation.
    pub bytes_after: usize,
    /// Tag active when the operation ran.
    pub tag: String,
    /// Failure reason or outcome note (`no_changes`, `trimmed=N`, ...).
    pub message: String,
}

/// One rejected payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryUnsupportedRecord {
    /// Path of the offending payload.
    pub path: String,
    /// Why it was rejected.
    pub reason: String,
    /// How many times this (path, reason) pair was seen.
    pub occurrences: usize,
    /// Wall-clock milliseconds of the most recent occurrence.
    pub last_timestamp_ms: u64,
}

/// Unsupported-payload log: total count plus a bounded recent ring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryUnsupportedStats {
    /// All rejections ever, including duplicates.
    pub total: usize,
    /// Most recent distinct (path, reason) records, capped at 16.
    pub recent: Vec<HistoryUnsupportedRecord>,
}

/// Full telemetry snapshot for one history root.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryStats {
    /// Entry and cache counts.
    pub counts: HistoryCounts,
    /// Byte accounting.
    pub bytes: HistoryBytes,
    /// Trim telemetry.
    pub trim: HistoryTrimMetrics,
    /// Configured limits.
    pub limits: HistoryLimitMetrics,
    /// Compaction telemetry (journal roots).
    pub compaction: HistoryCompactionMetrics,
    /// Most recent operation, if any.
    pub last_operation: Option<HistoryLastOperation>,
    /// Unsupported-payload log.
    pub unsupported: HistoryUnsupportedStats,
}

/// Result of an explicit trim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimStats {
    /// Entries evicted by this call.
    pub entries_removed: usize,
    /// Bytes evicted by this call.
    pub bytes_removed: usize,
}
