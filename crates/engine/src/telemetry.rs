//! The `_history` virtual namespace.
//!
//! Reads under `<root>/_history/...` never reach the inner store; they are
//! answered from telemetry. Each relative path resolves to one
//! [`TelemetryValue`] whose native type is fixed: counts and byte values
//! are `u64`, flags are `bool`, labels are `String`, and the aggregate
//! paths return the full stats structures. A read requesting any other
//! type fails with `InvalidType`; an unknown path fails with `NotFound`.

use std::any::Any;

use histree_core::{
    Error, HistoryLastOperation, HistoryStats, HistoryUnsupportedRecord, HistoryUnsupportedStats,
    Result,
};

/// Relative prefix that routes a path into the history namespace.
pub(crate) const HISTORY_NAMESPACE: &str = "_history";

/// Control command paths, relative to the root.
pub(crate) const COMMAND_UNDO: &str = "_history/undo";
pub(crate) const COMMAND_REDO: &str = "_history/redo";
pub(crate) const COMMAND_GARBAGE_COLLECT: &str = "_history/garbage_collect";
pub(crate) const COMMAND_SET_MANUAL_GC: &str = "_history/set_manual_garbage_collect";
pub(crate) const COMMAND_SET_TAG: &str = "_history/set_tag";

/// A telemetry value in its native type.
#[derive(Debug, Clone)]
pub(crate) enum TelemetryValue {
    UInt(u64),
    Bool(bool),
    Text(String),
    Stats(HistoryStats),
    LastOperation(HistoryLastOperation),
    Unsupported(HistoryUnsupportedStats),
    UnsupportedRecord(HistoryUnsupportedRecord),
}

/// Convert a telemetry value into the caller's requested type.
pub(crate) fn extract<T: 'static>(value: TelemetryValue, path: &str) -> Result<T> {
    let (boxed, expected): (Box<dyn Any>, &str) = match value {
        TelemetryValue::UInt(v) => (Box::new(v), "u64"),
        TelemetryValue::Bool(v) => (Box::new(v), "bool"),
        TelemetryValue::Text(v) => (Box::new(v), "String"),
        TelemetryValue::Stats(v) => (Box::new(v), "HistoryStats"),
        TelemetryValue::LastOperation(v) => (Box::new(v), "HistoryLastOperation"),
        TelemetryValue::Unsupported(v) => (Box::new(v), "HistoryUnsupportedStats"),
        TelemetryValue::UnsupportedRecord(v) => (Box::new(v), "HistoryUnsupportedRecord"),
    };
    boxed.downcast::<T>().map(|v| *v).map_err(|_| {
        Error::InvalidType(format!(
            "history telemetry path '{path}' expects type {expected}"
        ))
    })
}

fn uint(value: usize) -> TelemetryValue {
    TelemetryValue::UInt(value as u64)
}

/// Resolve a `_history/...` read path against a stats snapshot.
///
/// `head` is the root's head position: the live snapshot generation for
/// snapshot roots, the next sequence number for journal roots.
pub(crate) fn read_stats_value(
    stats: &HistoryStats,
    head: Option<u64>,
    relative: &str,
) -> Result<TelemetryValue> {
    let value = match relative {
        "_history/stats" => TelemetryValue::Stats(stats.clone()),
        "_history/stats/undoCount" => uint(stats.counts.undo),
        "_history/stats/redoCount" => uint(stats.counts.redo),
        "_history/stats/undoBytes" => uint(stats.bytes.undo),
        "_history/stats/redoBytes" => uint(stats.bytes.redo),
        "_history/stats/liveBytes" => uint(stats.bytes.live),
        "_history/stats/bytesRetained" => uint(stats.bytes.total),
        "_history/stats/diskBytes" => uint(stats.bytes.disk),
        "_history/stats/manualGcEnabled" => TelemetryValue::Bool(stats.counts.manual_garbage_collect),
        "_history/stats/limits/maxEntries" => uint(stats.limits.max_entries),
        "_history/stats/limits/maxBytesRetained" => uint(stats.limits.max_bytes_retained),
        "_history/stats/limits/keepLatestForMs" => {
            TelemetryValue::UInt(stats.limits.keep_latest_for_ms)
        }
        "_history/stats/limits/ramCacheEntries" => uint(stats.limits.ram_cache_entries),
        "_history/stats/limits/maxDiskBytes" => uint(stats.limits.max_disk_bytes),
        "_history/stats/limits/persistHistory" => TelemetryValue::Bool(stats.limits.persist_history),
        "_history/stats/limits/restoreFromPersistence" => {
            TelemetryValue::Bool(stats.limits.restore_from_persistence)
        }
        "_history/stats/trimOperationCount" => uint(stats.trim.operation_count),
        "_history/stats/trimmedEntries" => uint(stats.trim.entries),
        "_history/stats/trimmedBytes" => uint(stats.trim.bytes),
        "_history/stats/lastTrimTimestampMs" => TelemetryValue::UInt(stats.trim.last_timestamp_ms),
        "_history/stats/compaction/runs" => uint(stats.compaction.runs),
        "_history/stats/compaction/entries" => uint(stats.compaction.entries),
        "_history/stats/compaction/bytes" => uint(stats.compaction.bytes),
        "_history/stats/compaction/lastTimestampMs" => {
            TelemetryValue::UInt(stats.compaction.last_timestamp_ms)
        }
        "_history/head/generation" => match head {
            Some(generation) => TelemetryValue::UInt(generation),
            None => {
                return Err(Error::NoObjectFound(
                    "history head generation unavailable".into(),
                ))
            }
        },
        "_history/unsupported" => TelemetryValue::Unsupported(stats.unsupported.clone()),
        "_history/unsupported/totalCount" => uint(stats.unsupported.total),
        "_history/unsupported/recentCount" => uint(stats.unsupported.recent.len()),
        other if other.starts_with("_history/lastOperation") => {
            return read_last_operation_value(stats, other)
        }
        other if other.starts_with("_history/unsupported/recent/") => {
            return read_unsupported_record_value(stats, other)
        }
        other => {
            return Err(Error::NotFound(format!(
                "unsupported history telemetry path: {other}"
            )))
        }
    };
    Ok(value)
}

fn read_last_operation_value(stats: &HistoryStats, relative: &str) -> Result<TelemetryValue> {
    let Some(op) = &stats.last_operation else {
        return Err(Error::NoObjectFound("no history operation recorded".into()));
    };
    let value = match relative {
        "_history/lastOperation" => TelemetryValue::LastOperation(op.clone()),
        "_history/lastOperation/type" => TelemetryValue::Text(op.op_type.clone()),
        "_history/lastOperation/timestampMs" => TelemetryValue::UInt(op.timestamp_ms),
        "_history/lastOperation/durationMs" => TelemetryValue::UInt(op.duration_ms),
        "_history/lastOperation/success" => TelemetryValue::Bool(op.success),
        "_history/lastOperation/undoCountBefore" => uint(op.undo_count_before),
        "_history/lastOperation/undoCountAfter" => uint(op.undo_count_after),
        "_history/lastOperation/redoCountBefore" => uint(op.redo_count_before),
        "_history/lastOperation/redoCountAfter" => uint(op.redo_count_after),
        "_history/lastOperation/bytesBefore" => uint(op.bytes_before),
        "_history/lastOperation/bytesAfter" => uint(op.bytes_after),
        "_history/lastOperation/message" => TelemetryValue::Text(op.message.clone()),
        "_history/lastOperation/tag" => TelemetryValue::Text(op.tag.clone()),
        other => {
            return Err(Error::NotFound(format!(
                "unsupported history telemetry path: {other}"
            )))
        }
    };
    Ok(value)
}

fn read_unsupported_record_value(stats: &HistoryStats, relative: &str) -> Result<TelemetryValue> {
    let suffix = &relative["_history/unsupported/recent/".len()..];
    let (index_part, field) = match suffix.split_once('/') {
        Some((index, field)) => (index, Some(field)),
        None => (suffix, None),
    };
    let index: usize = index_part
        .parse()
        .map_err(|_| Error::InvalidPath("unsupported history record index".into()))?;
    let Some(record) = stats.unsupported.recent.get(index) else {
        return Err(Error::NoObjectFound(
            "unsupported history record not found".into(),
        ));
    };
    let value = match field {
        None => TelemetryValue::UnsupportedRecord(record.clone()),
        Some("path") => TelemetryValue::Text(record.path.clone()),
        Some("reason") => TelemetryValue::Text(record.reason.clone()),
        Some("occurrences") => uint(record.occurrences),
        Some("timestampMs") => TelemetryValue::UInt(record.last_timestamp_ms),
        Some(_) => {
            return Err(Error::NotFound(format!(
                "unsupported history telemetry path: {relative}"
            )))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use histree_core::HistoryUnsupportedRecord;

    fn sample_stats() -> HistoryStats {
        let mut stats = HistoryStats::default();
        stats.counts.undo = 3;
        stats.counts.redo = 1;
        stats.bytes.live = 256;
        stats.limits.max_entries = 128;
        stats.limits.persist_history = true;
        stats.last_operation = Some(HistoryLastOperation {
            op_type: "commit".into(),
            success: true,
            message: "no_changes".into(),
            tag: "stroke".into(),
            ..HistoryLastOperation::default()
        });
        stats.unsupported.total = 2;
        stats.unsupported.recent = vec![HistoryUnsupportedRecord {
            path: "/doc/task".into(),
            reason: "tasks".into(),
            occurrences: 2,
            last_timestamp_ms: 7,
        }];
        stats
    }

    fn read<T: 'static>(stats: &HistoryStats, path: &str) -> Result<T> {
        read_stats_value(stats, Some(9), path).and_then(|v| extract(v, path))
    }

    #[test]
    fn test_scalar_reads() {
        let stats = sample_stats();
        assert_eq!(read::<u64>(&stats, "_history/stats/undoCount").unwrap(), 3);
        assert_eq!(read::<u64>(&stats, "_history/stats/liveBytes").unwrap(), 256);
        assert!(read::<bool>(&stats, "_history/stats/limits/persistHistory").unwrap());
        assert_eq!(read::<u64>(&stats, "_history/head/generation").unwrap(), 9);
    }

    #[test]
    fn test_last_operation_reads() {
        let stats = sample_stats();
        assert_eq!(
            read::<String>(&stats, "_history/lastOperation/type").unwrap(),
            "commit"
        );
        assert_eq!(
            read::<String>(&stats, "_history/lastOperation/tag").unwrap(),
            "stroke"
        );
        assert!(read::<bool>(&stats, "_history/lastOperation/success").unwrap());
    }

    #[test]
    fn test_unsupported_record_reads() {
        let stats = sample_stats();
        assert_eq!(
            read::<String>(&stats, "_history/unsupported/recent/0/path").unwrap(),
            "/doc/task"
        );
        assert_eq!(
            read::<u64>(&stats, "_history/unsupported/recent/0/occurrences").unwrap(),
            2
        );
        assert!(matches!(
            read::<String>(&stats, "_history/unsupported/recent/5/path"),
            Err(Error::NoObjectFound(_))
        ));
        assert!(matches!(
            read::<String>(&stats, "_history/unsupported/recent/x/path"),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn test_type_mismatch() {
        let stats = sample_stats();
        assert!(matches!(
            read::<String>(&stats, "_history/stats/undoCount"),
            Err(Error::InvalidType(_))
        ));
        assert!(matches!(
            read::<u64>(&stats, "_history/lastOperation/type"),
            Err(Error::InvalidType(_))
        ));
    }

    #[test]
    fn test_unknown_field_is_not_found() {
        let stats = sample_stats();
        assert!(matches!(
            read::<u64>(&stats, "_history/stats/nope"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_missing_last_operation() {
        let stats = HistoryStats::default();
        assert!(matches!(
            read::<String>(&stats, "_history/lastOperation/type"),
            Err(Error::NoObjectFound(_))
        ));
    }

    #[test]
    fn test_full_stats_read() {
        let stats = sample_stats();
        let full: HistoryStats = read(&stats, "_history/stats").unwrap();
        assert_eq!(full, stats);
    }
}
