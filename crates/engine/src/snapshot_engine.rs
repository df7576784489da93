//! Snapshot-mode history engine.
//!
//! Every committed mutation under a snapshot root captures the full
//! subtree as a CoW snapshot. Undo applies the top of the undo stack and
//! pushes the replaced live snapshot onto the redo stack; redo mirrors.
//! Retention evicts the oldest entries by count first, then by bytes,
//! undo before redo.

use std::sync::Arc;

use histree_core::{
    Error, HistoryBytes, HistoryCompactionMetrics, HistoryCounts, HistoryLimitMetrics,
    HistoryStats, HistoryTrimMetrics, HistoryUnsupportedRecord, HistoryUnsupportedStats, NodeData,
    Result, TrimStats,
};

use crate::cow::{CowNode, Mutation, Snapshot};
use crate::persistence;
use crate::roots::{
    OpScope, SnapshotEntryState, SnapshotPersistence, SnapshotRoot, SnapshotRootInner, Telemetry,
    UNSUPPORTED_EXECUTION_MESSAGE, UNSUPPORTED_NESTED_MESSAGE, UNSUPPORTED_SERIALIZATION_MESSAGE,
};
use crate::space::UndoableSpace;
use crate::store::Node;

/// Join a root path and relative components into a display path.
pub(crate) fn join_path(root_path: &str, relative: &[String]) -> String {
    if relative.is_empty() {
        return root_path.to_string();
    }
    let mut path = if root_path == "/" {
        String::new()
    } else {
        root_path.to_string()
    };
    for component in relative {
        path.push('/');
        path.push_str(component);
    }
    path
}

/// undo + redo + live byte estimate.
pub(crate) fn compute_total_bytes(inner: &SnapshotRootInner) -> usize {
    inner.live_bytes + inner.telemetry.undo_bytes + inner.telemetry.redo_bytes
}

fn unsupported_stats(telemetry: &Telemetry) -> HistoryUnsupportedStats {
    HistoryUnsupportedStats {
        total: telemetry.unsupported_total,
        recent: telemetry
            .unsupported_log
            .iter()
            .map(|record| HistoryUnsupportedRecord {
                path: record.path.clone(),
                reason: record.reason.clone(),
                occurrences: record.occurrences,
                last_timestamp_ms: record.last_timestamp_ms,
            })
            .collect(),
    }
}

/// Shared stats assembly for both engine modes.
pub(crate) fn base_stats(
    telemetry: &Telemetry,
    options: &histree_core::HistoryOptions,
    persist_enabled: bool,
) -> HistoryStats {
    HistoryStats {
        counts: HistoryCounts {
            manual_garbage_collect: options.manual_garbage_collect,
            disk_entries: telemetry.disk_entries,
            cached_undo: telemetry.cached_undo,
            cached_redo: telemetry.cached_redo,
            ..HistoryCounts::default()
        },
        bytes: HistoryBytes {
            disk: telemetry.disk_bytes,
            ..HistoryBytes::default()
        },
        trim: HistoryTrimMetrics {
            operation_count: telemetry.trim_operations,
            entries: telemetry.trimmed_entries,
            bytes: telemetry.trimmed_bytes,
            last_timestamp_ms: telemetry.last_trim_timestamp_ms.unwrap_or(0),
        },
        limits: HistoryLimitMetrics {
            max_entries: options.max_entries,
            max_bytes_retained: options.max_bytes_retained,
            keep_latest_for_ms: options.keep_latest_for.as_millis().min(u64::MAX as u128) as u64,
            ram_cache_entries: options.ram_cache_entries,
            max_disk_bytes: options.max_disk_bytes,
            persist_history: persist_enabled,
            restore_from_persistence: options.restore_from_persistence,
        },
        compaction: HistoryCompactionMetrics {
            runs: telemetry.compaction_runs,
            entries: telemetry.compaction_entries,
            bytes: telemetry.compaction_bytes,
            last_timestamp_ms: telemetry.last_compaction_timestamp_ms.unwrap_or(0),
        },
        last_operation: telemetry.last_operation.clone(),
        unsupported: unsupported_stats(telemetry),
    }
}

/// Full stats for a snapshot root, under its lock.
pub(crate) fn gather_stats(inner: &SnapshotRootInner) -> HistoryStats {
    let mut stats = base_stats(&inner.telemetry, &inner.options, inner.persistence.enabled);
    stats.counts.undo = inner.undo_stack.len();
    stats.counts.redo = inner.redo_stack.len();
    stats.bytes.total = compute_total_bytes(inner);
    stats.bytes.undo = inner.telemetry.undo_bytes;
    stats.bytes.redo = inner.telemetry.redo_bytes;
    stats.bytes.live = inner.live_bytes;
    stats
}

fn remove_oldest(
    stack: &mut Vec<SnapshotEntryState>,
    telemetry_bytes: &mut usize,
    persistence: &SnapshotPersistence,
    stats: &mut TrimStats,
    total_bytes: &mut usize,
) -> bool {
    if stack.is_empty() {
        return false;
    }
    let entry = stack.remove(0);
    if entry.persisted {
        persistence::remove_entry_files(persistence, entry.snapshot.generation);
    }
    *telemetry_bytes = telemetry_bytes.saturating_sub(entry.bytes);
    *total_bytes = total_bytes.saturating_sub(entry.bytes);
    stats.entries_removed += 1;
    stats.bytes_removed += entry.bytes;
    true
}

/// Evict entries until the root fits its count and byte limits.
pub(crate) fn apply_retention(inner: &mut SnapshotRootInner) -> TrimStats {
    let mut stats = TrimStats::default();
    let mut total_bytes = compute_total_bytes(inner);

    if inner.options.max_entries > 0 {
        while inner.undo_stack.len() > inner.options.max_entries {
            if !remove_oldest(
                &mut inner.undo_stack,
                &mut inner.telemetry.undo_bytes,
                &inner.persistence,
                &mut stats,
                &mut total_bytes,
            ) {
                break;
            }
        }
        while inner.redo_stack.len() > inner.options.max_entries {
            if !remove_oldest(
                &mut inner.redo_stack,
                &mut inner.telemetry.redo_bytes,
                &inner.persistence,
                &mut stats,
                &mut total_bytes,
            ) {
                break;
            }
        }
    }

    if inner.options.max_bytes_retained > 0 {
        while total_bytes > inner.options.max_bytes_retained {
            if !inner.undo_stack.is_empty() {
                if !remove_oldest(
                    &mut inner.undo_stack,
                    &mut inner.telemetry.undo_bytes,
                    &inner.persistence,
                    &mut stats,
                    &mut total_bytes,
                ) {
                    break;
                }
                continue;
            }
            if !inner.redo_stack.is_empty() {
                if !remove_oldest(
                    &mut inner.redo_stack,
                    &mut inner.telemetry.redo_bytes,
                    &inner.persistence,
                    &mut stats,
                    &mut total_bytes,
                ) {
                    break;
                }
                continue;
            }
            break;
        }
    }

    if stats.entries_removed > 0 {
        update_trim_telemetry(&mut inner.telemetry, &stats);
    }

    stats
}

pub(crate) fn update_trim_telemetry(telemetry: &mut Telemetry, stats: &TrimStats) {
    if stats.entries_removed == 0 {
        return;
    }
    telemetry.trim_operations += 1;
    telemetry.trimmed_entries += stats.entries_removed;
    telemetry.trimmed_bytes += stats.bytes_removed;
    telemetry.last_trim_timestamp_ms = Some(histree_core::clock::now_millis());
}

impl UndoableSpace {
    /// Capture the root's subtree as a fresh snapshot.
    ///
    /// Fails (recording the offending path in the unsupported log) on
    /// nested stores, executable payloads, and non-serializable payloads.
    pub(crate) fn capture_snapshot_locked(
        &self,
        root: &SnapshotRoot,
        inner: &mut SnapshotRootInner,
    ) -> Result<Snapshot> {
        let mut mutations: Vec<Mutation> = Vec::new();
        let mut failure: Option<(String, &'static str)> = None;

        let walk_result = self.store.visit_subtree(&root.components, &mut |relative, node| {
            if node.nested {
                failure = Some((
                    join_path(root.path.as_str(), relative),
                    UNSUPPORTED_NESTED_MESSAGE,
                ));
                return Err(Error::Unknown(UNSUPPORTED_NESTED_MESSAGE.into()));
            }
            if let Some(data) = &node.data {
                if data.has_execution_payload() {
                    failure = Some((
                        join_path(root.path.as_str(), relative),
                        UNSUPPORTED_EXECUTION_MESSAGE,
                    ));
                    return Err(Error::Unknown(UNSUPPORTED_EXECUTION_MESSAGE.into()));
                }
                if !data.is_empty() {
                    match data.serialize_snapshot() {
                        Some(bytes) => mutations.push(Mutation {
                            components: relative.to_vec(),
                            payload: Arc::new(bytes),
                        }),
                        None => {
                            failure = Some((
                                join_path(root.path.as_str(), relative),
                                UNSUPPORTED_SERIALIZATION_MESSAGE,
                            ));
                            return Err(Error::Unknown(
                                UNSUPPORTED_SERIALIZATION_MESSAGE.into(),
                            ));
                        }
                    }
                }
            }
            Ok(())
        });

        match walk_result {
            Err(err) => {
                if let Some((path, reason)) = failure {
                    inner.telemetry.record_unsupported(&path, reason);
                    return Err(Error::Unknown(format!("{reason} at {path}")));
                }
                Err(err)
            }
            Ok(false) => Ok(inner.prototype.empty_snapshot()),
            Ok(true) => {
                let mut snapshot = inner.prototype.empty_snapshot();
                for mutation in &mutations {
                    snapshot = inner.prototype.apply(&snapshot, mutation);
                }
                Ok(snapshot)
            }
        }
    }

    /// Write a snapshot back into the store subtree, erasing everything
    /// the snapshot does not mention.
    pub(crate) fn apply_snapshot_to_store(
        &self,
        root: &SnapshotRoot,
        snapshot: &Snapshot,
    ) -> Result<()> {
        fn apply_node(target: &mut Node, source: &CowNode) -> Result<()> {
            target.nested = false;
            target.data = match &source.payload {
                Some(bytes) => Some(NodeData::deserialize_snapshot(bytes).ok_or_else(|| {
                    Error::Unknown("failed to restore node payload".to_string())
                })?),
                None => None,
            };
            for (name, child) in &source.children {
                apply_node(target.child_mut_or_create(name), child)?;
            }
            target
                .children
                .retain(|name, _| source.children.contains_key(name));
            Ok(())
        }

        self.store
            .with_subtree_mut(&root.components, true, |node| match &snapshot.root {
                None => {
                    node.clear_subtree();
                    Ok(())
                }
                Some(source) => apply_node(node, source),
            })
            .unwrap_or(Ok(()))
    }

    /// One undo or redo step: pop the source stack, apply the snapshot,
    /// push the replaced live state on the target stack.
    pub(crate) fn perform_history_step(
        &self,
        root: &SnapshotRoot,
        inner: &mut SnapshotRootInner,
        source_is_undo: bool,
        operation_name: &str,
        empty_message: &str,
    ) -> Result<()> {
        let scope = OpScope::begin(
            operation_name,
            "",
            inner.undo_stack.len(),
            inner.redo_stack.len(),
            compute_total_bytes(inner),
        );

        let source_len = if source_is_undo {
            inner.undo_stack.len()
        } else {
            inner.redo_stack.len()
        };
        if source_len == 0 {
            let (undo, redo, bytes) = (
                inner.undo_stack.len(),
                inner.redo_stack.len(),
                compute_total_bytes(inner),
            );
            scope.finish(&mut inner.telemetry, undo, redo, bytes, false, "empty");
            return Err(Error::NoObjectFound(empty_message.to_string()));
        }

        let top = source_len - 1;
        let needs_load = {
            let stack = if source_is_undo {
                &inner.undo_stack
            } else {
                &inner.redo_stack
            };
            !stack[top].cached && stack[top].persisted
        };
        if needs_load {
            if let Err(err) = persistence::load_entry_snapshot(inner, top, source_is_undo) {
                let (undo, redo, bytes) = (
                    inner.undo_stack.len(),
                    inner.redo_stack.len(),
                    compute_total_bytes(inner),
                );
                scope.finish(&mut inner.telemetry, undo, redo, bytes, false, "load_failed");
                return Err(err);
            }
        }

        let entry = {
            let stack = if source_is_undo {
                &mut inner.undo_stack
            } else {
                &mut inner.redo_stack
            };
            match stack.pop() {
                Some(entry) => entry,
                None => {
                    return Err(Error::Unknown("history stack emptied concurrently".into()))
                }
            }
        };
        let entry_bytes = entry.bytes;
        if source_is_undo {
            inner.telemetry.undo_bytes = inner.telemetry.undo_bytes.saturating_sub(entry_bytes);
        } else {
            inner.telemetry.redo_bytes = inner.telemetry.redo_bytes.saturating_sub(entry_bytes);
        }

        let current_snapshot = inner.live_snapshot.clone();
        let current_bytes = inner.live_bytes;

        if let Err(apply_err) = self.apply_snapshot_to_store(root, &entry.snapshot) {
            // Best-effort restore of the previous live state.
            let _ = self.apply_snapshot_to_store(root, &current_snapshot);
            inner.live_snapshot = current_snapshot;
            inner.live_bytes = current_bytes;
            let message = apply_err.message();
            let stack = if source_is_undo {
                &mut inner.undo_stack
            } else {
                &mut inner.redo_stack
            };
            stack.push(entry);
            if source_is_undo {
                inner.telemetry.undo_bytes += entry_bytes;
            } else {
                inner.telemetry.redo_bytes += entry_bytes;
            }
            let (undo, redo, bytes) = (
                inner.undo_stack.len(),
                inner.redo_stack.len(),
                compute_total_bytes(inner),
            );
            scope.finish(&mut inner.telemetry, undo, redo, bytes, false, message);
            return Err(apply_err);
        }

        let inverse = SnapshotEntryState {
            snapshot: current_snapshot,
            bytes: current_bytes,
            timestamp_ms: histree_core::clock::now_millis(),
            // The replaced live snapshot was written to disk when it
            // became live, so its files already exist.
            persisted: inner.persistence.enabled,
            cached: true,
        };
        if source_is_undo {
            inner.redo_stack.push(inverse);
            inner.telemetry.redo_bytes += current_bytes;
        } else {
            inner.undo_stack.push(inverse);
            inner.telemetry.undo_bytes += current_bytes;
        }

        inner.live_snapshot = entry.snapshot;
        inner.live_bytes = entry.bytes;

        if !inner.options.manual_garbage_collect {
            apply_retention(inner);
        }

        let (undo, redo, bytes) = (
            inner.undo_stack.len(),
            inner.redo_stack.len(),
            compute_total_bytes(inner),
        );
        scope.finish(&mut inner.telemetry, undo, redo, bytes, true, "");
        Ok(())
    }

    /// Run `steps` undo or redo steps on a snapshot root.
    pub(crate) fn apply_history_steps(
        &self,
        root: &SnapshotRoot,
        mut steps: usize,
        is_undo: bool,
    ) -> Result<()> {
        let mut inner = root.inner.lock();
        if inner.active_transaction.is_some() {
            return Err(Error::InvalidPermissions(if is_undo {
                "cannot undo while transaction open".into()
            } else {
                "cannot redo while transaction open".into()
            }));
        }
        if steps == 0 {
            steps = 1;
        }

        let (operation_name, empty_message) = if is_undo {
            ("undo", "nothing to undo")
        } else {
            ("redo", "nothing to redo")
        };

        for _ in 0..steps {
            self.perform_history_step(root, &mut inner, is_undo, operation_name, empty_message)?;
        }

        self.finalize_history_mutation(&mut inner, false)
    }

    /// Mark state dirty, re-apply the cache policy, and persist.
    pub(crate) fn finalize_history_mutation(
        &self,
        inner: &mut SnapshotRootInner,
        force_fsync: bool,
    ) -> Result<()> {
        inner.persistence.state_dirty = true;
        persistence::apply_ram_cache_policy(inner);
        persistence::persist_stacks(inner, force_fsync)
    }

    /// Evict undo entries whose stack index satisfies the predicate.
    pub(crate) fn trim_history_snapshot(
        &self,
        root: &SnapshotRoot,
        predicate: &dyn Fn(usize) -> bool,
    ) -> Result<TrimStats> {
        let mut inner = root.inner.lock();
        if inner.active_transaction.is_some() {
            return Err(Error::InvalidPermissions(
                "cannot trim while transaction open".into(),
            ));
        }

        let scope = OpScope::begin(
            "trim",
            "",
            inner.undo_stack.len(),
            inner.redo_stack.len(),
            compute_total_bytes(&inner),
        );

        let mut stats = TrimStats::default();
        let mut kept = Vec::with_capacity(inner.undo_stack.len());
        let undo_stack = std::mem::take(&mut inner.undo_stack);
        for (index, entry) in undo_stack.into_iter().enumerate() {
            if predicate(index) {
                stats.entries_removed += 1;
                stats.bytes_removed += entry.bytes;
                if entry.persisted {
                    persistence::remove_entry_files(&inner.persistence, entry.snapshot.generation);
                }
            } else {
                kept.push(entry);
            }
        }
        inner.undo_stack = kept;

        if stats.entries_removed == 0 {
            let (undo, redo, bytes) = (
                inner.undo_stack.len(),
                inner.redo_stack.len(),
                compute_total_bytes(&inner),
            );
            scope.finish(&mut inner.telemetry, undo, redo, bytes, true, "no_trim");
            return Ok(stats);
        }

        inner.telemetry.undo_bytes = inner
            .telemetry
            .undo_bytes
            .saturating_sub(stats.bytes_removed);
        update_trim_telemetry(&mut inner.telemetry, &stats);

        let (undo, redo, bytes) = (
            inner.undo_stack.len(),
            inner.redo_stack.len(),
            compute_total_bytes(&inner),
        );
        scope.finish(
            &mut inner.telemetry,
            undo,
            redo,
            bytes,
            true,
            format!("trimmed={}", stats.entries_removed),
        );

        self.finalize_history_mutation(&mut inner, false)?;
        Ok(stats)
    }
}
