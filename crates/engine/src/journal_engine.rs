//! Mutation-journal history engine.
//!
//! Journal roots never materialize whole-subtree snapshots. Each mutation
//! records the target node's payload before and after; undo applies the
//! inverse payload, redo the forward one, one entry per step. The journal
//! file on disk holds every retained entry; the cursor is an in-memory
//! notion and recovery replays the full file.

use histree_core::{clock, Error, HistoryStats, NodeData, Result, StorePath};
use histree_durability::{
    replay_journal, JournalEntry, JournalFileWriter, JournalState, OperationKind,
    SerializedPayload,
};

use crate::persistence;
use crate::roots::{
    JournalRoot, JournalRootInner, OpScope, UNSUPPORTED_EXECUTION_MESSAGE,
    UNSUPPORTED_NESTED_MESSAGE, UNSUPPORTED_SERIALIZATION_MESSAGE,
};
use crate::snapshot_engine::{base_stats, join_path};
use crate::space::UndoableSpace;
use crate::telemetry::TelemetryValue;

/// undo + redo + live byte estimate for a journal root.
pub(crate) fn compute_total_bytes(inner: &JournalRootInner) -> usize {
    let stats = inner.journal.stats();
    stats.undo_bytes + stats.redo_bytes + inner.live_bytes
}

/// Full stats for a journal root, under its lock.
pub(crate) fn gather_stats(inner: &JournalRootInner) -> HistoryStats {
    let journal_stats = inner.journal.stats();
    let mut stats = base_stats(&inner.telemetry, &inner.options, inner.persistence.enabled);
    stats.counts.undo = journal_stats.undo_count;
    stats.counts.redo = journal_stats.redo_count;
    stats.bytes.undo = journal_stats.undo_bytes;
    stats.bytes.redo = journal_stats.redo_bytes;
    stats.bytes.live = inner.live_bytes;
    stats.bytes.total = journal_stats.undo_bytes + journal_stats.redo_bytes + inner.live_bytes;
    stats
}

/// Refresh the byte/cache counters mirrored from the journal.
pub(crate) fn refresh_journal_telemetry(inner: &mut JournalRootInner) {
    let stats = inner.journal.stats();
    inner.telemetry.cached_undo = stats.undo_count;
    inner.telemetry.cached_redo = stats.redo_count;
    inner.telemetry.undo_bytes = stats.undo_bytes;
    inner.telemetry.redo_bytes = stats.redo_bytes;
}

fn encode_payload(
    data: Option<&NodeData>,
    path: &str,
    telemetry: &mut crate::roots::Telemetry,
) -> Result<SerializedPayload> {
    match data {
        None => Ok(SerializedPayload::absent()),
        Some(data) => match data.serialize_snapshot() {
            Some(bytes) => Ok(SerializedPayload::from_bytes(bytes)),
            None => {
                telemetry.record_unsupported(path, UNSUPPORTED_SERIALIZATION_MESSAGE);
                Err(Error::Unknown(format!(
                    "{UNSUPPORTED_SERIALIZATION_MESSAGE} at {path}"
                )))
            }
        },
    }
}

/// Decode a journal payload back into node data. Absent payloads erase.
fn decode_payload(payload: &SerializedPayload, context: &str) -> Result<Option<NodeData>> {
    if !payload.present {
        return Ok(None);
    }
    NodeData::deserialize_snapshot(&payload.bytes)
        .map(Some)
        .ok_or_else(|| Error::MalformedInput(format!("unable to decode node payload ({context})")))
}

/// Diagnostics reads under `_history/entries/<index>/...`.
pub(crate) fn read_journal_entry_value(
    journal: &JournalState,
    relative: &str,
) -> Option<Result<TelemetryValue>> {
    let suffix = relative.strip_prefix("_history/entries/")?;
    let (index_part, field) = suffix.split_once('/')?;
    let Ok(index) = index_part.parse::<usize>() else {
        return Some(Err(Error::InvalidPath(
            "invalid history entry index".into(),
        )));
    };
    let Some(entry) = journal.entry_at(index) else {
        return Some(Err(Error::NoObjectFound(
            "history entry not found".into(),
        )));
    };
    let value = match field {
        "path" => TelemetryValue::Text(entry.path.clone()),
        "tag" => TelemetryValue::Text(entry.tag.clone()),
        "operation" => TelemetryValue::Text(
            match entry.operation {
                OperationKind::Insert => "insert",
                OperationKind::Take => "take",
            }
            .to_string(),
        ),
        "timestampMs" => TelemetryValue::UInt(entry.timestamp_ms),
        "monotonicNs" => TelemetryValue::UInt(entry.monotonic_ns),
        "sequence" => TelemetryValue::UInt(entry.sequence),
        "barrier" => TelemetryValue::Bool(entry.barrier),
        "valueBytes" => TelemetryValue::UInt(entry.value.bytes.len() as u64),
        "inverseBytes" => TelemetryValue::UInt(entry.inverse_value.bytes.len() as u64),
        "hasValue" => TelemetryValue::Bool(entry.value.present),
        "hasInverse" => TelemetryValue::Bool(entry.inverse_value.present),
        other => {
            return Some(Err(Error::NotFound(format!(
                "unsupported history telemetry path: _history/entries/{index_part}/{other}"
            ))))
        }
    };
    Some(Ok(value))
}

impl UndoableSpace {
    /// Clone the node payload at the root-relative components, refusing
    /// nested stores and executable payloads. Empty queues read as
    /// absent.
    pub(crate) fn capture_journal_node(
        &self,
        root: &JournalRoot,
        inner: &mut JournalRootInner,
        relative: &[String],
    ) -> Result<Option<NodeData>> {
        let mut components = root.components.clone();
        components.extend(relative.iter().cloned());
        let Some(captured) = self.store.capture_node(&components) else {
            return Ok(None);
        };

        if captured.nested {
            let path = join_path(root.path.as_str(), relative);
            inner
                .telemetry
                .record_unsupported(&path, UNSUPPORTED_NESTED_MESSAGE);
            return Err(Error::Unknown(format!(
                "{UNSUPPORTED_NESTED_MESSAGE} at {path}"
            )));
        }
        match captured.data {
            None => Ok(None),
            Some(data) if data.is_empty() => Ok(None),
            Some(data) => {
                if data.has_execution_payload() {
                    let path = join_path(root.path.as_str(), relative);
                    inner
                        .telemetry
                        .record_unsupported(&path, UNSUPPORTED_EXECUTION_MESSAGE);
                    return Err(Error::Unknown(format!(
                        "{UNSUPPORTED_EXECUTION_MESSAGE} at {path}"
                    )));
                }
                Ok(Some(data))
            }
        }
    }

    /// Write a payload (or erase) at the root-relative components and
    /// adjust the root's live-byte estimate.
    pub(crate) fn apply_journal_node(
        &self,
        root: &JournalRoot,
        inner: &mut JournalRootInner,
        relative: &[String],
        payload: Option<NodeData>,
    ) {
        let mut components = root.components.clone();
        components.extend(relative.iter().cloned());
        let (before, after) = self.store.set_node_data(&components, payload);
        if after >= before {
            inner.live_bytes += after - before;
        } else {
            inner.live_bytes = inner.live_bytes.saturating_sub(before - after);
        }
    }

    /// Build and append one reversible entry for a committed mutation.
    ///
    /// Inside a transaction the entry still lands in the journal
    /// immediately; the transaction batches the file fsync and stamps the
    /// barrier flag on the first entry of an explicit batch.
    pub(crate) fn record_journal_mutation(
        &self,
        inner: &mut JournalRootInner,
        operation: OperationKind,
        full_path: &StorePath,
        value_after: Option<&NodeData>,
        value_before: Option<&NodeData>,
    ) -> Result<()> {
        let value = encode_payload(value_after, full_path.as_str(), &mut inner.telemetry)?;
        let inverse_value =
            encode_payload(value_before, full_path.as_str(), &mut inner.telemetry)?;

        let barrier = match &inner.active_transaction {
            Some(tx) => tx.explicit && tx.entries_recorded == 0,
            None => false,
        };

        let entry = JournalEntry {
            operation,
            path: full_path.as_str().to_string(),
            tag: inner.current_tag.clone(),
            value,
            inverse_value,
            timestamp_ms: clock::now_millis(),
            monotonic_ns: clock::monotonic_nanos(),
            sequence: inner.next_sequence,
            barrier,
        };
        inner.next_sequence += 1;

        let enforce_retention = !inner.options.manual_garbage_collect;
        inner.journal.append(entry.clone(), enforce_retention);

        if let Some(tx) = inner.active_transaction.as_mut() {
            tx.entries_recorded += 1;
            tx.dirty = true;
        }

        if inner.persistence.enabled {
            if inner.persistence.writer.is_none() {
                inner.persistence.writer = Some(JournalFileWriter::new(
                    inner.persistence.journal_path.clone(),
                ));
            }
            if let Some(writer) = inner.persistence.writer.as_mut() {
                if let Err(err) = writer.append(&entry, false) {
                    inner.persistence.persistence_dirty = true;
                    inner.telemetry.persistence_dirty = true;
                    return Err(err);
                }
            }
            // Retention may have trimmed entries the file still carries.
            inner.persistence.persistence_dirty = true;
        }

        refresh_journal_telemetry(inner);
        Ok(())
    }

    fn apply_journal_entry(
        &self,
        root: &JournalRoot,
        inner: &mut JournalRootInner,
        entry: &JournalEntry,
        source_is_undo: bool,
    ) -> Result<()> {
        let entry_path = StorePath::parse(&entry.path)?;
        let relative = histree_core::path::relative_components(&root.components, &entry_path)?;
        let payload = if source_is_undo {
            decode_payload(&entry.inverse_value, "inverse payload")?
        } else {
            decode_payload(&entry.value, "forward payload")?
        };
        self.apply_journal_node(root, inner, &relative, payload);
        Ok(())
    }

    /// One journal undo or redo step.
    pub(crate) fn perform_journal_step(
        &self,
        root: &JournalRoot,
        inner: &mut JournalRootInner,
        source_is_undo: bool,
        operation_name: &str,
        empty_message: &str,
    ) -> Result<()> {
        let before = inner.journal.stats();
        let scope = OpScope::begin(
            operation_name,
            &inner.current_tag,
            before.undo_count,
            before.redo_count,
            compute_total_bytes(inner),
        );

        let stepped = if source_is_undo {
            inner.journal.undo().cloned()
        } else {
            inner.journal.redo().cloned()
        };
        let Some(entry) = stepped else {
            let stats = inner.journal.stats();
            let bytes = compute_total_bytes(inner);
            scope.finish(
                &mut inner.telemetry,
                stats.undo_count,
                stats.redo_count,
                bytes,
                false,
                "empty",
            );
            return Err(Error::NoObjectFound(empty_message.to_string()));
        };

        let step_result = self.apply_journal_entry(root, inner, &entry, source_is_undo);

        refresh_journal_telemetry(inner);
        let stats = inner.journal.stats();
        let bytes = compute_total_bytes(inner);
        match step_result {
            Ok(()) => {
                scope.finish(
                    &mut inner.telemetry,
                    stats.undo_count,
                    stats.redo_count,
                    bytes,
                    true,
                    "",
                );
                Ok(())
            }
            Err(err) => {
                scope.finish(
                    &mut inner.telemetry,
                    stats.undo_count,
                    stats.redo_count,
                    bytes,
                    false,
                    err.message(),
                );
                Err(err)
            }
        }
    }

    /// Run `steps` undo or redo steps on a journal root.
    pub(crate) fn apply_journal_steps(
        &self,
        root: &JournalRoot,
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
            self.perform_journal_step(root, &mut inner, is_undo, operation_name, empty_message)?;
        }

        inner.persistence.state_dirty = true;
        if inner.persistence.enabled {
            inner.persistence.persistence_dirty = true;
        }
        Ok(())
    }

    /// `garbage_collect` control command: re-enforce retention, compact
    /// the journal file when entries were trimmed.
    pub(crate) fn journal_garbage_collect(&self, inner: &mut JournalRootInner) -> Result<()> {
        if inner.active_transaction.is_some() {
            return Err(Error::InvalidPermissions(
                "cannot garbage collect while transaction open".into(),
            ));
        }

        let before = inner.journal.stats();
        let scope = OpScope::begin(
            "garbage_collect",
            &inner.current_tag,
            before.undo_count,
            before.redo_count,
            compute_total_bytes(inner),
        );

        let policy = inner.journal.policy();
        inner.journal.set_retention_policy(policy);
        let after = inner.journal.stats();

        let trimmed_entries = after.trimmed_entries.saturating_sub(before.trimmed_entries);
        let trimmed_bytes = after.trimmed_bytes.saturating_sub(before.trimmed_bytes);

        refresh_journal_telemetry(inner);

        let message = if trimmed_entries == 0 {
            "no_trim".to_string()
        } else {
            inner.telemetry.trim_operations += 1;
            inner.telemetry.trimmed_entries += trimmed_entries;
            inner.telemetry.trimmed_bytes += trimmed_bytes;
            inner.telemetry.last_trim_timestamp_ms = Some(clock::now_millis());
            format!("trimmed={trimmed_entries}")
        };

        let bytes = compute_total_bytes(inner);
        scope.finish(
            &mut inner.telemetry,
            after.undo_count,
            after.redo_count,
            bytes,
            true,
            message,
        );

        inner.persistence.state_dirty = true;
        if inner.persistence.enabled {
            if trimmed_entries > 0 {
                persistence::compact_journal_persistence(inner, true)?;
            } else {
                persistence::update_journal_disk_telemetry(inner);
                inner.persistence.persistence_dirty = false;
                inner.telemetry.persistence_dirty = false;
            }
        }
        Ok(())
    }

    /// Replay the persisted journal file into memory and the store.
    ///
    /// A missing file resets the journal and marks persistence clean.
    pub(crate) fn load_journal_persistence(
        &self,
        root: &JournalRoot,
        inner: &mut JournalRootInner,
    ) -> Result<()> {
        if !inner.persistence.enabled {
            return Ok(());
        }

        let mut entries = Vec::new();
        let replay = replay_journal(persistence::journal_path(&inner.persistence), |entry| {
            entries.push(entry);
            Ok(())
        });

        if let Err(err) = replay {
            if err.is_not_found() {
                inner.journal.clear();
                inner.next_sequence = 0;
                refresh_journal_telemetry(inner);
                inner.persistence.persistence_dirty = false;
                inner.telemetry.persistence_dirty = false;
                persistence::update_journal_disk_telemetry(inner);
                return Ok(());
            }
            return Err(err);
        }

        inner.journal.clear();
        inner.live_bytes = 0;

        let mut max_sequence = 0u64;
        let mut sequence_seen = false;

        for entry in entries {
            max_sequence = max_sequence.max(entry.sequence);
            sequence_seen = sequence_seen || entry.sequence != 0;

            let entry_path = StorePath::parse(&entry.path)?;
            let relative =
                histree_core::path::relative_components(&root.components, &entry_path)?;
            let payload = decode_payload(&entry.value, "forward payload")?;
            self.apply_journal_node(root, inner, &relative, payload);

            inner.journal.append(entry, false);
        }

        let policy = inner.journal.policy();
        inner.journal.set_retention_policy(policy);

        let stats = inner.journal.stats();
        refresh_journal_telemetry(inner);
        inner.telemetry.trimmed_entries = stats.trimmed_entries;
        inner.telemetry.trimmed_bytes = stats.trimmed_bytes;
        if stats.trimmed_entries == 0 {
            inner.telemetry.trim_operations = 0;
        }

        inner.next_sequence = if sequence_seen {
            max_sequence + 1
        } else {
            stats.total_entries as u64
        };

        inner.persistence.persistence_dirty = false;
        inner.telemetry.persistence_dirty = false;
        persistence::update_journal_disk_telemetry(inner);
        Ok(())
    }
}
