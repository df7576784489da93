//! Transaction coordination.
//!
//! One transaction per root at a time, owned by a thread and depth-counted
//! for same-thread nesting. The root mutex is never held across the
//! transaction body; each mutation and the commit re-acquire it in short
//! critical sections, and the `active_transaction` record gates the
//! logical critical section. A different thread opening a transaction (or
//! stepping history) while one is active gets `InvalidPermissions`.

use std::sync::Arc;

use tracing::warn;

use histree_core::{Error, Result};

use crate::journal_engine::refresh_journal_telemetry;
use crate::persistence;
use crate::roots::{
    JournalRoot, JournalTransaction, OpScope, SnapshotEntryState, SnapshotRoot,
    SnapshotTransaction,
};
use crate::snapshot_engine::{apply_retention, compute_total_bytes};
use crate::space::UndoableSpace;

/// Which root a transaction is bound to.
pub(crate) enum TxTarget {
    Snapshot(Arc<SnapshotRoot>),
    Journal(Arc<JournalRoot>),
}

/// A history transaction handle.
///
/// Dropping the handle commits it; the commit error, if any, is logged.
/// Calling [`commit`](HistoryTransaction::commit) explicitly surfaces the
/// error instead and is idempotent.
pub struct HistoryTransaction<'a> {
    space: &'a UndoableSpace,
    target: Option<TxTarget>,
}

impl<'a> HistoryTransaction<'a> {
    pub(crate) fn new(space: &'a UndoableSpace, target: TxTarget) -> Self {
        HistoryTransaction {
            space,
            target: Some(target),
        }
    }

    /// Commit the transaction. Safe to call once; the drop commit becomes
    /// a no-op afterwards.
    pub fn commit(mut self) -> Result<()> {
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> Result<()> {
        match self.target.take() {
            None => Ok(()),
            Some(TxTarget::Snapshot(root)) => self.space.commit_snapshot_transaction(&root),
            Some(TxTarget::Journal(root)) => self.space.commit_journal_transaction(&root),
        }
    }
}

impl Drop for HistoryTransaction<'_> {
    fn drop(&mut self) {
        if self.target.is_none() {
            return;
        }
        if let Err(err) = self.commit_inner() {
            warn!("history transaction auto-commit failed: {err}");
        }
    }
}

impl UndoableSpace {
    /// Open (or deepen) a transaction on a snapshot root.
    pub(crate) fn begin_snapshot_transaction(&self, root: &SnapshotRoot) -> Result<()> {
        let mut inner = root.inner.lock();
        let current = std::thread::current().id();

        if let Some(tx) = inner.active_transaction.as_mut() {
            if tx.owner != current {
                return Err(Error::InvalidPermissions(
                    "history transaction already active on another thread".into(),
                ));
            }
            tx.depth += 1;
            return Ok(());
        }

        let pre_image = inner.live_snapshot.clone();
        let pre_image_bytes = inner.live_bytes;
        inner.active_transaction = Some(SnapshotTransaction {
            owner: current,
            depth: 1,
            dirty: false,
            pre_image,
            pre_image_bytes,
        });
        Ok(())
    }

    /// Flag the active snapshot transaction as having mutated state.
    pub(crate) fn mark_snapshot_transaction_dirty(&self, root: &SnapshotRoot) {
        let mut inner = root.inner.lock();
        if let Some(tx) = inner.active_transaction.as_mut() {
            tx.dirty = true;
        }
    }

    /// Close one nesting level; at depth zero, capture and commit.
    pub(crate) fn commit_snapshot_transaction(&self, root: &SnapshotRoot) -> Result<()> {
        let mut inner = root.inner.lock();
        let current = std::thread::current().id();

        let Some(tx) = inner.active_transaction.as_mut() else {
            return Ok(());
        };
        if tx.owner != current {
            return Err(Error::InvalidPermissions(
                "history transaction owned by another thread".into(),
            ));
        }
        tx.depth -= 1;
        if tx.depth > 0 {
            return Ok(());
        }

        let Some(tx) = inner.active_transaction.take() else {
            return Ok(());
        };
        let before = tx.pre_image;
        let before_bytes = tx.pre_image_bytes;
        let dirty = tx.dirty;

        let scope = OpScope::begin(
            "commit",
            "",
            inner.undo_stack.len(),
            inner.redo_stack.len(),
            compute_total_bytes(&inner),
        );

        if !dirty {
            let (undo, redo, bytes) = (
                inner.undo_stack.len(),
                inner.redo_stack.len(),
                compute_total_bytes(&inner),
            );
            scope.finish(&mut inner.telemetry, undo, redo, bytes, true, "no_changes");
            return Ok(());
        }

        let latest = match self.capture_snapshot_locked(root, &mut inner) {
            Ok(latest) => latest,
            Err(capture_err) => {
                // Roll the store back to the pre-image; a rollback failure
                // is only logged and the capture error surfaces.
                if let Err(rollback_err) = self.apply_snapshot_to_store(root, &before) {
                    warn!("history transaction rollback failed: {rollback_err}");
                }
                inner.live_snapshot = before;
                inner.live_bytes = before_bytes;
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
                    false,
                    capture_err.message(),
                );
                return Err(capture_err);
            }
        };

        if latest.same_state(&before) {
            let (undo, redo, bytes) = (
                inner.undo_stack.len(),
                inner.redo_stack.len(),
                compute_total_bytes(&inner),
            );
            scope.finish(&mut inner.telemetry, undo, redo, bytes, true, "no_snapshot");
            return Ok(());
        }

        let undo_bytes = inner.live_bytes;
        inner.undo_stack.push(SnapshotEntryState {
            snapshot: before,
            bytes: undo_bytes,
            timestamp_ms: histree_core::clock::now_millis(),
            persisted: false,
            cached: true,
        });
        inner.telemetry.undo_bytes += undo_bytes;

        inner.live_bytes = inner.prototype.analyze(&latest).payload_bytes;
        inner.live_snapshot = latest;

        for redo_entry in std::mem::take(&mut inner.redo_stack) {
            if redo_entry.persisted {
                persistence::remove_entry_files(
                    &inner.persistence,
                    redo_entry.snapshot.generation,
                );
            }
        }
        inner.telemetry.redo_bytes = 0;
        inner.persistence.state_dirty = true;

        let mut message = String::new();
        if !inner.options.manual_garbage_collect {
            let trim_stats = apply_retention(&mut inner);
            if trim_stats.entries_removed > 0 {
                message = format!("trimmed={}", trim_stats.entries_removed);
            }
        }

        let (undo, redo, bytes) = (
            inner.undo_stack.len(),
            inner.redo_stack.len(),
            compute_total_bytes(&inner),
        );
        scope.finish(&mut inner.telemetry, undo, redo, bytes, true, message);

        persistence::apply_ram_cache_policy(&mut inner);
        persistence::persist_stacks(&mut inner, false)
    }

    /// Open (or deepen) a transaction on a journal root.
    pub(crate) fn begin_journal_transaction(
        &self,
        root: &JournalRoot,
        explicit: bool,
    ) -> Result<()> {
        let mut inner = root.inner.lock();
        let current = std::thread::current().id();

        if let Some(tx) = inner.active_transaction.as_mut() {
            if tx.owner != current {
                return Err(Error::InvalidPermissions(
                    "history transaction already active on another thread".into(),
                ));
            }
            tx.depth += 1;
            return Ok(());
        }

        inner.active_transaction = Some(JournalTransaction {
            owner: current,
            depth: 1,
            dirty: false,
            explicit,
            entries_recorded: 0,
        });
        Ok(())
    }

    /// Close one nesting level; at depth zero, flush the batched journal
    /// appends to disk.
    pub(crate) fn commit_journal_transaction(&self, root: &JournalRoot) -> Result<()> {
        let mut inner = root.inner.lock();
        let current = std::thread::current().id();

        let Some(tx) = inner.active_transaction.as_mut() else {
            return Ok(());
        };
        if tx.owner != current {
            return Err(Error::InvalidPermissions(
                "history transaction owned by another thread".into(),
            ));
        }
        tx.depth -= 1;
        if tx.depth > 0 {
            return Ok(());
        }

        let Some(tx) = inner.active_transaction.take() else {
            return Ok(());
        };
        let journal_stats = inner.journal.stats();
        let scope = OpScope::begin(
            "commit",
            &inner.current_tag,
            journal_stats.undo_count,
            journal_stats.redo_count,
            crate::journal_engine::compute_total_bytes(&inner),
        );

        if !tx.dirty {
            let stats = inner.journal.stats();
            let bytes = crate::journal_engine::compute_total_bytes(&inner);
            scope.finish(
                &mut inner.telemetry,
                stats.undo_count,
                stats.redo_count,
                bytes,
                true,
                "no_changes",
            );
            return Ok(());
        }

        // Entries were appended while the transaction ran; this is where
        // the batched file writes become durable.
        inner.persistence.state_dirty = true;
        let mut sync_result = Ok(());
        if inner.persistence.enabled {
            if let Some(writer) = inner.persistence.writer.as_mut() {
                sync_result = writer.sync();
            }
            if sync_result.is_ok() {
                inner.persistence.persistence_dirty = false;
                inner.telemetry.persistence_dirty = false;
            }
            persistence::update_journal_disk_telemetry(&mut inner);
        }

        refresh_journal_telemetry(&mut inner);
        let stats = inner.journal.stats();
        let bytes = crate::journal_engine::compute_total_bytes(&inner);
        match sync_result {
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
                inner.persistence.persistence_dirty = true;
                inner.telemetry.persistence_dirty = true;
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
}
