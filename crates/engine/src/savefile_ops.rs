//! Savefile export and import.
//!
//! A savefile captures one journal root: options, sequence counter, every
//! retained entry, and the cursor position. Import rebuilds the journal
//! inside an already-enabled root — the leading `undo_count` entries are
//! applied to the store, the rest are rewound onto the redo side.
//!
//! Snapshot-mode roots do not export; their durable form is the per-entry
//! persistence directory.

use std::path::Path;

use histree_core::{Error, Result, StorePath};
use histree_durability::{fsio, savefile, SavefileDocument, SavefileOptions};

use crate::journal_engine::refresh_journal_telemetry;
use crate::persistence;
use crate::roots::JournalRoot;
use crate::space::UndoableSpace;

impl UndoableSpace {
    /// Export a journal root's history into a savefile.
    pub fn export_history_savefile(
        &self,
        root: &str,
        file: &Path,
        fsync_data: bool,
    ) -> Result<()> {
        let root_path = StorePath::parse(root)?;
        if self.find_snapshot_root(&root_path).is_some() {
            return Err(Error::NotSupported(
                "savefile export is only available for mutation-journal roots".into(),
            ));
        }
        let Some(state) = self.find_journal_root(&root_path) else {
            return Err(Error::NotFound("history root not enabled".into()));
        };

        let document = {
            let inner = state.inner.lock();
            if inner.active_transaction.is_some() {
                return Err(Error::InvalidPermissions(
                    "cannot export while transaction active".into(),
                ));
            }
            SavefileDocument {
                root_path: state.path.as_str().to_string(),
                options: SavefileOptions {
                    max_entries: inner.options.max_entries as u64,
                    max_bytes_retained: inner.options.max_bytes_retained as u64,
                    ram_cache_entries: inner.options.ram_cache_entries as u64,
                    max_disk_bytes: inner.options.max_disk_bytes as u64,
                    keep_latest_for_ms: inner
                        .options
                        .keep_latest_for
                        .as_millis()
                        .min(u64::MAX as u128) as u64,
                    manual_garbage_collect: inner.options.manual_garbage_collect,
                },
                next_sequence: inner.next_sequence,
                undo_count: inner.journal.cursor(),
                entries: inner.journal.iter().cloned().collect(),
            }
        };

        let encoded = savefile::encode(&document)?;
        fsio::write_file_atomic(file, &encoded, fsync_data)
    }

    /// Import a savefile into an enabled journal root, replacing its
    /// history.
    pub fn import_history_savefile(
        &self,
        root: &str,
        file: &Path,
        apply_options: bool,
    ) -> Result<()> {
        let bytes = fsio::read_file(file)?;
        let document = savefile::decode(&bytes)?;

        let root_path = StorePath::parse(root)?;
        if self.find_snapshot_root(&root_path).is_some() {
            return Err(Error::NotSupported(
                "savefile import is only available for mutation-journal roots".into(),
            ));
        }
        let Some(state) = self.find_journal_root(&root_path) else {
            return Err(Error::NotFound("history root not enabled".into()));
        };

        if !document.root_path.is_empty() && document.root_path != state.path.as_str() {
            return Err(Error::InvalidPath("savefile root mismatch".into()));
        }

        self.import_document(&state, document, apply_options)
    }

    fn import_document(
        &self,
        state: &JournalRoot,
        document: SavefileDocument,
        apply_options: bool,
    ) -> Result<()> {
        let mut inner = state.inner.lock();
        if inner.active_transaction.is_some() {
            return Err(Error::InvalidPermissions(
                "cannot import while transaction active".into(),
            ));
        }

        if apply_options {
            inner.options.max_entries = document.options.max_entries as usize;
            inner.options.max_bytes_retained = document.options.max_bytes_retained as usize;
            inner.options.max_disk_bytes = document.options.max_disk_bytes as usize;
            inner.options.keep_latest_for =
                std::time::Duration::from_millis(document.options.keep_latest_for_ms);
            inner.options.manual_garbage_collect = document.options.manual_garbage_collect;
            if document.options.ram_cache_entries > 0 {
                inner.options.ram_cache_entries = document.options.ram_cache_entries as usize;
            }
            if inner.options.ram_cache_entries == 0 {
                inner.options.ram_cache_entries = 8;
            }
        }

        inner.journal.clear();
        inner.telemetry.cached_undo = 0;
        inner.telemetry.cached_redo = 0;
        inner.telemetry.undo_bytes = 0;
        inner.telemetry.redo_bytes = 0;
        inner.telemetry.trimmed_entries = 0;
        inner.telemetry.trimmed_bytes = 0;
        inner.telemetry.trim_operations = 0;
        inner.telemetry.persistence_dirty = false;
        inner.persistence.persistence_dirty = inner.persistence.enabled;
        inner.persistence.state_dirty = inner.persistence.enabled;
        inner.live_bytes = 0;

        let mut policy = inner.journal.policy();
        policy.max_entries = inner.options.max_entries;
        policy.max_bytes = inner.options.max_bytes_retained;
        inner.journal.set_retention_policy(policy);

        let mut max_sequence = 0u64;
        let mut sequence_seen = false;
        let entry_count = document.entries.len();

        for (index, entry) in document.entries.into_iter().enumerate() {
            max_sequence = max_sequence.max(entry.sequence);
            sequence_seen = sequence_seen || entry.sequence != 0;

            let apply_to_live = index < document.undo_count;
            if apply_to_live {
                let entry_path = StorePath::parse(&entry.path)?;
                let relative =
                    histree_core::path::relative_components(&state.components, &entry_path)?;
                let payload = if entry.value.present {
                    Some(
                        histree_core::NodeData::deserialize_snapshot(&entry.value.bytes)
                            .ok_or_else(|| {
                                Error::MalformedInput(
                                    "unable to decode node payload (forward payload)".into(),
                                )
                            })?,
                    )
                } else {
                    None
                };
                self.apply_journal_node(state, &mut inner, &relative, payload);
            }

            inner.journal.append(entry, false);
        }

        // Rewind the cursor so trailing entries become the redo side.
        for _ in document.undo_count..entry_count {
            if inner.journal.undo().is_none() {
                return Err(Error::Unknown("failed to rebuild redo stack".into()));
            }
        }

        let fallback_next = entry_count as u64;
        let next_from_sequence = if sequence_seen {
            max_sequence + 1
        } else {
            fallback_next
        };
        inner.next_sequence = document.next_sequence.max(next_from_sequence);

        refresh_journal_telemetry(&mut inner);
        inner.live_bytes = self.store.subtree_payload_bytes(&state.components);

        if inner.persistence.enabled {
            persistence::compact_journal_persistence(&mut inner, true)?;
        }
        persistence::update_journal_disk_telemetry(&mut inner);

        Ok(())
    }
}
