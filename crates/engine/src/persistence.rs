//! On-disk persistence policy.
//!
//! Directory layout, per root:
//!
//! ```text
//! <persistence_root>/<namespace>/<encoded_root>/
//!     state.meta                       (snapshot roots)
//!     entries/<generation>.snapshot
//!     entries/<generation>.meta
//!     journal.log                      (journal roots)
//! ```
//!
//! `encoded_root` is the lowercase hex encoding of the canonical root
//! path. The namespace is configured, or a random 128-bit hex token per
//! engine instance. Both tokens must match `[A-Za-z0-9_-]+` and may not
//! be `.` or `..`; directory separators never reach the filesystem layer.

use std::path::{Path, PathBuf};

use tracing::warn;

use histree_core::{clock, Error, HistoryLastOperation, HistoryOptions, Result};
use histree_durability::{
    encode_entry_meta, encode_snapshot, encode_state_meta, fsio, load_snapshot_image,
    parse_entry_meta, parse_state_meta, snapshot_file_stem, EntryMetadata, StateMetadata,
};

use crate::cow::{self, CowPrototype, Snapshot};
use crate::roots::{
    JournalPersistence, JournalRootInner, SnapshotEntryState, SnapshotPersistence,
    SnapshotRootInner,
};

fn is_valid_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Validate a persistence path token (namespace or encoded root).
pub(crate) fn validate_persistence_token(
    token: &str,
    label: &str,
    allow_empty: bool,
) -> Result<()> {
    let valid = if token.is_empty() {
        allow_empty
    } else {
        token != "." && token != ".." && token.chars().all(is_valid_token_char)
    };
    if !valid {
        return Err(Error::InvalidPermissions(format!(
            "invalid history persistence {label} '{token}'; allowed characters are \
             [A-Za-z0-9_-] and tokens may not be '.' or '..'"
        )));
    }
    Ok(())
}

/// Lowercase hex encoding of the canonical root path.
pub(crate) fn encode_root_for_persistence(root_path: &str) -> String {
    let mut encoded = String::with_capacity(root_path.len() * 2);
    for byte in root_path.bytes() {
        encoded.push_str(&format!("{byte:02x}"));
    }
    encoded
}

fn default_persistence_root() -> PathBuf {
    if let Ok(env_root) = std::env::var("PATHSPACE_HISTORY_ROOT") {
        if !env_root.is_empty() {
            return PathBuf::from(env_root);
        }
    }
    if let Ok(tmp) = std::env::var("TMPDIR") {
        if !tmp.is_empty() {
            return PathBuf::from(tmp).join("pathspace_history");
        }
    }
    std::env::temp_dir().join("pathspace_history")
}

/// Resolve the persistence root directory for a root's options.
pub(crate) fn persistence_root_path(
    options: &HistoryOptions,
    defaults: &HistoryOptions,
) -> PathBuf {
    if !options.persistence_root.is_empty() {
        return PathBuf::from(&options.persistence_root);
    }
    if !defaults.persistence_root.is_empty() {
        return PathBuf::from(&defaults.persistence_root);
    }
    default_persistence_root()
}

fn resolve_root_dir(
    options: &HistoryOptions,
    defaults: &HistoryOptions,
    root_path: &str,
    space_uuid: &str,
    encoded_root: &mut String,
) -> Result<PathBuf> {
    if encoded_root.is_empty() {
        *encoded_root = encode_root_for_persistence(root_path);
    }
    validate_persistence_token(encoded_root, "encoded_root", false)?;

    let namespace = if options.persistence_namespace.is_empty() {
        space_uuid
    } else {
        options.persistence_namespace.as_str()
    };
    validate_persistence_token(namespace, "namespace", false)?;

    Ok(persistence_root_path(options, defaults)
        .join(namespace)
        .join(encoded_root.as_str()))
}

pub(crate) fn entry_snapshot_path(persistence: &SnapshotPersistence, generation: u64) -> PathBuf {
    persistence
        .entries_dir
        .join(format!("{}.snapshot", snapshot_file_stem(generation)))
}

pub(crate) fn entry_meta_path(persistence: &SnapshotPersistence, generation: u64) -> PathBuf {
    persistence
        .entries_dir
        .join(format!("{}.meta", snapshot_file_stem(generation)))
}

pub(crate) fn state_meta_path(persistence: &SnapshotPersistence) -> PathBuf {
    persistence.root_dir.join("state.meta")
}

/// Delete the snapshot and metadata files of one generation.
pub(crate) fn remove_entry_files(persistence: &SnapshotPersistence, generation: u64) {
    if !persistence.enabled {
        return;
    }
    fsio::remove_path_if_exists(&entry_snapshot_path(persistence, generation));
    fsio::remove_path_if_exists(&entry_meta_path(persistence, generation));
}

/// Prepare the directory tree for a persisted snapshot root and detect
/// existing state.
pub(crate) fn ensure_snapshot_setup(
    inner: &mut SnapshotRootInner,
    root_path: &str,
    space_uuid: &str,
    defaults: &HistoryOptions,
) -> Result<()> {
    if !inner.persistence.enabled {
        return Ok(());
    }

    let root_dir = resolve_root_dir(
        &inner.options,
        defaults,
        root_path,
        space_uuid,
        &mut inner.persistence.encoded_root,
    )?;
    inner.persistence.root_dir = root_dir.clone();
    inner.persistence.entries_dir = root_dir.join("entries");

    std::fs::create_dir_all(&inner.persistence.entries_dir)
        .map_err(|e| Error::io("failed to create persistence directories", &e))?;

    inner.persistence.state_dirty = false;
    inner.persistence.has_persistent_state = state_meta_path(&inner.persistence).exists();
    Ok(())
}

/// Load the persisted stacks and live snapshot of a snapshot root.
///
/// Stack entries come back `persisted=true, cached=false`; the live
/// snapshot is loaded eagerly and the prototype's generation counter is
/// seeded past every generation seen on disk.
pub(crate) fn load_persistent_state(inner: &mut SnapshotRootInner) -> Result<()> {
    if !inner.persistence.enabled {
        return Ok(());
    }

    let state_path = state_meta_path(&inner.persistence);
    let meta_text = match fsio::read_text_file(&state_path) {
        Ok(text) => text,
        Err(err) if err.is_not_found() => {
            inner.persistence.has_persistent_state = false;
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let state_meta = parse_state_meta(&meta_text)?;

    inner.options.manual_garbage_collect = state_meta.manual_gc;
    if state_meta.ram_cache_entries > 0 {
        inner.options.ram_cache_entries = state_meta.ram_cache_entries;
    }
    if inner.options.ram_cache_entries == 0 {
        inner.options.ram_cache_entries = 8;
    }

    inner.prototype = CowPrototype::new();
    inner.undo_stack.clear();
    inner.redo_stack.clear();
    inner.telemetry = Default::default();

    let mut disk_bytes: u64 = 0;
    let mut disk_entries = 0usize;

    let live_snapshot_path = entry_snapshot_path(&inner.persistence, state_meta.live_generation);
    let live_image = load_snapshot_image(&live_snapshot_path)?;
    inner.live_snapshot = inner.prototype.from_image(&live_image);
    inner.live_bytes = inner.prototype.analyze(&inner.live_snapshot).payload_bytes;

    let live_meta_path = entry_meta_path(&inner.persistence, state_meta.live_generation);
    if let Ok(text) = fsio::read_text_file(&live_meta_path) {
        if let Ok(entry_meta) = parse_entry_meta(&text) {
            inner.telemetry.last_operation = Some(HistoryLastOperation {
                op_type: "restore".into(),
                timestamp_ms: entry_meta.timestamp_ms,
                success: true,
                bytes_after: inner.live_bytes,
                message: "persistence_restore".into(),
                ..HistoryLastOperation::default()
            });
        }
    }
    disk_bytes += fsio::file_size_or_zero(&live_snapshot_path);
    disk_bytes += fsio::file_size_or_zero(&live_meta_path);
    disk_entries += 1;

    fn load_entry_list(
        persistence: &SnapshotPersistence,
        generations: &[u64],
        stack: &mut Vec<SnapshotEntryState>,
        byte_counter: &mut usize,
        disk_bytes: &mut u64,
        disk_entries: &mut usize,
    ) -> Result<()> {
        for &generation in generations {
            let meta_path = entry_meta_path(persistence, generation);
            let entry_meta = parse_entry_meta(&fsio::read_text_file(&meta_path)?)?;

            *byte_counter += entry_meta.bytes;
            stack.push(SnapshotEntryState {
                snapshot: Snapshot {
                    root: None,
                    generation,
                },
                bytes: entry_meta.bytes,
                timestamp_ms: entry_meta.timestamp_ms,
                persisted: true,
                cached: false,
            });

            *disk_bytes += fsio::file_size_or_zero(&entry_snapshot_path(persistence, generation));
            *disk_bytes += fsio::file_size_or_zero(&meta_path);
            *disk_entries += 1;
        }
        Ok(())
    }

    let mut undo_bytes = 0;
    let mut redo_bytes = 0;
    let mut undo_stack = Vec::new();
    let mut redo_stack = Vec::new();
    load_entry_list(
        &inner.persistence,
        &state_meta.undo_generations,
        &mut undo_stack,
        &mut undo_bytes,
        &mut disk_bytes,
        &mut disk_entries,
    )?;
    load_entry_list(
        &inner.persistence,
        &state_meta.redo_generations,
        &mut redo_stack,
        &mut redo_bytes,
        &mut disk_bytes,
        &mut disk_entries,
    )?;
    inner.undo_stack = undo_stack;
    inner.redo_stack = redo_stack;
    inner.telemetry.undo_bytes = undo_bytes;
    inner.telemetry.redo_bytes = redo_bytes;

    let max_generation = state_meta
        .undo_generations
        .iter()
        .chain(state_meta.redo_generations.iter())
        .copied()
        .chain(std::iter::once(state_meta.live_generation))
        .max()
        .unwrap_or(0);
    inner.prototype.set_next_generation(max_generation + 1);

    inner.telemetry.disk_bytes = disk_bytes.min(usize::MAX as u64) as usize;
    inner.telemetry.disk_entries = disk_entries;
    inner.persistence.has_persistent_state = true;
    inner.persistence.state_dirty = false;

    Ok(())
}

fn persist_snapshot_files(
    persistence: &SnapshotPersistence,
    snapshot: &Snapshot,
    timestamp_ms: u64,
    bytes_estimate: usize,
    fsync: bool,
) -> Result<()> {
    let image = cow::to_image(snapshot);
    let encoded = encode_snapshot(&image);
    fsio::write_file_atomic(
        &entry_snapshot_path(persistence, snapshot.generation),
        &encoded,
        fsync,
    )?;

    let meta = EntryMetadata {
        generation: snapshot.generation,
        bytes: bytes_estimate,
        timestamp_ms,
    };
    fsio::write_file_atomic(
        &entry_meta_path(persistence, snapshot.generation),
        encode_entry_meta(&meta).as_bytes(),
        fsync,
    )
}

/// Write every unpersisted stack entry, then (when dirty or forced) the
/// live snapshot and the state metadata.
pub(crate) fn persist_stacks(inner: &mut SnapshotRootInner, force_fsync: bool) -> Result<()> {
    if !inner.persistence.enabled {
        return Ok(());
    }

    let flush_now = force_fsync || !inner.options.manual_garbage_collect;
    std::fs::create_dir_all(&inner.persistence.entries_dir)
        .map_err(|e| Error::io("failed to create persistence directories", &e))?;

    for stack in [&mut inner.undo_stack, &mut inner.redo_stack] {
        for entry in stack.iter_mut() {
            if entry.persisted {
                continue;
            }
            if !entry.cached {
                return Err(Error::Unknown(
                    "attempted to persist history entry without cache".into(),
                ));
            }
            persist_snapshot_files(
                &inner.persistence,
                &entry.snapshot,
                entry.timestamp_ms,
                entry.bytes,
                flush_now,
            )?;
            entry.persisted = true;
        }
    }

    if inner.persistence.state_dirty || force_fsync {
        persist_snapshot_files(
            &inner.persistence,
            &inner.live_snapshot,
            clock::now_millis(),
            inner.live_bytes,
            flush_now,
        )?;

        let state_meta = StateMetadata {
            live_generation: inner.live_snapshot.generation,
            undo_generations: inner
                .undo_stack
                .iter()
                .map(|e| e.snapshot.generation)
                .collect(),
            redo_generations: inner
                .redo_stack
                .iter()
                .map(|e| e.snapshot.generation)
                .collect(),
            manual_gc: inner.options.manual_garbage_collect,
            ram_cache_entries: inner.options.ram_cache_entries,
        };
        fsio::write_file_atomic(
            &state_meta_path(&inner.persistence),
            encode_state_meta(&state_meta).as_bytes(),
            flush_now,
        )?;
        inner.persistence.state_dirty = false;
    }

    update_disk_telemetry(inner);
    inner.telemetry.persistence_dirty = !flush_now;
    Ok(())
}

/// Re-materialize one stack entry from its on-disk snapshot.
pub(crate) fn load_entry_snapshot(
    inner: &mut SnapshotRootInner,
    index: usize,
    is_undo: bool,
) -> Result<()> {
    let persistence_path = {
        let stack = if is_undo {
            &inner.undo_stack
        } else {
            &inner.redo_stack
        };
        let entry = stack
            .get(index)
            .ok_or_else(|| Error::Unknown("history entry index out of range".into()))?;
        if entry.cached {
            return Ok(());
        }
        entry_snapshot_path(&inner.persistence, entry.snapshot.generation)
    };

    let image = load_snapshot_image(&persistence_path)?;
    let mut loader = CowPrototype::new();
    let snapshot = loader.from_image(&image);

    let stack = if is_undo {
        &mut inner.undo_stack
    } else {
        &mut inner.redo_stack
    };
    if let Some(entry) = stack.get_mut(index) {
        entry.snapshot = snapshot;
        entry.cached = true;
    }
    Ok(())
}

/// Keep the most-recent `ram_cache_entries` entries of each stack
/// materialized; drop older trees that can be reloaded from disk.
pub(crate) fn apply_ram_cache_policy(inner: &mut SnapshotRootInner) {
    let limit = inner.options.ram_cache_entries;
    let persistence_enabled = inner.persistence.enabled;

    for is_undo in [true, false] {
        let len = if is_undo {
            inner.undo_stack.len()
        } else {
            inner.redo_stack.len()
        };
        let mut cached = 0usize;
        for offset in 0..len {
            let index = len - 1 - offset;
            if cached < limit {
                let needs_load = {
                    let stack = if is_undo {
                        &inner.undo_stack
                    } else {
                        &inner.redo_stack
                    };
                    let entry = &stack[index];
                    !entry.cached && entry.persisted
                };
                if needs_load {
                    if let Err(err) = load_entry_snapshot(inner, index, is_undo) {
                        warn!("failed to load history snapshot for caching: {err}");
                    }
                }
                cached += 1;
            } else {
                let stack = if is_undo {
                    &mut inner.undo_stack
                } else {
                    &mut inner.redo_stack
                };
                let entry = &mut stack[index];
                // Only drop trees that can come back from disk.
                if entry.cached && entry.persisted && persistence_enabled {
                    entry.snapshot.root = None;
                    entry.cached = false;
                }
            }
        }
    }

    update_cache_telemetry(inner);
}

/// Recount materialized entries per stack.
pub(crate) fn update_cache_telemetry(inner: &mut SnapshotRootInner) {
    inner.telemetry.cached_undo = inner.undo_stack.iter().filter(|e| e.cached).count();
    inner.telemetry.cached_redo = inner.redo_stack.iter().filter(|e| e.cached).count();
}

/// Recount on-disk bytes and entries for a snapshot root.
pub(crate) fn update_disk_telemetry(inner: &mut SnapshotRootInner) {
    if !inner.persistence.enabled {
        inner.telemetry.disk_bytes = 0;
        inner.telemetry.disk_entries = 0;
        return;
    }

    let mut total: u64 = 0;
    let mut count = 0usize;

    let mut add_entry_files = |generation: u64| {
        total += fsio::file_size_or_zero(&entry_snapshot_path(&inner.persistence, generation));
        total += fsio::file_size_or_zero(&entry_meta_path(&inner.persistence, generation));
        count += 1;
    };

    add_entry_files(inner.live_snapshot.generation);
    for entry in inner.undo_stack.iter().chain(inner.redo_stack.iter()) {
        if entry.persisted {
            add_entry_files(entry.snapshot.generation);
        }
    }
    total += fsio::file_size_or_zero(&state_meta_path(&inner.persistence));

    inner.telemetry.disk_bytes = total.min(usize::MAX as u64) as usize;
    inner.telemetry.disk_entries = count;
}

/// Prepare the directory tree and journal path for a persisted journal
/// root.
pub(crate) fn ensure_journal_setup(
    inner: &mut JournalRootInner,
    root_path: &str,
    space_uuid: &str,
    defaults: &HistoryOptions,
) -> Result<()> {
    if !inner.persistence.enabled {
        return Ok(());
    }

    let root_dir = resolve_root_dir(
        &inner.options,
        defaults,
        root_path,
        space_uuid,
        &mut inner.persistence.encoded_root,
    )?;
    inner.persistence.root_dir = root_dir.clone();
    inner.persistence.journal_path = root_dir.join("journal.log");

    std::fs::create_dir_all(&root_dir)
        .map_err(|e| Error::io("failed to create journal persistence directories", &e))?;

    inner.persistence.persistence_dirty = false;
    inner.telemetry.persistence_dirty = false;
    Ok(())
}

/// Rewrite the journal file to the currently retained entries.
pub(crate) fn compact_journal_persistence(inner: &mut JournalRootInner, fsync: bool) -> Result<()> {
    if !inner.persistence.enabled {
        return Ok(());
    }

    if let Some(mut writer) = inner.persistence.writer.take() {
        writer.flush()?;
    }

    let entries: Vec<_> = inner.journal.iter().cloned().collect();
    histree_durability::compact_journal(&inner.persistence.journal_path, &entries, fsync)?;

    inner.telemetry.compaction_runs += 1;
    inner.telemetry.compaction_entries += entries.len();
    inner.telemetry.compaction_bytes +=
        fsio::file_size_or_zero(&inner.persistence.journal_path) as usize;
    inner.telemetry.last_compaction_timestamp_ms = Some(clock::now_millis());

    inner.persistence.persistence_dirty = false;
    inner.telemetry.persistence_dirty = false;
    update_journal_disk_telemetry(inner);
    Ok(())
}

/// Recount on-disk bytes and entries for a journal root.
pub(crate) fn update_journal_disk_telemetry(inner: &mut JournalRootInner) {
    inner.telemetry.disk_entries = inner.journal.len();
    if !inner.persistence.enabled {
        inner.telemetry.disk_bytes = 0;
        return;
    }
    inner.telemetry.disk_bytes =
        fsio::file_size_or_zero(&inner.persistence.journal_path) as usize;
}

/// The journal file path of a persisted journal root.
pub(crate) fn journal_path(persistence: &JournalPersistence) -> &Path {
    &persistence.journal_path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_validation() {
        assert!(validate_persistence_token("namespace", "namespace", false).is_ok());
        assert!(validate_persistence_token("valid_namespace-1", "namespace", false).is_ok());
        assert!(validate_persistence_token("", "namespace", true).is_ok());
        assert!(validate_persistence_token("", "namespace", false).is_err());
        assert!(validate_persistence_token(".", "namespace", false).is_err());
        assert!(validate_persistence_token("..", "namespace", false).is_err());
        assert!(validate_persistence_token("invalid/namespace", "namespace", false).is_err());
        assert!(validate_persistence_token("invalid namespace", "namespace", false).is_err());
        assert!(validate_persistence_token("\\", "namespace", false).is_err());
    }

    #[test]
    fn test_encode_root_is_lowercase_hex() {
        assert_eq!(encode_root_for_persistence("/doc"), "2f646f63");
        assert!(validate_persistence_token(
            &encode_root_for_persistence("/any/path-at_all"),
            "encoded_root",
            false
        )
        .is_ok());
    }

    #[test]
    fn test_persistence_root_resolution_order() {
        let defaults = HistoryOptions {
            persistence_root: "/defaults/root".into(),
            ..HistoryOptions::default()
        };
        let opts = HistoryOptions {
            persistence_root: "/explicit/root".into(),
            ..HistoryOptions::default()
        };
        assert_eq!(
            persistence_root_path(&opts, &defaults),
            PathBuf::from("/explicit/root")
        );
        assert_eq!(
            persistence_root_path(&HistoryOptions::default(), &defaults),
            PathBuf::from("/defaults/root")
        );
    }
}
