//! The `UndoableSpace` facade.
//!
//! Wraps the inner store and intercepts everything that matters to
//! history: mutations under a registered root run inside an implicit
//! transaction and get journaled; reads under `<root>/_history/...` are
//! answered from telemetry; writes to the command paths drive undo/redo,
//! garbage collection, the manual-GC flag, and the entry tag.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use histree_core::{
    path::relative_components, Error, HistoryOptions, HistoryStats, NodeData, PayloadSlot, Result,
    StorePath, TrimStats,
};
use histree_durability::{JournalState, OperationKind, RetentionPolicy};

use crate::cow::CowPrototype;
use crate::journal_engine::{read_journal_entry_value, refresh_journal_telemetry};
use crate::persistence;
use crate::roots::{
    JournalPersistence, JournalRoot, JournalRootInner, OpScope, SnapshotPersistence, SnapshotRoot,
    SnapshotRootInner,
};
use crate::snapshot_engine::{apply_retention, compute_total_bytes};
use crate::store::PathStore;
use crate::telemetry::{
    extract, read_stats_value, COMMAND_GARBAGE_COLLECT, COMMAND_REDO, COMMAND_SET_MANUAL_GC,
    COMMAND_SET_TAG, COMMAND_UNDO, HISTORY_NAMESPACE,
};
use crate::transactions::{HistoryTransaction, TxTarget};

/// A hierarchical store with undoable history roots.
pub struct UndoableSpace {
    pub(crate) defaults: HistoryOptions,
    pub(crate) store: PathStore,
    pub(crate) snapshot_roots: Mutex<HashMap<String, Arc<SnapshotRoot>>>,
    pub(crate) journal_roots: Mutex<HashMap<String, Arc<JournalRoot>>>,
    pub(crate) space_uuid: String,
}

enum RootMatch {
    Snapshot(Arc<SnapshotRoot>, String),
    Journal(Arc<JournalRoot>, String),
}

fn in_history_namespace(relative: &str) -> bool {
    relative == HISTORY_NAMESPACE
        || relative
            .strip_prefix(HISTORY_NAMESPACE)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn is_under_prefix(prefix: &str, path: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
        || prefix == "/"
}

fn decode_slot<T: DeserializeOwned>(slot: PayloadSlot) -> Result<T> {
    match slot {
        PayloadSlot::Bytes(bytes) => bincode::deserialize(&bytes).map_err(|e| {
            Error::InvalidType(format!("stored payload does not decode as requested type: {e}"))
        }),
        PayloadSlot::Task => Err(Error::InvalidType(
            "stored payload is an executable task".into(),
        )),
        PayloadSlot::Opaque => Err(Error::InvalidType(
            "stored payload has no serialized form".into(),
        )),
    }
}

fn interpret_steps<T: Any>(value: &T) -> usize {
    let any = value as &dyn Any;
    if let Some(v) = any.downcast_ref::<u64>() {
        return (*v).max(1).min(usize::MAX as u64) as usize;
    }
    if let Some(v) = any.downcast_ref::<usize>() {
        return (*v).max(1);
    }
    if let Some(v) = any.downcast_ref::<u32>() {
        return (*v).max(1) as usize;
    }
    if let Some(v) = any.downcast_ref::<i64>() {
        return if *v <= 0 { 1 } else { *v as usize };
    }
    if let Some(v) = any.downcast_ref::<i32>() {
        return if *v <= 0 { 1 } else { *v as usize };
    }
    1
}

fn interpret_bool<T: Any>(value: &T) -> bool {
    (value as &dyn Any)
        .downcast_ref::<bool>()
        .copied()
        .unwrap_or(false)
}

fn interpret_text<T: Any>(value: &T) -> Option<String> {
    let any = value as &dyn Any;
    if let Some(v) = any.downcast_ref::<String>() {
        return Some(v.clone());
    }
    if let Some(v) = any.downcast_ref::<&str>() {
        return Some((*v).to_string());
    }
    None
}

impl UndoableSpace {
    /// A fresh space with instance-wide default options.
    pub fn new(defaults: HistoryOptions) -> Self {
        UndoableSpace {
            defaults,
            store: PathStore::new(),
            snapshot_roots: Mutex::new(HashMap::new()),
            journal_roots: Mutex::new(HashMap::new()),
            space_uuid: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    pub(crate) fn find_snapshot_root(&self, path: &StorePath) -> Option<Arc<SnapshotRoot>> {
        self.snapshot_roots.lock().get(path.as_str()).cloned()
    }

    pub(crate) fn find_journal_root(&self, path: &StorePath) -> Option<Arc<JournalRoot>> {
        self.journal_roots.lock().get(path.as_str()).cloned()
    }

    /// Longest-prefix match of `path` against every registered root.
    fn match_root(&self, path: &StorePath) -> Option<RootMatch> {
        let mut best: Option<(usize, RootMatch)> = None;

        {
            let roots = self.snapshot_roots.lock();
            for root in roots.values() {
                if let Some(relative) = path.relative_to(&root.path) {
                    let len = root.path.as_str().len();
                    if best.as_ref().map_or(true, |(best_len, _)| len > *best_len) {
                        best = Some((len, RootMatch::Snapshot(root.clone(), relative)));
                    }
                }
            }
        }
        {
            let roots = self.journal_roots.lock();
            for root in roots.values() {
                if let Some(relative) = path.relative_to(&root.path) {
                    let len = root.path.as_str().len();
                    if best.as_ref().map_or(true, |(best_len, _)| len > *best_len) {
                        best = Some((len, RootMatch::Journal(root.clone(), relative)));
                    }
                }
            }
        }

        best.map(|(_, matched)| matched)
    }

    /// Register a history root at `root`.
    pub fn enable_history(&self, root: &str, opts: HistoryOptions) -> Result<()> {
        let path = StorePath::parse(root)?;
        let components = path.components();
        let resolved = HistoryOptions::resolve(&self.defaults, &opts);

        let mut opt_out_prefixes = Vec::new();
        for prefix in &resolved.execution_opt_out_prefixes {
            if prefix.is_empty() {
                return Err(Error::InvalidPath(
                    "execution opt-out prefix may not be empty".into(),
                ));
            }
            let canonical = path.resolve(prefix)?;
            if !path.is_prefix_of(&canonical) {
                return Err(Error::InvalidPermissions(
                    "execution opt-out prefix must be within the history root".into(),
                ));
            }
            opt_out_prefixes.push(canonical.as_str().to_string());
        }
        opt_out_prefixes.sort();
        opt_out_prefixes.dedup();

        {
            let snapshot_roots = self.snapshot_roots.lock();
            let journal_roots = self.journal_roots.lock();
            if snapshot_roots.contains_key(path.as_str())
                || journal_roots.contains_key(path.as_str())
            {
                return Err(Error::Unknown("history already enabled for path".into()));
            }
            if !(self.defaults.allow_nested_undo && opts.allow_nested_undo) {
                for existing in snapshot_roots.keys().chain(journal_roots.keys()) {
                    let existing_path = StorePath::parse(existing)?;
                    if existing_path.is_prefix_of(&path) || path.is_prefix_of(&existing_path) {
                        return Err(Error::InvalidPermissions(
                            "history roots may not be nested without allow_nested_undo".into(),
                        ));
                    }
                }
            }
        }

        if resolved.use_mutation_journal {
            self.enable_journal_root(path, components, opt_out_prefixes, resolved)
        } else {
            self.enable_snapshot_root(path, components, opt_out_prefixes, resolved)
        }
    }

    fn enable_snapshot_root(
        &self,
        path: StorePath,
        components: Vec<String>,
        opt_out_prefixes: Vec<String>,
        resolved: HistoryOptions,
    ) -> Result<()> {
        let persist = resolved.persist_history;
        let mut inner = SnapshotRootInner {
            options: resolved,
            prototype: CowPrototype::new(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            live_snapshot: Default::default(),
            live_bytes: 0,
            telemetry: Default::default(),
            persistence: SnapshotPersistence {
                enabled: persist,
                ..SnapshotPersistence::default()
            },
            active_transaction: None,
        };

        let mut restored = false;
        if persist {
            persistence::ensure_snapshot_setup(
                &mut inner,
                path.as_str(),
                &self.space_uuid,
                &self.defaults,
            )?;
            persistence::load_persistent_state(&mut inner)?;
            restored = inner.persistence.has_persistent_state;
        }

        let root_arc = Arc::new(SnapshotRoot {
            path,
            components,
            opt_out_prefixes,
            inner: Mutex::new(inner),
        });

        {
            let mut guard = root_arc.inner.lock();
            if restored {
                if guard.options.restore_from_persistence {
                    let live = guard.live_snapshot.clone();
                    self.apply_snapshot_to_store(&root_arc, &live)?;
                }
                persistence::apply_ram_cache_policy(&mut guard);
            } else {
                let snapshot = self.capture_snapshot_locked(&root_arc, &mut guard)?;
                guard.live_bytes = guard.prototype.analyze(&snapshot).payload_bytes;
                guard.live_snapshot = snapshot;
                guard.persistence.state_dirty = guard.persistence.enabled;
                persistence::update_cache_telemetry(&mut guard);
                if guard.persistence.enabled {
                    persistence::persist_stacks(&mut guard, true)?;
                } else {
                    persistence::update_disk_telemetry(&mut guard);
                }
            }
        }

        self.snapshot_roots
            .lock()
            .insert(root_arc.path.as_str().to_string(), root_arc.clone());
        Ok(())
    }

    fn enable_journal_root(
        &self,
        path: StorePath,
        components: Vec<String>,
        opt_out_prefixes: Vec<String>,
        resolved: HistoryOptions,
    ) -> Result<()> {
        let persist = resolved.persist_history;
        let policy = RetentionPolicy {
            max_entries: resolved.max_entries,
            max_bytes: resolved.max_bytes_retained,
        };
        let mut inner = JournalRootInner {
            options: resolved,
            journal: JournalState::with_policy(policy),
            telemetry: Default::default(),
            live_bytes: 0,
            next_sequence: 0,
            current_tag: String::new(),
            persistence: JournalPersistence {
                enabled: persist,
                ..JournalPersistence::default()
            },
            active_transaction: None,
        };

        if persist {
            persistence::ensure_journal_setup(
                &mut inner,
                path.as_str(),
                &self.space_uuid,
                &self.defaults,
            )?;
        }

        let root_arc = Arc::new(JournalRoot {
            path,
            components,
            opt_out_prefixes,
            inner: Mutex::new(inner),
        });

        {
            let mut guard = root_arc.inner.lock();
            if guard.persistence.enabled {
                self.load_journal_persistence(&root_arc, &mut guard)?;
            }
            guard.live_bytes = self.store.subtree_payload_bytes(&root_arc.components);
            refresh_journal_telemetry(&mut guard);
            persistence::update_journal_disk_telemetry(&mut guard);
        }

        self.journal_roots
            .lock()
            .insert(root_arc.path.as_str().to_string(), root_arc.clone());
        Ok(())
    }

    /// Unregister a history root, dropping its state and removing its
    /// persistence directory.
    pub fn disable_history(&self, root: &str) -> Result<()> {
        let path = StorePath::parse(root)?;

        if let Some(state) = self.snapshot_roots.lock().remove(path.as_str()) {
            let inner = state.inner.lock();
            if inner.persistence.enabled {
                let _ = std::fs::remove_dir_all(&inner.persistence.root_dir);
            }
            return Ok(());
        }
        if let Some(state) = self.journal_roots.lock().remove(path.as_str()) {
            let mut inner = state.inner.lock();
            inner.persistence.writer = None;
            if inner.persistence.enabled {
                let _ = std::fs::remove_dir_all(&inner.persistence.root_dir);
            }
            return Ok(());
        }
        Err(Error::NotFound("history root not enabled".into()))
    }

    /// Serialize `value` and append it at `path`.
    pub fn insert<T: Serialize + Any>(&self, path: &str, value: &T) -> Result<()> {
        let store_path = StorePath::parse(path)?;

        match self.match_root(&store_path) {
            Some(RootMatch::Snapshot(root, relative)) => {
                if in_history_namespace(&relative) {
                    return self.handle_snapshot_control(&root, &relative, value);
                }
                let slot = Self::value_slot(value)?;
                if self.is_opted_out(&root.opt_out_prefixes, &store_path) {
                    self.store.insert_slot(&store_path.components(), slot);
                    return Ok(());
                }
                self.snapshot_mutation(&root, || {
                    self.store.insert_slot(&store_path.components(), slot);
                    Ok(())
                })
            }
            Some(RootMatch::Journal(root, relative)) => {
                if in_history_namespace(&relative) {
                    return self.handle_journal_control(&root, &relative, value);
                }
                let slot = Self::value_slot(value)?;
                if self.is_opted_out(&root.opt_out_prefixes, &store_path) {
                    self.store.insert_slot(&store_path.components(), slot);
                    return Ok(());
                }
                let components = store_path.components();
                self.journal_mutation(&root, &store_path, OperationKind::Insert, move |space| {
                    space.store.insert_slot(&components, slot);
                    Ok(())
                })
            }
            None => {
                let slot = Self::value_slot(value)?;
                self.store.insert_slot(&store_path.components(), slot);
                Ok(())
            }
        }
    }

    /// Queue an executable task payload at `path` (a payload history
    /// cannot capture).
    pub fn insert_task(&self, path: &str) -> Result<()> {
        self.insert_raw_slot(path, PayloadSlot::Task)
    }

    /// Queue an opaque, non-serializable payload at `path`.
    pub fn insert_opaque(&self, path: &str) -> Result<()> {
        self.insert_raw_slot(path, PayloadSlot::Opaque)
    }

    /// Mark the node at `path` as holding a nested store.
    pub fn mount_nested(&self, path: &str) -> Result<()> {
        let store_path = StorePath::parse(path)?;
        match self.match_root(&store_path) {
            Some(RootMatch::Snapshot(root, relative)) if !in_history_namespace(&relative) => self
                .snapshot_mutation(&root, || {
                    self.store.mount_nested(&store_path.components());
                    Ok(())
                }),
            Some(RootMatch::Journal(root, relative)) if !in_history_namespace(&relative) => {
                let components = store_path.components();
                self.journal_mutation(&root, &store_path, OperationKind::Insert, move |space| {
                    space.store.mount_nested(&components);
                    Ok(())
                })
            }
            _ => {
                self.store.mount_nested(&store_path.components());
                Ok(())
            }
        }
    }

    fn insert_raw_slot(&self, path: &str, slot: PayloadSlot) -> Result<()> {
        let store_path = StorePath::parse(path)?;
        match self.match_root(&store_path) {
            Some(RootMatch::Snapshot(root, relative)) if !in_history_namespace(&relative) => {
                if self.is_opted_out(&root.opt_out_prefixes, &store_path) {
                    self.store.insert_slot(&store_path.components(), slot);
                    return Ok(());
                }
                self.snapshot_mutation(&root, || {
                    self.store.insert_slot(&store_path.components(), slot);
                    Ok(())
                })
            }
            Some(RootMatch::Journal(root, relative)) if !in_history_namespace(&relative) => {
                if self.is_opted_out(&root.opt_out_prefixes, &store_path) {
                    self.store.insert_slot(&store_path.components(), slot);
                    return Ok(());
                }
                let components = store_path.components();
                self.journal_mutation(&root, &store_path, OperationKind::Insert, move |space| {
                    space.store.insert_slot(&components, slot);
                    Ok(())
                })
            }
            _ => {
                self.store.insert_slot(&store_path.components(), slot);
                Ok(())
            }
        }
    }

    /// Read (peek) the front value at `path`. Paths under
    /// `<root>/_history/...` are answered from telemetry.
    pub fn read<T: DeserializeOwned + 'static>(&self, path: &str) -> Result<T> {
        let store_path = StorePath::parse(path)?;

        match self.match_root(&store_path) {
            Some(RootMatch::Snapshot(root, relative)) if in_history_namespace(&relative) => {
                let (stats, head) = {
                    let inner = root.inner.lock();
                    (
                        crate::snapshot_engine::gather_stats(&inner),
                        inner.live_snapshot.generation,
                    )
                };
                let value = read_stats_value(&stats, Some(head), &relative)?;
                extract(value, &relative)
            }
            Some(RootMatch::Journal(root, relative)) if in_history_namespace(&relative) => {
                let inner = root.inner.lock();
                if let Some(diag) = read_journal_entry_value(&inner.journal, &relative) {
                    let value = diag?;
                    return extract(value, &relative);
                }
                let stats = crate::journal_engine::gather_stats(&inner);
                let head = inner.next_sequence;
                drop(inner);
                let value = read_stats_value(&stats, Some(head), &relative)?;
                extract(value, &relative)
            }
            _ => decode_slot(self.store.read_front(&store_path.components())?),
        }
    }

    /// Take (pop) the front value at `path`. Under a history root the
    /// mutation is journaled like any other.
    pub fn take<T: DeserializeOwned + 'static>(&self, path: &str) -> Result<T> {
        let store_path = StorePath::parse(path)?;
        let components = store_path.components();

        match self.match_root(&store_path) {
            Some(RootMatch::Snapshot(root, relative)) => {
                if in_history_namespace(&relative) {
                    return Err(Error::NotSupported(
                        "history namespace is read-only".into(),
                    ));
                }
                if self.is_opted_out(&root.opt_out_prefixes, &store_path) {
                    let value = decode_slot::<T>(self.store.read_front(&components)?)?;
                    self.store.take_front(&components)?;
                    return Ok(value);
                }
                let mut taken: Option<T> = None;
                self.snapshot_mutation(&root, || {
                    let value = decode_slot::<T>(self.store.read_front(&components)?)?;
                    self.store.take_front(&components)?;
                    taken = Some(value);
                    Ok(())
                })?;
                taken.ok_or_else(|| Error::Unknown("take produced no value".into()))
            }
            Some(RootMatch::Journal(root, relative)) => {
                if in_history_namespace(&relative) {
                    return Err(Error::NotSupported(
                        "history namespace is read-only".into(),
                    ));
                }
                if self.is_opted_out(&root.opt_out_prefixes, &store_path) {
                    let value = decode_slot::<T>(self.store.read_front(&components)?)?;
                    self.store.take_front(&components)?;
                    return Ok(value);
                }
                let mut taken: Option<T> = None;
                self.journal_mutation(&root, &store_path, OperationKind::Take, |space| {
                    let value = decode_slot::<T>(space.store.read_front(&components)?)?;
                    space.store.take_front(&components)?;
                    taken = Some(value);
                    Ok(())
                })?;
                taken.ok_or_else(|| Error::Unknown("take produced no value".into()))
            }
            None => {
                let value = decode_slot::<T>(self.store.read_front(&components)?)?;
                self.store.take_front(&components)?;
                Ok(value)
            }
        }
    }

    /// Walk the root backward `steps` entries.
    pub fn undo(&self, root: &str, steps: usize) -> Result<()> {
        let path = StorePath::parse(root)?;
        if let Some(journal) = self.find_journal_root(&path) {
            return self.apply_journal_steps(&journal, steps, true);
        }
        if let Some(snapshot) = self.find_snapshot_root(&path) {
            return self.apply_history_steps(&snapshot, steps, true);
        }
        Err(Error::NotFound("history root not enabled".into()))
    }

    /// Walk the root forward `steps` entries.
    pub fn redo(&self, root: &str, steps: usize) -> Result<()> {
        let path = StorePath::parse(root)?;
        if let Some(journal) = self.find_journal_root(&path) {
            return self.apply_journal_steps(&journal, steps, false);
        }
        if let Some(snapshot) = self.find_snapshot_root(&path) {
            return self.apply_history_steps(&snapshot, steps, false);
        }
        Err(Error::NotFound("history root not enabled".into()))
    }

    /// Evict undo entries by stack index.
    pub fn trim_history(
        &self,
        root: &str,
        predicate: impl Fn(usize) -> bool,
    ) -> Result<TrimStats> {
        let path = StorePath::parse(root)?;
        if self.find_journal_root(&path).is_some() {
            return Err(Error::NotSupported(
                "predicate trim is not available for mutation-journal roots".into(),
            ));
        }
        let Some(state) = self.find_snapshot_root(&path) else {
            return Err(Error::NotFound("history root not enabled".into()));
        };
        self.trim_history_snapshot(&state, &predicate)
    }

    /// Telemetry snapshot for one root.
    pub fn history_stats(&self, root: &str) -> Result<HistoryStats> {
        let path = StorePath::parse(root)?;
        if let Some(journal) = self.find_journal_root(&path) {
            let inner = journal.inner.lock();
            return Ok(crate::journal_engine::gather_stats(&inner));
        }
        if let Some(snapshot) = self.find_snapshot_root(&path) {
            let inner = snapshot.inner.lock();
            return Ok(crate::snapshot_engine::gather_stats(&inner));
        }
        Err(Error::NotFound("history root not enabled".into()))
    }

    /// Open an explicit transaction on a root. The handle auto-commits on
    /// drop; `commit()` surfaces the result instead.
    pub fn begin_transaction(&self, root: &str) -> Result<HistoryTransaction<'_>> {
        let path = StorePath::parse(root)?;
        if let Some(journal) = self.find_journal_root(&path) {
            self.begin_journal_transaction(&journal, true)?;
            return Ok(HistoryTransaction::new(self, TxTarget::Journal(journal)));
        }
        if let Some(snapshot) = self.find_snapshot_root(&path) {
            self.begin_snapshot_transaction(&snapshot)?;
            return Ok(HistoryTransaction::new(self, TxTarget::Snapshot(snapshot)));
        }
        Err(Error::NotFound("history root not enabled".into()))
    }

    fn value_slot<T: Serialize>(value: &T) -> Result<PayloadSlot> {
        let bytes = bincode::serialize(value)
            .map_err(|e| Error::Unknown(format!("failed to serialize payload: {e}")))?;
        Ok(PayloadSlot::Bytes(bytes))
    }

    fn is_opted_out(&self, prefixes: &[String], path: &StorePath) -> bool {
        prefixes
            .iter()
            .any(|prefix| is_under_prefix(prefix, path.as_str()))
    }

    /// Run one mutation on a snapshot root inside an implicit
    /// transaction.
    fn snapshot_mutation(
        &self,
        root: &Arc<SnapshotRoot>,
        mutate: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        self.begin_snapshot_transaction(root)?;
        let result = mutate();
        if result.is_ok() {
            self.mark_snapshot_transaction_dirty(root);
        }
        let commit = self.commit_snapshot_transaction(root);
        result.and(commit)
    }

    /// Run one mutation on a journal root inside an implicit transaction,
    /// recording before/after payloads.
    fn journal_mutation(
        &self,
        root: &Arc<JournalRoot>,
        path: &StorePath,
        operation: OperationKind,
        mutate: impl FnOnce(&Self) -> Result<()>,
    ) -> Result<()> {
        let relative = relative_components(&root.components, path)?;
        self.begin_journal_transaction(root, false)?;

        let result = (|| -> Result<()> {
            let before = {
                let mut inner = root.inner.lock();
                self.capture_journal_node(root, &mut inner, &relative)?
            };
            mutate(self)?;
            let mut inner = root.inner.lock();
            let after = match self.capture_journal_node(root, &mut inner, &relative) {
                Ok(after) => after,
                Err(err) => return Err(err),
            };

            let before_bytes = before.as_ref().map(NodeData::payload_bytes).unwrap_or(0);
            let after_bytes = after.as_ref().map(NodeData::payload_bytes).unwrap_or(0);
            self.record_journal_mutation(
                &mut inner,
                operation,
                path,
                after.as_ref(),
                before.as_ref(),
            )?;
            if after_bytes >= before_bytes {
                inner.live_bytes += after_bytes - before_bytes;
            } else {
                inner.live_bytes = inner.live_bytes.saturating_sub(before_bytes - after_bytes);
            }
            Ok(())
        })();

        let commit = self.commit_journal_transaction(root);
        result.and(commit)
    }

    fn handle_snapshot_control<T: Any>(
        &self,
        root: &Arc<SnapshotRoot>,
        command: &str,
        value: &T,
    ) -> Result<()> {
        match command {
            COMMAND_UNDO => self.apply_history_steps(root, interpret_steps(value), true),
            COMMAND_REDO => self.apply_history_steps(root, interpret_steps(value), false),
            COMMAND_GARBAGE_COLLECT => {
                let mut inner = root.inner.lock();
                if inner.active_transaction.is_some() {
                    return Err(Error::InvalidPermissions(
                        "cannot garbage collect while transaction open".into(),
                    ));
                }
                let scope = OpScope::begin(
                    "garbage_collect",
                    "",
                    inner.undo_stack.len(),
                    inner.redo_stack.len(),
                    compute_total_bytes(&inner),
                );
                let stats = apply_retention(&mut inner);
                let message = if stats.entries_removed == 0 {
                    "no_trim".to_string()
                } else {
                    format!("trimmed={}", stats.entries_removed)
                };
                let (undo, redo, bytes) = (
                    inner.undo_stack.len(),
                    inner.redo_stack.len(),
                    compute_total_bytes(&inner),
                );
                scope.finish(&mut inner.telemetry, undo, redo, bytes, true, message);
                self.finalize_history_mutation(&mut inner, true)
            }
            COMMAND_SET_MANUAL_GC => {
                let manual = interpret_bool(value);
                let mut inner = root.inner.lock();
                inner.options.manual_garbage_collect = manual;
                inner.persistence.state_dirty = true;
                persistence::persist_stacks(&mut inner, !manual)
            }
            _ => Err(Error::Unknown(
                "unsupported history control command".into(),
            )),
        }
    }

    fn handle_journal_control<T: Any>(
        &self,
        root: &Arc<JournalRoot>,
        command: &str,
        value: &T,
    ) -> Result<()> {
        match command {
            COMMAND_UNDO => self.apply_journal_steps(root, interpret_steps(value), true),
            COMMAND_REDO => self.apply_journal_steps(root, interpret_steps(value), false),
            COMMAND_GARBAGE_COLLECT => {
                let mut inner = root.inner.lock();
                self.journal_garbage_collect(&mut inner)
            }
            COMMAND_SET_MANUAL_GC => {
                let manual = interpret_bool(value);
                let mut inner = root.inner.lock();
                let stats = inner.journal.stats();
                let scope = OpScope::begin(
                    "set_manual_gc",
                    &inner.current_tag,
                    stats.undo_count,
                    stats.redo_count,
                    crate::journal_engine::compute_total_bytes(&inner),
                );
                inner.options.manual_garbage_collect = manual;
                let mut policy = inner.journal.policy();
                policy.max_entries = inner.options.max_entries;
                policy.max_bytes = inner.options.max_bytes_retained;
                inner.journal.set_retention_policy(policy);
                inner.persistence.state_dirty = true;
                if inner.persistence.enabled {
                    inner.persistence.persistence_dirty = true;
                }
                let after = inner.journal.stats();
                let bytes = crate::journal_engine::compute_total_bytes(&inner);
                scope.finish(
                    &mut inner.telemetry,
                    after.undo_count,
                    after.redo_count,
                    bytes,
                    true,
                    if manual { "enabled" } else { "disabled" },
                );
                Ok(())
            }
            COMMAND_SET_TAG => {
                let Some(tag) = interpret_text(value) else {
                    return Err(Error::InvalidType(
                        "history tag command expects a string value".into(),
                    ));
                };
                let mut inner = root.inner.lock();
                let stats = inner.journal.stats();
                let scope = OpScope::begin(
                    "set_tag",
                    &tag,
                    stats.undo_count,
                    stats.redo_count,
                    crate::journal_engine::compute_total_bytes(&inner),
                );
                inner.current_tag = tag;
                let bytes = crate::journal_engine::compute_total_bytes(&inner);
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
            _ => Err(Error::Unknown(
                "unsupported history control command".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_namespace_match_is_exact() {
        assert!(in_history_namespace("_history"));
        assert!(in_history_namespace("_history/stats"));
        assert!(!in_history_namespace("_historyish"));
        assert!(!in_history_namespace("notes/_history"));
    }

    #[test]
    fn test_prefix_check_respects_boundaries() {
        assert!(is_under_prefix("/doc/scratch", "/doc/scratch"));
        assert!(is_under_prefix("/doc/scratch", "/doc/scratch/tmp"));
        assert!(!is_under_prefix("/doc/scratch", "/doc/scratchpad"));
    }

    #[test]
    fn test_interpret_steps() {
        assert_eq!(interpret_steps(&3u64), 3);
        assert_eq!(interpret_steps(&0u64), 1);
        assert_eq!(interpret_steps(&(-5i64)), 1);
        assert_eq!(interpret_steps(&2usize), 2);
        assert_eq!(interpret_steps(&"whatever"), 1);
    }

    #[test]
    fn test_interpret_text() {
        assert_eq!(interpret_text(&"tag"), Some("tag".to_string()));
        assert_eq!(interpret_text(&"tag".to_string()), Some("tag".to_string()));
        assert_eq!(interpret_text(&5u64), None);
    }
}
