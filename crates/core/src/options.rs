//! History configuration
//!
//! [`HistoryOptions`] configures one history root. Defaults match the
//! engine's production behavior: 128 retained entries, 8 materialized
//! cache slots, restore-on-enable when persistence is on.

use std::time::Duration;

/// Per-root history configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryOptions {
    /// Maximum retained entries per stack; 0 means unlimited.
    pub max_entries: usize,
    /// Byte budget across undo + redo + live; 0 means unlimited.
    pub max_bytes_retained: usize,
    /// When true, retention runs only on an explicit `garbage_collect`
    /// command.
    pub manual_garbage_collect: bool,
    /// Allow this root to nest inside (or contain) another history root.
    pub allow_nested_undo: bool,
    /// Record per-path mutation journal entries instead of full snapshots.
    pub use_mutation_journal: bool,
    /// Persist history to disk.
    pub persist_history: bool,
    /// Filesystem directory holding persisted history. Empty selects the
    /// default root (environment override, then the system temp dir).
    pub persistence_root: String,
    /// Sanitized token scoping this instance's on-disk artifacts. Empty
    /// selects a random per-instance namespace.
    pub persistence_namespace: String,
    /// Entries kept materialized in RAM per stack. 0 is promoted to 8.
    pub ram_cache_entries: usize,
    /// Advisory on-disk byte budget, surfaced in limits telemetry.
    pub max_disk_bytes: usize,
    /// Advisory age floor for retention, surfaced in limits telemetry.
    pub keep_latest_for: Duration,
    /// Re-materialize the persisted live state into the store on enable.
    pub restore_from_persistence: bool,
    /// Paths under the root whose mutations bypass journaling. Resolved
    /// against the root, canonicalized, and deduplicated at enable time.
    pub execution_opt_out_prefixes: Vec<String>,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        HistoryOptions {
            max_entries: 128,
            max_bytes_retained: 0,
            manual_garbage_collect: false,
            allow_nested_undo: false,
            use_mutation_journal: false,
            persist_history: false,
            persistence_root: String::new(),
            persistence_namespace: String::new(),
            ram_cache_entries: 8,
            max_disk_bytes: 0,
            keep_latest_for: Duration::ZERO,
            restore_from_persistence: true,
            execution_opt_out_prefixes: Vec::new(),
        }
    }
}

impl HistoryOptions {
    /// Overlay per-root options on instance defaults.
    ///
    /// Zero/empty fields in `opts` fall back to the defaults;
    /// `persist_history` is sticky (either side can turn it on);
    /// `restore_from_persistence` requires both sides; opt-out prefixes
    /// accumulate.
    pub fn resolve(defaults: &HistoryOptions, opts: &HistoryOptions) -> HistoryOptions {
        let mut resolved = defaults.clone();

        if opts.max_entries != 0 {
            resolved.max_entries = opts.max_entries;
        }
        if opts.max_bytes_retained != 0 {
            resolved.max_bytes_retained = opts.max_bytes_retained;
        }
        resolved.manual_garbage_collect = opts.manual_garbage_collect;
        resolved.allow_nested_undo = opts.allow_nested_undo;
        resolved.use_mutation_journal = opts.use_mutation_journal;
        resolved.persist_history = defaults.persist_history || opts.persist_history;
        if !opts.persistence_root.is_empty() {
            resolved.persistence_root = opts.persistence_root.clone();
        }
        if !opts.persistence_namespace.is_empty() {
            resolved.persistence_namespace = opts.persistence_namespace.clone();
        }
        if opts.ram_cache_entries > 0 {
            resolved.ram_cache_entries = opts.ram_cache_entries;
        }
        if resolved.ram_cache_entries == 0 {
            resolved.ram_cache_entries = 8;
        }
        if opts.max_disk_bytes != 0 {
            resolved.max_disk_bytes = opts.max_disk_bytes;
        }
        if !opts.keep_latest_for.is_zero() {
            resolved.keep_latest_for = opts.keep_latest_for;
        }
        resolved.restore_from_persistence =
            defaults.restore_from_persistence && opts.restore_from_persistence;
        resolved
            .execution_opt_out_prefixes
            .extend(opts.execution_opt_out_prefixes.iter().cloned());

        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = HistoryOptions::default();
        assert_eq!(opts.max_entries, 128);
        assert_eq!(opts.ram_cache_entries, 8);
        assert!(opts.restore_from_persistence);
        assert!(!opts.persist_history);
    }

    #[test]
    fn test_resolve_prefers_nonzero_overrides() {
        let defaults = HistoryOptions {
            max_entries: 64,
            ..HistoryOptions::default()
        };
        let opts = HistoryOptions {
            max_entries: 2,
            max_bytes_retained: 1024,
            ..HistoryOptions::default()
        };
        let resolved = HistoryOptions::resolve(&defaults, &opts);
        assert_eq!(resolved.max_entries, 2);
        assert_eq!(resolved.max_bytes_retained, 1024);
    }

    #[test]
    fn test_resolve_zero_falls_back() {
        let defaults = HistoryOptions {
            max_entries: 64,
            ..HistoryOptions::default()
        };
        let opts = HistoryOptions {
            max_entries: 0,
            ..HistoryOptions::default()
        };
        assert_eq!(HistoryOptions::resolve(&defaults, &opts).max_entries, 64);
    }

    #[test]
    fn test_persist_is_sticky_and_restore_needs_both() {
        let defaults = HistoryOptions {
            persist_history: true,
            restore_from_persistence: true,
            ..HistoryOptions::default()
        };
        let opts = HistoryOptions {
            persist_history: false,
            restore_from_persistence: false,
            ..HistoryOptions::default()
        };
        let resolved = HistoryOptions::resolve(&defaults, &opts);
        assert!(resolved.persist_history);
        assert!(!resolved.restore_from_persistence);
    }

    #[test]
    fn test_ram_cache_zero_promoted() {
        let defaults = HistoryOptions {
            ram_cache_entries: 0,
            ..HistoryOptions::default()
        };
        let opts = HistoryOptions {
            ram_cache_entries: 0,
            ..HistoryOptions::default()
        };
        assert_eq!(HistoryOptions::resolve(&defaults, &opts).ram_cache_entries, 8);
    }
}
