//! History engine for Histree
//!
//! This crate coordinates everything above the file formats:
//!
//! - `store`: the inner hierarchical store the engine wraps
//! - `cow`: copy-on-write subtree snapshots with a generation counter
//! - `snapshot_engine`: full-subtree capture/apply undo (default mode)
//! - `journal_engine`: per-path before/after journaling (journal mode)
//! - `transactions`: owner-thread, depth-counted batching with rollback
//! - `persistence`: directory layout, RAM cache policy, restore
//! - `telemetry`: the `<root>/_history/...` virtual namespace
//! - `space`: the [`UndoableSpace`] facade tying it all together
//!
//! Only [`UndoableSpace`], [`HistoryTransaction`], and the re-exported
//! core types are public surface.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cow;
mod journal_engine;
mod persistence;
mod roots;
mod savefile_ops;
mod snapshot_engine;
mod space;
mod store;
mod telemetry;
mod transactions;

pub use histree_core::{
    Error, HistoryBytes, HistoryCompactionMetrics, HistoryCounts, HistoryLastOperation,
    HistoryLimitMetrics, HistoryOptions, HistoryStats, HistoryTrimMetrics,
    HistoryUnsupportedRecord, HistoryUnsupportedStats, Result, TrimStats,
};
pub use space::UndoableSpace;
pub use transactions::HistoryTransaction;
