//! # Histree
//!
//! An undoable, persistent history overlay for hierarchical path stores.
//!
//! Histree wraps an in-memory path-addressed store and records every
//! mutation below a registered *history root* as a reversible step. A root
//! can be walked backward (undo) and forward (redo), bounded by a retention
//! policy, exported to a savefile, and recovered from disk after a crash.
//!
//! # Quick Start
//!
//! ```no_run
//! use histree::{HistoryOptions, UndoableSpace};
//!
//! fn main() -> histree::Result<()> {
//!     let space = UndoableSpace::new(HistoryOptions::default());
//!
//!     space.enable_history("/doc", HistoryOptions::default())?;
//!     space.insert("/doc/title", &"draft one".to_string())?;
//!     space.insert("/doc/title", &"draft two".to_string())?;
//!
//!     space.undo("/doc", 1)?;
//!     space.redo("/doc", 1)?;
//!
//!     let stats = space.history_stats("/doc")?;
//!     assert_eq!(stats.counts.undo, 2);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The [`UndoableSpace`] struct is the main entry point. All operations go
//! through it. Internal crates (core, durability, engine) are layered the
//! same way the on-disk artifacts are: types, then file formats, then the
//! engine that coordinates them. Only the surface re-exported here is
//! stable.

pub use histree_core::{Error, HistoryOptions, Result};
pub use histree_engine::{
    HistoryStats, HistoryTransaction, TrimStats, UndoableSpace,
};
