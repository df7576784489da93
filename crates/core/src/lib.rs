//! Core types for Histree
//!
//! This crate defines the vocabulary shared by the durability layer and the
//! engine:
//!
//! - Error model: one unified [`Error`] enum and the [`Result`] alias
//! - Canonical paths: [`StorePath`] with prefix tests and component access
//! - Payload model: [`NodeData`], an ordered queue of payload slots
//! - History configuration: [`HistoryOptions`]
//! - Telemetry value types: [`HistoryStats`] and friends
//! - Clock helpers: wall-clock milliseconds and monotonic nanoseconds

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod error;
pub mod node;
pub mod options;
pub mod path;
pub mod stats;

pub use error::{Error, Result};
pub use node::{NodeData, PayloadSlot};
pub use options::HistoryOptions;
pub use path::StorePath;
pub use stats::{
    HistoryBytes, HistoryCompactionMetrics, HistoryCounts, HistoryLastOperation,
    HistoryLimitMetrics, HistoryStats, HistoryTrimMetrics, HistoryUnsupportedRecord,
    HistoryUnsupportedStats, TrimStats,
};
