//! Durability layer for Histree
//!
//! This crate handles everything that touches bytes and disk:
//!
//! - Atomic file I/O: write-tmp, fsync, rename, fsync-parent discipline
//! - Journal entry codec: the `PSJL` little-endian record format
//! - Journal state: in-memory deque + cursor with retention
//! - Journal log file: the `PSJF` append-only file, replay, compaction
//! - Snapshot codec: generation-tagged subtree images
//! - Metadata codec: `key:value` text for entries and root state
//! - Savefile codec: the `PJNL` export/import document
//!
//! All binary formats share one discipline: little-endian scalars,
//! length-prefixed blobs, 32-bit magic + version header, and strict
//! bounds-checking on every read. Decoder inputs are untrusted.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub(crate) mod codec;
pub mod fsio;
pub mod journal;
pub mod meta;
pub mod savefile;
pub mod snapshot;

pub use journal::entry::{
    deserialize_entry, serialize_entry, JournalEntry, OperationKind, SerializedPayload,
    JOURNAL_MAGIC, JOURNAL_VERSION,
};
pub use journal::file::{
    compact_journal, replay_journal, JournalFileWriter, JOURNAL_FILE_MAGIC, JOURNAL_FILE_VERSION,
};
pub use journal::state::{JournalState, JournalStats, RetentionPolicy};
pub use meta::{
    encode_entry_meta, encode_state_meta, parse_entry_meta, parse_state_meta, EntryMetadata,
    StateMetadata, ENTRY_META_VERSION, STATE_META_VERSION,
};
pub use savefile::{SavefileDocument, SavefileOptions, SAVEFILE_MAGIC, SAVEFILE_VERSION};
pub use snapshot::{
    decode_snapshot, encode_snapshot, load_snapshot_image, snapshot_file_stem, SnapshotEntry,
    SnapshotImage, SNAPSHOT_MAGIC, SNAPSHOT_VERSION,
};
