//! Savefile format.
//!
//! A savefile is a portable export of one journal root: the root path, the
//! retention-relevant options, the sequence counter, and every retained
//! journal entry with the cursor position (`undo_count`).
//!
//! # File Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │ Magic (4)  Version (4)                         │
//! ├────────────────────────────────────────────────┤
//! │ Root path: len (4) + bytes                     │
//! ├────────────────────────────────────────────────┤
//! │ Options: maxEntries (8)  maxBytesRetained (8)  │
//! │          ramCacheEntries (8)  maxDiskBytes (8) │
//! │          keepLatestForMs (8)  manualGc (1)     │
//! ├────────────────────────────────────────────────┤
//! │ NextSequence (8)  UndoCount (4)                │
//! ├────────────────────────────────────────────────┤
//! │ Entry count (4)                                │
//! │ Entry: len (4) + journal entry record          │
//! │ ...                                            │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! The decoder rejects an undo count larger than the entry count, any
//! declared length past the end of the buffer, unknown magic or version,
//! and truncation at any scalar.

use histree_core::{Error, Result};

use crate::codec::{put_len_bytes, put_u32, put_u64, put_u8, ByteReader};
use crate::journal::entry::{deserialize_entry, serialize_entry, JournalEntry};

/// Magic bytes identifying a savefile: "PJNL"
pub const SAVEFILE_MAGIC: u32 = 0x504A_4E4C;

/// Current savefile format version
pub const SAVEFILE_VERSION: u32 = 1;

/// The options block carried inside a savefile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SavefileOptions {
    /// Maximum retained entries; 0 = unlimited.
    pub max_entries: u64,
    /// Byte budget; 0 = unlimited.
    pub max_bytes_retained: u64,
    /// Materialized cache slots per stack.
    pub ram_cache_entries: u64,
    /// Advisory disk byte budget.
    pub max_disk_bytes: u64,
    /// Advisory age floor in milliseconds.
    pub keep_latest_for_ms: u64,
    /// Whether retention only runs on explicit command.
    pub manual_garbage_collect: bool,
}

/// A decoded savefile.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SavefileDocument {
    /// Canonical path of the exported root.
    pub root_path: String,
    /// Retention-relevant options at export time.
    pub options: SavefileOptions,
    /// The root's sequence counter at export time.
    pub next_sequence: u64,
    /// Cursor position: how many leading entries were applied.
    pub undo_count: usize,
    /// All retained entries, oldest first.
    pub entries: Vec<JournalEntry>,
}

/// Encode a document into savefile bytes.
pub fn encode(document: &SavefileDocument) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(4096);

    put_u32(&mut buffer, SAVEFILE_MAGIC);
    put_u32(&mut buffer, SAVEFILE_VERSION);

    put_len_bytes(&mut buffer, document.root_path.as_bytes());

    put_u64(&mut buffer, document.options.max_entries);
    put_u64(&mut buffer, document.options.max_bytes_retained);
    put_u64(&mut buffer, document.options.ram_cache_entries);
    put_u64(&mut buffer, document.options.max_disk_bytes);
    put_u64(&mut buffer, document.options.keep_latest_for_ms);
    put_u8(
        &mut buffer,
        u8::from(document.options.manual_garbage_collect),
    );

    put_u64(&mut buffer, document.next_sequence);
    put_u32(&mut buffer, document.undo_count as u32);

    put_u32(&mut buffer, document.entries.len() as u32);
    for entry in &document.entries {
        let serialized = serialize_entry(entry)?;
        put_len_bytes(&mut buffer, &serialized);
    }

    Ok(buffer)
}

/// Decode savefile bytes into a document.
pub fn decode(data: &[u8]) -> Result<SavefileDocument> {
    let mut reader = ByteReader::new(data);

    match reader.u32() {
        Some(SAVEFILE_MAGIC) => {}
        _ => return Err(Error::MalformedInput("unrecognized savefile magic".into())),
    }
    match reader.u32() {
        Some(SAVEFILE_VERSION) => {}
        _ => {
            return Err(Error::MalformedInput(
                "unsupported savefile version".into(),
            ))
        }
    }

    let root_path = reader
        .len_string()
        .ok_or_else(|| Error::MalformedInput("savefile truncated (root path)".into()))?;

    let options = match (
        reader.u64(),
        reader.u64(),
        reader.u64(),
        reader.u64(),
        reader.u64(),
        reader.u8(),
    ) {
        (Some(max_entries), Some(max_bytes), Some(ram), Some(disk), Some(keep), Some(manual)) => {
            SavefileOptions {
                max_entries,
                max_bytes_retained: max_bytes,
                ram_cache_entries: ram,
                max_disk_bytes: disk,
                keep_latest_for_ms: keep,
                manual_garbage_collect: manual != 0,
            }
        }
        _ => return Err(Error::MalformedInput("savefile truncated (options)".into())),
    };

    let next_sequence = reader
        .u64()
        .ok_or_else(|| Error::MalformedInput("savefile truncated (sequence)".into()))?;
    let undo_count = reader
        .u32()
        .ok_or_else(|| Error::MalformedInput("savefile truncated (undo count)".into()))?
        as usize;
    let entry_count = reader
        .u32()
        .ok_or_else(|| Error::MalformedInput("savefile truncated (entry count)".into()))?
        as usize;

    if undo_count > entry_count {
        return Err(Error::MalformedInput(
            "savefile undo count exceeds entry count".into(),
        ));
    }

    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let record = reader
            .len_bytes()
            .ok_or_else(|| Error::MalformedInput("savefile truncated (entry)".into()))?;
        entries.push(deserialize_entry(record)?);
    }

    Ok(SavefileDocument {
        root_path,
        options,
        next_sequence,
        undo_count,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::entry::{OperationKind, SerializedPayload};

    fn sample_document() -> SavefileDocument {
        let make_entry = |seq: u64| JournalEntry {
            operation: OperationKind::Insert,
            path: format!("/doc/value{seq}"),
            tag: "export".into(),
            value: SerializedPayload::from_bytes(vec![seq as u8; 4]),
            inverse_value: SerializedPayload::absent(),
            timestamp_ms: 1000 + seq,
            monotonic_ns: seq,
            sequence: seq,
            barrier: seq == 1,
        };
        SavefileDocument {
            root_path: "/doc".into(),
            options: SavefileOptions {
                max_entries: 128,
                max_bytes_retained: 1 << 20,
                ram_cache_entries: 8,
                max_disk_bytes: 0,
                keep_latest_for_ms: 60_000,
                manual_garbage_collect: true,
            },
            next_sequence: 3,
            undo_count: 2,
            entries: vec![make_entry(1), make_entry(2), make_entry(3)],
        }
    }

    #[test]
    fn test_round_trip() {
        let document = sample_document();
        let bytes = encode(&document).unwrap();
        assert_eq!(decode(&bytes).unwrap(), document);
    }

    #[test]
    fn test_empty_document_round_trip() {
        let document = SavefileDocument {
            root_path: "/doc".into(),
            ..SavefileDocument::default()
        };
        let bytes = encode(&document).unwrap();
        assert_eq!(decode(&bytes).unwrap(), document);
    }

    #[test]
    fn test_rejects_bad_magic_and_version() {
        let bytes = encode(&sample_document()).unwrap();

        let mut bad = bytes.clone();
        bad[0] ^= 0xFF;
        assert!(matches!(decode(&bad), Err(Error::MalformedInput(_))));

        let mut bad = bytes;
        bad[4..8].copy_from_slice(&(SAVEFILE_VERSION + 1).to_le_bytes());
        assert!(matches!(decode(&bad), Err(Error::MalformedInput(_))));
    }

    #[test]
    fn test_rejects_undo_count_over_entries() {
        let mut document = sample_document();
        document.undo_count = document.entries.len() + 1;
        let bytes = encode(&document).unwrap();
        assert!(matches!(decode(&bytes), Err(Error::MalformedInput(_))));
    }

    #[test]
    fn test_rejects_truncation() {
        let bytes = encode(&sample_document()).unwrap();
        for len in 0..bytes.len() {
            assert!(
                decode(&bytes[..len]).is_err(),
                "truncation at {len} must fail"
            );
        }
    }

    #[test]
    fn test_rejects_overlong_entry_length() {
        let document = SavefileDocument {
            root_path: "/doc".into(),
            entries: vec![JournalEntry::default()],
            ..SavefileDocument::default()
        };
        let mut bytes = encode(&document).unwrap();
        // The entry's length prefix sits right after the entry count. Blow
        // it past the end of the buffer.
        let prefix_offset = 8 + (4 + 4) + 41 + 8 + 4 + 4;
        bytes[prefix_offset..prefix_offset + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(Error::MalformedInput(_))));
    }
}
