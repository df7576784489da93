//! Snapshot file format.
//!
//! A snapshot image is the flattened payload view of one subtree:
//! generation number plus, for each node with a payload, its component
//! path and the serialized payload bytes.
//!
//! # File Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Magic (4)  Version (4)  Generation (8)      │
//! ├─────────────────────────────────────────────┤
//! │ Entry count (4)                             │
//! ├─────────────────────────────────────────────┤
//! │ Entry: component count (4)                  │
//! │        components: (len (4) + bytes)*       │
//! │        payload: len (4) + bytes             │
//! ├─────────────────────────────────────────────┤
//! │ ...                                         │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Persisted snapshots are named `<generation>.snapshot` where the stem is
//! the zero-padded 16-digit hex generation.

use std::path::Path;

use histree_core::{Error, Result};

use crate::codec::{put_len_bytes, put_u32, put_u64, ByteReader};
use crate::fsio;

/// Magic bytes identifying a snapshot image: "PSSN"
pub const SNAPSHOT_MAGIC: u32 = 0x5053_534E;

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// One payload-bearing node within a snapshot image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Path components relative to the snapshot root.
    pub components: Vec<String>,
    /// Serialized node payload.
    pub payload: Vec<u8>,
}

/// The flattened, codec-level form of one subtree snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotImage {
    /// Generation the snapshot was captured at.
    pub generation: u64,
    /// Payload-bearing nodes in depth-first order.
    pub entries: Vec<SnapshotEntry>,
}

/// Encode an image into its binary form.
pub fn encode_snapshot(image: &SnapshotImage) -> Vec<u8> {
    let mut buffer = Vec::new();
    put_u32(&mut buffer, SNAPSHOT_MAGIC);
    put_u32(&mut buffer, SNAPSHOT_VERSION);
    put_u64(&mut buffer, image.generation);
    put_u32(&mut buffer, image.entries.len() as u32);

    for entry in &image.entries {
        put_u32(&mut buffer, entry.components.len() as u32);
        for component in &entry.components {
            put_len_bytes(&mut buffer, component.as_bytes());
        }
        put_len_bytes(&mut buffer, &entry.payload);
    }

    buffer
}

/// Decode an image from its binary form. Strict on every field.
pub fn decode_snapshot(data: &[u8]) -> Result<SnapshotImage> {
    let mut reader = ByteReader::new(data);

    match reader.u32() {
        Some(SNAPSHOT_MAGIC) => {}
        _ => return Err(Error::MalformedInput("invalid snapshot magic".into())),
    }
    match reader.u32() {
        Some(SNAPSHOT_VERSION) => {}
        _ => {
            return Err(Error::MalformedInput(
                "unsupported snapshot version".into(),
            ))
        }
    }
    let generation = reader
        .u64()
        .ok_or_else(|| Error::MalformedInput("snapshot missing generation".into()))?;
    let count = reader
        .u32()
        .ok_or_else(|| Error::MalformedInput("snapshot missing entry count".into()))?;

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let component_count = reader
            .u32()
            .ok_or_else(|| Error::MalformedInput("snapshot malformed component count".into()))?;
        let mut components = Vec::with_capacity(component_count as usize);
        for _ in 0..component_count {
            let component = reader
                .len_string()
                .ok_or_else(|| Error::MalformedInput("snapshot malformed component".into()))?;
            components.push(component);
        }
        let payload = reader
            .len_bytes()
            .ok_or_else(|| Error::MalformedInput("snapshot malformed payload length".into()))?;
        entries.push(SnapshotEntry {
            components,
            payload: payload.to_vec(),
        });
    }

    Ok(SnapshotImage {
        generation,
        entries,
    })
}

/// File stem for a persisted snapshot: zero-padded 16-digit hex.
pub fn snapshot_file_stem(generation: u64) -> String {
    format!("{generation:016x}")
}

/// Load and decode a snapshot image from disk.
pub fn load_snapshot_image(path: &Path) -> Result<SnapshotImage> {
    let data = fsio::read_file(path)?;
    decode_snapshot(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_image() -> SnapshotImage {
        SnapshotImage {
            generation: 7,
            entries: vec![
                SnapshotEntry {
                    components: vec![],
                    payload: vec![1],
                },
                SnapshotEntry {
                    components: vec!["title".into()],
                    payload: vec![2, 3],
                },
                SnapshotEntry {
                    components: vec!["body".into(), "intro".into()],
                    payload: vec![4, 5, 6],
                },
            ],
        }
    }

    #[test]
    fn test_round_trip() {
        let image = sample_image();
        let bytes = encode_snapshot(&image);
        assert_eq!(decode_snapshot(&bytes).unwrap(), image);
    }

    #[test]
    fn test_empty_image_round_trip() {
        let image = SnapshotImage {
            generation: 0,
            entries: vec![],
        };
        let bytes = encode_snapshot(&image);
        assert_eq!(decode_snapshot(&bytes).unwrap(), image);
    }

    #[test]
    fn test_rejects_bad_magic_and_version() {
        let mut bytes = encode_snapshot(&sample_image());
        bytes[0] ^= 0xFF;
        assert!(decode_snapshot(&bytes).is_err());

        let mut bytes = encode_snapshot(&sample_image());
        bytes[4..8].copy_from_slice(&(SNAPSHOT_VERSION + 1).to_le_bytes());
        assert!(decode_snapshot(&bytes).is_err());
    }

    #[test]
    fn test_rejects_truncation() {
        let bytes = encode_snapshot(&sample_image());
        for len in 0..bytes.len() {
            assert!(
                decode_snapshot(&bytes[..len]).is_err(),
                "truncation at {len} must fail"
            );
        }
    }

    #[test]
    fn test_file_stem_is_sixteen_hex_digits() {
        assert_eq!(snapshot_file_stem(0), "0000000000000000");
        assert_eq!(snapshot_file_stem(0xABC), "0000000000000abc");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0000000000000007.snapshot");
        let image = sample_image();
        fsio::write_file_atomic(&path, &encode_snapshot(&image), true).unwrap();
        assert_eq!(load_snapshot_image(&path).unwrap(), image);
    }
}
