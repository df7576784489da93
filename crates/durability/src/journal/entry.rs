//! Journal entry record format.
//!
//! # Record Layout
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────────────┐
//! │ Magic (4)    │ Version (2)  │ Op (1) Flags (1) Reserved (2)        │
//! ├──────────────┴──────────────┴──────────────────────────────────────┤
//! │ TimestampMs (8)  MonotonicNs (8)  Sequence (8)                     │
//! ├────────────────────────────────────────────────────────────────────┤
//! │ Path: len (4) + bytes                                              │
//! ├────────────────────────────────────────────────────────────────────┤
//! │ Value payload:   present (1) + len (4) + bytes                     │
//! │ Inverse payload: present (1) + len (4) + bytes                     │
//! ├────────────────────────────────────────────────────────────────────┤
//! │ Tag: len (4) + bytes            (version ≥ 2 only)                 │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Version-1 records have no tag section and decode with an empty tag.
//! Flag bit 0 marks a transaction barrier.

use histree_core::{Error, Result};

use crate::codec::{put_len_bytes, put_u16, put_u32, put_u64, put_u8, ByteReader};

/// Magic bytes identifying a journal entry: "PSJL"
pub const JOURNAL_MAGIC: u32 = 0x5053_4A4C;

/// Current journal entry format version
pub const JOURNAL_VERSION: u16 = 2;

const BARRIER_FLAG: u8 = 0x01;

/// The mutation a journal entry reverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationKind {
    /// A value was inserted at the path.
    Insert = 0,
    /// A value was taken (popped) from the path.
    Take = 1,
}

impl OperationKind {
    /// Decode from the on-disk byte. Bytes above the enum max are invalid.
    pub fn from_u8(raw: u8) -> Option<OperationKind> {
        match raw {
            0 => Some(OperationKind::Insert),
            1 => Some(OperationKind::Take),
            _ => None,
        }
    }
}

/// A possibly-absent serialized node payload.
///
/// `present == false` means "the node had no payload"; the decoder rejects
/// absent payloads that carry bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SerializedPayload {
    /// Whether the node held a payload at capture time.
    pub present: bool,
    /// The serialized payload bytes; empty when absent.
    pub bytes: Vec<u8>,
}

impl SerializedPayload {
    /// The absent payload.
    pub fn absent() -> Self {
        SerializedPayload::default()
    }

    /// A present payload wrapping `bytes`.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        SerializedPayload {
            present: true,
            bytes,
        }
    }
}

/// One reversible mutation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// The recorded operation.
    pub operation: OperationKind,
    /// Absolute path of the mutated node.
    pub path: String,
    /// Optional label stamped by `set_tag`.
    pub tag: String,
    /// Node payload after the mutation (forward direction).
    pub value: SerializedPayload,
    /// Node payload before the mutation (inverse direction).
    pub inverse_value: SerializedPayload,
    /// Wall-clock milliseconds when the mutation was recorded.
    pub timestamp_ms: u64,
    /// Monotonic nanoseconds when the mutation was recorded.
    pub monotonic_ns: u64,
    /// Monotonically assigned per-root sequence number.
    pub sequence: u64,
    /// Transaction boundary marker.
    pub barrier: bool,
}

impl Default for JournalEntry {
    fn default() -> Self {
        JournalEntry {
            operation: OperationKind::Insert,
            path: String::new(),
            tag: String::new(),
            value: SerializedPayload::absent(),
            inverse_value: SerializedPayload::absent(),
            timestamp_ms: 0,
            monotonic_ns: 0,
            sequence: 0,
            barrier: false,
        }
    }
}

fn put_payload(buffer: &mut Vec<u8>, payload: &SerializedPayload) {
    put_u8(buffer, u8::from(payload.present));
    put_len_bytes(buffer, &payload.bytes);
}

fn read_payload(reader: &mut ByteReader<'_>) -> Result<SerializedPayload> {
    let present = reader
        .u8()
        .ok_or_else(|| Error::MalformedInput("journal entry truncated (payload flag)".into()))?;
    let length = reader
        .u32()
        .ok_or_else(|| Error::MalformedInput("journal entry truncated (payload length)".into()))?
        as usize;
    let bytes = reader
        .take(length)
        .ok_or_else(|| Error::MalformedInput("journal entry truncated (payload bytes)".into()))?;
    if present == 0 && length != 0 {
        return Err(Error::MalformedInput(
            "journal payload absent but non-zero length".into(),
        ));
    }
    Ok(SerializedPayload {
        present: present != 0,
        bytes: bytes.to_vec(),
    })
}

/// Serialize an entry into its binary record form.
pub fn serialize_entry(entry: &JournalEntry) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(
        64 + entry.path.len()
            + entry.tag.len()
            + entry.value.bytes.len()
            + entry.inverse_value.bytes.len(),
    );

    put_u32(&mut buffer, JOURNAL_MAGIC);
    put_u16(&mut buffer, JOURNAL_VERSION);

    put_u8(&mut buffer, entry.operation as u8);
    put_u8(&mut buffer, if entry.barrier { BARRIER_FLAG } else { 0 });
    put_u16(&mut buffer, 0); // reserved

    put_u64(&mut buffer, entry.timestamp_ms);
    put_u64(&mut buffer, entry.monotonic_ns);
    put_u64(&mut buffer, entry.sequence);

    put_len_bytes(&mut buffer, entry.path.as_bytes());
    put_payload(&mut buffer, &entry.value);
    put_payload(&mut buffer, &entry.inverse_value);
    put_len_bytes(&mut buffer, entry.tag.as_bytes());

    Ok(buffer)
}

/// Decode an entry from its binary record form.
pub fn deserialize_entry(bytes: &[u8]) -> Result<JournalEntry> {
    let mut reader = ByteReader::new(bytes);

    match reader.u32() {
        Some(JOURNAL_MAGIC) => {}
        _ => return Err(Error::MalformedInput("journal entry missing magic header".into())),
    }

    let version = reader
        .u16()
        .ok_or_else(|| Error::MalformedInput("journal entry missing version".into()))?;
    if version < 1 || version > JOURNAL_VERSION {
        return Err(Error::MalformedInput(
            "unsupported journal entry version".into(),
        ));
    }

    let (op_byte, flag_byte, _reserved) = match (reader.u8(), reader.u8(), reader.u16()) {
        (Some(op), Some(flags), Some(reserved)) => (op, flags, reserved),
        _ => {
            return Err(Error::MalformedInput(
                "journal entry truncated (operation fields)".into(),
            ))
        }
    };

    let operation = OperationKind::from_u8(op_byte)
        .ok_or_else(|| Error::MalformedInput("unknown journal operation kind".into()))?;

    let (timestamp_ms, monotonic_ns, sequence) =
        match (reader.u64(), reader.u64(), reader.u64()) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => {
                return Err(Error::MalformedInput(
                    "journal entry truncated (metadata)".into(),
                ))
            }
        };

    let path = reader
        .len_string()
        .ok_or_else(|| Error::MalformedInput("journal entry truncated (path)".into()))?;

    let value = read_payload(&mut reader)?;
    let inverse_value = read_payload(&mut reader)?;

    let tag = if version >= 2 {
        reader
            .len_string()
            .ok_or_else(|| Error::MalformedInput("journal entry truncated (tag)".into()))?
    } else {
        String::new()
    };

    Ok(JournalEntry {
        operation,
        path,
        tag,
        value,
        inverse_value,
        timestamp_ms,
        monotonic_ns,
        sequence,
        barrier: flag_byte & BARRIER_FLAG != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_entry() -> JournalEntry {
        JournalEntry {
            operation: OperationKind::Insert,
            path: "/doc/value".into(),
            tag: "stroke".into(),
            value: SerializedPayload::from_bytes(vec![1, 2, 3]),
            inverse_value: SerializedPayload::from_bytes(vec![4, 5]),
            timestamp_ms: 123_456_789,
            monotonic_ns: 555,
            sequence: 42,
            barrier: true,
        }
    }

    #[test]
    fn test_round_trip_all_fields() {
        let entry = sample_entry();
        let bytes = serialize_entry(&entry).unwrap();
        let decoded = deserialize_entry(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_round_trip_absent_payloads() {
        let entry = JournalEntry {
            operation: OperationKind::Take,
            path: "/doc".into(),
            ..JournalEntry::default()
        };
        let bytes = serialize_entry(&entry).unwrap();
        let decoded = deserialize_entry(&bytes).unwrap();
        assert_eq!(decoded, entry);
        assert!(!decoded.value.present);
        assert!(!decoded.inverse_value.present);
    }

    #[test]
    fn test_version_one_decodes_with_empty_tag() {
        let entry = sample_entry();
        let mut bytes = serialize_entry(&entry).unwrap();

        // Strip the trailing tag section and rewrite the version field.
        let tag_section = 4 + entry.tag.len();
        bytes.truncate(bytes.len() - tag_section);
        bytes[4..6].copy_from_slice(&1u16.to_le_bytes());

        let decoded = deserialize_entry(&bytes).unwrap();
        assert_eq!(decoded.tag, "");
        assert_eq!(decoded.path, entry.path);
        assert_eq!(decoded.sequence, entry.sequence);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = serialize_entry(&sample_entry()).unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            deserialize_entry(&bytes),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn test_rejects_future_version() {
        let mut bytes = serialize_entry(&sample_entry()).unwrap();
        bytes[4..6].copy_from_slice(&(JOURNAL_VERSION + 1).to_le_bytes());
        assert!(matches!(
            deserialize_entry(&bytes),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_operation() {
        let mut bytes = serialize_entry(&sample_entry()).unwrap();
        bytes[6] = 7;
        assert!(matches!(
            deserialize_entry(&bytes),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn test_rejects_truncation_at_every_boundary() {
        let bytes = serialize_entry(&sample_entry()).unwrap();
        for len in 0..bytes.len() {
            assert!(
                deserialize_entry(&bytes[..len]).is_err(),
                "truncation at {len} must fail"
            );
        }
    }

    #[test]
    fn test_rejects_absent_payload_with_length() {
        let entry = JournalEntry {
            path: "/x".into(),
            ..JournalEntry::default()
        };
        let mut bytes = serialize_entry(&entry).unwrap();
        // The value payload starts after the fixed header (34 bytes) and
        // the path section (4 + 2). Flip its length to 1 while leaving the
        // present flag clear.
        let payload_offset = 34 + 4 + entry.path.len();
        assert_eq!(bytes[payload_offset], 0);
        bytes[payload_offset + 1..payload_offset + 5].copy_from_slice(&1u32.to_le_bytes());
        bytes.insert(payload_offset + 5, 0xAA);
        assert!(matches!(
            deserialize_entry(&bytes),
            Err(Error::MalformedInput(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            op in 0u8..2,
            path in "/[a-z]{1,12}(/[a-z0-9]{1,8}){0,3}",
            tag in "[a-z0-9]{0,10}",
            value in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..256)),
            inverse in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..256)),
            timestamp_ms in any::<u64>(),
            monotonic_ns in any::<u64>(),
            sequence in any::<u64>(),
            barrier in any::<bool>(),
        ) {
            let entry = JournalEntry {
                operation: OperationKind::from_u8(op).unwrap(),
                path,
                tag,
                value: value.map(SerializedPayload::from_bytes)
                    .unwrap_or_else(SerializedPayload::absent),
                inverse_value: inverse.map(SerializedPayload::from_bytes)
                    .unwrap_or_else(SerializedPayload::absent),
                timestamp_ms,
                monotonic_ns,
                sequence,
                barrier,
            };
            let bytes = serialize_entry(&entry).unwrap();
            prop_assert_eq!(deserialize_entry(&bytes).unwrap(), entry);
        }
    }
}
