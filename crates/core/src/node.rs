//! Node payload model
//!
//! A node in the store holds a [`NodeData`]: an ordered queue of payload
//! slots. Insert appends a slot at the back; take pops the front. Values
//! serialize through bincode; tasks and opaque payloads occupy queue slots
//! but cannot be captured into history, which is what the engine's
//! unsupported-payload handling is about.
//!
//! # Snapshot form
//!
//! `serialize_snapshot` flattens the queue into
//! `u32 count, (u32 len, bytes)*` little-endian and only succeeds when
//! every slot is a serialized value. The inverse is strict: any truncation
//! or trailing garbage fails.

use std::collections::VecDeque;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// One queued payload at a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSlot {
    /// A bincode-serialized user value.
    Bytes(Vec<u8>),
    /// Queued executable work. Cannot be serialized for history.
    Task,
    /// A payload with no serializer. Cannot be serialized for history.
    Opaque,
}

/// The ordered payload queue held by one store node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeData {
    slots: VecDeque<PayloadSlot>,
}

impl NodeData {
    /// An empty queue.
    pub fn new() -> Self {
        NodeData::default()
    }

    /// Build a queue holding a single serialized value.
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self> {
        let mut data = NodeData::new();
        data.push_value(value)?;
        Ok(data)
    }

    /// Serialize `value` and append it to the back of the queue.
    pub fn push_value<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)
            .map_err(|e| Error::Unknown(format!("failed to serialize payload: {e}")))?;
        self.slots.push_back(PayloadSlot::Bytes(bytes));
        Ok(())
    }

    /// Append an already-built slot.
    pub fn push_slot(&mut self, slot: PayloadSlot) {
        self.slots.push_back(slot);
    }

    /// Pop the front slot.
    pub fn pop_front(&mut self) -> Option<PayloadSlot> {
        self.slots.pop_front()
    }

    /// Peek the front slot.
    pub fn front(&self) -> Option<&PayloadSlot> {
        self.slots.front()
    }

    /// Decode the front slot as a value of type `T` without removing it.
    pub fn front_value<T: DeserializeOwned>(&self) -> Result<T> {
        match self.slots.front() {
            None => Err(Error::NoObjectFound("no value at path".to_string())),
            Some(PayloadSlot::Bytes(bytes)) => bincode::deserialize(bytes).map_err(|e| {
                Error::InvalidType(format!("stored payload does not decode as requested type: {e}"))
            }),
            Some(_) => Err(Error::InvalidType(
                "front payload is not a serialized value".to_string(),
            )),
        }
    }

    /// Number of queued slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether any slot is an executable payload.
    pub fn has_execution_payload(&self) -> bool {
        self.slots.iter().any(|s| matches!(s, PayloadSlot::Task))
    }

    /// Estimated payload size: the sum of serialized byte lengths.
    /// Task and opaque slots contribute nothing.
    pub fn payload_bytes(&self) -> usize {
        self.slots
            .iter()
            .map(|s| match s {
                PayloadSlot::Bytes(b) => b.len(),
                _ => 0,
            })
            .sum()
    }

    /// Flatten the queue into snapshot bytes.
    ///
    /// Returns `None` when any slot is a task or opaque payload; such
    /// nodes cannot be captured into history.
    pub fn serialize_snapshot(&self) -> Option<Vec<u8>> {
        let mut buffer = Vec::with_capacity(4 + self.payload_bytes());
        buffer.extend_from_slice(&(self.slots.len() as u32).to_le_bytes());
        for slot in &self.slots {
            match slot {
                PayloadSlot::Bytes(bytes) => {
                    buffer.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    buffer.extend_from_slice(bytes);
                }
                PayloadSlot::Task | PayloadSlot::Opaque => return None,
            }
        }
        Some(buffer)
    }

    /// Rebuild a queue from snapshot bytes. Strict: truncation or trailing
    /// bytes fail.
    pub fn deserialize_snapshot(bytes: &[u8]) -> Option<NodeData> {
        if bytes.len() < 4 {
            return None;
        }
        let count = u32::from_le_bytes(bytes[0..4].try_into().ok()?) as usize;
        let mut offset = 4;
        let mut slots = VecDeque::with_capacity(count);
        for _ in 0..count {
            if bytes.len() < offset + 4 {
                return None;
            }
            let len = u32::from_le_bytes(bytes[offset..offset + 4].try_into().ok()?) as usize;
            offset += 4;
            if bytes.len() < offset + len {
                return None;
            }
            slots.push_back(PayloadSlot::Bytes(bytes[offset..offset + len].to_vec()));
            offset += len;
        }
        if offset != bytes.len() {
            return None;
        }
        Some(NodeData { slots })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_order_is_fifo() {
        let mut data = NodeData::new();
        data.push_value(&"alpha".to_string()).unwrap();
        data.push_value(&"beta".to_string()).unwrap();

        let front: String = data.front_value().unwrap();
        assert_eq!(front, "alpha");

        data.pop_front();
        let next: String = data.front_value().unwrap();
        assert_eq!(next, "beta");
    }

    #[test]
    fn test_front_value_type_mismatch() {
        let data = NodeData::from_value(&"text".to_string()).unwrap();
        // A string payload does not decode as a fixed-width integer pair.
        let result: Result<(u64, u64)> = data.front_value();
        assert!(matches!(result, Err(Error::InvalidType(_))));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut data = NodeData::new();
        data.push_value(&1u64).unwrap();
        data.push_value(&2u64).unwrap();

        let bytes = data.serialize_snapshot().unwrap();
        let restored = NodeData::deserialize_snapshot(&bytes).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_snapshot_refuses_tasks_and_opaque() {
        let mut data = NodeData::new();
        data.push_value(&1u64).unwrap();
        data.push_slot(PayloadSlot::Task);
        assert!(data.serialize_snapshot().is_none());

        let mut data = NodeData::new();
        data.push_slot(PayloadSlot::Opaque);
        assert!(data.serialize_snapshot().is_none());
    }

    #[test]
    fn test_snapshot_decode_is_strict() {
        let mut data = NodeData::new();
        data.push_value(&7u32).unwrap();
        let mut bytes = data.serialize_snapshot().unwrap();

        // Truncated payload
        assert!(NodeData::deserialize_snapshot(&bytes[..bytes.len() - 1]).is_none());

        // Trailing garbage
        bytes.push(0);
        assert!(NodeData::deserialize_snapshot(&bytes).is_none());

        // Too short for the count
        assert!(NodeData::deserialize_snapshot(&[1, 0]).is_none());
    }

    #[test]
    fn test_execution_payload_detection() {
        let mut data = NodeData::new();
        assert!(!data.has_execution_payload());
        data.push_slot(PayloadSlot::Task);
        assert!(data.has_execution_payload());
    }

    #[test]
    fn test_payload_bytes_ignores_non_values() {
        let mut data = NodeData::new();
        data.push_value(&[0u8; 16]).unwrap();
        let value_only = data.payload_bytes();
        data.push_slot(PayloadSlot::Task);
        data.push_slot(PayloadSlot::Opaque);
        assert_eq!(data.payload_bytes(), value_only);
    }
}
