//! Checkpoint records.
//!
//! Components write their timing state as flat records of `u64` values
//! under a stable key (their statistics path). A `CheckpointSet` encodes
//! the records as little-endian binary and decodes them back.
//!
//! Layout: record count (`u32`), then per record the key length (`u32`),
//! the UTF-8 key, the value count (`u32`) and the values (`u64` each).

use std::collections::BTreeMap;
use thiserror::Error;

use crate::event::EventQueue;

/// Errors raised while decoding or restoring a checkpoint.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint truncated at byte {0}")]
    Truncated(usize),

    #[error("checkpoint key is not valid UTF-8: {0}")]
    InvalidKey(#[from] std::string::FromUtf8Error),

    #[error("checkpoint has no record for {0}")]
    MissingKey(String),

    #[error("checkpoint record {key} has {found} values, expected {expected}")]
    Length {
        key: String,
        expected: usize,
        found: usize,
    },
}

/// One component's saved state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub key: String,
    pub values: Vec<u64>,
}

/// A set of records keyed by component path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckpointSet {
    records: BTreeMap<String, Vec<u64>>,
}

impl CheckpointSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record, replacing any previous record with the same key.
    pub fn insert(&mut self, key: impl Into<String>, values: Vec<u64>) {
        self.records.insert(key.into(), values);
    }

    /// Returns the values stored under `key`.
    pub fn get(&self, key: &str) -> Result<&[u64], CheckpointError> {
        self.records
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| CheckpointError::MissingKey(key.to_string()))
    }

    /// Returns the values under `key`, checking their count.
    pub fn get_exact(&self, key: &str, expected: usize) -> Result<&[u64], CheckpointError> {
        let values = self.get(key)?;
        if values.len() != expected {
            return Err(CheckpointError::Length {
                key: key.to_string(),
                expected,
                found: values.len(),
            });
        }
        Ok(values)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over the records in key order.
    pub fn records(&self) -> impl Iterator<Item = CheckpointRecord> + '_ {
        self.records.iter().map(|(key, values)| CheckpointRecord {
            key: key.clone(),
            values: values.clone(),
        })
    }

    /// Encodes the set as little-endian binary.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.records.len() as u32).to_le_bytes());
        for (key, values) in &self.records {
            out.extend_from_slice(&(key.len() as u32).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&(values.len() as u32).to_le_bytes());
            for value in values {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        out
    }

    /// Decodes a set produced by `encode`.
    pub fn decode(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let mut reader = Reader { bytes, offset: 0 };
        let count = reader.u32()?;
        let mut set = Self::new();

        for _ in 0..count {
            let key_len = reader.u32()? as usize;
            let key = String::from_utf8(reader.take(key_len)?.to_vec())?;
            let value_count = reader.u32()? as usize;
            let mut values = Vec::with_capacity(value_count);
            for _ in 0..value_count {
                values.push(reader.u64()?);
            }
            set.insert(key, values);
        }

        Ok(set)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CheckpointError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(CheckpointError::Truncated(self.offset))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, CheckpointError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, CheckpointError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }
}

/// A component whose timing state can be saved and restored.
pub trait Checkpoint {
    /// Writes this component's records (and its children's) into `set`.
    fn create_checkpoint(&self, set: &mut CheckpointSet);

    /// Restores this component's records (and its children's) from `set`.
    fn restore_checkpoint(&mut self, set: &CheckpointSet) -> Result<(), CheckpointError>;
}

const EVENT_QUEUE_KEY: &str = "event_queue";

impl Checkpoint for EventQueue {
    fn create_checkpoint(&self, set: &mut CheckpointSet) {
        set.insert(
            EVENT_QUEUE_KEY,
            vec![self.current_cycle(), self.last_event_cycle()],
        );
    }

    fn restore_checkpoint(&mut self, set: &CheckpointSet) -> Result<(), CheckpointError> {
        let values = set.get_exact(EVENT_QUEUE_KEY, 2)?;
        self.restore_clock(values[0], values[1]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullHandler;

    #[test]
    fn test_encode_decode() {
        let mut set = CheckpointSet::new();
        set.insert("channel0.rank0", vec![1, 2, u64::MAX]);
        set.insert("channel0.rank1", vec![]);

        let bytes = set.encode();
        let decoded = CheckpointSet::decode(&bytes).unwrap();
        assert_eq!(decoded, set);
        assert_eq!(decoded.get("channel0.rank0").unwrap(), &[1, 2, u64::MAX]);
    }

    #[test]
    fn test_truncated_input() {
        let mut set = CheckpointSet::new();
        set.insert("key", vec![7]);
        let bytes = set.encode();

        let result = CheckpointSet::decode(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(CheckpointError::Truncated(_))));
    }

    #[test]
    fn test_invalid_key() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0xff, 0xfe]);
        bytes.extend_from_slice(&0u32.to_le_bytes());

        assert!(matches!(
            CheckpointSet::decode(&bytes),
            Err(CheckpointError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_missing_and_length() {
        let mut set = CheckpointSet::new();
        set.insert("a", vec![1]);
        assert!(matches!(set.get("b"), Err(CheckpointError::MissingKey(_))));
        assert!(matches!(
            set.get_exact("a", 2),
            Err(CheckpointError::Length { .. })
        ));
    }

    #[test]
    fn test_event_queue_clock() {
        let mut queue = EventQueue::new();
        queue.loop_steps(40, &mut NullHandler);

        let mut set = CheckpointSet::new();
        queue.create_checkpoint(&mut set);

        let mut restored = EventQueue::new();
        restored.restore_checkpoint(&set).unwrap();
        assert_eq!(restored.current_cycle(), 40);
    }
}
