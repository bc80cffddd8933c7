//! The ordered key/value seam under the store tables.
//!
//! Keys are raw byte strings; iteration order is unsigned-bytewise, so the
//! fixed-width big-endian key encodings in [`crate::db`] scan in numeric
//! order. A back-end may report [`KvError::Busy`] from any call; the table
//! layers re-issue the operation until it goes through, so callers above
//! them never observe it.

use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// Transient contention; re-issue the same operation.
    #[error("back-end busy, retry")]
    Busy,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

pub trait Kv: Send {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), KvError>;

    /// Deleting an absent key succeeds.
    fn delete(&mut self, key: &[u8]) -> Result<(), KvError>;

    /// Visit entries with `lo <= key < hi` in ascending key order. The
    /// visitor returns `false` to stop early.
    fn scan(
        &self,
        lo: &[u8],
        hi: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError>;

    /// Greatest entry with `lo <= key < hi`, if any.
    fn last(&self, lo: &[u8], hi: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, KvError>;

    /// Make everything written so far durable.
    fn flush(&mut self) -> Result<(), KvError>;

    /// Drop every entry (FORMAT OSD).
    fn clear(&mut self) -> Result<(), KvError>;
}

/// Smallest byte string greater than every key starting with `prefix`.
/// Key encodings always start with a tag byte below 0xFF, so the carry
/// cannot run off the front.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return end;
        }
        end.pop();
    }
    unreachable!("prefix of 0xFF bytes is not a valid table prefix");
}

/// In-memory back-end used by tests and `format-on-missing-db` dry runs.
#[derive(Debug, Default)]
pub struct MemKv {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Kv for MemKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.map.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), KvError> {
        self.map.remove(key);
        Ok(())
    }

    fn scan(
        &self,
        lo: &[u8],
        hi: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError> {
        for (k, v) in self.map.range(lo.to_vec()..hi.to_vec()) {
            if !visit(k, v) {
                break;
            }
        }
        Ok(())
    }

    fn last(&self, lo: &[u8], hi: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, KvError> {
        Ok(self
            .map
            .range(lo.to_vec()..hi.to_vec())
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn flush(&mut self) -> Result<(), KvError> {
        Ok(())
    }

    fn clear(&mut self) -> Result<(), KvError> {
        self.map.clear();
        Ok(())
    }
}
