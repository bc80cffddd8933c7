//! The shared database handle and its key encodings.
//!
//! One [`Kv`] back-end holds four tables, distinguished by a tag byte and
//! laid out with fixed-width big-endian fields so that byte order equals
//! numeric order:
//!
//! ```text
//! 'a' pid:8 oid:8 page:4 number:4      -> attribute value
//! 'o' pid:8 oid:8                      -> object kind (1 byte)
//! 'c' pid:8 cid:8 oid:8                -> membership attribute number:4
//! 'm' pid:8 oid:8 number:4 cid:8      -> (empty; reverse membership index)
//! 'M' name                             -> target metadata
//! ```
//!
//! The handle is the one typed object the subsystems share; nothing above
//! this layer touches raw keys.

use std::path::Path;

use crate::StoreError;
use crate::kv::{Kv, KvError, MemKv, prefix_end};
use crate::logfile::LogKv;

pub(crate) const TAG_ATTR: u8 = b'a';
pub(crate) const TAG_OBJ: u8 = b'o';
pub(crate) const TAG_COLL: u8 = b'c';
pub(crate) const TAG_MEMBER: u8 = b'm';
const TAG_META: u8 = b'M';

pub struct Db {
    kv: Box<dyn Kv>,
}

impl Db {
    /// Open (or create) the single-file store at `path`.
    pub fn open_file(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            kv: Box::new(LogKv::open(path)?),
        })
    }

    /// Volatile store for tests and throwaway targets.
    pub fn open_memory() -> Self {
        Self {
            kv: Box::new(MemKv::new()),
        }
    }

    /// Re-issue `op` until the back-end stops reporting `Busy`. Everything
    /// the tables do goes through here, so busy signals never escape.
    pub(crate) fn retry<T>(
        &mut self,
        mut op: impl FnMut(&mut dyn Kv) -> Result<T, KvError>,
    ) -> Result<T, StoreError> {
        loop {
            match op(self.kv.as_mut()) {
                Err(KvError::Busy) => continue,
                other => return Ok(other?),
            }
        }
    }

    pub(crate) fn retry_ref<T>(
        &self,
        mut op: impl FnMut(&dyn Kv) -> Result<T, KvError>,
    ) -> Result<T, StoreError> {
        loop {
            match op(self.kv.as_ref()) {
                Err(KvError::Busy) => continue,
                other => return Ok(other?),
            }
        }
    }

    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.retry(|kv| kv.flush())
    }

    /// Drop every table (FORMAT OSD).
    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.retry(|kv| kv.clear())
    }

    pub fn meta_get(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = meta_key(name);
        self.retry_ref(|kv| kv.get(&key))
    }

    pub fn meta_put(&mut self, name: &str, value: &[u8]) -> Result<(), StoreError> {
        let key = meta_key(name);
        self.retry(|kv| kv.put(&key, value))
    }

    /// Test hook: swap the back-end (e.g. for a flaky wrapper exercising
    /// the retry path).
    #[doc(hidden)]
    pub fn with_backend(kv: Box<dyn Kv>) -> Self {
        Self { kv }
    }
}

fn meta_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(TAG_META);
    key.extend_from_slice(name.as_bytes());
    key
}

pub(crate) fn attr_key(pid: u64, oid: u64, page: u32, number: u32) -> [u8; 25] {
    let mut key = [0u8; 25];
    key[0] = TAG_ATTR;
    key[1..9].copy_from_slice(&pid.to_be_bytes());
    key[9..17].copy_from_slice(&oid.to_be_bytes());
    key[17..21].copy_from_slice(&page.to_be_bytes());
    key[21..25].copy_from_slice(&number.to_be_bytes());
    key
}

pub(crate) fn attr_prefix(pid: u64, oid: u64) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[0] = TAG_ATTR;
    key[1..9].copy_from_slice(&pid.to_be_bytes());
    key[9..17].copy_from_slice(&oid.to_be_bytes());
    key
}

pub(crate) fn attr_page_prefix(pid: u64, oid: u64, page: u32) -> [u8; 21] {
    let mut key = [0u8; 21];
    key[..17].copy_from_slice(&attr_prefix(pid, oid));
    key[17..21].copy_from_slice(&page.to_be_bytes());
    key
}

pub(crate) fn obj_key(pid: u64, oid: u64) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[0] = TAG_OBJ;
    key[1..9].copy_from_slice(&pid.to_be_bytes());
    key[9..17].copy_from_slice(&oid.to_be_bytes());
    key
}

pub(crate) fn obj_pid_prefix(pid: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = TAG_OBJ;
    key[1..9].copy_from_slice(&pid.to_be_bytes());
    key
}

pub(crate) fn coll_key(pid: u64, cid: u64, oid: u64) -> [u8; 25] {
    let mut key = [0u8; 25];
    key[0] = TAG_COLL;
    key[1..9].copy_from_slice(&pid.to_be_bytes());
    key[9..17].copy_from_slice(&cid.to_be_bytes());
    key[17..25].copy_from_slice(&oid.to_be_bytes());
    key
}

pub(crate) fn coll_cid_prefix(pid: u64, cid: u64) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[0] = TAG_COLL;
    key[1..9].copy_from_slice(&pid.to_be_bytes());
    key[9..17].copy_from_slice(&cid.to_be_bytes());
    key
}

pub(crate) fn member_key(pid: u64, oid: u64, number: u32, cid: u64) -> [u8; 29] {
    let mut key = [0u8; 29];
    key[0] = TAG_MEMBER;
    key[1..9].copy_from_slice(&pid.to_be_bytes());
    key[9..17].copy_from_slice(&oid.to_be_bytes());
    key[17..21].copy_from_slice(&number.to_be_bytes());
    key[21..29].copy_from_slice(&cid.to_be_bytes());
    key
}

pub(crate) fn member_oid_prefix(pid: u64, oid: u64) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[0] = TAG_MEMBER;
    key[1..9].copy_from_slice(&pid.to_be_bytes());
    key[9..17].copy_from_slice(&oid.to_be_bytes());
    key
}

pub(crate) fn member_number_prefix(pid: u64, oid: u64, number: u32) -> [u8; 21] {
    let mut key = [0u8; 21];
    key[..17].copy_from_slice(&member_oid_prefix(pid, oid));
    key[17..21].copy_from_slice(&number.to_be_bytes());
    key
}

pub(crate) fn scan_end(prefix: &[u8]) -> Vec<u8> {
    prefix_end(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_tracks_numeric_order() {
        let a = attr_key(0x10000, 0x10000, 0x10000, 1);
        let b = attr_key(0x10000, 0x10000, 0x10000, 2);
        let c = attr_key(0x10000, 0x10000, 0x10001, 0);
        let d = attr_key(0x10000, 0x10001, 0, 0);
        assert!(a < b && b < c && c < d);
    }

    #[test]
    fn meta_round_trip() {
        let mut db = Db::open_memory();
        assert_eq!(db.meta_get("boot_epoch").unwrap(), None);
        db.meta_put("boot_epoch", &7u16.to_be_bytes()).unwrap();
        assert_eq!(
            db.meta_get("boot_epoch").unwrap(),
            Some(7u16.to_be_bytes().to_vec())
        );
    }
}
