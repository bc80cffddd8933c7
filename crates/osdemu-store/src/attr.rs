//! The attribute table: `(pid, oid, page, number) -> bytes`.
//!
//! Retrieval comes in four shapes (one attribute, one page, one number
//! across all pages, everything) plus the derived directory page. Nothing
//! here knows about well-known attributes; the target's façade synthesizes
//! those and falls back to this table.

use osdemu_proto::defs::{ATTR_PAGE_ID_LEN, ATTRNUM_INFO, UNIDENTIFIED_PAGE_NAME};

use crate::db::{Db, attr_key, attr_page_prefix, attr_prefix, scan_end};
use crate::{StoreError, kv::KvError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrEntry {
    pub page: u32,
    pub number: u32,
    pub value: Vec<u8>,
}

/// Upsert one attribute. A zero-length value deletes it (osd2r00 sec 4.7.4:
/// only attributes with non-zero length are retrievable).
pub fn set(
    db: &mut Db,
    pid: u64,
    oid: u64,
    page: u32,
    number: u32,
    value: &[u8],
) -> Result<(), StoreError> {
    if value.len() > u16::MAX as usize {
        return Err(StoreError::Invalid);
    }
    if value.is_empty() {
        return delete(db, pid, oid, page, number);
    }
    let key = attr_key(pid, oid, page, number);
    db.retry(|kv| kv.put(&key, value))
}

/// Idempotent delete.
pub fn delete(db: &mut Db, pid: u64, oid: u64, page: u32, number: u32) -> Result<(), StoreError> {
    let key = attr_key(pid, oid, page, number);
    db.retry(|kv| kv.delete(&key))
}

/// Remove every attribute of an object (REMOVE, REMOVE PARTITION).
pub fn delete_all(db: &mut Db, pid: u64, oid: u64) -> Result<(), StoreError> {
    let prefix = attr_prefix(pid, oid);
    let end = scan_end(&prefix);
    let keys = db.retry_ref(|kv| {
        let mut keys = Vec::new();
        kv.scan(&prefix, &end, &mut |k, _| {
            keys.push(k.to_vec());
            true
        })?;
        Ok(keys)
    })?;
    for key in keys {
        db.retry(|kv| kv.delete(&key))?;
    }
    Ok(())
}

pub fn get_one(
    db: &Db,
    pid: u64,
    oid: u64,
    page: u32,
    number: u32,
) -> Result<Vec<u8>, StoreError> {
    let key = attr_key(pid, oid, page, number);
    db.retry_ref(|kv| kv.get(&key))?.ok_or(StoreError::NotFound)
}

/// All attributes of one page, ordered by number ascending.
pub fn get_page(db: &Db, pid: u64, oid: u64, page: u32) -> Result<Vec<AttrEntry>, StoreError> {
    let prefix = attr_page_prefix(pid, oid, page);
    collect(db, &prefix, |_, _| true)
}

/// The attribute with `number` from every page that defines it, ordered by
/// page ascending.
pub fn get_for_all_pages(
    db: &Db,
    pid: u64,
    oid: u64,
    number: u32,
) -> Result<Vec<AttrEntry>, StoreError> {
    let prefix = attr_prefix(pid, oid);
    collect(db, &prefix, |_, n| n == number)
}

/// Every attribute of the object.
pub fn get_all(db: &Db, pid: u64, oid: u64) -> Result<Vec<AttrEntry>, StoreError> {
    let prefix = attr_prefix(pid, oid);
    collect(db, &prefix, |_, _| true)
}

/// Compute the directory page: one entry per distinct page the object
/// defines, numbered by the page and valued with the page's 40-byte name.
/// Pages without a (well-formed) name attribute report the unidentified
/// sentinel.
pub fn get_dir_page(
    db: &Db,
    pid: u64,
    oid: u64,
    dir_page: u32,
) -> Result<Vec<AttrEntry>, StoreError> {
    let all = get_all(db, pid, oid)?;
    let mut out: Vec<AttrEntry> = Vec::new();
    for entry in all {
        // Attribute number 0 sorts first within its page, so the first
        // entry seen for a page decides its name.
        if out.last().map(|l| l.number) == Some(entry.page) {
            continue;
        }
        let name = if entry.number == ATTRNUM_INFO && entry.value.len() == ATTR_PAGE_ID_LEN {
            entry.value
        } else {
            UNIDENTIFIED_PAGE_NAME.to_vec()
        };
        out.push(AttrEntry {
            page: dir_page,
            number: entry.page,
            value: name,
        });
    }
    Ok(out)
}

fn collect(
    db: &Db,
    prefix: &[u8],
    mut keep: impl FnMut(u32, u32) -> bool,
) -> Result<Vec<AttrEntry>, StoreError> {
    let end = scan_end(prefix);
    db.retry_ref(|kv| {
        let mut out = Vec::new();
        kv.scan(prefix, &end, &mut |k, v| {
            let page = u32::from_be_bytes(k[17..21].try_into().unwrap());
            let number = u32::from_be_bytes(k[21..25].try_into().unwrap());
            if keep(page, number) {
                out.push(AttrEntry {
                    page,
                    number,
                    value: v.to_vec(),
                });
            }
            true
        })?;
        Ok(out)
    })
}

/// Wrapper for tests: a back-end that reports Busy on a schedule, to prove
/// the retry loop re-issues operations with identical effect.
#[doc(hidden)]
pub struct FlakyKv<K> {
    pub inner: K,
    pub busy_every: u32,
    counter: std::cell::Cell<u32>,
}

impl<K> FlakyKv<K> {
    pub fn new(inner: K, busy_every: u32) -> Self {
        Self {
            inner,
            busy_every,
            counter: std::cell::Cell::new(0),
        }
    }

    fn tick(&self) -> Result<(), KvError> {
        let n = self.counter.get() + 1;
        self.counter.set(n);
        if self.busy_every != 0 && n % self.busy_every == 0 {
            return Err(KvError::Busy);
        }
        Ok(())
    }
}

impl<K: crate::kv::Kv> crate::kv::Kv for FlakyKv<K> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        self.tick()?;
        self.inner.get(key)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.tick()?;
        self.inner.put(key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), KvError> {
        self.tick()?;
        self.inner.delete(key)
    }

    fn scan(
        &self,
        lo: &[u8],
        hi: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError> {
        self.tick()?;
        self.inner.scan(lo, hi, visit)
    }

    fn last(&self, lo: &[u8], hi: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, KvError> {
        self.tick()?;
        self.inner.last(lo, hi)
    }

    fn flush(&mut self) -> Result<(), KvError> {
        self.inner.flush()
    }

    fn clear(&mut self) -> Result<(), KvError> {
        self.inner.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKv;
    use pretty_assertions::assert_eq;

    const PID: u64 = 0x10000;
    const OID: u64 = 0x10000;

    #[test]
    fn set_get_round_trip() {
        let mut db = Db::open_memory();
        set(&mut db, PID, OID, 0x10000, 111, b"Madhuri Dixit Rocks!!\0").unwrap();
        assert_eq!(
            get_one(&db, PID, OID, 0x10000, 111).unwrap(),
            b"Madhuri Dixit Rocks!!\0".to_vec()
        );
        assert!(matches!(
            get_one(&db, PID, OID, 0x10000, 112),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn zero_length_set_is_delete() {
        let mut db = Db::open_memory();
        set(&mut db, PID, OID, 0x10000, 1, b"x").unwrap();
        set(&mut db, PID, OID, 0x10000, 1, b"").unwrap();
        assert!(matches!(
            get_one(&db, PID, OID, 0x10000, 1),
            Err(StoreError::NotFound)
        ));
        // Deleting again stays silent.
        delete(&mut db, PID, OID, 0x10000, 1).unwrap();
    }

    #[test]
    fn page_listing_is_number_ordered() {
        let mut db = Db::open_memory();
        for n in [9u32, 2, 300, 1] {
            set(&mut db, PID, OID, 0x10000, n, &n.to_be_bytes()).unwrap();
        }
        set(&mut db, PID, OID, 0x10001, 5, b"other page").unwrap();
        let entries = get_page(&db, PID, OID, 0x10000).unwrap();
        let numbers: Vec<u32> = entries.iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![1, 2, 9, 300]);
    }

    #[test]
    fn for_all_pages_filters_by_number() {
        let mut db = Db::open_memory();
        set(&mut db, PID, OID, 0x10000, 7, b"a").unwrap();
        set(&mut db, PID, OID, 0x10002, 7, b"b").unwrap();
        set(&mut db, PID, OID, 0x10002, 8, b"c").unwrap();
        let entries = get_for_all_pages(&db, PID, OID, 7).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].page, 0x10000);
        assert_eq!(entries[1].page, 0x10002);
    }

    #[test]
    fn dir_page_joins_names_and_sentinels() {
        let mut db = Db::open_memory();
        let mut name = [b' '; ATTR_PAGE_ID_LEN];
        name[..12].copy_from_slice(b"My Page Name");
        name[ATTR_PAGE_ID_LEN - 1] = 0;
        set(&mut db, PID, OID, 0x10000, 1, b"payload").unwrap();
        set(&mut db, PID, OID, 0x10000, 0, &name).unwrap();
        set(&mut db, PID, OID, 0x10002, 7, b"other").unwrap();

        let dir = get_dir_page(&db, PID, OID, 0).unwrap();
        assert_eq!(dir.len(), 2);
        assert_eq!(dir[0].number, 0x10000);
        assert_eq!(dir[0].value, name.to_vec());
        assert_eq!(dir[1].number, 0x10002);
        assert_eq!(dir[1].value, UNIDENTIFIED_PAGE_NAME.to_vec());
    }

    #[test]
    fn delete_all_leaves_nothing() {
        let mut db = Db::open_memory();
        for page in [0x10000u32, 0x10005] {
            for n in 0..4u32 {
                set(&mut db, PID, OID, page, n + 1, b"v").unwrap();
            }
        }
        set(&mut db, PID, OID + 1, 0x10000, 1, b"survives").unwrap();
        delete_all(&mut db, PID, OID).unwrap();
        assert!(get_all(&db, PID, OID).unwrap().is_empty());
        assert_eq!(get_all(&db, PID, OID + 1).unwrap().len(), 1);
    }

    #[test]
    fn busy_backend_is_retried_transparently() {
        let mut db = Db::with_backend(Box::new(FlakyKv::new(MemKv::new(), 2)));
        for n in 1..=8u32 {
            set(&mut db, PID, OID, 0x10000, n, &n.to_be_bytes()).unwrap();
        }
        let entries = get_page(&db, PID, OID, 0x10000).unwrap();
        assert_eq!(entries.len(), 8);
    }

    #[test]
    fn oversized_value_is_rejected() {
        let mut db = Db::open_memory();
        let big = vec![0u8; 70000];
        assert!(matches!(
            set(&mut db, PID, OID, 0x10000, 1, &big),
            Err(StoreError::Invalid)
        ));
    }
}
