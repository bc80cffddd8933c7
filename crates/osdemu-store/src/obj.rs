//! The object registry: which ids exist and what kind of thing each is.
//!
//! User objects and collections share one id space within a partition, so
//! `(pid, oid)` alone is the key and the kind is the value. Partitions are
//! the rows with `oid = 0`; the root is `(0, 0)`.

use osdemu_proto::defs::{ObjectKind, PARTITION_PID_LB, USEROBJECT_OID_LB};

use crate::db::{Db, obj_key, obj_pid_prefix, scan_end};
use crate::{StoreError, coll};

/// One page of an id enumeration plus the continuation cursor when the
/// limit cut it short.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdPage {
    pub ids: Vec<u64>,
    pub continuation: Option<u64>,
}

pub fn insert(db: &mut Db, pid: u64, oid: u64, kind: ObjectKind) -> Result<(), StoreError> {
    let key = obj_key(pid, oid);
    if db.retry_ref(|kv| kv.get(&key))?.is_some() {
        return Err(StoreError::Exists);
    }
    db.retry(|kv| kv.put(&key, &[kind as u8]))
}

/// Delete one object row and its collection memberships.
pub fn delete(db: &mut Db, pid: u64, oid: u64) -> Result<(), StoreError> {
    coll::delete_all_for_oid(db, pid, oid)?;
    let key = obj_key(pid, oid);
    db.retry(|kv| kv.delete(&key))
}

/// Delete a partition row. The partition must hold no user objects or
/// collections.
pub fn delete_partition(db: &mut Db, pid: u64) -> Result<(), StoreError> {
    if !is_empty_partition(db, pid)? {
        return Err(StoreError::NotEmpty);
    }
    let key = obj_key(pid, 0);
    db.retry(|kv| kv.delete(&key))
}

pub fn is_present(db: &Db, pid: u64, oid: u64) -> Result<bool, StoreError> {
    let key = obj_key(pid, oid);
    Ok(db.retry_ref(|kv| kv.get(&key))?.is_some())
}

pub fn kind(db: &Db, pid: u64, oid: u64) -> Result<ObjectKind, StoreError> {
    let key = obj_key(pid, oid);
    let raw = db.retry_ref(|kv| kv.get(&key))?.ok_or(StoreError::NotFound)?;
    raw.first()
        .copied()
        .and_then(ObjectKind::from_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("bad kind byte for ({pid:#x},{oid:#x})")))
}

/// Next unused object id in `pid`, `USEROBJECT_OID_LB` when the partition
/// holds nothing. Monotone non-decreasing between calls as long as nothing
/// is deleted in between.
pub fn next_oid(db: &Db, pid: u64) -> Result<u64, StoreError> {
    let prefix = obj_pid_prefix(pid);
    let end = scan_end(&prefix);
    let last = db.retry_ref(|kv| kv.last(&prefix, &end))?;
    Ok(match last {
        Some((key, _)) => {
            let oid = u64::from_be_bytes(key[9..17].try_into().unwrap());
            if oid == 0 {
                USEROBJECT_OID_LB
            } else {
                oid + 1
            }
        }
        None => USEROBJECT_OID_LB,
    })
}

/// Next unused partition id on the device.
pub fn next_pid(db: &Db) -> Result<u64, StoreError> {
    let prefix = [crate::db::TAG_OBJ];
    let end = scan_end(&prefix);
    let last = db.retry_ref(|kv| kv.last(&prefix, &end))?;
    Ok(match last {
        Some((key, _)) => {
            let pid = u64::from_be_bytes(key[1..9].try_into().unwrap());
            if pid < PARTITION_PID_LB {
                PARTITION_PID_LB
            } else {
                pid + 1
            }
        }
        None => PARTITION_PID_LB,
    })
}

/// True when `pid` has no user objects or collections. An absent partition
/// is empty.
pub fn is_empty_partition(db: &Db, pid: u64) -> Result<bool, StoreError> {
    let lo = obj_key(pid, 1);
    let prefix = obj_pid_prefix(pid);
    let end = scan_end(&prefix);
    let mut found = false;
    db.retry_ref(|kv| {
        found = false;
        kv.scan(&lo, &end, &mut |_, _| {
            found = true;
            false
        })
    })?;
    Ok(!found)
}

/// Enumerate user-object ids of `pid` starting at `cursor`.
pub fn list_oids(db: &Db, pid: u64, cursor: u64, limit: usize) -> Result<IdPage, StoreError> {
    enumerate(db, pid, cursor, limit, ObjectKind::UserObject)
}

/// Enumerate collection ids of `pid` starting at `cursor`.
pub fn list_cids(db: &Db, pid: u64, cursor: u64, limit: usize) -> Result<IdPage, StoreError> {
    enumerate(db, pid, cursor, limit, ObjectKind::Collection)
}

/// Enumerate partition ids on the device starting at `cursor`.
pub fn list_pids(db: &Db, cursor: u64, limit: usize) -> Result<IdPage, StoreError> {
    let lo = obj_key(cursor.max(PARTITION_PID_LB), 0);
    let prefix = [crate::db::TAG_OBJ];
    let end = scan_end(&prefix);
    let mut page = IdPage::default();
    db.retry_ref(|kv| {
        page = IdPage::default();
        kv.scan(&lo, &end, &mut |key, value| {
            let pid = u64::from_be_bytes(key[1..9].try_into().unwrap());
            let oid = u64::from_be_bytes(key[9..17].try_into().unwrap());
            if oid != 0 || value.first() != Some(&(ObjectKind::Partition as u8)) {
                return true;
            }
            if page.ids.len() == limit {
                page.continuation = Some(pid);
                return false;
            }
            page.ids.push(pid);
            true
        })
    })?;
    Ok(std::mem::take(&mut page))
}

fn enumerate(
    db: &Db,
    pid: u64,
    cursor: u64,
    limit: usize,
    want: ObjectKind,
) -> Result<IdPage, StoreError> {
    let lo = obj_key(pid, cursor.max(1));
    let prefix = obj_pid_prefix(pid);
    let end = scan_end(&prefix);
    let mut page = IdPage::default();
    db.retry_ref(|kv| {
        page = IdPage::default();
        kv.scan(&lo, &end, &mut |key, value| {
            if value.first() != Some(&(want as u8)) {
                return true;
            }
            let oid = u64::from_be_bytes(key[9..17].try_into().unwrap());
            if page.ids.len() == limit {
                page.continuation = Some(oid);
                return false;
            }
            page.ids.push(oid);
            true
        })
    })?;
    Ok(std::mem::take(&mut page))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PID: u64 = 0x10000;

    fn db_with_partition() -> Db {
        let mut db = Db::open_memory();
        insert(&mut db, PID, 0, ObjectKind::Partition).unwrap();
        db
    }

    #[test]
    fn insert_is_unique_across_kinds() {
        let mut db = db_with_partition();
        insert(&mut db, PID, 0x10000, ObjectKind::UserObject).unwrap();
        assert!(matches!(
            insert(&mut db, PID, 0x10000, ObjectKind::Collection),
            Err(StoreError::Exists)
        ));
        assert_eq!(kind(&db, PID, 0x10000).unwrap(), ObjectKind::UserObject);
    }

    #[test]
    fn next_oid_is_monotone() {
        let mut db = db_with_partition();
        assert_eq!(next_oid(&db, PID).unwrap(), 0x10000);
        insert(&mut db, PID, 0x10000, ObjectKind::UserObject).unwrap();
        assert_eq!(next_oid(&db, PID).unwrap(), 0x10001);
        insert(&mut db, PID, 0x10005, ObjectKind::Collection).unwrap();
        assert_eq!(next_oid(&db, PID).unwrap(), 0x10006);
    }

    #[test]
    fn next_pid_skips_low_ids() {
        let mut db = Db::open_memory();
        insert(&mut db, 0, 0, ObjectKind::Root).unwrap();
        assert_eq!(next_pid(&db).unwrap(), PARTITION_PID_LB);
        insert(&mut db, PARTITION_PID_LB, 0, ObjectKind::Partition).unwrap();
        assert_eq!(next_pid(&db).unwrap(), PARTITION_PID_LB + 1);
    }

    #[test]
    fn emptiness_tracks_children() {
        let mut db = db_with_partition();
        assert!(is_empty_partition(&db, PID).unwrap());
        insert(&mut db, PID, 0x10000, ObjectKind::UserObject).unwrap();
        assert!(!is_empty_partition(&db, PID).unwrap());
        assert!(matches!(
            delete_partition(&mut db, PID),
            Err(StoreError::NotEmpty)
        ));
        delete(&mut db, PID, 0x10000).unwrap();
        delete_partition(&mut db, PID).unwrap();
        assert!(!is_present(&db, PID, 0).unwrap());
    }

    #[test]
    fn enumeration_pages_and_continues() {
        let mut db = db_with_partition();
        for i in 0..5u64 {
            insert(&mut db, PID, 0x10000 + i, ObjectKind::UserObject).unwrap();
        }
        insert(&mut db, PID, 0x10005, ObjectKind::Collection).unwrap();

        let page = list_oids(&db, PID, 0, 3).unwrap();
        assert_eq!(page.ids, vec![0x10000, 0x10001, 0x10002]);
        assert_eq!(page.continuation, Some(0x10003));

        let page = list_oids(&db, PID, 0x10003, 10).unwrap();
        assert_eq!(page.ids, vec![0x10003, 0x10004]);
        assert_eq!(page.continuation, None);

        let cids = list_cids(&db, PID, 0, 10).unwrap();
        assert_eq!(cids.ids, vec![0x10005]);
    }

    #[test]
    fn partition_listing() {
        let mut db = Db::open_memory();
        insert(&mut db, 0, 0, ObjectKind::Root).unwrap();
        for i in 0..3u64 {
            insert(&mut db, PID + i, 0, ObjectKind::Partition).unwrap();
        }
        let page = list_pids(&db, 0, 10).unwrap();
        assert_eq!(page.ids, vec![PID, PID + 1, PID + 2]);
    }
}
