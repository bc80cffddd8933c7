//! The collection membership index.
//!
//! A row `(pid, cid, oid, number)` records that user object `oid` belongs
//! to collection `cid`, referenced from attribute `number` of the object's
//! collections page. Membership is indexed in both directions: by
//! collection (enumeration, emptiness) and by object (removal, reverse
//! lookup by attribute number).

use crate::db::{Db, coll_cid_prefix, coll_key, member_key, member_number_prefix, member_oid_prefix, scan_end};
use crate::obj::IdPage;
use crate::StoreError;

pub fn insert(db: &mut Db, pid: u64, cid: u64, oid: u64, number: u32) -> Result<(), StoreError> {
    let fwd = coll_key(pid, cid, oid);
    let rev = member_key(pid, oid, number, cid);
    db.retry(|kv| kv.put(&fwd, &number.to_be_bytes()))?;
    db.retry(|kv| kv.put(&rev, &[]))
}

/// Remove one membership; absent rows are ignored.
pub fn delete(db: &mut Db, pid: u64, cid: u64, oid: u64) -> Result<(), StoreError> {
    let fwd = coll_key(pid, cid, oid);
    let Some(raw) = db.retry_ref(|kv| kv.get(&fwd))? else {
        return Ok(());
    };
    let number = u32::from_be_bytes(raw[..4].try_into().map_err(|_| {
        StoreError::Corrupt(format!("membership row ({pid:#x},{cid:#x},{oid:#x})"))
    })?);
    let rev = member_key(pid, oid, number, cid);
    db.retry(|kv| kv.delete(&fwd))?;
    db.retry(|kv| kv.delete(&rev))
}

/// Drop every membership of collection `cid` (the members survive).
pub fn delete_all_for_cid(db: &mut Db, pid: u64, cid: u64) -> Result<(), StoreError> {
    let prefix = coll_cid_prefix(pid, cid);
    let end = scan_end(&prefix);
    let rows = db.retry_ref(|kv| {
        let mut rows = Vec::new();
        kv.scan(&prefix, &end, &mut |k, v| {
            let oid = u64::from_be_bytes(k[17..25].try_into().unwrap());
            let number = u32::from_be_bytes(v[..4].try_into().unwrap_or([0; 4]));
            rows.push((oid, number));
            true
        })?;
        Ok(rows)
    })?;
    for (oid, number) in rows {
        let fwd = coll_key(pid, cid, oid);
        let rev = member_key(pid, oid, number, cid);
        db.retry(|kv| kv.delete(&fwd))?;
        db.retry(|kv| kv.delete(&rev))?;
    }
    Ok(())
}

/// Drop `oid` from every collection it belongs to (object removal).
pub fn delete_all_for_oid(db: &mut Db, pid: u64, oid: u64) -> Result<(), StoreError> {
    let prefix = member_oid_prefix(pid, oid);
    let end = scan_end(&prefix);
    let rows = db.retry_ref(|kv| {
        let mut rows = Vec::new();
        kv.scan(&prefix, &end, &mut |k, _| {
            let number = u32::from_be_bytes(k[17..21].try_into().unwrap());
            let cid = u64::from_be_bytes(k[21..29].try_into().unwrap());
            rows.push((number, cid));
            true
        })?;
        Ok(rows)
    })?;
    for (number, cid) in rows {
        let fwd = coll_key(pid, cid, oid);
        let rev = member_key(pid, oid, number, cid);
        db.retry(|kv| kv.delete(&fwd))?;
        db.retry(|kv| kv.delete(&rev))?;
    }
    Ok(())
}

/// True when `cid` has no members (or does not exist).
pub fn is_empty(db: &Db, pid: u64, cid: u64) -> Result<bool, StoreError> {
    let prefix = coll_cid_prefix(pid, cid);
    let end = scan_end(&prefix);
    let mut found = false;
    db.retry_ref(|kv| {
        found = false;
        kv.scan(&prefix, &end, &mut |_, _| {
            found = true;
            false
        })
    })?;
    Ok(!found)
}

/// The collection that `oid` references from attribute `number` of its
/// collections page. With several candidates (members copied between
/// collections share numbers) the lowest collection id wins.
pub fn get_cid(db: &Db, pid: u64, oid: u64, number: u32) -> Result<u64, StoreError> {
    let prefix = member_number_prefix(pid, oid, number);
    let end = scan_end(&prefix);
    let mut cid = None;
    db.retry_ref(|kv| {
        cid = None;
        kv.scan(&prefix, &end, &mut |k, _| {
            cid = Some(u64::from_be_bytes(k[21..29].try_into().unwrap()));
            false
        })
    })?;
    cid.ok_or(StoreError::NotFound)
}

/// Enumerate members of `cid` from `cursor`, at most `limit`, with a
/// continuation cursor when truncated.
pub fn members(db: &Db, pid: u64, cid: u64, cursor: u64, limit: usize) -> Result<IdPage, StoreError> {
    let lo = coll_key(pid, cid, cursor);
    let prefix = coll_cid_prefix(pid, cid);
    let end = scan_end(&prefix);
    let mut page = IdPage::default();
    db.retry_ref(|kv| {
        page = IdPage::default();
        kv.scan(&lo, &end, &mut |k, _| {
            let oid = u64::from_be_bytes(k[17..25].try_into().unwrap());
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

/// Every membership of `oid` as `(number, cid)` pairs, ordered by number.
/// This is the backing of the user object's collections attribute page.
pub fn memberships_of(db: &Db, pid: u64, oid: u64) -> Result<Vec<(u32, u64)>, StoreError> {
    let prefix = member_oid_prefix(pid, oid);
    let end = scan_end(&prefix);
    db.retry_ref(|kv| {
        let mut rows = Vec::new();
        kv.scan(&prefix, &end, &mut |k, _| {
            let number = u32::from_be_bytes(k[17..21].try_into().unwrap());
            let cid = u64::from_be_bytes(k[21..29].try_into().unwrap());
            rows.push((number, cid));
            true
        })?;
        Ok(rows)
    })
}

/// Union the membership of `src_cid` into `dst_cid`, keeping each member's
/// reference number. Idempotent.
pub fn copy_members(db: &mut Db, pid: u64, src_cid: u64, dst_cid: u64) -> Result<(), StoreError> {
    let prefix = coll_cid_prefix(pid, src_cid);
    let end = scan_end(&prefix);
    let rows = db.retry_ref(|kv| {
        let mut rows = Vec::new();
        kv.scan(&prefix, &end, &mut |k, v| {
            let oid = u64::from_be_bytes(k[17..25].try_into().unwrap());
            let number = u32::from_be_bytes(v[..4].try_into().unwrap_or([0; 4]));
            rows.push((oid, number));
            true
        })?;
        Ok(rows)
    })?;
    for (oid, number) in rows {
        insert(db, pid, dst_cid, oid, number)?;
    }
    Ok(())
}
