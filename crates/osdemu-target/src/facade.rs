//! Well-known attributes, synthesized over the attribute store.
//!
//! The store holds only what initiators wrote. The information pages
//! (user-object page 0x1, partition page 0x3000_0001, root page
//! 0x9000_0001) are mostly computed: ids come from the command, capacities
//! from the payload files and the file system, the clock from the host.
//! A handful of members are backed by the store (username, OSD name,
//! system id). Writes to the computed members are rejected; the exceptions
//! are username, OSD name, the logical length (which truncates the
//! payload), and the system id during FORMAT OSD.

use osdemu_proto::defs::{
    ATTR_PAGE_ID_LEN, ATTRNUM_INFO, ATTRNUM_UNMODIFIABLE, COLLECTION_PG, PARTITION_INFO_PG,
    PARTITION_PG, PG_SCOPE_LEN, ROOT_INFO_PG, ROOT_PG, USER_COLL_PG, USER_INFO_PG,
    USEROBJECT_OID_LB, USEROBJECT_PID_LB, ObjectKind, riap, uiap,
};
use osdemu_proto::endian::{set_u32, set_u48, set_u64};
use osdemu_proto::sense::{SenseData, SenseKey, asc};
use osdemu_store::{AttrEntry, StoreError, attr, coll, obj};

use crate::{Inner, now_ms};

pub(crate) const VENDOR_ID: &[u8] = b"OSDEMU\0";
pub(crate) const PRODUCT_ID: &[u8] = b"OSD2TGT\0";
pub(crate) const PRODUCT_MODEL: &[u8] = b"OSD2r05\0";
pub(crate) const PRODUCT_SERIAL: &[u8] = b"1\0";
pub(crate) const PRODUCT_REVISION: u32 = 200;

const USER_INFO_NAME: &[u8] = b"INCITS  T10 User Object Information";
const ROOT_INFO_NAME: &[u8] = b"INCITS  T10 Root Information";
const PARTITION_INFO_NAME: &[u8] = b"INCITS  T10 Partition Information";

/// Default 20-byte system id: a 4-byte vendor header followed by the
/// vendor/product names.
const DEFAULT_SYSTEM_ID: &[u8; riap::OSD_SYSTEM_ID_LEN] = b"\xf1\x81\x00\x0eOSDEMU OSD2TGT\0\0";

fn pad40(name: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; ATTR_PAGE_ID_LEN];
    out[..name.len()].copy_from_slice(name);
    out
}

fn be8(value: u64) -> Vec<u8> {
    let mut out = vec![0u8; 8];
    set_u64(&mut out, 0, value);
    out
}

pub(crate) fn param_list_sense(pid: u64, oid: u64, page: u32, number: u32) -> SenseData {
    let mut sense = SenseData::sdd(
        SenseKey::IllegalRequest,
        asc::INVALID_FIELD_IN_PARAMETER_LIST,
        pid,
        oid,
    );
    sense.push_attr_id(&[(page, number)]);
    sense
}

/// Fetch one attribute value, synthesizing the well-known members.
/// `Ok(None)` means the attribute is simply not defined.
pub(crate) fn get_value(
    inner: &Inner,
    pid: u64,
    oid: u64,
    page: u32,
    number: u32,
) -> Result<Option<Vec<u8>>, StoreError> {
    if page == USER_INFO_PG && pid >= USEROBJECT_PID_LB && oid >= USEROBJECT_OID_LB {
        return user_info_value(inner, pid, oid, number);
    }
    if page == ROOT_INFO_PG && pid == 0 && oid == 0 {
        return root_info_value(inner, number);
    }
    if page == PARTITION_INFO_PG && pid >= USEROBJECT_PID_LB && oid == 0 {
        return Ok(partition_info_value(pid, number));
    }
    if page == USER_COLL_PG && pid >= USEROBJECT_PID_LB && oid >= USEROBJECT_OID_LB {
        return match coll::get_cid(&inner.db, pid, oid, number) {
            Ok(cid) => Ok(Some(be8(cid))),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        };
    }
    match attr::get_one(&inner.db, pid, oid, page, number) {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

/// All entries of one page, synthesized pages included, ordered by number.
pub(crate) fn page_entries(
    inner: &Inner,
    pid: u64,
    oid: u64,
    page: u32,
) -> Result<Vec<AttrEntry>, StoreError> {
    let numbers: &[u32] = if page == USER_INFO_PG && pid >= USEROBJECT_PID_LB && oid >= USEROBJECT_OID_LB
    {
        &[
            ATTRNUM_INFO,
            uiap::PID,
            uiap::OID,
            uiap::USERNAME,
            uiap::USED_CAPACITY,
            uiap::LOGICAL_LEN,
        ]
    } else if page == ROOT_INFO_PG && pid == 0 && oid == 0 {
        &[
            ATTRNUM_INFO,
            riap::OSD_SYSTEM_ID,
            riap::VENDOR_IDENTIFICATION,
            riap::PRODUCT_IDENTIFICATION,
            riap::PRODUCT_MODEL,
            riap::PRODUCT_REVISION_LEVEL,
            riap::PRODUCT_SERIAL_NUMBER,
            riap::OSD_NAME,
            riap::TOTAL_CAPACITY,
            riap::USED_CAPACITY,
            riap::NUMBER_OF_PARTITIONS,
            riap::CLOCK,
        ]
    } else if page == PARTITION_INFO_PG && pid >= USEROBJECT_PID_LB && oid == 0 {
        &[ATTRNUM_INFO, uiap::PID]
    } else if page == USER_COLL_PG && pid >= USEROBJECT_PID_LB && oid >= USEROBJECT_OID_LB {
        return Ok(coll::memberships_of(&inner.db, pid, oid)?
            .into_iter()
            .map(|(number, cid)| AttrEntry {
                page,
                number,
                value: be8(cid),
            })
            .collect());
    } else {
        return attr::get_page(&inner.db, pid, oid, page);
    };

    let mut out = Vec::new();
    for &number in numbers {
        if let Some(value) = get_value(inner, pid, oid, page, number)? {
            out.push(AttrEntry {
                page,
                number,
                value,
            });
        }
    }
    Ok(out)
}

fn user_info_value(
    inner: &Inner,
    pid: u64,
    oid: u64,
    number: u32,
) -> Result<Option<Vec<u8>>, StoreError> {
    let value = match number {
        ATTRNUM_INFO => pad40(USER_INFO_NAME),
        uiap::PID => be8(pid),
        uiap::OID => be8(oid),
        uiap::USED_CAPACITY => {
            let used = inner.data.used_capacity(pid, oid).map_err(io_store)?;
            let bs = inner.block_size as u64;
            be8(used.div_ceil(bs) * bs)
        }
        uiap::LOGICAL_LEN => be8(inner.data.logical_len(pid, oid).map_err(io_store)?),
        uiap::USERNAME => {
            return match attr::get_one(&inner.db, pid, oid, USER_INFO_PG, uiap::USERNAME) {
                Ok(v) => Ok(Some(v)),
                Err(StoreError::NotFound) => Ok(None),
                Err(e) => Err(e),
            };
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn root_info_value(inner: &Inner, number: u32) -> Result<Option<Vec<u8>>, StoreError> {
    let value = match number {
        ATTRNUM_INFO => pad40(ROOT_INFO_NAME),
        riap::OSD_SYSTEM_ID => {
            match attr::get_one(&inner.db, 0, 0, ROOT_INFO_PG, riap::OSD_SYSTEM_ID) {
                Ok(v) => v,
                Err(StoreError::NotFound) => DEFAULT_SYSTEM_ID.to_vec(),
                Err(e) => return Err(e),
            }
        }
        riap::VENDOR_IDENTIFICATION => VENDOR_ID.to_vec(),
        riap::PRODUCT_IDENTIFICATION => PRODUCT_ID.to_vec(),
        riap::PRODUCT_MODEL => PRODUCT_MODEL.to_vec(),
        riap::PRODUCT_REVISION_LEVEL => {
            let mut out = vec![0u8; 4];
            set_u32(&mut out, 0, PRODUCT_REVISION);
            out
        }
        riap::PRODUCT_SERIAL_NUMBER => PRODUCT_SERIAL.to_vec(),
        riap::OSD_NAME => {
            match attr::get_one(&inner.db, 0, 0, ROOT_INFO_PG, riap::OSD_NAME) {
                Ok(v) => v,
                Err(StoreError::NotFound) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        riap::TOTAL_CAPACITY => be8(inner.data.device_capacity()?.0),
        riap::USED_CAPACITY => be8(inner.data.device_capacity()?.1),
        riap::NUMBER_OF_PARTITIONS => {
            let mut count = 0u64;
            let mut cursor = 0;
            loop {
                let page = obj::list_pids(&inner.db, cursor, 1024)?;
                count += page.ids.len() as u64;
                match page.continuation {
                    Some(next) => cursor = next,
                    None => break,
                }
            }
            be8(count)
        }
        riap::CLOCK => {
            let mut out = vec![0u8; riap::CLOCK_LEN];
            set_u48(&mut out, 0, now_ms());
            out
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn partition_info_value(pid: u64, number: u32) -> Option<Vec<u8>> {
    match number {
        ATTRNUM_INFO => Some(pad40(PARTITION_INFO_NAME)),
        uiap::PID => Some(be8(pid)),
        _ => None,
    }
}

/// Apply one attribute write, enforcing the settable-page rules, the
/// unmodifiable number, the 40-byte NUL-terminated info-attribute rule,
/// delete-on-zero-length, and the read-only policy on well-known members.
pub(crate) fn set_value(
    inner: &mut Inner,
    pid: u64,
    oid: u64,
    page: u32,
    number: u32,
    value: &[u8],
) -> Result<(), SenseData> {
    let kind = obj::kind(&inner.db, pid, oid)
        .map_err(|_| SenseData::sdd(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB, pid, oid))?;

    let scope = kind.page_scope();
    if page < scope || page - scope >= PG_SCOPE_LEN {
        return Err(param_list_sense(pid, oid, page, number));
    }
    if number == ATTRNUM_UNMODIFIABLE {
        return Err(param_list_sense(pid, oid, page, number));
    }
    // Page names are 40 bytes, NUL-terminated (osd2r00 sec 7.1.2.2).
    if number == ATTRNUM_INFO
        && !value.is_empty()
        && (value.len() > ATTR_PAGE_ID_LEN || !value.contains(&0))
    {
        return Err(SenseData::sdd(
            SenseKey::IllegalRequest,
            asc::INVALID_FIELD_IN_CDB,
            pid,
            oid,
        ));
    }

    if page == USER_INFO_PG && kind == ObjectKind::UserObject {
        return set_user_info(inner, pid, oid, number, value);
    }
    if page == USER_COLL_PG && kind == ObjectKind::UserObject {
        return set_membership(inner, pid, oid, number, value);
    }
    if page == ROOT_INFO_PG && kind == ObjectKind::Root {
        return set_root_info(inner, number, value);
    }
    if page == PARTITION_INFO_PG && kind == ObjectKind::Partition {
        return Err(param_list_sense(pid, oid, page, number));
    }

    attr::set(&mut inner.db, pid, oid, page, number, value)
        .map_err(|e| store_sense(&e, pid, oid))
}

fn set_user_info(
    inner: &mut Inner,
    pid: u64,
    oid: u64,
    number: u32,
    value: &[u8],
) -> Result<(), SenseData> {
    match number {
        uiap::USERNAME => attr::set(&mut inner.db, pid, oid, USER_INFO_PG, number, value)
            .map_err(|e| store_sense(&e, pid, oid)),
        uiap::LOGICAL_LEN => {
            if value.len() != uiap::LOGICAL_LEN_LEN {
                return Err(param_list_sense(pid, oid, USER_INFO_PG, number));
            }
            let len = u64::from_be_bytes(value.try_into().unwrap());
            log::debug!("truncating ({pid:#x},{oid:#x}) to {len}");
            inner
                .data
                .truncate(pid, oid, len)
                .map_err(|_| SenseData::sdd(SenseKey::HardwareError, asc::INVALID_FIELD_IN_CDB, pid, oid))
        }
        _ => Err(param_list_sense(pid, oid, USER_INFO_PG, number)),
    }
}

/// Writing a collection id into the collections attribute page joins the
/// object to that collection; a zero-length write leaves it.
fn set_membership(
    inner: &mut Inner,
    pid: u64,
    oid: u64,
    number: u32,
    value: &[u8],
) -> Result<(), SenseData> {
    if value.is_empty() {
        if let Ok(cid) = coll::get_cid(&inner.db, pid, oid, number) {
            coll::delete(&mut inner.db, pid, cid, oid).map_err(|e| store_sense(&e, pid, oid))?;
        }
        return Ok(());
    }
    if value.len() != 8 {
        return Err(param_list_sense(pid, oid, USER_COLL_PG, number));
    }
    let cid = u64::from_be_bytes(value.try_into().unwrap());
    match obj::kind(&inner.db, pid, cid) {
        Ok(ObjectKind::Collection) => {}
        _ => return Err(param_list_sense(pid, oid, USER_COLL_PG, number)),
    }
    coll::insert(&mut inner.db, pid, cid, oid, number).map_err(|e| store_sense(&e, pid, oid))
}

fn set_root_info(inner: &mut Inner, number: u32, value: &[u8]) -> Result<(), SenseData> {
    match number {
        riap::OSD_NAME => attr::set(&mut inner.db, 0, 0, ROOT_INFO_PG, number, value)
            .map_err(|e| store_sense(&e, 0, 0)),
        // The system id may only be assigned while the LUN is formatted.
        riap::OSD_SYSTEM_ID if inner.formatting => {
            if value.len() > riap::OSD_SYSTEM_ID_LEN {
                return Err(param_list_sense(0, 0, ROOT_INFO_PG, number));
            }
            let mut padded = vec![0u8; riap::OSD_SYSTEM_ID_LEN];
            padded[..value.len()].copy_from_slice(value);
            attr::set(&mut inner.db, 0, 0, ROOT_INFO_PG, number, &padded)
                .map_err(|e| store_sense(&e, 0, 0))
        }
        _ => Err(param_list_sense(0, 0, ROOT_INFO_PG, number)),
    }
}

pub(crate) fn store_sense(err: &StoreError, pid: u64, oid: u64) -> SenseData {
    match err {
        StoreError::NotFound | StoreError::Exists => {
            SenseData::sdd(SenseKey::HardwareError, asc::INVALID_FIELD_IN_CDB, pid, oid)
        }
        StoreError::NotEmpty => SenseData::sdd(
            SenseKey::IllegalRequest,
            asc::PARTITION_OR_COLLECTION_CONTAINS_USER_OBJECTS,
            pid,
            oid,
        ),
        StoreError::Invalid => {
            SenseData::sdd(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB, pid, oid)
        }
        StoreError::Io(_) | StoreError::Corrupt(_) => {
            SenseData::sdd(SenseKey::HardwareError, asc::SYSTEM_RESOURCE_FAILURE, pid, oid)
        }
    }
}

fn io_store(err: osdemu_store::dataio::DataIoError) -> StoreError {
    match err {
        osdemu_store::dataio::DataIoError::Io(e) => StoreError::Io(e),
        _ => StoreError::NotFound,
    }
}

/// Is `page` a directory page (offset 0 of some scope)?
pub(crate) fn is_dir_page(page: u32) -> bool {
    page == 0 || page == PARTITION_PG || page == COLLECTION_PG || page == ROOT_PG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_fit_the_page_id_width() {
        assert!(USER_INFO_NAME.len() < ATTR_PAGE_ID_LEN);
        assert!(ROOT_INFO_NAME.len() < ATTR_PAGE_ID_LEN);
        assert!(PARTITION_INFO_NAME.len() < ATTR_PAGE_ID_LEN);
        assert_eq!(DEFAULT_SYSTEM_ID.len(), riap::OSD_SYSTEM_ID_LEN);
    }
}
