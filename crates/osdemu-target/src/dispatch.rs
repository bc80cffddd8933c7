//! The command dispatcher.
//!
//! Every action follows the same skeleton: validate arguments, check the
//! capability, run the core operation, apply the embedded set-attribute
//! directive, serialize the embedded get-attribute directive, and answer
//! with data plus sense plus status. The embedded SET runs after the core
//! operation so it lands on freshly created objects; on the remove family
//! a SET directive is rejected outright, and the embedded GET runs before
//! the core operation instead, so a removal can return the attributes it
//! is about to destroy.

use osdemu_proto::cdb::{AttrDirective, Cdb, CdbError, ListDirective, PageDirective, SgList, StrideHeader};
use osdemu_proto::defs::{
    ANY_PG, ATTRNUM_GETALL, ATTRNUM_INFO, CUR_CMD_ATTR_PG, GETALLATTR_PG, PARTITION_PID_LB,
    USEROBJECT_OID_LB, ObjectKind, ServiceAction, ccap as ccap_def, ddt, status,
};
use osdemu_proto::endian::{get_u32, set_u32, set_u64};
use osdemu_proto::list::{
    LIST_HDR_LEN, ListError, ListFormat, RetrievedList, parse_get_list, parse_set_list,
};
use osdemu_proto::query::{QueryOp, pack_matches, parse_query_list};
use osdemu_proto::sense::{SenseData, SenseKey, asc};
use osdemu_store::dataio::DataIoError;
use osdemu_store::{StoreError, attr, coll, obj};

use crate::facade::{self, is_dir_page, param_list_sense, store_sense};
use crate::{CancelToken, Inner, capcheck};

/// What a command hands back to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResult {
    pub data_in: Vec<u8>,
    pub sense: Vec<u8>,
    pub status: u8,
}

impl SubmitResult {
    fn good(data_in: Vec<u8>) -> Self {
        Self {
            data_in,
            sense: Vec::new(),
            status: status::GOOD,
        }
    }

    fn check(data_in: Vec<u8>, sense: &SenseData) -> Self {
        Self {
            data_in,
            sense: sense.finish(),
            status: status::CHECK_CONDITION,
        }
    }
}

/// Output of a core operation.
#[derive(Default)]
struct Core {
    data_in: Vec<u8>,
    /// Non-fatal sense (read past end-of-object).
    warn: Option<SenseData>,
    /// Object ids created by this command, in creation order.
    created: Vec<u64>,
    /// Partition id allocated by CREATE PARTITION.
    created_pid: Option<u64>,
}

/// Keep the retrieved-attributes scratch buffer bounded no matter what the
/// initiator put in the allocation-length field.
const MAX_RETRIEVED_ALLOC: usize = 16 << 20;

pub(crate) fn execute(
    inner: &mut Inner,
    cdb_bytes: &[u8],
    data_out: &[u8],
    cancel: &CancelToken,
) -> SubmitResult {
    let Ok(cdb) = Cdb::parse(cdb_bytes) else {
        log::warn!("rejecting malformed CDB ({} bytes)", cdb_bytes.len());
        let sense = SenseData::sdd(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB, 0, 0);
        return SubmitResult::check(Vec::new(), &sense);
    };
    let pid = cdb.pid();
    let oid = cdb.oid();

    let action = match cdb.action() {
        Ok(action) => action,
        Err(CdbError::UnknownAction(code)) => {
            log::debug!("unimplemented service action {code:#06x}");
            let sense = SenseData::sdd(
                SenseKey::IllegalRequest,
                asc::INVALID_COMMAND_OPERATION_CODE,
                pid,
                oid,
            );
            return SubmitResult::check(Vec::new(), &sense);
        }
        Err(_) => {
            let sense = SenseData::sdd(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB, pid, oid);
            return SubmitResult::check(Vec::new(), &sense);
        }
    };
    log::trace!("{action:?} pid {pid:#x} oid {oid:#x}");

    let directive = match cdb.attr_directive(data_out.len()) {
        Ok(d) => d,
        Err(e) => return SubmitResult::check(Vec::new(), &directive_sense(e, pid, oid)),
    };
    if action.removes_target() && directive.sets_attributes() {
        let sense = SenseData::sdd(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB, pid, oid);
        return SubmitResult::check(Vec::new(), &sense);
    }

    let io_range = match action {
        ServiceAction::Read | ServiceAction::Write | ServiceAction::Clear
        | ServiceAction::CreateAndWrite => Some((cdb.offset(), cdb.length())),
        ServiceAction::Append => {
            let eof = inner.data.logical_len(pid, oid).unwrap_or(0);
            Some((eof, cdb.length()))
        }
        _ => None,
    };
    if let Err(sense) = capcheck::check(inner, &cdb, action, io_range) {
        return SubmitResult::check(Vec::new(), &sense);
    }
    if cancel.is_cancelled() {
        return SubmitResult::check(Vec::new(), &aborted(pid, oid));
    }

    // A removal returns the attributes it is about to destroy, so its GET
    // directive runs against the pre-operation state.
    let mut pre_retrieved = Vec::new();
    if action.removes_target() {
        let targets = vec![(pid, if action == ServiceAction::RemovePartition { 0 } else { oid })];
        let mut scratch = Vec::new();
        if let Err(sense) = run_get(inner, &cdb, &directive, data_out, &targets, false, &mut scratch)
        {
            return SubmitResult::check(Vec::new(), &sense);
        }
        pre_retrieved = scratch;
    }

    inner.formatting = action == ServiceAction::FormatOsd;
    let core = run_core(inner, action, &cdb, data_out, cancel);
    let mut core = match core {
        Ok(core) => core,
        Err(sense) => {
            inner.formatting = false;
            return SubmitResult::check(Vec::new(), &sense);
        }
    };

    let targets = match attr_targets(inner, action, &cdb, &core) {
        Ok(t) => t,
        Err(sense) => {
            inner.formatting = false;
            return SubmitResult::check(core.data_in, &sense);
        }
    };

    if !action.removes_target() {
        if let Err(sense) = run_set(inner, &directive, data_out, &targets) {
            inner.formatting = false;
            return SubmitResult::check(core.data_in, &sense);
        }
    }
    inner.formatting = false;

    if cancel.is_cancelled() {
        return SubmitResult::check(core.data_in, &aborted(pid, oid));
    }

    if action.removes_target() {
        core.data_in = pre_retrieved;
    } else {
        // Member-attribute retrieval always answers per object.
        let multi = matches!(
            action,
            ServiceAction::GetMemberAttributes | ServiceAction::SetMemberAttributes
        );
        if let Err(sense) =
            run_get(inner, &cdb, &directive, data_out, &targets, multi, &mut core.data_in)
        {
            return SubmitResult::check(core.data_in, &sense);
        }
    }

    match core.warn {
        Some(warn) => SubmitResult::check(core.data_in, &warn),
        None => SubmitResult::good(core.data_in),
    }
}

fn run_core(
    inner: &mut Inner,
    action: ServiceAction,
    cdb: &Cdb<'_>,
    data_out: &[u8],
    cancel: &CancelToken,
) -> Result<Core, SenseData> {
    use ServiceAction::*;
    match action {
        Create => do_create(inner, cdb),
        CreateAndWrite => do_create_and_write(inner, cdb, data_out),
        CreatePartition => do_create_partition(inner, cdb),
        CreateCollection => do_create_collection(inner, cdb),
        Read => do_read(inner, cdb, data_out),
        Write => do_write(inner, cdb, data_out),
        Append => do_append(inner, cdb, data_out),
        Clear => do_clear(inner, cdb),
        Remove => do_remove(inner, cdb),
        RemoveCollection => do_remove_collection(inner, cdb),
        RemovePartition => do_remove_partition(inner, cdb),
        RemoveMemberObjects => do_remove_member_objects(inner, cdb, cancel),
        FormatOsd => do_format_osd(inner, cdb),
        Flush => do_flush(inner, cdb),
        FlushCollection | FlushPartition | FlushOsd => do_flush_meta(inner, cdb, action),
        GetAttributes | SetAttributes => do_attr_command(inner, cdb),
        GetMemberAttributes | SetMemberAttributes => do_member_attr_command(inner, cdb),
        List => do_list(inner, cdb),
        ListCollection => do_list_collection(inner, cdb),
        Query => do_query(inner, cdb, data_out),
    }
}

fn do_create(inner: &mut Inner, cdb: &Cdb<'_>) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let requested = cdb.oid();
    let num = cdb
        .create_num()
        .map_err(|_| cdb_sense(pid, requested))?
        .max(1);

    if pid < PARTITION_PID_LB || (requested != 0 && requested < USEROBJECT_OID_LB) {
        return Err(cdb_sense(pid, requested));
    }
    // Batch allocation requires the target to pick every id.
    if num > 1 && requested != 0 {
        return Err(cdb_sense(pid, requested));
    }
    require_kind(inner, pid, 0, ObjectKind::Partition)?;

    let start = if requested == 0 {
        obj::next_oid(&inner.db, pid).map_err(|e| store_sense(&e, pid, 0))?
    } else {
        if obj::is_present(&inner.db, pid, requested).map_err(|e| store_sense(&e, pid, requested))? {
            return Err(SenseData::sdd(
                SenseKey::HardwareError,
                asc::INVALID_FIELD_IN_CDB,
                pid,
                requested,
            ));
        }
        requested
    };

    let mut core = Core::default();
    for oid in start..start + num as u64 {
        if let Err(sense) = create_one(inner, pid, oid) {
            rollback_created(inner, pid, &core.created);
            return Err(sense);
        }
        core.created.push(oid);
    }
    let last = *core.created.last().expect("num >= 1");
    inner.ccap.set(ObjectKind::UserObject, pid, last, 0);
    Ok(core)
}

fn create_one(inner: &mut Inner, pid: u64, oid: u64) -> Result<(), SenseData> {
    obj::insert(&mut inner.db, pid, oid, ObjectKind::UserObject)
        .map_err(|e| store_sense(&e, pid, oid))?;
    if let Err(e) = inner.stamp_ctime(pid, oid, ObjectKind::UserObject) {
        let _ = obj::delete(&mut inner.db, pid, oid);
        return Err(store_sense(&e, pid, oid));
    }
    if let Err(e) = inner.data.create(pid, oid) {
        let _ = attr::delete_all(&mut inner.db, pid, oid);
        let _ = obj::delete(&mut inner.db, pid, oid);
        return Err(dataio_sense(&e, pid, oid));
    }
    Ok(())
}

/// Undo the already-created part of a batch so a failed CREATE leaves no
/// trace.
fn rollback_created(inner: &mut Inner, pid: u64, created: &[u64]) {
    for &oid in created {
        let _ = inner.data.remove(pid, oid);
        let _ = attr::delete_all(&mut inner.db, pid, oid);
        let _ = obj::delete(&mut inner.db, pid, oid);
    }
}

fn do_create_and_write(
    inner: &mut Inner,
    cdb: &Cdb<'_>,
    data_out: &[u8],
) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let requested = cdb.oid();
    if pid < PARTITION_PID_LB || (requested != 0 && requested < USEROBJECT_OID_LB) {
        return Err(cdb_sense(pid, requested));
    }
    require_kind(inner, pid, 0, ObjectKind::Partition)?;
    let oid = if requested == 0 {
        obj::next_oid(&inner.db, pid).map_err(|e| store_sense(&e, pid, 0))?
    } else {
        if obj::is_present(&inner.db, pid, requested).map_err(|e| store_sense(&e, pid, requested))? {
            return Err(SenseData::sdd(
                SenseKey::HardwareError,
                asc::INVALID_FIELD_IN_CDB,
                pid,
                requested,
            ));
        }
        requested
    };
    create_one(inner, pid, oid)?;
    if let Err(sense) = write_payload(inner, pid, oid, cdb, data_out) {
        rollback_created(inner, pid, &[oid]);
        return Err(sense);
    }
    inner.ccap.set(ObjectKind::UserObject, pid, oid, 0);
    Ok(Core {
        created: vec![oid],
        ..Core::default()
    })
}

fn do_create_partition(inner: &mut Inner, cdb: &Cdb<'_>) -> Result<Core, SenseData> {
    let requested = cdb.pid();
    if requested != 0 && requested < PARTITION_PID_LB {
        return Err(cdb_sense(requested, 0));
    }
    let pid = if requested == 0 {
        obj::next_pid(&inner.db).map_err(|e| store_sense(&e, 0, 0))?
    } else {
        requested
    };
    obj::insert(&mut inner.db, pid, 0, ObjectKind::Partition).map_err(|e| match e {
        StoreError::Exists => {
            SenseData::sdd(SenseKey::HardwareError, asc::INVALID_FIELD_IN_CDB, pid, 0)
        }
        other => store_sense(&other, pid, 0),
    })?;
    inner
        .stamp_ctime(pid, 0, ObjectKind::Partition)
        .map_err(|e| store_sense(&e, pid, 0))?;
    inner.ccap.set(ObjectKind::Partition, pid, 0, 0);
    Ok(Core {
        created_pid: Some(pid),
        ..Core::default()
    })
}

fn do_create_collection(inner: &mut Inner, cdb: &Cdb<'_>) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let requested = cdb.oid();
    if pid < PARTITION_PID_LB || (requested != 0 && requested < USEROBJECT_OID_LB) {
        return Err(cdb_sense(pid, requested));
    }
    require_kind(inner, pid, 0, ObjectKind::Partition)?;
    let cid = if requested == 0 {
        obj::next_oid(&inner.db, pid).map_err(|e| store_sense(&e, pid, 0))?
    } else {
        requested
    };
    obj::insert(&mut inner.db, pid, cid, ObjectKind::Collection)
        .map_err(|e| store_sense(&e, pid, cid))?;
    inner
        .stamp_ctime(pid, cid, ObjectKind::Collection)
        .map_err(|e| store_sense(&e, pid, cid))?;
    inner.ccap.set(ObjectKind::Collection, pid, cid, 0);
    Ok(Core {
        created: vec![cid],
        ..Core::default()
    })
}

fn do_read(inner: &mut Inner, cdb: &Cdb<'_>, data_out: &[u8]) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let oid = cdb.oid();
    let len = cdb.length();
    require_kind(inner, pid, oid, ObjectKind::UserObject)?;

    let (mut buf, expected, got) = match cdb.ddt() {
        ddt::CONTIG => {
            let mut buf = alloc_buf(len, pid, oid)?;
            let got = inner
                .data
                .read_contig(pid, oid, cdb.offset(), &mut buf)
                .map_err(|e| dataio_sense(&e, pid, oid))?;
            (buf, len, got)
        }
        ddt::SGL => {
            let sgl = SgList::parse(data_out).map_err(|e| directive_sense(e, pid, oid))?;
            let total = sgl.total_len();
            let mut buf = alloc_buf(total, pid, oid)?;
            let got = inner
                .data
                .read_sgl(pid, oid, cdb.offset(), &sgl.pairs, &mut buf)
                .map_err(|e| dataio_sense(&e, pid, oid))?;
            (buf, total, got)
        }
        ddt::VEC => {
            let hdr = StrideHeader::parse(data_out).map_err(|e| directive_sense(e, pid, oid))?;
            let mut buf = alloc_buf(len, pid, oid)?;
            let got = inner
                .data
                .read_sgl(pid, oid, cdb.offset(), &hdr.pairs(len), &mut buf)
                .map_err(|e| dataio_sense(&e, pid, oid))?;
            (buf, len, got)
        }
        _ => return Err(cdb_sense(pid, oid)),
    };

    let warn = (got < expected).then(|| {
        log::debug!("short read on ({pid:#x},{oid:#x}): {got} of {expected}");
        SenseData::sdd_csi(
            SenseKey::RecoveredError,
            asc::READ_PAST_END_OF_USER_OBJECT,
            pid,
            oid,
            got,
        )
    });
    buf.truncate(expected as usize);
    inner.ccap.set(ObjectKind::UserObject, pid, oid, 0);
    Ok(Core {
        data_in: buf,
        warn,
        ..Core::default()
    })
}

fn do_write(inner: &mut Inner, cdb: &Cdb<'_>, data_out: &[u8]) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let oid = cdb.oid();
    require_kind(inner, pid, oid, ObjectKind::UserObject)?;
    write_payload(inner, pid, oid, cdb, data_out)?;
    inner.ccap.set(ObjectKind::UserObject, pid, oid, 0);
    Ok(Core::default())
}

/// The shared WRITE / CREATE AND WRITE data path, honoring the data
/// distribution type.
fn write_payload(
    inner: &mut Inner,
    pid: u64,
    oid: u64,
    cdb: &Cdb<'_>,
    data_out: &[u8],
) -> Result<(), SenseData> {
    let len = cdb.length();
    let offset = cdb.offset();
    match cdb.ddt() {
        ddt::CONTIG => {
            let data = data_out
                .get(..len as usize)
                .ok_or_else(|| short_param_sense(pid, oid))?;
            inner
                .data
                .write_contig(pid, oid, offset, data)
                .map_err(|e| dataio_sense(&e, pid, oid))
        }
        ddt::SGL => {
            let sgl = SgList::parse(data_out).map_err(|e| directive_sense(e, pid, oid))?;
            let data = data_out
                .get(sgl.wire_len()..sgl.wire_len() + sgl.total_len() as usize)
                .ok_or_else(|| short_param_sense(pid, oid))?;
            inner
                .data
                .write_sgl(pid, oid, offset, &sgl.pairs, data)
                .map_err(|e| dataio_sense(&e, pid, oid))
        }
        ddt::VEC => {
            // The length field covers the 16-byte header plus the data.
            let hdr = StrideHeader::parse(data_out).map_err(|e| directive_sense(e, pid, oid))?;
            let data_len = len
                .checked_sub(StrideHeader::WIRE_LEN as u64)
                .ok_or_else(|| cdb_sense(pid, oid))?;
            let data = data_out
                .get(StrideHeader::WIRE_LEN..StrideHeader::WIRE_LEN + data_len as usize)
                .ok_or_else(|| short_param_sense(pid, oid))?;
            inner
                .data
                .write_sgl(pid, oid, offset, &hdr.pairs(data_len), data)
                .map_err(|e| dataio_sense(&e, pid, oid))
        }
        _ => Err(cdb_sense(pid, oid)),
    }
}

fn do_append(inner: &mut Inner, cdb: &Cdb<'_>, data_out: &[u8]) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let oid = cdb.oid();
    if cdb.ddt() != ddt::CONTIG {
        return Err(cdb_sense(pid, oid));
    }
    require_kind(inner, pid, oid, ObjectKind::UserObject)?;
    let eof = inner
        .data
        .logical_len(pid, oid)
        .map_err(|e| dataio_sense(&e, pid, oid))?;
    let data = data_out
        .get(..cdb.length() as usize)
        .ok_or_else(|| short_param_sense(pid, oid))?;
    inner
        .data
        .write_contig(pid, oid, eof, data)
        .map_err(|e| dataio_sense(&e, pid, oid))?;
    inner.ccap.set(ObjectKind::UserObject, pid, oid, eof);
    Ok(Core::default())
}

fn do_clear(inner: &mut Inner, cdb: &Cdb<'_>) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let oid = cdb.oid();
    require_kind(inner, pid, oid, ObjectKind::UserObject)?;
    let mut remaining = cdb.length();
    let mut offset = cdb.offset();
    let zeros = vec![0u8; (1 << 20).min(remaining as usize).max(1)];
    while remaining > 0 {
        let chunk = remaining.min(zeros.len() as u64);
        inner
            .data
            .write_contig(pid, oid, offset, &zeros[..chunk as usize])
            .map_err(|e| dataio_sense(&e, pid, oid))?;
        offset += chunk;
        remaining -= chunk;
    }
    inner.ccap.set(ObjectKind::UserObject, pid, oid, 0);
    Ok(Core::default())
}

fn do_remove(inner: &mut Inner, cdb: &Cdb<'_>) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let oid = cdb.oid();
    require_kind(inner, pid, oid, ObjectKind::UserObject)?;
    inner
        .data
        .remove(pid, oid)
        .map_err(|e| dataio_sense(&e, pid, oid))?;
    // Attributes go before the registry row so a crash never leaves
    // orphaned attributes behind a missing object.
    attr::delete_all(&mut inner.db, pid, oid).map_err(|e| store_sense(&e, pid, oid))?;
    obj::delete(&mut inner.db, pid, oid).map_err(|e| store_sense(&e, pid, oid))?;
    inner.ccap.set(ObjectKind::UserObject, pid, oid, 0);
    Ok(Core::default())
}

fn do_remove_collection(inner: &mut Inner, cdb: &Cdb<'_>) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let cid = cdb.oid();
    require_kind(inner, pid, cid, ObjectKind::Collection)?;
    if !coll::is_empty(&inner.db, pid, cid).map_err(|e| store_sense(&e, pid, cid))? {
        if !cdb.fcr() {
            return Err(SenseData::sdd(
                SenseKey::IllegalRequest,
                asc::PARTITION_OR_COLLECTION_CONTAINS_USER_OBJECTS,
                pid,
                cid,
            ));
        }
        coll::delete_all_for_cid(&mut inner.db, pid, cid)
            .map_err(|e| store_sense(&e, pid, cid))?;
    }
    attr::delete_all(&mut inner.db, pid, cid).map_err(|e| store_sense(&e, pid, cid))?;
    obj::delete(&mut inner.db, pid, cid).map_err(|e| store_sense(&e, pid, cid))?;
    inner.ccap.set(ObjectKind::Collection, pid, cid, 0);
    Ok(Core::default())
}

fn do_remove_partition(inner: &mut Inner, cdb: &Cdb<'_>) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    require_kind(inner, pid, 0, ObjectKind::Partition)?;
    if !obj::is_empty_partition(&inner.db, pid).map_err(|e| store_sense(&e, pid, 0))? {
        return Err(SenseData::sdd(
            SenseKey::IllegalRequest,
            asc::PARTITION_OR_COLLECTION_CONTAINS_USER_OBJECTS,
            pid,
            0,
        ));
    }
    attr::delete_all(&mut inner.db, pid, 0).map_err(|e| store_sense(&e, pid, 0))?;
    obj::delete_partition(&mut inner.db, pid).map_err(|e| store_sense(&e, pid, 0))?;
    inner.ccap.set(ObjectKind::Partition, pid, 0, 0);
    Ok(Core::default())
}

fn do_remove_member_objects(
    inner: &mut Inner,
    cdb: &Cdb<'_>,
    cancel: &CancelToken,
) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let cid = cdb.oid();
    require_kind(inner, pid, cid, ObjectKind::Collection)?;
    loop {
        if cancel.is_cancelled() {
            return Err(aborted(pid, cid));
        }
        let page = coll::members(&inner.db, pid, cid, 0, 256).map_err(|e| store_sense(&e, pid, cid))?;
        if page.ids.is_empty() {
            break;
        }
        for oid in page.ids {
            let _ = inner.data.remove(pid, oid);
            attr::delete_all(&mut inner.db, pid, oid).map_err(|e| store_sense(&e, pid, oid))?;
            obj::delete(&mut inner.db, pid, oid).map_err(|e| store_sense(&e, pid, oid))?;
        }
    }
    inner.ccap.set(ObjectKind::Collection, pid, cid, 0);
    Ok(Core::default())
}

fn do_format_osd(inner: &mut Inner, cdb: &Cdb<'_>) -> Result<Core, SenseData> {
    log::info!(
        "formatting target at {} (capacity hint {} MiB)",
        inner.root.display(),
        cdb.length() >> 20
    );
    inner.db.clear().map_err(|e| store_sense(&e, 0, 0))?;
    inner
        .data
        .clear()
        .map_err(|_| SenseData::sdd(SenseKey::HardwareError, asc::SYSTEM_RESOURCE_FAILURE, 0, 0))?;
    inner
        .db
        .meta_put("boot_epoch", &inner.boot_epoch.to_be_bytes())
        .map_err(|e| store_sense(&e, 0, 0))?;
    obj::insert(&mut inner.db, 0, 0, ObjectKind::Root).map_err(|e| store_sense(&e, 0, 0))?;
    inner
        .stamp_ctime(0, 0, ObjectKind::Root)
        .map_err(|e| store_sense(&e, 0, 0))?;
    inner.ccap.set(ObjectKind::Root, 0, 0, 0);
    Ok(Core::default())
}

fn do_flush(inner: &mut Inner, cdb: &Cdb<'_>) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let oid = cdb.oid();
    require_kind(inner, pid, oid, ObjectKind::UserObject)?;
    log::trace!("flush scope {} on ({pid:#x},{oid:#x})", cdb.flush_scope());
    inner
        .data
        .flush(pid, oid)
        .map_err(|e| dataio_sense(&e, pid, oid))?;
    inner.ccap.set(ObjectKind::UserObject, pid, oid, 0);
    Ok(Core::default())
}

fn do_flush_meta(
    inner: &mut Inner,
    cdb: &Cdb<'_>,
    action: ServiceAction,
) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let oid = cdb.oid();
    let kind = match action {
        ServiceAction::FlushCollection => {
            require_kind(inner, pid, oid, ObjectKind::Collection)?;
            ObjectKind::Collection
        }
        ServiceAction::FlushPartition => {
            require_kind(inner, pid, 0, ObjectKind::Partition)?;
            ObjectKind::Partition
        }
        _ => ObjectKind::Root,
    };
    inner.db.flush().map_err(|e| store_sense(&e, pid, oid))?;
    inner.ccap.set(kind, pid, oid, 0);
    Ok(Core::default())
}

fn do_attr_command(inner: &mut Inner, cdb: &Cdb<'_>) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let oid = cdb.oid();
    let kind = obj::kind(&inner.db, pid, oid).map_err(|e| store_sense(&e, pid, oid))?;
    inner.ccap.set(kind, pid, oid, 0);
    Ok(Core::default())
}

fn do_member_attr_command(inner: &mut Inner, cdb: &Cdb<'_>) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let cid = cdb.oid();
    require_kind(inner, pid, cid, ObjectKind::Collection)?;
    inner.ccap.set(ObjectKind::Collection, pid, cid, 0);
    Ok(Core::default())
}

fn do_list(inner: &mut Inner, cdb: &Cdb<'_>) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    if cdb.oid() != 0 {
        return Err(cdb_sense(pid, cdb.oid()));
    }
    let page = if pid == 0 {
        obj::list_pids(&inner.db, cdb.offset(), id_fit(cdb.length()))
    } else {
        require_kind(inner, pid, 0, ObjectKind::Partition)?;
        obj::list_oids(&inner.db, pid, cdb.offset(), id_fit(cdb.length()))
    }
    .map_err(|e| store_sense(&e, pid, 0))?;
    inner.ccap.set(
        if pid == 0 { ObjectKind::Root } else { ObjectKind::Partition },
        pid,
        0,
        0,
    );
    Ok(Core {
        data_in: pack_id_list(&page.ids, page.continuation, cdb.list_id(), pid == 0),
        ..Core::default()
    })
}

fn do_list_collection(inner: &mut Inner, cdb: &Cdb<'_>) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let cid = cdb.oid();
    let page = if cid == 0 {
        require_kind(inner, pid, 0, ObjectKind::Partition)?;
        obj::list_cids(&inner.db, pid, cdb.offset(), id_fit(cdb.length()))
    } else {
        require_kind(inner, pid, cid, ObjectKind::Collection)?;
        coll::members(&inner.db, pid, cid, cdb.offset(), id_fit(cdb.length()))
    }
    .map_err(|e| store_sense(&e, pid, cid))?;
    inner.ccap.set(ObjectKind::Collection, pid, cid, 0);
    Ok(Core {
        data_in: pack_id_list(&page.ids, page.continuation, cdb.list_id(), false),
        ..Core::default()
    })
}

/// Ids that fit the allocation length after the 24-byte list header.
fn id_fit(alloc_len: u64) -> usize {
    (alloc_len.saturating_sub(24) / 8).min(1 << 20) as usize
}

/// LIST / LIST COLLECTION output: additional length, continuation id, the
/// echoed list id, and a flags byte whose bit 0 marks a root-scope
/// (partition id) listing.
fn pack_id_list(ids: &[u64], continuation: Option<u64>, list_id: u32, root: bool) -> Vec<u8> {
    let mut out = vec![0u8; 24 + ids.len() * 8];
    set_u64(&mut out, 0, 16 + ids.len() as u64 * 8);
    set_u64(&mut out, 8, continuation.unwrap_or(0));
    set_u32(&mut out, 16, list_id);
    if root {
        out[23] |= 0x1;
    }
    for (i, oid) in ids.iter().enumerate() {
        set_u64(&mut out, 24 + i * 8, *oid);
    }
    out
}

fn do_query(inner: &mut Inner, cdb: &Cdb<'_>, data_out: &[u8]) -> Result<Core, SenseData> {
    let pid = cdb.pid();
    let cid = cdb.oid();
    require_kind(inner, pid, cid, ObjectKind::Collection)?;

    let qll = cdb.query_list_len() as usize;
    let region = data_out
        .get(..qll)
        .ok_or_else(|| short_param_sense(pid, cid))?;
    let query = parse_query_list(region).map_err(|_| param_list_sense(pid, cid, 0, 0))?;

    let mut matches = Vec::new();
    let mut cursor = 0;
    loop {
        let page = coll::members(&inner.db, pid, cid, cursor, 1024)
            .map_err(|e| store_sense(&e, pid, cid))?;
        for &oid in &page.ids {
            if query_matches(inner, pid, oid, &query)? {
                matches.push(oid);
            }
        }
        match page.continuation {
            Some(next) => cursor = next,
            None => break,
        }
    }
    log::debug!(
        "query on ({pid:#x},{cid:#x}): {} criteria, {} matches",
        query.criteria.len(),
        matches.len()
    );
    inner.ccap.set(ObjectKind::Collection, pid, cid, 0);
    Ok(Core {
        data_in: pack_matches(cdb.length(), &matches),
        ..Core::default()
    })
}

fn query_matches(
    inner: &Inner,
    pid: u64,
    oid: u64,
    query: &osdemu_proto::query::QueryList,
) -> Result<bool, SenseData> {
    if query.criteria.is_empty() {
        return Ok(true);
    }
    let mut any = false;
    for criterion in &query.criteria {
        let value = match attr::get_one(&inner.db, pid, oid, criterion.page, criterion.number) {
            Ok(v) => Some(v),
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(store_sense(&e, pid, oid)),
        };
        let hit = criterion.matches(value.as_deref());
        match query.op {
            QueryOp::Intersection if !hit => return Ok(false),
            QueryOp::Union if hit => any = true,
            _ => {}
        }
    }
    Ok(match query.op {
        QueryOp::Union => any,
        QueryOp::Intersection => true,
    })
}

/// Objects the embedded attribute directive applies to.
fn attr_targets(
    inner: &Inner,
    action: ServiceAction,
    cdb: &Cdb<'_>,
    core: &Core,
) -> Result<Vec<(u64, u64)>, SenseData> {
    use ServiceAction::*;
    Ok(match action {
        Create | CreateAndWrite | CreateCollection => {
            core.created.iter().map(|&oid| (cdb.pid(), oid)).collect()
        }
        CreatePartition => vec![(core.created_pid.unwrap_or(cdb.pid()), 0)],
        GetMemberAttributes | SetMemberAttributes => {
            let mut out = Vec::new();
            let mut cursor = 0;
            loop {
                let page = coll::members(&inner.db, cdb.pid(), cdb.oid(), cursor, 1024)
                    .map_err(|e| store_sense(&e, cdb.pid(), cdb.oid()))?;
                out.extend(page.ids.iter().map(|&oid| (cdb.pid(), oid)));
                match page.continuation {
                    Some(next) => cursor = next,
                    None => break,
                }
            }
            out
        }
        Remove | RemoveCollection | RemoveMemberObjects => Vec::new(),
        RemovePartition | FlushPartition | List => vec![(cdb.pid(), 0)],
        FormatOsd | FlushOsd => vec![(0, 0)],
        _ => vec![(cdb.pid(), cdb.oid())],
    })
}

/// Apply the embedded set-attribute directive to every target.
fn run_set(
    inner: &mut Inner,
    directive: &AttrDirective,
    data_out: &[u8],
    targets: &[(u64, u64)],
) -> Result<(), SenseData> {
    match directive {
        AttrDirective::None => Ok(()),
        AttrDirective::Page(dir) if dir.set_page != 0 => {
            let start = dir.set_value_off as usize;
            let value = &data_out[start..start + dir.set_len as usize];
            for &(pid, oid) in targets {
                facade::set_value(inner, pid, oid, dir.set_page, dir.set_number, value)?;
            }
            Ok(())
        }
        AttrDirective::Page(_) => Ok(()),
        AttrDirective::List(dir) if dir.set_list_len != 0 => {
            let entries = set_list_entries(dir, data_out, targets)?;
            for &(pid, oid) in targets {
                for (page, number, value) in &entries {
                    facade::set_value(inner, pid, oid, *page, *number, value)?;
                }
            }
            Ok(())
        }
        AttrDirective::List(_) => Ok(()),
    }
}

fn set_list_entries(
    dir: &ListDirective,
    data_out: &[u8],
    targets: &[(u64, u64)],
) -> Result<Vec<(u32, u32, Vec<u8>)>, SenseData> {
    let (pid, oid) = targets.first().copied().unwrap_or((0, 0));
    let start = dir.set_list_off as usize;
    let region = &data_out[start..start + dir.set_list_len as usize];
    if region.len() < LIST_HDR_LEN {
        return Err(short_param_sense(pid, oid));
    }
    let body_len = get_u32(region, 4) as usize;
    let body = region
        .get(LIST_HDR_LEN..LIST_HDR_LEN + body_len)
        .ok_or_else(|| short_param_sense(pid, oid))?;
    let entries = parse_set_list(body).map_err(|_| param_list_sense(pid, oid, 0, 0))?;
    Ok(entries
        .into_iter()
        .map(|e| (e.page, e.number, e.value.to_vec()))
        .collect())
}

/// Serialize the embedded get-attribute directive into the data-in buffer.
fn run_get(
    inner: &mut Inner,
    cdb: &Cdb<'_>,
    directive: &AttrDirective,
    data_out: &[u8],
    targets: &[(u64, u64)],
    multi: bool,
    data_in: &mut Vec<u8>,
) -> Result<(), SenseData> {
    match directive {
        AttrDirective::None => Ok(()),
        AttrDirective::Page(dir) => run_get_page(inner, cdb, dir, targets, data_in),
        AttrDirective::List(dir) => run_get_list(inner, dir, data_out, targets, multi, data_in),
    }
}

fn run_get_page(
    inner: &mut Inner,
    cdb: &Cdb<'_>,
    dir: &PageDirective,
    targets: &[(u64, u64)],
    data_in: &mut Vec<u8>,
) -> Result<(), SenseData> {
    if dir.get_page == 0 || dir.get_alloc_len == 0 {
        return Ok(());
    }
    let alloc = (dir.get_alloc_len as usize).min(MAX_RETRIEVED_ALLOC);
    let (pid, oid) = targets.first().copied().unwrap_or((cdb.pid(), cdb.oid()));

    if dir.get_page == CUR_CMD_ATTR_PG {
        let page = ccap_page(&inner.ccap);
        let used = alloc.min(page.len());
        splice(data_in, dir.retrieved_off as usize, &page[..used]);
        return Ok(());
    }

    // Any other page comes back in the retrieved-attributes list format.
    let mut scratch = vec![0u8; alloc];
    let Ok(mut list) = RetrievedList::new(&mut scratch, ListFormat::SetAttr) else {
        return Ok(());
    };
    for entry in get_shape(inner, pid, oid, dir.get_page, ATTRNUM_GETALL)? {
        if matches!(
            list.push(oid, entry.page, entry.number, &entry.value),
            Err(ListError::Overflow)
        ) {
            break;
        }
    }
    let used = list.finish();
    splice(data_in, dir.retrieved_off as usize, &scratch[..used]);
    Ok(())
}

fn run_get_list(
    inner: &mut Inner,
    dir: &ListDirective,
    data_out: &[u8],
    targets: &[(u64, u64)],
    multi: bool,
    data_in: &mut Vec<u8>,
) -> Result<(), SenseData> {
    if dir.get_list_len == 0 || dir.retrieved_alloc_len == 0 {
        return Ok(());
    }
    let (epid, eoid) = targets.first().copied().unwrap_or((0, 0));
    let start = dir.get_list_off as usize;
    let region = &data_out[start..start + dir.get_list_len as usize];
    if region.len() < LIST_HDR_LEN {
        return Err(short_param_sense(epid, eoid));
    }
    let body_len = get_u32(region, 4) as usize;
    let body = region
        .get(LIST_HDR_LEN..LIST_HDR_LEN + body_len)
        .ok_or_else(|| short_param_sense(epid, eoid))?;
    let pairs = parse_get_list(body).map_err(|_| param_list_sense(epid, eoid, 0, 0))?;

    let format = if multi || targets.len() > 1 {
        ListFormat::MultiObj
    } else {
        ListFormat::SetAttr
    };
    let alloc = (dir.retrieved_alloc_len as usize).min(MAX_RETRIEVED_ALLOC);
    let mut scratch = vec![0u8; alloc];
    let Ok(mut list) = RetrievedList::new(&mut scratch, format) else {
        return Ok(());
    };
    'outer: for &(pid, oid) in targets {
        for &(page, number) in &pairs {
            for entry in get_shape(inner, pid, oid, page, number)? {
                if matches!(
                    list.push(oid, entry.page, entry.number, &entry.value),
                    Err(ListError::Overflow)
                ) {
                    break 'outer;
                }
            }
        }
    }
    let used = list.finish();
    splice(data_in, dir.retrieved_off as usize, &scratch[..used]);
    Ok(())
}

/// Resolve one (page, number) request into the entries it stands for:
/// a single attribute, a whole page, a directory page, one number across
/// all pages, everything, or the current-command page.
fn get_shape(
    inner: &Inner,
    pid: u64,
    oid: u64,
    page: u32,
    number: u32,
) -> Result<Vec<osdemu_store::AttrEntry>, SenseData> {
    use osdemu_store::AttrEntry;
    if page == CUR_CMD_ATTR_PG {
        return Ok(ccap_entries(&inner.ccap, number));
    }
    if page == GETALLATTR_PG {
        return attr::get_all(&inner.db, pid, oid).map_err(|e| store_sense(&e, pid, oid));
    }
    if number == ATTRNUM_GETALL {
        return if is_dir_page(page) {
            attr::get_dir_page(&inner.db, pid, oid, page).map_err(|e| store_sense(&e, pid, oid))
        } else {
            facade::page_entries(inner, pid, oid, page).map_err(|e| store_sense(&e, pid, oid))
        };
    }
    if page == ANY_PG {
        return attr::get_for_all_pages(&inner.db, pid, oid, number)
            .map_err(|e| store_sense(&e, pid, oid));
    }
    let value = facade::get_value(inner, pid, oid, page, number)
        .map_err(|e| store_sense(&e, pid, oid))?;
    // Undefined attributes come back as zero-length entries.
    Ok(vec![AttrEntry {
        page,
        number,
        value: value.unwrap_or_default(),
    }])
}

/// The fixed 56-byte page-format image of the current-command page.
fn ccap_page(ccap: &crate::Ccap) -> [u8; ccap_def::TOTAL_LEN] {
    let mut out = [0u8; ccap_def::TOTAL_LEN];
    set_u32(&mut out, 0, CUR_CMD_ATTR_PG);
    set_u32(&mut out, 4, (ccap_def::TOTAL_LEN - 8) as u32);
    out[ccap_def::RICV_OFF..ccap_def::RICV_OFF + ccap_def::RICV_LEN].copy_from_slice(&ccap.ricv);
    out[ccap_def::OBJT_OFF] = ccap.object_type;
    set_u64(&mut out, ccap_def::PID_OFF, ccap.pid);
    set_u64(&mut out, ccap_def::OID_OFF, ccap.oid);
    set_u64(&mut out, ccap_def::APPADDR_OFF, ccap.append_offset);
    out
}

fn ccap_entries(ccap: &crate::Ccap, number: u32) -> Vec<osdemu_store::AttrEntry> {
    use osdemu_store::AttrEntry;
    let entry = |number: u32, value: Vec<u8>| AttrEntry {
        page: CUR_CMD_ATTR_PG,
        number,
        value,
    };
    let all = [
        (ATTRNUM_INFO, {
            let mut name = vec![0u8; osdemu_proto::defs::ATTR_PAGE_ID_LEN];
            name[..28].copy_from_slice(b"INCITS  T10 Current Command ");
            name
        }),
        (ccap_def::RICV, ccap.ricv.to_vec()),
        (ccap_def::OBJT, vec![ccap.object_type]),
        (ccap_def::PID, ccap.pid.to_be_bytes().to_vec()),
        (ccap_def::OID, ccap.oid.to_be_bytes().to_vec()),
        (ccap_def::APPADDR, ccap.append_offset.to_be_bytes().to_vec()),
    ];
    if number == ATTRNUM_GETALL {
        all.into_iter().map(|(n, v)| entry(n, v)).collect()
    } else {
        all.into_iter()
            .filter(|(n, _)| *n == number)
            .map(|(n, v)| entry(n, v))
            .collect()
    }
}

/// Write `bytes` into the data-in buffer at `off`, zero-padding any gap
/// and keeping whatever already lies beyond the written range.
fn splice(data_in: &mut Vec<u8>, off: usize, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    if data_in.len() < off + bytes.len() {
        data_in.resize(off + bytes.len(), 0);
    }
    data_in[off..off + bytes.len()].copy_from_slice(bytes);
}

fn alloc_buf(len: u64, pid: u64, oid: u64) -> Result<Vec<u8>, SenseData> {
    if len > (1 << 30) {
        return Err(cdb_sense(pid, oid));
    }
    Ok(vec![0u8; len as usize])
}

fn require_kind(inner: &Inner, pid: u64, oid: u64, want: ObjectKind) -> Result<(), SenseData> {
    match obj::kind(&inner.db, pid, oid) {
        Ok(kind) if kind == want => Ok(()),
        Ok(_) => Err(cdb_sense(pid, oid)),
        Err(e) => Err(store_sense(&e, pid, oid)),
    }
}

fn cdb_sense(pid: u64, oid: u64) -> SenseData {
    SenseData::sdd(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB, pid, oid)
}

fn short_param_sense(pid: u64, oid: u64) -> SenseData {
    SenseData::sdd(
        SenseKey::IllegalRequest,
        asc::PARAMETER_LIST_LENGTH_ERROR,
        pid,
        oid,
    )
}

fn aborted(pid: u64, oid: u64) -> SenseData {
    SenseData::sdd(SenseKey::AbortedCommand, 0x0000, pid, oid)
}

fn directive_sense(err: CdbError, pid: u64, oid: u64) -> SenseData {
    match err {
        CdbError::ShortParameterList => short_param_sense(pid, oid),
        CdbError::BadDirective => param_list_sense(pid, oid, 0, 0),
        _ => cdb_sense(pid, oid),
    }
}

fn dataio_sense(err: &DataIoError, pid: u64, oid: u64) -> SenseData {
    match err {
        DataIoError::InvalidId { .. } | DataIoError::NoObject { .. } => cdb_sense(pid, oid),
        DataIoError::Exists { .. } => {
            SenseData::sdd(SenseKey::HardwareError, asc::INVALID_FIELD_IN_CDB, pid, oid)
        }
        DataIoError::Io(_) => {
            SenseData::sdd(SenseKey::HardwareError, asc::SYSTEM_RESOURCE_FAILURE, pid, oid)
        }
    }
}
