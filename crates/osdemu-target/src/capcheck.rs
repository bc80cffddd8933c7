//! Capability authorization against stored state.
//!
//! The pure pieces (field parsing, mask intersection, data-range window)
//! live in `osdemu-proto`; this module adds the checks that need the
//! store: the boot-epoch equality test and the time-version test against
//! the target entity's stored creation timestamp.

use osdemu_proto::capability::permission_rule;
use osdemu_proto::cdb::Cdb;
use osdemu_proto::defs::{ObjectKind, ServiceAction};
use osdemu_proto::sense::{SenseData, SenseKey, asc};

use crate::{Inner, now_ms};

/// Run the full capability check sequence for one command. `io_range` is
/// the byte window a data command will touch; pass `None` for commands
/// without a data payload.
pub(crate) fn check(
    inner: &Inner,
    cdb: &Cdb<'_>,
    action: ServiceAction,
    io_range: Option<(u64, u64)>,
) -> Result<(), SenseData> {
    let pid = cdb.pid();
    let oid = cdb.oid();
    let cap = cdb
        .capability()
        .map_err(|_| SenseData::sdd(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB, pid, oid))?;

    if cap.is_expired(now_ms()) {
        log::debug!("capability expired for action {action:?} on ({pid:#x},{oid:#x})");
        return Err(SenseData::sdd(
            SenseKey::DataProtect,
            asc::CAPABILITY_EXPIRED,
            pid,
            oid,
        ));
    }

    if cap.boot_epoch() != 0 && cap.boot_epoch() != inner.boot_epoch {
        log::debug!(
            "boot epoch mismatch: capability {} device {}",
            cap.boot_epoch(),
            inner.boot_epoch
        );
        return Err(mismatch(pid, oid));
    }

    let rule = permission_rule(action);
    if !cap.allows(&rule) {
        log::debug!(
            "capability mismatch for {action:?}: have {:?}/{:?}/{:?}",
            cap.object_type(),
            cap.permissions(),
            cap.descriptor_type()
        );
        return Err(mismatch(pid, oid));
    }

    // The created object does not exist yet, so there is no stored time to
    // compare against.
    if !action.creates_target() {
        check_time_version(inner, &cap, pid, oid)?;
    }

    if let Some((start, len)) = io_range {
        // Device- and partition-scoped commands carry no data range.
        if oid != 0 && !cap.permits_data_range(start, len) {
            log::debug!(
                "data range [{start}, +{len}) outside capability window on ({pid:#x},{oid:#x})"
            );
            return Err(mismatch(pid, oid));
        }
    }

    Ok(())
}

/// The capability's object-created-time must match the stored creation
/// timestamp of the addressed entity; zero in the capability is a
/// wildcard. An entity that is absent (or predates timestamping) passes;
/// presence is the core operation's concern.
fn check_time_version(
    inner: &Inner,
    cap: &osdemu_proto::Capability,
    pid: u64,
    oid: u64,
) -> Result<(), SenseData> {
    let cap_time = cap.object_created_ms();
    if cap_time == 0 {
        return Ok(());
    }
    let kind = if pid == 0 {
        ObjectKind::Root
    } else if oid == 0 {
        ObjectKind::Partition
    } else {
        match osdemu_store::obj::kind(&inner.db, pid, oid) {
            Ok(kind) => kind,
            Err(_) => return Ok(()),
        }
    };
    match inner.ctime_ms(pid, oid, kind) {
        Some(created) if created != cap_time => {
            log::debug!(
                "time-version mismatch on ({pid:#x},{oid:#x}): stored {created} capability {cap_time}"
            );
            Err(mismatch(pid, oid))
        }
        _ => Ok(()),
    }
}

fn mismatch(pid: u64, oid: u64) -> SenseData {
    SenseData::sdd(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB, pid, oid)
}
