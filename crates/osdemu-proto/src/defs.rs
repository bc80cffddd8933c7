//! Constants shared by the OSD target and initiator sides.
//!
//! Section references in this module are to T10 OSD-2 (osd2r01) unless noted.

/// First byte of every variable-length CDB.
pub const VARLEN_CDB: u8 = 0x7f;
/// Total CDB size for the OSD command set.
pub const OSD_CDB_SIZE: usize = 200;
/// Value of the additional-CDB-length byte (CDB byte 7).
pub const OSD_ADDITIONAL_CDB_LEN: u8 = 192;
/// Upper bound on a sense buffer, header included.
pub const OSD_MAX_SENSE: usize = 252;

/// Service actions, osd2r01 sec 6.
///
/// Unlisted actions (key management, task management, snapshots) are not
/// implemented by this target and answer with invalid-opcode sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ServiceAction {
    FormatOsd = 0x8881,
    Create = 0x8882,
    List = 0x8883,
    Read = 0x8885,
    Write = 0x8886,
    Append = 0x8887,
    Flush = 0x8888,
    Clear = 0x8889,
    Remove = 0x888a,
    CreatePartition = 0x888b,
    RemovePartition = 0x888c,
    GetAttributes = 0x888e,
    SetAttributes = 0x888f,
    CreateAndWrite = 0x8892,
    CreateCollection = 0x8895,
    RemoveCollection = 0x8896,
    ListCollection = 0x8897,
    FlushCollection = 0x889a,
    FlushPartition = 0x889b,
    FlushOsd = 0x889c,
    Query = 0x88a0,
    RemoveMemberObjects = 0x88a1,
    GetMemberAttributes = 0x88a2,
    SetMemberAttributes = 0x88a3,
}

impl ServiceAction {
    pub fn from_code(code: u16) -> Option<Self> {
        use ServiceAction::*;
        Some(match code {
            0x8881 => FormatOsd,
            0x8882 => Create,
            0x8883 => List,
            0x8885 => Read,
            0x8886 => Write,
            0x8887 => Append,
            0x8888 => Flush,
            0x8889 => Clear,
            0x888a => Remove,
            0x888b => CreatePartition,
            0x888c => RemovePartition,
            0x888e => GetAttributes,
            0x888f => SetAttributes,
            0x8892 => CreateAndWrite,
            0x8895 => CreateCollection,
            0x8896 => RemoveCollection,
            0x8897 => ListCollection,
            0x889a => FlushCollection,
            0x889b => FlushPartition,
            0x889c => FlushOsd,
            0x88a0 => Query,
            0x88a1 => RemoveMemberObjects,
            0x88a2 => GetMemberAttributes,
            0x88a3 => SetMemberAttributes,
            _ => return None,
        })
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Actions whose target does not exist before the command runs.
    /// The capability time-version check is skipped for these.
    pub fn creates_target(self) -> bool {
        matches!(
            self,
            ServiceAction::Create
                | ServiceAction::CreateAndWrite
                | ServiceAction::CreatePartition
                | ServiceAction::CreateCollection
        )
    }

    /// Actions that destroy their target. An embedded set-attribute
    /// directive on these is rejected.
    pub fn removes_target(self) -> bool {
        matches!(
            self,
            ServiceAction::Remove
                | ServiceAction::RemoveCollection
                | ServiceAction::RemovePartition
                | ServiceAction::RemoveMemberObjects
        )
    }
}

/// SCSI status codes returned with every command response.
pub mod status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
}

/// Data distribution types for the data-in/data-out buffers (CDB byte 10,
/// low two bits, on the data-path commands).
pub mod ddt {
    /// Single contiguous extent.
    pub const CONTIG: u8 = 0x0;
    /// Scatter/gather: (offset, length) pairs lead the data-out buffer.
    pub const SGL: u8 = 0x1;
    /// Strided: a (stride, segment length) header generates the pairs.
    pub const VEC: u8 = 0x2;
}

/// Object constants, osd2r01 sec 4.6.2.
pub const ROOT_PID: u64 = 0;
pub const ROOT_OID: u64 = 0;
pub const PARTITION_PID_LB: u64 = 0x10000;
pub const PARTITION_OID: u64 = 0;
pub const USEROBJECT_PID_LB: u64 = 0x10000;
pub const USEROBJECT_OID_LB: u64 = 0x10000;
pub const COLLECTION_OID_LB: u64 = USEROBJECT_OID_LB;

/// Largest batch a single CREATE may allocate.
pub const CREATE_MAX_NUM: u16 = u16::MAX;

/// Attribute page ranges, osd2r01 sec 4.7.3. Pages are scoped by the kind
/// of object they may be attached to.
pub const USEROBJECT_PG: u32 = 0x0;
pub const PARTITION_PG: u32 = 0x3000_0000;
pub const COLLECTION_PG: u32 = 0x6000_0000;
pub const ROOT_PG: u32 = 0x9000_0000;
pub const RESERVED_PG: u32 = 0xC000_0000;
pub const ANY_PG: u32 = 0xF000_0000;
pub const CUR_CMD_ATTR_PG: u32 = 0xFFFF_FFFE;
pub const GETALLATTR_PG: u32 = 0xFFFF_FFFF;

/// Width of one page scope; `scope_base + PG_SCOPE_LEN` is the first page of
/// the next scope.
pub const PG_SCOPE_LEN: u32 = 0x3000_0000;

/// Vendor-assigned sub-ranges within each scope, osd2r01 sec 4.7.3.
pub const LUN_PG_LB: u32 = 0x10000;
pub const LUN_PG_UB: u32 = 0x1FFF_FFFF;
pub const VEND_PG_LB: u32 = 0x2000_0000;
pub const VEND_PG_UB: u32 = 0x2FFF_FFFF;
/// Standard pages at the bottom of each scope.
pub const STD_PG_UB: u32 = 0xFFFF;

/// Attribute numbers, osd2r01 sec 4.7.4.
pub const ATTRNUM_INFO: u32 = 0x0;
pub const ATTRNUM_UNMODIFIABLE: u32 = 0xFFFF_FFFF;
pub const ATTRNUM_GETALL: u32 = ATTRNUM_UNMODIFIABLE;

/// Every attribute page reserves number 0 for a 40-byte page name,
/// NUL-terminated.
pub const ATTR_PAGE_ID_LEN: usize = 40;

/// Directory pages sit at offset 0 of each scope, osd2r00 sec 4.7.5.
pub const USEROBJECT_DIR_PG: u32 = USEROBJECT_PG;
pub const PARTITION_DIR_PG: u32 = PARTITION_PG;
pub const COLLECTION_DIR_PG: u32 = COLLECTION_PG;
pub const ROOT_DIR_PG: u32 = ROOT_PG;

/// Standard user-object pages, osd2r01 sec 7.1.2.1.
pub const USER_DIR_PG: u32 = 0x0;
pub const USER_INFO_PG: u32 = 0x1;
pub const USER_TMSTMP_PG: u32 = 0x3;
pub const USER_COLL_PG: u32 = 0x4;

/// Timestamp page of each scope (`scope base + 0x3`); attribute 0x1 of the
/// page is the 6-byte creation time in milliseconds.
pub const TMSTMP_PG_OFFSET: u32 = 0x3;
pub const UTSAP_CTIME: u32 = 0x1;
pub const UTSAP_CTIME_LEN: usize = 6;

/// User-object information page attributes, osd2r01 sec 7.1.2.11.
pub mod uiap {
    pub const PID: u32 = 0x1;
    pub const OID: u32 = 0x2;
    pub const USERNAME: u32 = 0x9;
    pub const USED_CAPACITY: u32 = 0x81;
    pub const LOGICAL_LEN: u32 = 0x82;

    pub const PID_LEN: usize = 8;
    pub const OID_LEN: usize = 8;
    pub const USED_CAPACITY_LEN: usize = 8;
    pub const LOGICAL_LEN_LEN: usize = 8;
}

/// Root information page (`ROOT_PG + 1`) attributes, osd2r01 sec 7.1.2.8.
pub const ROOT_INFO_PG: u32 = ROOT_PG + 0x1;
/// Partition information page (`PARTITION_PG + 1`).
pub const PARTITION_INFO_PG: u32 = PARTITION_PG + 0x1;

pub mod riap {
    pub const OSD_SYSTEM_ID: u32 = 0x3;
    pub const VENDOR_IDENTIFICATION: u32 = 0x4;
    pub const PRODUCT_IDENTIFICATION: u32 = 0x5;
    pub const PRODUCT_MODEL: u32 = 0x6;
    pub const PRODUCT_REVISION_LEVEL: u32 = 0x7;
    pub const PRODUCT_SERIAL_NUMBER: u32 = 0x8;
    pub const OSD_NAME: u32 = 0x9;
    pub const TOTAL_CAPACITY: u32 = 0x80;
    pub const USED_CAPACITY: u32 = 0x81;
    pub const NUMBER_OF_PARTITIONS: u32 = 0xC0;
    pub const CLOCK: u32 = 0x100;

    pub const OSD_SYSTEM_ID_LEN: usize = 20;
    pub const TOTAL_CAPACITY_LEN: usize = 8;
    pub const USED_CAPACITY_LEN: usize = 8;
    pub const NUMBER_OF_PARTITIONS_LEN: usize = 8;
    pub const CLOCK_LEN: usize = 6;
}

/// Current command attributes page layout, osd2r01 sec 7.1.2.24.
/// The page is synthesized per command; when retrieved in page format it is
/// a fixed 56-byte block.
pub mod ccap {
    pub const RICV: u32 = 0x1;
    pub const OBJT: u32 = 0x2;
    pub const PID: u32 = 0x3;
    pub const OID: u32 = 0x4;
    pub const APPADDR: u32 = 0x5;

    pub const RICV_LEN: usize = 20;

    /// Offsets within the page-format block (page number and length occupy
    /// the first 8 bytes).
    pub const RICV_OFF: usize = 8;
    pub const OBJT_OFF: usize = 28;
    pub const PID_OFF: usize = 32;
    pub const OID_OFF: usize = 40;
    pub const APPADDR_OFF: usize = 48;
    pub const TOTAL_LEN: usize = 56;
}

/// Get/set attribute format selector values (CDB byte 11).
pub const GETPAGE_SETVALUE: u8 = 0x20;
pub const GETLIST_SETLIST: u8 = 0x30;

/// Kind of an entry in the object registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    Root = 0x01,
    Partition = 0x02,
    Collection = 0x40,
    UserObject = 0x80,
}

impl ObjectKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x01 => ObjectKind::Root,
            0x02 => ObjectKind::Partition,
            0x40 => ObjectKind::Collection,
            0x80 => ObjectKind::UserObject,
            _ => return None,
        })
    }

    /// Base of the attribute page scope for this kind of object.
    pub fn page_scope(self) -> u32 {
        match self {
            ObjectKind::Root => ROOT_PG,
            ObjectKind::Partition => PARTITION_PG,
            ObjectKind::Collection => COLLECTION_PG,
            ObjectKind::UserObject => USEROBJECT_PG,
        }
    }

    /// Timestamp page for this kind; attribute [`UTSAP_CTIME`] holds the
    /// creation time.
    pub fn timestamp_page(self) -> u32 {
        self.page_scope() + TMSTMP_PG_OFFSET
    }
}

/// The 40-byte name a directory page reports for pages that carry no name
/// attribute. Includes the terminating NUL.
pub const UNIDENTIFIED_PAGE_NAME: &[u8; ATTR_PAGE_ID_LEN] =
    b"        unidentified attributes page   \0";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_codes_round_trip() {
        for code in 0x8880..0x88b0u16 {
            if let Some(action) = ServiceAction::from_code(code) {
                assert_eq!(action.code(), code);
            }
        }
        assert_eq!(ServiceAction::from_code(0x8884), None);
        assert_eq!(
            ServiceAction::from_code(0x888a),
            Some(ServiceAction::Remove)
        );
    }

    #[test]
    fn unidentified_page_name_is_40_bytes_nul_terminated() {
        assert_eq!(UNIDENTIFIED_PAGE_NAME.len(), ATTR_PAGE_ID_LEN);
        assert_eq!(UNIDENTIFIED_PAGE_NAME[ATTR_PAGE_ID_LEN - 1], 0);
    }

    #[test]
    fn page_scopes() {
        assert_eq!(ObjectKind::UserObject.timestamp_page(), 0x3);
        assert_eq!(ObjectKind::Partition.timestamp_page(), 0x3000_0003);
        assert_eq!(ObjectKind::Collection.timestamp_page(), 0x6000_0003);
        assert_eq!(ObjectKind::Root.timestamp_page(), 0x9000_0003);
    }
}
