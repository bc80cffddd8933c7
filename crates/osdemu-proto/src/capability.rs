//! Capability parsing and authorization masks, osd2r01 sec 4.9.
//!
//! Every CDB embeds a capability at byte 80 describing what the holder may
//! do: which kinds of object, which operations, which descriptor scope, and
//! optionally which byte range of which object. Cryptographic verification
//! of the capability (the security-parameters MAC) is out of scope; the
//! fields are parsed and the authorization masks enforced.

use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::defs::ServiceAction;
use crate::endian::get_u48;

/// Offset of the capability within the CDB.
pub const CAP_OFF: usize = 80;
/// Serialized size of a v2 capability.
pub const CAP_LEN: usize = 104;

bitflags::bitflags! {
    /// Object-type bits, osd2r00 sec 4.9.2.2.1 table 9. A capability may
    /// authorize several kinds at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectType: u8 {
        const ROOT       = 0x01;
        const PARTITION  = 0x02;
        const COLLECTION = 0x40;
        const USER       = 0x80;
    }
}

bitflags::bitflags! {
    /// Permission bits from the first two bytes of the 5-byte permissions
    /// bit mask. Bits 8 and 9 are reserved.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u16 {
        const APPEND   = 1 << 0;
        const OBJ_MGMT = 1 << 1;
        const REMOVE   = 1 << 2;
        const CREATE   = 1 << 3;
        const SET_ATTR = 1 << 4;
        const GET_ATTR = 1 << 5;
        const WRITE    = 1 << 6;
        const READ     = 1 << 7;
        const GBL_REM  = 1 << 10;
        const QUERY    = 1 << 11;
        const M_OBJECT = 1 << 12;
        const POL_SEC  = 1 << 13;
        const GLOBAL   = 1 << 14;
        const DEV_MGMT = 1 << 15;
    }
}

bitflags::bitflags! {
    /// Object-descriptor type, high nibble of capability byte 55. The
    /// numeric values (1 = object, 2 = partition/root, 3 = collection) are
    /// tested by mask intersection, so a collection descriptor also
    /// satisfies object- and partition-scoped requirements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorType: u8 {
        const OBJ = 0x10;
        const PAR = 0x20;
        const COL = 0x30;
    }
}

/// Wire layout of the v2 capability, field order per osd2r01 sec 4.9.2.2.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone)]
#[repr(C)]
pub struct RawCapability {
    pub format: u8,
    pub integrity_alg_key_version: u8,
    pub security_method: u8,
    reserved1: u8,
    pub expiration_time: [u8; 6],
    pub audit: [u8; 20],
    pub discriminator: [u8; 12],
    pub object_created_time: [u8; 6],
    pub object_type: u8,
    pub permissions_bit_mask: [u8; 5],
    reserved2: u8,
    pub object_descriptor_type: u8,
    pub allowed_attributes_access: U32,
    pub policy_access_tag: U32,
    pub boot_epoch: U16,
    reserved3: [u8; 6],
    pub allowed_partition_id: U64,
    pub allowed_object_id: U64,
    pub allowed_range_length: U64,
    pub allowed_range_start: U64,
}

/// A parsed capability with typed accessors over the raw fields.
#[derive(Clone)]
pub struct Capability {
    raw: RawCapability,
}

impl Capability {
    /// Parse the capability region of a CDB (or any 104-byte capability
    /// image).
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let raw = RawCapability::read_from_bytes(bytes.get(..CAP_LEN)?).ok()?;
        Some(Self { raw })
    }

    pub fn raw(&self) -> &RawCapability {
        &self.raw
    }

    /// Expiration, milliseconds since the epoch (48-bit).
    pub fn expiration_ms(&self) -> u64 {
        get_u48(&self.raw.expiration_time, 0)
    }

    /// Creation time of the object the capability was minted for; zero is a
    /// wildcard in the time-version check.
    pub fn object_created_ms(&self) -> u64 {
        get_u48(&self.raw.object_created_time, 0)
    }

    pub fn object_type(&self) -> ObjectType {
        ObjectType::from_bits_truncate(self.raw.object_type)
    }

    pub fn permissions(&self) -> Permissions {
        let bits =
            self.raw.permissions_bit_mask[0] as u16 | (self.raw.permissions_bit_mask[1] as u16) << 8;
        Permissions::from_bits_truncate(bits)
    }

    pub fn descriptor_type(&self) -> DescriptorType {
        DescriptorType::from_bits_truncate(self.raw.object_descriptor_type & 0xF0)
    }

    pub fn boot_epoch(&self) -> u16 {
        self.raw.boot_epoch.get()
    }

    /// True once `now_ms` has passed the capability's expiration.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expiration_ms()
    }

    /// Authorization test against a permission rule: each required mask must
    /// intersect the capability's corresponding field.
    pub fn allows(&self, rule: &PermissionRule) -> bool {
        self.object_type().intersects(rule.object_type)
            && self.permissions().intersects(rule.permissions)
            && self.descriptor_type().intersects(rule.descriptor)
    }

    /// Data-range containment. Ignored (true) when the capability carries
    /// no range; a length of `u64::MAX` means unlimited. The caller also
    /// waives the check for commands addressed to `oid = 0` (device and
    /// partition capabilities carry no data range).
    pub fn permits_data_range(&self, start: u64, len: u64) -> bool {
        let cap_len = self.raw.allowed_range_length.get();
        if cap_len == 0 {
            return true;
        }
        if cap_len == u64::MAX {
            return true;
        }
        let cap_start = self.raw.allowed_range_start.get();
        if start < cap_start {
            return false;
        }
        cap_len >= len && cap_len - len >= start - cap_start
    }
}

impl core::fmt::Debug for Capability {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Capability")
            .field("object_type", &self.object_type())
            .field("permissions", &self.permissions())
            .field("descriptor_type", &self.descriptor_type())
            .field("expiration_ms", &self.expiration_ms())
            .field("object_created_ms", &self.object_created_ms())
            .field("boot_epoch", &self.boot_epoch())
            .finish()
    }
}

/// Required masks for one service action.
#[derive(Debug, Clone, Copy)]
pub struct PermissionRule {
    pub object_type: ObjectType,
    pub permissions: Permissions,
    pub descriptor: DescriptorType,
}

const fn rule(
    object_type: ObjectType,
    permissions: Permissions,
    descriptor: DescriptorType,
) -> PermissionRule {
    PermissionRule {
        object_type,
        permissions,
        descriptor,
    }
}

/// Static action-to-masks table, osd2r01 table 26. Replaces the macro-built
/// table of older targets with a plain match.
pub fn permission_rule(action: ServiceAction) -> PermissionRule {
    use ServiceAction::*;
    let any_type = ObjectType::ROOT
        .union(ObjectType::PARTITION)
        .union(ObjectType::COLLECTION)
        .union(ObjectType::USER);
    let any_desc = DescriptorType::OBJ
        .union(DescriptorType::PAR)
        .union(DescriptorType::COL);
    match action {
        Append => rule(ObjectType::USER, Permissions::APPEND, DescriptorType::OBJ),
        Clear => rule(ObjectType::USER, Permissions::WRITE, DescriptorType::OBJ),
        Create => rule(ObjectType::USER, Permissions::CREATE, DescriptorType::OBJ),
        CreateAndWrite => rule(
            ObjectType::USER,
            Permissions::CREATE.union(Permissions::WRITE),
            DescriptorType::OBJ,
        ),
        CreateCollection => rule(
            ObjectType::COLLECTION,
            Permissions::CREATE,
            DescriptorType::COL,
        ),
        CreatePartition => rule(
            ObjectType::PARTITION,
            Permissions::CREATE,
            DescriptorType::PAR,
        ),
        Flush => rule(ObjectType::USER, Permissions::OBJ_MGMT, DescriptorType::OBJ),
        FlushCollection => rule(
            ObjectType::COLLECTION,
            Permissions::OBJ_MGMT,
            DescriptorType::COL,
        ),
        FlushOsd => rule(ObjectType::ROOT, Permissions::OBJ_MGMT, DescriptorType::PAR),
        FlushPartition => rule(
            ObjectType::PARTITION,
            Permissions::OBJ_MGMT,
            DescriptorType::PAR,
        ),
        FormatOsd => rule(
            ObjectType::ROOT,
            Permissions::OBJ_MGMT.union(Permissions::GLOBAL),
            DescriptorType::PAR,
        ),
        GetAttributes | GetMemberAttributes => rule(any_type, Permissions::GET_ATTR, any_desc),
        List => rule(
            ObjectType::ROOT,
            Permissions::READ.union(Permissions::M_OBJECT),
            DescriptorType::PAR,
        ),
        ListCollection => rule(ObjectType::COLLECTION, Permissions::READ, DescriptorType::COL),
        Query => rule(
            ObjectType::COLLECTION,
            Permissions::WRITE.union(Permissions::QUERY),
            DescriptorType::COL,
        ),
        Read => rule(ObjectType::USER, Permissions::READ, DescriptorType::OBJ),
        Remove => rule(ObjectType::USER, Permissions::REMOVE, DescriptorType::OBJ),
        RemoveCollection => rule(
            ObjectType::COLLECTION,
            Permissions::REMOVE,
            DescriptorType::COL,
        ),
        RemoveMemberObjects => rule(
            ObjectType::COLLECTION,
            Permissions::REMOVE.union(Permissions::M_OBJECT),
            DescriptorType::COL,
        ),
        RemovePartition => rule(
            ObjectType::PARTITION,
            Permissions::REMOVE.union(Permissions::GBL_REM),
            DescriptorType::PAR,
        ),
        SetAttributes => rule(any_type, Permissions::SET_ATTR, any_desc),
        SetMemberAttributes => rule(
            ObjectType::COLLECTION,
            Permissions::SET_ATTR,
            DescriptorType::COL,
        ),
        Write => rule(ObjectType::USER, Permissions::WRITE, DescriptorType::OBJ),
    }
}

/// Builds capability images for the initiator side (tests, CLI). The
/// default is a fully permissive capability with a far-future expiration,
/// which is what a NOSEC initiator hands to a target that does not verify
/// MACs.
#[derive(Clone)]
pub struct CapabilityBuilder {
    raw: RawCapability,
}

impl Default for CapabilityBuilder {
    fn default() -> Self {
        let mut raw = RawCapability::read_from_bytes(&[0u8; CAP_LEN]).unwrap();
        raw.format = 0x2;
        raw.expiration_time = [0xFF; 6];
        raw.object_type = ObjectType::all().bits();
        let perms = Permissions::all().bits();
        raw.permissions_bit_mask[0] = (perms & 0xFF) as u8;
        raw.permissions_bit_mask[1] = (perms >> 8) as u8;
        raw.object_descriptor_type = DescriptorType::COL.bits();
        Self { raw }
    }
}

impl CapabilityBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expiration_ms(mut self, ms: u64) -> Self {
        crate::endian::set_u48(&mut self.raw.expiration_time, 0, ms);
        self
    }

    pub fn object_created_ms(mut self, ms: u64) -> Self {
        crate::endian::set_u48(&mut self.raw.object_created_time, 0, ms);
        self
    }

    pub fn object_type(mut self, types: ObjectType) -> Self {
        self.raw.object_type = types.bits();
        self
    }

    pub fn permissions(mut self, perms: Permissions) -> Self {
        self.raw.permissions_bit_mask = [0; 5];
        self.raw.permissions_bit_mask[0] = (perms.bits() & 0xFF) as u8;
        self.raw.permissions_bit_mask[1] = (perms.bits() >> 8) as u8;
        self
    }

    pub fn descriptor_type(mut self, desc: DescriptorType) -> Self {
        self.raw.object_descriptor_type = desc.bits();
        self
    }

    pub fn boot_epoch(mut self, epoch: u16) -> Self {
        self.raw.boot_epoch.set(epoch);
        self
    }

    pub fn allowed_object(mut self, pid: u64, oid: u64) -> Self {
        self.raw.allowed_partition_id.set(pid);
        self.raw.allowed_object_id.set(oid);
        self
    }

    pub fn allowed_range(mut self, start: u64, length: u64) -> Self {
        self.raw.allowed_range_start.set(start);
        self.raw.allowed_range_length.set(length);
        self
    }

    pub fn build(self) -> [u8; CAP_LEN] {
        let mut out = [0u8; CAP_LEN];
        out.copy_from_slice(self.raw.as_bytes());
        out
    }
}
