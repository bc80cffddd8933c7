//! Descriptor-format sense construction, SPC-3 sec 4.5 + osd2r01 sec 4.14.
//!
//! Every failed (or warned) command answers with a sense buffer: an 8-byte
//! header naming the sense key and ASC/ASCQ, followed by descriptors. This
//! target emits the OSD error-identification descriptor on every sense, a
//! command-specific-information descriptor when a command has a CSI value
//! (e.g. the short length of a read past end-of-object), and an attribute
//! identification descriptor when specific attributes are to blame.

use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::defs::OSD_MAX_SENSE;
use crate::endian::{get_u16, get_u64};

/// Response code for current errors, descriptor format.
pub const SENSE_CURRENT_DESC: u8 = 0x72;
/// Response code for deferred errors, descriptor format.
pub const SENSE_DEFERRED_DESC: u8 = 0x73;

const DESC_CSI: u8 = 0x01;
const DESC_OSD_ERR_ID: u8 = 0x06;
const DESC_OSD_ATTR_ID: u8 = 0x08;

/// Sense keys, SPC-3 table 27.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SenseKey {
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    AbortedCommand = 0x0B,
}

/// Additional sense code / qualifier pairs used by this target, SPC-3
/// table 28 and osd2r01 secs 4-7.
pub mod asc {
    pub const INVALID_COMMAND_OPERATION_CODE: u16 = 0x2000;
    pub const INVALID_FIELD_IN_CDB: u16 = 0x2400;
    pub const INVALID_FIELD_IN_PARAMETER_LIST: u16 = 0x2600;
    pub const PARAMETER_LIST_LENGTH_ERROR: u16 = 0x1A00;
    pub const LOGICAL_UNIT_NOT_READY_FORMAT_IN_PROGRESS: u16 = 0x0404;
    pub const NONCE_NOT_UNIQUE: u16 = 0x2406;
    pub const PARTITION_OR_COLLECTION_CONTAINS_USER_OBJECTS: u16 = 0x2C0A;
    pub const READ_PAST_END_OF_USER_OBJECT: u16 = 0x3B17;
    pub const CAPABILITY_EXPIRED: u16 = 0x2A04;
    pub const QUOTA_ERROR: u16 = 0x5507;
    pub const SYSTEM_RESOURCE_FAILURE: u16 = 0x5500;
}

/// OSD error identification sense data descriptor, osd2r01 sec 4.14.2.1.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct ErrIdDescriptor {
    key: u8,
    add_len: u8,
    reserved: [u8; 6],
    not_initiated_cmd_funcs: U32,
    completed_cmd_funcs: U32,
    pid: U64,
    oid: U64,
}

/// Command-specific information descriptor, SPC-3 sec 4.5.2.3.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct CsiDescriptor {
    key: u8,
    add_len: u8,
    valid: u8,
    reserved: u8,
    info: U64,
}

/// A sense buffer under construction. `finish` yields the serialized bytes,
/// clamped to [`OSD_MAX_SENSE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    key: SenseKey,
    asc: u16,
    descriptors: Vec<u8>,
}

impl SenseData {
    pub fn new(key: SenseKey, asc: u16) -> Self {
        Self {
            key,
            asc,
            descriptors: Vec::new(),
        }
    }

    /// Sense with the OSD error-identification descriptor naming the
    /// offending object.
    pub fn sdd(key: SenseKey, asc: u16, pid: u64, oid: u64) -> Self {
        let mut sense = Self::new(key, asc);
        sense.push_err_id(pid, oid);
        sense
    }

    /// Like [`SenseData::sdd`] with a command-specific-information value
    /// appended, e.g. the byte count actually returned by a short read.
    pub fn sdd_csi(key: SenseKey, asc: u16, pid: u64, oid: u64, csi: u64) -> Self {
        let mut sense = Self::sdd(key, asc, pid, oid);
        sense.push_csi(csi);
        sense
    }

    pub fn key(&self) -> SenseKey {
        self.key
    }

    pub fn asc(&self) -> u16 {
        self.asc
    }

    fn push_err_id(&mut self, pid: u64, oid: u64) {
        let desc = ErrIdDescriptor {
            key: DESC_OSD_ERR_ID,
            add_len: 0x1E,
            reserved: [0; 6],
            not_initiated_cmd_funcs: U32::ZERO,
            completed_cmd_funcs: U32::ZERO,
            pid: U64::new(pid),
            oid: U64::new(oid),
        };
        self.descriptors.extend_from_slice(desc.as_bytes());
    }

    fn push_csi(&mut self, csi: u64) {
        let desc = CsiDescriptor {
            key: DESC_CSI,
            add_len: 0x0A,
            valid: 0x80,
            reserved: 0,
            info: U64::new(csi),
        };
        self.descriptors.extend_from_slice(desc.as_bytes());
    }

    /// Append an OSD attribute-identification descriptor listing the
    /// offending (page, number) pairs.
    pub fn push_attr_id(&mut self, attrs: &[(u32, u32)]) {
        if attrs.is_empty() {
            return;
        }
        let add_len = (attrs.len() * 8 + 2) as u8;
        self.descriptors
            .extend_from_slice(&[DESC_OSD_ATTR_ID, add_len, 0, 0]);
        for &(page, number) in attrs {
            self.descriptors.extend_from_slice(&page.to_be_bytes());
            self.descriptors.extend_from_slice(&number.to_be_bytes());
        }
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.descriptors.len());
        buf.push(SENSE_CURRENT_DESC);
        buf.push(self.key as u8);
        buf.extend_from_slice(&self.asc.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0]);
        buf.push(self.descriptors.len().min(244) as u8);
        buf.extend_from_slice(&self.descriptors);
        buf.truncate(OSD_MAX_SENSE);
        buf
    }
}

/// Read the sense key out of a serialized sense buffer.
pub fn sense_key(buf: &[u8]) -> Option<u8> {
    if buf.len() < 8 || (buf[0] & 0x7E) != 0x72 {
        return None;
    }
    Some(buf[1] & 0x0F)
}

/// Read the ASC/ASCQ pair out of a serialized sense buffer.
pub fn sense_asc(buf: &[u8]) -> Option<u16> {
    if buf.len() < 8 || (buf[0] & 0x7E) != 0x72 {
        return None;
    }
    Some(get_u16(buf, 2))
}

/// Walk the descriptors of a serialized sense buffer and return the
/// command-specific-information value, if present.
pub fn sense_csi(buf: &[u8]) -> Option<u64> {
    find_descriptor(buf, DESC_CSI).map(|d| get_u64(d, 4))
}

/// Return the (pid, oid) named by the OSD error-identification descriptor.
pub fn sense_object(buf: &[u8]) -> Option<(u64, u64)> {
    find_descriptor(buf, DESC_OSD_ERR_ID).map(|d| (get_u64(d, 16), get_u64(d, 24)))
}

fn find_descriptor(buf: &[u8], key: u8) -> Option<&[u8]> {
    if buf.len() < 8 {
        return None;
    }
    let add_len = buf[7] as usize;
    let mut off = 8;
    let end = (8 + add_len).min(buf.len());
    while off + 2 <= end {
        let desc_len = buf[off + 1] as usize + 2;
        if off + desc_len > end {
            return None;
        }
        if buf[off] == key {
            return Some(&buf[off..off + desc_len]);
        }
        off += desc_len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use static_assertions::const_assert_eq;

    const_assert_eq!(core::mem::size_of::<ErrIdDescriptor>(), 32);
    const_assert_eq!(core::mem::size_of::<CsiDescriptor>(), 12);

    #[test]
    fn sdd_layout() {
        let buf = SenseData::sdd(
            SenseKey::IllegalRequest,
            asc::INVALID_FIELD_IN_CDB,
            0x10000,
            0x10001,
        )
        .finish();
        assert_eq!(buf[0], SENSE_CURRENT_DESC);
        assert_eq!(sense_key(&buf), Some(SenseKey::IllegalRequest as u8));
        assert_eq!(sense_asc(&buf), Some(0x2400));
        assert_eq!(sense_object(&buf), Some((0x10000, 0x10001)));
        assert_eq!(sense_csi(&buf), None);
    }

    #[test]
    fn csi_descriptor_found_after_err_id() {
        let buf = SenseData::sdd_csi(
            SenseKey::RecoveredError,
            asc::READ_PAST_END_OF_USER_OBJECT,
            0x10000,
            0x10000,
            150,
        )
        .finish();
        assert_eq!(sense_key(&buf), Some(SenseKey::RecoveredError as u8));
        assert_eq!(sense_asc(&buf), Some(0x3B17));
        assert_eq!(sense_csi(&buf), Some(150));
    }

    #[test]
    fn attr_id_descriptor() {
        let mut sense = SenseData::sdd(
            SenseKey::IllegalRequest,
            asc::INVALID_FIELD_IN_PARAMETER_LIST,
            0,
            0,
        );
        sense.push_attr_id(&[(0x10000, 7)]);
        let buf = sense.finish();
        let desc = find_descriptor(&buf, DESC_OSD_ATTR_ID).unwrap();
        assert_eq!(get_u64(desc, 4) >> 32, 0x10000);
    }

    #[test]
    fn never_longer_than_max_sense() {
        let mut sense = SenseData::sdd(SenseKey::HardwareError, asc::SYSTEM_RESOURCE_FAILURE, 0, 0);
        sense.push_attr_id(&(0..28).map(|i| (i, i)).collect::<Vec<_>>());
        assert!(sense.finish().len() <= OSD_MAX_SENSE);
    }
}
