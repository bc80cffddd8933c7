//! CDB envelope decoding, osd2r01 sec 5.2.
//!
//! The OSD command set rides in a 200-byte variable-length CDB. Fixed
//! fields sit at fixed offsets; bytes 52-79 are interpreted according to the
//! get/set attribute format selector in byte 11 (page format or list
//! format). The capability occupies bytes 80-183; the trailing security
//! parameters are not interpreted here (MAC checking is out of scope).

use crate::capability::{CAP_LEN, CAP_OFF, Capability};
use crate::defs::{
    GETLIST_SETLIST, GETPAGE_SETVALUE, OSD_ADDITIONAL_CDB_LEN, OSD_CDB_SIZE, ServiceAction,
    VARLEN_CDB,
};
use crate::endian::{get_u16, get_u32, get_u64};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CdbError {
    #[error("CDB is not a 200-byte OSD variable-length CDB")]
    BadEnvelope,
    #[error("service action {0:#06x} is not implemented")]
    UnknownAction(u16),
    #[error("invalid field in CDB")]
    InvalidField,
    #[error("embedded attribute directive is malformed")]
    BadDirective,
    #[error("data-out buffer is shorter than the CDB describes")]
    ShortParameterList,
}

/// Page-format directive (selector 0x20): one page retrieved whole, one
/// attribute set inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageDirective {
    pub get_page: u32,
    pub get_alloc_len: u32,
    /// Where the retrieved page lands in the data-in buffer.
    pub retrieved_off: u32,
    pub set_page: u32,
    pub set_number: u32,
    pub set_len: u32,
    /// Where the value to set starts in the data-out buffer.
    pub set_value_off: u32,
}

/// List-format directive (selector 0x30): byte ranges of the data-out
/// buffer holding a get list and a set list, and the data-in range that
/// receives the retrieved list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListDirective {
    pub get_list_len: u32,
    pub get_list_off: u32,
    pub retrieved_alloc_len: u32,
    pub retrieved_off: u32,
    pub set_list_len: u32,
    pub set_list_off: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrDirective {
    None,
    Page(PageDirective),
    List(ListDirective),
}

impl AttrDirective {
    /// True when the directive asks the target to set anything.
    pub fn sets_attributes(&self) -> bool {
        match self {
            AttrDirective::None => false,
            AttrDirective::Page(p) => p.set_page != 0,
            AttrDirective::List(l) => l.set_list_len != 0,
        }
    }
}

/// A validated view over a 200-byte CDB.
#[derive(Clone, Copy, Debug)]
pub struct Cdb<'a> {
    raw: &'a [u8; OSD_CDB_SIZE],
}

impl<'a> Cdb<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, CdbError> {
        let raw: &[u8; OSD_CDB_SIZE] =
            bytes.try_into().map_err(|_| CdbError::BadEnvelope)?;
        if raw[0] != VARLEN_CDB || raw[7] != OSD_ADDITIONAL_CDB_LEN {
            return Err(CdbError::BadEnvelope);
        }
        Ok(Self { raw })
    }

    pub fn action_code(&self) -> u16 {
        get_u16(self.raw, 8)
    }

    pub fn action(&self) -> Result<ServiceAction, CdbError> {
        ServiceAction::from_code(self.action_code())
            .ok_or(CdbError::UnknownAction(self.action_code()))
    }

    /// Byte 10: flush scope for the flush family, data distribution type for
    /// the data path, force-collection-removal bit for REMOVE COLLECTION.
    pub fn options_byte(&self) -> u8 {
        self.raw[10]
    }

    pub fn ddt(&self) -> u8 {
        self.raw[10] & 0x3
    }

    pub fn flush_scope(&self) -> u8 {
        self.raw[10] & 0x3
    }

    /// Force collection removal flag (REMOVE COLLECTION).
    pub fn fcr(&self) -> bool {
        self.raw[10] & 0x1 != 0
    }

    pub fn getset_format(&self) -> u8 {
        self.raw[11] & 0xF0
    }

    pub fn pid(&self) -> u64 {
        get_u64(self.raw, 16)
    }

    /// Object id; also the collection id or the requested id of the
    /// create family, depending on the action.
    pub fn oid(&self) -> u64 {
        get_u64(self.raw, 24)
    }

    /// List id for LIST/LIST COLLECTION; the get-page for the page-format
    /// directive.
    pub fn list_id(&self) -> u32 {
        get_u32(self.raw, 32)
    }

    pub fn length(&self) -> u64 {
        get_u64(self.raw, 36)
    }

    pub fn offset(&self) -> u64 {
        get_u64(self.raw, 44)
    }

    /// CREATE object count, carried in the low 16 bits of the length field.
    pub fn create_num(&self) -> Result<u16, CdbError> {
        let len = self.length();
        if len > u16::MAX as u64 {
            return Err(CdbError::InvalidField);
        }
        Ok(len as u16)
    }

    /// Query list length (QUERY only), carried in the set-number field.
    pub fn query_list_len(&self) -> u32 {
        get_u32(self.raw, 52)
    }

    pub fn capability_bytes(&self) -> &'a [u8] {
        &self.raw[CAP_OFF..CAP_OFF + CAP_LEN]
    }

    pub fn capability(&self) -> Result<Capability, CdbError> {
        Capability::parse(self.capability_bytes()).ok_or(CdbError::InvalidField)
    }

    /// Decode the embedded get/set attribute directive. A directive whose
    /// byte ranges fall outside `data_out` is rejected here so the
    /// dispatcher never chases wild offsets.
    pub fn attr_directive(&self, data_out_len: usize) -> Result<AttrDirective, CdbError> {
        match self.getset_format() {
            GETPAGE_SETVALUE => {
                let dir = PageDirective {
                    get_page: get_u32(self.raw, 32),
                    get_alloc_len: get_u32(self.raw, 56),
                    retrieved_off: get_u32(self.raw, 60),
                    set_page: get_u32(self.raw, 64),
                    set_number: get_u32(self.raw, 52),
                    set_len: get_u32(self.raw, 68),
                    set_value_off: get_u32(self.raw, 72),
                };
                if dir.set_page != 0 {
                    if dir.set_len > u16::MAX as u32 {
                        return Err(CdbError::BadDirective);
                    }
                    let end = dir.set_value_off as u64 + dir.set_len as u64;
                    if end > data_out_len as u64 {
                        return Err(CdbError::ShortParameterList);
                    }
                }
                if dir.get_page == 0 && dir.set_page == 0 {
                    Ok(AttrDirective::None)
                } else {
                    Ok(AttrDirective::Page(dir))
                }
            }
            GETLIST_SETLIST => {
                let dir = ListDirective {
                    get_list_len: get_u32(self.raw, 56),
                    get_list_off: get_u32(self.raw, 60),
                    retrieved_alloc_len: get_u32(self.raw, 64),
                    retrieved_off: get_u32(self.raw, 68),
                    set_list_len: get_u32(self.raw, 72),
                    set_list_off: get_u32(self.raw, 76),
                };
                for (len, off) in [
                    (dir.get_list_len, dir.get_list_off),
                    (dir.set_list_len, dir.set_list_off),
                ] {
                    if len != 0 && (off as u64 + len as u64) > data_out_len as u64 {
                        return Err(CdbError::ShortParameterList);
                    }
                }
                if dir.get_list_len == 0 && dir.set_list_len == 0 {
                    Ok(AttrDirective::None)
                } else {
                    Ok(AttrDirective::List(dir))
                }
            }
            0 => Ok(AttrDirective::None),
            _ => Err(CdbError::BadDirective),
        }
    }
}

/// Scatter/gather list parsed off the front of a data-out buffer:
/// an entry count followed by (offset, length) pairs, all u64 big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgList {
    pub pairs: Vec<(u64, u64)>,
}

impl SgList {
    /// Bytes the serialized list occupies at the head of the buffer.
    pub fn wire_len(&self) -> usize {
        8 + self.pairs.len() * 16
    }

    /// Sum of the segment lengths.
    pub fn total_len(&self) -> u64 {
        self.pairs.iter().map(|&(_, len)| len).sum()
    }

    pub fn parse(buf: &[u8]) -> Result<Self, CdbError> {
        if buf.len() < 8 {
            return Err(CdbError::ShortParameterList);
        }
        let count = get_u64(buf, 0);
        let need = 8u64
            .checked_add(count.checked_mul(16).ok_or(CdbError::InvalidField)?)
            .ok_or(CdbError::InvalidField)?;
        if need > buf.len() as u64 {
            return Err(CdbError::ShortParameterList);
        }
        let mut pairs = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let off = get_u64(buf, 8 + i * 16);
            let len = get_u64(buf, 16 + i * 16);
            pairs.push((off, len));
        }
        if pairs.is_empty() {
            return Err(CdbError::InvalidField);
        }
        Ok(Self { pairs })
    }
}

/// Strided I/O header: stride and segment length lead the data-out buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrideHeader {
    pub stride: u64,
    pub segment_len: u64,
}

impl StrideHeader {
    pub const WIRE_LEN: usize = 16;

    pub fn parse(buf: &[u8]) -> Result<Self, CdbError> {
        if buf.len() < Self::WIRE_LEN {
            return Err(CdbError::ShortParameterList);
        }
        let hdr = Self {
            stride: get_u64(buf, 0),
            segment_len: get_u64(buf, 8),
        };
        if hdr.segment_len == 0 || hdr.stride < hdr.segment_len {
            return Err(CdbError::InvalidField);
        }
        Ok(hdr)
    }

    /// Generate the (offset, length) pairs covering `total` bytes; the last
    /// segment may be short.
    pub fn pairs(&self, total: u64) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let mut remaining = total;
        let mut offset = 0;
        while remaining > 0 {
            let len = remaining.min(self.segment_len);
            out.push((offset, len));
            remaining -= len;
            offset += self.stride;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::CdbBuilder;
    use pretty_assertions::assert_eq;

    #[test]
    fn envelope_is_checked() {
        assert_eq!(Cdb::parse(&[0u8; 16]).unwrap_err(), CdbError::BadEnvelope);
        let mut raw = [0u8; OSD_CDB_SIZE];
        raw[0] = VARLEN_CDB;
        assert_eq!(Cdb::parse(&raw).unwrap_err(), CdbError::BadEnvelope);
        raw[7] = OSD_ADDITIONAL_CDB_LEN;
        assert!(Cdb::parse(&raw).is_ok());
    }

    #[test]
    fn fields_round_trip_through_builder() {
        let (raw, dout) = CdbBuilder::write(0x10000, 0x10007, 4196, b"xyz".to_vec()).finish();
        let cdb = Cdb::parse(&raw).unwrap();
        assert_eq!(cdb.action().unwrap(), ServiceAction::Write);
        assert_eq!(cdb.pid(), 0x10000);
        assert_eq!(cdb.oid(), 0x10007);
        assert_eq!(cdb.length(), 3);
        assert_eq!(cdb.offset(), 4196);
        assert_eq!(dout, b"xyz");
    }

    #[test]
    fn unknown_action_is_reported_with_its_code() {
        let mut raw = [0u8; OSD_CDB_SIZE];
        raw[0] = VARLEN_CDB;
        raw[7] = OSD_ADDITIONAL_CDB_LEN;
        raw[8] = 0x8f;
        raw[9] = 0x7c;
        let cdb = Cdb::parse(&raw).unwrap();
        assert_eq!(cdb.action().unwrap_err(), CdbError::UnknownAction(0x8f7c));
    }

    #[test]
    fn list_directive_bounds_are_validated() {
        let (raw, dout) = CdbBuilder::get_attributes(0x10000, 0x10000)
            .get_attr_list(&[(0x10000, 1)], 512)
            .finish();
        let cdb = Cdb::parse(&raw).unwrap();
        match cdb.attr_directive(dout.len()).unwrap() {
            AttrDirective::List(l) => {
                assert_eq!(l.get_list_len, 8 + 8);
                assert_eq!(l.retrieved_alloc_len, 512);
            }
            other => panic!("expected list directive, got {other:?}"),
        }
        // Claim a longer list than the data-out buffer carries.
        assert_eq!(
            cdb.attr_directive(4).unwrap_err(),
            CdbError::ShortParameterList
        );
    }

    #[test]
    fn sg_list_parses_pairs() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u64.to_be_bytes());
        for pair in [(0u64, 10u64), (100, 20)] {
            buf.extend_from_slice(&pair.0.to_be_bytes());
            buf.extend_from_slice(&pair.1.to_be_bytes());
        }
        let sgl = SgList::parse(&buf).unwrap();
        assert_eq!(sgl.pairs, vec![(0, 10), (100, 20)]);
        assert_eq!(sgl.total_len(), 30);
        assert_eq!(sgl.wire_len(), 40);
        assert!(SgList::parse(&buf[..20]).is_err());
    }

    #[test]
    fn stride_pairs_never_overrun() {
        let hdr = StrideHeader {
            stride: 100,
            segment_len: 30,
        };
        assert_eq!(hdr.pairs(70), vec![(0, 30), (100, 30), (200, 10)]);
        assert_eq!(hdr.pairs(0), vec![]);

        let mut buf = Vec::new();
        buf.extend_from_slice(&10u64.to_be_bytes());
        buf.extend_from_slice(&30u64.to_be_bytes());
        assert_eq!(
            StrideHeader::parse(&buf).unwrap_err(),
            CdbError::InvalidField
        );
    }
}
