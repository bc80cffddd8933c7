//! Attribute list codec, osd2r01 sec 7.1.3.
//!
//! Every get-attribute path serializes into one of two entry shapes behind a
//! common 8-byte header: the set-attribute list (page, number, length,
//! value) and the multi-object list, which prepends the owning object id so
//! one command can return attributes of several objects.
//!
//! Entries are zero-padded so the next entry starts on an 8-byte boundary.
//! Request (get) lists are plain (page, number) pairs with no padding.

use crate::endian::{get_u16, get_u32, get_u64, pad8, set_u16, set_u32, set_u64};

/// List type codes carried in byte 0 of the header.
pub const LIST_TYPE_GET: u8 = 0x1;
pub const LIST_TYPE_RETRIEVED: u8 = 0x9;
pub const LIST_TYPE_RETRIEVED_MULTIOBJ: u8 = 0xE;

pub const LIST_HDR_LEN: usize = 8;

/// Offsets within a set-attr list entry.
pub const LE_PAGE_OFF: usize = 0;
pub const LE_NUMBER_OFF: usize = 4;
pub const LE_LEN_OFF: usize = 8;
pub const LE_VAL_OFF: usize = 10;

/// Offsets within a multi-object list entry.
pub const MLE_OID_OFF: usize = 0;
pub const MLE_PAGE_OFF: usize = 8;
pub const MLE_NUMBER_OFF: usize = 12;
pub const MLE_LEN_OFF: usize = 16;
pub const MLE_VAL_OFF: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ListError {
    /// Not enough room in the output buffer for the entry being packed.
    #[error("no room left in the attribute list buffer")]
    Overflow,
    /// Malformed input: oversized value, misaligned or truncated list.
    #[error("malformed attribute list")]
    Invalid,
}

/// Which retrieved-entry shape a list uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFormat {
    /// `page, number, length, value` entries (list type 0x9).
    SetAttr,
    /// `oid, page, number, length, value` entries (list type 0xE).
    MultiObj,
}

impl ListFormat {
    pub fn list_type(self) -> u8 {
        match self {
            ListFormat::SetAttr => LIST_TYPE_RETRIEVED,
            ListFormat::MultiObj => LIST_TYPE_RETRIEVED_MULTIOBJ,
        }
    }
}

/// Pack one set-attr entry at the start of `buf`.
///
/// Returns the padded entry size on success, [`ListError::Overflow`] if the
/// buffer cannot hold the whole entry, [`ListError::Invalid`] if the value is
/// longer than an attribute may be.
pub fn pack_attr(
    buf: &mut [u8],
    page: u32,
    number: u32,
    value: &[u8],
) -> Result<usize, ListError> {
    if value.len() > u16::MAX as usize {
        return Err(ListError::Invalid);
    }
    let raw = LE_VAL_OFF + value.len();
    let total = raw + pad8(raw);
    if buf.len() < total {
        return Err(ListError::Overflow);
    }
    set_u32(buf, LE_PAGE_OFF, page);
    set_u32(buf, LE_NUMBER_OFF, number);
    set_u16(buf, LE_LEN_OFF, value.len() as u16);
    buf[LE_VAL_OFF..raw].copy_from_slice(value);
    buf[raw..total].fill(0);
    Ok(total)
}

/// Pack one multi-object entry at the start of `buf`. Same contract as
/// [`pack_attr`].
pub fn pack_multiobj_attr(
    buf: &mut [u8],
    oid: u64,
    page: u32,
    number: u32,
    value: &[u8],
) -> Result<usize, ListError> {
    if value.len() > u16::MAX as usize {
        return Err(ListError::Invalid);
    }
    let raw = MLE_VAL_OFF + value.len();
    let total = raw + pad8(raw);
    if buf.len() < total {
        return Err(ListError::Overflow);
    }
    set_u64(buf, MLE_OID_OFF, oid);
    set_u32(buf, MLE_PAGE_OFF, page);
    set_u32(buf, MLE_NUMBER_OFF, number);
    set_u16(buf, MLE_LEN_OFF, value.len() as u16);
    buf[MLE_VAL_OFF..raw].copy_from_slice(value);
    buf[raw..total].fill(0);
    Ok(total)
}

/// Accumulates retrieved attributes into a caller-provided buffer, header
/// first.
///
/// The first entry that does not fit stops the accumulation: [`push`]
/// reports the overflow and further pushes are ignored, matching the packer
/// contract (the caller decides whether a truncated list is an error).
/// `used()` is zero only if no entry was packed.
///
/// [`push`]: RetrievedList::push
pub struct RetrievedList<'a> {
    buf: &'a mut [u8],
    format: ListFormat,
    used: usize,
    overflowed: bool,
}

impl<'a> RetrievedList<'a> {
    /// `buf` must hold at least the 8-byte header.
    pub fn new(buf: &'a mut [u8], format: ListFormat) -> Result<Self, ListError> {
        if buf.len() < LIST_HDR_LEN {
            return Err(ListError::Overflow);
        }
        Ok(Self {
            buf,
            format,
            used: LIST_HDR_LEN,
            overflowed: false,
        })
    }

    pub fn push(&mut self, oid: u64, page: u32, number: u32, value: &[u8]) -> Result<(), ListError> {
        if self.overflowed {
            return Err(ListError::Overflow);
        }
        let dst = &mut self.buf[self.used..];
        let packed = match self.format {
            ListFormat::SetAttr => pack_attr(dst, page, number, value),
            ListFormat::MultiObj => pack_multiobj_attr(dst, oid, page, number, value),
        };
        match packed {
            Ok(n) => {
                self.used += n;
                Ok(())
            }
            Err(ListError::Overflow) => {
                self.overflowed = true;
                Err(ListError::Overflow)
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.used == LIST_HDR_LEN
    }

    /// Write the header and return the number of bytes used, zero when no
    /// entry was packed.
    pub fn finish(self) -> usize {
        if self.is_empty() {
            return 0;
        }
        self.buf[0] = self.format.list_type();
        self.buf[1..4].fill(0);
        set_u32(self.buf, 4, (self.used - LIST_HDR_LEN) as u32);
        self.used
    }
}

/// One parsed retrieved/set-attr entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrListEntry<'a> {
    pub oid: Option<u64>,
    pub page: u32,
    pub number: u32,
    pub value: &'a [u8],
}

/// Iterate the (page, number) pairs of a get-attributes request list.
/// The slice is the list body without the 8-byte header.
pub fn parse_get_list(body: &[u8]) -> Result<Vec<(u32, u32)>, ListError> {
    if body.len() % 8 != 0 {
        return Err(ListError::Invalid);
    }
    let mut out = Vec::with_capacity(body.len() / 8);
    for chunk in body.chunks_exact(8) {
        out.push((get_u32(chunk, 0), get_u32(chunk, 4)));
    }
    Ok(out)
}

/// Iterate the entries of a set-attributes list (without the header),
/// validating lengths and 8-byte entry alignment.
pub fn parse_set_list(body: &[u8]) -> Result<Vec<AttrListEntry<'_>>, ListError> {
    let mut out = Vec::new();
    let mut off = 0;
    while off < body.len() {
        // A run of padding closes the list; entries always start aligned.
        if body.len() - off < LE_VAL_OFF {
            if body[off..].iter().all(|b| *b == 0) {
                break;
            }
            return Err(ListError::Invalid);
        }
        let page = get_u32(body, off + LE_PAGE_OFF);
        let number = get_u32(body, off + LE_NUMBER_OFF);
        let len = get_u16(body, off + LE_LEN_OFF) as usize;
        if page == 0 && number == 0 && len == 0 {
            break;
        }
        let val_start = off + LE_VAL_OFF;
        let val_end = val_start + len;
        if val_end > body.len() {
            return Err(ListError::Invalid);
        }
        out.push(AttrListEntry {
            oid: None,
            page,
            number,
            value: &body[val_start..val_end],
        });
        let raw = LE_VAL_OFF + len;
        off += raw + pad8(raw);
    }
    Ok(out)
}

/// Parse a full retrieved list (header included), returning the entries.
/// Used by tests and the CLI to read command output.
pub fn parse_retrieved(buf: &[u8]) -> Result<Vec<AttrListEntry<'_>>, ListError> {
    if buf.len() < LIST_HDR_LEN {
        return Err(ListError::Invalid);
    }
    let list_type = buf[0];
    let body_len = get_u32(buf, 4) as usize;
    if LIST_HDR_LEN + body_len > buf.len() {
        return Err(ListError::Invalid);
    }
    let body = &buf[LIST_HDR_LEN..LIST_HDR_LEN + body_len];
    match list_type {
        LIST_TYPE_RETRIEVED => parse_set_list(body),
        LIST_TYPE_RETRIEVED_MULTIOBJ => {
            let mut out = Vec::new();
            let mut off = 0;
            while off < body.len() {
                if body.len() - off < MLE_VAL_OFF {
                    if body[off..].iter().all(|b| *b == 0) {
                        break;
                    }
                    return Err(ListError::Invalid);
                }
                let oid = get_u64(body, off + MLE_OID_OFF);
                let page = get_u32(body, off + MLE_PAGE_OFF);
                let number = get_u32(body, off + MLE_NUMBER_OFF);
                let len = get_u16(body, off + MLE_LEN_OFF) as usize;
                let val_start = off + MLE_VAL_OFF;
                let val_end = val_start + len;
                if val_end > body.len() {
                    return Err(ListError::Invalid);
                }
                out.push(AttrListEntry {
                    oid: Some(oid),
                    page,
                    number,
                    value: &body[val_start..val_end],
                });
                let raw = MLE_VAL_OFF + len;
                off += raw + pad8(raw);
            }
            Ok(out)
        }
        _ => Err(ListError::Invalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pack_pads_to_eight() {
        let mut buf = [0xAAu8; 64];
        let n = pack_attr(&mut buf, 0x10000, 111, b"Madhuri Dixit Rocks!!\0").unwrap();
        // 10-byte header + 22-byte value = 32, already aligned.
        assert_eq!(n, 32);
        let n = pack_attr(&mut buf, 1, 2, b"abc").unwrap();
        assert_eq!(n, 16);
        assert_eq!(&buf[13..16], &[0, 0, 0]);
    }

    #[test]
    fn pack_overflow_and_invalid() {
        let mut buf = [0u8; 16];
        assert_eq!(
            pack_attr(&mut buf, 1, 2, &[0u8; 32]),
            Err(ListError::Overflow)
        );
        let mut big = vec![0u8; 1 << 20];
        assert_eq!(
            pack_attr(&mut big, 1, 2, &vec![0u8; 70000]),
            Err(ListError::Invalid)
        );
    }

    #[test]
    fn retrieved_list_round_trip() {
        let mut buf = [0u8; 256];
        let mut list = RetrievedList::new(&mut buf, ListFormat::SetAttr).unwrap();
        list.push(0, 0x10001, 321, b"second string\0").unwrap();
        list.push(0, 0x10000, 111, b"first\0").unwrap();
        let used = list.finish();
        assert!(used > 0);

        let entries = parse_retrieved(&buf[..used]).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].page, 0x10001);
        assert_eq!(entries[0].number, 321);
        assert_eq!(entries[0].value, b"second string\0");
        assert_eq!(entries[1].value, b"first\0");
    }

    #[test]
    fn multiobj_round_trip() {
        let mut buf = [0u8; 256];
        let mut list = RetrievedList::new(&mut buf, ListFormat::MultiObj).unwrap();
        list.push(0x10007, 0x10000, 1, &7u64.to_be_bytes()).unwrap();
        list.push(0x10008, 0x10000, 1, &8u64.to_be_bytes()).unwrap();
        let used = list.finish();

        let entries = parse_retrieved(&buf[..used]).unwrap();
        assert_eq!(entries[0].oid, Some(0x10007));
        assert_eq!(entries[1].oid, Some(0x10008));
        assert_eq!(entries[1].value, &8u64.to_be_bytes());
    }

    #[test]
    fn first_overflow_stops_accumulation() {
        let mut buf = [0u8; 40];
        let mut list = RetrievedList::new(&mut buf, ListFormat::SetAttr).unwrap();
        list.push(0, 1, 1, &[0x11; 16]).unwrap();
        assert_eq!(list.push(0, 1, 2, &[0x22; 16]), Err(ListError::Overflow));
        // A later small entry must not sneak in after the overflow.
        assert_eq!(list.push(0, 1, 3, b"x"), Err(ListError::Overflow));
        let used = list.finish();
        assert_eq!(used, 8 + 10 + 16 + 6);
    }

    #[test]
    fn empty_list_uses_no_bytes() {
        let mut buf = [0u8; 64];
        let list = RetrievedList::new(&mut buf, ListFormat::SetAttr).unwrap();
        assert_eq!(list.finish(), 0);
    }

    #[test]
    fn set_list_parses_padded_entries() {
        let mut buf = [0u8; 128];
        let mut off = 0;
        off += pack_attr(&mut buf[off..], 0x10000, 111, b"abc").unwrap();
        off += pack_attr(&mut buf[off..], 0x10000, 0, &[0u8; 0]).unwrap();
        // The zero-length entry above still carries page/number, so give it
        // a nonzero page to survive the terminator check.
        let entries = parse_set_list(&buf[..off]).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value, b"abc");
        assert_eq!(entries[1].value, b"");
    }

    #[test]
    fn get_list_rejects_ragged_input() {
        assert!(parse_get_list(&[0u8; 12]).is_err());
        let pairs = parse_get_list(&[0u8; 16]).unwrap();
        assert_eq!(pairs.len(), 2);
    }
}
