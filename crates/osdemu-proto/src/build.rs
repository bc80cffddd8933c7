//! Initiator-side CDB construction.
//!
//! One constructor per service action plus attachment methods for the
//! embedded get/set attribute directive, mirroring the shape of an OSD
//! initiator command library. The integration tests and the CLI drive the
//! target exclusively through this builder, so the decoder in [`crate::cdb`]
//! and this module are the two ends of the same wire contract.

use crate::capability::{CAP_LEN, CAP_OFF, CapabilityBuilder};
use crate::cdb::StrideHeader;
use crate::defs::{
    GETLIST_SETLIST, GETPAGE_SETVALUE, OSD_ADDITIONAL_CDB_LEN, OSD_CDB_SIZE, ServiceAction,
    VARLEN_CDB, ddt,
};
use crate::endian::{set_u16, set_u32, set_u64};
use crate::list::{LIST_HDR_LEN, LIST_TYPE_GET, LIST_TYPE_RETRIEVED, pack_attr};

#[derive(Clone)]
pub struct CdbBuilder {
    raw: [u8; OSD_CDB_SIZE],
    data_out: Vec<u8>,
}

impl CdbBuilder {
    fn new(action: ServiceAction) -> Self {
        let mut raw = [0u8; OSD_CDB_SIZE];
        raw[0] = VARLEN_CDB;
        raw[7] = OSD_ADDITIONAL_CDB_LEN;
        set_u16(&mut raw, 8, action.code());
        // A NOSEC initiator sends a fully permissive capability.
        raw[CAP_OFF..CAP_OFF + CAP_LEN].copy_from_slice(&CapabilityBuilder::new().build());
        Self {
            raw,
            data_out: Vec::new(),
        }
    }

    fn ids(mut self, pid: u64, oid: u64) -> Self {
        set_u64(&mut self.raw, 16, pid);
        set_u64(&mut self.raw, 24, oid);
        self
    }

    fn len_off(mut self, len: u64, off: u64) -> Self {
        set_u64(&mut self.raw, 36, len);
        set_u64(&mut self.raw, 44, off);
        self
    }

    pub fn format_osd(capacity: u64) -> Self {
        Self::new(ServiceAction::FormatOsd).len_off(capacity, 0)
    }

    pub fn create_partition(requested_pid: u64) -> Self {
        Self::new(ServiceAction::CreatePartition).ids(requested_pid, 0)
    }

    pub fn remove_partition(pid: u64) -> Self {
        Self::new(ServiceAction::RemovePartition).ids(pid, 0)
    }

    pub fn create(pid: u64, requested_oid: u64, num: u16) -> Self {
        Self::new(ServiceAction::Create)
            .ids(pid, requested_oid)
            .len_off(num as u64, 0)
    }

    pub fn create_and_write(pid: u64, requested_oid: u64, offset: u64, data: Vec<u8>) -> Self {
        let mut b = Self::new(ServiceAction::CreateAndWrite)
            .ids(pid, requested_oid)
            .len_off(data.len() as u64, offset);
        b.data_out = data;
        b
    }

    pub fn remove(pid: u64, oid: u64) -> Self {
        Self::new(ServiceAction::Remove).ids(pid, oid)
    }

    pub fn create_collection(pid: u64, requested_cid: u64) -> Self {
        Self::new(ServiceAction::CreateCollection).ids(pid, requested_cid)
    }

    pub fn remove_collection(pid: u64, cid: u64, fcr: bool) -> Self {
        let mut b = Self::new(ServiceAction::RemoveCollection).ids(pid, cid);
        if fcr {
            b.raw[10] |= 0x1;
        }
        b
    }

    pub fn write(pid: u64, oid: u64, offset: u64, data: Vec<u8>) -> Self {
        let mut b = Self::new(ServiceAction::Write)
            .ids(pid, oid)
            .len_off(data.len() as u64, offset);
        b.data_out = data;
        b
    }

    /// Scatter/gather write: the pair list leads the data-out buffer, the
    /// payload follows it.
    pub fn write_sgl(pid: u64, oid: u64, offset: u64, pairs: &[(u64, u64)], data: &[u8]) -> Self {
        let total: u64 = pairs.iter().map(|&(_, len)| len).sum();
        let mut b = Self::new(ServiceAction::Write)
            .ids(pid, oid)
            .len_off(total, offset);
        b.raw[10] |= ddt::SGL;
        b.push_sg_list(pairs);
        b.data_out.extend_from_slice(data);
        b
    }

    pub fn write_vec(
        pid: u64,
        oid: u64,
        offset: u64,
        stride: u64,
        segment_len: u64,
        data: &[u8],
    ) -> Self {
        // The length field covers the 16-byte stride header plus the data.
        let mut b = Self::new(ServiceAction::Write)
            .ids(pid, oid)
            .len_off(data.len() as u64 + StrideHeader::WIRE_LEN as u64, offset);
        b.raw[10] |= ddt::VEC;
        b.data_out.extend_from_slice(&stride.to_be_bytes());
        b.data_out.extend_from_slice(&segment_len.to_be_bytes());
        b.data_out.extend_from_slice(data);
        b
    }

    pub fn append(pid: u64, oid: u64, data: Vec<u8>) -> Self {
        let mut b = Self::new(ServiceAction::Append)
            .ids(pid, oid)
            .len_off(data.len() as u64, 0);
        b.data_out = data;
        b
    }

    pub fn clear(pid: u64, oid: u64, offset: u64, len: u64) -> Self {
        Self::new(ServiceAction::Clear).ids(pid, oid).len_off(len, offset)
    }

    pub fn read(pid: u64, oid: u64, offset: u64, len: u64) -> Self {
        Self::new(ServiceAction::Read).ids(pid, oid).len_off(len, offset)
    }

    /// Scatter/gather read: only the pair list travels in the data-out
    /// buffer; the data comes back in data-in.
    pub fn read_sgl(pid: u64, oid: u64, offset: u64, pairs: &[(u64, u64)]) -> Self {
        let total: u64 = pairs.iter().map(|&(_, len)| len).sum();
        let mut b = Self::new(ServiceAction::Read)
            .ids(pid, oid)
            .len_off(total, offset);
        b.raw[10] |= ddt::SGL;
        b.push_sg_list(pairs);
        b
    }

    pub fn read_vec(
        pid: u64,
        oid: u64,
        offset: u64,
        stride: u64,
        segment_len: u64,
        len: u64,
    ) -> Self {
        let mut b = Self::new(ServiceAction::Read).ids(pid, oid).len_off(len, offset);
        b.raw[10] |= ddt::VEC;
        b.data_out.extend_from_slice(&stride.to_be_bytes());
        b.data_out.extend_from_slice(&segment_len.to_be_bytes());
        debug_assert_eq!(b.data_out.len(), StrideHeader::WIRE_LEN);
        b
    }

    pub fn flush(pid: u64, oid: u64, scope: u8) -> Self {
        let mut b = Self::new(ServiceAction::Flush).ids(pid, oid);
        b.raw[10] |= scope & 0x3;
        b
    }

    pub fn flush_collection(pid: u64, cid: u64, scope: u8) -> Self {
        let mut b = Self::new(ServiceAction::FlushCollection).ids(pid, cid);
        b.raw[10] |= scope & 0x3;
        b
    }

    pub fn flush_partition(pid: u64, scope: u8) -> Self {
        let mut b = Self::new(ServiceAction::FlushPartition).ids(pid, 0);
        b.raw[10] |= scope & 0x3;
        b
    }

    pub fn flush_osd(scope: u8) -> Self {
        let mut b = Self::new(ServiceAction::FlushOsd);
        b.raw[10] |= scope & 0x3;
        b
    }

    pub fn get_attributes(pid: u64, oid: u64) -> Self {
        Self::new(ServiceAction::GetAttributes).ids(pid, oid)
    }

    pub fn set_attributes(pid: u64, oid: u64) -> Self {
        Self::new(ServiceAction::SetAttributes).ids(pid, oid)
    }

    pub fn list(pid: u64, initial_oid: u64, alloc_len: u64, list_id: u32) -> Self {
        let mut b = Self::new(ServiceAction::List)
            .ids(pid, 0)
            .len_off(alloc_len, initial_oid);
        set_u32(&mut b.raw, 32, list_id);
        b
    }

    pub fn list_collection(
        pid: u64,
        cid: u64,
        initial_oid: u64,
        alloc_len: u64,
        list_id: u32,
    ) -> Self {
        let mut b = Self::new(ServiceAction::ListCollection)
            .ids(pid, cid)
            .len_off(alloc_len, initial_oid);
        set_u32(&mut b.raw, 32, list_id);
        b
    }

    pub fn query(pid: u64, cid: u64, alloc_len: u64) -> Self {
        Self::new(ServiceAction::Query).ids(pid, cid).len_off(alloc_len, 0)
    }

    pub fn remove_member_objects(pid: u64, cid: u64) -> Self {
        Self::new(ServiceAction::RemoveMemberObjects).ids(pid, cid)
    }

    pub fn get_member_attributes(pid: u64, cid: u64) -> Self {
        Self::new(ServiceAction::GetMemberAttributes).ids(pid, cid)
    }

    pub fn set_member_attributes(pid: u64, cid: u64) -> Self {
        Self::new(ServiceAction::SetMemberAttributes).ids(pid, cid)
    }

    /// Replace the default fully permissive capability.
    pub fn capability(mut self, image: &[u8; CAP_LEN]) -> Self {
        self.raw[CAP_OFF..CAP_OFF + CAP_LEN].copy_from_slice(image);
        self
    }

    /// Attach a page-format get directive (byte 11 = 0x20): retrieve one
    /// page in full at offset 0 of the data-in attribute region.
    pub fn get_page(mut self, page: u32, alloc_len: u32) -> Self {
        self.raw[11] = GETPAGE_SETVALUE;
        set_u32(&mut self.raw, 32, page);
        set_u32(&mut self.raw, 56, alloc_len);
        set_u32(&mut self.raw, 60, 0);
        self
    }

    /// Attach a page-format set directive: one attribute set from an inline
    /// value appended to the data-out buffer.
    pub fn set_value(mut self, page: u32, number: u32, value: &[u8]) -> Self {
        self.raw[11] = GETPAGE_SETVALUE;
        let off = self.data_out.len() as u32;
        self.data_out.extend_from_slice(value);
        set_u32(&mut self.raw, 64, page);
        set_u32(&mut self.raw, 52, number);
        set_u32(&mut self.raw, 68, value.len() as u32);
        set_u32(&mut self.raw, 72, off);
        self
    }

    /// Attach a list-format get directive: the (page, number) request list
    /// is appended to the data-out buffer, results land at offset 0 of the
    /// data-in attribute region with `retrieved_alloc` bytes available.
    pub fn get_attr_list(mut self, pairs: &[(u32, u32)], retrieved_alloc: u32) -> Self {
        self.raw[11] = GETLIST_SETLIST;
        let off = self.data_out.len() as u32;
        let mut body = vec![0u8; LIST_HDR_LEN + pairs.len() * 8];
        body[0] = LIST_TYPE_GET;
        set_u32(&mut body, 4, (pairs.len() * 8) as u32);
        for (i, &(page, number)) in pairs.iter().enumerate() {
            set_u32(&mut body, LIST_HDR_LEN + i * 8, page);
            set_u32(&mut body, LIST_HDR_LEN + i * 8 + 4, number);
        }
        self.data_out.extend_from_slice(&body);
        set_u32(&mut self.raw, 56, body.len() as u32);
        set_u32(&mut self.raw, 60, off);
        set_u32(&mut self.raw, 64, retrieved_alloc);
        set_u32(&mut self.raw, 68, 0);
        self
    }

    /// Place the retrieved attribute list at `off` in the data-in buffer
    /// instead of offset 0 (e.g. behind read data).
    pub fn retrieved_offset(mut self, off: u32) -> Self {
        match self.raw[11] {
            GETPAGE_SETVALUE => set_u32(&mut self.raw, 60, off),
            GETLIST_SETLIST => set_u32(&mut self.raw, 68, off),
            _ => {}
        }
        self
    }

    /// Attach a list-format set directive; the entry list is appended to
    /// the data-out buffer.
    pub fn set_attr_list(mut self, attrs: &[(u32, u32, &[u8])]) -> Self {
        self.raw[11] = GETLIST_SETLIST;
        let off = self.data_out.len() as u32;
        let mut body = vec![0u8; LIST_HDR_LEN];
        body[0] = LIST_TYPE_RETRIEVED;
        for &(page, number, value) in attrs {
            let mut entry = vec![0u8; crate::list::LE_VAL_OFF + value.len() + 7];
            let n = pack_attr(&mut entry, page, number, value).expect("oversized attribute");
            entry.truncate(n);
            body.extend_from_slice(&entry);
        }
        let body_len = (body.len() - LIST_HDR_LEN) as u32;
        set_u32(&mut body, 4, body_len);
        self.data_out.extend_from_slice(&body);
        set_u32(&mut self.raw, 72, body.len() as u32);
        set_u32(&mut self.raw, 76, off);
        self
    }

    /// Attach a query list (QUERY only); the list is appended to the
    /// data-out buffer and its length recorded in the CDB.
    pub fn query_list(mut self, list: &[u8]) -> Self {
        set_u32(&mut self.raw, 52, list.len() as u32);
        self.data_out.extend_from_slice(list);
        self
    }

    fn push_sg_list(&mut self, pairs: &[(u64, u64)]) {
        self.data_out
            .extend_from_slice(&(pairs.len() as u64).to_be_bytes());
        for &(off, len) in pairs {
            self.data_out.extend_from_slice(&off.to_be_bytes());
            self.data_out.extend_from_slice(&len.to_be_bytes());
        }
    }

    pub fn finish(self) -> ([u8; OSD_CDB_SIZE], Vec<u8>) {
        (self.raw, self.data_out)
    }
}

/// Builds the data-out query list for QUERY: a 4-byte head (query type plus
/// reserved) followed by packed criteria entries.
#[derive(Debug, Clone)]
pub struct QueryListBuilder {
    buf: Vec<u8>,
}

impl QueryListBuilder {
    /// `intersection` selects the INTERSECTION query type; UNION otherwise.
    pub fn new(intersection: bool) -> Self {
        Self {
            buf: vec![if intersection { 0x1 } else { 0x0 }, 0, 0, 0],
        }
    }

    /// Add one criterion. `min`/`max` may be empty to leave that bound
    /// open.
    pub fn criterion(mut self, page: u32, number: u32, min: &[u8], max: &[u8]) -> Self {
        let len = (4 + 4 + 2 + min.len() + 2 + max.len()) as u16;
        let base = self.buf.len();
        self.buf.resize(base + 4, 0);
        set_u16(&mut self.buf, base + 2, len);
        self.buf.extend_from_slice(&page.to_be_bytes());
        self.buf.extend_from_slice(&number.to_be_bytes());
        self.buf
            .extend_from_slice(&(min.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(min);
        self.buf
            .extend_from_slice(&(max.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(max);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdb::{AttrDirective, Cdb};
    use crate::list::parse_set_list;
    use pretty_assertions::assert_eq;

    #[test]
    fn set_list_directive_round_trips() {
        let (raw, dout) = CdbBuilder::set_attributes(0x10000, 0x10000)
            .set_attr_list(&[(0x10000, 111, b"Madhuri Dixit Rocks!!\0")])
            .finish();
        let cdb = Cdb::parse(&raw).unwrap();
        let AttrDirective::List(dir) = cdb.attr_directive(dout.len()).unwrap() else {
            panic!("expected list directive");
        };
        let start = dir.set_list_off as usize;
        let body = &dout[start + LIST_HDR_LEN..start + dir.set_list_len as usize];
        let entries = parse_set_list(body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].page, 0x10000);
        assert_eq!(entries[0].number, 111);
        assert_eq!(entries[0].value, b"Madhuri Dixit Rocks!!\0");
    }

    #[test]
    fn page_directive_round_trips() {
        let (raw, dout) = CdbBuilder::create(0x10000, 0, 5)
            .get_page(crate::defs::CUR_CMD_ATTR_PG, 56)
            .set_value(0x10000, 7, b"val")
            .finish();
        let cdb = Cdb::parse(&raw).unwrap();
        let AttrDirective::Page(dir) = cdb.attr_directive(dout.len()).unwrap() else {
            panic!("expected page directive");
        };
        assert_eq!(dir.get_page, crate::defs::CUR_CMD_ATTR_PG);
        assert_eq!(dir.get_alloc_len, 56);
        assert_eq!(dir.set_page, 0x10000);
        assert_eq!(dir.set_number, 7);
        assert_eq!(
            &dout[dir.set_value_off as usize..dir.set_value_off as usize + 3],
            b"val"
        );
    }

    #[test]
    fn query_list_matches_wire_layout() {
        let min = 100u64.to_be_bytes();
        let max = 180u64.to_be_bytes();
        let list = QueryListBuilder::new(false)
            .criterion(0x10000, 1, &min, &max)
            .build();
        assert_eq!(list[0], 0x0);
        // Entry length field counts everything after the entry's first 4
        // bytes: page + number + two length-prefixed bounds.
        assert_eq!(u16::from_be_bytes([list[6], list[7]]), 12 + 8 + 8);
        assert_eq!(list.len(), 4 + 4 + 4 + 4 + 2 + 8 + 2 + 8);
    }
}
