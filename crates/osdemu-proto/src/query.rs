//! QUERY list parsing and the matches-list result format, osd2r01 sec 6.18.
//!
//! The data-out buffer of QUERY carries a query list: a 4-byte head whose
//! first byte selects UNION or INTERSECTION, then criteria entries. Each
//! criterion names an attribute and an optional min/max bound; bounds are
//! compared bytewise-lexicographically against the attribute value.

use crate::endian::{get_u16, get_u32, set_u64};

/// Minimum legal query list: the head plus one (possibly empty) entry.
pub const MIN_QUERY_LIST_LEN: usize = 4 + 16;

/// Offset of the first object id in a matches list.
pub const MATCHES_IDS_OFF: usize = 13;

/// Object-descriptor-format byte of the matches list: user objects.
pub const MATCHES_USER_OBJECT: u8 = 0x21 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOp {
    Union,
    Intersection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCriterion {
    pub page: u32,
    pub number: u32,
    pub min: Option<Vec<u8>>,
    pub max: Option<Vec<u8>>,
}

impl QueryCriterion {
    /// Bytewise range test. An absent attribute never matches; a zero-length
    /// bound leaves that side open.
    pub fn matches(&self, value: Option<&[u8]>) -> bool {
        let Some(v) = value else { return false };
        if let Some(min) = &self.min {
            if v < min.as_slice() {
                return false;
            }
        }
        if let Some(max) = &self.max {
            if v > max.as_slice() {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryList {
    pub op: QueryOp,
    pub criteria: Vec<QueryCriterion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed query list")]
pub struct QueryParseError;

/// Parse a query list. All-zero entries (the minimum list an initiator
/// sends when it has no criteria) are dropped; an empty criteria set
/// matches every member.
pub fn parse_query_list(buf: &[u8]) -> Result<QueryList, QueryParseError> {
    if buf.len() < 4 {
        return Err(QueryParseError);
    }
    let op = match buf[0] & 0xF {
        0x0 => QueryOp::Union,
        0x1 => QueryOp::Intersection,
        _ => return Err(QueryParseError),
    };
    let mut criteria = Vec::new();
    let mut off = 4;
    while off < buf.len() {
        if buf.len() - off < 16 {
            return Err(QueryParseError);
        }
        let entry_len = get_u16(buf, off + 2) as usize;
        let end = off + 4 + entry_len;
        if entry_len < 12 || end > buf.len() {
            return Err(QueryParseError);
        }
        let page = get_u32(buf, off + 4);
        let number = get_u32(buf, off + 8);
        let min_len = get_u16(buf, off + 12) as usize;
        let min_start = off + 14;
        if min_start + min_len + 2 > end {
            return Err(QueryParseError);
        }
        let max_len = get_u16(buf, min_start + min_len) as usize;
        let max_start = min_start + min_len + 2;
        if max_start + max_len != end {
            return Err(QueryParseError);
        }
        if !(page == 0 && number == 0 && min_len == 0 && max_len == 0) {
            criteria.push(QueryCriterion {
                page,
                number,
                min: (min_len > 0).then(|| buf[min_start..min_start + min_len].to_vec()),
                max: (max_len > 0).then(|| buf[max_start..max_start + max_len].to_vec()),
            });
        }
        off = end;
    }
    Ok(QueryList { op, criteria })
}

/// Serialize the matches list: an 8-byte additional length (5 bytes of
/// descriptor header plus 8 per id), 4 reserved bytes, the object
/// descriptor format byte, then the matching ids. Ids that would exceed
/// `alloc_len` are dropped.
pub fn pack_matches(alloc_len: u64, oids: &[u64]) -> Vec<u8> {
    let mut fit = oids.len();
    while fit > 0 && (MATCHES_IDS_OFF + fit * 8) as u64 > alloc_len {
        fit -= 1;
    }
    let mut out = vec![0u8; MATCHES_IDS_OFF + fit * 8];
    set_u64(&mut out, 0, (5 + fit * 8) as u64);
    out[12] = MATCHES_USER_OBJECT;
    for (i, oid) in oids[..fit].iter().enumerate() {
        set_u64(&mut out, MATCHES_IDS_OFF + i * 8, *oid);
    }
    out
}

/// Read the ids back out of a matches list (test/CLI helper).
pub fn parse_matches(buf: &[u8]) -> Result<Vec<u64>, QueryParseError> {
    if buf.len() < MATCHES_IDS_OFF || buf[12] != MATCHES_USER_OBJECT {
        return Err(QueryParseError);
    }
    let add_len = crate::endian::get_u64(buf, 0) as usize;
    if add_len < 5 || (add_len - 5) % 8 != 0 || 8 + add_len > buf.len() {
        return Err(QueryParseError);
    }
    let count = (add_len - 5) / 8;
    Ok((0..count)
        .map(|i| crate::endian::get_u64(buf, MATCHES_IDS_OFF + i * 8))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::QueryListBuilder;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_two_criteria_union() {
        let list = QueryListBuilder::new(false)
            .criterion(0x10000, 1, &100u64.to_be_bytes(), &180u64.to_be_bytes())
            .criterion(0x10000, 1, &200u64.to_be_bytes(), &323u64.to_be_bytes())
            .build();
        let parsed = parse_query_list(&list).unwrap();
        assert_eq!(parsed.op, QueryOp::Union);
        assert_eq!(parsed.criteria.len(), 2);
        assert_eq!(parsed.criteria[0].min, Some(100u64.to_be_bytes().to_vec()));
        assert_eq!(parsed.criteria[1].max, Some(323u64.to_be_bytes().to_vec()));
    }

    #[test]
    fn zero_entry_means_no_criteria() {
        let mut list = vec![0u8; MIN_QUERY_LIST_LEN];
        list[4 + 3] = 12; // entry length with empty bounds; head stays UNION
        let parsed = parse_query_list(&list).unwrap();
        assert!(parsed.criteria.is_empty());
    }

    #[test]
    fn open_bounds() {
        let list = QueryListBuilder::new(true)
            .criterion(0x10000, 1, &150u64.to_be_bytes(), &[])
            .criterion(0x10000, 1, &[], &10u64.to_be_bytes())
            .build();
        let parsed = parse_query_list(&list).unwrap();
        assert_eq!(parsed.op, QueryOp::Intersection);
        assert_eq!(parsed.criteria[0].max, None);
        assert_eq!(parsed.criteria[1].min, None);

        let c = &parsed.criteria[0];
        assert!(c.matches(Some(&200u64.to_be_bytes())));
        assert!(!c.matches(Some(&100u64.to_be_bytes())));
        assert!(!c.matches(None));
    }

    #[test]
    fn lexicographic_compare_spans_types() {
        let c = QueryCriterion {
            page: 0x10000,
            number: 1,
            min: Some(b"ab\0".to_vec()),
            max: Some(b"keta\0".to_vec()),
        };
        assert!(c.matches(Some(b"cat\0")));
        assert!(c.matches(Some(b"keema\0")));
        assert!(!c.matches(Some(b"zebra\0")));
        // An 8-byte integer value starts with 0x00 and sorts below "ab".
        assert!(!c.matches(Some(&59u64.to_be_bytes())));
    }

    #[test]
    fn matches_list_layout() {
        let buf = pack_matches(4096, &[0x10003, 0x10006]);
        assert_eq!(crate::endian::get_u64(&buf, 0), 5 + 16);
        assert_eq!(buf[12], 0x21 << 2);
        assert_eq!(buf.len(), MATCHES_IDS_OFF + 16);
        assert_eq!(parse_matches(&buf).unwrap(), vec![0x10003, 0x10006]);
    }

    #[test]
    fn matches_list_respects_alloc_len() {
        let oids: Vec<u64> = (0..10).map(|i| 0x10000 + i).collect();
        let buf = pack_matches((MATCHES_IDS_OFF + 3 * 8) as u64, &oids);
        assert_eq!(parse_matches(&buf).unwrap().len(), 3);
    }
}
