//! Collection, membership and QUERY behavior, driven through full CDBs.

use osdemu_proto::build::{CdbBuilder, QueryListBuilder};
use osdemu_proto::defs::{USER_COLL_PG, status};
use osdemu_proto::list::parse_retrieved;
use osdemu_proto::query::parse_matches;
use osdemu_proto::sense::sense_asc;
use osdemu_target::{Backend, Target, TargetOptions};
use pretty_assertions::assert_eq;

const PID: u64 = 0x10000;
const CID: u64 = 0x10000;
const OID: u64 = 0x10001; // leave room for the collection id
const PAGE: u32 = 0x10000;

fn open_target() -> (tempfile::TempDir, Target) {
    let dir = tempfile::tempdir().unwrap();
    let target = Target::open(TargetOptions::new(dir.path()).backend(Backend::Memory)).unwrap();
    (dir, target)
}

fn submit_ok(target: &Target, builder: CdbBuilder) -> Vec<u8> {
    let (cdb, dout) = builder.finish();
    let result = target.submit(&cdb, &dout);
    assert_eq!(result.status, status::GOOD, "sense: {:02x?}", result.sense);
    result.data_in
}

fn set_attr_int(target: &Target, oid: u64, number: u32, value: u64) {
    submit_ok(
        target,
        CdbBuilder::set_attributes(PID, oid)
            .set_attr_list(&[(PAGE, number, &value.to_be_bytes())]),
    );
}

fn set_attr_val(target: &Target, oid: u64, number: u32, value: &[u8]) {
    submit_ok(
        target,
        CdbBuilder::set_attributes(PID, oid).set_attr_list(&[(PAGE, number, value)]),
    );
}

fn run_query(target: &Target, list: Vec<u8>) -> Vec<u64> {
    let data_in = submit_ok(target, CdbBuilder::query(PID, CID, 4096).query_list(&list));
    parse_matches(&data_in).unwrap()
}

/// Partition, collection, ten objects; all but the third and ninth join
/// the collection through their collections attribute page.
fn populate(target: &Target) {
    submit_ok(target, CdbBuilder::create_partition(PID));
    submit_ok(target, CdbBuilder::create_collection(PID, CID));
    for i in 0..10u64 {
        let builder = CdbBuilder::create(PID, OID + i, 1);
        let builder = if i == 2 || i == 8 {
            builder
        } else {
            builder.set_attr_list(&[(USER_COLL_PG, 1, &CID.to_be_bytes())])
        };
        submit_ok(target, builder);
    }
    for (i, value) in [4u64, 49, 20, 101, 59, 75, 200, 67, 323, 1]
        .into_iter()
        .enumerate()
    {
        set_attr_int(target, OID + i as u64, 1, value);
    }
    set_attr_int(target, OID + 1, 2, 130);
    set_attr_int(target, OID + 4, 2, 37);
    set_attr_int(target, OID + 8, 2, 44);
    set_attr_int(target, OID + 9, 2, 19);
}

#[test]
fn query_without_criteria_returns_all_members() {
    let (_dir, target) = open_target();
    populate(&target);

    let list = vec![0u8; 20]; // minimum list: one empty entry
    let mut list = list;
    list[7] = 12; // entry length with empty bounds
    let mut ids = run_query(&target, list);
    ids.sort_unstable();
    let expected: Vec<u64> = (0..10)
        .filter(|i| *i != 2 && *i != 8)
        .map(|i| OID + i)
        .collect();
    assert_eq!(ids, expected);
}

#[test]
fn query_single_range() {
    let (_dir, target) = open_target();
    populate(&target);

    let list = QueryListBuilder::new(false)
        .criterion(PAGE, 1, &40u64.to_be_bytes(), &80u64.to_be_bytes())
        .build();
    let mut ids = run_query(&target, list);
    ids.sort_unstable();
    assert_eq!(ids, vec![OID + 1, OID + 4, OID + 5, OID + 7]);
}

#[test]
fn query_union_of_two_ranges() {
    let (_dir, target) = open_target();
    populate(&target);

    let list = QueryListBuilder::new(false)
        .criterion(PAGE, 1, &100u64.to_be_bytes(), &180u64.to_be_bytes())
        .criterion(PAGE, 1, &200u64.to_be_bytes(), &323u64.to_be_bytes())
        .build();
    let mut ids = run_query(&target, list);
    ids.sort_unstable();
    // 323 would match, but that object is not a member.
    assert_eq!(ids, vec![OID + 3, OID + 6]);
}

#[test]
fn query_intersection_of_two_attributes() {
    let (_dir, target) = open_target();
    populate(&target);

    let list = QueryListBuilder::new(true)
        .criterion(PAGE, 1, &4u64.to_be_bytes(), &100u64.to_be_bytes())
        .criterion(PAGE, 2, &10u64.to_be_bytes(), &400u64.to_be_bytes())
        .build();
    let mut ids = run_query(&target, list);
    ids.sort_unstable();
    assert_eq!(ids, vec![OID + 1, OID + 4]);
}

#[test]
fn query_with_open_bounds() {
    let (_dir, target) = open_target();
    populate(&target);

    // min-only, max-only and both, unioned.
    let list = QueryListBuilder::new(false)
        .criterion(PAGE, 2, &130u64.to_be_bytes(), &130u64.to_be_bytes())
        .criterion(PAGE, 1, &150u64.to_be_bytes(), &[])
        .criterion(PAGE, 1, &[], &10u64.to_be_bytes())
        .build();
    let mut ids = run_query(&target, list);
    ids.sort_unstable();
    assert_eq!(ids, vec![OID, OID + 1, OID + 6, OID + 9]);
}

#[test]
fn query_compares_bytewise_across_value_types() {
    let (_dir, target) = open_target();
    populate(&target);

    set_attr_val(&target, OID, 1, b"hello\0");
    set_attr_val(&target, OID + 1, 1, b"cat\0");
    set_attr_val(&target, OID + 3, 1, b"zebra\0");
    set_attr_val(&target, OID + 6, 1, b"keema\0");

    let list = QueryListBuilder::new(false)
        .criterion(PAGE, 1, &41u64.to_be_bytes(), &169u64.to_be_bytes())
        .criterion(PAGE, 1, b"ab\0", b"keta\0")
        .build();
    let mut ids = run_query(&target, list);
    ids.sort_unstable();
    assert_eq!(
        ids,
        vec![OID, OID + 1, OID + 4, OID + 5, OID + 6, OID + 7]
    );
}

#[test]
fn membership_attribute_reads_back_from_the_collections_page() {
    let (_dir, target) = open_target();
    populate(&target);

    let data_in = submit_ok(
        &target,
        CdbBuilder::get_attributes(PID, OID).get_attr_list(&[(USER_COLL_PG, 1)], 64),
    );
    let entries = parse_retrieved(&data_in).unwrap();
    assert_eq!(entries[0].value, CID.to_be_bytes().to_vec());

    // Leaving the collection clears the attribute.
    submit_ok(
        &target,
        CdbBuilder::set_attributes(PID, OID).set_attr_list(&[(USER_COLL_PG, 1, b"")]),
    );
    let list = vec![0, 0, 0, 0, 0, 0, 0, 12, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    assert!(!run_query(&target, list).contains(&OID));
}

#[test]
fn list_collection_enumerates_members_and_collections() {
    let (_dir, target) = open_target();
    populate(&target);

    // cid = 0 lists the partition's collections.
    let data_in = submit_ok(&target, CdbBuilder::list_collection(PID, 0, 0, 4096, 0));
    assert_eq!(
        osdemu_proto::endian::get_u64(&data_in, 24),
        CID
    );

    // A real cid lists its members.
    let data_in = submit_ok(&target, CdbBuilder::list_collection(PID, CID, 0, 4096, 0));
    let count = (data_in.len() - 24) / 8;
    assert_eq!(count, 8);
}

#[test]
fn member_attributes_fan_out_and_come_back_per_object() {
    let (_dir, target) = open_target();
    populate(&target);

    submit_ok(
        &target,
        CdbBuilder::set_member_attributes(PID, CID).set_attr_list(&[(PAGE, 77, b"tagged\0")]),
    );

    let data_in = submit_ok(
        &target,
        CdbBuilder::get_member_attributes(PID, CID).get_attr_list(&[(PAGE, 77)], 4096),
    );
    let entries = parse_retrieved(&data_in).unwrap();
    assert_eq!(entries.len(), 8);
    for entry in &entries {
        assert!(entry.oid.is_some());
        assert_eq!(entry.value, b"tagged\0");
    }
    // Non-members were not touched.
    let data_in = submit_ok(
        &target,
        CdbBuilder::get_attributes(PID, OID + 2).get_attr_list(&[(PAGE, 77)], 64),
    );
    assert_eq!(parse_retrieved(&data_in).unwrap()[0].value, b"");
}

#[test]
fn remove_member_objects_empties_the_collection() {
    let (_dir, target) = open_target();
    populate(&target);

    submit_ok(&target, CdbBuilder::remove_member_objects(PID, CID));

    let data_in = submit_ok(&target, CdbBuilder::list_collection(PID, CID, 0, 4096, 0));
    assert_eq!(data_in.len(), 24);
    // Members are gone; non-members survive.
    let (cdb, dout) = CdbBuilder::read(PID, OID, 0, 1).finish();
    assert_eq!(target.submit(&cdb, &dout).status, status::CHECK_CONDITION);
    submit_ok(&target, CdbBuilder::remove(PID, OID + 2));
}

#[test]
fn remove_collection_honors_the_force_flag() {
    let (_dir, target) = open_target();
    populate(&target);

    let (cdb, dout) = CdbBuilder::remove_collection(PID, CID, false).finish();
    let result = target.submit(&cdb, &dout);
    assert_eq!(result.status, status::CHECK_CONDITION);
    assert_eq!(sense_asc(&result.sense), Some(0x2C0A));

    submit_ok(&target, CdbBuilder::remove_collection(PID, CID, true));
    // The members themselves survive a forced collection removal.
    submit_ok(&target, CdbBuilder::read(PID, OID, 0, 0));
}
