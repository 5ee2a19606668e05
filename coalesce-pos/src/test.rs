use crate::{Bias, CharRuns, OrderedIndex, Position, RunBuffer, WaypointDesc};
use coalesce_base::ReplicaId;
use std::cmp::Ordering;
use test_log::test;

fn rid(s: &str) -> ReplicaId {
    ReplicaId::new(s).unwrap()
}

fn text_index(name: &str) -> OrderedIndex<CharRuns> {
    OrderedIndex::new(rid(name))
}

fn read(ix: &OrderedIndex<CharRuns>) -> String {
    ix.entries().into_iter().map(|(_, c)| c).collect()
}

/// Insert locally and return what has to be shipped.
fn local_insert(
    ix: &mut OrderedIndex<CharRuns>,
    at: usize,
    s: &str,
) -> (Position, CharRuns, Option<WaypointDesc>) {
    let run = CharRuns::from(s);
    let (start, desc) = ix.create_positions(at, run.len() as u64).unwrap();
    ix.apply_insert(&start, run.clone(), desc.as_ref()).unwrap();
    (start, run, desc)
}

fn remote_insert(
    ix: &mut OrderedIndex<CharRuns>,
    op: &(Position, CharRuns, Option<WaypointDesc>),
) {
    ix.apply_insert(&op.0, op.1.clone(), op.2.as_ref()).unwrap();
}

#[test]
fn test_sequential_typing_is_one_waypoint() {
    let mut ix = text_index("aaaaaaaaaaa");
    local_insert(&mut ix, 0, "H");
    local_insert(&mut ix, 1, "e");
    local_insert(&mut ix, 2, "llo");
    assert_eq!(read(&ix), "Hello");
    // All five positions share one waypoint.
    let first = ix.position_at(0).unwrap();
    let last = ix.position_at(4).unwrap();
    assert_eq!(first.counter, last.counter);
    assert_eq!(last.value_index, 4);
}

#[test]
fn test_index_position_roundtrip() {
    let mut ix = text_index("aaaaaaaaaaa");
    local_insert(&mut ix, 0, "abcdef");
    local_insert(&mut ix, 3, "XY");
    assert_eq!(read(&ix), "abcXYdef");
    for i in 0..ix.len() {
        let pos = ix.position_at(i).unwrap();
        assert_eq!(ix.index_of(&pos).unwrap(), Some(i));
    }
}

#[test]
fn test_delete_keeps_positions() {
    let mut ix = text_index("aaaaaaaaaaa");
    local_insert(&mut ix, 0, "Hello");
    let p1 = ix.position_at(1).unwrap();
    let (idx, val) = ix.delete(&p1).unwrap().unwrap();
    assert_eq!((idx, val), (1, 'e'));
    assert_eq!(read(&ix), "Hllo");
    // Deleting again is a no-op; the position is still known.
    assert!(ix.delete(&p1).unwrap().is_none());
    assert!(ix.is_known(&p1));
    assert_eq!(ix.index_of(&p1).unwrap(), None);
    assert_eq!(ix.index_of_biased(&p1, Bias::Left).unwrap(), 0);
    assert_eq!(ix.index_of_biased(&p1, Bias::Right).unwrap(), 1);
    assert_eq!(ix.index_of_biased(&p1, Bias::None).unwrap(), -1);
}

#[test]
fn test_biased_lookup_at_ends() {
    let mut ix = text_index("aaaaaaaaaaa");
    local_insert(&mut ix, 0, "ab");
    let first = ix.position_at(0).unwrap();
    let last = ix.position_at(1).unwrap();
    ix.delete(&first).unwrap();
    ix.delete(&last).unwrap();
    assert_eq!(ix.index_of_biased(&first, Bias::Left).unwrap(), -1);
    assert_eq!(ix.index_of_biased(&last, Bias::Right).unwrap(), 0);
}

#[test]
fn test_concurrent_same_gap_orders_by_sender() {
    // Shared history: "XY" typed by a third replica, then r1 and r2
    // concurrently insert at index 1.
    let mut base = text_index("ccccccccccc");
    let xy = local_insert(&mut base, 0, "XY");

    let mut r1 = text_index("aaaaaaaaaaa");
    let mut r2 = text_index("bbbbbbbbbbb");
    remote_insert(&mut r1, &xy);
    remote_insert(&mut r2, &xy);

    let op1 = local_insert(&mut r1, 1, "a");
    let op2 = local_insert(&mut r2, 1, "b");
    remote_insert(&mut r1, &op2);
    remote_insert(&mut r2, &op1);

    // r1's id sorts before r2's, so "a" lands first.
    assert_eq!(read(&r1), "XabY");
    assert_eq!(read(&r2), "XabY");
}

#[test]
fn test_concurrent_runs_do_not_interleave() {
    let mut base = text_index("ccccccccccc");
    let xy = local_insert(&mut base, 0, "XY");

    let mut r1 = text_index("aaaaaaaaaaa");
    let mut r2 = text_index("bbbbbbbbbbb");
    remote_insert(&mut r1, &xy);
    remote_insert(&mut r2, &xy);

    // Each replica types left to right in the same gap.
    let mut ops1 = Vec::new();
    for (i, ch) in "cat".chars().enumerate() {
        ops1.push(local_insert(&mut r1, 1 + i, &ch.to_string()));
    }
    let mut ops2 = Vec::new();
    for (i, ch) in "dog".chars().enumerate() {
        ops2.push(local_insert(&mut r2, 1 + i, &ch.to_string()));
    }
    for op in &ops2 {
        remote_insert(&mut r1, op);
    }
    for op in &ops1 {
        remote_insert(&mut r2, op);
    }
    let merged = read(&r1);
    assert_eq!(merged, read(&r2));
    assert!(
        merged == "XcatdogY" || merged == "XdogcatY",
        "interleaved merge: {merged}"
    );
}

#[test]
fn test_insert_before_seen_right_child() {
    let mut ix = text_index("aaaaaaaaaaa");
    local_insert(&mut ix, 0, "XY");
    local_insert(&mut ix, 1, "a");
    assert_eq!(read(&ix), "XaY");
    // Inserting between X and a must land before a, even though a hangs
    // off X as a right child.
    local_insert(&mut ix, 1, "b");
    assert_eq!(read(&ix), "XbaY");
}

#[test]
fn test_insert_into_deleted_gap() {
    let mut ix = text_index("aaaaaaaaaaa");
    local_insert(&mut ix, 0, "XaY");
    let pa = ix.position_at(1).unwrap();
    ix.delete(&pa).unwrap();
    assert_eq!(read(&ix), "XY");
    local_insert(&mut ix, 1, "b");
    assert_eq!(read(&ix), "XbY");
}

#[test]
fn test_total_order_agrees_with_traversal() {
    let mut ix = text_index("aaaaaaaaaaa");
    local_insert(&mut ix, 0, "abcd");
    local_insert(&mut ix, 2, "12");
    local_insert(&mut ix, 1, "z");
    let entries = ix.entries();
    for i in 0..entries.len() {
        for j in 0..entries.len() {
            let got = ix.compare(&entries[i].0, &entries[j].0).unwrap();
            assert_eq!(got, i.cmp(&j), "positions {i} vs {j}");
        }
    }
}

#[test]
fn test_out_of_range_positions_rejected() {
    let mut ix = text_index("aaaaaaaaaaa");
    local_insert(&mut ix, 0, "x");
    let root_attach = WaypointDesc {
        parent: Position {
            sender: ReplicaId::root(),
            counter: 0,
            value_index: 0,
        },
        is_right: true,
    };
    // Counter beyond the 53-bit safe range.
    let bad = Position {
        sender: rid("bbbbbbbbbbb"),
        counter: u64::MAX,
        value_index: 0,
    };
    assert!(ix.register_positions(&bad, 1, Some(&root_attach)).is_err());
    // Run length that would run off the safe range.
    let start = Position {
        sender: rid("bbbbbbbbbbb"),
        counter: 1,
        value_index: 0,
    };
    assert!(ix
        .register_positions(&start, u64::MAX, Some(&root_attach))
        .is_err());
    assert_eq!(read(&ix), "x");
}

#[test]
fn test_unknown_waypoint_is_an_error() {
    let ix = text_index("aaaaaaaaaaa");
    let ghost = Position {
        sender: rid("zzzzzzzzzzz"),
        counter: 1,
        value_index: 0,
    };
    assert!(ix.index_of(&ghost).is_err());
    assert!(!ix.is_known(&ghost));
}

#[test]
fn test_receive_is_idempotent() {
    let mut a = text_index("aaaaaaaaaaa");
    let mut b = text_index("bbbbbbbbbbb");
    let op = local_insert(&mut a, 0, "hi");
    remote_insert(&mut b, &op);
    remote_insert(&mut b, &op);
    assert_eq!(read(&b), "hi");
    assert_eq!(b.len(), 2);
}

#[test]
fn test_save_load_roundtrip() {
    let mut a = text_index("aaaaaaaaaaa");
    local_insert(&mut a, 0, "hello");
    let p = a.position_at(1).unwrap();
    a.delete(&p).unwrap();

    let mut b = text_index("bbbbbbbbbbb");
    let delta = b.load(&a.save().unwrap()).unwrap();
    assert_eq!(read(&b), "hllo");
    assert_eq!(delta.inserted.len(), 4);
    assert!(delta.deleted.is_empty());

    // Loading the same state again changes nothing.
    let delta = b.load(&a.save().unwrap()).unwrap();
    assert!(delta.inserted.is_empty() && delta.deleted.is_empty());
}

#[test]
fn test_save_load_merges_divergent_states() {
    let mut a = text_index("aaaaaaaaaaa");
    local_insert(&mut a, 0, "abc");
    let mut b = text_index("bbbbbbbbbbb");
    local_insert(&mut b, 0, "XYZ");

    // Third replica loads both in either order; result is identical.
    let sa = a.save().unwrap();
    let sb = b.save().unwrap();
    let mut c1 = text_index("ccccccccccc");
    c1.load(&sa).unwrap();
    c1.load(&sb).unwrap();
    let mut c2 = text_index("ddddddddddd");
    c2.load(&sb).unwrap();
    c2.load(&sa).unwrap();
    let merged = read(&c1);
    assert_eq!(merged, read(&c2));
    assert!(merged == "abcXYZ" || merged == "XYZabc");
}

#[test]
fn test_load_merges_deletions() {
    let mut a = text_index("aaaaaaaaaaa");
    local_insert(&mut a, 0, "abc");
    let mut b = text_index("bbbbbbbbbbb");
    b.load(&a.save().unwrap()).unwrap();
    let pb = b.position_at(1).unwrap();
    b.delete(&pb).unwrap();

    // a learns of b's deletion through b's saved state.
    let delta = a.load(&b.save().unwrap()).unwrap();
    assert_eq!(read(&a), "ac");
    assert_eq!(delta.deleted.len(), 1);
    assert_eq!(delta.deleted[0].1, 'b');
}

#[test]
fn test_value_list_runs() {
    let mut ix: OrderedIndex<Vec<u32>> = OrderedIndex::new(rid("aaaaaaaaaaa"));
    let (start, desc) = ix.create_positions(0, 3).unwrap();
    ix.apply_insert(&start, vec![10, 20, 30], desc.as_ref())
        .unwrap();
    assert_eq!(ix.get(1), Some(20));
    let p = ix.position_at(2).unwrap();
    assert_eq!(ix.value_at_position(&p), Some(30));
    assert_eq!(
        ix.entries().into_iter().map(|(_, v)| v).collect::<Vec<_>>(),
        vec![10, 20, 30]
    );
}

#[test]
fn test_compare_is_total_and_consistent() {
    let mut a = text_index("aaaaaaaaaaa");
    local_insert(&mut a, 0, "ab");
    let p0 = a.position_at(0).unwrap();
    let p1 = a.position_at(1).unwrap();
    assert_eq!(a.compare(&p0, &p0).unwrap(), Ordering::Equal);
    assert_eq!(a.compare(&p0, &p1).unwrap(), Ordering::Less);
    assert_eq!(a.compare(&p1, &p0).unwrap(), Ordering::Greater);
}
