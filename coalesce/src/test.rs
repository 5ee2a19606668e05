// Cross-replica properties: convergence, causality, idempotence,
// round-trip, and the literal end-to-end scenarios.

use crate::{
    AutoTransactions, Counter, Doc, DocOptions, MvRegister, ReplicaId, Text, ValueMap,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use test_log::test;

fn doc(id: &str) -> (Doc, Rc<RefCell<Vec<Vec<u8>>>>) {
    let doc = Doc::new(DocOptions {
        debug_replica_id: Some(ReplicaId::new(id).unwrap()),
        auto_transactions: AutoTransactions::PerOp,
        ..Default::default()
    });
    let sent = Rc::new(RefCell::new(Vec::new()));
    let sink = sent.clone();
    doc.on_send(move |ev| sink.borrow_mut().push(ev.message.clone()));
    (doc, sent)
}

fn drain(queue: &Rc<RefCell<Vec<Vec<u8>>>>) -> Vec<Vec<u8>> {
    queue.borrow_mut().drain(..).collect()
}

fn deliver(doc: &Doc, msgs: &[Vec<u8>]) {
    for m in msgs {
        doc.receive(m, None).unwrap();
    }
}

// Scenario: insert/delete text across two replicas.
#[test]
fn test_scenario_insert_delete_text() {
    let (d1, q1) = doc("aaaaaaaaaaa");
    let (d2, q2) = doc("bbbbbbbbbbb");
    let t1 = d1.register("text", Text::new).unwrap();
    let t2 = d2.register("text", Text::new).unwrap();

    t1.insert(0, "Hello").unwrap();
    deliver(&d2, &drain(&q1));
    t2.delete(0, 1).unwrap();
    deliver(&d1, &drain(&q2));

    assert_eq!(t1.text(), "ello");
    assert_eq!(t2.text(), "ello");
}

// Scenario: concurrent inserts at the same gap, sender-id tie-break.
#[test]
fn test_scenario_concurrent_inserts_same_gap() {
    let (d1, q1) = doc("aaaaaaaaaaa");
    let (d2, q2) = doc("bbbbbbbbbbb");
    let t1 = d1.register("text", Text::new).unwrap();
    let t2 = d2.register("text", Text::new).unwrap();

    t1.insert(0, "XY").unwrap();
    let seed = drain(&q1);
    deliver(&d2, &seed);

    t1.insert(1, "a").unwrap();
    t2.insert(1, "b").unwrap();
    let m1 = drain(&q1);
    let m2 = drain(&q2);
    deliver(&d2, &m1);
    deliver(&d1, &m2);

    // R1's id sorts below R2's, so "a" lands first on both.
    assert_eq!(t1.text(), "XabY");
    assert_eq!(t2.text(), "XabY");
}

// Scenario: LWW register converges on the later wall clock.
#[test]
fn test_scenario_lww_register() {
    let (d1, q1) = doc("aaaaaaaaaaa");
    let (d2, q2) = doc("zzzzzzzzzzz");
    let v1 = d1.register("v", MvRegister::<String>::new_lww).unwrap();
    let v2 = d2.register("v", MvRegister::<String>::new_lww).unwrap();

    v1.set("red".into()).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    v2.set("blue".into()).unwrap();
    deliver(&d2, &drain(&q1));
    deliver(&d1, &drain(&q2));

    assert_eq!(v1.value(), Some("blue".to_string()));
    assert_eq!(v2.value(), Some("blue".to_string()));
}

// Scenario: multi-value map conflict is visible on both sides.
#[test]
fn test_scenario_map_conflict() {
    let (d1, q1) = doc("aaaaaaaaaaa");
    let (d2, q2) = doc("bbbbbbbbbbb");
    let m1 = d1.register("m", ValueMap::<String, String>::new).unwrap();
    let m2 = d2.register("m", ValueMap::<String, String>::new).unwrap();

    m1.set("k".into(), "A".into()).unwrap();
    m2.set("k".into(), "B".into()).unwrap();
    deliver(&d2, &drain(&q1));
    deliver(&d1, &drain(&q2));

    let conflicts = vec!["A".to_string(), "B".to_string()];
    assert_eq!(m1.get_conflicts(&"k".into()), conflicts);
    assert_eq!(m2.get_conflicts(&"k".into()), conflicts);
}

// Scenario: merging saved states, in either order, gives one text.
#[test]
fn test_scenario_save_load_merge() {
    let (d1, _) = doc("aaaaaaaaaaa");
    let t1 = d1.register("text", Text::new).unwrap();
    t1.insert(0, "abc").unwrap();
    let s1 = d1.save().unwrap();

    let (d2, _) = doc("bbbbbbbbbbb");
    let t2 = d2.register("text", Text::new).unwrap();
    t2.insert(0, "XYZ").unwrap();
    let s2 = d2.save().unwrap();

    let (d3, _) = doc("ccccccccccc");
    let t3 = d3.register("text", Text::new).unwrap();
    d3.load(&s1, None).unwrap();
    d3.load(&s2, None).unwrap();

    let (d4, _) = doc("ddddddddddd");
    let t4 = d4.register("text", Text::new).unwrap();
    d4.load(&s2, None).unwrap();
    d4.load(&s1, None).unwrap();

    assert_eq!(t3.text(), t4.text());
    assert!(t3.text() == "abcXYZ" || t3.text() == "XYZabc");
}

// Scenario: counter reset zeroes observed adds only.
#[test]
fn test_scenario_counter_reset() {
    let (d1, q1) = doc("aaaaaaaaaaa");
    let (d2, q2) = doc("bbbbbbbbbbb");
    let c1 = d1.register("c", Counter::new).unwrap();
    let c2 = d2.register("c", Counter::new).unwrap();

    c1.add(5).unwrap();
    c2.add(3).unwrap();
    deliver(&d2, &drain(&q1));
    deliver(&d1, &drain(&q2));
    c1.reset().unwrap();
    let reset = drain(&q1);
    deliver(&d2, &reset);
    assert_eq!(c1.value(), 0);
    assert_eq!(c2.value(), 0);

    c2.add(7).unwrap();
    deliver(&d1, &drain(&q2));
    assert_eq!(c1.value(), 7);
    assert_eq!(c2.value(), 7);
}

// Convergence: the same transactions in different interleavings leave
// two replicas byte-identical in observable state.
#[test]
fn test_convergence_under_interleaving() {
    let (d1, q1) = doc("aaaaaaaaaaa");
    let (d2, q2) = doc("bbbbbbbbbbb");
    let (d3, q3) = doc("ccccccccccc");
    let t1 = d1.register("text", Text::new).unwrap();
    let t2 = d2.register("text", Text::new).unwrap();
    let t3 = d3.register("text", Text::new).unwrap();

    t1.insert(0, "base").unwrap();
    let seed = drain(&q1);
    deliver(&d2, &seed);
    deliver(&d3, &seed);

    t1.insert(4, "-one").unwrap();
    t2.insert(0, "two-").unwrap();
    t3.insert(2, "!").unwrap();
    let m1 = drain(&q1);
    let m2 = drain(&q2);
    let m3 = drain(&q3);

    // Different delivery orders on each replica.
    deliver(&d1, &m2);
    deliver(&d1, &m3);
    deliver(&d2, &m3);
    deliver(&d2, &m1);
    deliver(&d3, &m1);
    deliver(&d3, &m2);

    assert_eq!(t1.text(), t2.text());
    assert_eq!(t2.text(), t3.text());
}

// Causality: a transaction that depends on an unseen one waits for it.
#[test]
fn test_causal_delivery_order() {
    let (d1, q1) = doc("aaaaaaaaaaa");
    let (d2, q2) = doc("bbbbbbbbbbb");
    let (d3, _q3) = doc("ccccccccccc");
    let t1 = d1.register("text", Text::new).unwrap();
    let t2 = d2.register("text", Text::new).unwrap();
    let t3 = d3.register("text", Text::new).unwrap();

    t1.insert(0, "A").unwrap();
    let first = drain(&q1);
    deliver(&d2, &first);
    t2.insert(1, "B").unwrap();
    let second = drain(&q2);

    // d3 sees the dependent transaction first; it must buffer.
    deliver(&d3, &second);
    assert_eq!(t3.text(), "");
    assert_eq!(d3.buffered_len(), 1);
    deliver(&d3, &first);
    assert_eq!(t3.text(), "AB");
    assert_eq!(d3.buffered_len(), 0);
}

// Idempotence: messages and saved states apply once, however often
// they arrive.
#[test]
fn test_idempotence() {
    let (d1, q1) = doc("aaaaaaaaaaa");
    let (d2, _) = doc("bbbbbbbbbbb");
    let t1 = d1.register("text", Text::new).unwrap();
    let t2 = d2.register("text", Text::new).unwrap();

    t1.insert(0, "once").unwrap();
    let msgs = drain(&q1);
    deliver(&d2, &msgs);
    deliver(&d2, &msgs);
    deliver(&d2, &msgs);
    assert_eq!(t2.text(), "once");

    let saved = d1.save().unwrap();
    assert!(!d2.load(&saved, None).unwrap());
    assert_eq!(t2.text(), "once");

    // save . load . save is semantically stable.
    let (d3, _) = doc("ccccccccccc");
    let t3 = d3.register("text", Text::new).unwrap();
    d3.load(&saved, None).unwrap();
    let saved2 = d3.save().unwrap();
    let (d4, _) = doc("ddddddddddd");
    let t4 = d4.register("text", Text::new).unwrap();
    d4.load(&saved2, None).unwrap();
    assert_eq!(t3.text(), "once");
    assert_eq!(t4.text(), "once");
}

// Round-trip: a fresh runtime loading a save matches the original.
#[test]
fn test_round_trip() {
    let (d1, _) = doc("aaaaaaaaaaa");
    let t1 = d1.register("text", Text::new).unwrap();
    let c1 = d1.register("count", Counter::new).unwrap();
    t1.insert(0, "state").unwrap();
    t1.delete(1, 2).unwrap();
    c1.add(9).unwrap();

    let saved = d1.save().unwrap();
    let (d2, _) = doc("bbbbbbbbbbb");
    let t2 = d2.register("text", Text::new).unwrap();
    let c2 = d2.register("count", Counter::new).unwrap();
    assert!(d2.load(&saved, None).unwrap());

    assert_eq!(t2.text(), t1.text());
    assert_eq!(c2.value(), 9);
    assert_eq!(d2.vector_clock(), d1.vector_clock());
}

// Non-interleaving: two concurrent left-to-right runs stay contiguous.
#[test]
fn test_non_interleaving_runs() {
    let (d1, q1) = doc("aaaaaaaaaaa");
    let (d2, q2) = doc("bbbbbbbbbbb");
    let t1 = d1.register("text", Text::new).unwrap();
    let t2 = d2.register("text", Text::new).unwrap();

    t1.insert(0, "[]").unwrap();
    let seed = drain(&q1);
    deliver(&d2, &seed);

    for (i, ch) in "cat".chars().enumerate() {
        t1.insert(1 + i, &ch.to_string()).unwrap();
    }
    for (i, ch) in "dog".chars().enumerate() {
        t2.insert(1 + i, &ch.to_string()).unwrap();
    }
    deliver(&d2, &drain(&q1));
    deliver(&d1, &drain(&q2));

    let merged = t1.text();
    assert_eq!(merged, t2.text());
    assert!(merged == "[catdog]" || merged == "[dogcat]", "interleaved: {merged}");
}
