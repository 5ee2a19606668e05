use crate::{
    CollabList, CollabSet, Counter, LazyMap, MvRegister, Presence, RichText, SetSemantics,
    SignedCounter, Text, ValueList, ValueMap,
};
use coalesce_base::ReplicaId;
use coalesce_runtime::{AutoTransactions, Doc, DocOptions};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use test_log::test;

/// Toy switchboard: captures every commit and replays it to the other
/// documents on `flush`, so tests control what is concurrent with what.
struct Network {
    docs: Vec<Doc>,
    outbox: Rc<RefCell<Vec<(usize, Vec<u8>)>>>,
}

impl Network {
    fn new() -> Self {
        Network {
            docs: Vec::new(),
            outbox: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn add(&mut self, id: &str) -> Doc {
        let doc = Doc::new(DocOptions {
            debug_replica_id: Some(ReplicaId::new(id).unwrap()),
            auto_transactions: AutoTransactions::PerOp,
            ..Default::default()
        });
        let from = self.docs.len();
        let outbox = self.outbox.clone();
        doc.on_send(move |ev| outbox.borrow_mut().push((from, ev.message.clone())));
        self.docs.push(doc.clone());
        doc
    }

    fn flush(&self) {
        loop {
            let batch: Vec<(usize, Vec<u8>)> = self.outbox.borrow_mut().drain(..).collect();
            if batch.is_empty() {
                break;
            }
            for (from, msg) in batch {
                for (i, doc) in self.docs.iter().enumerate() {
                    if i != from {
                        doc.receive(&msg, None).unwrap();
                    }
                }
            }
        }
    }
}

#[test]
fn test_value_list_converges() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let d2 = net.add("bbbbbbbbbbb");
    let l1 = d1.register("list", ValueList::<u32>::new).unwrap();
    let l2 = d2.register("list", ValueList::<u32>::new).unwrap();

    l1.insert(0, vec![1, 2, 3]).unwrap();
    net.flush();
    l2.delete(1, 1).unwrap();
    net.flush();
    assert_eq!(l1.to_vec(), vec![1, 3]);
    assert_eq!(l2.to_vec(), vec![1, 3]);

    // Index <-> position agreement.
    for i in 0..l1.len() {
        let pos = l1.get_position(i).unwrap();
        assert_eq!(l1.index_of_position(&pos).unwrap(), Some(i));
    }
}

#[test]
fn test_text_insert_then_remote_delete() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let d2 = net.add("bbbbbbbbbbb");
    let t1 = d1.register("text", Text::new).unwrap();
    let t2 = d2.register("text", Text::new).unwrap();

    t1.insert(0, "Hello").unwrap();
    net.flush();
    t2.delete(0, 1).unwrap();
    net.flush();
    assert_eq!(t1.text(), "ello");
    assert_eq!(t2.text(), "ello");
}

#[test]
fn test_text_concurrent_same_gap() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let d2 = net.add("bbbbbbbbbbb");
    let t1 = d1.register("text", Text::new).unwrap();
    let t2 = d2.register("text", Text::new).unwrap();

    t1.insert(0, "XY").unwrap();
    net.flush();
    // Concurrent inserts at index 1; lower replica id goes first.
    t1.insert(1, "a").unwrap();
    t2.insert(1, "b").unwrap();
    net.flush();
    assert_eq!(t1.text(), "XabY");
    assert_eq!(t2.text(), "XabY");
}

#[test]
fn test_rich_text_formatting() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let d2 = net.add("bbbbbbbbbbb");
    let r1 = d1.register("rich", RichText::<String>::new).unwrap();
    let r2 = d2.register("rich", RichText::<String>::new).unwrap();

    r1.insert(0, "hello world").unwrap();
    net.flush();
    r1.format(0, 5, "bold", Some("true".into())).unwrap();
    net.flush();

    assert_eq!(r2.text(), "hello world");
    assert_eq!(r2.format_at(0).unwrap().get("bold"), Some(&"true".to_string()));
    assert_eq!(r2.format_at(6).unwrap().get("bold"), None);

    // A newer span overrides the same key on the overlap.
    r2.format(3, 8, "bold", None).unwrap();
    net.flush();
    assert_eq!(r1.format_at(2).unwrap().get("bold"), Some(&"true".to_string()));
    assert_eq!(r1.format_at(4).unwrap().get("bold"), None);

    let runs = r1.formatted_runs().unwrap();
    assert_eq!(runs[0].0, "hel");
    assert!(runs[0].1.contains_key("bold"));
}

#[test]
fn test_rich_text_open_end_grows() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let r1 = d1.register("rich", RichText::<String>::new).unwrap();
    r1.insert(0, "ab").unwrap();
    r1.format(0, 2, "italic", Some("yes".into())).unwrap();
    r1.insert(2, "c").unwrap();
    // The end-of-document span stretches over the appended char.
    assert_eq!(r1.format_at(2).unwrap().get("italic"), Some(&"yes".to_string()));
}

#[test]
fn test_register_conflicts_and_lww() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let d2 = net.add("zzzzzzzzzzz");
    let v1 = d1.register("color", MvRegister::<String>::new_lww).unwrap();
    let v2 = d2.register("color", MvRegister::<String>::new_lww).unwrap();

    v1.set("red".into()).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    v2.set("blue".into()).unwrap();
    net.flush();

    // Concurrent writes: both survive as conflicts, ordered by sender.
    assert_eq!(v1.conflicts(), vec!["red".to_string(), "blue".to_string()]);
    assert_eq!(v1.conflicts(), v2.conflicts());
    // Later wall clock wins (and the higher sender id breaks ms ties the
    // same way).
    assert_eq!(v1.value(), Some("blue".to_string()));
    assert_eq!(v2.value(), Some("blue".to_string()));

    // A causally-later write replaces both.
    v1.set("green".into()).unwrap();
    net.flush();
    assert_eq!(v2.conflicts(), vec!["green".to_string()]);
}

#[test]
fn test_map_conflicts_and_delete() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let d2 = net.add("bbbbbbbbbbb");
    let m1 = d1.register("map", ValueMap::<String, String>::new).unwrap();
    let m2 = d2.register("map", ValueMap::<String, String>::new).unwrap();

    m1.set("k".into(), "A".into()).unwrap();
    m2.set("k".into(), "B".into()).unwrap();
    net.flush();
    // Both concurrent writes visible, ordered by sender id.
    assert_eq!(m1.get_conflicts(&"k".into()), vec!["A".to_string(), "B".to_string()]);
    assert_eq!(m2.get_conflicts(&"k".into()), m1.get_conflicts(&"k".into()));
    assert_eq!(m1.get(&"k".into()), Some("A".to_string()));

    // Delete observed-removes; a concurrent set survives it.
    m1.delete("k".into()).unwrap();
    m2.set("k".into(), "C".into()).unwrap();
    net.flush();
    assert_eq!(m1.get(&"k".into()), Some("C".to_string()));
    assert_eq!(m2.get(&"k".into()), Some("C".to_string()));

    m1.delete("k".into()).unwrap();
    net.flush();
    assert!(!m2.has(&"k".into()));
    assert_eq!(m2.len(), 0);
}

#[test]
fn test_lazy_map_presence_follows_state() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let d2 = net.add("bbbbbbbbbbb");
    let m1 = d1
        .register("lazy", |ctx| LazyMap::<String, Counter>::new(ctx, Counter::new))
        .unwrap();
    let m2 = d2
        .register("lazy", |ctx| LazyMap::<String, Counter>::new(ctx, Counter::new))
        .unwrap();

    // Untouched keys exist but are not present.
    assert!(!m1.has(&"hits".into()));
    let c = m1.get(&"hits".into()).unwrap();
    assert!(!m1.has(&"hits".into()));

    c.add(2).unwrap();
    net.flush();
    assert!(m1.has(&"hits".into()));
    assert!(m2.has(&"hits".into()));
    assert_eq!(m2.get(&"hits".into()).unwrap().value(), 2);
    assert_eq!(m2.present_keys(), vec!["hits".to_string()]);
}

#[test]
fn test_collab_set_semantics() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let d2 = net.add("bbbbbbbbbbb");
    let s1 = d1
        .register("set", |ctx| {
            CollabSet::<Counter, String>::new(ctx, SetSemantics::Archiving, |cctx, _| {
                Counter::new(cctx)
            })
        })
        .unwrap();
    let s2 = d2
        .register("set", |ctx| {
            CollabSet::<Counter, String>::new(ctx, SetSemantics::Archiving, |cctx, _| {
                Counter::new(cctx)
            })
        })
        .unwrap();

    let c = s1.add("first".into()).unwrap();
    c.add(7).unwrap();
    net.flush();
    assert_eq!(s2.len(), 1);
    let (id, c2) = s2.iter().pop().unwrap();
    assert_eq!(c2.value(), 7);

    // Archive is reversible presence.
    s2.archive(&id).unwrap();
    net.flush();
    assert!(!s1.has(&id));
    assert!(s1.is_archived(&id));
    s1.restore(&id).unwrap();
    net.flush();
    assert!(s2.has(&id));

    // Delete is permanent; late element messages are dropped.
    s2.delete(&id).unwrap();
    c.add(1).unwrap();
    net.flush();
    assert!(s1.get(&id).is_none());
    assert!(s2.get(&id).is_none());
}

#[test]
fn test_collab_list_move_keeps_identity() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let d2 = net.add("bbbbbbbbbbb");
    let l1 = d1
        .register("list", |ctx| {
            CollabList::<Counter, String>::new(ctx, |cctx, _| Counter::new(cctx))
        })
        .unwrap();
    let l2 = d2
        .register("list", |ctx| {
            CollabList::<Counter, String>::new(ctx, |cctx, _| Counter::new(cctx))
        })
        .unwrap();

    let a = l1.insert(0, "a".into()).unwrap();
    l1.insert(1, "b".into()).unwrap();
    l1.insert(2, "c".into()).unwrap();
    a.add(5).unwrap();
    net.flush();
    assert_eq!(l2.len(), 3);
    assert_eq!(l2.get(0).unwrap().value(), 5);

    // Move the first entry to the end; identity and state survive.
    let id = l1.id_at(0).unwrap();
    l1.move_range(0, 3, 1).unwrap();
    net.flush();
    assert_eq!(l1.id_at(2), Some(id.clone()));
    assert_eq!(l2.id_at(2), Some(id.clone()));
    assert_eq!(l2.get(2).unwrap().value(), 5);

    // Archive hides, restore brings back at the same spot.
    l2.archive(&id).unwrap();
    net.flush();
    assert_eq!(l1.len(), 2);
    l1.restore(&id).unwrap();
    net.flush();
    assert_eq!(l2.len(), 3);
    assert_eq!(l2.id_at(2), Some(id));
}

#[test]
fn test_counter_reset_scenario() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let d2 = net.add("bbbbbbbbbbb");
    let c1 = d1.register("count", Counter::new).unwrap();
    let c2 = d2.register("count", Counter::new).unwrap();

    c1.add(5).unwrap();
    c2.add(3).unwrap();
    net.flush();
    assert_eq!(c1.value(), 8);
    assert_eq!(c2.value(), 8);

    c1.reset().unwrap();
    net.flush();
    assert_eq!(c1.value(), 0);
    assert_eq!(c2.value(), 0);

    c2.add(7).unwrap();
    net.flush();
    assert_eq!(c1.value(), 7);
    assert_eq!(c2.value(), 7);
}

#[test]
fn test_counter_reset_misses_concurrent_add() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let d2 = net.add("bbbbbbbbbbb");
    let c1 = d1.register("count", Counter::new).unwrap();
    let c2 = d2.register("count", Counter::new).unwrap();

    c1.add(5).unwrap();
    net.flush();
    // c2 adds concurrently with c1's reset: the add survives.
    c2.add(3).unwrap();
    c1.reset().unwrap();
    net.flush();
    assert_eq!(c1.value(), 3);
    assert_eq!(c2.value(), 3);
}

#[test]
fn test_counter_rejects_out_of_range_wire_values() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let c1 = d1.register("count", Counter::new).unwrap();
    c1.add(5).unwrap();

    // A hostile transaction carrying an add beyond the modulus.
    #[derive(serde::Serialize)]
    enum EvilOp {
        Add { amount: u64 },
    }
    let evil = ReplicaId::new("zzzzzzzzzzz").unwrap();
    let blob = coalesce_wire::MessageBlob {
        sender: evil.clone(),
        sender_counter: 1,
        lamport: None,
        wall_clock_ms: None,
        vc_entries: vec![coalesce_wire::VcEntry {
            replica: evil,
            counter: 1,
            maximal: true,
        }],
        fragments: vec![vec![
            coalesce_wire::PathSegment::Key(
                coalesce_wire::encode(&EvilOp::Add { amount: u64::MAX }).unwrap(),
            ),
            coalesce_wire::PathSegment::name("count"),
        ]],
    };
    let bytes = coalesce_wire::encode(&blob).unwrap();
    assert!(d1.receive(&bytes, None).is_err());
    assert_eq!(c1.value(), 5);
}

#[test]
fn test_signed_counter() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let d2 = net.add("bbbbbbbbbbb");
    let c1 = d1.register("signed", SignedCounter::new).unwrap();
    let c2 = d2.register("signed", SignedCounter::new).unwrap();

    c1.add(10).unwrap();
    c2.add(-4).unwrap();
    net.flush();
    assert_eq!(c1.value(), 6);
    assert_eq!(c2.value(), 6);
    c2.subtract(10).unwrap();
    net.flush();
    assert_eq!(c1.value(), -4);
}

#[test]
fn test_presence_set_heartbeat_expiry() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let d2 = net.add("bbbbbbbbbbb");
    let p1 = d1
        .register("here", |ctx| {
            Presence::<String>::with_ttl(ctx, Duration::from_millis(30))
        })
        .unwrap();
    let p2 = d2
        .register("here", |ctx| {
            Presence::<String>::with_ttl(ctx, Duration::from_millis(30))
        })
        .unwrap();

    p1.set("alice".into(), false).unwrap();
    net.flush();
    assert_eq!(p2.get(&d1.replica_id()), Some("alice".to_string()));

    // A joiner with request_all makes p1 re-announce on its next poll.
    p2.set("bob".into(), true).unwrap();
    net.flush();
    p1.poll().unwrap();
    net.flush();
    assert_eq!(p2.get(&d1.replica_id()), Some("alice".to_string()));
    assert_eq!(p1.get(&d2.replica_id()), Some("bob".to_string()));

    // Silence past the TTL fades the peer out locally.
    std::thread::sleep(Duration::from_millis(40));
    let gone = Rc::new(RefCell::new(Vec::new()));
    {
        let gone = gone.clone();
        p2.on_event(move |ev| {
            if let crate::PresenceEvent::Delete { replica } = ev {
                gone.borrow_mut().push(replica.clone());
            }
        });
    }
    p2.poll().unwrap();
    assert_eq!(p2.get(&d1.replica_id()), None);
    assert_eq!(gone.borrow().len(), 1);

    // Updates refresh and patch.
    p2.update(|v| v.push_str("!!")).unwrap();
    net.flush();
    assert_eq!(p1.get(&d2.replica_id()), Some("bob!!".to_string()));
}

#[test]
fn test_whole_doc_save_load() {
    let mut net = Network::new();
    let d1 = net.add("aaaaaaaaaaa");
    let t1 = d1.register("text", Text::new).unwrap();
    let c1 = d1.register("count", Counter::new).unwrap();
    t1.insert(0, "abc").unwrap();
    c1.add(5).unwrap();

    let saved = d1.save().unwrap();
    let d3 = Doc::new(DocOptions {
        debug_replica_id: Some(ReplicaId::new("ccccccccccc").unwrap()),
        ..Default::default()
    });
    let t3 = d3.register("text", Text::new).unwrap();
    let c3 = d3.register("count", Counter::new).unwrap();
    assert!(d3.load(&saved, None).unwrap());
    assert_eq!(t3.text(), "abc");
    assert_eq!(c3.value(), 5);
    assert_eq!(d3.vector_clock(), d1.vector_clock());
}
