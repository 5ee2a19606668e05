use crate::{CausalBuffer, Processed};
use coalesce_base::ReplicaId;
use coalesce_wire::{MessageBlob, VcEntry};
use test_log::test;

fn rid(s: &str) -> ReplicaId {
    ReplicaId::new(s).unwrap()
}

fn msg(sender: &ReplicaId, counter: u64, deps: &[(&ReplicaId, u64)]) -> MessageBlob {
    let mut vc_entries = vec![VcEntry {
        replica: sender.clone(),
        counter,
        maximal: true,
    }];
    for (r, c) in deps {
        vc_entries.push(VcEntry {
            replica: (*r).clone(),
            counter: *c,
            maximal: true,
        });
    }
    MessageBlob {
        sender: sender.clone(),
        sender_counter: counter,
        lamport: Some(counter),
        wall_clock_ms: None,
        vc_entries,
        fragments: vec![],
    }
}

fn delivered_counters(p: Processed) -> Vec<u64> {
    match p {
        Processed::Delivered(v) => v.into_iter().map(|m| m.sender_counter).collect(),
        _ => vec![],
    }
}

#[test]
fn test_in_order_delivery() {
    let a = rid("aaaaaaaaaaa");
    let b = rid("bbbbbbbbbbb");
    let mut buf = CausalBuffer::new(a.clone(), false);
    assert_eq!(delivered_counters(buf.process(msg(&b, 1, &[]))), vec![1]);
    assert_eq!(delivered_counters(buf.process(msg(&b, 2, &[]))), vec![2]);
    assert_eq!(buf.vc().get(&b), 2);
}

#[test]
fn test_out_of_order_buffers_then_drains() {
    let a = rid("aaaaaaaaaaa");
    let b = rid("bbbbbbbbbbb");
    let mut buf = CausalBuffer::new(a.clone(), false);
    assert!(matches!(buf.process(msg(&b, 2, &[])), Processed::Buffered));
    assert!(matches!(buf.process(msg(&b, 3, &[])), Processed::Buffered));
    assert_eq!(buf.pending_len(), 2);
    // Delivering 1 unblocks 2 and 3 in order.
    assert_eq!(delivered_counters(buf.process(msg(&b, 1, &[]))), vec![1, 2, 3]);
    assert_eq!(buf.pending_len(), 0);
    assert_eq!(buf.vc().get(&b), 3);
}

#[test]
fn test_cross_sender_dependency() {
    let a = rid("aaaaaaaaaaa");
    let b = rid("bbbbbbbbbbb");
    let c = rid("ccccccccccc");
    let mut buf = CausalBuffer::new(a.clone(), false);
    // c's first transaction depends on b's first.
    assert!(matches!(
        buf.process(msg(&c, 1, &[(&b, 1)])),
        Processed::Buffered
    ));
    assert_eq!(delivered_counters(buf.process(msg(&b, 1, &[]))), vec![1, 1]);
    assert_eq!(buf.vc().get(&c), 1);
}

#[test]
fn test_duplicates_dropped() {
    let a = rid("aaaaaaaaaaa");
    let b = rid("bbbbbbbbbbb");
    let mut buf = CausalBuffer::new(a.clone(), false);
    buf.process(msg(&b, 1, &[]));
    assert!(matches!(buf.process(msg(&b, 1, &[])), Processed::Duplicate));
    // Our own transactions come back as duplicates too.
    let counter = buf.tick();
    assert!(matches!(
        buf.process(msg(&a, counter, &[])),
        Processed::Duplicate
    ));
}

#[test]
fn test_tick_collapses_maximal_set() {
    let a = rid("aaaaaaaaaaa");
    let b = rid("bbbbbbbbbbb");
    let mut buf = CausalBuffer::new(a.clone(), false);
    buf.process(msg(&b, 1, &[]));
    assert_eq!(buf.maximal_entries(), vec![(b.clone(), 1)]);
    buf.tick();
    assert_eq!(buf.maximal_entries(), vec![(a.clone(), 1)]);
}

#[test]
fn test_delivery_compresses_maximal_set() {
    let a = rid("aaaaaaaaaaa");
    let b = rid("bbbbbbbbbbb");
    let c = rid("ccccccccccc");
    let mut buf = CausalBuffer::new(a.clone(), false);
    buf.process(msg(&b, 1, &[]));
    // c saw b:1, so after delivering c:1 only c remains maximal.
    buf.process(msg(&c, 1, &[(&b, 1)]));
    assert_eq!(buf.maximal_entries(), vec![(c.clone(), 1)]);
}

#[test]
fn test_causality_guaranteed_skips_checks() {
    let a = rid("aaaaaaaaaaa");
    let b = rid("bbbbbbbbbbb");
    let mut buf = CausalBuffer::new(a.clone(), true);
    assert_eq!(delivered_counters(buf.process(msg(&b, 5, &[]))), vec![5]);
    assert_eq!(buf.vc().get(&b), 5);
}

#[test]
fn test_save_load_merges() {
    let a = rid("aaaaaaaaaaa");
    let b = rid("bbbbbbbbbbb");
    let c = rid("ccccccccccc");

    let mut one = CausalBuffer::new(a.clone(), false);
    one.process(msg(&b, 1, &[]));

    let mut two = CausalBuffer::new(c.clone(), false);
    two.process(msg(&b, 1, &[]));
    two.process(msg(&b, 2, &[]));
    // two is holding b:4 hostage, waiting for b:3.
    two.process(msg(&b, 4, &[]));

    let saved = two.save().unwrap();
    let report = one.load(&saved).unwrap();
    assert!(!report.is_redundant());
    assert_eq!(one.vc().get(&b), 2);
    assert_eq!(one.pending_len(), 1);
    // b:3 arrives; b:4 drains from the merged pending buffer.
    let got = delivered_counters(one.process(msg(&b, 3, &[])));
    assert_eq!(got, vec![3, 4]);

    // Loading the same state again is redundant.
    let report = one.load(&saved).unwrap();
    assert!(report.is_redundant());
}
