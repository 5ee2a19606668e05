use crate::{decode, encode, MessageBlob, PathSegment, SavedDoc, SavedNode, VcEntry};
use coalesce_base::ReplicaId;
use std::collections::BTreeMap;
use test_log::test;

fn rid(s: &str) -> ReplicaId {
    ReplicaId::new(s).unwrap()
}

#[test]
fn test_message_roundtrip() {
    let msg = MessageBlob {
        sender: rid("alice-------"),
        sender_counter: 3,
        lamport: Some(17),
        wall_clock_ms: None,
        vc_entries: vec![
            VcEntry {
                replica: rid("alice-------"),
                counter: 3,
                maximal: true,
            },
            VcEntry {
                replica: rid("bob---------"),
                counter: 9,
                maximal: false,
            },
        ],
        fragments: vec![vec![
            PathSegment::key(vec![0x81, 0x00]),
            PathSegment::name("text"),
        ]],
    };
    let bytes = encode(&msg).unwrap();
    let back: MessageBlob = decode(&bytes).unwrap();
    assert_eq!(back, msg);
}

#[test]
fn test_segment_tag_survives() {
    // A name and a key with identical bytes must stay distinct.
    let name = PathSegment::name("abc");
    let key = PathSegment::key(b"abc".to_vec());
    let pair = (name.clone(), key.clone());
    let back: (PathSegment, PathSegment) = decode(&encode(&pair).unwrap()).unwrap();
    assert_eq!(back.0, name);
    assert_eq!(back.1, key);
    assert_ne!(back.0, back.1);
}

#[test]
fn test_saved_tree_roundtrip() {
    let mut children = BTreeMap::new();
    children.insert(
        PathSegment::name("list"),
        SavedNode::with_payload(vec![1, 2, 3]),
    );
    let doc = SavedDoc {
        causal: vec![9, 9],
        tree: SavedNode {
            payload: vec![],
            children,
        },
    };
    let back: SavedDoc = decode(&encode(&doc).unwrap()).unwrap();
    assert_eq!(back, doc);
}

#[test]
fn test_garbage_rejected() {
    let res: coalesce_base::Result<MessageBlob> = decode(&[0xc1, 0xff, 0x00]);
    assert!(res.is_err());
}
