use crate::segment::PathSegment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One node of a saved-state tree: an opaque self-payload plus subtrees
/// keyed by child name. Collabs that save nothing of their own use an
/// empty payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedNode {
    pub payload: Vec<u8>,
    pub children: BTreeMap<PathSegment, SavedNode>,
}

impl SavedNode {
    pub fn with_payload(payload: Vec<u8>) -> Self {
        SavedNode {
            payload,
            children: BTreeMap::new(),
        }
    }
}

/// A whole-document snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedDoc {
    pub causal: Vec<u8>,
    pub tree: SavedNode,
}
