// Wire shapes for the two blob kinds a document exchanges with the world:
//
// - A message blob: one transaction = metadata plus a list of message
//   fragments, each fragment a path of segments from a collab up to the
//   root (leaf payload first, root-child name last).
//
// - A saved-state blob: the causal buffer's state plus a tree mirroring
//   the collab tree, each node an opaque self-payload and a name-keyed
//   map of subtrees. The causal sub-blob is stored first and loaded first
//   so delivery predicates are current before any per-collab merge runs.
//
// Everything is MessagePack via serde: integers are variable-length,
// values are self-delimited, and map-keyed structs tolerate unknown
// fields, which is as much forward compatibility as we promise. Path
// segments keep their string/bytes distinction through an explicit tag.

mod codec;
mod message;
mod saved;
mod segment;

pub use codec::{decode, encode};
pub use message::{MessageBlob, VcEntry};
pub use saved::{SavedDoc, SavedNode};
pub use segment::PathSegment;

#[cfg(test)]
mod test;
