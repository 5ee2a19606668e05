// The document runtime: one replica of one collaborative document.
//
// A document is a tree of collabs rooted at the runtime. Local operations
// travel up the tree as message fragments (each ancestor appending its
// child's name), get stamped with transaction metadata, are echoed back
// down the tree so local state matches what remote replicas will compute,
// and are emitted as opaque Send blobs on transaction commit. Received
// blobs pass through the causal buffer and are routed back down the tree
// fragment by fragment.
//
// Everything is single-threaded: the tree is Rc/RefCell, parents own
// children, children hold weak handles upward. Reentrancy is policed at
// the root: no sends during delivery, no nested receives, no saves inside
// a transaction.

mod context;
mod doc;
mod meta;

pub use context::{Collab, CollabContext, MessagePath, ParentCollab, ParentHandle};
pub use doc::{Doc, DocCore};
pub use meta::{
    AutoTransactions, DocOptions, LoadMeta, MetaRequest, SendEvent, UpdateEvent, UpdateKind,
    UpdateMeta,
};
