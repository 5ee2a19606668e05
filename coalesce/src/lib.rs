// Composable operation-based CRDTs for collaborative documents.
//
// A `Doc` is one replica of a document: a tree of collabs that turn
// local operations into opaque message blobs (the Send event) and apply
// remote blobs back into identical state everywhere, with causal order
// enforced by a built-in buffer. Saved states merge, so replicas can
// sync from snapshots as well as live messages.
//
//     use coalesce::{Doc, DocOptions, Text};
//
//     let doc = Doc::new(DocOptions::default());
//     let text = doc.register("text", Text::new)?;
//     doc.on_send(|ev| broadcast(&ev.message));
//     doc.transact(|| text.insert(0, "hello"))??;
//     // elsewhere: other_doc.receive(&blob, None)?;
//
// The subsystem crates are re-exported here; this crate adds nothing
// but the public surface and the cross-replica test suite.

pub use coalesce_base::{err, Error, ReplicaId, Result};
pub use coalesce_causal::{CausalBuffer, VectorClock};
pub use coalesce_collab::{
    CollabList, CollabListEvent, CollabSet, ConflictRule, Counter, CounterEvent, ElementId, Key,
    LazyMap, ListEvent, MapEvent, MvEntry, MvRegister, Presence, PresenceEvent, RegisterEvent,
    RichText, SetSemantics, SignedCounter, Span, SpanLog, Text, TextEvent, Value, ValueList,
    ValueMap,
};
pub use coalesce_pos::{Bias, CharRuns, OrderedIndex, Position, PositionSource, WaypointDesc};
pub use coalesce_runtime::{
    AutoTransactions, Collab, CollabContext, Doc, DocOptions, LoadMeta, MessagePath, MetaRequest,
    ParentCollab, SendEvent, UpdateEvent, UpdateKind, UpdateMeta,
};
pub use coalesce_wire::{MessageBlob, PathSegment, SavedDoc, SavedNode};

#[cfg(test)]
mod test;
