// The collab portfolio: concrete CRDTs built on the runtime, the causal
// metadata it stamps onto transactions, and (for the sequence types) the
// position source.
//
// Conventions shared by every collab here:
//
// - Constructors have the shape `new(ctx, ...) -> Rc<Self>`; the context
//   is consumed once and held for the collab's lifetime.
// - Local mutators validate their inputs, then send; all state changes
//   happen on the echo/delivery path so local and remote replicas run
//   the same code.
// - Ops are one leaf Key segment holding a msgpack-encoded op enum.
// - Saved payloads merge idempotently; dominance questions are settled
//   with the vector clocks carried in the load metadata.

mod clist;
mod counter;
mod lazy_map;
mod list;
mod map;
mod presence;
mod register;
mod rich_text;
mod set;
mod text;

pub use clist::{CollabList, CollabListEvent};
pub use counter::{Counter, CounterEvent, SignedCounter};
pub use lazy_map::LazyMap;
pub use list::{ListEvent, ValueList};
pub use map::{MapEvent, ValueMap};
pub use presence::{Presence, PresenceEvent};
pub use register::{ConflictRule, MvEntry, MvRegister, RegisterEvent};
pub use rich_text::{RichText, Span, SpanLog};
pub use set::{CollabSet, ElementId, SetSemantics};
pub use text::{Text, TextEvent};

use serde::{de::DeserializeOwned, Serialize};

/// Bound bundle for values stored in collabs.
pub trait Value: Clone + Serialize + DeserializeOwned + 'static {}
impl<T: Clone + Serialize + DeserializeOwned + 'static> Value for T {}

/// Bound bundle for map keys.
pub trait Key: Value + Ord {}
impl<T: Value + Ord> Key for T {}

#[cfg(test)]
mod test;
