// Causal delivery for one document.
//
// The buffer tracks a vector clock (per-replica highest delivered sender
// counter), a Lamport clock, and the causally maximal subset of the clock:
// the senders whose latest delivered transaction is not in the causal past
// of any other delivered transaction. Outgoing transactions stamp only the
// maximal entries; transitively-dominated dependencies are implied and
// never shipped.
//
// A transaction (S, c) with maximal entries M is ready when vc[S] == c - 1
// and vc[k] >= v for every (k, v) in M other than S itself. Transactions
// arriving early sit in a pending map keyed by (sender, counter); every
// delivery rescans the pending map until nothing more is ready.

mod buffer;
mod clock;

pub use buffer::{CausalBuffer, LoadReport, Processed};
pub use clock::VectorClock;

#[cfg(test)]
mod test;
