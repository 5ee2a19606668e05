// Dense total order for list and text CRDTs.
//
// A position names one slot in a sequence: (sender, counter, value_index).
// Positions are allocated in bursts; one burst by one sender between one
// pair of neighbors is a _waypoint_, and a position is the value_index-th
// slot of its waypoint. Storage is linear in waypoints, not in positions,
// so a replica typing a million characters left to right costs one
// waypoint.
//
// Waypoints form a tree under a synthetic root owned by the empty sender.
// Each waypoint attaches to a parent value as a left or right child, and
// the sequence order is the in-order walk: for value i of a waypoint,
// left children at i (ascending sender), the value itself, right children
// at i (ascending sender), then onward to i+1. A waypoint's own
// continuation therefore sits after every right child of the previous
// value, which is what lets two concurrent left-to-right runs stay
// contiguous instead of interleaving.
//
// The ordered index layers values on top: per waypoint, alternating
// present/deleted runs (trailing deleted runs are implicit) plus a cached
// subtree total per waypoint, giving index <-> position translation that
// walks the tree instead of the sequence.

mod index;
mod runs;
mod source;

pub use index::{Bias, LoadDelta, OrderedIndex};
pub use runs::{CharRuns, RunBuffer};
pub use source::{Position, PositionSource, WaypointDesc};

#[cfg(test)]
mod test;
