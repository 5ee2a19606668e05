use coalesce_base::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Replica id -> highest delivered sender counter. A missing entry reads
/// as zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<ReplicaId, u64>);

impl VectorClock {
    pub fn new() -> Self {
        VectorClock(BTreeMap::new())
    }

    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    /// Advance one entry, never backwards.
    pub fn set_max(&mut self, replica: &ReplicaId, counter: u64) {
        let slot = self.0.entry(replica.clone()).or_insert(0);
        *slot = (*slot).max(counter);
    }

    pub fn increment(&mut self, replica: &ReplicaId) -> u64 {
        let slot = self.0.entry(replica.clone()).or_insert(0);
        *slot += 1;
        *slot
    }

    /// Pointwise max.
    pub fn merge(&mut self, other: &VectorClock) {
        for (replica, counter) in other.iter() {
            self.set_max(replica, counter);
        }
    }

    /// True when every entry of `other` is covered by this clock.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other.iter().all(|(r, c)| self.get(r) >= c)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, u64)> {
        self.0.iter().map(|(r, c)| (r, *c))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
