use crate::segment::PathSegment;
use coalesce_base::{safe_u64, ReplicaId, Result};
use serde::{Deserialize, Serialize};

/// One carried vector-clock entry. `maximal` marks entries belonging to the
/// causally maximal set at send time; the rest were explicitly requested by
/// some collab in the transaction (multi-value registers do this).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcEntry {
    pub replica: ReplicaId,
    pub counter: u64,
    pub maximal: bool,
}

/// A serialized transaction: everything one replica produced between two
/// transaction boundaries, delivered atomically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBlob {
    pub sender: ReplicaId,
    pub sender_counter: u64,
    pub lamport: Option<u64>,
    pub wall_clock_ms: Option<u64>,
    pub vc_entries: Vec<VcEntry>,
    pub fragments: Vec<Vec<PathSegment>>,
}

impl MessageBlob {
    /// Range-check every counter the blob carries. Decoded transactions
    /// are rejected, not wrapped, when a value leaves the 53-bit safe
    /// range.
    pub fn validate(&self) -> Result<()> {
        safe_u64(self.sender_counter)?;
        if let Some(l) = self.lamport {
            safe_u64(l)?;
        }
        if let Some(w) = self.wall_clock_ms {
            safe_u64(w)?;
        }
        for e in &self.vc_entries {
            safe_u64(e.counter)?;
        }
        Ok(())
    }
}
