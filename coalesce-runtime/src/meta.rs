use coalesce_base::ReplicaId;
use coalesce_causal::VectorClock;
use std::collections::BTreeMap;

/// How operations outside an explicit `transact` are grouped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AutoTransactions {
    /// Keep an implicit transaction open until the next runtime entry
    /// point (receive/save/load/transact) or an explicit commit.
    #[default]
    Deferred,
    /// Every operation commits its own transaction.
    PerOp,
    /// Operations outside `transact` are misuse errors.
    Error,
}

/// Options accepted by the runtime constructor. No CLI, no environment.
#[derive(Clone, Debug, Default)]
pub struct DocOptions {
    /// Skip readiness checks; the transport already guarantees causal
    /// order.
    pub causality_guaranteed: bool,
    pub auto_transactions: AutoTransactions,
    /// Fixed replica id instead of a random one (debugging only).
    pub debug_replica_id: Option<ReplicaId>,
    /// Deliver load events even when the saved state is a strict subset
    /// of local state.
    pub allow_redundant_loads: bool,
}

/// Metadata a collab asks the runtime to attach to the transaction its
/// operation rides in. Collabs must only read back fields they requested.
#[derive(Clone, Debug, Default)]
pub struct MetaRequest {
    pub lamport: bool,
    pub wall_clock: bool,
    pub vc_entries: Vec<ReplicaId>,
}

impl MetaRequest {
    pub fn none() -> Self {
        MetaRequest::default()
    }

    pub fn lamport() -> Self {
        MetaRequest {
            lamport: true,
            ..Default::default()
        }
    }

    pub fn wall_clock() -> Self {
        MetaRequest {
            wall_clock: true,
            ..Default::default()
        }
    }

    pub fn with_vc_entries(mut self, replicas: Vec<ReplicaId>) -> Self {
        self.vc_entries = replicas;
        self
    }
}

/// Per-transaction metadata handed to every collab a fragment reaches.
#[derive(Clone, Debug)]
pub struct UpdateMeta {
    pub sender: ReplicaId,
    pub sender_counter: u64,
    pub lamport: Option<u64>,
    pub wall_clock_ms: Option<u64>,
    /// True on the local echo path, false for remote deliveries.
    pub is_local: bool,
    pub caller: Option<String>,
    pub(crate) vc_entries: BTreeMap<ReplicaId, u64>,
}

impl UpdateMeta {
    /// The sender's knowledge of `replica` when it sent, as far as the
    /// carried entries record it. The sender's own entry is always the
    /// transaction counter itself.
    pub fn vc_entry(&self, replica: &ReplicaId) -> u64 {
        if *replica == self.sender {
            return self.sender_counter;
        }
        self.vc_entries.get(replica).copied().unwrap_or(0)
    }
}

/// Metadata handed to every collab during a saved-state merge.
#[derive(Clone, Debug)]
pub struct LoadMeta {
    /// The local vector clock before the merge.
    pub local_vc: VectorClock,
    /// The saved state's vector clock.
    pub remote_vc: VectorClock,
    pub caller: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SendEvent {
    pub message: Vec<u8>,
    pub sender: ReplicaId,
    pub sender_counter: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateKind {
    Message,
    SavedState,
}

#[derive(Clone, Debug)]
pub struct UpdateEvent {
    pub kind: UpdateKind,
    pub sender: Option<ReplicaId>,
    pub sender_counter: Option<u64>,
    pub is_local: bool,
    pub caller: Option<String>,
}
