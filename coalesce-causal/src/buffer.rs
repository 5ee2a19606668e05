use crate::clock::VectorClock;
use coalesce_base::{safe_u64, ReplicaId, Result};
use coalesce_wire::{decode, encode, MessageBlob};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Outcome of handing one transaction to the buffer.
#[derive(Debug)]
pub enum Processed {
    /// The transaction and any pending transactions it unblocked, in
    /// delivery order.
    Delivered(Vec<MessageBlob>),
    /// Not causally ready yet; parked in the pending buffer.
    Buffered,
    /// Already delivered (covers a replica receiving its own sends back).
    Duplicate,
}

/// Per-sender `(pre, post)` counters observed while merging a saved causal
/// state, plus the incoming clock itself. Collab merges use the clocks to
/// decide entry dominance; the runtime uses the counters to classify a
/// load as redundant.
#[derive(Debug)]
pub struct LoadReport {
    pub remote_vc: VectorClock,
    pub senders: Vec<(ReplicaId, u64, u64)>,
}

impl LoadReport {
    /// True when the incoming state held nothing beyond the local clock.
    pub fn is_redundant(&self) -> bool {
        self.senders.iter().all(|(_, pre, post)| post <= pre)
    }
}

#[derive(Serialize, Deserialize)]
struct CausalState {
    vc: VectorClock,
    lamport: u64,
    maximal: Vec<ReplicaId>,
    pending: Vec<MessageBlob>,
}

pub struct CausalBuffer {
    local: ReplicaId,
    vc: VectorClock,
    lamport: u64,
    maximal: BTreeSet<ReplicaId>,
    pending: BTreeMap<(ReplicaId, u64), MessageBlob>,
    causality_guaranteed: bool,
}

impl CausalBuffer {
    pub fn new(local: ReplicaId, causality_guaranteed: bool) -> Self {
        CausalBuffer {
            local,
            vc: VectorClock::new(),
            lamport: 0,
            maximal: BTreeSet::new(),
            pending: BTreeMap::new(),
            causality_guaranteed,
        }
    }

    pub fn vc(&self) -> &VectorClock {
        &self.vc
    }

    pub fn lamport(&self) -> u64 {
        self.lamport
    }

    /// Size of the pending buffer. Grows without bound if transactions
    /// keep arriving out of order; callers watch this to decide when to
    /// ask a peer for a saved state instead.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot of the causally maximal entries as (replica, counter).
    pub fn maximal_entries(&self) -> Vec<(ReplicaId, u64)> {
        self.maximal
            .iter()
            .map(|r| (r.clone(), self.vc.get(r)))
            .collect()
    }

    /// Open a new local transaction: advance our own clock entry and the
    /// Lamport clock. The new transaction dominates everything delivered
    /// so far, so the maximal set collapses to ourselves.
    pub fn tick(&mut self) -> u64 {
        let counter = self.vc.increment(&self.local);
        self.lamport += 1;
        self.maximal.clear();
        self.maximal.insert(self.local.clone());
        counter
    }

    fn is_ready(&self, msg: &MessageBlob) -> bool {
        if self.causality_guaranteed {
            return true;
        }
        if self.vc.get(&msg.sender) != msg.sender_counter.saturating_sub(1) {
            return false;
        }
        msg.vc_entries
            .iter()
            .filter(|e| e.maximal && e.replica != msg.sender)
            .all(|e| self.vc.get(&e.replica) >= e.counter)
    }

    fn note_delivered(&mut self, msg: &MessageBlob) {
        self.vc.set_max(&msg.sender, msg.sender_counter);
        if let Some(l) = msg.lamport {
            self.lamport = self.lamport.max(l);
        }
        if self.causality_guaranteed {
            return;
        }
        // Entries the message depended on are now dominated by it, unless
        // we have since seen something newer from that replica.
        for e in msg.vc_entries.iter().filter(|e| e.maximal) {
            if e.replica != msg.sender && self.vc.get(&e.replica) == e.counter {
                self.maximal.remove(&e.replica);
            }
        }
        self.maximal.insert(msg.sender.clone());
    }

    /// Hand one received transaction to the buffer.
    pub fn process(&mut self, msg: MessageBlob) -> Processed {
        if msg.sender_counter <= self.vc.get(&msg.sender) {
            debug!(target: "coalesce", sender = %msg.sender, counter = msg.sender_counter,
                   "dropping duplicate transaction");
            return Processed::Duplicate;
        }
        if !self.is_ready(&msg) {
            debug!(target: "coalesce", sender = %msg.sender, counter = msg.sender_counter,
                   pending = self.pending.len() + 1, "buffering out-of-order transaction");
            let key = (msg.sender.clone(), msg.sender_counter);
            self.pending.entry(key).or_insert(msg);
            return Processed::Buffered;
        }
        self.note_delivered(&msg);
        let mut delivered = vec![msg];
        delivered.extend(self.drain_ready());
        Processed::Delivered(delivered)
    }

    /// Rescan the pending buffer, delivering whatever has become ready.
    /// Restarts after every hit since each delivery can unblock more.
    pub fn drain_ready(&mut self) -> Vec<MessageBlob> {
        let mut out = Vec::new();
        loop {
            let key = self
                .pending
                .iter()
                .find(|(_, msg)| self.is_ready(msg))
                .map(|(k, _)| k.clone());
            let Some(key) = key else { break };
            let msg = self.pending.remove(&key).unwrap_or_else(|| unreachable!());
            // A buffered transaction can have been superseded by a merge.
            if msg.sender_counter <= self.vc.get(&msg.sender) {
                continue;
            }
            self.note_delivered(&msg);
            out.push(msg);
        }
        out
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        encode(&CausalState {
            vc: self.vc.clone(),
            lamport: self.lamport,
            maximal: self.maximal.iter().cloned().collect(),
            pending: self.pending.values().cloned().collect(),
        })
    }

    /// Merge a saved causal state into this one: clocks pointwise max,
    /// Lamport max, pending buffers unioned, maximal set recomputed from
    /// both sides. The recomputation keeps any entry still at the merged
    /// clock value; that can over-approximate, which only makes outgoing
    /// dependency stamps stronger, never wrong.
    pub fn load(&mut self, bytes: &[u8]) -> Result<LoadReport> {
        let state: CausalState = decode(bytes)?;
        for (_, counter) in state.vc.iter() {
            safe_u64(counter)?;
        }
        safe_u64(state.lamport)?;
        for msg in &state.pending {
            msg.validate()?;
        }
        let mut senders = Vec::new();
        for (replica, counter) in state.vc.iter() {
            senders.push((replica.clone(), self.vc.get(replica), counter));
        }
        let pre = self.vc.clone();
        self.vc.merge(&state.vc);
        self.lamport = self.lamport.max(state.lamport);

        let mut maximal = BTreeSet::new();
        for r in self.maximal.iter() {
            if pre.get(r) == self.vc.get(r) {
                maximal.insert(r.clone());
            }
        }
        for r in state.maximal.iter() {
            if state.vc.get(r) == self.vc.get(r) {
                maximal.insert(r.clone());
            }
        }
        self.maximal = maximal;

        let mut merged = 0usize;
        for msg in state.pending {
            if msg.sender_counter <= self.vc.get(&msg.sender) {
                continue;
            }
            let key = (msg.sender.clone(), msg.sender_counter);
            if self.pending.contains_key(&key) {
                continue;
            }
            self.pending.insert(key, msg);
            merged += 1;
        }
        if merged > 0 {
            warn!(target: "coalesce", merged, "saved state carried undelivered transactions");
        }
        Ok(LoadReport {
            remote_vc: state.vc,
            senders,
        })
    }
}
