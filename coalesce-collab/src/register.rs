use crate::Value;
use coalesce_base::{safe_u64, ReplicaId, Result};
use coalesce_runtime::{Collab, CollabContext, LoadMeta, MessagePath, MetaRequest, UpdateMeta};
use coalesce_wire::{decode, encode, SavedNode};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

/// One live candidate of a multi-value register or map slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct MvEntry<T: Value> {
    pub sender: ReplicaId,
    pub sender_counter: u64,
    pub value: T,
    pub wall_clock_ms: Option<u64>,
}

/// How concurrent writes to one slot resolve to a single visible value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ConflictRule {
    /// Lowest sender id wins. Deterministic without any clock.
    #[default]
    BySender,
    /// Latest wall clock wins, sender id breaking ties.
    Lww,
}

pub(crate) fn pick<'a, T: Value>(
    rule: ConflictRule,
    entries: &'a [MvEntry<T>],
) -> Option<&'a MvEntry<T>> {
    match rule {
        // Entries are kept sorted by (sender, counter).
        ConflictRule::BySender => entries.first(),
        ConflictRule::Lww => entries.iter().max_by(|a, b| {
            a.wall_clock_ms
                .unwrap_or(0)
                .cmp(&b.wall_clock_ms.unwrap_or(0))
                .then_with(|| a.sender.cmp(&b.sender))
        }),
    }
}

/// Prune entries dominated by the incoming transaction. The sender asked
/// the runtime to carry vector-clock entries for every sender it saw in
/// its conflict set, so domination is decidable here.
pub(crate) fn prune<T: Value>(entries: &mut Vec<MvEntry<T>>, meta: &UpdateMeta) {
    entries.retain(|e| meta.vc_entry(&e.sender) < e.sender_counter);
}

/// Merge saved entries with local ones, using the two vector clocks to
/// decide whether a missing entry was overwritten or simply unseen.
/// Incoming counters are range-checked before anything merges.
pub(crate) fn merge_entries<T: Value>(
    local: &mut Vec<MvEntry<T>>,
    incoming: Vec<MvEntry<T>>,
    meta: &LoadMeta,
) -> Result<()> {
    for e in &incoming {
        safe_u64(e.sender_counter)?;
        if let Some(w) = e.wall_clock_ms {
            safe_u64(w)?;
        }
    }
    let had = |list: &[MvEntry<T>], e: &MvEntry<T>| {
        list.iter()
            .any(|o| o.sender == e.sender && o.sender_counter == e.sender_counter)
    };
    let mut merged: Vec<MvEntry<T>> = Vec::new();
    for e in local.iter() {
        if had(&incoming, e) || meta.remote_vc.get(&e.sender) < e.sender_counter {
            merged.push(e.clone());
        }
    }
    for e in incoming {
        if !had(&merged, &e) && meta.local_vc.get(&e.sender) < e.sender_counter {
            merged.push(e);
        }
    }
    merged.sort_by(|a, b| {
        a.sender
            .cmp(&b.sender)
            .then(a.sender_counter.cmp(&b.sender_counter))
    });
    *local = merged;
    Ok(())
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
enum RegOp<T: Value> {
    Set { value: T },
}

#[derive(Clone, Debug)]
pub enum RegisterEvent<T> {
    Set { value: T },
}

/// Multi-value register: holds every causally maximal write; `value()`
/// aggregates them with the configured rule, `conflicts()` exposes them
/// all, ordered by sender.
pub struct MvRegister<T: Value + PartialEq> {
    ctx: CollabContext,
    rule: ConflictRule,
    entries: RefCell<Vec<MvEntry<T>>>,
    subs: RefCell<Vec<Rc<dyn Fn(&RegisterEvent<T>)>>>,
}

impl<T: Value + PartialEq> MvRegister<T> {
    pub fn new(ctx: CollabContext) -> Rc<Self> {
        Self::with_rule(ctx, ConflictRule::BySender)
    }

    /// Last-writer-wins flavour: requests wall clocks and aggregates by
    /// them.
    pub fn new_lww(ctx: CollabContext) -> Rc<Self> {
        Self::with_rule(ctx, ConflictRule::Lww)
    }

    pub fn with_rule(ctx: CollabContext, rule: ConflictRule) -> Rc<Self> {
        Rc::new(MvRegister {
            ctx,
            rule,
            entries: RefCell::new(Vec::new()),
            subs: RefCell::new(Vec::new()),
        })
    }

    pub fn on_event(&self, f: impl Fn(&RegisterEvent<T>) + 'static) {
        self.subs.borrow_mut().push(Rc::new(f));
    }

    fn emit(&self, ev: &RegisterEvent<T>) {
        let subs: Vec<_> = self.subs.borrow().clone();
        for f in subs {
            f(ev);
        }
    }

    pub fn set(&self, value: T) -> Result<()> {
        let seen: Vec<ReplicaId> = self
            .entries
            .borrow()
            .iter()
            .map(|e| e.sender.clone())
            .collect();
        let req = MetaRequest {
            lamport: false,
            wall_clock: self.rule == ConflictRule::Lww,
            vc_entries: seen,
        };
        self.ctx.send_op(encode(&RegOp::Set { value })?, &req)
    }

    pub fn value(&self) -> Option<T> {
        pick(self.rule, &self.entries.borrow()).map(|e| e.value.clone())
    }

    /// All live candidates, ordered by sender.
    pub fn conflicts(&self) -> Vec<T> {
        self.entries.borrow().iter().map(|e| e.value.clone()).collect()
    }

    pub fn entries(&self) -> Vec<MvEntry<T>> {
        self.entries.borrow().clone()
    }
}

impl<T: Value + PartialEq> Collab for MvRegister<T> {
    fn receive(&self, path: &mut MessagePath, meta: &UpdateMeta) -> Result<()> {
        let RegOp::Set { value } = decode(&path.pop_key()?)?;
        let before = self.value();
        {
            let mut entries = self.entries.borrow_mut();
            prune(&mut entries, meta);
            entries.push(MvEntry {
                sender: meta.sender.clone(),
                sender_counter: meta.sender_counter,
                value,
                wall_clock_ms: meta.wall_clock_ms,
            });
            entries.sort_by(|a, b| {
                a.sender
                    .cmp(&b.sender)
                    .then(a.sender_counter.cmp(&b.sender_counter))
            });
        }
        let after = self.value();
        if before != after {
            if let Some(value) = after {
                self.emit(&RegisterEvent::Set { value });
            }
        }
        Ok(())
    }

    fn save(&self) -> Result<SavedNode> {
        Ok(SavedNode::with_payload(encode(&*self.entries.borrow())?))
    }

    fn load(&self, node: &SavedNode, meta: &LoadMeta) -> Result<()> {
        let incoming: Vec<MvEntry<T>> = decode(&node.payload)?;
        let before = self.value();
        merge_entries(&mut self.entries.borrow_mut(), incoming, meta)?;
        let after = self.value();
        if before != after {
            if let Some(value) = after {
                self.emit(&RegisterEvent::Set { value });
            }
        }
        Ok(())
    }

    fn can_gc(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}
