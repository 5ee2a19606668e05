use crate::set::ElementId;
use crate::Value;
use coalesce_base::{err, malformed, misuse, safe_u64, ReplicaId, Result};
use coalesce_pos::{OrderedIndex, Position, WaypointDesc};
use coalesce_runtime::{
    Collab, CollabContext, LoadMeta, MessagePath, MetaRequest, ParentCollab, UpdateMeta,
};
use coalesce_wire::{decode, encode, PathSegment, SavedNode};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use tracing::debug;

/// One candidate location of a movable element. Concurrent moves leave
/// several candidates; the winner is the max by (counter, sender).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct PosCandidate {
    sender: ReplicaId,
    sender_counter: u64,
    pos: Position,
}

fn winner(candidates: &[PosCandidate]) -> Option<&PosCandidate> {
    candidates.iter().max_by(|a, b| {
        a.sender_counter
            .cmp(&b.sender_counter)
            .then_with(|| a.sender.cmp(&b.sender))
    })
}

struct ListElement<C, A> {
    collab: Rc<C>,
    args: A,
    created: (ReplicaId, u64),
    archived: bool,
    candidates: Vec<PosCandidate>,
    /// Where the ordered index currently holds this element's entry.
    placed: Option<Position>,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
enum CListOp<A: Value> {
    Insert {
        seq: u64,
        counter: u64,
        start: u64,
        desc: Option<WaypointDesc>,
        args: A,
    },
    Delete {
        id: ElementId,
    },
    Archive {
        id: ElementId,
    },
    Restore {
        id: ElementId,
    },
    /// Move `ids` to the run of positions starting at (counter, start).
    Move {
        ids: Vec<ElementId>,
        counter: u64,
        start: u64,
        desc: Option<WaypointDesc>,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
struct SavedListElement<A: Value> {
    id: ElementId,
    args: A,
    created: (ReplicaId, u64),
    archived: bool,
    candidates: Vec<PosCandidate>,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
struct SavedCList<A: Value> {
    index: Vec<u8>,
    roster: Vec<SavedListElement<A>>,
}

#[derive(Clone, Debug)]
pub enum CollabListEvent {
    Insert { index: usize, id: ElementId },
    Delete { index: usize, id: ElementId },
    Move { index: usize, id: ElementId },
}

/// A list whose entries are collabs. Entries keep their identity across
/// `move`; `archive`/`restore` are reversible presence; `delete` is
/// permanent.
pub struct CollabList<C: Collab, A: Value> {
    ctx: CollabContext,
    self_weak: Weak<CollabList<C, A>>,
    builder: Box<dyn Fn(CollabContext, &A) -> Rc<C>>,
    index: RefCell<OrderedIndex<Vec<ElementId>>>,
    elements: RefCell<BTreeMap<ElementId, ListElement<C, A>>>,
    own_next: Cell<u64>,
    subs: RefCell<Vec<Rc<dyn Fn(&CollabListEvent)>>>,
}

impl<C: Collab, A: Value> CollabList<C, A> {
    pub fn new(
        ctx: CollabContext,
        builder: impl Fn(CollabContext, &A) -> Rc<C> + 'static,
    ) -> Rc<Self> {
        let index = OrderedIndex::new(ctx.replica_id().clone());
        Rc::new_cyclic(|weak: &Weak<CollabList<C, A>>| CollabList {
            ctx,
            self_weak: weak.clone(),
            builder: Box::new(builder),
            index: RefCell::new(index),
            elements: RefCell::new(BTreeMap::new()),
            own_next: Cell::new(1),
            subs: RefCell::new(Vec::new()),
        })
    }

    pub fn on_event(&self, f: impl Fn(&CollabListEvent) + 'static) {
        self.subs.borrow_mut().push(Rc::new(f));
    }

    fn emit(&self, ev: &CollabListEvent) {
        let subs: Vec<_> = self.subs.borrow().clone();
        for f in subs {
            f(ev);
        }
    }

    fn id_segment(id: &ElementId) -> Result<PathSegment> {
        Ok(PathSegment::Key(encode(id)?))
    }

    fn build(&self, id: &ElementId, args: &A) -> Result<Rc<C>> {
        let parent = self.self_weak.clone() as Weak<dyn ParentCollab>;
        let ctx = self.ctx.child_context(parent, Self::id_segment(id)?);
        Ok((self.builder)(ctx, args))
    }

    pub fn len(&self) -> usize {
        self.index.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Option<Rc<C>> {
        let id = self.index.borrow().get(i)?;
        self.elements.borrow().get(&id).map(|e| e.collab.clone())
    }

    pub fn id_at(&self, i: usize) -> Option<ElementId> {
        self.index.borrow().get(i)
    }

    pub fn index_of(&self, id: &ElementId) -> Option<usize> {
        let placed = self.elements.borrow().get(id)?.placed.clone()?;
        self.index.borrow().index_of(&placed).ok()?
    }

    /// Present (non-archived) elements in list order.
    pub fn iter(&self) -> Vec<(ElementId, Rc<C>)> {
        let ids: Vec<ElementId> = self
            .index
            .borrow()
            .entries()
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        let elements = self.elements.borrow();
        ids.into_iter()
            .filter_map(|id| elements.get(&id).map(|e| (id.clone(), e.collab.clone())))
            .collect()
    }

    pub fn insert(&self, at: usize, args: A) -> Result<Rc<C>> {
        self.ctx.check_sendable()?;
        let (start, desc) = self.index.borrow_mut().create_positions(at, 1)?;
        let seq = self.own_next.get();
        let id = ElementId {
            sender: self.ctx.replica_id().clone(),
            seq,
        };
        let op = CListOp::Insert {
            seq,
            counter: start.counter,
            start: start.value_index,
            desc,
            args,
        };
        self.ctx.send_op(encode(&op)?, &MetaRequest::none())?;
        self.elements
            .borrow()
            .get(&id)
            .map(|e| e.collab.clone())
            .ok_or_else(|| err("inserted element did not materialize"))
    }

    pub fn delete(&self, id: &ElementId) -> Result<()> {
        self.ctx
            .send_op(encode(&CListOp::<A>::Delete { id: id.clone() })?, &MetaRequest::none())
    }

    pub fn archive(&self, id: &ElementId) -> Result<()> {
        self.ctx
            .send_op(encode(&CListOp::<A>::Archive { id: id.clone() })?, &MetaRequest::none())
    }

    pub fn restore(&self, id: &ElementId) -> Result<()> {
        self.ctx
            .send_op(encode(&CListOp::<A>::Restore { id: id.clone() })?, &MetaRequest::none())
    }

    /// Move `count` entries starting at `from` so they sit before the
    /// entry currently at `to`. Entries keep their identity and state.
    pub fn move_range(&self, from: usize, to: usize, count: usize) -> Result<()> {
        let len = self.len();
        if from + count > len || to > len {
            return Err(misuse(format!(
                "move {from}..{} -> {to} beyond length {len}",
                from + count
            )));
        }
        if count == 0 {
            return Ok(());
        }
        self.ctx.check_sendable()?;
        let ids: Vec<ElementId> = {
            let index = self.index.borrow();
            (from..from + count)
                .filter_map(|i| index.get(i))
                .collect()
        };
        if ids.len() != count {
            return Err(err("list changed during move"));
        }
        let (start, desc) = self.index.borrow_mut().create_positions(to, count as u64)?;
        // Ask for clock entries covering every candidate the moved
        // elements currently hold, so receivers can prune them.
        let mut seen: Vec<ReplicaId> = Vec::new();
        {
            let elements = self.elements.borrow();
            for id in &ids {
                if let Some(e) = elements.get(id) {
                    for c in &e.candidates {
                        if !seen.contains(&c.sender) {
                            seen.push(c.sender.clone());
                        }
                    }
                }
            }
        }
        let op = CListOp::<A>::Move {
            ids,
            counter: start.counter,
            start: start.value_index,
            desc,
        };
        self.ctx
            .send_op(encode(&op)?, &MetaRequest::none().with_vc_entries(seen))
    }

    /// Bring the index cell for `id` in line with its winning candidate
    /// and archived flag.
    fn reposition(&self, id: &ElementId) -> Result<()> {
        let (desired, placed) = {
            let elements = self.elements.borrow();
            let Some(e) = elements.get(id) else {
                return Ok(());
            };
            let desired = if e.archived {
                None
            } else {
                winner(&e.candidates).map(|c| c.pos.clone())
            };
            (desired, e.placed.clone())
        };
        if desired == placed {
            return Ok(());
        }
        if let Some(old) = &placed {
            self.index.borrow_mut().delete(old)?;
        }
        if let Some(pos) = &desired {
            self.index
                .borrow_mut()
                .apply_insert(pos, vec![id.clone()], None)?;
        }
        if let Some(e) = self.elements.borrow_mut().get_mut(id) {
            e.placed = desired;
        }
        Ok(())
    }

    fn apply_own(&self, op: CListOp<A>, meta: &UpdateMeta) -> Result<()> {
        match op {
            CListOp::Insert {
                seq,
                counter,
                start,
                desc,
                args,
            } => {
                safe_u64(seq)?;
                let id = ElementId {
                    sender: meta.sender.clone(),
                    seq,
                };
                if meta.sender == *self.ctx.replica_id() {
                    self.own_next.set(self.own_next.get().max(seq + 1));
                }
                if self.elements.borrow().contains_key(&id) {
                    return Ok(());
                }
                let pos = Position {
                    sender: meta.sender.clone(),
                    counter,
                    value_index: start,
                };
                let at = self
                    .index
                    .borrow_mut()
                    .apply_insert(&pos, vec![id.clone()], desc.as_ref())?;
                let collab = self.build(&id, &args)?;
                self.elements.borrow_mut().insert(
                    id.clone(),
                    ListElement {
                        collab,
                        args,
                        created: (meta.sender.clone(), meta.sender_counter),
                        archived: false,
                        candidates: vec![PosCandidate {
                            sender: meta.sender.clone(),
                            sender_counter: meta.sender_counter,
                            pos: pos.clone(),
                        }],
                        placed: Some(pos),
                    },
                );
                self.emit(&CollabListEvent::Insert { index: at, id });
            }
            CListOp::Delete { id } => {
                let placed = self
                    .elements
                    .borrow_mut()
                    .remove(&id)
                    .and_then(|e| e.placed);
                if let Some(pos) = placed {
                    if let Some((at, _)) = self.index.borrow_mut().delete(&pos)? {
                        self.emit(&CollabListEvent::Delete { index: at, id });
                    }
                }
            }
            CListOp::Archive { id } => {
                let at = self.index_of(&id);
                if let Some(e) = self.elements.borrow_mut().get_mut(&id) {
                    e.archived = true;
                }
                self.reposition(&id)?;
                if let Some(at) = at {
                    self.emit(&CollabListEvent::Delete { index: at, id });
                }
            }
            CListOp::Restore { id } => {
                let was = self.elements.borrow().get(&id).map(|e| e.archived);
                if let Some(e) = self.elements.borrow_mut().get_mut(&id) {
                    e.archived = false;
                }
                self.reposition(&id)?;
                if was == Some(true) {
                    if let Some(at) = self.index_of(&id) {
                        self.emit(&CollabListEvent::Insert { index: at, id });
                    }
                }
            }
            CListOp::Move {
                ids,
                counter,
                start,
                desc,
            } => {
                let first = Position {
                    sender: meta.sender.clone(),
                    counter,
                    value_index: start,
                };
                // Register the run of positions without any values yet.
                self.index.borrow_mut().register_positions(
                    &first,
                    ids.len() as u64,
                    desc.as_ref(),
                )?;
                for (i, id) in ids.into_iter().enumerate() {
                    let pos = Position {
                        sender: meta.sender.clone(),
                        counter,
                        value_index: start + i as u64,
                    };
                    {
                        let mut elements = self.elements.borrow_mut();
                        let Some(e) = elements.get_mut(&id) else {
                            // Concurrently deleted; the move is moot.
                            debug!(target: "coalesce", ?id, "move for absent element");
                            continue;
                        };
                        e.candidates
                            .retain(|c| meta.vc_entry(&c.sender) < c.sender_counter);
                        e.candidates.push(PosCandidate {
                            sender: meta.sender.clone(),
                            sender_counter: meta.sender_counter,
                            pos,
                        });
                    }
                    self.reposition(&id)?;
                    if let Some(at) = self.index_of(&id) {
                        self.emit(&CollabListEvent::Move { index: at, id });
                    }
                }
            }
        }
        Ok(())
    }
}

impl<C: Collab, A: Value> ParentCollab for CollabList<C, A> {
    fn forward_send(&self, path: Vec<PathSegment>, req: &MetaRequest) -> Result<()> {
        self.ctx.send(path, req)
    }

    fn context_of(&self) -> &CollabContext {
        &self.ctx
    }
}

impl<C: Collab, A: Value> Collab for CollabList<C, A> {
    fn receive(&self, path: &mut MessagePath, meta: &UpdateMeta) -> Result<()> {
        let seg = path
            .pop()
            .ok_or_else(|| malformed("list message without a segment"))?;
        let Some(bytes) = seg.as_key() else {
            return Err(malformed("list child names must be keys"));
        };
        if path.is_empty() {
            return self.apply_own(decode(bytes)?, meta);
        }
        let id: ElementId = decode(bytes)?;
        let child = self.elements.borrow().get(&id).map(|e| e.collab.clone());
        match child {
            Some(child) => child.receive(path, meta),
            None => {
                debug!(target: "coalesce", ?id, "dropping message for absent list element");
                Ok(())
            }
        }
    }

    fn save(&self) -> Result<SavedNode> {
        let elements = self.elements.borrow();
        let roster: Vec<SavedListElement<A>> = elements
            .iter()
            .map(|(id, e)| SavedListElement {
                id: id.clone(),
                args: e.args.clone(),
                created: e.created.clone(),
                archived: e.archived,
                candidates: e.candidates.clone(),
            })
            .collect();
        let mut children = BTreeMap::new();
        for (id, e) in elements.iter() {
            children.insert(Self::id_segment(id)?, e.collab.save()?);
        }
        Ok(SavedNode {
            payload: encode(&SavedCList {
                index: self.index.borrow().save()?,
                roster,
            })?,
            children,
        })
    }

    fn load(&self, node: &SavedNode, meta: &LoadMeta) -> Result<()> {
        let saved: SavedCList<A> = decode(&node.payload)?;
        self.index.borrow_mut().load(&saved.index)?;
        // Roster merge: creation/deletion judged by the creation dot
        // against the two clocks, archive biased to archived.
        for se in &saved.roster {
            safe_u64(se.id.seq)?;
            safe_u64(se.created.1)?;
            for c in &se.candidates {
                safe_u64(c.sender_counter)?;
            }
            if se.id.sender == *self.ctx.replica_id() {
                self.own_next.set(self.own_next.get().max(se.id.seq + 1));
            }
            let known = self.elements.borrow().contains_key(&se.id);
            if !known {
                if meta.local_vc.get(&se.created.0) >= se.created.1 {
                    continue;
                }
                let collab = self.build(&se.id, &se.args)?;
                self.elements.borrow_mut().insert(
                    se.id.clone(),
                    ListElement {
                        collab,
                        args: se.args.clone(),
                        created: se.created.clone(),
                        archived: se.archived,
                        candidates: Vec::new(),
                        placed: None,
                    },
                );
            } else if se.archived {
                if let Some(e) = self.elements.borrow_mut().get_mut(&se.id) {
                    e.archived = true;
                }
            }
            // Candidate merge, mv-register style.
            if let Some(e) = self.elements.borrow_mut().get_mut(&se.id) {
                let local = std::mem::take(&mut e.candidates);
                let mut merged: Vec<PosCandidate> = Vec::new();
                for c in local {
                    if se.candidates.contains(&c)
                        || meta.remote_vc.get(&c.sender) < c.sender_counter
                    {
                        merged.push(c);
                    }
                }
                for c in &se.candidates {
                    if !merged.contains(c) && meta.local_vc.get(&c.sender) < c.sender_counter {
                        merged.push(c.clone());
                    }
                }
                e.candidates = merged;
            }
        }
        let remote_has: std::collections::BTreeSet<&ElementId> =
            saved.roster.iter().map(|se| &se.id).collect();
        let doomed: Vec<ElementId> = self
            .elements
            .borrow()
            .iter()
            .filter(|(id, e)| {
                !remote_has.contains(id) && meta.remote_vc.get(&e.created.0) >= e.created.1
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in doomed {
            let placed = self
                .elements
                .borrow_mut()
                .remove(&id)
                .and_then(|e| e.placed);
            if let Some(pos) = placed {
                self.index.borrow_mut().delete(&pos)?;
            }
        }
        // Reconcile the index against winners: drop stray entries, then
        // place every live element at its winning position.
        let stray: Vec<(Position, ElementId)> = {
            let index = self.index.borrow();
            let elements = self.elements.borrow();
            index
                .entries()
                .into_iter()
                .filter(|(pos, id)| match elements.get(id) {
                    None => true,
                    Some(e) => {
                        e.archived || winner(&e.candidates).map(|c| &c.pos) != Some(pos)
                    }
                })
                .collect()
        };
        for (pos, _) in &stray {
            self.index.borrow_mut().delete(pos)?;
        }
        let ids: Vec<ElementId> = self.elements.borrow().keys().cloned().collect();
        for id in &ids {
            if let Some(e) = self.elements.borrow_mut().get_mut(id) {
                e.placed = None;
            }
        }
        // Recompute placements from the merged index contents.
        for (pos, id) in self.index.borrow().entries() {
            if let Some(e) = self.elements.borrow_mut().get_mut(&id) {
                e.placed = Some(pos);
            }
        }
        for id in ids {
            self.reposition(&id)?;
        }
        // Children's own state last.
        for (seg, sub) in &node.children {
            let Some(bytes) = seg.as_key() else { continue };
            let id: ElementId = decode(bytes)?;
            let child = self.elements.borrow().get(&id).map(|e| e.collab.clone());
            if let Some(child) = child {
                child.load(sub, meta)?;
            }
        }
        Ok(())
    }

    fn can_gc(&self) -> bool {
        self.elements.borrow().is_empty()
    }

    fn child(&self, seg: &PathSegment) -> Option<Rc<dyn Collab>> {
        let id: ElementId = decode(seg.as_key()?).ok()?;
        self.elements
            .borrow()
            .get(&id)
            .map(|e| e.collab.clone() as Rc<dyn Collab>)
    }
}
