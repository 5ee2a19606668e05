use crate::Value;
use coalesce_base::{err, malformed, safe_u64, ReplicaId, Result};
use coalesce_runtime::{
    Collab, CollabContext, LoadMeta, MessagePath, MetaRequest, ParentCollab, UpdateMeta,
};
use coalesce_wire::{decode, encode, PathSegment, SavedNode};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use tracing::debug;

/// Stable identity of one set element, unique across replicas.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementId {
    pub sender: ReplicaId,
    pub seq: u64,
}

/// What `delete` means for a set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SetSemantics {
    /// Delete is permanent; late messages for the element are dropped.
    #[default]
    Deleting,
    /// Delete is reversible presence (archive/restore).
    Archiving,
    /// Delete resets the element to a fresh instance; later messages
    /// rebuild its state.
    Resetting,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
enum SetOp<A: Value> {
    Add { seq: u64, args: A },
    Delete { id: ElementId },
    Archive { id: ElementId },
    Restore { id: ElementId },
}

struct Element<C, A> {
    collab: Rc<C>,
    args: A,
    /// Transaction that created the element; load merges use it to tell
    /// "deleted remotely" from "never seen remotely".
    created: (ReplicaId, u64),
    archived: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
struct SavedElement<A: Value> {
    id: ElementId,
    args: A,
    created: (ReplicaId, u64),
    archived: bool,
}

/// A set of dynamically constructed collabs. `add` instantiates the
/// element on every replica via the builder; elements are addressed by
/// their `ElementId` in both the API and message paths.
pub struct CollabSet<C: Collab, A: Value> {
    ctx: CollabContext,
    self_weak: Weak<CollabSet<C, A>>,
    semantics: SetSemantics,
    builder: Box<dyn Fn(CollabContext, &A) -> Rc<C>>,
    elements: RefCell<BTreeMap<ElementId, Element<C, A>>>,
    own_next: Cell<u64>,
}

impl<C: Collab, A: Value> CollabSet<C, A> {
    pub fn new(
        ctx: CollabContext,
        semantics: SetSemantics,
        builder: impl Fn(CollabContext, &A) -> Rc<C> + 'static,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<CollabSet<C, A>>| CollabSet {
            ctx,
            self_weak: weak.clone(),
            semantics,
            builder: Box::new(builder),
            elements: RefCell::new(BTreeMap::new()),
            own_next: Cell::new(1),
        })
    }

    fn id_segment(id: &ElementId) -> Result<PathSegment> {
        Ok(PathSegment::Key(encode(id)?))
    }

    fn build(&self, id: &ElementId, args: &A) -> Result<Rc<C>> {
        let parent = self.self_weak.clone() as Weak<dyn ParentCollab>;
        let ctx = self.ctx.child_context(parent, Self::id_segment(id)?);
        Ok((self.builder)(ctx, args))
    }

    /// Create a new element from `args` on every replica.
    pub fn add(&self, args: A) -> Result<Rc<C>> {
        self.ctx.check_sendable()?;
        let seq = self.own_next.get();
        let id = ElementId {
            sender: self.ctx.replica_id().clone(),
            seq,
        };
        self.ctx
            .send_op(encode(&SetOp::Add { seq, args })?, &MetaRequest::none())?;
        // The echo created the element.
        self.elements
            .borrow()
            .get(&id)
            .map(|e| e.collab.clone())
            .ok_or_else(|| err("added element did not materialize"))
    }

    pub fn delete(&self, id: &ElementId) -> Result<()> {
        self.ctx
            .send_op(encode(&SetOp::<A>::Delete { id: id.clone() })?, &MetaRequest::none())
    }

    pub fn archive(&self, id: &ElementId) -> Result<()> {
        self.ctx
            .send_op(encode(&SetOp::<A>::Archive { id: id.clone() })?, &MetaRequest::none())
    }

    pub fn restore(&self, id: &ElementId) -> Result<()> {
        self.ctx
            .send_op(encode(&SetOp::<A>::Restore { id: id.clone() })?, &MetaRequest::none())
    }

    pub fn get(&self, id: &ElementId) -> Option<Rc<C>> {
        self.elements.borrow().get(id).map(|e| e.collab.clone())
    }

    pub fn has(&self, id: &ElementId) -> bool {
        self.elements
            .borrow()
            .get(id)
            .is_some_and(|e| !e.archived)
    }

    pub fn is_archived(&self, id: &ElementId) -> bool {
        self.elements.borrow().get(id).is_some_and(|e| e.archived)
    }

    /// Present (non-archived) elements, ordered by id.
    pub fn iter(&self) -> Vec<(ElementId, Rc<C>)> {
        self.elements
            .borrow()
            .iter()
            .filter(|(_, e)| !e.archived)
            .map(|(id, e)| (id.clone(), e.collab.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.elements
            .borrow()
            .values()
            .filter(|e| !e.archived)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply_own(&self, op: SetOp<A>, meta: &UpdateMeta) -> Result<()> {
        match op {
            SetOp::Add { seq, args } => {
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
                let collab = self.build(&id, &args)?;
                self.elements.borrow_mut().insert(
                    id,
                    Element {
                        collab,
                        args,
                        created: (meta.sender.clone(), meta.sender_counter),
                        archived: false,
                    },
                );
            }
            SetOp::Delete { id } => match self.semantics {
                SetSemantics::Deleting | SetSemantics::Archiving => {
                    self.elements.borrow_mut().remove(&id);
                }
                SetSemantics::Resetting => {
                    let rebuilt = {
                        let elements = self.elements.borrow();
                        match elements.get(&id) {
                            Some(e) => Some((self.build(&id, &e.args)?, e.args.clone(), e.created.clone())),
                            None => None,
                        }
                    };
                    if let Some((collab, args, created)) = rebuilt {
                        self.elements.borrow_mut().insert(
                            id,
                            Element {
                                collab,
                                args,
                                created,
                                archived: false,
                            },
                        );
                    }
                }
            },
            SetOp::Archive { id } => {
                if let Some(e) = self.elements.borrow_mut().get_mut(&id) {
                    e.archived = true;
                }
            }
            SetOp::Restore { id } => {
                if let Some(e) = self.elements.borrow_mut().get_mut(&id) {
                    e.archived = false;
                }
            }
        }
        Ok(())
    }
}

impl<C: Collab, A: Value> ParentCollab for CollabSet<C, A> {
    fn forward_send(&self, path: Vec<PathSegment>, req: &MetaRequest) -> Result<()> {
        self.ctx.send(path, req)
    }

    fn context_of(&self) -> &CollabContext {
        &self.ctx
    }
}

impl<C: Collab, A: Value> Collab for CollabSet<C, A> {
    fn receive(&self, path: &mut MessagePath, meta: &UpdateMeta) -> Result<()> {
        let seg = path
            .pop()
            .ok_or_else(|| malformed("set message without a segment"))?;
        let Some(bytes) = seg.as_key() else {
            return Err(malformed("set child names must be keys"));
        };
        if path.is_empty() {
            // Leaf payload: one of our own ops.
            return self.apply_own(decode(bytes)?, meta);
        }
        let id: ElementId = decode(bytes)?;
        let child = self.elements.borrow().get(&id).map(|e| e.collab.clone());
        match child {
            Some(child) => child.receive(path, meta),
            None => {
                // Deleted (or never-known) element: drop its messages.
                debug!(target: "coalesce", ?id, "dropping message for absent set element");
                Ok(())
            }
        }
    }

    fn save(&self) -> Result<SavedNode> {
        let elements = self.elements.borrow();
        let roster: Vec<SavedElement<A>> = elements
            .iter()
            .map(|(id, e)| SavedElement {
                id: id.clone(),
                args: e.args.clone(),
                created: e.created.clone(),
                archived: e.archived,
            })
            .collect();
        let mut children = BTreeMap::new();
        for (id, e) in elements.iter() {
            children.insert(Self::id_segment(id)?, e.collab.save()?);
        }
        Ok(SavedNode {
            payload: encode(&roster)?,
            children,
        })
    }

    fn load(&self, node: &SavedNode, meta: &LoadMeta) -> Result<()> {
        let roster: Vec<SavedElement<A>> = decode(&node.payload)?;
        // New-to-us elements whose creation we had not seen get created;
        // elements we know but the remote knew-and-lacks were deleted
        // there, so they go (except under resetting semantics).
        for se in &roster {
            safe_u64(se.id.seq)?;
            safe_u64(se.created.1)?;
            if se.id.sender == *self.ctx.replica_id() {
                self.own_next.set(self.own_next.get().max(se.id.seq + 1));
            }
            let known = self.elements.borrow().contains_key(&se.id);
            if !known {
                if meta.local_vc.get(&se.created.0) >= se.created.1 {
                    // We saw its creation and no longer have it: deleted
                    // here; deletion wins.
                    continue;
                }
                let collab = self.build(&se.id, &se.args)?;
                self.elements.borrow_mut().insert(
                    se.id.clone(),
                    Element {
                        collab,
                        args: se.args.clone(),
                        created: se.created.clone(),
                        archived: se.archived,
                    },
                );
            } else if se.archived {
                // Archive-biased merge for concurrent archive/restore.
                if let Some(e) = self.elements.borrow_mut().get_mut(&se.id) {
                    e.archived = true;
                }
            }
        }
        if self.semantics != SetSemantics::Resetting {
            let remote_has: std::collections::BTreeSet<&ElementId> =
                roster.iter().map(|se| &se.id).collect();
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
                self.elements.borrow_mut().remove(&id);
            }
        }
        // Merge surviving children's own state.
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
        self.get(&id).map(|c| c as Rc<dyn Collab>)
    }
}
