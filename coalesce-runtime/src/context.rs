use crate::doc::DocCore;
use crate::meta::{LoadMeta, MetaRequest, UpdateMeta};
use coalesce_base::{err, malformed, ReplicaId, Result};
use coalesce_wire::{PathSegment, SavedNode};
use std::rc::{Rc, Weak};

/// A message fragment's remaining path, popped from the root side down.
pub struct MessagePath {
    segments: Vec<PathSegment>,
}

impl MessagePath {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        MessagePath { segments }
    }

    pub fn pop(&mut self) -> Option<PathSegment> {
        self.segments.pop()
    }

    /// Pop the leaf op payload.
    pub fn pop_key(&mut self) -> Result<Vec<u8>> {
        match self.segments.pop() {
            Some(PathSegment::Key(bytes)) => Ok(bytes),
            Some(seg) => Err(malformed(format!("expected op payload, found {seg:?}"))),
            None => Err(malformed("message path exhausted early")),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// One node of the collab tree. Methods take `&self`; collabs keep their
/// state in interior mutability and are not `Send`.
pub trait Collab: 'static {
    /// Apply one message fragment (local echo or remote delivery).
    fn receive(&self, path: &mut MessagePath, meta: &UpdateMeta) -> Result<()>;

    fn save(&self) -> Result<SavedNode>;

    /// Merge a saved subtree into current state.
    fn load(&self, node: &SavedNode, meta: &LoadMeta) -> Result<()>;

    /// True when this collab's state is indistinguishable from a freshly
    /// constructed instance. Containers use this to evict children.
    fn can_gc(&self) -> bool {
        false
    }

    /// Resolve one path segment to a child, for descendant lookup.
    fn child(&self, _seg: &PathSegment) -> Option<Rc<dyn Collab>> {
        None
    }
}

/// A collab that owns children and forwards their sends upward.
pub trait ParentCollab: 'static {
    /// Pass a child's message fragment up the tree. Implementations
    /// forward through their own context, which appends their own name.
    fn forward_send(&self, path: Vec<PathSegment>, req: &MetaRequest) -> Result<()>;

    fn context_of(&self) -> &CollabContext;
}

#[derive(Clone)]
pub enum ParentHandle {
    Doc(Weak<DocCore>),
    Collab(Weak<dyn ParentCollab>),
}

/// Construction context of a collab: its name among siblings, its parent,
/// and the owning document. Consumed once, at construction, and held for
/// the collab's lifetime.
pub struct CollabContext {
    name: PathSegment,
    parent: ParentHandle,
    doc: Weak<DocCore>,
    replica: ReplicaId,
}

impl CollabContext {
    pub(crate) fn for_root(doc: Weak<DocCore>, replica: ReplicaId, name: PathSegment) -> Self {
        CollabContext {
            name,
            parent: ParentHandle::Doc(doc.clone()),
            doc,
            replica,
        }
    }

    /// Context for a child of a container collab. `self` is the
    /// container's own context.
    pub fn child_context(&self, parent: Weak<dyn ParentCollab>, name: PathSegment) -> Self {
        CollabContext {
            name,
            parent: ParentHandle::Collab(parent),
            doc: self.doc.clone(),
            replica: self.replica.clone(),
        }
    }

    pub fn name(&self) -> &PathSegment {
        &self.name
    }

    pub fn doc(&self) -> Result<Rc<DocCore>> {
        self.doc
            .upgrade()
            .ok_or_else(|| err("document was dropped"))
    }

    /// This replica's identity, fixed at construction.
    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica
    }

    /// Fail early if the runtime would reject a send right now, for
    /// operations that must mutate local state before sending.
    pub fn check_sendable(&self) -> Result<()> {
        self.doc()?.check_sendable()
    }

    /// Send a message fragment upward, appending our own name. At the
    /// root the runtime stamps it, echoes it locally, and queues it for
    /// the open transaction.
    pub fn send(&self, mut path: Vec<PathSegment>, req: &MetaRequest) -> Result<()> {
        path.push(self.name.clone());
        match &self.parent {
            ParentHandle::Doc(doc) => {
                let doc = doc.upgrade().ok_or_else(|| err("document was dropped"))?;
                doc.root_send(path, req)
            }
            ParentHandle::Collab(parent) => {
                let parent = parent
                    .upgrade()
                    .ok_or_else(|| err("parent collab was dropped"))?;
                parent.forward_send(path, req)
            }
        }
    }

    /// Send a single-op fragment: the encoded op as the leaf payload.
    pub fn send_op(&self, op: Vec<u8>, req: &MetaRequest) -> Result<()> {
        self.send(vec![PathSegment::Key(op)], req)
    }

    /// Name path from the root to this collab, computed by walking parent
    /// links upward.
    pub fn name_path(&self) -> Result<Vec<PathSegment>> {
        let mut segs = vec![self.name.clone()];
        let mut cur = self.parent.clone();
        loop {
            match cur {
                ParentHandle::Doc(_) => break,
                ParentHandle::Collab(w) => {
                    let parent = w
                        .upgrade()
                        .ok_or_else(|| err("parent collab was dropped"))?;
                    let ctx = parent.context_of();
                    segs.push(ctx.name.clone());
                    cur = ctx.parent.clone();
                }
            }
        }
        segs.reverse();
        Ok(segs)
    }
}
