use crate::Key;
use coalesce_base::{malformed, Result};
use coalesce_runtime::{
    Collab, CollabContext, LoadMeta, MessagePath, MetaRequest, ParentCollab, UpdateMeta,
};
use coalesce_wire::{decode, encode, PathSegment, SavedNode};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

/// A map whose keys are conceptually always present: each value is a
/// child collab built on demand by the user-supplied builder, and a key
/// is reported present exactly when its value has observable state
/// (`can_gc() == false`). Deletion does not exist.
///
/// Children with state are owned strongly; trivial children are held
/// weakly, so they stay alive only while the caller keeps them. Builders
/// must construct identical collabs for identical keys on every replica.
pub struct LazyMap<K: Key, C: Collab> {
    ctx: CollabContext,
    self_weak: Weak<LazyMap<K, C>>,
    builder: Box<dyn Fn(CollabContext) -> Rc<C>>,
    strong: RefCell<BTreeMap<K, Rc<C>>>,
    weak: RefCell<BTreeMap<K, Weak<C>>>,
}

impl<K: Key, C: Collab> LazyMap<K, C> {
    pub fn new(
        ctx: CollabContext,
        builder: impl Fn(CollabContext) -> Rc<C> + 'static,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<LazyMap<K, C>>| LazyMap {
            ctx,
            self_weak: weak.clone(),
            builder: Box::new(builder),
            strong: RefCell::new(BTreeMap::new()),
            weak: RefCell::new(BTreeMap::new()),
        })
    }

    fn key_segment(key: &K) -> Result<PathSegment> {
        Ok(PathSegment::Key(encode(key)?))
    }

    fn build(&self, key: &K) -> Result<Rc<C>> {
        let seg = Self::key_segment(key)?;
        let parent = self.self_weak.clone() as Weak<dyn ParentCollab>;
        Ok((self.builder)(self.ctx.child_context(parent, seg)))
    }

    /// The value collab for `key`, created on first touch.
    pub fn get(&self, key: &K) -> Result<Rc<C>> {
        if let Some(c) = self.strong.borrow().get(key) {
            return Ok(c.clone());
        }
        if let Some(c) = self.weak.borrow().get(key).and_then(Weak::upgrade) {
            return Ok(c);
        }
        let c = self.build(key)?;
        self.weak.borrow_mut().insert(key.clone(), Rc::downgrade(&c));
        Ok(c)
    }

    /// Move a child between the strong and weak stores after its state
    /// may have changed.
    fn reconcile(&self, key: &K, child: &Rc<C>) {
        if child.can_gc() {
            if self.strong.borrow_mut().remove(key).is_some() {
                self.weak
                    .borrow_mut()
                    .insert(key.clone(), Rc::downgrade(child));
            }
        } else {
            self.weak.borrow_mut().remove(key);
            self.strong.borrow_mut().insert(key.clone(), child.clone());
        }
    }

    pub fn has(&self, key: &K) -> bool {
        if let Some(c) = self.strong.borrow().get(key) {
            return !c.can_gc();
        }
        self.weak
            .borrow()
            .get(key)
            .and_then(Weak::upgrade)
            .is_some_and(|c| !c.can_gc())
    }

    /// Keys whose values currently have observable state.
    pub fn present_keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = self
            .strong
            .borrow()
            .iter()
            .filter(|(_, c)| !c.can_gc())
            .map(|(k, _)| k.clone())
            .collect();
        for (k, w) in self.weak.borrow().iter() {
            if w.upgrade().is_some_and(|c| !c.can_gc()) && !keys.contains(k) {
                keys.push(k.clone());
            }
        }
        keys.sort();
        keys
    }

    pub fn len_present(&self) -> usize {
        self.present_keys().len()
    }
}

impl<K: Key, C: Collab> ParentCollab for LazyMap<K, C> {
    fn forward_send(&self, path: Vec<PathSegment>, req: &MetaRequest) -> Result<()> {
        self.ctx.send(path, req)
    }

    fn context_of(&self) -> &CollabContext {
        &self.ctx
    }
}

impl<K: Key, C: Collab> Collab for LazyMap<K, C> {
    fn receive(&self, path: &mut MessagePath, meta: &UpdateMeta) -> Result<()> {
        let seg = path
            .pop()
            .ok_or_else(|| malformed("lazy map message without a key"))?;
        let Some(bytes) = seg.as_key() else {
            return Err(malformed("lazy map child names must be keys"));
        };
        let key: K = decode(bytes)?;
        let child = self.get(&key)?;
        let res = child.receive(path, meta);
        self.reconcile(&key, &child);
        res
    }

    fn save(&self) -> Result<SavedNode> {
        // Only children with state are persisted.
        let mut children = BTreeMap::new();
        for (key, child) in self.strong.borrow().iter() {
            if !child.can_gc() {
                children.insert(Self::key_segment(key)?, child.save()?);
            }
        }
        for (key, w) in self.weak.borrow().iter() {
            if let Some(child) = w.upgrade() {
                if !child.can_gc() {
                    children.insert(Self::key_segment(key)?, child.save()?);
                }
            }
        }
        Ok(SavedNode {
            payload: Vec::new(),
            children,
        })
    }

    fn load(&self, node: &SavedNode, meta: &LoadMeta) -> Result<()> {
        for (seg, sub) in &node.children {
            let Some(bytes) = seg.as_key() else {
                return Err(malformed("lazy map saved child with a non-key name"));
            };
            let key: K = decode(bytes)?;
            let child = self.get(&key)?;
            child.load(sub, meta)?;
            self.reconcile(&key, &child);
        }
        Ok(())
    }

    fn can_gc(&self) -> bool {
        self.len_present() == 0
    }

    fn child(&self, seg: &PathSegment) -> Option<Rc<dyn Collab>> {
        let key: K = decode(seg.as_key()?).ok()?;
        self.get(&key).ok().map(|c| c as Rc<dyn Collab>)
    }
}
