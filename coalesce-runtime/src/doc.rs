use crate::context::{Collab, CollabContext, MessagePath};
use crate::meta::{
    AutoTransactions, DocOptions, LoadMeta, MetaRequest, SendEvent, UpdateEvent, UpdateKind,
    UpdateMeta,
};
use coalesce_base::{malformed, misuse, ReplicaId, Result};
use coalesce_causal::{CausalBuffer, Processed, VectorClock};
use coalesce_wire::{decode, encode, MessageBlob, PathSegment, SavedDoc, SavedNode, VcEntry};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Stamp taken from the causal buffer when a transaction's first fragment
/// arrives: the dependency snapshot precedes the tick, so it records what
/// the transaction was built on.
struct TxnStamp {
    counter: u64,
    lamport: u64,
    wall_clock_ms: u64,
    deps: Vec<(ReplicaId, u64)>,
}

struct OpenTxn {
    stamp: Option<TxnStamp>,
    fragments: Vec<Vec<PathSegment>>,
    requested: BTreeMap<ReplicaId, u64>,
    lamport_requested: bool,
    wall_clock_requested: bool,
    explicit_depth: u32,
}

impl OpenTxn {
    fn new(explicit: bool) -> Self {
        OpenTxn {
            stamp: None,
            fragments: Vec::new(),
            requested: BTreeMap::new(),
            lamport_requested: false,
            wall_clock_requested: false,
            explicit_depth: if explicit { 1 } else { 0 },
        }
    }
}

pub struct DocCore {
    replica: ReplicaId,
    opts: DocOptions,
    children: RefCell<BTreeMap<PathSegment, Rc<dyn Collab>>>,
    buffer: RefCell<CausalBuffer>,
    txn: RefCell<Option<OpenTxn>>,
    in_delivery: Cell<bool>,
    sealed: Cell<bool>,
    send_subs: RefCell<Vec<Rc<dyn Fn(&SendEvent)>>>,
    update_subs: RefCell<Vec<Rc<dyn Fn(&UpdateEvent)>>>,
    change_subs: RefCell<Vec<Rc<dyn Fn()>>>,
}

/// One replica of one document. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Doc {
    core: Rc<DocCore>,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Doc {
    pub fn new(opts: DocOptions) -> Self {
        let replica = opts
            .debug_replica_id
            .clone()
            .unwrap_or_else(ReplicaId::random);
        let buffer = CausalBuffer::new(replica.clone(), opts.causality_guaranteed);
        Doc {
            core: Rc::new(DocCore {
                replica,
                opts,
                children: RefCell::new(BTreeMap::new()),
                buffer: RefCell::new(buffer),
                txn: RefCell::new(None),
                in_delivery: Cell::new(false),
                sealed: Cell::new(false),
                send_subs: RefCell::new(Vec::new()),
                update_subs: RefCell::new(Vec::new()),
                change_subs: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn core(&self) -> &Rc<DocCore> {
        &self.core
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.core.replica.clone()
    }

    pub fn vector_clock(&self) -> VectorClock {
        self.core.buffer.borrow().vc().clone()
    }

    /// Size of the causal buffer's pending queue (backpressure signal).
    pub fn buffered_len(&self) -> usize {
        self.core.buffer.borrow().pending_len()
    }

    /// Register a root collab. Registrations must happen before the first
    /// send/receive/save/load and must match across replicas.
    pub fn register<T: Collab>(
        &self,
        name: &str,
        ctor: impl FnOnce(CollabContext) -> Rc<T>,
    ) -> Result<Rc<T>> {
        if self.core.sealed.get() {
            return Err(misuse("collabs must be registered before the document is used"));
        }
        let seg = PathSegment::name(name);
        if self.core.children.borrow().contains_key(&seg) {
            return Err(misuse(format!("duplicate collab name {name:?}")));
        }
        let ctx = CollabContext::for_root(
            Rc::downgrade(&self.core),
            self.core.replica.clone(),
            seg.clone(),
        );
        let collab = ctor(ctx);
        self.core
            .children
            .borrow_mut()
            .insert(seg, collab.clone() as Rc<dyn Collab>);
        Ok(collab)
    }

    pub fn on_send(&self, f: impl Fn(&SendEvent) + 'static) {
        self.core.send_subs.borrow_mut().push(Rc::new(f));
    }

    pub fn on_update(&self, f: impl Fn(&UpdateEvent) + 'static) {
        self.core.update_subs.borrow_mut().push(Rc::new(f));
    }

    pub fn on_change(&self, f: impl Fn() + 'static) {
        self.core.change_subs.borrow_mut().push(Rc::new(f));
    }

    /// Run `f` inside a transaction. Nested calls share the outer
    /// transaction; the outermost call commits.
    pub fn transact<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        self.core.begin_explicit()?;
        let out = f();
        self.core.end_explicit()?;
        Ok(out)
    }

    /// Commit any open implicit transaction (the deferred auto policy's
    /// analogue of the scheduler yield).
    pub fn commit(&self) -> Result<()> {
        self.core.commit_implicit()
    }

    /// Accept one serialized transaction from a peer.
    pub fn receive(&self, bytes: &[u8], caller: Option<&str>) -> Result<()> {
        self.core.receive(bytes, caller)
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        self.core.save()
    }

    /// Merge a saved state. Returns false when the state was strictly
    /// redundant and dropped.
    pub fn load(&self, bytes: &[u8], caller: Option<&str>) -> Result<bool> {
        self.core.load(bytes, caller)
    }

    /// Resolve a name path from the root, walking down the tree.
    pub fn descendant(&self, path: &[PathSegment]) -> Option<Rc<dyn Collab>> {
        let mut iter = path.iter();
        let first = iter.next()?;
        let mut cur = self.core.children.borrow().get(first).cloned()?;
        for seg in iter {
            let next = cur.child(seg)?;
            cur = next;
        }
        Some(cur)
    }
}

impl DocCore {
    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica
    }

    /// True outside receive/load (and inside a transaction when the
    /// policy demands one); collabs that mutate local state before
    /// sending call this first so misuse leaves no trace.
    pub fn check_sendable(&self) -> Result<()> {
        if self.in_delivery.get() {
            return Err(misuse(
                "operations are forbidden inside receive/load and event handlers",
            ));
        }
        if self.opts.auto_transactions == AutoTransactions::Error && self.txn.borrow().is_none() {
            return Err(misuse("operation outside an explicit transaction"));
        }
        Ok(())
    }

    pub fn vector_clock(&self) -> VectorClock {
        self.buffer.borrow().vc().clone()
    }

    fn begin_explicit(&self) -> Result<()> {
        if self.in_delivery.get() {
            return Err(misuse("transactions are forbidden during receive/load"));
        }
        let mut txn = self.txn.borrow_mut();
        match txn.as_mut() {
            Some(t) => t.explicit_depth += 1,
            None => *txn = Some(OpenTxn::new(true)),
        }
        Ok(())
    }

    fn end_explicit(&self) -> Result<()> {
        let commit = {
            let mut txn = self.txn.borrow_mut();
            let Some(t) = txn.as_mut() else {
                return Err(misuse("transaction closed twice"));
            };
            t.explicit_depth = t.explicit_depth.saturating_sub(1);
            t.explicit_depth == 0
        };
        if commit {
            self.commit_txn()?;
        }
        Ok(())
    }

    pub(crate) fn commit_implicit(&self) -> Result<()> {
        let open_implicit = self
            .txn
            .borrow()
            .as_ref()
            .is_some_and(|t| t.explicit_depth == 0);
        if open_implicit {
            self.commit_txn()?;
        }
        Ok(())
    }

    /// Entry point for fragments arriving from the tree (via contexts).
    pub(crate) fn root_send(&self, path: Vec<PathSegment>, req: &MetaRequest) -> Result<()> {
        if self.in_delivery.get() {
            return Err(misuse(
                "operations are forbidden inside receive/load and event handlers",
            ));
        }
        self.sealed.set(true);
        let meta = {
            let mut txn_slot = self.txn.borrow_mut();
            if txn_slot.is_none() {
                match self.opts.auto_transactions {
                    AutoTransactions::Error => {
                        return Err(misuse("operation outside an explicit transaction"))
                    }
                    _ => *txn_slot = Some(OpenTxn::new(false)),
                }
            }
            let txn = txn_slot.as_mut().unwrap_or_else(|| unreachable!());
            let mut buffer = self.buffer.borrow_mut();
            if txn.stamp.is_none() {
                let deps = buffer.maximal_entries();
                let counter = buffer.tick();
                txn.stamp = Some(TxnStamp {
                    counter,
                    lamport: buffer.lamport(),
                    wall_clock_ms: now_ms(),
                    deps,
                });
            }
            txn.lamport_requested |= req.lamport;
            txn.wall_clock_requested |= req.wall_clock;
            for r in &req.vc_entries {
                let c = buffer.vc().get(r);
                if c > 0 {
                    txn.requested.insert(r.clone(), c);
                }
            }
            let stamp = txn.stamp.as_ref().unwrap_or_else(|| unreachable!());
            let mut vc_entries: BTreeMap<ReplicaId, u64> = txn.requested.clone();
            for (r, c) in &stamp.deps {
                vc_entries.insert(r.clone(), *c);
            }
            UpdateMeta {
                sender: self.replica.clone(),
                sender_counter: stamp.counter,
                lamport: req.lamport.then_some(stamp.lamport),
                wall_clock_ms: req.wall_clock.then_some(stamp.wall_clock_ms),
                is_local: true,
                caller: None,
                vc_entries,
            }
        };
        // Local echo before queueing, so local state matches remotes.
        // Once stamped the fragment is authoritative: delivery errors are
        // logged, not rolled back.
        if let Err(e) = self.deliver_fragment(path.clone(), &meta) {
            error!(target: "coalesce", "local echo failed: {e:?}");
        }
        let per_op = {
            let mut txn_slot = self.txn.borrow_mut();
            let txn = txn_slot.as_mut().unwrap_or_else(|| unreachable!());
            txn.fragments.push(path);
            txn.explicit_depth == 0 && self.opts.auto_transactions == AutoTransactions::PerOp
        };
        if per_op {
            self.commit_txn()?;
        }
        Ok(())
    }

    fn commit_txn(&self) -> Result<()> {
        let Some(txn) = self.txn.borrow_mut().take() else {
            return Ok(());
        };
        let Some(stamp) = txn.stamp else {
            // Transaction with no operations; nothing was ticked.
            return Ok(());
        };
        let mut vc_entries: Vec<VcEntry> = Vec::new();
        vc_entries.push(VcEntry {
            replica: self.replica.clone(),
            counter: stamp.counter,
            maximal: true,
        });
        for (r, c) in &stamp.deps {
            vc_entries.push(VcEntry {
                replica: r.clone(),
                counter: *c,
                maximal: true,
            });
        }
        for (r, c) in &txn.requested {
            if *r == self.replica || stamp.deps.iter().any(|(d, _)| d == r) {
                continue;
            }
            vc_entries.push(VcEntry {
                replica: r.clone(),
                counter: *c,
                maximal: false,
            });
        }
        let blob = MessageBlob {
            sender: self.replica.clone(),
            sender_counter: stamp.counter,
            lamport: txn.lamport_requested.then_some(stamp.lamport),
            wall_clock_ms: txn.wall_clock_requested.then_some(stamp.wall_clock_ms),
            vc_entries,
            fragments: txn.fragments,
        };
        let message = encode(&blob)?;
        debug!(target: "coalesce", sender = %self.replica, counter = stamp.counter,
               bytes = message.len(), "committing transaction");
        self.emit_send(&SendEvent {
            message,
            sender: self.replica.clone(),
            sender_counter: stamp.counter,
        });
        self.emit_update(&UpdateEvent {
            kind: UpdateKind::Message,
            sender: Some(self.replica.clone()),
            sender_counter: Some(stamp.counter),
            is_local: true,
            caller: None,
        });
        self.emit_change();
        Ok(())
    }

    fn deliver_fragment(&self, path: Vec<PathSegment>, meta: &UpdateMeta) -> Result<()> {
        let was = self.in_delivery.replace(true);
        let res = (|| {
            let mut mp = MessagePath::new(path);
            let Some(seg) = mp.pop() else {
                return Err(malformed("empty message path"));
            };
            let child = self.children.borrow().get(&seg).cloned();
            let Some(child) = child else {
                return Err(malformed(format!("unknown root collab {seg:?}")));
            };
            child.receive(&mut mp, meta)
        })();
        self.in_delivery.set(was);
        res
    }

    fn receive(&self, bytes: &[u8], caller: Option<&str>) -> Result<()> {
        if self.in_delivery.get() {
            return Err(misuse("receive is not reentrant"));
        }
        if self
            .txn
            .borrow()
            .as_ref()
            .is_some_and(|t| t.explicit_depth > 0)
        {
            return Err(misuse("receive during an explicit transaction"));
        }
        self.sealed.set(true);
        self.commit_implicit()?;
        let msg: MessageBlob = decode(bytes)?;
        msg.validate()?;
        let processed = self.buffer.borrow_mut().process(msg);
        match processed {
            Processed::Duplicate | Processed::Buffered => Ok(()),
            Processed::Delivered(txns) => {
                // Handlers observing these events run inside the delivery
                // guard: operations from event handlers are rejected.
                let was = self.in_delivery.replace(true);
                let res = self.deliver_transactions(txns, caller);
                self.emit_change();
                self.in_delivery.set(was);
                res
            }
        }
    }

    fn deliver_transactions(&self, txns: Vec<MessageBlob>, caller: Option<&str>) -> Result<()> {
        let mut first_err = None;
        for txn in txns {
            let mut vc_entries = BTreeMap::new();
            for e in &txn.vc_entries {
                vc_entries.insert(e.replica.clone(), e.counter);
            }
            let meta = UpdateMeta {
                sender: txn.sender.clone(),
                sender_counter: txn.sender_counter,
                lamport: txn.lamport,
                wall_clock_ms: txn.wall_clock_ms,
                is_local: false,
                caller: caller.map(String::from),
                vc_entries,
            };
            for fragment in txn.fragments {
                if let Err(e) = self.deliver_fragment(fragment, &meta) {
                    // One collab's failure must not corrupt its siblings.
                    error!(target: "coalesce", sender = %meta.sender,
                           counter = meta.sender_counter, "delivery error: {e:?}");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
            self.emit_update(&UpdateEvent {
                kind: UpdateKind::Message,
                sender: Some(meta.sender.clone()),
                sender_counter: Some(meta.sender_counter),
                is_local: false,
                caller: caller.map(String::from),
            });
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn save(&self) -> Result<Vec<u8>> {
        if self.in_delivery.get() {
            return Err(misuse("save during receive/load"));
        }
        if self
            .txn
            .borrow()
            .as_ref()
            .is_some_and(|t| t.explicit_depth > 0)
        {
            return Err(misuse("save during a transaction"));
        }
        self.commit_implicit()?;
        self.sealed.set(true);
        let causal = self.buffer.borrow().save()?;
        let mut children = BTreeMap::new();
        for (seg, collab) in self.children.borrow().iter() {
            children.insert(seg.clone(), collab.save()?);
        }
        encode(&SavedDoc {
            causal,
            tree: SavedNode {
                payload: Vec::new(),
                children,
            },
        })
    }

    fn load(&self, bytes: &[u8], caller: Option<&str>) -> Result<bool> {
        if self.in_delivery.get() {
            return Err(misuse("load during receive/load"));
        }
        if self
            .txn
            .borrow()
            .as_ref()
            .is_some_and(|t| t.explicit_depth > 0)
        {
            return Err(misuse("load during a transaction"));
        }
        self.sealed.set(true);
        self.commit_implicit()?;
        let doc: SavedDoc = decode(bytes)?;
        let local_vc = self.buffer.borrow().vc().clone();
        let report = self.buffer.borrow_mut().load(&doc.causal)?;
        if report.is_redundant() && !self.opts.allow_redundant_loads {
            warn!(target: "coalesce", "dropping strictly redundant load");
            return Ok(false);
        }
        let meta = LoadMeta {
            local_vc,
            remote_vc: report.remote_vc,
            caller: caller.map(String::from),
        };
        let mut first_err = None;
        {
            let was = self.in_delivery.replace(true);
            for (seg, node) in &doc.tree.children {
                let child = self.children.borrow().get(seg).cloned();
                match child {
                    Some(child) => {
                        if let Err(e) = child.load(node, &meta) {
                            error!(target: "coalesce", "load error under {seg:?}: {e:?}");
                            if first_err.is_none() {
                                first_err = Some(e);
                            }
                        }
                    }
                    None => {
                        // Version mismatch: tolerate and skip the subtree.
                        warn!(target: "coalesce", "saved state names unknown collab {seg:?}");
                    }
                }
            }
            self.in_delivery.set(was);
        }
        // The merged buffer may hold transactions that became ready.
        let ready = self.buffer.borrow_mut().drain_ready();
        let was = self.in_delivery.replace(true);
        if !ready.is_empty() {
            if let Err(e) = self.deliver_transactions(ready, caller) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        self.emit_update(&UpdateEvent {
            kind: UpdateKind::SavedState,
            sender: None,
            sender_counter: None,
            is_local: false,
            caller: caller.map(String::from),
        });
        self.emit_change();
        self.in_delivery.set(was);
        match first_err {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    fn emit_send(&self, ev: &SendEvent) {
        let subs: Vec<_> = self.send_subs.borrow().clone();
        for f in subs {
            f(ev);
        }
    }

    fn emit_update(&self, ev: &UpdateEvent) {
        let subs: Vec<_> = self.update_subs.borrow().clone();
        for f in subs {
            f(ev);
        }
    }

    fn emit_change(&self) {
        let subs: Vec<_> = self.change_subs.borrow().clone();
        for f in subs {
            f();
        }
    }
}
