use coalesce_base::{malformed, safe_u64, ReplicaId, Result, COUNTER_MODULUS};
use coalesce_runtime::{
    Collab, CollabContext, LoadMeta, MessagePath, MetaRequest, ParentCollab, UpdateMeta,
};
use coalesce_wire::{decode, encode, PathSegment, SavedNode};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

/// Per-sender counter state: `p` is everything the sender added, `n` is
/// the high-water mark zeroed out by resets, `id` bumps whenever `p`
/// wraps the modulus so stale reset snapshots stop matching.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CounterRow {
    p: u64,
    n: u64,
    id: u64,
}

#[derive(Serialize, Deserialize)]
enum CounterOp {
    Add { amount: u64 },
    Reset { snapshot: Vec<(ReplicaId, u64, u64)> },
}

#[derive(Clone, Debug)]
pub struct CounterEvent {
    pub value: u64,
}

/// Grow-only counter with observed reset. `add` accumulates per sender
/// modulo `(2^53 - 1) / 2`; `reset` zeroes everything every replica had
/// seen at the moment of the reset, while concurrent adds survive it.
pub struct Counter {
    ctx: CollabContext,
    rows: RefCell<BTreeMap<ReplicaId, CounterRow>>,
    subs: RefCell<Vec<Rc<dyn Fn(&CounterEvent)>>>,
}

impl Counter {
    pub fn new(ctx: CollabContext) -> Rc<Self> {
        Rc::new(Counter {
            ctx,
            rows: RefCell::new(BTreeMap::new()),
            subs: RefCell::new(Vec::new()),
        })
    }

    pub fn on_event(&self, f: impl Fn(&CounterEvent) + 'static) {
        self.subs.borrow_mut().push(Rc::new(f));
    }

    fn emit(&self) {
        let ev = CounterEvent { value: self.value() };
        let subs: Vec<_> = self.subs.borrow().clone();
        for f in subs {
            f(&ev);
        }
    }

    pub fn add(&self, amount: u64) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let amount = amount % COUNTER_MODULUS;
        self.ctx
            .send_op(encode(&CounterOp::Add { amount })?, &MetaRequest::none())
    }

    /// Zero the counter as far as this replica has seen it. Adds this
    /// replica has not yet seen are unaffected.
    pub fn reset(&self) -> Result<()> {
        let snapshot: Vec<(ReplicaId, u64, u64)> = self
            .rows
            .borrow()
            .iter()
            .map(|(s, r)| (s.clone(), r.p, r.id))
            .collect();
        self.ctx
            .send_op(encode(&CounterOp::Reset { snapshot })?, &MetaRequest::none())
    }

    pub fn value(&self) -> u64 {
        let sum: u64 = self
            .rows
            .borrow()
            .values()
            .map(|r| r.p.saturating_sub(r.n))
            .sum();
        sum % COUNTER_MODULUS
    }
}

impl Collab for Counter {
    fn receive(&self, path: &mut MessagePath, meta: &UpdateMeta) -> Result<()> {
        let op: CounterOp = decode(&path.pop_key()?)?;
        match op {
            CounterOp::Add { amount } => {
                if amount >= COUNTER_MODULUS {
                    return Err(malformed("counter add beyond the modulus"));
                }
                let mut rows = self.rows.borrow_mut();
                let row = rows.entry(meta.sender.clone()).or_default();
                row.p += amount;
                if row.p >= COUNTER_MODULUS {
                    row.p -= COUNTER_MODULUS;
                    row.id += 1;
                    row.n = 0;
                }
            }
            CounterOp::Reset { snapshot } => {
                for (_, v, id) in &snapshot {
                    if *v >= COUNTER_MODULUS {
                        return Err(malformed("reset snapshot beyond the modulus"));
                    }
                    safe_u64(*id)?;
                }
                let mut rows = self.rows.borrow_mut();
                for (sender, v, id) in snapshot {
                    if let Some(row) = rows.get_mut(&sender) {
                        if row.id == id {
                            row.n = row.n.max(v);
                        }
                    }
                }
            }
        }
        self.emit();
        Ok(())
    }

    fn save(&self) -> Result<SavedNode> {
        Ok(SavedNode::with_payload(encode(&*self.rows.borrow())?))
    }

    fn load(&self, node: &SavedNode, _meta: &LoadMeta) -> Result<()> {
        let incoming: BTreeMap<ReplicaId, CounterRow> = decode(&node.payload)?;
        for row in incoming.values() {
            if row.p >= COUNTER_MODULUS {
                return Err(malformed("saved counter beyond the modulus"));
            }
            safe_u64(row.n)?;
            safe_u64(row.id)?;
        }
        let before = self.value();
        {
            let mut rows = self.rows.borrow_mut();
            for (sender, theirs) in incoming {
                let row = rows.entry(sender).or_default();
                if theirs.id > row.id {
                    *row = theirs;
                } else if theirs.id == row.id {
                    row.p = row.p.max(theirs.p);
                    row.n = row.n.max(theirs.n);
                }
            }
        }
        if self.value() != before {
            self.emit();
        }
        Ok(())
    }

    fn can_gc(&self) -> bool {
        self.rows.borrow().is_empty()
    }
}

const PLUS_CHILD: &str = "plus";
const MINUS_CHILD: &str = "minus";

/// Signed counter: two grow-only counters composed, value = plus - minus.
pub struct SignedCounter {
    ctx: CollabContext,
    plus: Rc<Counter>,
    minus: Rc<Counter>,
}

impl SignedCounter {
    pub fn new(ctx: CollabContext) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<SignedCounter>| {
            let parent = weak.clone() as Weak<dyn ParentCollab>;
            let plus =
                Counter::new(ctx.child_context(parent.clone(), PathSegment::name(PLUS_CHILD)));
            let minus = Counter::new(ctx.child_context(parent, PathSegment::name(MINUS_CHILD)));
            SignedCounter { ctx, plus, minus }
        })
    }

    pub fn add(&self, amount: i64) -> Result<()> {
        if amount >= 0 {
            self.plus.add(amount as u64)
        } else {
            self.minus.add(amount.unsigned_abs())
        }
    }

    pub fn subtract(&self, amount: u64) -> Result<()> {
        self.minus.add(amount)
    }

    pub fn reset(&self) -> Result<()> {
        self.plus.reset()?;
        self.minus.reset()
    }

    pub fn value(&self) -> i64 {
        self.plus.value() as i64 - self.minus.value() as i64
    }
}

impl ParentCollab for SignedCounter {
    fn forward_send(&self, path: Vec<PathSegment>, req: &MetaRequest) -> Result<()> {
        self.ctx.send(path, req)
    }

    fn context_of(&self) -> &CollabContext {
        &self.ctx
    }
}

impl Collab for SignedCounter {
    fn receive(&self, path: &mut MessagePath, meta: &UpdateMeta) -> Result<()> {
        let seg = path
            .pop()
            .ok_or_else(|| malformed("signed counter message without a child name"))?;
        match seg.as_name() {
            Some(PLUS_CHILD) => self.plus.receive(path, meta),
            Some(MINUS_CHILD) => self.minus.receive(path, meta),
            _ => Err(malformed(format!("unknown signed counter child {seg:?}"))),
        }
    }

    fn save(&self) -> Result<SavedNode> {
        let mut children = BTreeMap::new();
        children.insert(PathSegment::name(PLUS_CHILD), self.plus.save()?);
        children.insert(PathSegment::name(MINUS_CHILD), self.minus.save()?);
        Ok(SavedNode {
            payload: Vec::new(),
            children,
        })
    }

    fn load(&self, node: &SavedNode, meta: &LoadMeta) -> Result<()> {
        if let Some(plus) = node.children.get(&PathSegment::name(PLUS_CHILD)) {
            self.plus.load(plus, meta)?;
        }
        if let Some(minus) = node.children.get(&PathSegment::name(MINUS_CHILD)) {
            self.minus.load(minus, meta)?;
        }
        Ok(())
    }

    fn can_gc(&self) -> bool {
        self.plus.can_gc() && self.minus.can_gc()
    }

    fn child(&self, seg: &PathSegment) -> Option<Rc<dyn Collab>> {
        match seg.as_name() {
            Some(PLUS_CHILD) => Some(self.plus.clone() as Rc<dyn Collab>),
            Some(MINUS_CHILD) => Some(self.minus.clone() as Rc<dyn Collab>),
            _ => None,
        }
    }
}
