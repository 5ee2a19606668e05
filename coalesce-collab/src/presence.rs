use crate::Value;
use coalesce_base::{misuse, ReplicaId, Result};
use coalesce_runtime::{Collab, CollabContext, LoadMeta, MessagePath, MetaRequest, UpdateMeta};
use coalesce_wire::{decode, encode, SavedNode};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
enum PresenceOp<V: Value> {
    Set { value: V, request_all: bool },
    Update { value: V },
    Heartbeat { value: V },
    Delete,
}

#[derive(Clone, Debug)]
pub enum PresenceEvent<V> {
    Set { replica: ReplicaId, value: V },
    Delete { replica: ReplicaId },
}

struct RemoteEntry<V> {
    value: V,
    deadline: Instant,
}

/// Ephemeral per-replica values with TTL expiry. Nothing here is
/// persisted: saved states carry no presence, and a replica that goes
/// quiet for a TTL fades out locally with a Delete event and no network
/// traffic.
///
/// The core is single-threaded and owns no timers; hosts call `poll()`
/// periodically to expire stale peers and to flush the re-announcement
/// queued when a peer joins with `request_all`.
pub struct Presence<V: Value> {
    ctx: CollabContext,
    ttl: Duration,
    local: RefCell<Option<V>>,
    remote: RefCell<BTreeMap<ReplicaId, RemoteEntry<V>>>,
    heartbeat_queued: Cell<bool>,
    subs: RefCell<Vec<Rc<dyn Fn(&PresenceEvent<V>)>>>,
}

impl<V: Value> Presence<V> {
    pub fn new(ctx: CollabContext) -> Rc<Self> {
        Self::with_ttl(ctx, DEFAULT_TTL)
    }

    pub fn with_ttl(ctx: CollabContext, ttl: Duration) -> Rc<Self> {
        Rc::new(Presence {
            ctx,
            ttl,
            local: RefCell::new(None),
            remote: RefCell::new(BTreeMap::new()),
            heartbeat_queued: Cell::new(false),
            subs: RefCell::new(Vec::new()),
        })
    }

    pub fn on_event(&self, f: impl Fn(&PresenceEvent<V>) + 'static) {
        self.subs.borrow_mut().push(Rc::new(f));
    }

    fn emit(&self, ev: &PresenceEvent<V>) {
        let subs: Vec<_> = self.subs.borrow().clone();
        for f in subs {
            f(ev);
        }
    }

    /// Announce our value. `request_all` asks the present replicas to
    /// re-announce theirs (a fresh replica does this to catch up).
    pub fn set(&self, value: V, request_all: bool) -> Result<()> {
        self.ctx.check_sendable()?;
        *self.local.borrow_mut() = Some(value.clone());
        self.ctx.send_op(
            encode(&PresenceOp::Set { value, request_all })?,
            &MetaRequest::none(),
        )
    }

    /// Patch our value in place and re-announce it.
    pub fn update(&self, f: impl FnOnce(&mut V)) -> Result<()> {
        self.ctx.check_sendable()?;
        let value = {
            let mut local = self.local.borrow_mut();
            let Some(v) = local.as_mut() else {
                return Err(misuse("update before set"));
            };
            f(v);
            v.clone()
        };
        self.ctx
            .send_op(encode(&PresenceOp::Update { value })?, &MetaRequest::none())
    }

    /// Withdraw our value explicitly.
    pub fn delete(&self) -> Result<()> {
        self.ctx.check_sendable()?;
        *self.local.borrow_mut() = None;
        self.ctx
            .send_op(encode(&PresenceOp::<V>::Delete)?, &MetaRequest::none())
    }

    pub fn local_value(&self) -> Option<V> {
        self.local.borrow().clone()
    }

    /// A replica's current value, if present and unexpired.
    pub fn get(&self, replica: &ReplicaId) -> Option<V> {
        if replica == self.ctx.replica_id() {
            return self.local.borrow().clone();
        }
        let remote = self.remote.borrow();
        let e = remote.get(replica)?;
        if e.deadline < Instant::now() {
            return None;
        }
        Some(e.value.clone())
    }

    /// Replicas currently present (self included when set).
    pub fn present(&self) -> Vec<ReplicaId> {
        let now = Instant::now();
        let mut out: Vec<ReplicaId> = self
            .remote
            .borrow()
            .iter()
            .filter(|(_, e)| e.deadline >= now)
            .map(|(r, _)| r.clone())
            .collect();
        if self.local.borrow().is_some() {
            out.push(self.ctx.replica_id().clone());
        }
        out.sort();
        out
    }

    /// Expire stale peers (firing local Delete events) and flush any
    /// queued re-announcement. Hosts call this on a timer.
    pub fn poll(&self) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<ReplicaId> = self
            .remote
            .borrow()
            .iter()
            .filter(|(_, e)| e.deadline < now)
            .map(|(r, _)| r.clone())
            .collect();
        for replica in expired {
            self.remote.borrow_mut().remove(&replica);
            self.emit(&PresenceEvent::Delete { replica });
        }
        if self.heartbeat_queued.replace(false) {
            if let Some(value) = self.local.borrow().clone() {
                self.ctx
                    .send_op(encode(&PresenceOp::Heartbeat { value })?, &MetaRequest::none())?;
            }
        }
        Ok(())
    }

    fn note(&self, replica: &ReplicaId, value: V, announce: bool) {
        let deadline = Instant::now() + self.ttl;
        let fresh = {
            let mut remote = self.remote.borrow_mut();
            let fresh = !remote
                .get(replica)
                .is_some_and(|e| e.deadline >= Instant::now());
            remote.insert(
                replica.clone(),
                RemoteEntry {
                    value: value.clone(),
                    deadline,
                },
            );
            fresh
        };
        if fresh || announce {
            self.emit(&PresenceEvent::Set {
                replica: replica.clone(),
                value,
            });
        }
    }
}

impl<V: Value> Collab for Presence<V> {
    fn receive(&self, path: &mut MessagePath, meta: &UpdateMeta) -> Result<()> {
        let op: PresenceOp<V> = decode(&path.pop_key()?)?;
        if meta.is_local {
            // Our own state was updated before sending.
            return Ok(());
        }
        match op {
            PresenceOp::Set { value, request_all } => {
                self.note(&meta.sender, value, true);
                if request_all && self.local.borrow().is_some() {
                    // Sends are forbidden during delivery; answer at the
                    // next poll.
                    self.heartbeat_queued.set(true);
                }
            }
            PresenceOp::Update { value } => self.note(&meta.sender, value, true),
            PresenceOp::Heartbeat { value } => self.note(&meta.sender, value, false),
            PresenceOp::Delete => {
                let removed = self.remote.borrow_mut().remove(&meta.sender).is_some();
                if removed {
                    self.emit(&PresenceEvent::Delete {
                        replica: meta.sender.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn save(&self) -> Result<SavedNode> {
        // Presence is ephemeral; snapshots carry none of it.
        Ok(SavedNode::default())
    }

    fn load(&self, _node: &SavedNode, _meta: &LoadMeta) -> Result<()> {
        Ok(())
    }

    fn can_gc(&self) -> bool {
        self.local.borrow().is_none() && self.remote.borrow().is_empty()
    }
}
