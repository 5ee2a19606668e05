use crate::register::{merge_entries, pick, prune, ConflictRule, MvEntry};
use crate::{Key, Value};
use coalesce_base::{ReplicaId, Result};
use coalesce_runtime::{Collab, CollabContext, LoadMeta, MessagePath, MetaRequest, UpdateMeta};
use coalesce_wire::{decode, encode, SavedNode};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
enum MapOp<K: Key, V: Value> {
    Set { key: K, value: V },
    Delete { key: K },
}

#[derive(Clone, Debug)]
pub enum MapEvent<K, V> {
    Set { key: K, value: V },
    Delete { key: K },
}

/// Multi-value map: per key, the causally maximal set of writes; `get`
/// aggregates per the conflict rule, `get_conflicts` exposes all
/// candidates. A delete drops the entries it dominates; concurrent sets
/// survive it.
pub struct ValueMap<K: Key, V: Value + PartialEq> {
    ctx: CollabContext,
    rule: ConflictRule,
    state: RefCell<BTreeMap<K, Vec<MvEntry<V>>>>,
    subs: RefCell<Vec<Rc<dyn Fn(&MapEvent<K, V>)>>>,
}

impl<K: Key, V: Value + PartialEq> ValueMap<K, V> {
    pub fn new(ctx: CollabContext) -> Rc<Self> {
        Self::with_rule(ctx, ConflictRule::BySender)
    }

    /// Last-writer-wins map: wall clocks decide, sender ids break ties.
    pub fn new_lww(ctx: CollabContext) -> Rc<Self> {
        Self::with_rule(ctx, ConflictRule::Lww)
    }

    pub fn with_rule(ctx: CollabContext, rule: ConflictRule) -> Rc<Self> {
        Rc::new(ValueMap {
            ctx,
            rule,
            state: RefCell::new(BTreeMap::new()),
            subs: RefCell::new(Vec::new()),
        })
    }

    pub fn on_event(&self, f: impl Fn(&MapEvent<K, V>) + 'static) {
        self.subs.borrow_mut().push(Rc::new(f));
    }

    fn emit(&self, ev: &MapEvent<K, V>) {
        let subs: Vec<_> = self.subs.borrow().clone();
        for f in subs {
            f(ev);
        }
    }

    fn seen_senders(&self, key: &K) -> Vec<ReplicaId> {
        self.state
            .borrow()
            .get(key)
            .map(|entries| entries.iter().map(|e| e.sender.clone()).collect())
            .unwrap_or_default()
    }

    pub fn set(&self, key: K, value: V) -> Result<()> {
        let req = MetaRequest {
            lamport: false,
            wall_clock: self.rule == ConflictRule::Lww,
            vc_entries: self.seen_senders(&key),
        };
        self.ctx.send_op(encode(&MapOp::Set { key, value })?, &req)
    }

    pub fn delete(&self, key: K) -> Result<()> {
        let req = MetaRequest::none().with_vc_entries(self.seen_senders(&key));
        self.ctx.send_op(encode(&MapOp::<K, V>::Delete { key })?, &req)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.state
            .borrow()
            .get(key)
            .and_then(|entries| pick(self.rule, entries).map(|e| e.value.clone()))
    }

    /// All live candidates for `key`, ordered by sender.
    pub fn get_conflicts(&self, key: &K) -> Vec<V> {
        self.state
            .borrow()
            .get(key)
            .map(|entries| entries.iter().map(|e| e.value.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has(&self, key: &K) -> bool {
        self.state.borrow().get(key).is_some_and(|e| !e.is_empty())
    }

    pub fn keys(&self) -> Vec<K> {
        self.state
            .borrow()
            .iter()
            .filter(|(_, e)| !e.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().values().filter(|e| !e.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Vec<(K, V)> {
        self.state
            .borrow()
            .iter()
            .filter_map(|(k, entries)| {
                pick(self.rule, entries).map(|e| (k.clone(), e.value.clone()))
            })
            .collect()
    }

    fn aggregate(&self, key: &K) -> Option<V> {
        self.get(key)
    }
}

impl<K: Key, V: Value + PartialEq> Collab for ValueMap<K, V> {
    fn receive(&self, path: &mut MessagePath, meta: &UpdateMeta) -> Result<()> {
        let op: MapOp<K, V> = decode(&path.pop_key()?)?;
        match op {
            MapOp::Set { key, value } => {
                let before = self.aggregate(&key);
                {
                    let mut state = self.state.borrow_mut();
                    let entries = state.entry(key.clone()).or_default();
                    prune(entries, meta);
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
                let after = self.aggregate(&key);
                if before != after {
                    if let Some(value) = after {
                        self.emit(&MapEvent::Set { key, value });
                    }
                }
            }
            MapOp::Delete { key } => {
                let was_present = self.has(&key);
                let before = self.aggregate(&key);
                let now_empty = {
                    let mut state = self.state.borrow_mut();
                    match state.get_mut(&key) {
                        Some(entries) => {
                            prune(entries, meta);
                            let empty = entries.is_empty();
                            if empty {
                                state.remove(&key);
                            }
                            empty
                        }
                        None => true,
                    }
                };
                if was_present && now_empty {
                    self.emit(&MapEvent::Delete { key });
                } else if !now_empty {
                    let after = self.aggregate(&key);
                    if before != after {
                        if let Some(value) = after {
                            self.emit(&MapEvent::Set { key, value });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn save(&self) -> Result<SavedNode> {
        Ok(SavedNode::with_payload(encode(&*self.state.borrow())?))
    }

    fn load(&self, node: &SavedNode, meta: &LoadMeta) -> Result<()> {
        let incoming: BTreeMap<K, Vec<MvEntry<V>>> = decode(&node.payload)?;
        let keys: Vec<K> = {
            let state = self.state.borrow();
            incoming
                .keys()
                .chain(state.keys())
                .cloned()
                .collect::<std::collections::BTreeSet<K>>()
                .into_iter()
                .collect()
        };
        for key in keys {
            let before = self.aggregate(&key);
            let was_present = self.has(&key);
            {
                let mut state = self.state.borrow_mut();
                let entries = state.entry(key.clone()).or_default();
                merge_entries(entries, incoming.get(&key).cloned().unwrap_or_default(), meta)?;
                if entries.is_empty() {
                    state.remove(&key);
                }
            }
            let after = self.aggregate(&key);
            if was_present && !self.has(&key) {
                self.emit(&MapEvent::Delete { key });
            } else if before != after {
                if let Some(value) = after {
                    self.emit(&MapEvent::Set { key, value });
                }
            }
        }
        Ok(())
    }

    fn can_gc(&self) -> bool {
        self.state.borrow().is_empty()
    }
}
