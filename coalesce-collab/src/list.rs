use crate::Value;
use coalesce_base::{misuse, safe_u64, Result};
use coalesce_pos::{Bias, OrderedIndex, Position, WaypointDesc};
use coalesce_runtime::{Collab, CollabContext, LoadMeta, MessagePath, MetaRequest, UpdateMeta};
use coalesce_wire::{decode, encode, SavedNode};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
enum ListOp<T: Value> {
    Insert {
        counter: u64,
        start: u64,
        desc: Option<WaypointDesc>,
        values: Vec<T>,
    },
    Delete {
        runs: Vec<(Position, u64)>,
    },
}

#[derive(Clone, Debug)]
pub enum ListEvent<T> {
    Insert {
        index: usize,
        values: Vec<T>,
        positions: Vec<Position>,
    },
    Delete {
        index: usize,
        value: T,
        position: Position,
    },
}

/// A list of immutable values. Positions are unique, so concurrent
/// inserts never conflict; concurrent runs in the same gap land adjacent,
/// never interleaved.
pub struct ValueList<T: Value> {
    ctx: CollabContext,
    index: RefCell<OrderedIndex<Vec<T>>>,
    subs: RefCell<Vec<Rc<dyn Fn(&ListEvent<T>)>>>,
}

impl<T: Value> ValueList<T> {
    pub fn new(ctx: CollabContext) -> Rc<Self> {
        let index = OrderedIndex::new(ctx.replica_id().clone());
        Rc::new(ValueList {
            ctx,
            index: RefCell::new(index),
            subs: RefCell::new(Vec::new()),
        })
    }

    pub fn on_event(&self, f: impl Fn(&ListEvent<T>) + 'static) {
        self.subs.borrow_mut().push(Rc::new(f));
    }

    fn emit(&self, ev: &ListEvent<T>) {
        let subs: Vec<_> = self.subs.borrow().clone();
        for f in subs {
            f(ev);
        }
    }

    pub fn len(&self) -> usize {
        self.index.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Option<T> {
        self.index.borrow().get(i)
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.index
            .borrow()
            .entries()
            .into_iter()
            .map(|(_, v)| v)
            .collect()
    }

    pub fn slice(&self, at: usize, count: usize) -> Vec<T> {
        (at..at + count).filter_map(|i| self.get(i)).collect()
    }

    /// (position, value) pairs in list order.
    pub fn entries(&self) -> Vec<(Position, T)> {
        self.index.borrow().entries()
    }

    pub fn get_position(&self, i: usize) -> Result<Position> {
        self.index.borrow().position_at(i)
    }

    pub fn index_of_position(&self, pos: &Position) -> Result<Option<usize>> {
        self.index.borrow().index_of(pos)
    }

    pub fn index_of_position_biased(&self, pos: &Position, bias: Bias) -> Result<i64> {
        self.index.borrow().index_of_biased(pos, bias)
    }

    pub fn insert(&self, at: usize, values: Vec<T>) -> Result<()> {
        if values.is_empty() {
            return Err(misuse("insert needs at least one value"));
        }
        self.ctx.check_sendable()?;
        let (start, desc) = self
            .index
            .borrow_mut()
            .create_positions(at, values.len() as u64)?;
        let op = ListOp::Insert {
            counter: start.counter,
            start: start.value_index,
            desc,
            values,
        };
        self.ctx.send_op(encode(&op)?, &MetaRequest::none())
    }

    pub fn push(&self, value: T) -> Result<()> {
        self.insert(self.len(), vec![value])
    }

    pub fn delete(&self, at: usize, count: usize) -> Result<()> {
        let len = self.len();
        if at + count > len {
            return Err(misuse(format!(
                "delete range {at}..{} beyond length {len}",
                at + count
            )));
        }
        if count == 0 {
            return Ok(());
        }
        self.ctx.check_sendable()?;
        let runs = {
            let index = self.index.borrow();
            let mut runs: Vec<(Position, u64)> = Vec::new();
            for i in at..at + count {
                let pos = index.position_at(i)?;
                match runs.last_mut() {
                    Some((p, n))
                        if p.sender == pos.sender
                            && p.counter == pos.counter
                            && p.value_index + *n == pos.value_index =>
                    {
                        *n += 1
                    }
                    _ => runs.push((pos, 1)),
                }
            }
            runs
        };
        let op = ListOp::<T>::Delete { runs };
        self.ctx.send_op(encode(&op)?, &MetaRequest::none())
    }

    fn apply(&self, op: ListOp<T>, meta: &UpdateMeta) -> Result<()> {
        match op {
            ListOp::Insert {
                counter,
                start,
                desc,
                values,
            } => {
                let pos = Position {
                    sender: meta.sender.clone(),
                    counter,
                    value_index: start,
                };
                let index = self
                    .index
                    .borrow_mut()
                    .apply_insert(&pos, values.clone(), desc.as_ref())?;
                let positions = (0..values.len() as u64)
                    .map(|i| Position {
                        sender: meta.sender.clone(),
                        counter,
                        value_index: start + i,
                    })
                    .collect();
                self.emit(&ListEvent::Insert {
                    index,
                    values,
                    positions,
                });
            }
            ListOp::Delete { runs } => {
                for (start, n) in runs {
                    safe_u64(n)?;
                    for i in 0..n {
                        let pos = Position {
                            sender: start.sender.clone(),
                            counter: start.counter,
                            value_index: start.value_index + i,
                        };
                        let removed = self.index.borrow_mut().delete(&pos)?;
                        if let Some((index, value)) = removed {
                            self.emit(&ListEvent::Delete {
                                index,
                                value,
                                position: pos,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl<T: Value> Collab for ValueList<T> {
    fn receive(&self, path: &mut MessagePath, meta: &UpdateMeta) -> Result<()> {
        let op: ListOp<T> = decode(&path.pop_key()?)?;
        self.apply(op, meta)
    }

    fn save(&self) -> Result<SavedNode> {
        Ok(SavedNode::with_payload(self.index.borrow().save()?))
    }

    fn load(&self, node: &SavedNode, _meta: &LoadMeta) -> Result<()> {
        let delta = self.index.borrow_mut().load(&node.payload)?;
        for (pos, value) in delta.inserted {
            if let Some(index) = self.index.borrow().index_of(&pos)? {
                self.emit(&ListEvent::Insert {
                    index,
                    values: vec![value],
                    positions: vec![pos],
                });
            }
        }
        for (pos, value) in delta.deleted {
            let index = self.index.borrow().index_of_biased(&pos, Bias::Right)?;
            self.emit(&ListEvent::Delete {
                index: index.max(0) as usize,
                value,
                position: pos,
            });
        }
        Ok(())
    }

    fn can_gc(&self) -> bool {
        self.index.borrow().is_trivial()
    }
}
