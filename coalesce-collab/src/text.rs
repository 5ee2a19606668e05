use coalesce_base::{misuse, safe_u64, Result};
use coalesce_pos::{Bias, CharRuns, OrderedIndex, Position, RunBuffer, WaypointDesc};
use coalesce_runtime::{Collab, CollabContext, LoadMeta, MessagePath, MetaRequest, UpdateMeta};
use coalesce_wire::{decode, encode, SavedNode};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

#[derive(Serialize, Deserialize)]
enum TextOp {
    Insert {
        counter: u64,
        start: u64,
        desc: Option<WaypointDesc>,
        text: String,
    },
    Delete {
        runs: Vec<(Position, u64)>,
    },
}

#[derive(Clone, Debug)]
pub enum TextEvent {
    Insert {
        index: usize,
        text: String,
        start: Position,
    },
    Delete {
        index: usize,
        ch: char,
        position: Position,
    },
}

/// Collaborative text: a value list of chars with string-backed runs, so
/// a left-to-right typing burst stores as one string.
pub struct Text {
    ctx: CollabContext,
    index: RefCell<OrderedIndex<CharRuns>>,
    subs: RefCell<Vec<Rc<dyn Fn(&TextEvent)>>>,
}

impl Text {
    pub fn new(ctx: CollabContext) -> Rc<Self> {
        let index = OrderedIndex::new(ctx.replica_id().clone());
        Rc::new(Text {
            ctx,
            index: RefCell::new(index),
            subs: RefCell::new(Vec::new()),
        })
    }

    pub fn on_event(&self, f: impl Fn(&TextEvent) + 'static) {
        self.subs.borrow_mut().push(Rc::new(f));
    }

    fn emit(&self, ev: &TextEvent) {
        let subs: Vec<_> = self.subs.borrow().clone();
        for f in subs {
            f(ev);
        }
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.index.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn text(&self) -> String {
        self.index
            .borrow()
            .entries()
            .into_iter()
            .map(|(_, c)| c)
            .collect()
    }

    pub fn char_at(&self, i: usize) -> Option<char> {
        self.index.borrow().get(i)
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

    /// Total order over this text's positions.
    pub fn compare(&self, a: &Position, b: &Position) -> Result<Ordering> {
        self.index.borrow().compare(a, b)
    }

    pub fn insert(&self, at: usize, s: &str) -> Result<()> {
        let run = CharRuns::from(s);
        let count = run.len() as u64;
        if count == 0 {
            return Err(misuse("insert needs at least one char"));
        }
        self.ctx.check_sendable()?;
        let (start, desc) = self.index.borrow_mut().create_positions(at, count)?;
        let op = TextOp::Insert {
            counter: start.counter,
            start: start.value_index,
            desc,
            text: s.to_string(),
        };
        self.ctx.send_op(encode(&op)?, &MetaRequest::none())
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
        self.ctx
            .send_op(encode(&TextOp::Delete { runs })?, &MetaRequest::none())
    }

    fn apply(&self, op: TextOp, meta: &UpdateMeta) -> Result<()> {
        match op {
            TextOp::Insert {
                counter,
                start,
                desc,
                text,
            } => {
                let pos = Position {
                    sender: meta.sender.clone(),
                    counter,
                    value_index: start,
                };
                let run = CharRuns(text.clone());
                let index = self
                    .index
                    .borrow_mut()
                    .apply_insert(&pos, run, desc.as_ref())?;
                self.emit(&TextEvent::Insert {
                    index,
                    text,
                    start: pos,
                });
            }
            TextOp::Delete { runs } => {
                for (start, n) in runs {
                    safe_u64(n)?;
                    for i in 0..n {
                        let pos = Position {
                            sender: start.sender.clone(),
                            counter: start.counter,
                            value_index: start.value_index + i,
                        };
                        if let Some((index, ch)) = self.index.borrow_mut().delete(&pos)? {
                            self.emit(&TextEvent::Delete {
                                index,
                                ch,
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

impl Collab for Text {
    fn receive(&self, path: &mut MessagePath, meta: &UpdateMeta) -> Result<()> {
        let op: TextOp = decode(&path.pop_key()?)?;
        self.apply(op, meta)
    }

    fn save(&self) -> Result<SavedNode> {
        Ok(SavedNode::with_payload(self.index.borrow().save()?))
    }

    fn load(&self, node: &SavedNode, _meta: &LoadMeta) -> Result<()> {
        let delta = self.index.borrow_mut().load(&node.payload)?;
        for (pos, ch) in delta.inserted {
            if let Some(index) = self.index.borrow().index_of(&pos)? {
                self.emit(&TextEvent::Insert {
                    index,
                    text: ch.to_string(),
                    start: pos,
                });
            }
        }
        for (pos, ch) in delta.deleted {
            let index = self.index.borrow().index_of_biased(&pos, Bias::Right)?;
            self.emit(&TextEvent::Delete {
                index: index.max(0) as usize,
                ch,
                position: pos,
            });
        }
        Ok(())
    }

    fn can_gc(&self) -> bool {
        self.index.borrow().is_trivial()
    }
}
