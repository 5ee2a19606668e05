use crate::text::{Text, TextEvent};
use crate::Value;
use coalesce_base::{malformed, misuse, safe_u64, ReplicaId, Result};
use coalesce_pos::Position;
use coalesce_runtime::{
    Collab, CollabContext, LoadMeta, MessagePath, MetaRequest, ParentCollab, UpdateMeta,
};
use coalesce_wire::{decode, encode, PathSegment, SavedNode};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

/// One formatting assertion: `key` takes `value` over [start, end). An
/// absent end runs to the end of the document, growing with it; a closed
/// end includes the end position itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Span<V: Value> {
    pub key: String,
    pub value: Option<V>,
    pub start: Position,
    pub end: Option<Position>,
    pub end_closed: bool,
    pub lamport: u64,
    pub sender: ReplicaId,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
struct SpanOp<V: Value> {
    key: String,
    value: Option<V>,
    start: Position,
    end: Option<Position>,
    end_closed: bool,
}

/// Append-only log of formatting spans, grouped per sender and ordered
/// within a sender by its Lamport clock (which only moves forward).
pub struct SpanLog<V: Value> {
    ctx: CollabContext,
    spans: RefCell<BTreeMap<ReplicaId, Vec<Span<V>>>>,
}

impl<V: Value> SpanLog<V> {
    pub fn new(ctx: CollabContext) -> Rc<Self> {
        Rc::new(SpanLog {
            ctx,
            spans: RefCell::new(BTreeMap::new()),
        })
    }

    fn add(
        &self,
        key: String,
        value: Option<V>,
        start: Position,
        end: Option<Position>,
        end_closed: bool,
    ) -> Result<()> {
        let op = SpanOp {
            key,
            value,
            start,
            end,
            end_closed,
        };
        self.ctx.send_op(encode(&op)?, &MetaRequest::lamport())
    }

    /// All spans in total order: (lamport, sender).
    pub fn ordered(&self) -> Vec<Span<V>> {
        let mut out: Vec<Span<V>> = self
            .spans
            .borrow()
            .values()
            .flat_map(|v| v.iter().cloned())
            .collect();
        out.sort_by(|a, b| a.lamport.cmp(&b.lamport).then_with(|| a.sender.cmp(&b.sender)));
        out
    }

    pub fn is_empty(&self) -> bool {
        self.spans.borrow().values().all(|v| v.is_empty())
    }
}

impl<V: Value> Collab for SpanLog<V> {
    fn receive(&self, path: &mut MessagePath, meta: &UpdateMeta) -> Result<()> {
        let op: SpanOp<V> = decode(&path.pop_key()?)?;
        let lamport = meta
            .lamport
            .ok_or_else(|| malformed("span op without a lamport timestamp"))?;
        self.spans
            .borrow_mut()
            .entry(meta.sender.clone())
            .or_default()
            .push(Span {
                key: op.key,
                value: op.value,
                start: op.start,
                end: op.end,
                end_closed: op.end_closed,
                lamport,
                sender: meta.sender.clone(),
            });
        Ok(())
    }

    fn save(&self) -> Result<SavedNode> {
        Ok(SavedNode::with_payload(encode(&*self.spans.borrow())?))
    }

    fn load(&self, node: &SavedNode, _meta: &LoadMeta) -> Result<()> {
        // Per-sender lists only ever append, so the merge takes the
        // longer list's suffix.
        let incoming: BTreeMap<ReplicaId, Vec<Span<V>>> = decode(&node.payload)?;
        for theirs in incoming.values() {
            for span in theirs {
                safe_u64(span.lamport)?;
            }
        }
        let mut spans = self.spans.borrow_mut();
        for (sender, theirs) in incoming {
            let ours = spans.entry(sender).or_default();
            if theirs.len() > ours.len() {
                ours.extend(theirs.into_iter().skip(ours.len()));
            }
        }
        Ok(())
    }

    fn can_gc(&self) -> bool {
        self.is_empty()
    }
}

const TEXT_CHILD: &str = "text";
const SPANS_CHILD: &str = "spans";

/// Rich text: collaborative text plus a span log, with formatting folded
/// per character in span order (newer spans override older ones on the
/// same key; a None value clears the key).
pub struct RichText<V: Value> {
    ctx: CollabContext,
    text: Rc<Text>,
    spans: Rc<SpanLog<V>>,
}

impl<V: Value> RichText<V> {
    pub fn new(ctx: CollabContext) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<RichText<V>>| {
            let parent = weak.clone() as Weak<dyn ParentCollab>;
            let text = Text::new(ctx.child_context(parent.clone(), PathSegment::name(TEXT_CHILD)));
            let spans = SpanLog::new(ctx.child_context(parent, PathSegment::name(SPANS_CHILD)));
            RichText { ctx, text, spans }
        })
    }

    pub fn text_collab(&self) -> &Rc<Text> {
        &self.text
    }

    /// The span log in (lamport, sender) order.
    pub fn spans(&self) -> Vec<Span<V>> {
        self.spans.ordered()
    }

    pub fn on_text_event(&self, f: impl Fn(&TextEvent) + 'static) {
        self.text.on_event(f);
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn text(&self) -> String {
        self.text.text()
    }

    pub fn insert(&self, at: usize, s: &str) -> Result<()> {
        self.text.insert(at, s)
    }

    pub fn delete(&self, at: usize, count: usize) -> Result<()> {
        self.text.delete(at, count)
    }

    /// Assert `key = value` over chars [start, end); None clears the key.
    /// Formatting an end-of-document range stays open and covers text
    /// appended there later.
    pub fn format(
        &self,
        start: usize,
        end: usize,
        key: &str,
        value: Option<V>,
    ) -> Result<()> {
        let len = self.len();
        if start >= end || end > len {
            return Err(misuse(format!("format range {start}..{end} invalid for length {len}")));
        }
        let start_pos = self.text.get_position(start)?;
        let end_pos = if end == len {
            None
        } else {
            Some(self.text.get_position(end)?)
        };
        self.format_span(key, value, start_pos, end_pos, false)
    }

    /// Low-level span assertion over explicit positions. A closed end
    /// covers the end position itself; an absent end runs to the end of
    /// the document.
    pub fn format_span(
        &self,
        key: &str,
        value: Option<V>,
        start: Position,
        end: Option<Position>,
        end_closed: bool,
    ) -> Result<()> {
        self.spans
            .add(key.to_string(), value, start, end, end_closed)
    }

    fn covers(&self, span: &Span<V>, pos: &Position) -> Result<bool> {
        if self.text.compare(&span.start, pos)? == std::cmp::Ordering::Greater {
            return Ok(false);
        }
        match &span.end {
            None => Ok(true),
            Some(end) => match self.text.compare(pos, end)? {
                std::cmp::Ordering::Less => Ok(true),
                std::cmp::Ordering::Equal => Ok(span.end_closed),
                std::cmp::Ordering::Greater => Ok(false),
            },
        }
    }

    /// Effective formatting at char `i`: fold every covering span in
    /// (lamport, sender) order.
    pub fn format_at(&self, i: usize) -> Result<BTreeMap<String, V>> {
        let pos = self.text.get_position(i)?;
        let mut out = BTreeMap::new();
        for span in self.spans.ordered() {
            if self.covers(&span, &pos)? {
                match &span.value {
                    Some(v) => {
                        out.insert(span.key.clone(), v.clone());
                    }
                    None => {
                        out.remove(&span.key);
                    }
                }
            }
        }
        Ok(out)
    }

    /// The text split into runs of uniform formatting.
    pub fn formatted_runs(&self) -> Result<Vec<(String, BTreeMap<String, V>)>>
    where
        V: PartialEq,
    {
        let mut out: Vec<(String, BTreeMap<String, V>)> = Vec::new();
        for i in 0..self.len() {
            let ch = self.text.char_at(i).unwrap_or('\u{fffd}');
            let fmt = self.format_at(i)?;
            match out.last_mut() {
                Some((run, f)) if *f == fmt => run.push(ch),
                _ => out.push((ch.to_string(), fmt)),
            }
        }
        Ok(out)
    }
}

impl<V: Value> ParentCollab for RichText<V> {
    fn forward_send(&self, path: Vec<PathSegment>, req: &MetaRequest) -> Result<()> {
        self.ctx.send(path, req)
    }

    fn context_of(&self) -> &CollabContext {
        &self.ctx
    }
}

impl<V: Value> Collab for RichText<V> {
    fn receive(&self, path: &mut MessagePath, meta: &UpdateMeta) -> Result<()> {
        let seg = path
            .pop()
            .ok_or_else(|| malformed("rich text message without a child name"))?;
        match seg.as_name() {
            Some(TEXT_CHILD) => self.text.receive(path, meta),
            Some(SPANS_CHILD) => self.spans.receive(path, meta),
            _ => Err(malformed(format!("unknown rich text child {seg:?}"))),
        }
    }

    fn save(&self) -> Result<SavedNode> {
        let mut children = BTreeMap::new();
        children.insert(PathSegment::name(TEXT_CHILD), self.text.save()?);
        children.insert(PathSegment::name(SPANS_CHILD), self.spans.save()?);
        Ok(SavedNode {
            payload: Vec::new(),
            children,
        })
    }

    fn load(&self, node: &SavedNode, meta: &LoadMeta) -> Result<()> {
        if let Some(text) = node.children.get(&PathSegment::name(TEXT_CHILD)) {
            self.text.load(text, meta)?;
        }
        if let Some(spans) = node.children.get(&PathSegment::name(SPANS_CHILD)) {
            self.spans.load(spans, meta)?;
        }
        Ok(())
    }

    fn can_gc(&self) -> bool {
        self.text.can_gc() && self.spans.can_gc()
    }

    fn child(&self, seg: &PathSegment) -> Option<Rc<dyn Collab>> {
        match seg.as_name() {
            Some(TEXT_CHILD) => Some(self.text.clone() as Rc<dyn Collab>),
            Some(SPANS_CHILD) => Some(self.spans.clone() as Rc<dyn Collab>),
            _ => None,
        }
    }
}
