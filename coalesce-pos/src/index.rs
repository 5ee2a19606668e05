use crate::runs::RunBuffer;
use crate::source::{Position, PositionSource, SavedWaypoint, WaypointDesc, Wp, ROOT};
use coalesce_base::{malformed, misuse, safe_u64, ReplicaId, Result};
use rapidhash::RapidHashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Direction for resolving a position that holds no value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Bias {
    /// Report absent positions as -1.
    #[default]
    None,
    /// Resolve to the nearest present index on the left, -1 at the start.
    Left,
    /// Resolve to the nearest present index on the right, the length at
    /// the end.
    Right,
}

/// Values a saved-state merge added and removed, for event reporting.
pub struct LoadDelta<V> {
    pub inserted: Vec<(Position, V)>,
    pub deleted: Vec<(Position, V)>,
}

impl<V> Default for LoadDelta<V> {
    fn default() -> Self {
        LoadDelta {
            inserted: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

/// One stretch of a waypoint's values: either a run of present values or a
/// count of deleted slots.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum Item<R> {
    Present(R),
    Deleted(u64),
}

impl<R: RunBuffer> Item<R> {
    fn len(&self) -> u64 {
        match self {
            Item::Present(run) => run.len() as u64,
            Item::Deleted(n) => *n,
        }
    }
}

/// Per-waypoint values plus the cached subtree total. The items cover
/// value indices from zero; everything past them (up to the waypoint's
/// value count) is implicitly deleted, so memory stays proportional to
/// present values. `total == 0` never happens for a stored entry.
#[derive(Clone)]
struct Entry<R> {
    items: Vec<Item<R>>,
    total: u64,
}

impl<R: RunBuffer> Default for Entry<R> {
    fn default() -> Self {
        Entry {
            items: Vec::new(),
            total: 0,
        }
    }
}

impl<R: RunBuffer> Entry<R> {
    fn covered(&self) -> u64 {
        self.items.iter().map(Item::len).sum()
    }

    fn is_present(&self, v: u64) -> bool {
        let mut base = 0;
        for item in &self.items {
            let len = item.len();
            if v < base + len {
                return matches!(item, Item::Present(_));
            }
            base += len;
        }
        false
    }

    fn value_at(&self, v: u64) -> Option<R::Value> {
        let mut base = 0;
        for item in &self.items {
            let len = item.len();
            if v < base + len {
                return match item {
                    Item::Present(run) => run.get((v - base) as usize),
                    Item::Deleted(_) => None,
                };
            }
            base += len;
        }
        None
    }

    /// Present values strictly before value index `v`.
    fn present_prefix(&self, v: u64) -> u64 {
        let mut base = 0;
        let mut count = 0;
        for item in &self.items {
            let len = item.len();
            if let Item::Present(_) = item {
                count += len.min(v.saturating_sub(base));
            }
            base += len;
            if base >= v {
                break;
            }
        }
        count
    }

    fn own_present(&self) -> u64 {
        self.items
            .iter()
            .map(|i| match i {
                Item::Present(run) => run.len() as u64,
                Item::Deleted(_) => 0,
            })
            .sum()
    }

    /// Value index of the n-th present value at or after `from`.
    fn nth_present_from(&self, from: u64, mut n: u64) -> Option<u64> {
        let mut base = 0;
        for item in &self.items {
            let len = item.len();
            if let Item::Present(_) = item {
                let lo = base.max(from);
                let hi = base + len;
                if lo < hi {
                    let avail = hi - lo;
                    if n < avail {
                        return Some(lo + n);
                    }
                    n -= avail;
                }
            }
            base += len;
        }
        None
    }

    /// Present (value index, value) pairs with value index in [from, to).
    fn present_in(&self, from: u64, to: u64, out: &mut Vec<(u64, R::Value)>) {
        let mut base = 0;
        for item in &self.items {
            let len = item.len();
            if let Item::Present(run) = item {
                let lo = base.max(from);
                let hi = (base + len).min(to);
                let mut v = lo;
                while v < hi {
                    if let Some(val) = run.get((v - base) as usize) {
                        out.push((v, val));
                    }
                    v += 1;
                }
            }
            base += len;
            if base >= to {
                break;
            }
        }
    }

    /// Make value `v` present. Returns false when it already was.
    fn set_one(&mut self, v: u64, val: R::Value) -> bool {
        let covered = self.covered();
        if v >= covered {
            if v > covered {
                self.items.push(Item::Deleted(v - covered));
            }
            if let Some(Item::Present(last)) = self.items.last_mut() {
                last.push(val);
            } else {
                self.items.push(Item::Present(R::from_values(vec![val])));
            }
            return true;
        }
        let mut base = 0;
        for idx in 0..self.items.len() {
            let len = self.items[idx].len();
            if v < base + len {
                let off = v - base;
                match &self.items[idx] {
                    Item::Present(_) => return false,
                    Item::Deleted(_) => {
                        let mut repl: Vec<Item<R>> = Vec::new();
                        if off > 0 {
                            repl.push(Item::Deleted(off));
                        }
                        repl.push(Item::Present(R::from_values(vec![val])));
                        if off + 1 < len {
                            repl.push(Item::Deleted(len - off - 1));
                        }
                        self.items.splice(idx..=idx, repl);
                        self.normalize();
                        return true;
                    }
                }
            }
            base += len;
        }
        false
    }

    /// Remove the value at `v`, if any.
    fn delete_one(&mut self, v: u64) -> Option<R::Value> {
        let mut base = 0;
        for idx in 0..self.items.len() {
            let len = self.items[idx].len();
            if v < base + len {
                let off = (v - base) as usize;
                match &mut self.items[idx] {
                    Item::Deleted(_) => return None,
                    Item::Present(run) => {
                        let val = run.get(off)?;
                        let mut tail = run.split_off(off);
                        let rest = tail.split_off(1);
                        let mut repl: Vec<Item<R>> = Vec::new();
                        let head = std::mem::take(run);
                        if !head.is_empty() {
                            repl.push(Item::Present(head));
                        }
                        repl.push(Item::Deleted(1));
                        if !rest.is_empty() {
                            repl.push(Item::Present(rest));
                        }
                        self.items.splice(idx..=idx, repl);
                        self.normalize();
                        return Some(val);
                    }
                }
            }
            base += len;
        }
        None
    }

    /// Re-establish alternation: merge adjacent same-kind items, drop
    /// empty ones and any trailing deleted run.
    fn normalize(&mut self) {
        let old = std::mem::take(&mut self.items);
        let mut out: Vec<Item<R>> = Vec::with_capacity(old.len());
        for item in old {
            if item.len() == 0 {
                continue;
            }
            match (out.last_mut(), item) {
                (Some(Item::Present(a)), Item::Present(b)) => a.extend_from(b),
                (Some(Item::Deleted(a)), Item::Deleted(b)) => *a += b,
                (_, item) => out.push(item),
            }
        }
        while matches!(out.last(), Some(Item::Deleted(_))) {
            out.pop();
        }
        self.items = out;
    }
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
struct SavedEntry<R: RunBuffer> {
    wp: SavedWaypoint,
    items: Vec<Item<R>>,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
struct SavedIndex<R: RunBuffer> {
    waypoints: Vec<SavedEntry<R>>,
}

/// Position -> value map with indexed access, layered over a
/// `PositionSource`. Translation between indices and positions walks the
/// waypoint tree using the cached totals.
pub struct OrderedIndex<R: RunBuffer> {
    source: PositionSource,
    entries: RapidHashMap<Wp, Entry<R>>,
}

impl<R: RunBuffer> OrderedIndex<R> {
    pub fn new(local: ReplicaId) -> Self {
        OrderedIndex {
            source: PositionSource::new(local),
            entries: RapidHashMap::default(),
        }
    }

    pub fn local(&self) -> &ReplicaId {
        self.source.local()
    }

    /// True when nothing distinguishes this index from a fresh one.
    pub fn is_trivial(&self) -> bool {
        self.source.is_trivial() && self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.total_of(ROOT) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn compare(&self, a: &Position, b: &Position) -> Result<Ordering> {
        self.source.compare(a, b)
    }

    pub fn is_known(&self, pos: &Position) -> bool {
        self.source.is_known(pos)
    }

    fn total_of(&self, w: Wp) -> u64 {
        self.entries.get(&w).map_or(0, |e| e.total)
    }

    fn add_total(&mut self, w: Wp, delta: i64) {
        let mut cur = Some(w);
        while let Some(c) = cur {
            let parent = self.source.wp(c).parent;
            let entry = self.entries.entry(c).or_default();
            entry.total = (entry.total as i64 + delta) as u64;
            if entry.total == 0 {
                self.entries.remove(&c);
            }
            cur = parent;
        }
    }

    /// Allocate positions for an insert at list index `at`.
    pub fn create_positions(
        &mut self,
        at: usize,
        count: u64,
    ) -> Result<(Position, Option<WaypointDesc>)> {
        let len = self.len();
        if at > len {
            return Err(misuse(format!("insert index {at} beyond length {len}")));
        }
        let prev = if at > 0 {
            Some(self.position_at(at - 1)?)
        } else {
            None
        };
        let next = if at < len {
            Some(self.position_at(at)?)
        } else {
            None
        };
        self.source.create_positions(prev.as_ref(), next.as_ref(), count)
    }

    /// Make a run of positions known without storing values at them.
    /// Movable lists allocate positions this way and park entries on
    /// them separately.
    pub fn register_positions(
        &mut self,
        start: &Position,
        count: u64,
        desc: Option<&WaypointDesc>,
    ) -> Result<()> {
        self.source.receive_positions(start, count, desc)
    }

    /// Record a run of values at freshly allocated positions (local echo
    /// and remote delivery both land here). Returns the list index of the
    /// first value.
    pub fn apply_insert(
        &mut self,
        start: &Position,
        run: R,
        desc: Option<&WaypointDesc>,
    ) -> Result<usize> {
        let count = run.len() as u64;
        self.source.receive_positions(start, count, desc)?;
        let w = self.source.lookup(start)?;
        let mut newly = 0i64;
        {
            let entry = self.entries.entry(w).or_default();
            for (i, val) in run.values().into_iter().enumerate() {
                if entry.set_one(start.value_index + i as u64, val) {
                    newly += 1;
                }
            }
            if entry.total == 0 && newly == 0 {
                self.entries.remove(&w);
            }
        }
        if newly != 0 {
            self.add_total(w, newly);
        }
        let index = self
            .count_before(start)
            .map(|(before, _)| before as usize)?;
        Ok(index)
    }

    /// Delete the value at `pos`. Returns the index it occupied and the
    /// value, or None when the position was already empty.
    pub fn delete(&mut self, pos: &Position) -> Result<Option<(usize, R::Value)>> {
        let w = self.source.lookup(pos)?;
        let (before, present) = self.count_before(pos)?;
        if !present {
            return Ok(None);
        }
        let val = self
            .entries
            .get_mut(&w)
            .and_then(|e| e.delete_one(pos.value_index));
        let Some(val) = val else { return Ok(None) };
        self.add_total(w, -1);
        Ok(Some((before as usize, val)))
    }

    pub fn get(&self, i: usize) -> Option<R::Value> {
        let pos = self.position_at(i).ok()?;
        self.value_at_position(&pos)
    }

    pub fn value_at_position(&self, pos: &Position) -> Option<R::Value> {
        let w = self.source.lookup(pos).ok()?;
        self.entries.get(&w).and_then(|e| e.value_at(pos.value_index))
    }

    /// Position of the i-th present value.
    pub fn position_at(&self, i: usize) -> Result<Position> {
        let len = self.len();
        if i >= len {
            return Err(misuse(format!("index {i} beyond length {len}")));
        }
        match self.locate(ROOT, i as u64) {
            Ok(pos) => Ok(pos),
            Err(_) => Err(misuse("index walk fell off the tree")),
        }
    }

    fn locate(&self, w: Wp, mut i: u64) -> std::result::Result<Position, u64> {
        let entry = self.entries.get(&w);
        let prefix = |to: u64| entry.map_or(0, |e| e.present_prefix(to));
        let mut emitted = 0u64;
        for &kid in self.source.children_of(w) {
            let kw = self.source.wp(kid);
            let up_to = if kw.is_right {
                kw.parent_value_index + 1
            } else {
                kw.parent_value_index
            };
            let here = prefix(up_to).saturating_sub(prefix(emitted));
            if i < here {
                let v = entry
                    .and_then(|e| e.nth_present_from(emitted, i))
                    .ok_or(0u64)?;
                return Ok(self.source.position_of(w, v));
            }
            i -= here;
            emitted = emitted.max(up_to);
            let t = self.total_of(kid);
            if i < t {
                return self.locate(kid, i);
            }
            i -= t;
        }
        let own = entry.map_or(0, |e| e.own_present());
        let tail = own.saturating_sub(prefix(emitted));
        if i < tail {
            let v = entry
                .and_then(|e| e.nth_present_from(emitted, i))
                .ok_or(0u64)?;
            return Ok(self.source.position_of(w, v));
        }
        Err(i - tail)
    }

    /// Present values strictly before `pos`, and whether `pos` itself
    /// holds a value.
    fn count_before(&self, pos: &Position) -> Result<(u64, bool)> {
        let w = self.source.lookup(pos)?;
        let entry = self.entries.get(&w);
        let mut before = entry.map_or(0, |e| e.present_prefix(pos.value_index));
        let present = entry.is_some_and(|e| e.is_present(pos.value_index));
        for &kid in self.source.children_of(w) {
            let kw = self.source.wp(kid);
            let before_value = if kw.is_right {
                kw.parent_value_index < pos.value_index
            } else {
                kw.parent_value_index <= pos.value_index
            };
            if before_value {
                before += self.total_of(kid);
            }
        }
        let mut child = w;
        loop {
            let cw = self.source.wp(child);
            let Some(p) = cw.parent else { break };
            let up_to = if cw.is_right {
                cw.parent_value_index + 1
            } else {
                cw.parent_value_index
            };
            if let Some(pe) = self.entries.get(&p) {
                before += pe.present_prefix(up_to);
            }
            for &sib in self.source.children_of(p) {
                if sib == child {
                    break;
                }
                before += self.total_of(sib);
            }
            child = p;
        }
        Ok((before, present))
    }

    pub fn index_of(&self, pos: &Position) -> Result<Option<usize>> {
        let (before, present) = self.count_before(pos)?;
        Ok(present.then_some(before as usize))
    }

    pub fn index_of_biased(&self, pos: &Position, bias: Bias) -> Result<i64> {
        let (before, present) = self.count_before(pos)?;
        Ok(match bias {
            Bias::None => {
                if present {
                    before as i64
                } else {
                    -1
                }
            }
            Bias::Left => {
                if present {
                    before as i64
                } else {
                    before as i64 - 1
                }
            }
            Bias::Right => before as i64,
        })
    }

    /// All present entries in list order.
    pub fn entries(&self) -> Vec<(Position, R::Value)> {
        let mut out = Vec::with_capacity(self.len());
        self.collect_in_order(ROOT, &mut out);
        out
    }

    fn collect_in_order(&self, w: Wp, out: &mut Vec<(Position, R::Value)>) {
        let entry = self.entries.get(&w);
        let mut emitted = 0u64;
        let mut pending: Vec<(u64, R::Value)> = Vec::new();
        for &kid in self.source.children_of(w) {
            let kw = self.source.wp(kid);
            let up_to = if kw.is_right {
                kw.parent_value_index + 1
            } else {
                kw.parent_value_index
            };
            if up_to > emitted {
                if let Some(e) = entry {
                    pending.clear();
                    e.present_in(emitted, up_to, &mut pending);
                    for (v, val) in pending.drain(..) {
                        out.push((self.source.position_of(w, v), val));
                    }
                }
                emitted = up_to;
            }
            if self.total_of(kid) > 0 {
                self.collect_in_order(kid, out);
            }
        }
        if let Some(e) = entry {
            pending.clear();
            e.present_in(emitted, u64::MAX, &mut pending);
            for (v, val) in pending.drain(..) {
                out.push((self.source.position_of(w, v), val));
            }
        }
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        let mut waypoints = Vec::new();
        for (i, wp) in self.source.save_waypoints().into_iter().enumerate() {
            let w = Wp((i + 1) as u32);
            let items = self
                .entries
                .get(&w)
                .map(|e| e.items.clone())
                .unwrap_or_default();
            waypoints.push(SavedEntry { wp, items });
        }
        coalesce_wire::encode(&SavedIndex::<R> { waypoints })
    }

    /// Merge a saved index. Value counts only grow, and a position is
    /// deleted if either side created-and-deleted it; delete is permanent.
    pub fn load(&mut self, bytes: &[u8]) -> Result<LoadDelta<R::Value>> {
        let saved: SavedIndex<R> = coalesce_wire::decode(bytes)?;
        let mut delta = LoadDelta::default();
        for se in &saved.waypoints {
            let mut covered = 0u64;
            for item in &se.items {
                let len = match item {
                    Item::Present(run) => run.len() as u64,
                    Item::Deleted(n) => safe_u64(*n)?,
                };
                covered = covered
                    .checked_add(len)
                    .ok_or_else(|| malformed("saved item runs overflow"))?;
            }
            if covered > se.wp.value_count {
                return Err(malformed(
                    "saved items cover more values than their waypoint holds",
                ));
            }
            let (w, old_count) = self.source.merge_waypoint(&se.wp)?;
            let remote = Entry::<R> {
                items: se.items.clone(),
                total: 0,
            };
            let new_count = self.source.wp(w).value_count;
            enum Act<V> {
                Ins(u64, V),
                Del(u64),
            }
            let mut acts: Vec<Act<R::Value>> = Vec::new();
            {
                let local = self.entries.get(&w);
                for v in 0..new_count {
                    let created_local = v < old_count;
                    let created_remote = v < se.wp.value_count;
                    let local_present = local.is_some_and(|e| e.is_present(v));
                    let remote_present = remote.is_present(v);
                    if local_present && created_remote && !remote_present {
                        acts.push(Act::Del(v));
                    } else if !local_present && remote_present && !created_local {
                        if let Some(val) = remote.value_at(v) {
                            acts.push(Act::Ins(v, val));
                        }
                    }
                }
            }
            if acts.is_empty() {
                continue;
            }
            let mut net = 0i64;
            let entry = self.entries.entry(w).or_default();
            for act in acts {
                match act {
                    Act::Ins(v, val) => {
                        if entry.set_one(v, val.clone()) {
                            net += 1;
                            delta.inserted.push((self.source.position_of(w, v), val));
                        }
                    }
                    Act::Del(v) => {
                        if let Some(val) = entry.delete_one(v) {
                            net -= 1;
                            delta.deleted.push((self.source.position_of(w, v), val));
                        }
                    }
                }
            }
            if net != 0 {
                self.add_total(w, net);
            } else if entry_is_empty(&self.entries, w) {
                self.entries.remove(&w);
            }
        }
        Ok(delta)
    }
}

fn entry_is_empty<R: RunBuffer>(entries: &RapidHashMap<Wp, Entry<R>>, w: Wp) -> bool {
    entries.get(&w).is_some_and(|e| e.total == 0)
}
