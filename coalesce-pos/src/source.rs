use coalesce_base::{malformed, misuse, safe_u64, ReplicaId, Result};
use rapidhash::RapidHashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One slot of the dense total order. Positions are never reused and never
/// deleted; deleting a list element removes the value, not the position.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub sender: ReplicaId,
    pub counter: u64,
    pub value_index: u64,
}

impl std::fmt::Debug for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.sender, self.counter, self.value_index)
    }
}

/// Description of a freshly created waypoint, shipped alongside the first
/// positions allocated in it. `parent` names the attach point: the value
/// `parent.value_index` of the waypoint `(parent.sender, parent.counter)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaypointDesc {
    pub parent: Position,
    pub is_right: bool,
}

/// Arena handle for one waypoint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct Wp(pub(crate) u32);

pub(crate) struct Waypoint {
    pub(crate) sender: ReplicaId,
    pub(crate) counter: u64,
    pub(crate) parent: Option<Wp>,
    pub(crate) parent_value_index: u64,
    pub(crate) is_right: bool,
    pub(crate) value_count: u64,
    /// Children in traversal order: (attach index, left<right, sender
    /// ascending, counter descending).
    pub(crate) children: Vec<Wp>,
}

/// Waypoint record inside a saved index payload. Saved lists are written
/// in arena order, which puts every parent before its children.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct SavedWaypoint {
    pub(crate) sender: ReplicaId,
    pub(crate) counter: u64,
    pub(crate) parent_sender: ReplicaId,
    pub(crate) parent_counter: u64,
    pub(crate) parent_value_index: u64,
    pub(crate) is_right: bool,
    pub(crate) value_count: u64,
}

pub struct PositionSource {
    local: ReplicaId,
    arena: Vec<Waypoint>,
    table: RapidHashMap<(ReplicaId, u64), Wp>,
    next_counter: u64,
}

pub(crate) const ROOT: Wp = Wp(0);

impl PositionSource {
    pub fn new(local: ReplicaId) -> Self {
        let root = Waypoint {
            sender: ReplicaId::root(),
            counter: 0,
            parent: None,
            parent_value_index: 0,
            is_right: false,
            // One phantom value everything ultimately hangs off; it is
            // never exposed as a position.
            value_count: 1,
            children: Vec::new(),
        };
        let mut table = RapidHashMap::default();
        table.insert((ReplicaId::root(), 0), ROOT);
        PositionSource {
            local,
            arena: vec![root],
            table,
            next_counter: 1,
        }
    }

    pub fn local(&self) -> &ReplicaId {
        &self.local
    }

    /// True when only the synthetic root exists.
    pub fn is_trivial(&self) -> bool {
        self.arena.len() == 1
    }

    pub(crate) fn wp(&self, w: Wp) -> &Waypoint {
        &self.arena[w.0 as usize]
    }

    pub(crate) fn children_of(&self, w: Wp) -> &[Wp] {
        &self.arena[w.0 as usize].children
    }

    pub(crate) fn position_of(&self, w: Wp, value_index: u64) -> Position {
        let wp = self.wp(w);
        Position {
            sender: wp.sender.clone(),
            counter: wp.counter,
            value_index,
        }
    }

    pub(crate) fn lookup(&self, pos: &Position) -> Result<Wp> {
        safe_u64(pos.counter)?;
        safe_u64(pos.value_index)?;
        let key = (pos.sender.clone(), pos.counter);
        let Some(&w) = self.table.get(&key) else {
            return Err(malformed(format!("unknown waypoint for position {pos:?}")));
        };
        if pos.value_index >= self.wp(w).value_count {
            return Err(malformed(format!("position {pos:?} beyond its waypoint")));
        }
        Ok(w)
    }

    pub fn is_known(&self, pos: &Position) -> bool {
        self.table
            .get(&(pos.sender.clone(), pos.counter))
            .is_some_and(|&w| pos.value_index < self.wp(w).value_count)
    }

    fn sibling_cmp(&self, a: Wp, b: Wp) -> Ordering {
        let wa = self.wp(a);
        let wb = self.wp(b);
        wa.parent_value_index
            .cmp(&wb.parent_value_index)
            .then(wa.is_right.cmp(&wb.is_right))
            .then_with(|| wa.sender.cmp(&wb.sender))
            // Same sender, same attach point: only reachable across a
            // fully deleted gap; newer waypoints sort first.
            .then_with(|| wb.counter.cmp(&wa.counter))
    }

    fn alloc(
        &mut self,
        sender: ReplicaId,
        counter: u64,
        parent: Wp,
        parent_value_index: u64,
        is_right: bool,
        value_count: u64,
    ) -> Wp {
        let w = Wp(self.arena.len() as u32);
        if sender == self.local {
            self.next_counter = self.next_counter.max(counter + 1);
        }
        self.arena.push(Waypoint {
            sender: sender.clone(),
            counter,
            parent: Some(parent),
            parent_value_index,
            is_right,
            value_count,
            children: Vec::new(),
        });
        self.table.insert((sender, counter), w);
        let at = {
            let kids = &self.wp(parent).children;
            kids.iter()
                .position(|&c| self.sibling_cmp(w, c) == Ordering::Less)
                .unwrap_or(kids.len())
        };
        self.arena[parent.0 as usize].children.insert(at, w);
        w
    }

    fn has_right_children_at(&self, w: Wp, value_index: u64) -> bool {
        self.wp(w).children.iter().any(|&c| {
            let cw = self.wp(c);
            cw.is_right && cw.parent_value_index == value_index
        })
    }

    /// Allocate `count` fresh positions strictly between `prev` and `next`
    /// (either may be absent at the ends of the sequence). Returns the
    /// first position and, when a new waypoint had to be created, its
    /// description for shipping to peers. Extending our own newest run in
    /// place ships no description.
    pub fn create_positions(
        &mut self,
        prev: Option<&Position>,
        next: Option<&Position>,
        count: u64,
    ) -> Result<(Position, Option<WaypointDesc>)> {
        if count == 0 {
            return Err(misuse("cannot create an empty run of positions"));
        }
        let (attach, attach_index, is_right) = match prev {
            Some(p) => {
                let w = self.lookup(p)?;
                let crowded = self.has_right_children_at(w, p.value_index);
                let (w_sender_is_local, w_counter, w_count) = {
                    let wp = self.wp(w);
                    (wp.sender == self.local, wp.counter, wp.value_count)
                };
                if w_sender_is_local && p.value_index + 1 == w_count && !crowded {
                    self.arena[w.0 as usize].value_count += count;
                    let start = Position {
                        sender: self.local.clone(),
                        counter: w_counter,
                        value_index: w_count,
                    };
                    return Ok((start, None));
                }
                if !crowded || next.is_none() {
                    (w, p.value_index, true)
                } else {
                    let q = next.unwrap_or_else(|| unreachable!());
                    (self.lookup(q)?, q.value_index, false)
                }
            }
            None => match next {
                Some(q) => (self.lookup(q)?, q.value_index, false),
                None => (ROOT, 0, true),
            },
        };
        let counter = self.next_counter;
        self.next_counter += 1;
        self.alloc(
            self.local.clone(),
            counter,
            attach,
            attach_index,
            is_right,
            count,
        );
        let parent = self.wp(attach);
        let desc = WaypointDesc {
            parent: Position {
                sender: parent.sender.clone(),
                counter: parent.counter,
                value_index: attach_index,
            },
            is_right,
        };
        let start = Position {
            sender: self.local.clone(),
            counter,
            value_index: 0,
        };
        Ok((start, Some(desc)))
    }

    fn validate_desc(&self, w: Wp, d: &WaypointDesc) -> Result<()> {
        let wp = self.wp(w);
        let Some(p) = wp.parent else {
            return Err(malformed("description names the root waypoint"));
        };
        let pw = self.wp(p);
        if pw.sender != d.parent.sender
            || pw.counter != d.parent.counter
            || wp.parent_value_index != d.parent.value_index
            || wp.is_right != d.is_right
        {
            return Err(malformed("waypoint description conflicts with known waypoint"));
        }
        Ok(())
    }

    /// Incorporate a run of positions allocated elsewhere (or echoed back
    /// from a local allocation). Idempotent: a known waypoint is only
    /// revalidated and possibly extended at its end.
    pub fn receive_positions(
        &mut self,
        start: &Position,
        count: u64,
        desc: Option<&WaypointDesc>,
    ) -> Result<()> {
        if count == 0 {
            return Err(malformed("empty position run"));
        }
        if start.sender.is_root() {
            return Err(malformed("positions cannot belong to the root sender"));
        }
        safe_u64(start.counter)?;
        let end = start
            .value_index
            .checked_add(count)
            .ok_or_else(|| malformed("position run overflows"))?;
        safe_u64(end)?;
        let key = (start.sender.clone(), start.counter);
        if let Some(w) = self.table.get(&key).copied() {
            if let Some(d) = desc {
                self.validate_desc(w, d)?;
            }
            let wc = &mut self.arena[w.0 as usize].value_count;
            *wc = (*wc).max(end);
            return Ok(());
        }
        let Some(d) = desc else {
            return Err(malformed(format!(
                "positions for unknown waypoint {}:{} arrived without a description",
                start.sender, start.counter
            )));
        };
        let parent_key = (d.parent.sender.clone(), d.parent.counter);
        let Some(&pw) = self.table.get(&parent_key) else {
            return Err(malformed(format!(
                "waypoint parent {}:{} is unknown",
                d.parent.sender, d.parent.counter
            )));
        };
        if d.parent.value_index >= self.wp(pw).value_count {
            return Err(malformed("waypoint attaches beyond its parent's values"));
        }
        if start.value_index != 0 {
            return Err(malformed("a new waypoint's run must start at value index 0"));
        }
        self.alloc(
            start.sender.clone(),
            start.counter,
            pw,
            d.parent.value_index,
            d.is_right,
            count,
        );
        Ok(())
    }

    /// Total order over positions, <0 / 0 / >0 in the `Ordering` sense.
    pub fn compare(&self, a: &Position, b: &Position) -> Result<Ordering> {
        if a == b {
            return Ok(Ordering::Equal);
        }
        let pa = self.root_path(a)?;
        let pb = self.root_path(b)?;
        for (sa, sb) in pa.iter().zip(pb.iter()) {
            let ord = sa.cmp_step(sb);
            if ord != Ordering::Equal {
                return Ok(ord);
            }
        }
        // Paths can only be fully equal for equal positions, handled above.
        Ok(Ordering::Equal)
    }

    fn root_path(&self, pos: &Position) -> Result<Vec<PathStep>> {
        let mut w = self.lookup(pos)?;
        let mut steps = vec![PathStep {
            slot: pos.value_index,
            rank: 1,
            sender: ReplicaId::root(),
            counter: 0,
        }];
        loop {
            let wp = self.wp(w);
            let Some(p) = wp.parent else { break };
            steps.push(PathStep {
                slot: wp.parent_value_index,
                rank: if wp.is_right { 2 } else { 0 },
                sender: wp.sender.clone(),
                counter: wp.counter,
            });
            w = p;
        }
        steps.reverse();
        Ok(steps)
    }

    pub(crate) fn save_waypoints(&self) -> Vec<SavedWaypoint> {
        self.arena
            .iter()
            .skip(1)
            .map(|wp| {
                let parent = self.wp(wp.parent.unwrap_or(ROOT));
                SavedWaypoint {
                    sender: wp.sender.clone(),
                    counter: wp.counter,
                    parent_sender: parent.sender.clone(),
                    parent_counter: parent.counter,
                    parent_value_index: wp.parent_value_index,
                    is_right: wp.is_right,
                    value_count: wp.value_count,
                }
            })
            .collect()
    }

    /// Merge one saved waypoint record. Returns the handle and the value
    /// count known before the merge (zero for a new waypoint).
    pub(crate) fn merge_waypoint(&mut self, sw: &SavedWaypoint) -> Result<(Wp, u64)> {
        safe_u64(sw.counter)?;
        safe_u64(sw.value_count)?;
        safe_u64(sw.parent_value_index)?;
        let key = (sw.sender.clone(), sw.counter);
        if let Some(&w) = self.table.get(&key) {
            let desc = WaypointDesc {
                parent: Position {
                    sender: sw.parent_sender.clone(),
                    counter: sw.parent_counter,
                    value_index: sw.parent_value_index,
                },
                is_right: sw.is_right,
            };
            self.validate_desc(w, &desc)?;
            let old = self.wp(w).value_count;
            let wc = &mut self.arena[w.0 as usize].value_count;
            *wc = (*wc).max(sw.value_count);
            return Ok((w, old));
        }
        let parent_key = (sw.parent_sender.clone(), sw.parent_counter);
        let Some(&pw) = self.table.get(&parent_key) else {
            return Err(malformed("saved waypoints out of order: parent unknown"));
        };
        if sw.parent_value_index >= self.wp(pw).value_count {
            return Err(malformed("saved waypoint attaches beyond its parent"));
        }
        let w = self.alloc(
            sw.sender.clone(),
            sw.counter,
            pw,
            sw.parent_value_index,
            sw.is_right,
            sw.value_count,
        );
        Ok((w, 0))
    }
}

/// One step of a position's path from the root: descending into a left
/// child (rank 0), landing on a value (rank 1), or descending into a right
/// child (rank 2), all at a given value slot of the current waypoint.
struct PathStep {
    slot: u64,
    rank: u8,
    sender: ReplicaId,
    counter: u64,
}

impl PathStep {
    fn cmp_step(&self, other: &PathStep) -> Ordering {
        self.slot
            .cmp(&other.slot)
            .then(self.rank.cmp(&other.rank))
            .then_with(|| {
                if self.rank == 1 {
                    Ordering::Equal
                } else {
                    self.sender
                        .cmp(&other.sender)
                        .then(other.counter.cmp(&self.counter))
                }
            })
    }
}
