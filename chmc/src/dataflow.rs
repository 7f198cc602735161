//! Compute cache states across the CFG of a [`Procedure`](crate::program::Procedure), one cache
//! level at a time.
//!
//! The unit of data flow is a CFG node. Each node is summarized at a level as a sequence of
//! [`Event`]s (accesses that reach the level, and calls into other procedures) which the transfer
//! function replays in order.

use crate::cache_config::CacheLevelConfig;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::log::*;
use crate::memory_ref::RefKind;
use crate::program::NodeId;
use crate::stack_height::StackHeight;
use std::collections::VecDeque;

/// A memory access of a single instruction, independent of cache level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccessSite {
    pub node: NodeId,
    /// Address of the accessing instruction
    pub instruction: u64,
    pub kind: RefKind,
}

/// The lines an access touches at a level
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessTarget {
    /// Exactly one of these lines (sorted, no duplicates)
    Lines(Vec<u64>),
    /// Any line whatsoever
    Unknown,
}

impl AccessTarget {
    pub fn lines(&self) -> &[u64] {
        match self {
            AccessTarget::Lines(lines) => lines,
            AccessTarget::Unknown => &[],
        }
    }
}

/// Cache access classification: whether an access reaches a level at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessClass {
    Always,
    Uncertain,
    Never,
}

impl std::fmt::Display for AccessClass {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AccessClass::Always => write!(f, "always"),
            AccessClass::Uncertain => write!(f, "uncertain"),
            AccessClass::Never => write!(f, "never"),
        }
    }
}

/// An access as seen by one level
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Access {
    pub site: AccessSite,
    pub target: AccessTarget,
    pub class: AccessClass,
    /// For stack accesses, the byte accessed relative to the stack pointer on entry
    pub frame_offset: Option<i64>,
}

/// What a procedure (transitively) may touch at a level. Stack bytes are kept apart from other
/// lines: where a frame lies depends on the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CalleeEffect {
    /// Lines outside of any stack frame
    pub lines: UnorderedSet<u64>,
    /// Stack bytes, relative to the stack pointer on entry to the procedure
    pub frame: UnorderedSet<i64>,
    /// The procedure may touch lines that are not known
    pub unknown: bool,
}

impl CalleeEffect {
    pub fn unknown() -> Self {
        Self {
            unknown: true,
            ..Default::default()
        }
    }

    /// Add everything `other` touches
    pub fn union_with(&mut self, other: &Self) {
        self.lines.union_with(&other.lines);
        self.frame.union_with(&other.frame);
        self.unknown |= other.unknown;
    }

    /// The effect of calling the procedure when the caller's stack pointer is `height` bytes
    /// from its own entry value. The callee's frame lies below that point; if the height is not
    /// known, neither is the frame.
    pub fn called_at(&self, height: StackHeight) -> Self {
        match height.known() {
            Some(h) => Self {
                lines: self.lines.clone(),
                frame: self.frame.iter().map(|&o| o.wrapping_add(h)).collect(),
                unknown: self.unknown,
            },
            None if self.frame.is_empty() => self.clone(),
            None => Self {
                lines: self.lines.clone(),
                frame: Default::default(),
                unknown: true,
            },
        }
    }
}

/// A call as seen by one level
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    /// What the callee touches, restated relative to the caller's entry stack pointer
    pub effect: CalleeEffect,
    /// Every line the call may touch, frame included
    pub lines: UnorderedSet<u64>,
}

impl Call {
    /// Place the frame bytes of `effect` at `stack_base`, the assumed stack pointer on entry to
    /// the caller
    pub fn new(effect: CalleeEffect, level: &CacheLevelConfig, stack_base: u64) -> Self {
        let mut lines = effect.lines.clone();
        lines.extend(
            effect
                .frame
                .iter()
                .map(|&o| level.line_index(stack_base.wrapping_add(o as u64))),
        );
        Self { effect, lines }
    }

    pub fn is_unknown(&self) -> bool {
        self.effect.unknown
    }

    /// Distinct lines of the call that map to `set`, other than `except`
    pub fn conflicts_in_set(&self, level: &CacheLevelConfig, set: u64, except: u64) -> u32 {
        self.lines
            .iter()
            .filter(|&&l| l != except && level.set_of_line(l) == set)
            .count() as u32
    }
}

/// Something that happens to the cache within a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Access(Access),
    Call(Call),
}

/// A summary of one procedure at one cache level, keeping track of the events of each node, and
/// its predecessors and successors.
#[derive(Clone, Debug)]
pub struct LevelSummary {
    pub level: CacheLevelConfig,
    pub predecessors: Vec<Vec<NodeId>>,
    pub successors: Vec<Vec<NodeId>>,
    pub entries: Vec<NodeId>,
    pub events: Vec<Vec<Event>>,
    /// The procedure starts with an empty cache, rather than an unknown one
    pub cold_start: bool,
}

impl LevelSummary {
    /// The footprint of the whole procedure at this level: every line an access may touch, along
    /// with the footprints of its calls.
    pub fn footprint(&self) -> CalleeEffect {
        let mut r = CalleeEffect::default();
        for e in self.events.iter().flatten() {
            match e {
                Event::Access(a) => match (&a.target, a.frame_offset) {
                    (AccessTarget::Unknown, _) => r.unknown = true,
                    (AccessTarget::Lines(_), Some(offset)) => {
                        r.frame.insert(offset);
                    }
                    (AccessTarget::Lines(lines), None) => r.lines.extend(lines.iter().cloned()),
                },
                Event::Call(call) => r.union_with(&call.effect),
            }
        }
        r
    }
}

/// The part of a procedure a data flow runs over. Only edges between nodes of the region are
/// followed; the entries additionally receive the region's starting state.
#[derive(Clone, Debug)]
pub struct Region {
    pub nodes: UnorderedSet<NodeId>,
    pub entries: Vec<NodeId>,
}

impl Region {
    /// The whole procedure
    pub fn whole(summary: &LevelSummary) -> Self {
        Self {
            nodes: (0..summary.events.len()).collect(),
            entries: summary.entries.clone(),
        }
    }
}

/// A single element in the data-flow analysis. Each CFG node holds on to one member of this
/// element, before and after its events.
///
/// The definition of this element is crucial to defining the entire data flow, since it also
/// defines the expected transfer function for the data flow.
pub trait DataFlowElement: PartialEq + Clone {
    /// The initial/default value to start at: "not reached on any path".
    fn init() -> Self;
    /// The join operator, when joining outs from different predecessors.
    ///
    /// Satisfies property `a.join_from(init())` keeps `a` unmodified.
    fn join_from(&mut self, other: &Self);

    /// The value at the entries of a region
    fn init_region_start(summary: &LevelSummary) -> Self;

    /// An access to exactly `line`
    fn access_line(&mut self, line: u64, level: &CacheLevelConfig);
    /// An access to a line that is not known
    fn access_unknown(&mut self, level: &CacheLevelConfig);
    /// A call into another procedure
    fn call(&mut self, call: &Call, level: &CacheLevelConfig);

    /// An access to one of several lines is the join of accessing each of them.
    fn access(&mut self, target: &AccessTarget, level: &CacheLevelConfig) {
        match target {
            AccessTarget::Unknown => self.access_unknown(level),
            AccessTarget::Lines(lines) => match lines.as_slice() {
                [] => {}
                [line] => self.access_line(*line, level),
                lines => {
                    let before = self.clone();
                    let mut joined = Self::init();
                    for &line in lines {
                        let mut s = before.clone();
                        s.access_line(line, level);
                        joined.join_from(&s);
                    }
                    *self = joined;
                }
            },
        }
    }

    fn transfer_event(&mut self, event: &Event, level: &CacheLevelConfig) {
        match event {
            Event::Access(a) => match a.class {
                AccessClass::Always => self.access(&a.target, level),
                AccessClass::Uncertain => {
                    let mut accessed = self.clone();
                    accessed.access(&a.target, level);
                    self.join_from(&accessed);
                }
                AccessClass::Never => {}
            },
            Event::Call(call) => self.call(call, level),
        }
    }

    /// The transfer function over a whole node
    fn transfer_function(&self, node: NodeId, summary: &LevelSummary) -> Self {
        let mut r = self.clone();
        for e in &summary.events[node] {
            r.transfer_event(e, &summary.level);
        }
        r
    }
}

/// Results of a data flow analysis. Uses the definition of the [`DataFlowElement`] to define the
/// type of analysis.
#[derive(Debug)]
pub struct DataFlow<T: DataFlowElement> {
    pub outs: UnorderedMap<NodeId, T>,
    pub ins: UnorderedMap<NodeId, T>,
    /// Number of node visits until the fixed point was reached
    pub iterations: usize,
}

impl<T: DataFlowElement> DataFlow<T> {
    /// Perform a forwards analysis of the data flow over `region`
    ///
    /// Uses the worklist algorithm to compute data flow
    pub fn forward_analyze(summary: &LevelSummary, region: &Region) -> Self {
        let outs: UnorderedMap<NodeId, T> =
            region.nodes.iter().map(|&n| (n, T::init())).collect();
        let ins = outs.clone();

        let mut r = Self {
            outs,
            ins,
            iterations: 0,
        };

        let mut changed: VecDeque<NodeId> = region.nodes.iter().cloned().collect();
        let mut queued: UnorderedSet<NodeId> = region.nodes.clone();

        while let Some(n) = changed.pop_front() {
            queued.remove(&n);
            r.iterations += 1;

            let mut inp = T::init();
            if region.entries.contains(&n) {
                inp.join_from(&T::init_region_start(summary));
            }
            for p in &summary.predecessors[n] {
                if let Some(out) = r.outs.get(p) {
                    inp.join_from(out);
                }
            }

            let new_out = inp.transfer_function(n, summary);
            r.ins.insert(n, inp);

            if r.outs.get(&n) != Some(&new_out) {
                r.outs.insert(n, new_out);
                for &s in &summary.successors[n] {
                    if region.nodes.contains(&s) && queued.insert(s) {
                        changed.push_back(s);
                    }
                }
            }
        }

        trace!(
            "Data flow converged";
            "level" => %summary.level.level(),
            "nodes" => region.nodes.len(),
            "iterations" => r.iterations,
        );

        r
    }

    /// The state right before each event of `node`, in order
    pub fn states_before_events(&self, node: NodeId, summary: &LevelSummary) -> Vec<T> {
        let mut state = match self.ins.get(&node) {
            Some(s) => s.clone(),
            None => T::init(),
        };
        let mut r = Vec::with_capacity(summary.events[node].len());
        for e in &summary.events[node] {
            r.push(state.clone());
            state.transfer_event(e, &summary.level);
        }
        r
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::abstract_cache::{MayCache, MustCache};
    use crate::cache_config::CacheLevel;

    /// Two sets of two ways: even lines map to set 0, odd lines to set 1
    fn level() -> CacheLevelConfig {
        CacheLevelConfig::new(CacheLevel::L1D, 256, 2, 64).unwrap()
    }

    fn load(node: NodeId, instruction: u64, line: u64) -> Event {
        Event::Access(Access {
            site: AccessSite {
                node,
                instruction,
                kind: RefKind::Data,
            },
            target: AccessTarget::Lines(vec![line]),
            class: AccessClass::Always,
            frame_offset: None,
        })
    }

    /// `entry -> head <-> body`, `head -> exit`. The entry fills set 0, which the body then
    /// keeps churning.
    fn loop_summary() -> LevelSummary {
        LevelSummary {
            level: level(),
            predecessors: vec![vec![], vec![0, 2], vec![1], vec![1]],
            successors: vec![vec![1], vec![2, 3], vec![1], vec![]],
            entries: vec![0],
            events: vec![
                vec![load(0, 0x100, 0), load(0, 0x104, 2)],
                vec![load(1, 0x108, 1)],
                vec![load(2, 0x10c, 4)],
                vec![load(3, 0x110, 1)],
            ],
            cold_start: true,
        }
    }

    /// Round-robin iteration to the fixed point, handing every change of an out-state to
    /// `check` as `(old, new)`
    fn iterate<T: DataFlowElement>(
        summary: &LevelSummary,
        mut check: impl FnMut(&T, &T),
    ) -> Vec<T> {
        let n = summary.events.len();
        let mut outs: Vec<T> = vec![T::init(); n];
        loop {
            let mut changed = false;
            for node in 0..n {
                let mut inp = T::init();
                if summary.entries.contains(&node) {
                    inp.join_from(&T::init_region_start(summary));
                }
                for &p in &summary.predecessors[node] {
                    inp.join_from(&outs[p]);
                }
                let out = inp.transfer_function(node, summary);
                if out != outs[node] {
                    check(&outs[node], &out);
                    outs[node] = out;
                    changed = true;
                }
            }
            if !changed {
                return outs;
            }
        }
    }

    #[test]
    fn must_states_only_shrink_or_age() {
        let summary = loop_summary();
        let level = level();
        let mut refinements = 0;
        let outs = iterate::<MustCache>(&summary, |old, new| match (old, new) {
            (MustCache::Unreached, _) => {}
            (MustCache::Reached(_), MustCache::Unreached) => {
                panic!("must-state became unreached")
            }
            (MustCache::Reached(old), MustCache::Reached(new)) => {
                refinements += 1;
                for (line, age) in new.iter() {
                    match old.age(line, &level) {
                        Some(previous) => assert!(age >= previous, "line {} got younger", line),
                        None => panic!("line {} appeared", line),
                    }
                }
            }
        });
        // The back edge takes lines away from the head more than once
        assert!(refinements >= 2);

        let flow = DataFlow::<MustCache>::forward_analyze(&summary, &Region::whole(&summary));
        for (node, out) in outs.iter().enumerate() {
            assert_eq!(flow.outs.get(&node), Some(out));
        }
        assert!(!out_is_hit(&flow, 1, 0, &level));
        assert!(out_is_hit(&flow, 1, 1, &level));
    }

    fn out_is_hit(
        flow: &DataFlow<MustCache>,
        node: NodeId,
        line: u64,
        level: &CacheLevelConfig,
    ) -> bool {
        flow.outs.get(&node).map_or(false, |m| m.is_hit(&[line], level))
    }

    #[test]
    fn may_states_only_grow_or_rejuvenate() {
        let summary = loop_summary();
        let level = level();
        let mut refinements = 0;
        let outs = iterate::<MayCache>(&summary, |old, new| match (old, new) {
            (MayCache::Unreached, _) => {}
            (MayCache::Reached { .. }, MayCache::Unreached) => {
                panic!("may-state became unreached")
            }
            (
                MayCache::Reached {
                    lines: old,
                    saturated: old_saturated,
                },
                MayCache::Reached {
                    lines: new,
                    saturated: new_saturated,
                },
            ) => {
                refinements += 1;
                assert!(!old_saturated || *new_saturated);
                for (line, age) in old.iter() {
                    match new.age(line, &level) {
                        Some(now) => assert!(now <= age, "line {} got older", line),
                        None => panic!("line {} disappeared", line),
                    }
                }
            }
        });
        assert!(refinements >= 1);

        let flow = DataFlow::<MayCache>::forward_analyze(&summary, &Region::whole(&summary));
        for (node, out) in outs.iter().enumerate() {
            assert_eq!(flow.outs.get(&node), Some(out));
        }
        // Line 0 may survive into the loop through the entry edge
        let head = flow.outs.get(&1).unwrap();
        assert!(!head.is_absent(&[0], &level));
        assert!(head.is_absent(&[6], &level));
    }
}
