//! Abstract cache states for the must, may and persistence analyses.
//!
//! All three domains track, per cache set, a map from line to an LRU age in `0..associativity`.
//! They differ in what an age means and in how paths are merged:
//!
//! - must: the line is cached on every path, and its age is an upper bound. Merging intersects
//!   the lines and keeps the older age.
//! - may: the line may be cached on some path, and its age is a lower bound. Merging unites the
//!   lines and keeps the younger age. A saturated state may hold lines it knows nothing about.
//! - persistence: the line was loaded in the current loop and its age is an upper bound. Lines
//!   that might have been evicted since are remembered for good.

use crate::cache_config::CacheLevelConfig;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::dataflow::{Call, DataFlowElement, LevelSummary};

/// Lines with ages, grouped by cache set. Empty sets are never stored, so that equal states
/// compare equal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgedLines {
    sets: UnorderedMap<u64, UnorderedMap<u64, u32>>,
}

impl AgedLines {
    pub fn age(&self, line: u64, level: &CacheLevelConfig) -> Option<u32> {
        self.sets
            .get(&level.set_of_line(line))?
            .get(&line)
            .cloned()
    }

    pub fn contains(&self, line: u64, level: &CacheLevelConfig) -> bool {
        self.age(line, level).is_some()
    }

    /// All `(line, age)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.sets
            .values()
            .flat_map(|s| s.iter().map(|(&l, &a)| (l, a)))
    }

    pub fn len(&self) -> usize {
        self.sets.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Make `line` the youngest of its set. Other lines of the set age by one if they are younger
    /// than `line` was (or as old, with `age_ties`), or unconditionally if `line` was absent. Lines
    /// reaching the associativity are evicted and returned.
    fn touch(&mut self, line: u64, level: &CacheLevelConfig, age_ties: bool) -> Vec<u64> {
        let assoc = level.associativity();
        let set = self
            .sets
            .entry(level.set_of_line(line))
            .or_insert_with(Default::default);
        let current = set.get(&line).cloned();
        let mut evicted = vec![];
        for (&l, age) in set.iter_mut() {
            if l == line {
                continue;
            }
            let older = match current {
                Some(a) if age_ties => *age <= a,
                Some(a) => *age < a,
                None => true,
            };
            if older {
                *age += 1;
                if *age >= assoc {
                    evicted.push(l);
                }
            }
        }
        for l in &evicted {
            set.remove(l);
        }
        set.insert(line, 0);
        evicted
    }

    /// Age every line by `by(set, line)`, evicting and returning those that reach the
    /// associativity.
    fn age_all(&mut self, level: &CacheLevelConfig, by: impl Fn(u64, u64) -> u32) -> Vec<u64> {
        let assoc = level.associativity();
        let mut evicted = vec![];
        for (&set_idx, set) in self.sets.iter_mut() {
            set.retain(|&l, age| {
                *age = age.saturating_add(by(set_idx, l));
                if *age >= assoc {
                    evicted.push(l);
                    false
                } else {
                    true
                }
            });
        }
        self.sets.retain(|_, s| !s.is_empty());
        evicted
    }

    /// Keep only lines present in both, at the older age
    fn intersect_older(&mut self, other: &Self) {
        for (set_idx, set) in self.sets.iter_mut() {
            match other.sets.get(set_idx) {
                Some(o) => set.retain(|l, age| match o.get(l) {
                    Some(&a) => {
                        *age = (*age).max(a);
                        true
                    }
                    None => false,
                }),
                None => set.retain(|_, _| false),
            }
        }
        self.sets.retain(|_, s| !s.is_empty());
    }

    /// Keep lines present in either. On lines present in both, `pick` chooses the age.
    fn union_with(&mut self, other: &Self, pick: impl Fn(u32, u32) -> u32) {
        for (&set_idx, o) in other.sets.iter() {
            let set = self.sets.entry(set_idx).or_insert_with(Default::default);
            for (&l, &a) in o.iter() {
                let age = set.entry(l).or_insert(a);
                *age = pick(*age, a);
            }
        }
    }

    /// Add `line` at age 0, unless present already at that age
    fn insert_youngest(&mut self, line: u64, level: &CacheLevelConfig) {
        self.sets
            .entry(level.set_of_line(line))
            .or_insert_with(Default::default)
            .insert(line, 0);
    }

    /// Age lines by the number of distinct other lines the call touches in their set
    fn apply_call(&mut self, call: &Call, level: &CacheLevelConfig) -> Vec<u64> {
        self.age_all(level, |set, line| call.conflicts_in_set(level, set, line))
    }

    fn drain(&mut self) -> Vec<u64> {
        let lines = self.iter().map(|(l, _)| l).collect();
        self.sets = Default::default();
        lines
    }
}

/// The must-cache: lines guaranteed cached on every path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MustCache {
    Unreached,
    Reached(AgedLines),
}

impl MustCache {
    pub fn empty() -> Self {
        MustCache::Reached(Default::default())
    }

    /// Whichever of `lines` is accessed, it is cached.
    pub fn is_hit(&self, lines: &[u64], level: &CacheLevelConfig) -> bool {
        match self {
            MustCache::Unreached => false,
            MustCache::Reached(a) => {
                !lines.is_empty() && lines.iter().all(|&l| a.contains(l, level))
            }
        }
    }
}

impl DataFlowElement for MustCache {
    fn init() -> Self {
        MustCache::Unreached
    }

    fn join_from(&mut self, other: &Self) {
        match other {
            MustCache::Unreached => {}
            MustCache::Reached(b) => match self {
                MustCache::Unreached => *self = other.clone(),
                MustCache::Reached(a) => a.intersect_older(b),
            },
        }
    }

    fn init_region_start(_summary: &LevelSummary) -> Self {
        // Nothing is guaranteed cached on entry, whether the cache is cold or unknown
        Self::empty()
    }

    fn access_line(&mut self, line: u64, level: &CacheLevelConfig) {
        if let MustCache::Reached(a) = self {
            a.touch(line, level, false);
        }
    }

    fn access_unknown(&mut self, level: &CacheLevelConfig) {
        if let MustCache::Reached(a) = self {
            a.age_all(level, |_, _| 1);
        }
    }

    fn call(&mut self, call: &Call, level: &CacheLevelConfig) {
        if let MustCache::Reached(a) = self {
            if call.is_unknown() {
                a.drain();
            } else {
                a.apply_call(call, level);
            }
        }
    }
}

/// The may-cache: lines possibly cached on some path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MayCache {
    Unreached,
    Reached {
        lines: AgedLines,
        /// Lines not tracked here may be cached as well
        saturated: bool,
    },
}

impl MayCache {
    pub fn empty(saturated: bool) -> Self {
        MayCache::Reached {
            lines: Default::default(),
            saturated,
        }
    }

    /// Whichever of `lines` is accessed, it is not cached.
    pub fn is_absent(&self, lines: &[u64], level: &CacheLevelConfig) -> bool {
        match self {
            MayCache::Unreached => false,
            MayCache::Reached { saturated: true, .. } => false,
            MayCache::Reached {
                lines: may,
                saturated: false,
            } => !lines.is_empty() && lines.iter().all(|&l| !may.contains(l, level)),
        }
    }
}

impl DataFlowElement for MayCache {
    fn init() -> Self {
        MayCache::Unreached
    }

    fn join_from(&mut self, other: &Self) {
        match other {
            MayCache::Unreached => {}
            MayCache::Reached {
                lines: b,
                saturated: sb,
            } => match self {
                MayCache::Unreached => *self = other.clone(),
                MayCache::Reached {
                    lines: a,
                    saturated: sa,
                } => {
                    a.union_with(b, u32::min);
                    *sa |= *sb;
                }
            },
        }
    }

    fn init_region_start(summary: &LevelSummary) -> Self {
        Self::empty(!summary.cold_start)
    }

    fn access_line(&mut self, line: u64, level: &CacheLevelConfig) {
        if let MayCache::Reached { lines, .. } = self {
            lines.touch(line, level, true);
        }
    }

    fn access_unknown(&mut self, _level: &CacheLevelConfig) {
        if let MayCache::Reached { saturated, .. } = self {
            *saturated = true;
        }
    }

    fn call(&mut self, call: &Call, level: &CacheLevelConfig) {
        if let MayCache::Reached { lines, saturated } = self {
            if call.is_unknown() {
                *saturated = true;
            }
            for &l in call.lines.iter() {
                lines.insert_youngest(l, level);
            }
        }
    }
}

/// The persistence cache of a loop: lines loaded since entering the loop, and the lines that
/// may have been evicted since.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistenceCache {
    Unreached,
    Reached {
        lines: AgedLines,
        evicted: UnorderedSet<u64>,
    },
}

impl PersistenceCache {
    pub fn empty() -> Self {
        PersistenceCache::Reached {
            lines: Default::default(),
            evicted: Default::default(),
        }
    }

    /// Whichever of `lines` is accessed, once loaded it is never evicted again within the loop.
    pub fn is_persistent(&self, lines: &[u64]) -> bool {
        match self {
            PersistenceCache::Unreached => false,
            PersistenceCache::Reached { evicted, .. } => {
                !lines.is_empty() && lines.iter().all(|l| !evicted.contains(l))
            }
        }
    }
}

impl DataFlowElement for PersistenceCache {
    fn init() -> Self {
        PersistenceCache::Unreached
    }

    fn join_from(&mut self, other: &Self) {
        match other {
            PersistenceCache::Unreached => {}
            PersistenceCache::Reached {
                lines: b,
                evicted: eb,
            } => match self {
                PersistenceCache::Unreached => *self = other.clone(),
                PersistenceCache::Reached {
                    lines: a,
                    evicted: ea,
                } => {
                    a.union_with(b, u32::max);
                    ea.union_with(eb);
                }
            },
        }
    }

    fn init_region_start(_summary: &LevelSummary) -> Self {
        Self::empty()
    }

    fn access_line(&mut self, line: u64, level: &CacheLevelConfig) {
        if let PersistenceCache::Reached { lines, evicted } = self {
            evicted.extend(lines.touch(line, level, false));
        }
    }

    fn access_unknown(&mut self, level: &CacheLevelConfig) {
        if let PersistenceCache::Reached { lines, evicted } = self {
            evicted.extend(lines.age_all(level, |_, _| 1));
        }
    }

    fn call(&mut self, call: &Call, level: &CacheLevelConfig) {
        if let PersistenceCache::Reached { lines, evicted } = self {
            if call.is_unknown() {
                evicted.extend(lines.drain());
            } else {
                evicted.extend(lines.apply_call(call, level));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache_config::CacheLevel;
    use crate::dataflow::{AccessTarget, CalleeEffect};
    use crate::stack_height::StackHeight;

    /// Two sets of two ways: even lines map to set 0, odd lines to set 1
    fn level() -> CacheLevelConfig {
        CacheLevelConfig::new(CacheLevel::L1D, 256, 2, 64).unwrap()
    }

    fn must_after(lines: &[u64]) -> MustCache {
        let level = level();
        let mut m = MustCache::empty();
        for &l in lines {
            m.access_line(l, &level);
        }
        m
    }

    #[test]
    fn must_follows_lru() {
        let level = level();
        let m = must_after(&[0, 2]);
        assert!(m.is_hit(&[0, 2], &level));
        match &m {
            MustCache::Reached(a) => {
                assert_eq!(a.age(0, &level), Some(1));
                assert_eq!(a.age(2, &level), Some(0));
            }
            MustCache::Unreached => unreachable!(),
        }
        // A third line in set 0 evicts the oldest; set 1 is untouched
        let m = must_after(&[0, 2, 1, 4]);
        assert!(!m.is_hit(&[0], &level));
        assert!(m.is_hit(&[2, 4, 1], &level));
        // Re-accessing a line only ages younger lines
        let m = must_after(&[0, 2, 0, 4]);
        assert!(m.is_hit(&[0, 4], &level));
        assert!(!m.is_hit(&[2], &level));
    }

    #[test]
    fn must_join_keeps_common_lines_at_older_age() {
        let level = level();
        let mut a = must_after(&[0, 2]);
        let b = must_after(&[2, 0, 6]);
        let before = a.clone();
        a.join_from(&b);
        match &a {
            MustCache::Reached(lines) => {
                assert_eq!(lines.len(), 1);
                assert_eq!(lines.age(0, &level), Some(1));
            }
            MustCache::Unreached => unreachable!(),
        }
        // Joining never adds lines nor makes them younger
        if let (MustCache::Reached(joined), MustCache::Reached(prev)) = (&a, &before) {
            for (l, age) in joined.iter() {
                assert!(prev.age(l, &level).map_or(false, |p| p <= age));
            }
        }
        let mut u = MustCache::init();
        u.join_from(&b);
        assert_eq!(u, b);
        let mut c = b.clone();
        c.join_from(&MustCache::init());
        assert_eq!(c, b);
    }

    #[test]
    fn may_proves_absence_only_when_not_saturated() {
        let level = level();
        let mut may = MayCache::empty(false);
        may.access_line(0, &level);
        assert!(may.is_absent(&[2, 4], &level));
        assert!(!may.is_absent(&[0], &level));
        assert!(!may.is_absent(&[], &level));

        let mut other = MayCache::empty(false);
        other.access_line(2, &level);
        may.join_from(&other);
        assert!(!may.is_absent(&[2], &level));
        assert!(may.is_absent(&[4], &level));

        may.access_unknown(&level);
        assert!(!may.is_absent(&[4], &level));
        assert!(!MayCache::empty(true).is_absent(&[4], &level));
    }

    #[test]
    fn may_evicts_only_when_certain() {
        let level = level();
        let mut may = MayCache::empty(false);
        for l in [0, 2, 4] {
            may.access_line(l, &level);
        }
        assert!(may.is_absent(&[0], &level));

        // On one path line 0 was refreshed, so it may still be cached
        let mut a = MayCache::empty(false);
        a.access_line(0, &level);
        let mut b = a.clone();
        b.access_line(2, &level);
        a.join_from(&b);
        a.access_line(4, &level);
        assert!(!a.is_absent(&[0], &level));
    }

    #[test]
    fn persistence_remembers_evictions() {
        let level = level();
        let mut p = PersistenceCache::empty();
        for l in [0, 2, 1] {
            p.access_line(l, &level);
        }
        assert!(p.is_persistent(&[0, 2, 1]));
        p.access_line(4, &level);
        assert!(!p.is_persistent(&[0]));
        p.access_line(0, &level);
        assert!(!p.is_persistent(&[0]));
        assert!(p.is_persistent(&[1]));
        p.access_unknown(&level);
        assert!(p.is_persistent(&[1]));
        p.access_unknown(&level);
        assert!(!p.is_persistent(&[1]));
    }

    fn call_touching(lines: &[u64]) -> Call {
        let effect = CalleeEffect {
            lines: lines.iter().cloned().collect(),
            ..Default::default()
        };
        Call::new(effect, &level(), 0)
    }

    fn unknown_call() -> Call {
        Call::new(CalleeEffect::unknown(), &level(), 0)
    }

    #[test]
    fn calls_apply_footprints() {
        let level = level();
        let footprint = call_touching(&[4, 6]);

        let mut m = must_after(&[0, 1]);
        m.call(&footprint, &level);
        assert!(!m.is_hit(&[0], &level));
        assert!(m.is_hit(&[1], &level));

        let mut m = must_after(&[4]);
        m.call(&call_touching(&[4]), &level);
        assert!(m.is_hit(&[4], &level));
        m.call(&unknown_call(), &level);
        assert!(!m.is_hit(&[4], &level));

        let mut may = MayCache::empty(false);
        may.call(&footprint, &level);
        assert!(!may.is_absent(&[4], &level));
        assert!(may.is_absent(&[0], &level));
        may.call(&unknown_call(), &level);
        assert!(!may.is_absent(&[0], &level));

        let mut p = PersistenceCache::empty();
        p.access_line(1, &level);
        p.access_line(0, &level);
        p.call(&footprint, &level);
        assert!(!p.is_persistent(&[0]));
        assert!(p.is_persistent(&[1]));
        p.call(&unknown_call(), &level);
        assert!(!p.is_persistent(&[1]));
    }

    #[test]
    fn callee_frames_lie_below_the_call_site() {
        let level = level();
        // The callee touches the 16 bytes below its entry stack pointer
        let callee = CalleeEffect {
            frame: [-16].into_iter().collect(),
            ..Default::default()
        };
        let base = 0x1000;

        // Called with the caller's own frame 128 bytes deep, the callee lands two lines lower
        let call = Call::new(callee.called_at(StackHeight::Known(-128)), &level, base);
        assert_eq!(call.effect.frame.iter().collect::<Vec<_>>(), vec![&-144]);
        let caller_line = level.line_index(base - 16);
        assert_eq!(call.lines.iter().collect::<Vec<_>>(), vec![&(caller_line - 2)]);
        // and, sharing the set, evicts the caller's older line from a two-way cache
        let mut m = MustCache::empty();
        m.access_line(caller_line, &level);
        m.access_line(caller_line + 2, &level);
        m.call(&call, &level);
        assert!(!m.is_hit(&[caller_line], &level));

        let lost = callee.called_at(StackHeight::Unknown);
        assert!(lost.unknown && lost.frame.is_empty());
        assert!(!CalleeEffect::default()
            .called_at(StackHeight::Unknown)
            .unknown);
    }

    #[test]
    fn access_to_one_of_several_lines() {
        let level = level();
        let mut m = must_after(&[0]);
        m.access(&AccessTarget::Lines(vec![2, 4]), &level);
        // Line 0 aged on both paths but survives; neither candidate is guaranteed
        assert!(m.is_hit(&[0], &level));
        assert!(!m.is_hit(&[2], &level));

        let mut may = MayCache::empty(false);
        may.access(&AccessTarget::Lines(vec![2, 4]), &level);
        assert!(!may.is_absent(&[2], &level));
        assert!(!may.is_absent(&[4], &level));
        assert!(may.is_absent(&[6], &level));

        let mut u = MustCache::init();
        u.access(&AccessTarget::Lines(vec![2, 4]), &level);
        assert_eq!(u, MustCache::Unreached);
    }
}
