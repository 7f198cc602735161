//! The cache analysis proper: must/may classification of every access at every cache level,
//! persistence refinement inside loops, and categorization into the final CHMC table.
//!
//! Procedures are analyzed callee-first, so that the footprint of a callee is known by the time
//! a call to it is met. Within a procedure, levels are analyzed nearest-first: whether an access
//! reaches a level at all depends on how it was classified at the previous one.

use std::rc::Rc;

use crate::abstract_cache::{MayCache, MustCache, PersistenceCache};
use crate::analysis_config::AnalysisConfig;
use crate::cache_config::{CacheHierarchy, CacheLevel, CacheLevelConfig};
use crate::chmc::{ChmcEntry, ChmcTable, Classification};
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::dataflow::{
    Access, AccessClass, AccessSite, AccessTarget, Call, CalleeEffect, DataFlow, Event,
    LevelSummary, Region,
};
use crate::errors::{ChmcError, Result};
use crate::log::*;
use crate::memory_ref::{RefKind, ReferenceTables};
use crate::program::{CallOrder, LoopId, Program};
use crate::resolver::AddressResolver;

/// Identifies an access at a cache level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccessKey {
    pub procedure: usize,
    pub site: AccessSite,
    pub level: CacheLevel,
}

/// What the analysis concluded for an access at a level
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub access: AccessClass,
    pub classification: Classification,
    pub loop_context: Option<LoopId>,
}

/// Whether an access reaches `level`, given its verdict at the previous level (`None` if it did
/// not reach that one either)
fn next_level_access(previous: Option<&Verdict>) -> AccessClass {
    match previous {
        None => AccessClass::Never,
        Some(v) => match (v.access, v.classification) {
            (AccessClass::Never, _) | (_, Classification::AlwaysHit) => AccessClass::Never,
            (AccessClass::Always, Classification::AlwaysMiss) => AccessClass::Always,
            _ => AccessClass::Uncertain,
        },
    }
}

fn classify(
    access: &Access,
    must: &MustCache,
    may: &MayCache,
    level: &CacheLevelConfig,
) -> Classification {
    match &access.target {
        AccessTarget::Unknown => Classification::NotClassified,
        AccessTarget::Lines(lines) => {
            if must.is_hit(lines, level) {
                Classification::AlwaysHit
            } else if may.is_absent(lines, level) {
                Classification::AlwaysMiss
            } else {
                Classification::NotClassified
            }
        }
    }
}

/// Static cache analysis of a whole program.
pub struct CacheAnalyser<'a> {
    program: &'a Program,
    hierarchy: Rc<CacheHierarchy>,
    config: &'a AnalysisConfig,
    call_order: CallOrder,
    references: Vec<ReferenceTables>,
    summaries: UnorderedMap<(usize, CacheLevel), LevelSummary>,
    footprints: UnorderedMap<(usize, CacheLevel), CalleeEffect>,
    verdicts: UnorderedMap<AccessKey, Verdict>,
}

impl<'a> CacheAnalyser<'a> {
    /// Resolve the addresses of every procedure of `program` and set up its analysis.
    pub fn new(
        program: &'a Program,
        hierarchy: &Rc<CacheHierarchy>,
        config: &'a AnalysisConfig,
    ) -> Result<Self> {
        if program.procedures().is_empty() {
            return Err(ChmcError::MissingInput("program has no procedure".into()));
        }

        for procedure in program.procedures() {
            for callee in procedure.callees() {
                if program.procedure_index(callee).is_none() {
                    warn!(
                        "Call to a procedure without a body";
                        "caller" => &procedure.name,
                        "callee" => callee,
                        "clobbers_cache" => config.unknown_callees_clobber_cache,
                    );
                }
            }
        }

        info!("Resolving memory references"; "procedures" => program.procedures().len());
        let resolver = AddressResolver::new(&program.segments, hierarchy, config);
        let references = program
            .procedures()
            .iter()
            .map(|p| ReferenceTables::build(p, &resolver, hierarchy))
            .collect();

        Ok(Self {
            program,
            hierarchy: hierarchy.clone(),
            config,
            call_order: program.call_order(),
            references,
            summaries: Default::default(),
            footprints: Default::default(),
            verdicts: Default::default(),
        })
    }

    /// The memory references of procedure `p`
    pub fn references(&self, p: usize) -> &ReferenceTables {
        &self.references[p]
    }

    pub fn verdict(&self, key: &AccessKey) -> Option<&Verdict> {
        self.verdicts.get(key)
    }

    /// The lines procedure `p` (transitively) may touch at `level`
    pub fn footprint(&self, p: usize, level: CacheLevel) -> Option<&CalleeEffect> {
        self.footprints.get(&(p, level))
    }

    fn access_class(&self, p: usize, site: AccessSite, level: CacheLevel) -> AccessClass {
        match self.hierarchy.previous_level(site.kind, level) {
            None => AccessClass::Always,
            Some(prev) => next_level_access(self.verdicts.get(&AccessKey {
                procedure: p,
                site,
                level: prev.level(),
            })),
        }
    }

    fn unknown_callee_effect(&self) -> CalleeEffect {
        if self.config.unknown_callees_clobber_cache {
            CalleeEffect::unknown()
        } else {
            CalleeEffect::default()
        }
    }

    fn callee_effect(&self, p: usize, callee: &str, level: CacheLevel) -> CalleeEffect {
        let c = match self.program.procedure_index(callee) {
            Some(c) => c,
            None => return self.unknown_callee_effect(),
        };
        if self.call_order.recursive_calls.contains(&(p, c)) {
            return self.unknown_callee_effect();
        }
        match self.footprints.get(&(c, level)) {
            Some(f) => f.clone(),
            None => self.unknown_callee_effect(),
        }
    }

    /// Gather the events of every node of procedure `p` as seen by `level`.
    fn level_summary(&self, p: usize, level: &CacheLevelConfig, cold_start: bool) -> LevelSummary {
        let procedure = self.program.procedure(p);
        let refs = &self.references[p];
        let mut events: Vec<Vec<Event>> = vec![vec![]; procedure.nodes().len()];

        for node in procedure.node_ids() {
            let n = procedure.node(node);
            if let Some(callee) = n.callee() {
                let effect = self
                    .callee_effect(p, callee, level.level())
                    .called_at(refs.heights.at_entry(node));
                events[node].push(Event::Call(Call::new(
                    effect,
                    level,
                    self.config.stack_base_address,
                )));
                continue;
            }
            for ins in &n.instructions {
                let mut accesses: Vec<(AccessSite, AccessTarget)> = vec![];
                if level.level().serves(RefKind::Instruction) {
                    if let Some(r) = refs.instruction_refs(node).and_then(|m| m.get(&ins.address)) {
                        accesses.push((
                            AccessSite {
                                node,
                                instruction: ins.address,
                                kind: RefKind::Instruction,
                            },
                            AccessTarget::Lines(vec![r.line_at(level)]),
                        ));
                    }
                }
                if level.level().serves(RefKind::Data) {
                    if let Some(rs) = refs.data_refs(node).and_then(|m| m.get(&ins.address)) {
                        let target = if rs.iter().any(|r| r.is_unknown()) {
                            AccessTarget::Unknown
                        } else {
                            let lines: UnorderedSet<u64> =
                                rs.iter().map(|r| r.line_at(level)).collect();
                            let mut lines: Vec<u64> = lines.into_iter().collect();
                            lines.sort_unstable();
                            AccessTarget::Lines(lines)
                        };
                        accesses.push((
                            AccessSite {
                                node,
                                instruction: ins.address,
                                kind: RefKind::Data,
                            },
                            target,
                        ));
                    }
                }
                for (site, target) in accesses {
                    let class = self.access_class(p, site, level.level());
                    if class != AccessClass::Never {
                        let frame_offset = match site.kind {
                            RefKind::Data => refs.frame_offsets.get(&ins.address).cloned(),
                            RefKind::Instruction => None,
                        };
                        events[node].push(Event::Access(Access {
                            site,
                            target,
                            class,
                            frame_offset,
                        }));
                    }
                }
            }
        }

        LevelSummary {
            level: level.clone(),
            predecessors: procedure
                .node_ids()
                .map(|n| procedure.predecessors(n).collect())
                .collect(),
            successors: procedure
                .node_ids()
                .map(|n| procedure.successors(n).collect())
                .collect(),
            entries: procedure.entry_nodes(),
            events,
            cold_start,
        }
    }

    /// Run the must and may analyses over every procedure and level, classifying each access as
    /// always-hit, always-miss or not classified.
    pub fn do_analysis(&mut self) {
        let program = self.program;
        let roots: UnorderedSet<usize> = program.roots().into_iter().collect();
        let levels: Vec<CacheLevelConfig> = self.hierarchy.iter().cloned().collect();

        for &p in &self.call_order.order.clone() {
            let procedure = program.procedure(p);
            let cold_start = self.config.assume_cold_cache_at_roots && roots.contains(&p);
            info!(
                "Analyzing procedure";
                "proc" => &procedure.name,
                "cold_start" => cold_start,
            );

            for level in &levels {
                let summary = self.level_summary(p, level, cold_start);
                let region = Region::whole(&summary);
                let must = DataFlow::<MustCache>::forward_analyze(&summary, &region);
                let may = DataFlow::<MayCache>::forward_analyze(&summary, &region);
                debug!(
                    "Must and may analyses converged";
                    "proc" => &procedure.name,
                    "level" => %level.level(),
                    "must_iterations" => must.iterations,
                    "may_iterations" => may.iterations,
                );

                for node in procedure.node_ids() {
                    let musts = must.states_before_events(node, &summary);
                    let mays = may.states_before_events(node, &summary);
                    for (i, e) in summary.events[node].iter().enumerate() {
                        if let Event::Access(a) = e {
                            self.verdicts.insert(
                                AccessKey {
                                    procedure: p,
                                    site: a.site,
                                    level: level.level(),
                                },
                                Verdict {
                                    access: a.class,
                                    classification: classify(a, &musts[i], &mays[i], level),
                                    loop_context: procedure.innermost_loop(node),
                                },
                            );
                        }
                    }
                }

                self.footprints
                    .insert((p, level.level()), summary.footprint());
                self.summaries.insert((p, level.level()), summary);
            }
        }
    }

    /// Refine not-classified accesses inside loops: an access whose lines are never evicted once
    /// loaded in a loop misses at most once per entry into that loop. The outermost such loop is
    /// recorded as the access's context.
    ///
    /// Must run after [`Self::do_analysis`].
    pub fn persistent_analysis(&mut self) {
        let program = self.program;
        let mut refined: UnorderedMap<AccessKey, (LoopId, usize)> = Default::default();

        for (&(p, level), summary) in self.summaries.iter() {
            let procedure = program.procedure(p);
            for (l, lp) in procedure.loops().iter().enumerate() {
                let region = Region {
                    nodes: lp.body.iter().cloned().collect(),
                    entries: vec![lp.header],
                };
                let flow = DataFlow::<PersistenceCache>::forward_analyze(summary, &region);
                debug!(
                    "Persistence analysis converged";
                    "proc" => &procedure.name,
                    "level" => %level,
                    "loop" => procedure.loop_name(l),
                    "iterations" => flow.iterations,
                );

                for &node in &lp.body {
                    let states = flow.states_before_events(node, summary);
                    for (e, state) in summary.events[node].iter().zip(states.iter()) {
                        let a = match e {
                            Event::Access(a) => a,
                            Event::Call(_) => continue,
                        };
                        let key = AccessKey {
                            procedure: p,
                            site: a.site,
                            level,
                        };
                        let unclassified = matches!(
                            self.verdicts.get(&key),
                            Some(v) if v.classification == Classification::NotClassified
                        );
                        if !unclassified || !state.is_persistent(a.target.lines()) {
                            continue;
                        }
                        let outermost = match refined.get(&key) {
                            Some(&(_, depth)) => lp.depth < depth,
                            None => true,
                        };
                        if outermost {
                            refined.insert(key, (l, lp.depth));
                        }
                    }
                }
            }
        }

        for (key, (l, _)) in refined {
            if let Some(v) = self.verdicts.get_mut(&key) {
                trace!(
                    "Access is persistent";
                    "proc" => &program.procedure(key.procedure).name,
                    "ins" => format!("{:#x}", key.site.instruction),
                    "kind" => %key.site.kind,
                    "level" => %key.level,
                    "loop" => program.procedure(key.procedure).loop_name(l),
                );
                v.classification = Classification::FirstMissThenHit;
                v.loop_context = Some(l);
            }
        }
    }

    /// Collect every verdict into the final table
    pub fn categorize(&self) -> ChmcTable {
        let entries = self
            .verdicts
            .iter()
            .map(|(key, v)| {
                let procedure = self.program.procedure(key.procedure);
                ChmcEntry {
                    procedure: procedure.name.clone(),
                    node: procedure.node(key.site.node).name.clone(),
                    instruction: key.site.instruction,
                    kind: key.site.kind,
                    level: key.level,
                    access: v.access,
                    loop_context: v.loop_context.map(|l| procedure.loop_name(l)),
                    classification: v.classification,
                }
            })
            .collect();
        let table = ChmcTable::new(entries);
        table.log_summary();
        table
    }
}

/// Run the whole analysis of `program` against `hierarchy`.
pub fn analyze(
    program: &Program,
    hierarchy: &Rc<CacheHierarchy>,
    config: &AnalysisConfig,
) -> Result<ChmcTable> {
    let mut analyser = CacheAnalyser::new(program, hierarchy, config)?;
    analyser.do_analysis();
    if config.enable_persistence_analysis {
        info!("Running persistence analysis");
        analyser.persistent_analysis();
    }
    Ok(analyser.categorize())
}
