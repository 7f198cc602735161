//! Memory blocks and cache-line references, and the per-procedure tables that hold them.

use std::rc::Rc;

use crate::cache_config::{CacheHierarchy, CacheLevelConfig};
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::log::*;
use crate::program::{NodeId, Procedure};
use crate::resolver::{AddressResolver, ResolutionOutcome};
use crate::stack_height::StackHeights;

/// Whether a reference fetches code or touches data
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RefKind {
    Instruction,
    Data,
}

impl std::fmt::Display for RefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RefKind::Instruction => write!(f, "INST"),
            RefKind::Data => write!(f, "DATA"),
        }
    }
}

/// A byte address touched by an instruction. Several blocks may share a cache line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    /// Address of the owning instruction
    pub instruction: u64,
    pub byte_address: u64,
}

impl MemoryBlock {
    pub fn new(instruction: u64, byte_address: u64) -> Self {
        Self {
            instruction,
            byte_address,
        }
    }

    /// The "unknown address" sentinel, which aliases every other unknown block
    pub fn unknown(instruction: u64) -> Self {
        Self::new(instruction, 0)
    }

    pub fn is_unknown(&self) -> bool {
        self.byte_address == 0
    }

    pub fn cache_line(&self, line_shift: u32) -> u64 {
        self.byte_address >> line_shift
    }
}

/// A cache-line reference bound to the hierarchy it is evaluated in. The line is identified at
/// the granularity of the finest line size in the hierarchy; two references are the same iff
/// their line and kind agree, and both or neither are the unknown sentinel.
#[derive(Clone)]
pub struct MemoryReference {
    line_id: u64,
    kind: RefKind,
    unknown: bool,
    hierarchy: Rc<CacheHierarchy>,
}

impl MemoryReference {
    pub fn new(line_id: u64, kind: RefKind, hierarchy: &Rc<CacheHierarchy>) -> Self {
        Self {
            line_id,
            kind,
            unknown: false,
            hierarchy: hierarchy.clone(),
        }
    }

    /// The data reference standing for addresses that could not be resolved
    pub fn unknown(hierarchy: &Rc<CacheHierarchy>) -> Self {
        Self {
            unknown: true,
            ..Self::new(0, RefKind::Data, hierarchy)
        }
    }

    pub fn from_address(address: u64, kind: RefKind, hierarchy: &Rc<CacheHierarchy>) -> Self {
        Self::new(address >> hierarchy.finest_line_shift(), kind, hierarchy)
    }

    pub fn line_id(&self) -> u64 {
        self.line_id
    }

    pub fn kind(&self) -> RefKind {
        self.kind
    }

    pub fn hierarchy(&self) -> &Rc<CacheHierarchy> {
        &self.hierarchy
    }

    /// Only the sentinel from [`Self::unknown`] is unknown; a resolved reference to a low line
    /// is not.
    pub fn is_unknown(&self) -> bool {
        self.unknown
    }

    /// First byte of the line
    pub fn byte_address(&self) -> u64 {
        self.line_id << self.hierarchy.finest_line_shift()
    }

    /// The line this reference occupies at `level`
    pub fn line_at(&self, level: &CacheLevelConfig) -> u64 {
        level.line_index(self.byte_address())
    }
}

impl PartialEq for MemoryReference {
    fn eq(&self, other: &Self) -> bool {
        self.line_id == other.line_id && self.kind == other.kind && self.unknown == other.unknown
    }
}
impl Eq for MemoryReference {}
impl std::hash::Hash for MemoryReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.unknown.hash(state);
        self.line_id.hash(state);
    }
}
impl PartialOrd for MemoryReference {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MemoryReference {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.kind, self.unknown, self.line_id).cmp(&(other.kind, other.unknown, other.line_id))
    }
}
impl std::fmt::Debug for MemoryReference {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.unknown {
            write!(f, "{}:?", self.kind)
        } else {
            write!(f, "{}:{:#x}", self.kind, self.line_id)
        }
    }
}

/// How address resolution went for one procedure
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolutionStats {
    pub exact: usize,
    pub segment: usize,
    pub range: usize,
    pub stack: usize,
    pub unresolved: usize,
}

/// The references of one procedure, keyed by node and then by instruction address. Virtual nodes
/// map to `None`: they carry no references at all, which is distinct from a node with no
/// instructions.
#[derive(Debug, Default)]
pub struct ReferenceTables {
    pub instruction_refs: UnorderedMap<NodeId, Option<UnorderedMap<u64, MemoryReference>>>,
    pub data_refs: UnorderedMap<NodeId, Option<UnorderedMap<u64, UnorderedSet<MemoryReference>>>>,
    pub blocks: UnorderedMap<NodeId, Vec<MemoryBlock>>,
    /// Stack accesses, by instruction address, with their offset from the stack pointer on entry
    pub frame_offsets: UnorderedMap<u64, i64>,
    pub heights: StackHeights,
    pub stats: ResolutionStats,
}

impl ReferenceTables {
    /// Resolve every load/store of `procedure` and build its instruction and data references.
    pub fn build(
        procedure: &Procedure,
        resolver: &AddressResolver,
        hierarchy: &Rc<CacheHierarchy>,
    ) -> Self {
        let mut r = Self {
            heights: StackHeights::compute(procedure),
            ..Default::default()
        };
        for node in procedure.node_ids() {
            let n = procedure.node(node);
            if n.is_virtual() {
                r.instruction_refs.insert(node, None);
                r.data_refs.insert(node, None);
                continue;
            }
            let mut inst_refs: UnorderedMap<u64, MemoryReference> = Default::default();
            let mut data_refs: UnorderedMap<u64, UnorderedSet<MemoryReference>> =
                Default::default();
            let mut blocks = vec![];
            for ins in &n.instructions {
                inst_refs.insert(
                    ins.address,
                    MemoryReference::from_address(ins.address, RefKind::Instruction, hierarchy),
                );
                if !ins.is_load_store() {
                    continue;
                }
                let resolution = resolver.resolve(procedure, &r.heights, node, ins);
                match &resolution.outcome {
                    ResolutionOutcome::Exact { .. } => r.stats.exact += 1,
                    ResolutionOutcome::Segment { .. } => r.stats.segment += 1,
                    ResolutionOutcome::Range { .. } => r.stats.range += 1,
                    ResolutionOutcome::Stack { frame_offset, .. } => {
                        r.stats.stack += 1;
                        r.frame_offsets.insert(ins.address, *frame_offset);
                    }
                    ResolutionOutcome::Unresolved(_) => r.stats.unresolved += 1,
                }
                let refs = data_refs.entry(ins.address).or_insert_with(Default::default);
                for mb in &resolution.blocks {
                    refs.insert(if mb.is_unknown() {
                        MemoryReference::unknown(hierarchy)
                    } else {
                        MemoryReference::new(
                            mb.cache_line(hierarchy.finest_line_shift()),
                            RefKind::Data,
                            hierarchy,
                        )
                    });
                }
                blocks.extend(resolution.blocks);
            }
            r.instruction_refs.insert(node, Some(inst_refs));
            r.data_refs.insert(node, Some(data_refs));
            r.blocks.insert(node, blocks);
        }
        debug!(
            "Built memory references";
            "proc" => &procedure.name,
            "exact" => r.stats.exact,
            "segment" => r.stats.segment,
            "range" => r.stats.range,
            "stack" => r.stats.stack,
            "unresolved" => r.stats.unresolved,
        );
        r
    }

    /// Instruction references of `node`, or `None` for a virtual node
    pub fn instruction_refs(&self, node: NodeId) -> Option<&UnorderedMap<u64, MemoryReference>> {
        self.instruction_refs.get(&node).and_then(Option::as_ref)
    }

    /// Data references of `node`, or `None` for a virtual node
    pub fn data_refs(
        &self,
        node: NodeId,
    ) -> Option<&UnorderedMap<u64, UnorderedSet<MemoryReference>>> {
        self.data_refs.get(&node).and_then(Option::as_ref)
    }
}
