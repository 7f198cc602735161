//! Backward symbolic address resolution for loads and stores.
//!
//! For an access `ldr x0, [x1, #8]`, the registers forming the address (`x1`) are tracked
//! backwards through the instruction stream: first within the access's own node, then through
//! predecessor nodes in breadth-first order. Moves, additions and page-address materializations
//! either substitute a tracked register by its source or resolve it outright, accumulating
//! immediates into an offset and recording a base address. The walk is bounded by a node-visit
//! budget, which keeps it terminating on cyclic graphs.
//!
//! The finished [`RegisterTracker`] is turned into [`MemoryBlock`]s by mapping the address into
//! the known data segments. Anything that cannot be resolved becomes the pessimistic "unknown"
//! block at address 0.
//!
//! Stack-relative addresses are placed in the procedure's own frame: the tracker records the
//! [`StackHeight`] at the point `sp` entered the address, and the block lands at the assumed
//! stack base plus that height plus the accumulated offset.

use std::collections::VecDeque;

use crate::analysis_config::AnalysisConfig;
use crate::cache_config::CacheHierarchy;
use crate::containers::unordered::UnorderedSet;
use crate::errors::ResolveError;
use crate::log::*;
use crate::memory_ref::MemoryBlock;
use crate::program::{
    Instruction, InstructionKind, NodeId, Operand, Procedure, Register, SegmentTable,
};
use crate::stack_height::{StackHeight, StackHeights};

/// Default ceiling on predecessor nodes visited per access
pub const DEFAULT_BACKTRACK_NODE_BUDGET: usize = 100;

/// Read an immediate written in decimal, `0x` hex, or either of them behind the assembler's `#`,
/// optionally negated. Hex values wider than `i64` wrap into their two's complement reading.
pub fn parse_immediate(text: &str) -> Result<i64, ResolveError> {
    let malformed = || ResolveError::MalformedImmediate(text.to_owned());
    let t = text.trim();
    let t = t.strip_prefix('#').unwrap_or(t);
    let (negative, t) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t),
    };
    let magnitude = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) if !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit()) => {
            u64::from_str_radix(hex, 16).map_err(|_| malformed())?
        }
        Some(_) => return Err(malformed()),
        None if !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit()) => {
            t.parse::<u64>().map_err(|_| malformed())?
        }
        None => return Err(malformed()),
    };
    let value = magnitude as i64;
    Ok(if negative { value.wrapping_neg() } else { value })
}

/// The working state of one backward walk. Every rule application consumes the tracker and
/// produces the next state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterTracker {
    pending: UnorderedSet<Register>,
    offset: i64,
    base: Option<u64>,
    is_range: bool,
    /// Number of times `sp` entered the address
    stack_uses: usize,
    stack_height: StackHeight,
    visited_nodes: usize,
}

impl RegisterTracker {
    /// Start tracking the address `targets... + offset`. A stack pointer among the targets makes
    /// the access stack-relative instead of being tracked.
    pub fn new(targets: &[Register], offset: i64, is_range: bool) -> Self {
        Self {
            pending: UnorderedSet::new(),
            offset,
            base: None,
            is_range,
            stack_uses: 0,
            stack_height: StackHeight::Unreached,
            visited_nodes: 0,
        }
        .substituted_many(targets.iter().cloned())
    }

    /// Registers whose origin is still unknown
    pub fn pending(&self) -> &UnorderedSet<Register> {
        &self.pending
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn base(&self) -> Option<u64> {
        self.base
    }

    pub fn is_range(&self) -> bool {
        self.is_range
    }

    pub fn is_stack_relative(&self) -> bool {
        self.stack_uses > 0
    }

    /// Height of `sp` at the point it entered the address
    pub fn stack_height(&self) -> StackHeight {
        self.stack_height
    }

    pub fn visited_nodes(&self) -> usize {
        self.visited_nodes
    }

    /// Resolution is complete once no register is pending.
    pub fn is_resolved(&self) -> bool {
        self.pending.is_empty()
    }

    fn substituted_many(mut self, with: impl IntoIterator<Item = Register>) -> Self {
        for r in with {
            if r.is_stack_pointer() {
                self.stack_uses += 1;
            } else {
                self.pending.insert(r);
            }
        }
        self
    }

    /// Replace `reg` by the registers it was computed from
    fn substituted(mut self, reg: &Register, with: impl IntoIterator<Item = Register>) -> Self {
        self.pending.remove(reg);
        self.substituted_many(with)
    }

    fn resolved(self, reg: &Register) -> Self {
        self.substituted(reg, std::iter::empty())
    }

    fn shifted(mut self, by: i64) -> Self {
        self.offset = self.offset.wrapping_add(by);
        self
    }

    fn with_base(mut self, base: u64) -> Self {
        self.base = Some(base);
        self
    }

    fn at_stack_height(mut self, height: StackHeight) -> Self {
        self.stack_height = height;
        self
    }

    fn visited_one_more(mut self) -> Self {
        self.visited_nodes += 1;
        self
    }

    /// Apply the effect of `ins`, which executes before the tracked access.
    pub fn step(self, ins: &Instruction) -> Result<Self, ResolveError> {
        match &ins.kind {
            InstructionKind::Move { dst, src } if self.pending.contains(dst) => match src {
                Operand::Immediate(imm) => {
                    let v = parse_immediate(imm.text())?;
                    Ok(self.resolved(dst).shifted(v))
                }
                Operand::Register(r) => Ok(self.substituted(dst, [r.clone()])),
            },
            InstructionKind::Add {
                dst,
                lhs,
                rhs,
                subtract,
            } if self.pending.contains(dst) => match rhs {
                Operand::Immediate(imm) => {
                    let v = parse_immediate(imm.text())?;
                    let v = if *subtract { v.wrapping_neg() } else { v };
                    if dst == lhs {
                        Ok(self.shifted(v))
                    } else {
                        Ok(self.substituted(dst, [lhs.clone()]).shifted(v))
                    }
                }
                Operand::Register(_) if *subtract => Err(ResolveError::NonLinear(ins.text.clone())),
                Operand::Register(r) => Ok(self.substituted(dst, [lhs.clone(), r.clone()])),
            },
            InstructionKind::AddressOfPage { dst, page } if self.pending.contains(dst) => {
                let page = parse_immediate(page.text())?;
                Ok(self.resolved(dst).with_base(page as u64))
            }
            InstructionKind::LoadStore {
                targets,
                writeback: Some(wb),
                ..
            } if targets.first().map_or(false, |b| self.pending.contains(b)) => {
                Ok(self.shifted(parse_immediate(wb.text())?))
            }
            InstructionKind::Move { .. }
            | InstructionKind::Add { .. }
            | InstructionKind::AddressOfPage { .. }
            | InstructionKind::LoadStore { .. }
            | InstructionKind::Branch
            | InstructionKind::Other => Ok(self),
        }
    }
}

/// Apply, in reverse program order, every instruction of `instructions` placed below `before`.
/// `heights` holds the stack height before each instruction.
fn scan(
    tracker: RegisterTracker,
    instructions: &[Instruction],
    heights: &[StackHeight],
    before: u64,
) -> Result<RegisterTracker, ResolveError> {
    instructions
        .iter()
        .zip(heights)
        .rev()
        .filter(|(i, _)| i.address < before)
        .try_fold(tracker, |t, (i, &h)| {
            if t.is_resolved() {
                return Ok(t);
            }
            let uses = t.stack_uses;
            let t = t.step(i)?;
            Ok(if t.stack_uses > uses {
                t.at_stack_height(h)
            } else {
                t
            })
        })
}

/// What resolution concluded for an access
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// The exact resolved address was used
    Exact { address: u64 },
    /// The address was approximated by the lower bound of its segment
    Segment { segment: String, address: u64 },
    /// The access may touch any line of its segment
    Range { segment: String, lines: usize },
    /// The address lies in the procedure's frame, `frame_offset` bytes from the stack pointer
    /// on entry
    Stack { address: u64, frame_offset: i64 },
    /// Nothing is known; the access maps to the unknown block
    Unresolved(ResolveError),
}

/// The blocks an access touches, and how they were found
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub blocks: Vec<MemoryBlock>,
    pub outcome: ResolutionOutcome,
}

/// Resolves the addresses of loads and stores against the segments of a program.
pub struct AddressResolver<'a> {
    segments: &'a SegmentTable,
    line_size: u64,
    config: &'a AnalysisConfig,
}

impl<'a> AddressResolver<'a> {
    pub fn new(
        segments: &'a SegmentTable,
        hierarchy: &CacheHierarchy,
        config: &'a AnalysisConfig,
    ) -> Self {
        Self {
            segments,
            line_size: hierarchy.finest_line_size(),
            config,
        }
    }

    /// Resolve the access `ins`, found in `node` of `procedure`, into memory blocks.
    pub fn resolve(
        &self,
        procedure: &Procedure,
        heights: &StackHeights,
        node: NodeId,
        ins: &Instruction,
    ) -> Resolution {
        let tracked = self.backtrack(procedure, heights, node, ins);
        self.finalize(ins, tracked)
    }

    /// Walk backwards from `ins` until its address registers are resolved, the predecessors run
    /// out, or the node budget is exceeded.
    pub fn backtrack(
        &self,
        procedure: &Procedure,
        heights: &StackHeights,
        node: NodeId,
        ins: &Instruction,
    ) -> Result<RegisterTracker, ResolveError> {
        let (targets, offset, indexed) = match &ins.kind {
            InstructionKind::LoadStore {
                targets,
                offset,
                indexed,
                ..
            } => (targets, offset, *indexed),
            _ => return Err(ResolveError::NonLinear(ins.text.clone())),
        };
        let offset = match offset {
            Some(imm) => parse_immediate(imm.text())?,
            None => 0,
        };
        let is_range = self.config.treat_all_segment_accesses_as_ranges
            || (indexed && self.config.treat_indexed_accesses_as_ranges);

        let budget = self.config.backtrack_node_budget;
        let instructions = &procedure.node(node).instructions;
        let mut tracker = RegisterTracker::new(targets, offset, is_range);
        if tracker.is_stack_relative() {
            let at = instructions
                .iter()
                .position(|i| i.address == ins.address)
                .map_or(StackHeight::Unknown, |i| heights.before_each(node)[i]);
            tracker = tracker.at_stack_height(at);
        }
        tracker = scan(tracker, instructions, heights.before_each(node), ins.address)?;

        let mut worklist: VecDeque<NodeId> = procedure.predecessors(node).collect();
        while !tracker.is_resolved() {
            let pred = match worklist.pop_front() {
                Some(pred) => pred,
                None => break,
            };
            if tracker.visited_nodes() > budget {
                return Err(ResolveError::BudgetExhausted(budget));
            }
            tracker = scan(
                tracker,
                &procedure.node(pred).instructions,
                heights.before_each(pred),
                ins.address,
            )?;
            if !tracker.is_resolved() {
                worklist.extend(procedure.predecessors(pred));
            }
            tracker = tracker.visited_one_more();
        }

        if tracker.is_resolved() {
            Ok(tracker)
        } else {
            Err(ResolveError::Unresolved(
                tracker.pending().iter().map(|r| r.to_string()).collect(),
            ))
        }
    }

    /// Turn the outcome of a backward walk into the blocks touched by `ins`.
    pub fn finalize(
        &self,
        ins: &Instruction,
        tracked: Result<RegisterTracker, ResolveError>,
    ) -> Resolution {
        let unknown = |reason: ResolveError| {
            trace!(
                "Address left unresolved";
                "ins" => format!("{:#x}", ins.address),
                "text" => &ins.text,
                "reason" => %reason,
            );
            Resolution {
                blocks: vec![MemoryBlock::unknown(ins.address)],
                outcome: ResolutionOutcome::Unresolved(reason),
            }
        };

        let tracker = match tracked {
            Ok(t) => t,
            Err(e) => return unknown(e),
        };

        if tracker.is_stack_relative() {
            if tracker.stack_uses > 1 {
                return unknown(ResolveError::NonLinear(ins.text.clone()));
            }
            let frame_offset = match tracker.stack_height().known() {
                Some(h) => h.wrapping_add(tracker.offset()),
                None => return unknown(ResolveError::UnknownStackHeight),
            };
            let address = self
                .config
                .stack_base_address
                .wrapping_add(frame_offset as u64);
            return Resolution {
                blocks: vec![MemoryBlock::new(ins.address, address)],
                outcome: ResolutionOutcome::Stack {
                    address,
                    frame_offset,
                },
            };
        }

        let address = i128::from(tracker.base().unwrap_or(0)) + i128::from(tracker.offset());
        let segment = match u64::try_from(address)
            .ok()
            .and_then(|a| self.segments.find_containing(a).map(|s| (a, s)))
        {
            Some(found) => found,
            None => return unknown(ResolveError::OutsideSegments(address)),
        };
        let (address, segment) = segment;

        if tracker.is_range() {
            let blocks: Vec<MemoryBlock> = (segment.lower..segment.upper)
                .step_by(self.line_size as usize)
                .map(|a| MemoryBlock::new(ins.address, a))
                .collect();
            Resolution {
                outcome: ResolutionOutcome::Range {
                    segment: segment.name.clone(),
                    lines: blocks.len(),
                },
                blocks,
            }
        } else if self.config.use_exact_segment_addresses {
            Resolution {
                blocks: vec![MemoryBlock::new(ins.address, address)],
                outcome: ResolutionOutcome::Exact { address },
            }
        } else {
            Resolution {
                blocks: vec![MemoryBlock::new(ins.address, segment.lower)],
                outcome: ResolutionOutcome::Segment {
                    segment: segment.name.clone(),
                    address: segment.lower,
                },
            }
        }
    }
}
