//! Stack pointer heights: how far `sp` has moved from its value on entry to a procedure.
//!
//! Heights are propagated forwards over the CFG with the same worklist scheme as the cache data
//! flows. Immediate adjustments (`sub sp, sp, #N`, `add sp, sp, #N`) and the writeback of pre- or
//! post-indexed accesses through `sp` move the height; any other write to `sp` makes it unknown,
//! as does a merge of paths that disagree. Calls are assumed to leave `sp` as they found it.

use std::collections::VecDeque;

use crate::log::*;
use crate::program::{Instruction, InstructionKind, NodeId, Operand, Procedure};
use crate::resolver::parse_immediate;

/// Offset of `sp` from its value on entry to the procedure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackHeight {
    Unreached,
    Known(i64),
    Unknown,
}

impl StackHeight {
    pub fn join(self, other: Self) -> Self {
        use StackHeight::*;
        match (self, other) {
            (Unreached, h) | (h, Unreached) => h,
            (Known(a), Known(b)) if a == b => Known(a),
            _ => Unknown,
        }
    }

    pub fn known(self) -> Option<i64> {
        match self {
            StackHeight::Known(h) => Some(h),
            _ => None,
        }
    }

    fn shifted(self, by: i64) -> Self {
        match self {
            StackHeight::Known(h) => StackHeight::Known(h.wrapping_add(by)),
            h => h,
        }
    }

    /// The height after executing `ins`
    pub fn after(self, ins: &Instruction) -> Self {
        match &ins.kind {
            InstructionKind::Add {
                dst,
                lhs,
                rhs: Operand::Immediate(imm),
                subtract,
            } if dst.is_stack_pointer() && lhs.is_stack_pointer() => {
                match parse_immediate(imm.text()) {
                    Ok(v) => self.shifted(if *subtract { v.wrapping_neg() } else { v }),
                    Err(_) => StackHeight::Unknown,
                }
            }
            InstructionKind::Move { dst, .. }
            | InstructionKind::Add { dst, .. }
            | InstructionKind::AddressOfPage { dst, .. }
                if dst.is_stack_pointer() =>
            {
                StackHeight::Unknown
            }
            InstructionKind::LoadStore {
                targets,
                writeback: Some(wb),
                ..
            } if targets.first().map_or(false, |b| b.is_stack_pointer()) => {
                match parse_immediate(wb.text()) {
                    Ok(v) => self.shifted(v),
                    Err(_) => StackHeight::Unknown,
                }
            }
            _ => self,
        }
    }
}

/// Stack heights throughout one procedure
#[derive(Clone, Debug, Default)]
pub struct StackHeights {
    /// For each node, the height before each of its instructions, followed by the height after
    /// the last one
    heights: Vec<Vec<StackHeight>>,
}

impl StackHeights {
    pub fn compute(procedure: &Procedure) -> Self {
        let replay = |entry: StackHeight, node: NodeId| -> Vec<StackHeight> {
            let mut r = vec![entry];
            for ins in &procedure.node(node).instructions {
                let h = r[r.len() - 1].after(ins);
                r.push(h);
            }
            r
        };

        let entries = procedure.entry_nodes();
        let mut heights: Vec<Vec<StackHeight>> = procedure
            .node_ids()
            .map(|n| replay(StackHeight::Unreached, n))
            .collect();

        let mut changed: VecDeque<NodeId> = entries.iter().cloned().collect();
        while let Some(n) = changed.pop_front() {
            let mut entry = if entries.contains(&n) {
                StackHeight::Known(0)
            } else {
                StackHeight::Unreached
            };
            for p in procedure.predecessors(n) {
                entry = entry.join(heights[p][heights[p].len() - 1]);
            }
            if entry == heights[n][0] {
                continue;
            }
            heights[n] = replay(entry, n);
            for s in procedure.successors(n) {
                if !changed.contains(&s) {
                    changed.push_back(s);
                }
            }
        }

        let unknown = heights
            .iter()
            .filter(|h| h[0] == StackHeight::Unknown)
            .count();
        if unknown > 0 {
            debug!(
                "Stack height lost";
                "proc" => &procedure.name,
                "nodes" => unknown,
            );
        }

        Self { heights }
    }

    pub fn at_entry(&self, node: NodeId) -> StackHeight {
        self.heights[node][0]
    }

    /// The height before each instruction of `node`, in order
    pub fn before_each(&self, node: NodeId) -> &[StackHeight] {
        let h = &self.heights[node];
        &h[..h.len() - 1]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lifter::decode_instruction;
    use crate::program::NodeKind;

    fn node(p: &mut Procedure, name: &str, code: &[&str]) -> NodeId {
        let instructions = code
            .iter()
            .enumerate()
            .map(|(i, text)| decode_instruction(0x1000 + 4 * i as u64, text))
            .collect();
        p.add_node(name, NodeKind::Straight, instructions)
    }

    #[test]
    fn adjustments_move_the_height() {
        use StackHeight::*;
        let h = Known(0);
        let h = h.after(&decode_instruction(0, "stp x29, x30, [sp, #-32]!"));
        assert_eq!(h, Known(-32));
        let h = h.after(&decode_instruction(0, "sub sp, sp, #0x1, lsl #12"));
        assert_eq!(h, Known(-32 - 0x1000));
        let h = h.after(&decode_instruction(0, "add sp, sp, #0x1000"));
        assert_eq!(h, Known(-32));
        let h = h.after(&decode_instruction(0, "str x0, [sp, #8]"));
        assert_eq!(h, Known(-32));
        let h = h.after(&decode_instruction(0, "ldp x29, x30, [sp], #32"));
        assert_eq!(h, Known(0));
        assert_eq!(h.after(&decode_instruction(0, "mov sp, x29")), Unknown);
        assert_eq!(h.after(&decode_instruction(0, "sub sp, sp, x1")), Unknown);
        assert_eq!(Unreached.after(&decode_instruction(0, "sub sp, sp, #16")), Unreached);
    }

    #[test]
    fn paths_must_agree() {
        use StackHeight::*;
        assert_eq!(Known(-16).join(Unreached), Known(-16));
        assert_eq!(Known(-16).join(Known(-16)), Known(-16));
        assert_eq!(Known(-16).join(Known(0)), Unknown);
        assert_eq!(Unknown.join(Known(0)), Unknown);
    }

    #[test]
    fn heights_flow_through_the_graph() {
        let mut p = Procedure::new("f");
        let n0 = node(&mut p, "n0", &["sub sp, sp, #32", "str x0, [sp]"]);
        let n1 = node(&mut p, "n1", &["ldr x0, [sp]"]);
        // Pushes on every iteration
        let n2 = node(&mut p, "n2", &["str x0, [sp, #-16]!"]);
        let n3 = node(&mut p, "n3", &["add sp, sp, #32"]);
        p.add_edge(None, n0);
        p.add_edge(Some(n0), n1);
        p.add_edge(Some(n0), n3);
        p.add_edge(Some(n1), n1);
        p.add_edge(Some(n1), n2);
        p.add_edge(Some(n2), n2);

        let heights = StackHeights::compute(&p);
        assert_eq!(
            heights.before_each(n0),
            &[StackHeight::Known(0), StackHeight::Known(-32)]
        );
        assert_eq!(heights.at_entry(n1), StackHeight::Known(-32));
        assert_eq!(heights.at_entry(n3), StackHeight::Known(-32));
        assert_eq!(heights.at_entry(n2), StackHeight::Unknown);
    }
}
