//! The program under analysis: procedures, their control-flow graphs and loop nests, decoded
//! instructions, and the data segments that resolved addresses are mapped into.
//!
//! This is the shape in which CFG construction hands its result to the analysis; see
//! [`crate::lifter`] for how it is read from an exported listing.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::log::*;

/// Index of a node within its [`Procedure`]
pub type NodeId = usize;
/// Index of a loop within its [`Procedure`]
pub type LoopId = usize;

/// A machine register, by its assembler name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register(pub String);

impl Register {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn is_stack_pointer(&self) -> bool {
        matches!(self.0.as_str(), "sp" | "wsp")
    }
}

impl std::fmt::Debug for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immediate operand, kept in its textual form (`16`, `0x10`, `#0x10`, `#-8`) until it is
/// needed as a number; see [`crate::resolver::parse_immediate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Immediate(pub String);

impl Immediate {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn text(&self) -> &str {
        &self.0
    }
}

/// A source operand
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    Register(Register),
    Immediate(Immediate),
}

/// The categories of instruction that matter to address resolution, each with its decoded
/// operands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstructionKind {
    /// `dst = src`
    Move { dst: Register, src: Operand },
    /// `dst = lhs + rhs`, or `dst = lhs - rhs` if `subtract` is set
    Add {
        dst: Register,
        lhs: Register,
        rhs: Operand,
        subtract: bool,
    },
    /// `dst = page` (adrp-style page address materialization)
    AddressOfPage { dst: Register, page: Immediate },
    /// A memory access at `targets... + offset`. `indexed` is set for register-indexed
    /// addressing, where the access walks over memory rather than hitting a fixed slot.
    /// Pre- and post-indexed forms add `writeback` to the base register.
    LoadStore {
        targets: Vec<Register>,
        offset: Option<Immediate>,
        indexed: bool,
        store: bool,
        writeback: Option<Immediate>,
    },
    /// Any control transfer, including calls and returns
    Branch,
    /// Anything else
    Other,
}

/// A decoded machine instruction at a known address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub kind: InstructionKind,
    /// The original assembler text, for reports
    pub text: String,
}

impl Instruction {
    pub fn new(address: u64, kind: InstructionKind, text: impl Into<String>) -> Self {
        Self {
            address,
            kind,
            text: text.into(),
        }
    }

    pub fn is_load_store(&self) -> bool {
        matches!(self.kind, InstructionKind::LoadStore { .. })
    }
}

/// What a CFG node stands for
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Straight-line code
    Straight,
    /// Straight-line code heading a loop
    Loop,
    /// A call into another procedure; carries no instructions
    Virtual { callee: String },
}

#[derive(Clone, Debug)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub instructions: Vec<Instruction>,
}

impl Node {
    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, NodeKind::Virtual { .. })
    }

    pub fn callee(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Virtual { callee } => Some(callee),
            _ => None,
        }
    }
}

/// A control-flow edge. An absent source marks an entry edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edge {
    pub src: Option<NodeId>,
    pub dst: NodeId,
}

/// A natural loop of a procedure
#[derive(Clone, Debug)]
pub struct Loop {
    pub header: NodeId,
    /// All nodes of the loop, header included, sorted
    pub body: Vec<NodeId>,
    /// The innermost loop strictly containing this one
    pub parent: Option<LoopId>,
    /// Nesting depth; outermost loops have depth 1
    pub depth: usize,
}

impl Loop {
    pub fn contains(&self, node: NodeId) -> bool {
        self.body.binary_search(&node).is_ok()
    }
}

/// A procedure and its control-flow graph.
#[derive(Clone, Debug)]
pub struct Procedure {
    pub name: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    loops: Vec<Loop>,
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
    node_by_name: UnorderedMap<String, NodeId>,
}

impl Procedure {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: vec![],
            edges: vec![],
            loops: vec![],
            incoming: vec![],
            outgoing: vec![],
            node_by_name: Default::default(),
        }
    }

    /// Add a node; virtual nodes must not carry instructions.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        instructions: Vec<Instruction>,
    ) -> NodeId {
        let name = name.into();
        assert!(
            !matches!(kind, NodeKind::Virtual { .. }) || instructions.is_empty(),
            "Virtual node {} cannot carry instructions",
            name
        );
        let id = self.nodes.len();
        self.node_by_name.insert(name.clone(), id);
        self.nodes.push(Node {
            name,
            kind,
            instructions,
        });
        self.incoming.push(vec![]);
        self.outgoing.push(vec![]);
        id
    }

    pub fn add_edge(&mut self, src: Option<NodeId>, dst: NodeId) {
        let idx = self.edges.len();
        self.edges.push(Edge { src, dst });
        self.incoming[dst].push(idx);
        if let Some(src) = src {
            self.outgoing[src].push(idx);
        }
    }

    /// Register a loop; nesting is recomputed from body containment every time.
    pub fn add_loop(&mut self, header: NodeId, body: impl IntoIterator<Item = NodeId>) -> LoopId {
        let mut body: Vec<NodeId> = body.into_iter().chain(std::iter::once(header)).collect();
        body.sort_unstable();
        body.dedup();
        self.loops.push(Loop {
            header,
            body,
            parent: None,
            depth: 1,
        });
        self.recompute_loop_nest();
        self.loops.len() - 1
    }

    fn recompute_loop_nest(&mut self) {
        let parents: Vec<Option<LoopId>> = (0..self.loops.len())
            .map(|l| {
                let inner = &self.loops[l];
                (0..self.loops.len())
                    .filter(|&o| o != l)
                    .filter(|&o| {
                        let outer = &self.loops[o];
                        outer.body.len() > inner.body.len()
                            && inner.body.iter().all(|&n| outer.contains(n))
                    })
                    .min_by_key(|&o| self.loops[o].body.len())
            })
            .collect();
        for (l, parent) in parents.into_iter().enumerate() {
            self.loops[l].parent = parent;
        }
        for l in 0..self.loops.len() {
            let mut depth = 1;
            let mut cur = self.loops[l].parent;
            while let Some(p) = cur {
                depth += 1;
                cur = self.loops[p].parent;
            }
            self.loops[l].depth = depth;
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.nodes.len()
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.node_by_name.get(name).cloned()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn incoming_edges(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.incoming[id].iter().map(move |&e| &self.edges[e])
    }

    pub fn predecessors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.incoming_edges(id).filter_map(|e| e.src)
    }

    pub fn successors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.outgoing[id].iter().map(move |&e| self.edges[e].dst)
    }

    /// Targets of entry edges; falls back to the first node if there are none.
    pub fn entry_nodes(&self) -> Vec<NodeId> {
        let mut entries: Vec<NodeId> = self
            .edges
            .iter()
            .filter(|e| e.src.is_none())
            .map(|e| e.dst)
            .collect();
        entries.sort_unstable();
        entries.dedup();
        if entries.is_empty() && !self.nodes.is_empty() {
            entries.push(0);
        }
        entries
    }

    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    /// All loops containing `node`, innermost first
    pub fn enclosing_loops(&self, node: NodeId) -> Vec<LoopId> {
        let mut loops: Vec<LoopId> = (0..self.loops.len())
            .filter(|&l| self.loops[l].contains(node))
            .collect();
        loops.sort_by_key(|&l| std::cmp::Reverse(self.loops[l].depth));
        loops
    }

    pub fn innermost_loop(&self, node: NodeId) -> Option<LoopId> {
        self.enclosing_loops(node).first().cloned()
    }

    /// A printable name for a loop, based on its header
    pub fn loop_name(&self, l: LoopId) -> String {
        format!("loop@{}", self.nodes[self.loops[l].header].name)
    }

    /// Names of procedures called from this one
    pub fn callees(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().filter_map(Node::callee)
    }
}

/// A named memory region, `lower <= address < upper`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub flags: String,
    pub lower: u64,
    pub upper: u64,
}

impl Segment {
    pub fn contains(&self, address: u64) -> bool {
        self.lower <= address && address < self.upper
    }
}

/// The uninitialized (`bss`) and initialized data regions of the binary.
#[derive(Clone, Debug, Default)]
pub struct SegmentTable {
    pub bss: Vec<Segment>,
    pub data: Vec<Segment>,
}

impl SegmentTable {
    /// The segment holding `address`, consulting BSS regions before initialized data.
    pub fn find_containing(&self, address: u64) -> Option<&Segment> {
        self.bss
            .iter()
            .chain(self.data.iter())
            .find(|s| s.contains(address))
    }
}

/// The order in which procedures must be analyzed: every callee before its callers.
#[derive(Clone, Debug, Default)]
pub struct CallOrder {
    /// Procedure indices, callees first
    pub order: Vec<usize>,
    /// `(caller, callee)` calls that close a recursion cycle
    pub recursive_calls: UnorderedSet<(usize, usize)>,
}

/// A whole program: its procedures and segment layout.
#[derive(Clone, Debug, Default)]
pub struct Program {
    procedures: Vec<Procedure>,
    pub segments: SegmentTable,
    by_name: UnorderedMap<String, usize>,
}

impl Program {
    pub fn new(segments: SegmentTable) -> Self {
        Self {
            procedures: vec![],
            segments,
            by_name: Default::default(),
        }
    }

    pub fn add_procedure(&mut self, procedure: Procedure) -> usize {
        let idx = self.procedures.len();
        self.by_name.insert(procedure.name.clone(), idx);
        self.procedures.push(procedure);
        idx
    }

    pub fn procedures(&self) -> &[Procedure] {
        &self.procedures
    }

    pub fn procedure(&self, idx: usize) -> &Procedure {
        &self.procedures[idx]
    }

    pub fn procedure_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).cloned()
    }

    /// Procedures that no other procedure calls
    pub fn roots(&self) -> Vec<usize> {
        let called: UnorderedSet<usize> = self
            .procedures
            .iter()
            .flat_map(|p| p.callees())
            .filter_map(|c| self.procedure_index(c))
            .collect();
        (0..self.procedures.len())
            .filter(|p| !called.contains(p))
            .collect()
    }

    /// Compute a callee-first order over all procedures by iterative depth-first post-order. Calls
    /// back into a procedure that is still being visited close a cycle; they are recorded rather
    /// than followed.
    pub fn call_order(&self) -> CallOrder {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        let mut marks = vec![Mark::Unvisited; self.procedures.len()];
        let mut res = CallOrder::default();

        let callees_of = |p: usize| -> Vec<usize> {
            let mut v: Vec<usize> = self.procedures[p]
                .callees()
                .filter_map(|c| self.procedure_index(c))
                .collect();
            v.sort_unstable();
            v.dedup();
            v
        };

        // Start from roots so that the order reads naturally, then sweep up anything only
        // reachable through a cycle.
        let starts = self
            .roots()
            .into_iter()
            .chain(0..self.procedures.len())
            .collect::<Vec<_>>();
        for start in starts {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            let mut stack: Vec<(usize, Vec<usize>)> = vec![(start, callees_of(start))];
            marks[start] = Mark::InProgress;
            while let Some((p, pending)) = stack.last_mut() {
                let p = *p;
                match pending.pop() {
                    Some(c) => match marks[c] {
                        Mark::Unvisited => {
                            marks[c] = Mark::InProgress;
                            stack.push((c, callees_of(c)));
                        }
                        Mark::InProgress => {
                            warn!(
                                "Recursive call found, treating it as an unknown callee";
                                "caller" => &self.procedures[p].name,
                                "callee" => &self.procedures[c].name,
                            );
                            res.recursive_calls.insert((p, c));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[p] = Mark::Done;
                        res.order.push(p);
                        stack.pop();
                    }
                }
            }
        }
        res
    }
}
