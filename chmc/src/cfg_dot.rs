//! GraphViz rendering of a procedure's CFG, annotated with the classification of each
//! instruction at every cache level.

use crate::chmc::ChmcTable;
use crate::containers::unordered::UnorderedMap;
use crate::errors::Result;
use crate::memory_ref::RefKind;
use crate::program::{NodeId, NodeKind, Procedure};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CfgNode {
    Entry,
    Node(NodeId),
}
type CfgEdge = (CfgNode, CfgNode);

struct Graph<'a> {
    procedure: &'a Procedure,
    /// Per instruction, its `LEVEL:CHMC` annotations
    annotations: UnorderedMap<u64, Vec<String>>,
}

impl<'a> Graph<'a> {
    fn new(procedure: &'a Procedure, table: &ChmcTable) -> Self {
        let mut annotations: UnorderedMap<u64, Vec<String>> = Default::default();
        for e in table
            .entries()
            .iter()
            .filter(|e| e.procedure == procedure.name)
        {
            let prefix = match e.kind {
                RefKind::Instruction => "",
                RefKind::Data => "d",
            };
            annotations
                .entry(e.instruction)
                .or_insert_with(Vec::new)
                .push(format!("{}{}:{}", prefix, e.level, e.classification));
        }
        Self {
            procedure,
            annotations,
        }
    }

    fn is_back_edge(&self, src: NodeId, dst: NodeId) -> bool {
        self.procedure
            .loops()
            .iter()
            .any(|l| l.header == dst && l.contains(src))
    }
}

impl<'a> dot::Labeller<'a, CfgNode, CfgEdge> for Graph<'a> {
    fn graph_id(&'a self) -> dot::Id<'a> {
        dot::Id::new("CFG").unwrap()
    }
    fn node_id(&'a self, n: &CfgNode) -> dot::Id<'a> {
        dot::Id::new(match n {
            CfgNode::Entry => "entry".to_string(),
            CfgNode::Node(i) => format!("n{}", i),
        })
        .unwrap()
    }
    fn node_label<'b>(&'b self, n: &CfgNode) -> dot::LabelText<'b> {
        match n {
            CfgNode::Entry => dot::LabelText::label(self.procedure.name.clone()),
            CfgNode::Node(i) => {
                let node = self.procedure.node(*i);
                let mut label = match &node.kind {
                    NodeKind::Straight => node.name.clone(),
                    NodeKind::Loop => format!("{} (loop)", node.name),
                    NodeKind::Virtual { callee } => format!("{} -> {}", node.name, callee),
                };
                label.push_str("\\l");
                for ins in &node.instructions {
                    let annotation = self
                        .annotations
                        .get(&ins.address)
                        .map(|a| a.join(" "))
                        .unwrap_or_default();
                    label.push_str(&format!(
                        "{:#x}: {}  [{}]\\l",
                        ins.address,
                        ins.text,
                        annotation
                    ));
                }
                dot::LabelText::escaped(label)
            }
        }
    }
    fn node_shape(&'a self, n: &CfgNode) -> Option<dot::LabelText<'a>> {
        match n {
            CfgNode::Entry => Some(dot::LabelText::label("oval")),
            CfgNode::Node(i) => match self.procedure.node(*i).kind {
                NodeKind::Virtual { .. } => Some(dot::LabelText::label("component")),
                NodeKind::Straight | NodeKind::Loop => Some(dot::LabelText::label("box")),
            },
        }
    }
    fn edge_label<'b>(&'b self, e: &CfgEdge) -> dot::LabelText<'b> {
        match e {
            (CfgNode::Node(s), CfgNode::Node(d)) if self.is_back_edge(*s, *d) => {
                dot::LabelText::label("back")
            }
            _ => dot::LabelText::label(""),
        }
    }
}

impl<'a> dot::GraphWalk<'a, CfgNode, CfgEdge> for Graph<'a> {
    fn nodes(&self) -> dot::Nodes<'a, CfgNode> {
        std::iter::once(CfgNode::Entry)
            .chain(self.procedure.node_ids().map(CfgNode::Node))
            .collect::<Vec<_>>()
            .into()
    }
    fn edges(&'a self) -> dot::Edges<'a, CfgEdge> {
        self.procedure
            .edges()
            .iter()
            .map(|e| {
                (
                    e.src.map_or(CfgNode::Entry, CfgNode::Node),
                    CfgNode::Node(e.dst),
                )
            })
            .collect::<Vec<_>>()
            .into()
    }
    fn source(&self, e: &CfgEdge) -> CfgNode {
        e.0
    }
    fn target(&self, e: &CfgEdge) -> CfgNode {
        e.1
    }
}

/// Write `procedure` as a `.dot` graph, annotated from `table`
pub fn write_dot<W: std::io::Write>(
    procedure: &Procedure,
    table: &ChmcTable,
    w: &mut W,
) -> std::io::Result<()> {
    dot::render(&Graph::new(procedure, table), w)
}

/// Generate a `.dot` file representing `procedure`
pub fn generate_dot(procedure: &Procedure, table: &ChmcTable) -> Result<String> {
    let mut s: Vec<u8> = vec![];
    write_dot(procedure, table, &mut s)?;
    Ok(String::from_utf8_lossy(&s).into_owned())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache_config::CacheLevel;
    use crate::chmc::{ChmcEntry, Classification};
    use crate::dataflow::AccessClass;
    use crate::lifter::decode_instruction;

    #[test]
    fn renders_annotated_cfg() {
        let mut p = Procedure::new("main");
        let a = p.add_node(
            "a",
            NodeKind::Loop,
            vec![decode_instruction(0x400, "ldr x0, [sp, #8]")],
        );
        let b = p.add_node(
            "b",
            NodeKind::Virtual {
                callee: "foo".into(),
            },
            vec![],
        );
        p.add_edge(None, a);
        p.add_edge(Some(a), a);
        p.add_edge(Some(a), b);
        p.add_loop(a, [a]);
        let table = ChmcTable::new(vec![ChmcEntry {
            procedure: "main".into(),
            node: "a".into(),
            instruction: 0x400,
            kind: RefKind::Data,
            level: CacheLevel::L1D,
            access: AccessClass::Always,
            loop_context: Some("loop@a".into()),
            classification: Classification::FirstMissThenHit,
        }]);

        let dot = generate_dot(&p, &table).unwrap();
        assert!(dot.starts_with("digraph CFG {"));
        assert!(dot.contains("entry -> n0"));
        assert!(dot.contains("n0 -> n0[label=\"back\"]"));
        assert!(dot.contains("[dL1D:FM]"));
        assert!(dot.contains("b -> foo"));
    }
}
