//! A lifter from the line-oriented CFG export into a [`Program`].
//!
//! The export lists data segments, then procedures. Each procedure lists its nodes (with their
//! disassembled AArch64 instructions), its edges, and its natural loops:
//!
//! ```text
//! SEGMENT bss .bss WA 0x411000 0x411040
//! PROCEDURE main
//! NODE n0 STRAIGHT
//!   400580: adrp x1, 411000 <buf>
//!   400584: ldr x0, [x1, #8]
//! NODE n1 VIRTUAL foo
//! EDGE - n0
//! EDGE n0 n1
//! LOOP n0 n0
//! END
//! ```
//!
//! Node and edge names are local to their procedure. Addresses are always hexadecimal.

use crate::errors::{ChmcError, Result};
use crate::log::*;
use crate::program::{
    Immediate, Instruction, InstructionKind, NodeKind, Operand, Procedure, Program, Register,
    Segment, SegmentTable,
};
use crate::resolver::parse_immediate;

use itertools::Itertools;

fn malformed(line: usize, reason: impl Into<String>) -> ChmcError {
    ChmcError::MalformedExport {
        line,
        reason: reason.into(),
    }
}

/// Parse a hexadecimal address, with or without `0x`
fn parse_hex(line: usize, s: &str) -> Result<u64> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| malformed(line, format!("`{}`: {}", s, e)))
}

struct PendingNode {
    name: String,
    kind: NodeKind,
    instructions: Vec<Instruction>,
    line: usize,
}

/// A procedure whose nodes have been read, but whose edges and loops are only resolved at `END`
struct PendingProcedure {
    name: String,
    nodes: Vec<PendingNode>,
    edges: Vec<(Option<String>, String, usize)>,
    loops: Vec<(String, Vec<String>, usize)>,
}

impl PendingProcedure {
    fn finish(self) -> Result<Procedure> {
        let mut p = Procedure::new(self.name);
        for n in self.nodes {
            if p.node_id(&n.name).is_some() {
                return Err(malformed(n.line, format!("duplicate node `{}`", n.name)));
            }
            p.add_node(n.name, n.kind, n.instructions);
        }
        let lookup = |p: &Procedure, name: &str, line: usize| {
            p.node_id(name)
                .ok_or_else(|| malformed(line, format!("unknown node `{}`", name)))
        };
        for (src, dst, line) in self.edges {
            let src = match src {
                Some(src) => Some(lookup(&p, &src, line)?),
                None => None,
            };
            let dst = lookup(&p, &dst, line)?;
            p.add_edge(src, dst);
        }
        for (header, body, line) in self.loops {
            let header = lookup(&p, &header, line)?;
            let body = body
                .iter()
                .map(|n| lookup(&p, n, line))
                .collect::<Result<Vec<_>>>()?;
            p.add_loop(header, body);
        }
        Ok(p)
    }
}

/// Lift an exported program listing.
pub fn lift_from(exported: &str) -> Result<Program> {
    let mut segments = SegmentTable::default();
    let mut procedures: Vec<Procedure> = vec![];
    let mut current: Option<PendingProcedure> = None;

    for (i, raw) in exported.lines().enumerate() {
        let lineno = i + 1;
        let line = match raw.split_once("//") {
            Some((l, _comment)) => l,
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        let words = line.split_whitespace().collect_vec();

        match (words[0], current.as_mut()) {
            ("SEGMENT", None) => match words[1..] {
                [region, name, flags, lower, upper] => {
                    let segment = Segment {
                        name: name.to_owned(),
                        flags: flags.to_owned(),
                        lower: parse_hex(lineno, lower)?,
                        upper: parse_hex(lineno, upper)?,
                    };
                    match region {
                        "bss" => segments.bss.push(segment),
                        "data" => segments.data.push(segment),
                        r => return Err(malformed(lineno, format!("unknown region `{}`", r))),
                    }
                }
                _ => {
                    return Err(malformed(
                        lineno,
                        "expected `SEGMENT <region> <name> <flags> <lower> <upper>`",
                    ))
                }
            },
            ("PROCEDURE", None) => match words[1..] {
                [name] if procedures.iter().any(|p| p.name == name) => {
                    return Err(malformed(lineno, format!("duplicate procedure `{}`", name)))
                }
                [name] => {
                    current = Some(PendingProcedure {
                        name: name.to_owned(),
                        nodes: vec![],
                        edges: vec![],
                        loops: vec![],
                    })
                }
                _ => return Err(malformed(lineno, "expected `PROCEDURE <name>`")),
            },
            ("NODE", Some(proc)) => {
                let (name, kind) = match words[1..] {
                    [name, "STRAIGHT"] => (name, NodeKind::Straight),
                    [name, "LOOP"] => (name, NodeKind::Loop),
                    [name, "VIRTUAL", callee] => (
                        name,
                        NodeKind::Virtual {
                            callee: callee.to_owned(),
                        },
                    ),
                    _ => {
                        return Err(malformed(
                            lineno,
                            "expected `NODE <name> <STRAIGHT|LOOP|VIRTUAL <callee>>`",
                        ))
                    }
                };
                proc.nodes.push(PendingNode {
                    name: name.to_owned(),
                    kind,
                    instructions: vec![],
                    line: lineno,
                });
            }
            ("EDGE", Some(proc)) => match words[1..] {
                [src, dst] => proc.edges.push((
                    (src != "-").then(|| src.to_owned()),
                    dst.to_owned(),
                    lineno,
                )),
                _ => return Err(malformed(lineno, "expected `EDGE <src|-> <dst>`")),
            },
            ("LOOP", Some(proc)) => match words[1..] {
                [header, ref body @ ..] => proc.loops.push((
                    header.to_owned(),
                    body.iter().map(|s| s.to_string()).collect(),
                    lineno,
                )),
                [] => return Err(malformed(lineno, "expected `LOOP <header> <body...>`")),
            },
            ("END", Some(_)) => {
                if let Some(proc) = current.take() {
                    let proc = proc.finish()?;
                    trace!(
                        "Lifted procedure";
                        "proc" => &proc.name,
                        "nodes" => proc.nodes().len(),
                        "loops" => proc.loops().len(),
                    );
                    procedures.push(proc);
                }
            }
            (directive @ ("SEGMENT" | "PROCEDURE"), Some(proc)) => {
                return Err(malformed(
                    lineno,
                    format!("`{}` inside procedure `{}`; missing `END`", directive, proc.name),
                ))
            }
            (directive @ ("NODE" | "EDGE" | "LOOP" | "END"), None) => {
                return Err(malformed(lineno, format!("`{}` outside of a procedure", directive)))
            }
            (_, Some(proc)) => {
                let node = match proc.nodes.last_mut() {
                    Some(node) => node,
                    None => return Err(malformed(lineno, "instruction outside of a node")),
                };
                if let NodeKind::Virtual { .. } = node.kind {
                    return Err(malformed(
                        lineno,
                        format!("virtual node `{}` cannot carry instructions", node.name),
                    ));
                }
                let (address, text) = line
                    .split_once(':')
                    .ok_or_else(|| malformed(lineno, "expected `<address>: <instruction>`"))?;
                let address = parse_hex(lineno, address.trim())?;
                node.instructions
                    .push(decode_instruction(address, text.trim()));
            }
            (other, None) => {
                return Err(malformed(lineno, format!("unexpected `{}`", other)));
            }
        }
    }

    if let Some(proc) = current {
        return Err(malformed(
            exported.lines().count(),
            format!("procedure `{}` is missing its `END`", proc.name),
        ));
    }
    if procedures.is_empty() {
        return Err(ChmcError::MissingInput(
            "exported listing has no procedure".into(),
        ));
    }

    let mut program = Program::new(segments);
    for p in procedures {
        program.add_procedure(p);
    }
    info!(
        "Lifted program";
        "procedures" => program.procedures().len(),
        "bss_segments" => program.segments.bss.len(),
        "data_segments" => program.segments.data.len(),
    );
    Ok(program)
}

/// Split operands at top-level commas, keeping bracketed memory operands whole.
pub fn split_operands(ops: &str) -> Vec<String> {
    let mut res = vec![];
    let mut depth = 0usize;
    let mut cur = String::new();
    for c in ops.chars() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                res.push(cur.trim().to_owned());
                cur.clear();
                continue;
            }
            _ => {}
        }
        cur.push(c);
    }
    if !cur.trim().is_empty() {
        res.push(cur.trim().to_owned());
    }
    res
}

/// `w` views share the `x` register; the zero register is reported as `None`.
fn canonical_register(name: &str) -> Option<Register> {
    let name = name.trim().to_ascii_lowercase();
    match name.as_str() {
        "xzr" | "wzr" => None,
        "wsp" => Some(Register::new("sp")),
        n => match n.strip_prefix('w') {
            Some(num) if !num.is_empty() && num.bytes().all(|b| b.is_ascii_digit()) => {
                Some(Register::new(format!("x{}", num)))
            }
            _ => Some(Register::new(n)),
        },
    }
}

/// Drop any `<symbol>` annotation a disassembler attached to an operand
fn strip_annotation(op: &str) -> &str {
    op.split_whitespace().next().unwrap_or("")
}

fn is_immediate(op: &str) -> bool {
    op.starts_with('#')
        || op.starts_with('-')
        || op.bytes().next().map_or(false, |b| b.is_ascii_digit())
}

fn operand(op: &str) -> Operand {
    let op = strip_annotation(op);
    if is_immediate(op) {
        Operand::Immediate(Immediate::new(op))
    } else {
        match canonical_register(op) {
            Some(r) => Operand::Register(r),
            None => Operand::Immediate(Immediate::new("0")),
        }
    }
}

/// Page addresses are printed in hex, sometimes without the `0x`
fn page_immediate(op: &str) -> Immediate {
    let op = strip_annotation(op);
    let op = op.strip_prefix('#').unwrap_or(op);
    if op.starts_with("0x") || op.starts_with("0X") {
        Immediate::new(op)
    } else {
        Immediate::new(format!("0x{}", op))
    }
}

/// Apply a trailing `lsl #n` to an immediate operand, if any
fn shifted_immediate(imm: &str, shift: Option<&String>) -> Operand {
    let shift = shift
        .and_then(|s| s.strip_prefix("lsl"))
        .and_then(|s| parse_immediate(s.trim()).ok());
    match (shift, parse_immediate(imm)) {
        (Some(sh), Ok(v)) if (0..64).contains(&sh) => {
            Operand::Immediate(Immediate::new(format!("{:#x}", v.wrapping_shl(sh as u32))))
        }
        _ => Operand::Immediate(Immediate::new(imm)),
    }
}

/// Decode a memory operand `[base{, index|#imm}{, extend}]{!}`
fn memory_operand(op: &str) -> Option<(Vec<Register>, Option<Immediate>, bool)> {
    let inner = op.trim().trim_end_matches('!').trim();
    let inner = inner.strip_prefix('[')?.strip_suffix(']')?;
    let parts = inner.split(',').map(str::trim).collect_vec();
    let mut targets = vec![];
    let mut offset = None;
    let mut indexed = false;
    if let Some(base) = parts.first().and_then(|b| canonical_register(b)) {
        targets.push(base);
    }
    if let Some(second) = parts.get(1) {
        if is_immediate(second) {
            offset = Some(Immediate::new(*second));
        } else if let Some(index) = canonical_register(second) {
            targets.push(index);
            indexed = true;
        }
    }
    Some((targets, offset, indexed))
}

fn is_branch(mnemonic: &str) -> bool {
    matches!(
        mnemonic,
        "b" | "bl" | "blr" | "br" | "cbz" | "cbnz" | "tbz" | "tbnz" | "ret"
    ) || mnemonic.starts_with("b.")
}

/// Decode one disassembled AArch64 instruction.
pub fn decode_instruction(address: u64, text: &str) -> Instruction {
    let (mnemonic, ops) = match text.split_once(char::is_whitespace) {
        Some((m, ops)) => (m.to_ascii_lowercase(), split_operands(ops)),
        None => (text.to_ascii_lowercase(), vec![]),
    };
    let dst = |i: usize| ops.get(i).and_then(|r| canonical_register(r));

    let kind = match mnemonic.as_str() {
        "mov" | "movz" if ops.len() == 2 => match dst(0) {
            Some(dst) => InstructionKind::Move {
                dst,
                src: operand(&ops[1]),
            },
            None => InstructionKind::Other,
        },
        "add" | "adds" | "sub" | "subs" if ops.len() >= 3 => {
            match (dst(0), canonical_register(&ops[1])) {
                (Some(dst), Some(lhs)) => {
                    let rhs = match operand(&ops[2]) {
                        Operand::Immediate(imm) => shifted_immediate(imm.text(), ops.get(3)),
                        reg => reg,
                    };
                    InstructionKind::Add {
                        dst,
                        lhs,
                        rhs,
                        subtract: mnemonic.starts_with("sub"),
                    }
                }
                _ => InstructionKind::Other,
            }
        }
        "adrp" if ops.len() == 2 => match dst(0) {
            Some(dst) => InstructionKind::AddressOfPage {
                dst,
                page: page_immediate(&ops[1]),
            },
            None => InstructionKind::Other,
        },
        m if m.starts_with("ld") || m.starts_with("st") => {
            let store = m.starts_with("st");
            let memory = ops
                .iter()
                .enumerate()
                .find_map(|(i, op)| memory_operand(op).map(|mem| (i, mem)));
            match memory {
                Some((i, (targets, offset, indexed))) => {
                    // `[base, #imm]!` is pre-indexed, `[base], #imm` post-indexed
                    let writeback = if ops[i].ends_with('!') {
                        offset.clone()
                    } else {
                        ops.get(i + 1)
                            .map(|op| strip_annotation(op))
                            .filter(|op| is_immediate(op))
                            .map(Immediate::new)
                    };
                    InstructionKind::LoadStore {
                        targets,
                        offset,
                        indexed,
                        store,
                        writeback,
                    }
                }
                // pc-relative literal load
                None => match ops.last() {
                    Some(lit) if ops.len() >= 2 => InstructionKind::LoadStore {
                        targets: vec![],
                        offset: Some(page_immediate(lit)),
                        indexed: false,
                        store,
                        writeback: None,
                    },
                    _ => InstructionKind::Other,
                },
            }
        }
        m if is_branch(m) => InstructionKind::Branch,
        _ => InstructionKind::Other,
    };

    Instruction::new(address, kind, text)
}
