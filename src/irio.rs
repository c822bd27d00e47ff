//! Textual IR persistence.
//!
//! A line-oriented format listing types, entities and per-graph node
//! lists with numeric ids. Reading a written program yields a program
//! that serializes to the same text; node ids are renumbered densely and
//! dead nodes are not persisted. Machine nodes never appear in persisted
//! IR: persistence happens before the back end runs.

use std::io::Write;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::init::InitParams;
use crate::ir::graph::Graph;
use crate::ir::ident::Ident;
use crate::ir::mode::Mode;
use crate::ir::node::{NodeId, Op, Relation};
use crate::ir::prog::Program;
use crate::ir::tarval::Tarval;
use crate::ir::ty::{EntityId, EntityKind, MethodProps, TypeId, TypeKind};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("line {0}: {1}")]
    Syntax(usize, String),
    #[error("line {0}: unknown reference {1}")]
    UnknownRef(usize, u32),
}

// ---- writing -------------------------------------------------------------

fn fmt_op(g: &Graph, id: NodeId, renum: &FxHashMap<NodeId, u32>) -> Option<String> {
    let payload = match g.op(id) {
        Op::Start => "Start".to_string(),
        Op::End => "End".to_string(),
        Op::Block => "Block".to_string(),
        Op::NoMem => "NoMem".to_string(),
        Op::Unknown => "Unknown".to_string(),
        Op::Bad => return None,
        Op::Const(tv) => format!("Const {:#x} {}", tv.bits(), tv.mode()),
        Op::Address(e) => format!("Address {}", e.0),
        Op::Phi { loop_ } => format!("Phi {}", *loop_ as u32),
        Op::Add => "Add".into(),
        Op::Sub => "Sub".into(),
        Op::Mul => "Mul".into(),
        Op::Div => "Div".into(),
        Op::Mod => "Mod".into(),
        Op::Minus => "Minus".into(),
        Op::And => "And".into(),
        Op::Or => "Or".into(),
        Op::Eor => "Eor".into(),
        Op::Not => "Not".into(),
        Op::Shl => "Shl".into(),
        Op::Shr => "Shr".into(),
        Op::Shrs => "Shrs".into(),
        Op::Conv => "Conv".into(),
        Op::Cmp(rel) => format!("Cmp {}", rel.bits()),
        Op::Cond => "Cond".into(),
        Op::Jmp => "Jmp".into(),
        Op::Mux => "Mux".into(),
        Op::Proj(n) => format!("Proj {}", n),
        Op::Tuple => "Tuple".into(),
        Op::Load(t) => format!("Load {}", t.0),
        Op::Store(t) => format!("Store {}", t.0),
        Op::Call(t) => format!("Call {}", t.0),
        Op::Return => "Return".into(),
        Op::Alloc(a) => format!("Alloc {}", a),
        Op::Member(e) => format!("Member {}", e.0),
        Op::Sel(t) => format!("Sel {}", t.0),
        Op::Keep => "Keep".into(),
        Op::Mach(_) => return None,
    };
    let ins: Vec<String> = g
        .ins(id)
        .iter()
        .filter_map(|i| renum.get(i).map(|n| n.to_string()))
        .collect();
    Some(format!(
        "{} mode {} block {} ins [{}]",
        payload,
        g.mode(id),
        renum.get(&g.block_of(id)).copied().unwrap_or(0),
        ins.join(" ")
    ))
}

/// Serialize the program's types and entities plus the given graphs.
pub fn write_program(
    prog: &Program,
    graphs: &[&Graph],
    out: &mut dyn Write,
) -> std::io::Result<()> {
    writeln!(out, "sonir 1")?;

    {
        let store = prog.store();
        for (i, ty) in store.types.iter().enumerate() {
            match &ty.kind {
                TypeKind::Primitive(m) => writeln!(out, "type {} primitive {}", i, m)?,
                TypeKind::Pointer(to) => writeln!(out, "type {} pointer {}", i, to.0)?,
                TypeKind::Array { element, length } => {
                    writeln!(out, "type {} array {} {}", i, element.0, length)?
                }
                TypeKind::Compound {
                    name,
                    is_class,
                    is_frame,
                    ..
                } => {
                    let kind = if *is_frame {
                        "frame"
                    } else if *is_class {
                        "class"
                    } else {
                        "struct"
                    };
                    writeln!(out, "type {} compound {} \"{}\"", i, kind, name)?
                }
                TypeKind::Method {
                    params,
                    results,
                    props,
                } => {
                    let ps: Vec<String> = params.iter().map(|p| p.0.to_string()).collect();
                    let rs: Vec<String> = results.iter().map(|r| r.0.to_string()).collect();
                    writeln!(
                        out,
                        "type {} method {} params [{}] results [{}]",
                        i,
                        props.bits(),
                        ps.join(" "),
                        rs.join(" ")
                    )?
                }
            }
        }
        for (i, ent) in store.entities.iter().enumerate() {
            let owner = ent
                .owner
                .map(|o| o.0.to_string())
                .unwrap_or_else(|| "-".into());
            let kind = match ent.kind {
                EntityKind::Global => "global",
                EntityKind::Member => "member",
                EntityKind::Spill => "spill",
            };
            writeln!(
                out,
                "entity {} \"{}\" \"{}\" type {} owner {} kind {} offset {}",
                i, ent.name, ent.ld_name, ent.ty.0, owner, kind, ent.offset
            )?;
        }
    }

    for g in graphs {
        let mut renum: FxHashMap<NodeId, u32> = FxHashMap::default();
        let mut next = 0u32;
        for id in g.ids() {
            if !g.is_bad(id) && !matches!(g.op(id), Op::Mach(_)) {
                renum.insert(id, next);
                next += 1;
            }
        }
        writeln!(
            out,
            "graph entity {} frame {} locals {}",
            g.entity().0,
            g.frame_type().0,
            g.n_locals()
        )?;
        for id in g.ids() {
            let Some(&n) = renum.get(&id) else { continue };
            if let Some(line) = fmt_op(g, id, &renum) {
                writeln!(out, "node {} {}", n, line)?;
            }
        }
        writeln!(out, "endgraph")?;
    }
    writeln!(out, "end")?;
    Ok(())
}

pub fn write_program_to_string(prog: &Program, graphs: &[&Graph]) -> String {
    let mut buf = Vec::new();
    write_program(prog, graphs, &mut buf).expect("writing to a buffer cannot fail");
    String::from_utf8(buf).expect("serialized IR is utf-8")
}

// ---- reading -------------------------------------------------------------

struct Lines<'a> {
    tokens: Vec<Vec<&'a str>>,
}

fn tokenize(line: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = line.trim();
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped.find('"').unwrap_or(stripped.len());
            out.push(&stripped[..end]);
            rest = stripped[end..].trim_start_matches('"').trim_start();
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            out.push(&rest[..end]);
            rest = rest[end..].trim_start();
        }
    }
    out
}

struct NodeLine {
    id: u32,
    op: String,
    args: Vec<String>,
    mode: Mode,
    block: u32,
    ins: Vec<u32>,
}

fn parse_node_line(lineno: usize, toks: &[&str]) -> Result<NodeLine, ParseError> {
    let syntax = |msg: &str| ParseError::Syntax(lineno, msg.to_string());
    // node <id> <Op> [payload...] mode <m> block <b> ins [..]
    let id: u32 = toks
        .get(1)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| syntax("missing node id"))?;
    let op = toks.get(2).ok_or_else(|| syntax("missing opcode"))?;
    let mode_pos = toks
        .iter()
        .position(|&t| t == "mode")
        .ok_or_else(|| syntax("missing mode"))?;
    let args: Vec<String> = toks[3..mode_pos].iter().map(|s| s.to_string()).collect();
    let mode = toks
        .get(mode_pos + 1)
        .and_then(|t| Mode::from_name(t))
        .ok_or_else(|| syntax("bad mode"))?;
    let block: u32 = toks
        .get(mode_pos + 3)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| syntax("missing block"))?;
    let ins_pos = toks
        .iter()
        .position(|&t| t == "ins")
        .ok_or_else(|| syntax("missing ins"))?;
    let mut ins = Vec::new();
    for t in &toks[ins_pos + 1..] {
        let t = t.trim_start_matches('[').trim_end_matches(']');
        if t.is_empty() {
            continue;
        }
        ins.push(
            t.parse()
                .map_err(|_| syntax("bad input reference"))?,
        );
    }
    Ok(NodeLine {
        id,
        op: op.to_string(),
        args,
        mode,
        block,
        ins,
    })
}

fn parse_op(lineno: usize, nl: &NodeLine) -> Result<Op, ParseError> {
    let syntax = |msg: &str| ParseError::Syntax(lineno, msg.to_string());
    let arg = |i: usize| -> Result<&str, ParseError> {
        nl.args
            .get(i)
            .map(|s| s.as_str())
            .ok_or_else(|| syntax("missing payload"))
    };
    Ok(match nl.op.as_str() {
        "Start" => Op::Start,
        "End" => Op::End,
        "Block" => Op::Block,
        "NoMem" => Op::NoMem,
        "Unknown" => Op::Unknown,
        "Const" => {
            let bits = u64::from_str_radix(arg(0)?.trim_start_matches("0x"), 16)
                .map_err(|_| syntax("bad constant bits"))?;
            let mode = Mode::from_name(arg(1)?).ok_or_else(|| syntax("bad constant mode"))?;
            Op::Const(Tarval::from_bits(bits, mode))
        }
        "Address" => Op::Address(EntityId(
            arg(0)?.parse().map_err(|_| syntax("bad entity"))?,
        )),
        "Phi" => Op::Phi {
            loop_: arg(0)? == "1",
        },
        "Add" => Op::Add,
        "Sub" => Op::Sub,
        "Mul" => Op::Mul,
        "Div" => Op::Div,
        "Mod" => Op::Mod,
        "Minus" => Op::Minus,
        "And" => Op::And,
        "Or" => Op::Or,
        "Eor" => Op::Eor,
        "Not" => Op::Not,
        "Shl" => Op::Shl,
        "Shr" => Op::Shr,
        "Shrs" => Op::Shrs,
        "Conv" => Op::Conv,
        "Cmp" => {
            let bits: u8 = arg(0)?.parse().map_err(|_| syntax("bad relation"))?;
            Op::Cmp(Relation::from_bits_truncate(bits))
        }
        "Cond" => Op::Cond,
        "Jmp" => Op::Jmp,
        "Mux" => Op::Mux,
        "Proj" => Op::Proj(arg(0)?.parse().map_err(|_| syntax("bad proj number"))?),
        "Tuple" => Op::Tuple,
        "Load" => Op::Load(TypeId(arg(0)?.parse().map_err(|_| syntax("bad type"))?)),
        "Store" => Op::Store(TypeId(arg(0)?.parse().map_err(|_| syntax("bad type"))?)),
        "Call" => Op::Call(TypeId(arg(0)?.parse().map_err(|_| syntax("bad type"))?)),
        "Return" => Op::Return,
        "Alloc" => Op::Alloc(arg(0)?.parse().map_err(|_| syntax("bad alignment"))?),
        "Member" => Op::Member(EntityId(
            arg(0)?.parse().map_err(|_| syntax("bad entity"))?,
        )),
        "Sel" => Op::Sel(TypeId(arg(0)?.parse().map_err(|_| syntax("bad type"))?)),
        "Keep" => Op::Keep,
        other => return Err(ParseError::Syntax(lineno, format!("unknown opcode {}", other))),
    })
}

/// Parse a serialized program. `params` supplies the target description
/// the text does not carry.
pub fn read_program(
    input: &str,
    params: InitParams,
) -> Result<(Arc<Program>, Vec<Graph>), ParseError> {
    let prog = Program::new(params);
    let lines = Lines {
        tokens: input
            .lines()
            .map(tokenize)
            .collect(),
    };
    let mut graphs = Vec::new();
    let mut i = 0;
    while i < lines.tokens.len() {
        let toks = &lines.tokens[i];
        let lineno = i + 1;
        match toks.first().copied() {
            None | Some("sonir") | Some("end") => {
                i += 1;
            }
            Some("type") => {
                parse_type(&prog, lineno, toks)?;
                i += 1;
            }
            Some("entity") => {
                parse_entity(&prog, lineno, toks)?;
                i += 1;
            }
            Some("graph") => {
                let (g, consumed) = parse_graph(&prog, &lines, i)?;
                graphs.push(g);
                i += consumed;
            }
            Some(other) => {
                return Err(ParseError::Syntax(
                    lineno,
                    format!("unexpected '{}'", other),
                ))
            }
        }
    }
    Ok((prog, graphs))
}

fn parse_type(prog: &Program, lineno: usize, toks: &[&str]) -> Result<(), ParseError> {
    let syntax = |msg: &str| ParseError::Syntax(lineno, msg.to_string());
    let kind = toks.get(2).ok_or_else(|| syntax("missing type kind"))?;
    let mut store = prog.store();
    match *kind {
        "primitive" => {
            let mode = toks
                .get(3)
                .and_then(|t| Mode::from_name(t))
                .ok_or_else(|| syntax("bad mode"))?;
            store.new_primitive(mode);
        }
        "pointer" => {
            let to: u32 = toks
                .get(3)
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| syntax("bad pointee"))?;
            store.new_pointer(TypeId(to));
        }
        "array" => {
            let elem: u32 = toks
                .get(3)
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| syntax("bad element"))?;
            let len: u32 = toks
                .get(4)
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| syntax("bad length"))?;
            store.new_array(TypeId(elem), len);
        }
        "compound" => {
            let sub = toks.get(3).copied().unwrap_or("struct");
            let name = toks.get(4).copied().unwrap_or("anon");
            store.new_compound(Ident::new(name), sub == "class", sub == "frame");
        }
        "method" => {
            let props: u8 = toks
                .get(3)
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| syntax("bad method props"))?;
            let mut params = Vec::new();
            let mut results = Vec::new();
            let mut into_results = false;
            for t in &toks[4..] {
                match *t {
                    "params" => into_results = false,
                    "results" => into_results = true,
                    other => {
                        let other = other.trim_start_matches('[').trim_end_matches(']');
                        if other.is_empty() {
                            continue;
                        }
                        let id: u32 =
                            other.parse().map_err(|_| syntax("bad signature type"))?;
                        if into_results {
                            results.push(TypeId(id));
                        } else {
                            params.push(TypeId(id));
                        }
                    }
                }
            }
            store.new_method(params, results, MethodProps::from_bits_truncate(props));
        }
        other => return Err(ParseError::Syntax(lineno, format!("unknown type kind {}", other))),
    }
    Ok(())
}

fn parse_entity(prog: &Program, lineno: usize, toks: &[&str]) -> Result<(), ParseError> {
    let syntax = |msg: &str| ParseError::Syntax(lineno, msg.to_string());
    let name = toks.get(2).ok_or_else(|| syntax("missing name"))?;
    let ld_name = toks.get(3).ok_or_else(|| syntax("missing ld name"))?;
    let ty: u32 = toks
        .get(5)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| syntax("bad type"))?;
    let owner = toks.get(7).copied().unwrap_or("-");
    let kind = toks.get(9).copied().unwrap_or("global");
    let offset: i32 = toks
        .get(11)
        .and_then(|t| t.parse().ok())
        .unwrap_or(-1);
    let mut store = prog.store();
    let ent = if owner == "-" {
        store.new_global_entity(Ident::new(name), TypeId(ty))
    } else {
        let owner_ty: u32 = owner.parse().map_err(|_| syntax("bad owner"))?;
        store.add_member(TypeId(owner_ty), Ident::new(name), TypeId(ty))
    };
    let data = &mut store.entities[ent.0 as usize];
    data.ld_name = Ident::new(ld_name);
    data.offset = offset;
    data.kind = match kind {
        "member" => EntityKind::Member,
        "spill" => EntityKind::Spill,
        _ => EntityKind::Global,
    };
    Ok(())
}

fn parse_graph(
    prog: &Arc<Program>,
    lines: &Lines<'_>,
    start: usize,
) -> Result<(Graph, usize), ParseError> {
    let toks = &lines.tokens[start];
    let lineno = start + 1;
    let syntax = |l: usize, msg: &str| ParseError::Syntax(l, msg.to_string());
    let entity: u32 = toks
        .get(2)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| syntax(lineno, "bad graph entity"))?;
    let frame: u32 = toks
        .get(4)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| syntax(lineno, "bad frame type"))?;
    let locals: usize = toks
        .get(6)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| syntax(lineno, "bad locals count"))?;

    let mut g = Graph::new(prog.clone(), EntityId(entity), TypeId(frame), locals);
    let mut node_lines = Vec::new();
    let mut i = start + 1;
    loop {
        let Some(toks) = lines.tokens.get(i) else {
            return Err(syntax(i, "unterminated graph"));
        };
        match toks.first().copied() {
            Some("endgraph") => {
                i += 1;
                break;
            }
            Some("node") => {
                node_lines.push((i + 1, parse_node_line(i + 1, toks)?));
                i += 1;
            }
            _ => return Err(syntax(i + 1, "expected node or endgraph")),
        }
    }

    // first pass: create nodes; ids 0..6 are the sentinels every graph
    // starts with
    let mut map: FxHashMap<u32, NodeId> = FxHashMap::default();
    for preset in 0u32..6 {
        map.insert(preset, NodeId(preset));
    }
    for (lineno, nl) in &node_lines {
        if nl.id < 6 {
            continue;
        }
        let op = parse_op(*lineno, nl)?;
        let sb = g.start_block();
        let id = g.add_raw(op, nl.mode, sb, &[]);
        map.insert(nl.id, id);
    }
    // second pass: blocks and inputs
    for (lineno, nl) in &node_lines {
        let id = map[&nl.id];
        let block = *map
            .get(&nl.block)
            .ok_or(ParseError::UnknownRef(*lineno, nl.block))?;
        if !g.is_block(id) {
            g.set_block(id, block);
        }
        let mut ins = Vec::new();
        for r in &nl.ins {
            ins.push(*map.get(r).ok_or(ParseError::UnknownRef(*lineno, *r))?);
        }
        if nl.id >= 6 || !ins.is_empty() {
            g.set_inputs(id, &ins);
        }
    }
    // the end block of a finalized graph is matured
    if !g.is_matured(g.end_block()) {
        g.mark_matured(g.end_block());
    }
    Ok((g, i - start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::build::Builder;
    use crate::ir::node::Relation;
    use crate::ir::ty::MethodProps;

    fn sample_program() -> (Arc<Program>, Graph) {
        let prog = Program::new(InitParams::host());
        let i32t = prog.new_primitive_type(Mode::Is32);
        let mty = prog.new_method_type(vec![i32t], vec![i32t], MethodProps::empty());
        let ent = prog.new_global_entity("sample", mty);
        let mut g = prog.new_graph(ent, 1);
        {
            let mut b = Builder::new(&mut g);
            let a0 = b.arg(0, Mode::Is32);
            let two = b.const_i(2, Mode::Is32);
            let cmp = b.cmp(a0, two, Relation::GREATER).unwrap();
            let (f_proj, t_proj) = b.cond(cmp).unwrap();
            let bt = b.new_imm_block();
            b.add_pred(bt, t_proj);
            b.mature_block(bt);
            b.set_cur_block(bt);
            let one = b.const_i(1, Mode::Is32);
            b.ret(&[one]).unwrap();
            let bf = b.new_imm_block();
            b.add_pred(bf, f_proj);
            b.mature_block(bf);
            b.set_cur_block(bf);
            b.ret(&[a0]).unwrap();
            b.finalize().unwrap();
        }
        (prog, g)
    }

    #[test]
    fn round_trip_is_stable() {
        let (prog, g) = sample_program();
        let text1 = write_program_to_string(&prog, &[&g]);
        let (prog2, graphs2) = read_program(&text1, InitParams::host()).unwrap();
        assert_eq!(graphs2.len(), 1);
        let refs: Vec<&Graph> = graphs2.iter().collect();
        let text2 = write_program_to_string(&prog2, &refs);
        assert_eq!(text1, text2);
    }

    #[test]
    fn dead_nodes_are_not_persisted() {
        let (prog, mut g) = sample_program();
        let sb = g.start_block();
        let dead = g.add_raw(
            Op::Const(Tarval::from_i64(99, Mode::Is32)),
            Mode::Is32,
            sb,
            &[],
        );
        g.kill(dead);
        let text = write_program_to_string(&prog, &[&g]);
        assert!(!text.contains("0x63"));
    }

    #[test]
    fn syntax_errors_carry_line_numbers() {
        let err = read_program("sonir 1\nfrobnicate\n", InitParams::host()).unwrap_err();
        match err {
            ParseError::Syntax(line, _) => assert_eq!(line, 2),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn graph_body_survives_round_trip() {
        let (prog, g) = sample_program();
        let text = write_program_to_string(&prog, &[&g]);
        let (_prog2, graphs2) = read_program(&text, InitParams::host()).unwrap();
        let g2 = &graphs2[0];
        // same live node population
        let live = |g: &Graph| {
            g.ids()
                .filter(|&i| !g.is_bad(i))
                .count()
        };
        assert_eq!(live(&g), live(g2));
        // a compare with the same relation exists
        let has_cmp = g2
            .ids()
            .any(|i| matches!(g2.op(i), Op::Cmp(r) if *r == Relation::GREATER));
        assert!(has_cmp);
    }
}
