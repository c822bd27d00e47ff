//! The local optimizer.
//!
//! Every node goes through [`optimize`] before it enters the graph:
//! constant folding, algebraic identities, value numbering against the
//! graph's identity map and proj normalization, applied in that order to a
//! fixed point. The rules are shape preserving; memory and control
//! dependencies are never reordered.

use smallvec::SmallVec;

use crate::ana::alias::{get_alias_relation, AliasRelation};
use crate::ir::graph::{Graph, VnKey};
use crate::ir::mode::Mode;
use crate::ir::node::{pn, NodeData, NodeId, Op};
use crate::ir::tarval::Tarval;

enum Step {
    /// No rule applied.
    Done,
    /// The node collapsed to an existing node.
    Existing(NodeId),
    /// The node was rewritten; run the rules again.
    Rewritten(NodeData),
}

/// Route a candidate node through the optimizer. The returned node may be
/// an existing canonical node, a folded constant, or the freshly interned
/// candidate.
pub fn optimize(g: &mut Graph, mut nd: NodeData) -> NodeId {
    loop {
        if let Some(folded) = fold_constant(g, &nd) {
            nd = folded;
            continue;
        }
        match identities(g, &nd) {
            Step::Existing(id) => return id,
            Step::Rewritten(next) => {
                nd = next;
                continue;
            }
            Step::Done => break,
        }
    }

    if nd.op.is_cse_candidate() {
        let key = VnKey {
            op: nd.op.clone(),
            mode: nd.mode,
            block: nd.block,
            ins: nd.ins.clone(),
        };
        if let Some(&existing) = g.vn.get(&key) {
            if !g.is_bad(existing) {
                return existing;
            }
        }
        let ins: Vec<NodeId> = nd.ins.iter().copied().collect();
        let id = g.add_raw(nd.op, nd.mode, nd.block, &ins);
        let key = VnKey {
            op: g.op(id).clone(),
            mode: nd.mode,
            block: nd.block,
            ins: SmallVec::from_slice(&ins),
        };
        g.vn.insert(key, id);
        id
    } else {
        let ins: Vec<NodeId> = nd.ins.iter().copied().collect();
        g.add_raw(nd.op, nd.mode, nd.block, &ins)
    }
}

fn const_of(g: &Graph, n: NodeId) -> Option<Tarval> {
    match g.op(n) {
        Op::Const(tv) => Some(*tv),
        _ => None,
    }
}

fn const_node(g: &Graph, tv: Tarval) -> NodeData {
    NodeData::new(Op::Const(tv), tv.mode(), g.start_block(), &[])
}

fn fold_constant(g: &mut Graph, nd: &NodeData) -> Option<NodeData> {
    let modulo_shift = g.prog().params().modulo_shift;
    match nd.op {
        Op::Add | Op::Sub | Op::Mul | Op::And | Op::Or | Op::Eor | Op::Shl | Op::Shr
        | Op::Shrs => {
            let l = const_of(g, nd.ins[0])?;
            let r = const_of(g, nd.ins[1])?;
            let tv = match nd.op {
                Op::Add => l.add(r),
                Op::Sub => l.sub(r),
                Op::Mul => l.mul(r),
                Op::And => l.and(r),
                Op::Or => l.or(r),
                Op::Eor => l.eor(r),
                Op::Shl => l.shl(r, modulo_shift),
                Op::Shr => l.shr(r, modulo_shift),
                Op::Shrs => l.shrs(r, modulo_shift),
                _ => unreachable!(),
            };
            Some(const_node(g, tv))
        }
        Op::Minus => Some(const_node(g, const_of(g, nd.ins[0])?.neg())),
        Op::Not => Some(const_node(g, const_of(g, nd.ins[0])?.not())),
        Op::Conv => {
            let v = const_of(g, nd.ins[0])?;
            let saturate = matches!(
                g.prog().params().float_int_overflow,
                crate::init::FloatIntOverflow::Saturate
            );
            Some(const_node(g, v.convert(nd.mode, saturate)))
        }
        Op::Cmp(rel) => {
            let l = const_of(g, nd.ins[0])?;
            let r = const_of(g, nd.ins[1])?;
            let outcome = l.compare(r);
            Some(const_node(g, Tarval::from_bool(rel.holds(outcome), Mode::B)))
        }
        _ => None,
    }
}

fn zero_identity(g: &Graph, nd: &NodeData, pos: usize) -> Option<Step> {
    let tv = const_of(g, nd.ins[pos])?;
    if tv.is_null() {
        let other = nd.ins[1 - pos];
        Some(Step::Existing(other))
    } else {
        None
    }
}

fn identities(g: &mut Graph, nd: &NodeData) -> Step {
    match nd.op {
        Op::Add => {
            // x + 0 -> x (not for floats: -0.0 + 0.0 differs)
            if nd.mode.is_int() || nd.mode == Mode::P {
                if let Some(step) = zero_identity(g, nd, 1) {
                    return step;
                }
                if let Some(step) = zero_identity(g, nd, 0) {
                    return step;
                }
            }
        }
        Op::Sub => {
            if nd.mode.is_int() {
                if nd.ins[0] == nd.ins[1] {
                    return Step::Rewritten(const_node(g, Tarval::zero(nd.mode)));
                }
                if let Some(tv) = const_of(g, nd.ins[1]) {
                    if tv.is_null() {
                        return Step::Existing(nd.ins[0]);
                    }
                }
            }
        }
        Op::Mul => {
            if nd.mode.is_int() {
                for pos in 0..2 {
                    if let Some(tv) = const_of(g, nd.ins[pos]) {
                        if tv.is_one() {
                            return Step::Existing(nd.ins[1 - pos]);
                        }
                        if tv.is_null() {
                            return Step::Rewritten(const_node(g, Tarval::zero(nd.mode)));
                        }
                    }
                }
            }
        }
        Op::And => {
            if nd.ins[0] == nd.ins[1] {
                return Step::Existing(nd.ins[0]);
            }
            for pos in 0..2 {
                if let Some(tv) = const_of(g, nd.ins[pos]) {
                    if tv.is_all_one() {
                        return Step::Existing(nd.ins[1 - pos]);
                    }
                    if tv.is_null() {
                        return Step::Rewritten(const_node(g, Tarval::zero(nd.mode)));
                    }
                }
            }
        }
        Op::Or => {
            if nd.ins[0] == nd.ins[1] {
                return Step::Existing(nd.ins[0]);
            }
            if let Some(step) = zero_identity(g, nd, 1) {
                return step;
            }
            if let Some(step) = zero_identity(g, nd, 0) {
                return step;
            }
        }
        Op::Eor => {
            if nd.ins[0] == nd.ins[1] {
                return Step::Rewritten(const_node(g, Tarval::zero(nd.mode)));
            }
            if let Some(step) = zero_identity(g, nd, 1) {
                return step;
            }
            if let Some(step) = zero_identity(g, nd, 0) {
                return step;
            }
        }
        Op::Shl | Op::Shr | Op::Shrs => {
            if let Some(tv) = const_of(g, nd.ins[1]) {
                if tv.is_null() {
                    return Step::Existing(nd.ins[0]);
                }
            }
        }
        Op::Minus => {
            if let Op::Minus = g.op(nd.ins[0]) {
                return Step::Existing(g.input(nd.ins[0], 0));
            }
        }
        Op::Not => {
            if let Op::Not = g.op(nd.ins[0]) {
                return Step::Existing(g.input(nd.ins[0], 0));
            }
        }
        Op::Conv => {
            let src = nd.ins[0];
            if g.mode(src) == nd.mode {
                return Step::Existing(src);
            }
            // Conv(Conv(x: A->B): B->A) -> x when B holds every A value
            if let Op::Conv = g.op(src) {
                let inner = g.input(src, 0);
                let a = g.mode(inner);
                let b = g.mode(src);
                if a == nd.mode && b.bits() >= a.bits() && b.is_int() == a.is_int() {
                    return Step::Existing(inner);
                }
            }
        }
        Op::Mux => {
            let (sel, f, t) = (nd.ins[0], nd.ins[1], nd.ins[2]);
            if f == t {
                return Step::Existing(f);
            }
            if let Some(tv) = const_of(g, sel) {
                return Step::Existing(if tv.is_null() { f } else { t });
            }
        }
        Op::Phi { .. } => {
            // a phi whose operands all agree is that operand
            let mut same: Option<NodeId> = None;
            let mut trivial = true;
            for &op in nd.ins.iter() {
                match same {
                    None => same = Some(op),
                    Some(s) if s == op => {}
                    Some(_) => {
                        trivial = false;
                        break;
                    }
                }
            }
            if trivial {
                if let Some(s) = same {
                    return Step::Existing(s);
                }
            }
        }
        Op::Proj(num) => return proj_rules(g, nd, num),
        _ => {}
    }
    Step::Done
}

fn proj_rules(g: &mut Graph, nd: &NodeData, num: u32) -> Step {
    let pred = nd.ins[0];
    match g.op(pred).clone() {
        // a proj of a literal tuple projects through
        Op::Tuple => {
            if (num as usize) < g.arity(pred) {
                return Step::Existing(g.input(pred, num as usize));
            }
        }
        // a branch on a constant selector becomes an unconditional jump
        // on the taken side and a dead end on the other
        Op::Cond => {
            let sel = g.input(pred, 0);
            if let Some(tv) = const_of(g, sel) {
                let taken = if tv.is_null() {
                    pn::cond::FALSE
                } else {
                    pn::cond::TRUE
                };
                let block = g.block_of(pred);
                let id = if num == taken {
                    g.add_raw(Op::Jmp, Mode::X, block, &[])
                } else {
                    g.add_raw(Op::Bad, Mode::Bad, block, &[])
                };
                return Step::Existing(id);
            }
        }
        Op::Load(load_ty) => {
            // a load that directly follows a store to the same address
            // yields the stored value
            let mem = g.input(pred, 0);
            if num == pn::load::RES {
                if let Op::Proj(pn_store) = g.op(mem) {
                    let store = g.input(mem, 0);
                    if *pn_store == pn::store::M {
                        if let Op::Store(store_ty) = g.op(store).clone() {
                            let load_ptr = g.input(pred, 1);
                            let store_ptr = g.input(store, 1);
                            let lsize = g.prog().type_size(load_ty);
                            let ssize = g.prog().type_size(store_ty);
                            if lsize == ssize
                                && get_alias_relation(
                                    g, load_ptr, load_ty, lsize, store_ptr, store_ty, ssize,
                                ) == AliasRelation::MustAlias
                            {
                                let value = g.input(store, 2);
                                if g.mode(value) == nd.mode {
                                    return Step::Existing(value);
                                }
                            }
                        }
                    }
                }
            }
        }
        _ => {}
    }
    Step::Done
}

/// Re-apply the local rules to every node of a finished graph. Applying
/// this twice is the same as applying it once.
pub fn optimize_graph(g: &mut Graph) {
    let mut changed = true;
    while changed {
        changed = false;
        for id in g.ids().collect::<Vec<_>>() {
            if g.is_bad(id) {
                continue;
            }
            let nd = g.node(id).clone();
            let replacement = match nd.op {
                // a phi in a single-predecessor block is its operand
                Op::Phi { .. } if nd.ins.len() == 1 && g.arity(nd.block) == 1 => {
                    Some(nd.ins[0])
                }
                Op::Add
                | Op::Sub
                | Op::Mul
                | Op::And
                | Op::Or
                | Op::Eor
                | Op::Shl
                | Op::Shr
                | Op::Shrs
                | Op::Minus
                | Op::Not
                | Op::Conv
                | Op::Cmp(_)
                | Op::Mux
                | Op::Proj(_) => {
                    if let Some(folded) = fold_constant(g, &nd) {
                        Some(optimize(g, folded))
                    } else {
                        match identities(g, &nd) {
                            Step::Existing(other) => Some(other),
                            Step::Rewritten(next) => Some(optimize(g, next)),
                            Step::Done => None,
                        }
                    }
                }
                _ => None,
            };
            if let Some(new) = replacement {
                if new != id {
                    g.exchange(id, new);
                    changed = true;
                }
            }
        }
    }
    // folded branches may have rewritten control flow
    g.confirm(crate::ir::graph::GraphProps::empty());
}
