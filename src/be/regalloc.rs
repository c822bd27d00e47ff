//! Register allocation glue.
//!
//! Drives the clock-based register file over the schedule in one forward
//! walk: argument projections claim their parameter registers, every
//! output allocation honors the node's requirements (class, limited set,
//! must-be-different, should-be-same coalescing when the tied input dies
//! at the node), evictions spill through the target's `new_spill` and
//! uses of spilled values reload through `new_reload`. Phi congruence is
//! established afterwards by parallel copies at the end of each
//! predecessor block, with cycles broken through a scratch register.

use rustc_hash::FxHashMap;

use crate::error::{BackendError, BackendResult};
use crate::ir::graph::Graph;
use crate::ir::node::{pn, NodeId, Op, RegReq};

use super::regfile::{RegFile, RegSet};
use super::session::CodegenSession;
use super::target::{Reg, Target};
use super::BeState;

/// Does this node's value occupy a register?
fn needs_reg(g: &Graph, n: NodeId) -> bool {
    if g.is_bad(n) {
        return false;
    }
    let mode = g.mode(n);
    if !mode.is_data() {
        return false;
    }
    matches!(g.op(n), Op::Mach(_) | Op::Proj(_) | Op::Phi { .. })
}

struct Walk {
    pos: FxHashMap<NodeId, usize>,
    last_use: FxHashMap<NodeId, usize>,
}

fn analyze_uses(g: &Graph, state: &BeState) -> Walk {
    let mut pos = FxHashMap::default();
    let mut counter = 0usize;
    for &b in &state.block_order {
        for &n in &state.schedule[&b] {
            pos.insert(n, counter);
            counter += 1;
        }
    }
    let mut last_use: FxHashMap<NodeId, usize> = FxHashMap::default();
    let mut record = |value: NodeId, at: usize| {
        let e = last_use.entry(value).or_insert(at);
        if *e < at {
            *e = at;
        }
    };
    for &b in &state.block_order {
        for &n in &state.schedule[&b] {
            let p = pos[&n];
            if g.is_phi(n) {
                // phi operands are consumed at the end of the incoming
                // block
                for (i, &v) in g.ins(n).to_vec().iter().enumerate() {
                    if i >= g.arity(b) || !needs_reg(g, v) {
                        continue;
                    }
                    let pb = g.cfg_pred_block(b, i);
                    if let Some(term) = state.schedule.get(&pb).and_then(|s| s.last()) {
                        record(v, pos[term]);
                    }
                }
                continue;
            }
            for &v in g.ins(n) {
                if needs_reg(g, v) {
                    record(v, p);
                }
            }
        }
    }
    Walk { pos, last_use }
}

/// Spill `value` right after its definition, reusing an earlier spill of
/// the same value.
fn spill_value(
    g: &mut Graph,
    target: &dyn Target,
    state: &mut BeState,
    session: &CodegenSession,
    spilled: &mut FxHashMap<NodeId, NodeId>,
    value: NodeId,
) {
    if spilled.contains_key(&value) {
        return;
    }
    let def_block = g.block_of(value);
    let spill = target.new_spill(g, value, def_block);
    // anchor after the defining schedule entry (the producer for projs)
    let anchor = if state.sched_pos(def_block, value).is_some() {
        value
    } else {
        g.input(value, 0)
    };
    state.sched_add_after(def_block, anchor, spill);
    spilled.insert(value, spill);
    session.record_spill();
    log::debug!("regalloc: spilled {:?}", value);
}

pub fn allocate(
    g: &mut Graph,
    target: &dyn Target,
    state: &mut BeState,
    session: &CodegenSession,
) -> BackendResult<()> {
    let walk = analyze_uses(g, state);
    let mut rf = RegFile::new(target.isa());
    let mut spilled: FxHashMap<NodeId, NodeId> = FxHashMap::default();

    // parameters arrive in fixed registers
    for &(user, _) in g.outs(g.start()).to_vec().iter() {
        if let Op::Proj(num) = g.op(user) {
            let num = *num;
            if num >= pn::start::ARGS && needs_reg(g, user) && g.n_outs(user) > 0 {
                let i = (num - pn::start::ARGS) as usize;
                let Some(reg) = target.param_reg(i) else {
                    return Err(BackendError::RegisterAllocation {
                        reason: format!("no parameter register for argument {}", i),
                    });
                };
                let _ = rf.claim(reg, user);
                state.regs.insert(user, reg);
            }
        }
    }

    for &b in &state.block_order.clone() {
        for &n in &state.schedule[&b].clone() {
            let p = walk.pos[&n];
            match g.op(n).clone() {
                Op::Phi { .. } => {
                    if !g.mode(n).is_data() {
                        continue;
                    }
                    let Some(class) = target.class_for_mode(g.mode(n)) else {
                        continue;
                    };
                    let (reg, victim) = rf
                        .allocate(class, n, None, &RegSet::new())
                        .map_err(|e| BackendError::RegisterAllocation {
                            reason: format!("{:?}", e),
                        })?;
                    if let Some(v) = victim {
                        spill_value(g, target, state, session, &mut spilled, v.value);
                    }
                    state.regs.insert(n, reg);
                }
                Op::Mach(attr) => {
                    // reload spilled inputs
                    for i in 0..g.arity(n) {
                        let inp = g.input(n, i);
                        if !needs_reg(g, inp) {
                            continue;
                        }
                        if rf.find_value(inp).is_none() {
                            if let Some(&spill) = spilled.get(&inp) {
                                let mode = g.mode(inp);
                                let reload = target.new_reload(g, mode, spill, b);
                                state.sched_add_before(b, n, reload);
                                let Some(class) = target.class_for_mode(mode) else {
                                    continue;
                                };
                                let (reg, victim) = rf
                                    .allocate(class, reload, None, &RegSet::new())
                                    .map_err(|e| BackendError::RegisterAllocation {
                                        reason: format!("{:?}", e),
                                    })?;
                                if let Some(v) = victim {
                                    spill_value(
                                        g, target, state, session, &mut spilled, v.value,
                                    );
                                }
                                state.regs.insert(reload, reg);
                                g.set_input(n, i, reload);
                                session.record_reload();
                            }
                        }
                    }

                    // inputs restricted to a limited set get copied into
                    // an admissible register when they sit elsewhere
                    for i in 0..g.arity(n) {
                        let Some(req) = attr.in_reqs.get(i).copied() else {
                            continue;
                        };
                        let Some(mask) = req.limited else { continue };
                        if req.is_none() {
                            continue;
                        }
                        let inp = g.input(n, i);
                        if !needs_reg(g, inp) {
                            continue;
                        }
                        let satisfied = state
                            .reg_of(inp)
                            .map(|r| r.class == req.class && (mask >> r.index) & 1 == 1)
                            .unwrap_or(false);
                        if satisfied {
                            continue;
                        }
                        let copy = target.new_copy(g, inp, b);
                        let (reg, victim) = rf
                            .allocate(req.class, copy, Some(mask), &RegSet::new())
                            .map_err(|e| BackendError::RegisterAllocation {
                                reason: format!("{:?}", e),
                            })?;
                        if let Some(v) = victim {
                            spill_value(g, target, state, session, &mut spilled, v.value);
                        }
                        state.regs.insert(copy, reg);
                        state.sched_add_before(b, n, copy);
                        g.set_input(n, i, copy);
                        session.record_copy();
                    }

                    // pin the inputs while outputs allocate
                    let mut locked = Vec::new();
                    for &inp in g.ins(n).to_vec().iter() {
                        if let Some(reg) = state.reg_of(inp) {
                            if rf.is_allocated(reg) && rf.lock(reg).is_ok() {
                                locked.push(reg);
                            }
                        }
                    }

                    // free registers of inputs that die here
                    let dying: Vec<NodeId> = g
                        .ins(n)
                        .iter()
                        .copied()
                        .filter(|&v| {
                            needs_reg(g, v) && walk.last_use.get(&v) == Some(&p)
                        })
                        .collect();

                    // output values: the node itself and its projections
                    let mut outputs: Vec<(NodeId, usize)> = Vec::new();
                    if g.mode(n).is_data() {
                        outputs.push((n, 0));
                    }
                    for &(user, _) in g.outs(n).to_vec().iter() {
                        if let Op::Proj(num) = g.op(user) {
                            if needs_reg(g, user) {
                                outputs.push((user, *num as usize));
                            }
                        }
                    }

                    // dying inputs release first so outputs can reuse
                    for (reg, v) in dying
                        .iter()
                        .filter_map(|&v| state.reg_of(v).map(|r| (r, v)))
                        .collect::<Vec<_>>()
                    {
                        if rf.assignment(reg).map(|a| a.value) == Some(v) {
                            while rf.unlock(reg).is_ok() {}
                            let _ = rf.free(reg);
                        }
                    }

                    for (value, out_idx) in outputs {
                        let req = attr
                            .out_reqs
                            .get(out_idx)
                            .copied()
                            .unwrap_or_else(|| {
                                RegReq::class(
                                    target.class_for_mode(g.mode(value)).unwrap_or(0),
                                )
                            });
                        if req.is_none() {
                            continue;
                        }
                        let mut exclude = RegSet::new();
                        for i in 0..g.arity(n).min(64) {
                            if (req.must_be_different >> i) & 1 == 1 {
                                if let Some(r) = state.reg_of(g.input(n, i)) {
                                    exclude.set(r);
                                }
                            }
                        }

                        // should-be-same: reuse the tied input's register
                        // when it just died
                        let mut assigned = None;
                        if let Some(tied) = req.same_as {
                            let tied_in = g.input(n, tied as usize);
                            if let Some(tr) = state.reg_of(tied_in) {
                                if !rf.is_allocated(tr) && !exclude.contains(tr) {
                                    let _ = rf.claim(tr, value);
                                    assigned = Some(tr);
                                }
                            }
                        }
                        let reg = match assigned {
                            Some(r) => r,
                            None => {
                                let (reg, victim) = rf
                                    .allocate(req.class, value, req.limited, &exclude)
                                    .map_err(|e| BackendError::RegisterAllocation {
                                        reason: format!("{:?}", e),
                                    })?;
                                if let Some(v) = victim {
                                    spill_value(
                                        g, target, state, session, &mut spilled, v.value,
                                    );
                                }
                                reg
                            }
                        };
                        state.regs.insert(value, reg);
                        rf.mark_clobbered(reg);
                    }

                    for reg in locked {
                        let _ = rf.unlock(reg);
                    }
                }
                _ => {}
            }
        }
    }

    insert_phi_moves(g, target, state, session);
    Ok(())
}

struct PhiMove {
    phi: NodeId,
    src_node: NodeId,
    src_reg: Reg,
    dst_reg: Reg,
}

/// A phi's output register must equal every input's register; the moves
/// establishing that run at the end of each predecessor block, as a
/// parallel copy with cycle breaking through a scratch register.
fn insert_phi_moves(
    g: &mut Graph,
    target: &dyn Target,
    state: &mut BeState,
    session: &CodegenSession,
) {
    let scratch = Reg::new(0, 11);
    for &b in &state.block_order.clone() {
        let phis: Vec<NodeId> = state.schedule[&b]
            .iter()
            .copied()
            .filter(|&n| g.is_phi(n) && g.mode(n).is_data())
            .collect();
        if phis.is_empty() {
            continue;
        }
        for i in 0..g.arity(b) {
            let pb = g.cfg_pred_block(b, i);
            let Some(term) = state.schedule.get(&pb).and_then(|s| s.last().copied()) else {
                continue;
            };
            let mut moves = Vec::new();
            for &phi in &phis {
                let src = g.input(phi, i);
                let (Some(src_reg), Some(dst_reg)) = (state.reg_of(src), state.reg_of(phi))
                else {
                    continue;
                };
                if src_reg == dst_reg {
                    continue;
                }
                moves.push(PhiMove {
                    phi,
                    src_node: src,
                    src_reg,
                    dst_reg,
                });
            }

            while !moves.is_empty() {
                // a move whose destination no other move still reads can
                // go now
                let free_idx = moves.iter().position(|m| {
                    !moves
                        .iter()
                        .any(|o| o.phi != m.phi && o.src_reg == m.dst_reg)
                });
                match free_idx {
                    Some(idx) => {
                        let m = moves.remove(idx);
                        let copy = target.new_copy(g, m.src_node, pb);
                        state.regs.insert(copy, m.dst_reg);
                        state.sched_add_before(pb, term, copy);
                        g.set_input(m.phi, i, copy);
                        session.record_copy();
                    }
                    None => {
                        // cycle: park one source in the scratch register
                        let first_src = moves[0].src_reg;
                        let src_node = moves[0].src_node;
                        let copy = target.new_copy(g, src_node, pb);
                        state.regs.insert(copy, scratch);
                        state.sched_add_before(pb, term, copy);
                        session.record_copy();
                        for m in moves.iter_mut() {
                            if m.src_reg == first_src {
                                m.src_node = copy;
                                m.src_reg = scratch;
                            }
                        }
                        log::debug!("regalloc: phi cycle broken through scratch");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::be::amd64::{Amd64, RAX, RDI, RSI};
    use crate::be::target::Target as _;
    use crate::be::{sched, select};
    use crate::init::InitParams;
    use crate::ir::build::Builder;
    use crate::ir::mode::Mode;
    use crate::ir::prog::Program;
    use crate::ir::ty::MethodProps;

    fn build_add_fn() -> Graph {
        let prog = Program::new(InitParams::host());
        let i64t = prog.new_primitive_type(Mode::Is64);
        let mty = prog.new_method_type(vec![i64t; 2], vec![i64t], MethodProps::empty());
        let ent = prog.new_global_entity("ra", mty);
        let mut g = prog.new_graph(ent, 0);
        {
            let mut b = Builder::new(&mut g);
            let a0 = b.arg(0, Mode::Is64);
            let a1 = b.arg(1, Mode::Is64);
            let sum = b.add(a0, a1).unwrap();
            b.ret(&[sum]).unwrap();
            b.finalize().unwrap();
        }
        g
    }

    #[test]
    fn args_land_in_param_regs_and_result_in_rax() {
        let mut g = build_add_fn();
        let target = Amd64::new();
        target.lower_for_target(&mut g).unwrap();
        select::select_graph(&mut g, &target).unwrap();
        let mut state = BeState::new();
        sched::schedule_graph(&mut g, &mut state).unwrap();
        let session = CodegenSession::new();
        allocate(&mut g, &target, &mut state, &session).unwrap();

        // find the arg projections
        let mut arg_regs = Vec::new();
        for &(user, _) in g.outs(g.start()) {
            if let Op::Proj(num) = g.op(user) {
                if *num >= pn::start::ARGS && state.reg_of(user).is_some() {
                    arg_regs.push((*num, state.reg_of(user).unwrap()));
                }
            }
        }
        arg_regs.sort_by_key(|&(n, _)| n);
        assert_eq!(arg_regs[0].1, RDI);
        assert_eq!(arg_regs[1].1, RSI);

        // the returned value sits in rax
        for id in g.ids() {
            if let Op::Mach(attr) = g.op(id) {
                if attr.opcode.name == "ret" && g.arity(id) > 1 {
                    assert_eq!(state.reg_of(g.input(id, 1)), Some(RAX));
                }
            }
        }
    }
}
