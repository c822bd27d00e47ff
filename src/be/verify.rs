//! Back-end verification.
//!
//! Checks a scheduled, allocated graph: per-node register constraints,
//! schedule shape, register pressure, spill slots, and the allocation
//! itself. Findings are warnings on the diagnostic stream prefixed with
//! the node, its block and the owning entity's linker name; verification
//! never mutates the graph and never aborts the pipeline.

use std::io::Write;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, Op};

use super::target::{Reg, Target};
use super::BeState;

fn warn(g: &Graph, out: &mut dyn Write, node: NodeId, msg: &str) {
    let entity = g.prog().entity_ld_name(g.entity());
    let _ = writeln!(
        out,
        "beverify: {}: {:?} ({}) in {:?}: {}",
        entity,
        node,
        g.op(node).name(),
        g.block_of(node),
        msg
    );
}

fn is_cf_op(g: &Graph, n: NodeId) -> bool {
    matches!(g.op(n), Op::Mach(a) if a.opcode.is_cf)
}

fn value_needs_reg(g: &Graph, n: NodeId) -> bool {
    g.mode(n).is_data() && matches!(g.op(n), Op::Mach(_) | Op::Proj(_) | Op::Phi { .. })
}

// ---- node constraints ----------------------------------------------------

/// Register class, allocatable set, limited/width/aligned and
/// must-be-different checks for one node.
pub fn verify_node(g: &Graph, target: &dyn Target, state: &BeState, node: NodeId, out: &mut dyn Write) -> bool {
    let isa = target.isa();
    let mut fine = true;
    let Op::Mach(attr) = g.op(node) else {
        return true;
    };

    for (idx, req) in attr.out_reqs.iter().enumerate() {
        if req.is_none() {
            continue;
        }
        let value = if idx == 0 && g.mode(node).is_data() {
            Some(node)
        } else {
            g.outs(node)
                .iter()
                .map(|&(u, _)| u)
                .find(|&u| matches!(g.op(u), Op::Proj(n) if *n as usize == idx))
        };
        let Some(value) = value else { continue };
        let Some(reg) = state.reg_of(value) else {
            warn(g, out, value, "value has no register");
            fine = false;
            continue;
        };
        if reg.class != req.class {
            warn(g, out, value, "register does not match required class");
            fine = false;
            continue;
        }
        let class = isa.class(req.class);
        if (class.allocatable >> reg.index) & 1 == 0 {
            warn(g, out, value, "register not in the allocatable set");
            fine = false;
        }
        if let Some(mask) = req.limited {
            if (mask >> reg.index) & 1 == 0 {
                warn(g, out, value, "register not allowed (limited)");
                fine = false;
            }
        }
        if req.width == 0 || req.width as u32 > class.n_regs as u32 {
            warn(g, out, value, "invalid register width requirement");
            fine = false;
        }
        if reg.index as u32 + req.width as u32 > class.n_regs as u32 {
            warn(g, out, value, "register width constraint not fulfilled");
            fine = false;
        }
        if req.aligned && req.width > 0 && reg.index % req.width != 0 {
            warn(g, out, value, "register alignment constraint not fulfilled");
            fine = false;
        }
        if req.must_be_different != 0 {
            for i in 0..g.arity(node).min(64) {
                if (req.must_be_different >> i) & 1 == 0 {
                    continue;
                }
                if state.reg_of(g.input(node, i)) == Some(reg) {
                    warn(g, out, value, "register not different from tied input");
                    fine = false;
                }
            }
        }
    }

    for (i, req) in attr.in_reqs.iter().enumerate() {
        if req.is_none() || i >= g.arity(node) {
            continue;
        }
        let input = g.input(node, i);
        if !value_needs_reg(g, input) {
            continue;
        }
        match state.reg_of(input) {
            None => {
                warn(g, out, node, "input value has no register");
                fine = false;
            }
            Some(r) if r.class != req.class => {
                warn(g, out, node, "input register class mismatch");
                fine = false;
            }
            Some(r) => {
                if let Some(mask) = req.limited {
                    if (mask >> r.index) & 1 == 0 {
                        warn(g, out, node, "input register not allowed (limited)");
                        fine = false;
                    }
                }
            }
        }
    }
    fine
}

pub fn verify_nodes(g: &Graph, target: &dyn Target, state: &BeState, out: &mut dyn Write) -> bool {
    let mut fine = true;
    for &b in &state.block_order {
        for &n in &state.schedule[&b] {
            fine &= verify_node(g, target, state, n, out);
        }
    }
    fine
}

// ---- schedule ------------------------------------------------------------

pub fn verify_schedule(g: &Graph, state: &BeState, out: &mut dyn Write) -> bool {
    let mut fine = true;
    let mut scheduled: FxHashSet<NodeId> = FxHashSet::default();
    for &b in &state.block_order {
        let sched = &state.schedule[&b];
        let mut non_phi_seen = false;
        let mut cf_seen = false;
        for (pos, &n) in sched.iter().enumerate() {
            if !scheduled.insert(n) {
                warn(g, out, n, "node scheduled twice");
                fine = false;
            }
            if g.is_bad(n) {
                warn(g, out, n, "dead node scheduled");
                fine = false;
                continue;
            }
            if g.block_of(n) != b {
                warn(g, out, n, "node scheduled in a foreign block");
                fine = false;
            }
            if g.is_phi(n) {
                if non_phi_seen {
                    warn(g, out, n, "phi scheduled after a non-phi");
                    fine = false;
                }
            } else {
                non_phi_seen = true;
            }
            if is_cf_op(g, n) {
                if cf_seen {
                    warn(g, out, n, "more than one control-flow op");
                    fine = false;
                }
                cf_seen = true;
                if pos + 1 != sched.len() {
                    warn(g, out, n, "control-flow op not at the schedule tail");
                    fine = false;
                }
            }
            if matches!(g.op(n), Op::Keep) {
                let anchor = g.input(n, 0);
                let apos = sched.iter().position(|&s| s == anchor);
                if apos != Some(pos.wrapping_sub(1)) {
                    warn(g, out, n, "keep not scheduled right after its anchor");
                    fine = false;
                }
            }
            // every in-block scheduled dependency precedes its user
            if !g.is_phi(n) {
                for dep in sched_deps(g, b, n) {
                    let dpos = sched.iter().position(|&s| s == dep);
                    match dpos {
                        Some(dp) if dp < pos => {}
                        Some(_) => {
                            warn(g, out, n, "operand scheduled after its user");
                            fine = false;
                        }
                        None => {
                            warn(g, out, n, "operand in block but not scheduled");
                            fine = false;
                        }
                    }
                }
            }
        }
    }
    fine
}

fn sched_deps(g: &Graph, block: NodeId, n: NodeId) -> Vec<NodeId> {
    let mut deps = Vec::new();
    let mut seen = FxHashSet::default();
    let mut stack: Vec<NodeId> = g.ins(n).to_vec();
    while let Some(p) = stack.pop() {
        if !seen.insert(p) || g.is_bad(p) || g.block_of(p) != block {
            continue;
        }
        match g.op(p) {
            Op::Mach(_) | Op::Keep => deps.push(p),
            Op::Phi { .. } => {}
            _ => stack.extend(g.ins(p).iter().copied()),
        }
    }
    deps
}

// ---- liveness over scheduled values --------------------------------------

struct BlockLiveness {
    live_in: FxHashMap<NodeId, FxHashSet<NodeId>>,
    live_out: FxHashMap<NodeId, FxHashSet<NodeId>>,
}

fn compute_block_liveness(g: &Graph, state: &BeState) -> BlockLiveness {
    let mut uses: FxHashMap<NodeId, FxHashSet<NodeId>> = FxHashMap::default();
    let mut defs: FxHashMap<NodeId, FxHashSet<NodeId>> = FxHashMap::default();
    for &b in &state.block_order {
        let u = uses.entry(b).or_default();
        let d = defs.entry(b).or_default();
        for &n in &state.schedule[&b] {
            if value_needs_reg(g, n) {
                d.insert(n);
            }
            for &(user, _) in g.outs(n) {
                if matches!(g.op(user), Op::Proj(_)) && value_needs_reg(g, user) {
                    d.insert(user);
                }
            }
            if g.is_phi(n) {
                continue;
            }
            for &v in g.ins(n) {
                if value_needs_reg(g, v) {
                    u.insert(v);
                }
            }
        }
    }

    let mut live_in: FxHashMap<NodeId, FxHashSet<NodeId>> = FxHashMap::default();
    let mut live_out: FxHashMap<NodeId, FxHashSet<NodeId>> = FxHashMap::default();
    let mut changed = true;
    while changed {
        changed = false;
        for &b in state.block_order.iter().rev() {
            let mut out_set: FxHashSet<NodeId> = FxHashSet::default();
            for s in g.block_succs(b) {
                if let Some(li) = live_in.get(&s) {
                    out_set.extend(li.iter().copied());
                }
                // phi inputs are live out of the matching predecessor
                for (i, &pred) in g.ins(s).to_vec().iter().enumerate() {
                    if g.block_of(pred) != b {
                        continue;
                    }
                    for &m in g.block_members(s) {
                        if g.is_phi(m) && i < g.arity(m) {
                            let v = g.input(m, i);
                            if value_needs_reg(g, v) {
                                out_set.insert(v);
                            }
                        }
                    }
                }
            }
            let mut in_set = out_set.clone();
            if let Some(d) = defs.get(&b) {
                in_set.retain(|v| !d.contains(v));
            }
            if let Some(u) = uses.get(&b) {
                in_set.extend(u.iter().copied());
            }
            if live_out.get(&b) != Some(&out_set) || live_in.get(&b) != Some(&in_set) {
                live_out.insert(b, out_set);
                live_in.insert(b, in_set);
                changed = true;
            }
        }
    }
    BlockLiveness { live_in, live_out }
}

// ---- register pressure ---------------------------------------------------

/// The live set per class never exceeds the allocatable count, checked at
/// the block end and while walking backwards through the schedule.
pub fn verify_register_pressure(
    g: &Graph,
    target: &dyn Target,
    state: &BeState,
    out: &mut dyn Write,
) -> bool {
    let lv = compute_block_liveness(g, state);
    let isa = target.isa();
    let mut fine = true;
    for &b in &state.block_order {
        let mut live: FxHashSet<NodeId> =
            lv.live_out.get(&b).cloned().unwrap_or_default();
        let mut check = |live: &FxHashSet<NodeId>, node: NodeId, out: &mut dyn Write, fine: &mut bool| {
            for (class_idx, class) in isa.classes.iter().enumerate() {
                let pressure = live
                    .iter()
                    .filter(|&&v| {
                        target.class_for_mode(g.mode(v)) == Some(class_idx as u8)
                    })
                    .count() as u32;
                if pressure > class.n_allocatable() {
                    warn(
                        g,
                        out,
                        node,
                        &format!(
                            "register pressure {} exceeds class {} with {} registers",
                            pressure,
                            class.name,
                            class.n_allocatable()
                        ),
                    );
                    *fine = false;
                }
            }
        };
        check(&live, b, out, &mut fine);
        for &n in state.schedule[&b].iter().rev() {
            live.remove(&n);
            for &(user, _) in g.outs(n) {
                if matches!(g.op(user), Op::Proj(_)) {
                    live.remove(&user);
                }
            }
            if !g.is_phi(n) {
                for &v in g.ins(n) {
                    if value_needs_reg(g, v) {
                        live.insert(v);
                    }
                }
            }
            check(&live, n, out, &mut fine);
        }
    }
    fine
}

// ---- register allocation -------------------------------------------------

/// No two simultaneously live values in one register, every used value
/// has one, and phi congruence holds.
pub fn verify_register_allocation(
    g: &Graph,
    target: &dyn Target,
    state: &BeState,
    out: &mut dyn Write,
) -> bool {
    let isa = target.isa();
    let lv = compute_block_liveness(g, state);
    let mut fine = true;

    for &b in &state.block_order {
        // registers occupied by values live out of the block
        let mut occupied: FxHashMap<Reg, NodeId> = FxHashMap::default();
        let mut use_reg = |value: NodeId,
                           occupied: &mut FxHashMap<Reg, NodeId>,
                           out: &mut dyn Write,
                           fine: &mut bool| {
            let Some(reg) = state.reg_of(value) else {
                warn(g, out, value, "live value has no register");
                *fine = false;
                return;
            };
            if isa.is_non_ssa(reg) {
                return;
            }
            if let Some(&other) = occupied.get(&reg) {
                if other != value {
                    warn(g, out, value, "two live values share a register");
                    *fine = false;
                }
            }
            occupied.insert(reg, value);
        };
        for &v in lv.live_out.get(&b).into_iter().flatten() {
            use_reg(v, &mut occupied, out, &mut fine);
        }
        // walk backwards: defs release, uses claim
        for &n in state.schedule[&b].iter().rev() {
            if value_needs_reg(g, n) {
                if let Some(reg) = state.reg_of(n) {
                    occupied.remove(&reg);
                }
            }
            for &(user, _) in g.outs(n).to_vec().iter() {
                if matches!(g.op(user), Op::Proj(_)) && value_needs_reg(g, user) {
                    if let Some(reg) = state.reg_of(user) {
                        occupied.remove(&reg);
                    }
                }
            }
            if !g.is_phi(n) {
                for &v in g.ins(n) {
                    if value_needs_reg(g, v) {
                        use_reg(v, &mut occupied, out, &mut fine);
                    }
                }
            }
        }

        // phi congruence
        for &n in &state.schedule[&b] {
            if !g.is_phi(n) || !g.mode(n).is_data() {
                continue;
            }
            let phi_reg = state.reg_of(n);
            for &v in g.ins(n) {
                if value_needs_reg(g, v) && state.reg_of(v) != phi_reg {
                    warn(g, out, n, "phi input register differs from phi register");
                    fine = false;
                }
            }
        }
    }
    fine
}

// ---- spill slots ---------------------------------------------------------

/// Reloads must reach a spill (or memory phi of spills) and spills
/// sharing a frame entity must spill the same value.
pub fn verify_spillslots(g: &Graph, state: &BeState, out: &mut dyn Write) -> bool {
    let mut fine = true;
    let mut entity_value: FxHashMap<u32, NodeId> = FxHashMap::default();
    for &b in &state.block_order {
        for &n in &state.schedule[&b] {
            let Op::Mach(attr) = g.op(n) else { continue };
            if attr.opcode.is_spill {
                match attr.frame_entity {
                    Some(ent) => {
                        let value = g.input(n, 0);
                        if let Some(&prev) = entity_value.get(&ent.0) {
                            if prev != value {
                                warn(g, out, n, "spills of different values share a slot");
                                fine = false;
                            }
                        }
                        entity_value.insert(ent.0, value);
                    }
                    None => {
                        warn(g, out, n, "spill without a frame entity");
                        fine = false;
                    }
                }
            }
            if attr.opcode.is_reload {
                if !reaches_spill(g, g.input(n, 0), 0) {
                    warn(g, out, n, "reload does not reach a spill");
                    fine = false;
                }
            }
        }
    }
    fine
}

fn reaches_spill(g: &Graph, mem: NodeId, depth: u32) -> bool {
    if depth > 64 {
        return false;
    }
    match g.op(mem) {
        Op::Mach(a) if a.opcode.is_spill => true,
        Op::Phi { .. } => (0..g.arity(mem)).all(|i| reaches_spill(g, g.input(mem, i), depth + 1)),
        _ => false,
    }
}
