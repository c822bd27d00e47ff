//! List scheduling.
//!
//! Produces, per block, a legal linear order: phis first, data
//! dependencies respected, exactly one control-flow operation at the
//! tail, Keep nodes immediately after the node they anchor.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::BackendResult;
use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, Op};

use super::BeState;

fn is_scheduled_op(g: &Graph, n: NodeId) -> bool {
    match g.op(n) {
        Op::Mach(_) | Op::Phi { .. } | Op::Keep => true,
        _ => false,
    }
}

fn is_cf_op(g: &Graph, n: NodeId) -> bool {
    match g.op(n) {
        Op::Mach(attr) => attr.opcode.is_cf,
        _ => false,
    }
}

/// Scheduled nodes `n` depends on, reached through unscheduled
/// intermediates (projections) inside the same block.
fn block_deps(g: &Graph, block: NodeId, n: NodeId) -> Vec<NodeId> {
    let mut deps = Vec::new();
    let mut seen = FxHashSet::default();
    let mut stack: Vec<NodeId> = g.ins(n).to_vec();
    while let Some(p) = stack.pop() {
        if !seen.insert(p) || g.is_bad(p) {
            continue;
        }
        if g.block_of(p) != block {
            continue;
        }
        if is_scheduled_op(g, p) {
            if !deps.contains(&p) {
                deps.push(p);
            }
        } else {
            stack.extend(g.ins(p).iter().copied());
        }
    }
    deps
}

/// Schedule every reachable block of the graph.
pub fn schedule_graph(g: &mut Graph, state: &mut BeState) -> BackendResult<()> {
    // block layout: reverse post-order from the start block
    let mut order = Vec::new();
    {
        let mut visited = FxHashSet::default();
        let mut stack = vec![(g.start_block(), false)];
        while let Some((b, processed)) = stack.pop() {
            if processed {
                order.push(b);
                continue;
            }
            if !visited.insert(b) {
                continue;
            }
            stack.push((b, true));
            for s in g.block_succs(b) {
                stack.push((s, false));
            }
        }
        order.reverse();
    }
    state.block_order = order.clone();
    state.block_index = order
        .iter()
        .enumerate()
        .map(|(i, &b)| (b, i))
        .collect();

    for block in order {
        let list = schedule_block(g, block);
        state.schedule.insert(block, list);
    }
    Ok(())
}

fn schedule_block(g: &Graph, block: NodeId) -> Vec<NodeId> {
    let members: Vec<NodeId> = g
        .block_members(block)
        .iter()
        .copied()
        .filter(|&m| !g.is_bad(m) && is_scheduled_op(g, m))
        .collect();

    let mut phis = Vec::new();
    let mut keeps = Vec::new();
    let mut cf = Vec::new();
    let mut body = Vec::new();
    for &m in &members {
        match g.op(m) {
            Op::Phi { .. } => phis.push(m),
            Op::Keep => keeps.push(m),
            _ if is_cf_op(g, m) => cf.push(m),
            _ => body.push(m),
        }
    }

    // topological order over the body
    let mut deps: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
    let mut pending: FxHashMap<NodeId, usize> = FxHashMap::default();
    for &n in body.iter().chain(cf.iter()) {
        let d: Vec<NodeId> = block_deps(g, block, n)
            .into_iter()
            .filter(|&p| !g.is_phi(p) && !matches!(g.op(p), Op::Keep))
            .collect();
        pending.insert(n, d.len());
        deps.insert(n, d);
    }

    let mut list = phis;
    let mut emitted: FxHashSet<NodeId> = list.iter().copied().collect();
    let mut ready: Vec<NodeId> = body
        .iter()
        .copied()
        .filter(|n| pending[n] == 0)
        .collect();
    while let Some(n) = ready.pop() {
        if emitted.contains(&n) {
            continue;
        }
        emitted.insert(n);
        list.push(n);
        for (&user, d) in deps.iter() {
            if d.contains(&n) && !emitted.contains(&user) && !is_cf_op(g, user) {
                let left = pending.get_mut(&user).unwrap();
                *left = left.saturating_sub(1);
                if *left == 0 {
                    ready.push(user);
                }
            }
        }
    }
    // stragglers keep their pool order; cyclic data deps cannot happen in
    // a verified graph
    for n in body {
        if !emitted.contains(&n) {
            emitted.insert(n);
            list.push(n);
        }
    }

    // keeps go right after their anchor
    for k in keeps {
        let anchor = g.input(k, 0);
        match list.iter().position(|&n| n == anchor) {
            Some(pos) => list.insert(pos + 1, k),
            None => list.push(k),
        }
    }

    // one control-flow operation at the tail
    for c in cf {
        list.push(c);
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::be::amd64::Amd64;
    use crate::be::select;
    use crate::be::target::Target;
    use crate::init::InitParams;
    use crate::ir::build::Builder;
    use crate::ir::mode::Mode;
    use crate::ir::prog::Program;
    use crate::ir::ty::MethodProps;

    #[test]
    fn schedule_orders_deps_and_terminator() {
        let prog = Program::new(InitParams::host());
        let i64t = prog.new_primitive_type(Mode::Is64);
        let mty = prog.new_method_type(vec![i64t; 2], vec![i64t], MethodProps::empty());
        let ent = prog.new_global_entity("sched", mty);
        let mut g = prog.new_graph(ent, 0);
        {
            let mut b = Builder::new(&mut g);
            let a0 = b.arg(0, Mode::Is64);
            let a1 = b.arg(1, Mode::Is64);
            let sum = b.add(a0, a1).unwrap();
            let twice = b.add(sum, sum).unwrap();
            b.ret(&[twice]).unwrap();
            b.finalize().unwrap();
        }
        let target = Amd64::new();
        target.lower_for_target(&mut g).unwrap();
        select::select_graph(&mut g, &target).unwrap();
        let mut state = BeState::new();
        schedule_graph(&mut g, &mut state).unwrap();

        let start_sched = &state.schedule[&g.start_block()];
        assert!(!start_sched.is_empty());
        // every node's scheduled deps come earlier
        for (i, &n) in start_sched.iter().enumerate() {
            for d in block_deps(&g, g.start_block(), n) {
                let dpos = start_sched.iter().position(|&x| x == d).unwrap();
                assert!(dpos < i, "dependency scheduled after its user");
            }
        }
        // the block terminator is last
        let last = *start_sched.last().unwrap();
        assert!(is_cf_op(&g, last));
        // exactly one control-flow op
        assert_eq!(
            start_sched.iter().filter(|&&n| is_cf_op(&g, n)).count(),
            1
        );
    }
}
