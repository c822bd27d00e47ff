//! Dead node elimination.
//!
//! Nodes are never freed individually; passes detach them and this pass
//! collects everything unreachable from the End node and its keep-alive
//! edges. `remove_bads` additionally strips Bad control predecessors from
//! blocks and their phis, which is how branches folded to constants
//! finally disappear.

use crate::ir::graph::{Graph, GraphProps};
use crate::ir::node::{NodeId, Op};

/// Kill every node not reachable from End (following inputs and owning
/// blocks). The graph's sentinels always survive.
pub fn dead_node_elimination(g: &mut Graph) {
    g.inc_visited();
    let mut worklist = vec![g.end()];
    for id in [
        g.start(),
        g.start_block(),
        g.end_block(),
        g.no_mem(),
        g.frame(),
    ] {
        worklist.push(id);
    }
    while let Some(n) = worklist.pop() {
        if g.is_visited(n) {
            continue;
        }
        g.mark_visited(n);
        for &pred in g.ins(n).to_vec().iter() {
            worklist.push(pred);
        }
        let block = g.block_of(n);
        if block != n {
            worklist.push(block);
        }
    }
    for id in g.ids().collect::<Vec<_>>() {
        if !g.is_visited(id) && !g.is_bad(id) {
            g.kill(id);
        }
    }
    g.confirm(GraphProps::NO_BADS | GraphProps::LCSSA);
}

/// Remove Bad control predecessors from blocks (and the corresponding phi
/// inputs), unreachable blocks, and Bad or duplicate keep-alive edges.
pub fn remove_bads(g: &mut Graph) {
    // strip Bad inputs from block arities, keeping phis in sync
    for block in g.blocks() {
        if block == g.start_block() {
            continue;
        }
        let bad_positions: Vec<usize> = g
            .ins(block)
            .iter()
            .enumerate()
            .filter(|&(_, &p)| g.is_bad(p))
            .map(|(i, _)| i)
            .collect();
        if bad_positions.is_empty() {
            continue;
        }
        let phis: Vec<NodeId> = g
            .block_members(block)
            .iter()
            .copied()
            .filter(|&m| g.is_phi(m))
            .collect();
        for &pos in bad_positions.iter().rev() {
            for &phi in &phis {
                if pos < g.arity(phi) {
                    g.remove_input(phi, pos);
                }
            }
            g.remove_input(block, pos);
        }
        // single-predecessor phis collapse to their operand
        if g.arity(block) == 1 {
            for phi in phis {
                if g.is_bad(phi) || g.arity(phi) != 1 {
                    continue;
                }
                if let Op::Phi { loop_: true } = g.op(phi) {
                    g.remove_keep_alive(phi);
                }
                let operand = g.input(phi, 0);
                g.exchange(phi, operand);
            }
        }
    }

    // blocks that lost every predecessor are unreachable
    for block in g.blocks() {
        if block == g.start_block() || block == g.end_block() {
            continue;
        }
        if g.arity(block) == 0 {
            for m in g.block_members(block).to_vec() {
                if !g.is_bad(m) {
                    g.kill(m);
                }
            }
            g.kill(block);
        }
    }

    // keep-alives: drop Bads and doublets
    let end = g.end();
    let mut seen = rustc_hash::FxHashSet::default();
    let keeps: Vec<NodeId> = g.ins(end).to_vec();
    let mut fresh = Vec::new();
    for k in keeps {
        if g.is_bad(k) || !seen.insert(k) {
            continue;
        }
        fresh.push(k);
    }
    g.set_inputs(end, &fresh);

    dead_node_elimination(g);
}

/// Bypass loads whose value is never used: their memory proj forwards to
/// the load's memory input and the load dies.
pub fn remove_dead_loads(g: &mut Graph) {
    for id in g.ids().collect::<Vec<_>>() {
        if g.is_bad(id) || !matches!(g.op(id), Op::Load(_)) {
            continue;
        }
        let mut res_used = false;
        let mut mem_projs = Vec::new();
        for &(user, _) in g.outs(id) {
            if let Op::Proj(num) = g.op(user) {
                if *num == crate::ir::node::pn::load::RES && g.n_outs(user) > 0 {
                    res_used = true;
                }
                if *num == crate::ir::node::pn::load::M {
                    mem_projs.push(user);
                }
            }
        }
        if res_used {
            continue;
        }
        let mem = g.input(id, 0);
        for mp in mem_projs {
            g.exchange(mp, mem);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::InitParams;
    use crate::ir::mode::Mode;
    use crate::ir::prog::Program;
    use crate::ir::tarval::Tarval;
    use crate::ir::ty::MethodProps;

    fn graph() -> Graph {
        let prog = Program::new(InitParams::host());
        let mty = prog.new_method_type(vec![], vec![], MethodProps::empty());
        let ent = prog.new_global_entity("dce", mty);
        prog.new_graph(ent, 0)
    }

    #[test]
    fn unreachable_nodes_are_collected() {
        let mut g = graph();
        let b = g.start_block();
        let dead = g.add_raw(
            Op::Const(Tarval::from_i64(5, Mode::Is32)),
            Mode::Is32,
            b,
            &[],
        );
        let kept = g.add_raw(
            Op::Const(Tarval::from_i64(6, Mode::Is32)),
            Mode::Is32,
            b,
            &[],
        );
        let ret = g.add_raw(Op::Return, Mode::X, b, &[g.no_mem(), kept]);
        let end_block = g.end_block();
        g.add_input(end_block, ret);
        dead_node_elimination(&mut g);
        assert!(g.is_bad(dead));
        assert!(!g.is_bad(kept));
    }

    #[test]
    fn keep_alive_protects_nodes() {
        let mut g = graph();
        let b = g.start_block();
        let orphan = g.add_raw(
            Op::Const(Tarval::from_i64(5, Mode::Is32)),
            Mode::Is32,
            b,
            &[],
        );
        g.keep_alive(orphan);
        dead_node_elimination(&mut g);
        assert!(!g.is_bad(orphan));
    }

    #[test]
    fn bad_block_inputs_are_stripped() {
        let mut g = graph();
        let jmp = g.add_raw(Op::Jmp, Mode::X, g.start_block(), &[]);
        let bad = g.add_raw(Op::Bad, Mode::Bad, g.start_block(), &[]);
        let b = g.new_block(&[jmp, bad]);
        let x = g.add_raw(
            Op::Const(Tarval::from_i64(1, Mode::Is32)),
            Mode::Is32,
            g.start_block(),
            &[],
        );
        let y = g.add_raw(
            Op::Const(Tarval::from_i64(2, Mode::Is32)),
            Mode::Is32,
            g.start_block(),
            &[],
        );
        let phi = g.add_raw(Op::Phi { loop_: false }, Mode::Is32, b, &[x, y]);
        let ret = g.add_raw(Op::Return, Mode::X, b, &[g.no_mem(), phi]);
        let end_block = g.end_block();
        g.add_input(end_block, ret);

        remove_bads(&mut g);
        assert_eq!(g.arity(b), 1);
        // the phi collapsed to its surviving operand
        assert_eq!(g.input(ret, 1), x);
    }
}
