//! Loop-closed SSA construction.
//!
//! Rewrites the graph so that every value defined inside a loop and used
//! outside of it passes through a phi in the loop's exit block first. Loop
//! transformations then only need to patch those exit phis when they
//! change the loop's iteration structure. Running the construction on an
//! already closed graph changes nothing.

use rustc_hash::FxHashMap;

use crate::ir::graph::{Graph, GraphProps};
use crate::ir::mode::Mode;
use crate::ir::node::{NodeId, Op};

use super::loops::LoopId;

/// Exit blocks of `l`: blocks outside the loop with a control predecessor
/// inside it.
pub fn loop_exit_blocks(g: &Graph, l: LoopId) -> Vec<NodeId> {
    let tree = g.loop_tree();
    let mut exits = Vec::new();
    for b in tree.all_blocks(l) {
        for s in g.block_succs(b) {
            if !tree.block_is_inside(s, l) && !exits.contains(&s) {
                exits.push(s);
            }
        }
    }
    exits
}

/// Establish loop-closed SSA form on the whole graph.
pub fn assure_lcssa(g: &mut Graph) {
    g.assure(GraphProps::CONSISTENT_DOMINANCE | GraphProps::CONSISTENT_LOOPINFO);
    let n_loops = g.loop_tree().n_loops();
    // inner loops first so outer phis can chain on inner ones
    let mut order: Vec<LoopId> = (1..n_loops as u32).map(LoopId).collect();
    order.sort_by_key(|l| std::cmp::Reverse(g.loop_tree().info(*l).depth));
    for l in order {
        close_loop(g, l);
    }
}

fn close_loop(g: &mut Graph, l: LoopId) {
    let exits = loop_exit_blocks(g, l);
    let loop_blocks: Vec<NodeId> = g.loop_tree().all_blocks(l);

    for &block in &loop_blocks {
        let members: Vec<NodeId> = g.block_members(block).to_vec();
        for def in members {
            if g.is_bad(def) {
                continue;
            }
            let mode = g.mode(def);
            if !mode.is_data() && mode != Mode::M {
                continue;
            }
            close_value(g, l, def, &exits);
        }
    }
}

fn close_value(g: &mut Graph, l: LoopId, def: NodeId, exits: &[NodeId]) {
    // users outside the loop, except exit phis that already close the value
    let escapes: Vec<(NodeId, u32)> = g
        .outs(def)
        .iter()
        .copied()
        .filter(|&(user, _)| {
            if g.is_bad(user) || matches!(g.op(user), Op::End | Op::Block) {
                return false;
            }
            let user_block = g.block_of(user);
            if g.loop_tree().block_is_inside(user_block, l) {
                return false;
            }
            // a phi in an exit block whose every input is the value is the
            // closing phi itself
            !(g.is_phi(user) && exits.contains(&user_block))
        })
        .collect();
    if escapes.is_empty() {
        return;
    }

    let def_block = g.block_of(def);
    let mut exit_phis: FxHashMap<NodeId, NodeId> = FxHashMap::default();
    for &exit in exits {
        // only exits whose every control predecessor sees the definition
        let arity = g.arity(exit);
        if arity == 0 {
            continue;
        }
        let all_reached = (0..arity).all(|i| {
            let pred = g.cfg_pred_block(exit, i);
            g.loop_tree().block_is_inside(pred, l)
                && (def_block == pred || g.block_dominates(def_block, pred))
        });
        if !all_reached {
            continue;
        }
        // reuse an existing closing phi
        let existing = g.block_members(exit).iter().copied().find(|&m| {
            g.is_phi(m) && g.mode(m) == g.mode(def) && g.ins(m).iter().all(|&i| i == def)
        });
        let phi = match existing {
            Some(p) => p,
            None => {
                let ins: Vec<NodeId> = (0..arity).map(|_| def).collect();
                let mode = g.mode(def);
                let phi = g.add_raw(Op::Phi { loop_: mode == Mode::M }, mode, exit, &ins);
                if mode == Mode::M {
                    g.keep_alive(phi);
                }
                phi
            }
        };
        exit_phis.insert(exit, phi);
    }
    if exit_phis.is_empty() {
        return;
    }

    for (user, pos) in escapes {
        let user_block = if g.is_phi(user) {
            // a phi uses the value at the end of the corresponding pred
            g.cfg_pred_block(g.block_of(user), pos as usize)
        } else {
            g.block_of(user)
        };
        // route through the exit phi that dominates the use
        let phi = exit_phis
            .iter()
            .find(|&(&exit, _)| exit == user_block || g.block_dominates(exit, user_block))
            .map(|(_, &phi)| phi);
        if let Some(phi) = phi {
            if phi != user {
                g.set_input(user, pos as usize, phi);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::InitParams;
    use crate::ir::prog::Program;
    use crate::ir::tarval::Tarval;
    use crate::ir::ty::MethodProps;

    /// start -> header; header -> body -> header; header -> exit.
    /// The body defines v = phi + 1 which the exit returns.
    fn build_counting_loop() -> (Graph, NodeId, NodeId) {
        let prog = Program::new(InitParams::host());
        let mty = prog.new_method_type(vec![], vec![], MethodProps::empty());
        let ent = prog.new_global_entity("lcssa", mty);
        let mut g = prog.new_graph(ent, 0);

        let start_jmp = g.add_raw(Op::Jmp, Mode::X, g.start_block(), &[]);
        let header = g.new_block(&[start_jmp]);
        let to_body = g.add_raw(Op::Jmp, Mode::X, header, &[]);
        let to_exit = g.add_raw(Op::Jmp, Mode::X, header, &[]);
        let body = g.new_block(&[to_body]);
        let back = g.add_raw(Op::Jmp, Mode::X, body, &[]);
        g.add_input(header, back);
        let exit = g.new_block(&[to_exit]);

        let zero = g.add_raw(
            Op::Const(Tarval::from_i64(0, Mode::Is32)),
            Mode::Is32,
            g.start_block(),
            &[],
        );
        let one = g.add_raw(
            Op::Const(Tarval::from_i64(1, Mode::Is32)),
            Mode::Is32,
            g.start_block(),
            &[],
        );
        let phi = g.add_raw(Op::Phi { loop_: false }, Mode::Is32, header, &[zero, zero]);
        let incr = g.add_raw(Op::Add, Mode::Is32, body, &[phi, one]);
        g.set_input(phi, 1, incr);

        let ret = g.add_raw(Op::Return, Mode::X, exit, &[g.no_mem(), phi]);
        let end_block = g.end_block();
        g.add_input(end_block, ret);
        (g, phi, ret)
    }

    #[test]
    fn escaping_value_gets_exit_phi() {
        let (mut g, phi, ret) = build_counting_loop();
        g.assure(GraphProps::LCSSA);
        let closed = g.input(ret, 1);
        assert_ne!(closed, phi, "use must be rerouted through an exit phi");
        assert!(g.is_phi(closed));
        assert_eq!(g.ins(closed), &[phi]);
    }

    #[test]
    fn lcssa_is_idempotent() {
        let (mut g, _incr, ret) = build_counting_loop();
        g.assure(GraphProps::LCSSA);
        let closed = g.input(ret, 1);
        let nodes_before = g.node_count();
        // force a re-run
        g.confirm(GraphProps::CONSISTENT_DOMINANCE | GraphProps::CONSISTENT_LOOPINFO);
        g.assure(GraphProps::LCSSA);
        assert_eq!(g.node_count(), nodes_before);
        assert_eq!(g.input(ret, 1), closed);
    }
}
