//! Two-address fix-up.
//!
//! After allocation, a node whose output is tied to an input by a
//! should-be-same requirement may have ended up with different registers.
//! The target gets the first chance to repair the node in place (operand
//! swap, `sub` to `neg; add`, `shld` to `shrd`); when it declines, the
//! generic driver inserts a copy of the tied input into the output
//! register right before the node.

use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, Op};

use super::target::Target;
use super::BeState;

pub fn handle_2addr(g: &mut Graph, target: &dyn Target, state: &mut BeState) {
    for &b in &state.block_order.clone() {
        for &n in &state.schedule[&b].clone() {
            let Op::Mach(attr) = g.op(n).clone() else {
                continue;
            };
            let Some(out_req) = attr.out_reqs.first().copied() else {
                continue;
            };
            let Some(tied) = out_req.same_as else { continue };
            let Some(out_reg) = state.reg_of(n) else { continue };
            let tied_in = g.input(n, tied as usize);
            if state.reg_of(tied_in) == Some(out_reg) {
                continue;
            }
            if target.handle_2addr(g, state, n, tied as usize, out_reg) {
                continue;
            }
            // fallback: copy the tied operand into the output register
            let copy = insert_tied_copy(g, target, state, b, n, tied as usize, out_reg);
            log::debug!(
                "2addr: inserted copy {:?} for tied input of {:?}",
                copy,
                n
            );
        }
    }
}

fn insert_tied_copy(
    g: &mut Graph,
    target: &dyn Target,
    state: &mut BeState,
    block: NodeId,
    node: NodeId,
    in_idx: usize,
    out_reg: super::target::Reg,
) -> NodeId {
    let src = g.input(node, in_idx);
    let copy = target.new_copy(g, src, block);
    state.regs.insert(copy, out_reg);
    state.sched_add_before(block, node, copy);
    g.set_input(node, in_idx, copy);
    copy
}
