//! Instruction selection driver.
//!
//! The target replaces generic opcodes with machine nodes carrying
//! register requirements; this walker merely feeds it every node that
//! still carries a generic opcode after lowering, bottom-up so operands
//! are selected before their users.

use crate::error::BackendResult;
use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, Op};

use super::target::Target;

/// Opcodes the selection walker hands to the target.
pub fn needs_selection(op: &Op) -> bool {
    matches!(
        op,
        Op::Const(_)
            | Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Minus
            | Op::And
            | Op::Or
            | Op::Eor
            | Op::Not
            | Op::Shl
            | Op::Shr
            | Op::Shrs
            | Op::Conv
            | Op::Cmp(_)
            | Op::Cond
            | Op::Jmp
            | Op::Mux
            | Op::Load(_)
            | Op::Store(_)
            | Op::Call(_)
            | Op::Return
            | Op::Alloc(_)
            | Op::Member(_)
            | Op::Sel(_)
            | Op::Address(_)
    )
}

/// Run selection over the whole graph.
pub fn select_graph(g: &mut Graph, target: &dyn Target) -> BackendResult<()> {
    // bottom-up: operands first, so the target sees selected inputs
    g.inc_visited();
    let mut order: Vec<NodeId> = Vec::new();
    let mut stack: Vec<(NodeId, bool)> = vec![(g.end(), false)];
    while let Some((n, processed)) = stack.pop() {
        if processed {
            order.push(n);
            continue;
        }
        if g.is_visited(n) {
            continue;
        }
        g.mark_visited(n);
        stack.push((n, true));
        for &pred in g.ins(n).to_vec().iter() {
            stack.push((pred, false));
        }
        let block = g.block_of(n);
        if block != n {
            stack.push((block, false));
        } else {
            // phis anchor loop values that no forward walk reaches
            for &m in g.block_members(n).to_vec().iter() {
                if g.is_phi(m) {
                    stack.push((m, false));
                }
            }
        }
    }

    for n in order {
        if g.is_bad(n) {
            continue;
        }
        if needs_selection(g.op(n)) {
            target.select_node(g, n)?;
        }
    }
    Ok(())
}
