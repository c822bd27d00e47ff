//! Prologue/epilogue insertion and stack-pointer simulation.
//!
//! One `IncSP +size` lands right after the entry's phis, one
//! `IncSP -size` before every return; a zero-sized frame gets neither.
//! The simulation then walks each schedule tracking the stack-pointer
//! displacement and resolves frame entities to sp-relative offsets.

use crate::ir::graph::Graph;
use crate::ir::node::Op;

use super::target::Target;
use super::BeState;

pub fn finish_stack(g: &mut Graph, target: &dyn Target, state: &mut BeState) {
    let size = state.frame_size as i32;
    if size != 0 {
        // prologue
        let start_block = g.start_block();
        let incsp = target.new_incsp(g, start_block, size);
        let sched = state.schedule.entry(start_block).or_default();
        let insert_at = sched
            .iter()
            .position(|&n| !g.is_phi(n))
            .unwrap_or(sched.len());
        sched.insert(insert_at, incsp);

        // epilogues
        for &b in &state.block_order.clone() {
            let rets: Vec<_> = state.schedule[&b]
                .iter()
                .copied()
                .filter(|&n| matches!(g.op(n), Op::Mach(a) if a.opcode.is_cf && a.opcode.name == "ret"))
                .collect();
            for ret in rets {
                let dec = target.new_incsp(g, b, -size);
                state.sched_add_before(b, ret, dec);
            }
        }
    }

    // stack-pointer simulation: frame-relative references become
    // sp-relative
    for &b in &state.block_order.clone() {
        let mut sp_offset = 0i64;
        for &n in &state.schedule[&b].clone() {
            let Op::Mach(attr) = g.op(n) else { continue };
            if attr.opcode.is_incsp {
                sp_offset += attr.imm.map(|t| t.as_i64()).unwrap_or(0);
                continue;
            }
            if let Some(ent) = attr.frame_entity {
                // entities are addressed from the post-prologue sp; a
                // moved sp inside the block shifts the displacement
                let base = g.prog().entity_offset(ent).max(0) as i64;
                let shift = if b == g.start_block() {
                    state.frame_size as i64 - sp_offset
                } else {
                    0
                };
                if let Op::Mach(attr) = &mut g.nodes[n.idx()].op {
                    attr.frame_offset = Some((base + shift) as i32);
                }
            }
        }
    }
}
