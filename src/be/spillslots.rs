//! Spill-slot assignment and coalescing.
//!
//! Every spilled value gets a frame entity; spills of the same value
//! share one slot, and reloads inherit the entity of the spill their
//! memory input reaches. Afterwards the frame type is laid out by
//! ascending alignment and the final frame size is known.

use std::io::Write;

use rustc_hash::FxHashMap;

use crate::ir::graph::Graph;
use crate::ir::node::{NodeId, Op};
use crate::ir::ty::EntityId;

use super::BeState;

pub fn assign_spill_slots(g: &mut Graph, state: &mut BeState, diag: &mut dyn Write) {
    let frame = g.frame_type();
    let pointer_size = g.prog().params().pointer_size;
    let mut slot_of_value: FxHashMap<NodeId, EntityId> = FxHashMap::default();
    let mut entity_of_spill: FxHashMap<NodeId, EntityId> = FxHashMap::default();

    // spills first: one slot per distinct spilled value
    for &b in &state.block_order {
        for &n in &state.schedule[&b] {
            let Op::Mach(attr) = g.op(n) else { continue };
            if !attr.opcode.is_spill {
                continue;
            }
            let value = g.input(n, 0);
            let ent = *slot_of_value.entry(value).or_insert_with(|| {
                g.prog()
                    .store()
                    .frame_alloc_entity(frame, pointer_size, pointer_size)
            });
            entity_of_spill.insert(n, ent);
            if let Op::Mach(attr) = &mut g.nodes[n.idx()].op {
                attr.frame_entity = Some(ent);
            }
        }
    }

    // reloads read the entity of the spill their memory input reaches
    for &b in &state.block_order.clone() {
        for &n in &state.schedule[&b].clone() {
            let Op::Mach(attr) = g.op(n) else { continue };
            if !attr.opcode.is_reload {
                continue;
            }
            match find_spill_entity(g, g.input(n, 0), &entity_of_spill, 0) {
                Some(ent) => {
                    if let Op::Mach(attr) = &mut g.nodes[n.idx()].op {
                        attr.frame_entity = Some(ent);
                    }
                }
                None => {
                    let _ = writeln!(
                        diag,
                        "spillslots: reload {:?} does not reach a spill",
                        n
                    );
                }
            }
        }
    }

    g.prog().store().layout_compound(frame);
    let align = g.prog().params().stack_param_align.max(1);
    let size = g.prog().type_size(frame);
    state.frame_size = (size + align - 1) & !(align - 1);
    log::debug!(
        "spillslots: {} slots, frame size {} bytes",
        slot_of_value.len(),
        state.frame_size
    );
}

/// Follow the memory input through memory phis to the defining spill.
fn find_spill_entity(
    g: &Graph,
    mem: NodeId,
    entity_of_spill: &FxHashMap<NodeId, EntityId>,
    depth: u32,
) -> Option<EntityId> {
    if depth > 64 {
        return None;
    }
    if let Some(&ent) = entity_of_spill.get(&mem) {
        return Some(ent);
    }
    if g.is_phi(mem) {
        for i in 0..g.arity(mem) {
            if let Some(ent) =
                find_spill_entity(g, g.input(mem, i), entity_of_spill, depth + 1)
            {
                return Some(ent);
            }
        }
    }
    None
}
