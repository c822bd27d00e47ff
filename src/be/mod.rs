//! The back-end pipeline.
//!
//! Per procedure, in order: target lowering, instruction selection, list
//! scheduling, register allocation, two-address fix-up, spill-slot
//! coalescing, prologue/epilogue insertion with stack-pointer simulation,
//! peephole finalization and emission. The verifier runs between stages;
//! its findings are written to the diagnostic stream and never abort the
//! pipeline.

pub mod amd64;
pub mod emit;
pub mod regalloc;
pub mod regfile;
pub mod sched;
pub mod select;
pub mod session;
pub mod spillslots;
pub mod stack;
pub mod target;
pub mod twoaddr;
pub mod verify;

use std::io::Write;

use rustc_hash::FxHashMap;

use crate::error::BackendResult;
use crate::ir::graph::Graph;
use crate::ir::node::NodeId;

pub use target::{Reg, Target, TargetRegistry};

/// Mutable per-procedure back-end state threaded through the stages.
pub struct BeState {
    /// Blocks in emission order.
    pub block_order: Vec<NodeId>,
    /// Emission index per block, for branch targets.
    pub block_index: FxHashMap<NodeId, usize>,
    /// Scheduled nodes per block; phis first, one control-flow op last.
    pub schedule: FxHashMap<NodeId, Vec<NodeId>>,
    /// Output register of every value-producing scheduled node.
    pub regs: FxHashMap<NodeId, Reg>,
    /// Final frame size in bytes, known after spill-slot coalescing.
    pub frame_size: u32,
}

impl BeState {
    pub fn new() -> BeState {
        BeState {
            block_order: Vec::new(),
            block_index: FxHashMap::default(),
            schedule: FxHashMap::default(),
            regs: FxHashMap::default(),
            frame_size: 0,
        }
    }

    pub fn reg_of(&self, n: NodeId) -> Option<Reg> {
        self.regs.get(&n).copied()
    }

    /// Position of a node inside its block's schedule.
    pub fn sched_pos(&self, block: NodeId, n: NodeId) -> Option<usize> {
        self.schedule.get(&block)?.iter().position(|&s| s == n)
    }

    /// Insert `node` into the schedule directly before `before`.
    pub fn sched_add_before(&mut self, block: NodeId, before: NodeId, node: NodeId) {
        let list = self.schedule.entry(block).or_default();
        let pos = list.iter().position(|&s| s == before).unwrap_or(0);
        list.insert(pos, node);
    }

    /// Insert `node` into the schedule directly after `after`.
    pub fn sched_add_after(&mut self, block: NodeId, after: NodeId, node: NodeId) {
        let list = self.schedule.entry(block).or_default();
        match list.iter().position(|&s| s == after) {
            Some(pos) => list.insert(pos + 1, node),
            None => list.push(node),
        }
    }

    /// Replace `old` by `new` at its schedule position.
    pub fn sched_replace(&mut self, block: NodeId, old: NodeId, new: NodeId) {
        if let Some(list) = self.schedule.get_mut(&block) {
            if let Some(pos) = list.iter().position(|&s| s == old) {
                list[pos] = new;
            }
        }
    }

    pub fn sched_remove(&mut self, block: NodeId, node: NodeId) {
        if let Some(list) = self.schedule.get_mut(&block) {
            list.retain(|&s| s != node);
        }
    }
}

impl Default for BeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the whole pipeline for one procedure, writing assembly to `out`
/// and verifier findings to `diag`.
pub fn generate_code(
    g: &mut Graph,
    target: &dyn Target,
    out: &mut dyn Write,
    diag: &mut dyn Write,
) -> BackendResult<()> {
    let session = session::CodegenSession::new();
    target.init();

    // 1. target lowering of constructs the ISA cannot express directly
    target.lower_for_target(g)?;

    // 2. instruction selection
    select::select_graph(g, target)?;
    let _ = g.verify(diag);

    // 3. scheduling
    let mut state = BeState::new();
    sched::schedule_graph(g, &mut state)?;
    verify::verify_schedule(g, &state, diag);

    // 4. register allocation
    regalloc::allocate(g, target, &mut state, &session)?;
    verify::verify_register_allocation(g, target, &state, diag);
    verify::verify_register_pressure(g, target, &state, diag);

    // 5. two-address fix-up
    twoaddr::handle_2addr(g, target, &mut state);
    verify::verify_nodes(g, target, &state, diag);

    // 6. spill slots and frame layout
    spillslots::assign_spill_slots(g, &mut state, diag);

    // 7. prologue/epilogue and stack simulation
    stack::finish_stack(g, target, &mut state);

    // 8. target peepholes
    target.peephole(g, &mut state);

    // 9. emission
    emit::emit_function(g, target, &state, out)?;
    target.finish();

    log::debug!(
        "generate_code: {} blocks, frame {} bytes, {}",
        state.block_order.len(),
        state.frame_size,
        session.stats()
    );
    Ok(())
}
