//! Assembly emission.
//!
//! Walks the block layout and hands every scheduled node to the target's
//! emitter. Labels derive from the entity's linker name and the block's
//! position in the layout; the entry block needs none.

use std::io::Write;

use crate::error::BackendResult;
use crate::ir::graph::Graph;
use crate::ir::node::NodeId;

use super::target::Target;
use super::BeState;

/// Label of a block inside its function.
pub fn block_label(g: &Graph, state: &BeState, block: NodeId) -> String {
    let name = g.prog().entity_ld_name(g.entity());
    let idx = state.block_index.get(&block).copied().unwrap_or(0);
    format!(".L{}_{}", name, idx)
}

pub fn emit_function(
    g: &Graph,
    target: &dyn Target,
    state: &BeState,
    out: &mut dyn Write,
) -> BackendResult<()> {
    let name = g.prog().entity_ld_name(g.entity());
    writeln!(out, "\t.text")?;
    writeln!(out, "\t.globl\t{}", name)?;
    writeln!(out, "{}:", name)?;
    for (i, &block) in state.block_order.iter().enumerate() {
        let Some(sched) = state.schedule.get(&block) else {
            continue;
        };
        if sched.is_empty() {
            continue;
        }
        if i > 0 {
            writeln!(out, "{}:", block_label(g, state, block))?;
        }
        for &n in sched {
            target.emit_node(g, state, n, out)?;
        }
    }
    writeln!(out)?;
    Ok(())
}
