//! Value liveness for the middle end.
//!
//! Per-block live-in/live-out sets from a backward dataflow over the
//! block order the dominance analysis already provides, plus a use count
//! per value. SSA makes the block summaries cheap: a value is
//! upward-exposed exactly when a block uses it without defining it, and
//! a phi reads its operand at the end of the matching predecessor, so
//! the operand is live out of that block without being live into the
//! phi's own block.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::graph::Graph;
use crate::ir::node::NodeId;

/// Values whose lifetime the middle end reasons about.
fn is_tracked(g: &Graph, n: NodeId) -> bool {
    !g.is_bad(n) && !g.is_block(n) && g.mode(n).is_data()
}

/// Per-value liveness over the blocks of one graph.
pub struct Liveness {
    live_in: FxHashMap<NodeId, FxHashSet<NodeId>>,
    live_out: FxHashMap<NodeId, FxHashSet<NodeId>>,
    uses: FxHashMap<NodeId, u32>,
}

impl Liveness {
    pub fn is_live_in(&self, block: NodeId, value: NodeId) -> bool {
        self.live_in
            .get(&block)
            .map(|s| s.contains(&value))
            .unwrap_or(false)
    }

    pub fn is_live_out(&self, block: NodeId, value: NodeId) -> bool {
        self.live_out
            .get(&block)
            .map(|s| s.contains(&value))
            .unwrap_or(false)
    }

    pub fn live_out(&self, block: NodeId) -> Option<&FxHashSet<NodeId>> {
        self.live_out.get(&block)
    }

    pub fn live_in(&self, block: NodeId) -> Option<&FxHashSet<NodeId>> {
        self.live_in.get(&block)
    }

    /// How often the value appears as an operand (phi operands included,
    /// the definition itself not).
    pub fn use_count(&self, value: NodeId) -> u32 {
        self.uses.get(&value).copied().unwrap_or(0)
    }

    /// Whether the value is alive across any block boundary.
    pub fn crosses_blocks(&self, value: NodeId) -> bool {
        self.live_out.values().any(|s| s.contains(&value))
    }
}

/// What one block contributes to the dataflow.
#[derive(Default)]
struct BlockSummary {
    /// Used before any local definition can supply it.
    upward: FxHashSet<NodeId>,
    /// Defined here.
    defs: FxHashSet<NodeId>,
}

/// Compute value liveness for `g`. Requires consistent dominance: the
/// sweep runs over the dominance analysis' reverse post-order.
pub fn compute(g: &Graph) -> Liveness {
    let order = g.dom_tree().order.clone();

    let mut uses: FxHashMap<NodeId, u32> = FxHashMap::default();
    let mut summaries: FxHashMap<NodeId, BlockSummary> = FxHashMap::default();
    // values a successor phi pulls out of a predecessor block
    let mut edge_uses: FxHashMap<NodeId, FxHashSet<NodeId>> = FxHashMap::default();

    for &block in &order {
        let summary = summaries.entry(block).or_default();
        for &n in g.block_members(block) {
            if g.is_bad(n) {
                continue;
            }
            if is_tracked(g, n) {
                summary.defs.insert(n);
            }
            if g.is_phi(n) {
                for (slot, &operand) in g.ins(n).iter().enumerate() {
                    if slot >= g.arity(block) || !is_tracked(g, operand) {
                        continue;
                    }
                    *uses.entry(operand).or_insert(0) += 1;
                    let pred = g.cfg_pred_block(block, slot);
                    edge_uses.entry(pred).or_default().insert(operand);
                }
            } else {
                for &operand in g.ins(n) {
                    if !is_tracked(g, operand) {
                        continue;
                    }
                    *uses.entry(operand).or_insert(0) += 1;
                    // in SSA, a use the block also defines is never
                    // upward-exposed
                    if g.block_of(operand) != block {
                        summary.upward.insert(operand);
                    }
                }
            }
        }
    }

    let mut lv = Liveness {
        live_in: FxHashMap::default(),
        live_out: FxHashMap::default(),
        uses,
    };
    let mut changed = true;
    while changed {
        changed = false;
        for &block in order.iter().rev() {
            let mut out: FxHashSet<NodeId> = edge_uses
                .get(&block)
                .cloned()
                .unwrap_or_default();
            for succ in g.block_succs(block) {
                if let Some(succ_in) = lv.live_in.get(&succ) {
                    out.extend(succ_in.iter().copied());
                }
            }
            let summary = &summaries[&block];
            let mut live: FxHashSet<NodeId> = out
                .iter()
                .copied()
                .filter(|v| !summary.defs.contains(v))
                .collect();
            live.extend(summary.upward.iter().copied());
            if lv.live_out.get(&block) != Some(&out) || lv.live_in.get(&block) != Some(&live)
            {
                lv.live_out.insert(block, out);
                lv.live_in.insert(block, live);
                changed = true;
            }
        }
    }
    lv
}
