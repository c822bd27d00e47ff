//! Loop tree construction.
//!
//! Loop info is computed after dominance, so the discovery leans on it:
//! one walk over the block CFG classifies every cycle-closing edge, and
//! an edge whose target dominates its source is a back edge with the
//! target as loop header. The natural loop of a header is grown
//! backwards from its latches, nesting falls out of body containment,
//! and a cycle-closing edge that fails the dominance test marks the
//! enclosing region irreducible instead of forming a loop.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::graph::Graph;
use crate::ir::node::NodeId;

use super::dom::DomTree;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LoopId(pub u32);

impl LoopId {
    pub const ROOT: LoopId = LoopId(0);

    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub struct LoopInfo {
    pub parent: LoopId,
    pub depth: u32,
    /// The block the loop is entered through; `None` only for the root.
    pub head: Option<NodeId>,
    /// Blocks directly in this loop (not in nested children).
    pub blocks: Vec<NodeId>,
    pub children: Vec<LoopId>,
    pub irreducible: bool,
}

#[derive(Debug)]
pub struct LoopTree {
    pub loops: Vec<LoopInfo>,
    block_loop: FxHashMap<NodeId, LoopId>,
}

impl LoopTree {
    /// Innermost loop containing the block.
    pub fn loop_of_block(&self, block: NodeId) -> LoopId {
        self.block_loop
            .get(&block)
            .copied()
            .unwrap_or(LoopId::ROOT)
    }

    pub fn info(&self, l: LoopId) -> &LoopInfo {
        &self.loops[l.idx()]
    }

    /// Whether `inner` is nested (strictly) inside `outer`.
    pub fn is_inner_loop(&self, outer: LoopId, inner: LoopId) -> bool {
        let mut cur = inner;
        loop {
            let parent = self.loops[cur.idx()].parent;
            if parent == cur {
                return false;
            }
            if parent == outer {
                return true;
            }
            cur = parent;
        }
    }

    /// Whether the block belongs to the loop or one of its children.
    pub fn block_is_inside(&self, block: NodeId, l: LoopId) -> bool {
        if l == LoopId::ROOT {
            return true;
        }
        let bl = self.loop_of_block(block);
        bl == l || self.is_inner_loop(l, bl)
    }

    /// All blocks of the loop including nested loops.
    pub fn all_blocks(&self, l: LoopId) -> Vec<NodeId> {
        let mut out = self.loops[l.idx()].blocks.clone();
        for &c in &self.loops[l.idx()].children {
            out.extend(self.all_blocks(c));
        }
        out
    }

    /// Loops with no nested children, innermost first.
    pub fn innermost_loops(&self) -> Vec<LoopId> {
        (1..self.loops.len() as u32)
            .map(LoopId)
            .filter(|l| self.loops[l.idx()].children.is_empty())
            .collect()
    }

    pub fn n_loops(&self) -> usize {
        self.loops.len()
    }
}

/// A header with the latch blocks of its back edges and the natural loop
/// body grown from them.
struct NaturalLoop {
    header: NodeId,
    body: FxHashSet<NodeId>,
}

/// One depth-first sweep splits the cycle-closing edges: `(latch,
/// header)` pairs where the header dominates the latch, and rogue edges
/// that close a cycle without such a header.
fn classify_cycle_edges(
    g: &Graph,
    dom: &DomTree,
) -> (FxHashMap<NodeId, Vec<NodeId>>, Vec<(NodeId, NodeId)>) {
    let mut latches: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
    let mut rogue = Vec::new();

    const OPEN: u8 = 1;
    const DONE: u8 = 2;
    let mut state: FxHashMap<NodeId, u8> = FxHashMap::default();
    let start = g.start_block();
    let mut stack: Vec<(NodeId, usize)> = vec![(start, 0)];
    state.insert(start, OPEN);
    while let Some(&(block, i)) = stack.last() {
        let succs = g.block_succs(block);
        if i < succs.len() {
            stack.last_mut().unwrap().1 += 1;
            let succ = succs[i];
            match state.get(&succ) {
                Some(&OPEN) => {
                    // the edge closes a cycle through the walk's spine
                    if dom.dominates(succ, block) {
                        latches.entry(succ).or_default().push(block);
                    } else {
                        rogue.push((block, succ));
                    }
                }
                Some(_) => {}
                None => {
                    state.insert(succ, OPEN);
                    stack.push((succ, 0));
                }
            }
        } else {
            state.insert(block, DONE);
            stack.pop();
        }
    }
    (latches, rogue)
}

/// The header plus every block that reaches a latch without passing the
/// header again.
fn natural_loop_body(g: &Graph, dom: &DomTree, header: NodeId, latches: &[NodeId]) -> FxHashSet<NodeId> {
    let mut body = FxHashSet::default();
    body.insert(header);
    let mut worklist: Vec<NodeId> = latches.to_vec();
    while let Some(block) = worklist.pop() {
        if !body.insert(block) {
            continue;
        }
        for i in 0..g.arity(block) {
            let pred = g.cfg_pred_block(block, i);
            if dom.is_reachable(pred) {
                worklist.push(pred);
            }
        }
    }
    body
}

/// Compute the loop tree of `g`. Requires consistent dominance.
pub fn compute_loop_tree(g: &Graph) -> LoopTree {
    let dom = g.dom_tree();
    let mut rpo_index: FxHashMap<NodeId, usize> = FxHashMap::default();
    for (i, &b) in dom.order.iter().enumerate() {
        rpo_index.insert(b, i);
    }

    let (latches, rogue) = classify_cycle_edges(g, dom);

    // outermost loops first, so parents exist before their children
    let mut naturals: Vec<NaturalLoop> = latches
        .into_iter()
        .map(|(header, latches)| NaturalLoop {
            header,
            body: natural_loop_body(g, dom, header, &latches),
        })
        .collect();
    naturals.sort_by(|a, b| {
        b.body
            .len()
            .cmp(&a.body.len())
            .then_with(|| rpo_index[&a.header].cmp(&rpo_index[&b.header]))
    });

    let mut tree = LoopTree {
        loops: vec![LoopInfo {
            parent: LoopId::ROOT,
            depth: 0,
            head: None,
            blocks: Vec::new(),
            children: Vec::new(),
            irreducible: false,
        }],
        block_loop: FxHashMap::default(),
    };

    let mut ids: Vec<LoopId> = Vec::with_capacity(naturals.len());
    for (k, nat) in naturals.iter().enumerate() {
        // the nearest strictly larger body containing our header is the
        // parent; the reverse scan finds the smallest such
        let mut parent = LoopId::ROOT;
        for j in (0..k).rev() {
            if naturals[j].body.len() > nat.body.len() && naturals[j].body.contains(&nat.header)
            {
                parent = ids[j];
                break;
            }
        }
        let id = LoopId(tree.loops.len() as u32);
        let depth = tree.loops[parent.idx()].depth + 1;
        tree.loops.push(LoopInfo {
            parent,
            depth,
            head: Some(nat.header),
            blocks: Vec::new(),
            children: Vec::new(),
            irreducible: false,
        });
        tree.loops[parent.idx()].children.push(id);
        ids.push(id);
    }

    // every block lands in the smallest body containing it
    for &block in &dom.order {
        let mut innermost = LoopId::ROOT;
        for k in (0..naturals.len()).rev() {
            if naturals[k].body.contains(&block) {
                innermost = ids[k];
                break;
            }
        }
        tree.loops[innermost.idx()].blocks.push(block);
        tree.block_loop.insert(block, innermost);
    }

    // cycles without a dominating header poison the loops around them
    for (src, tgt) in rogue {
        let l = match (tree.loop_of_block(tgt), tree.loop_of_block(src)) {
            (l, _) if l != LoopId::ROOT => l,
            (_, l) if l != LoopId::ROOT => l,
            _ => {
                log::debug!(
                    "loops: irreducible cycle through {:?} outside any loop",
                    tgt
                );
                continue;
            }
        };
        tree.loops[l.idx()].irreducible = true;
    }

    tree
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::InitParams;
    use crate::ir::graph::{Graph, GraphProps};
    use crate::ir::mode::Mode;
    use crate::ir::node::Op;
    use crate::ir::prog::Program;
    use crate::ir::ty::MethodProps;

    fn graph() -> Graph {
        let prog = Program::new(InitParams::host());
        let mty = prog.new_method_type(vec![], vec![], MethodProps::empty());
        let ent = prog.new_global_entity("loops", mty);
        prog.new_graph(ent, 0)
    }

    /// start -> header <-> body, header -> exit
    fn build_simple_loop(g: &mut Graph) -> (NodeId, NodeId, NodeId) {
        let start_jmp = g.add_raw(Op::Jmp, Mode::X, g.start_block(), &[]);
        let header = g.new_block(&[start_jmp]);
        let cond_t = g.add_raw(Op::Jmp, Mode::X, header, &[]);
        let cond_f = g.add_raw(Op::Jmp, Mode::X, header, &[]);
        let body = g.new_block(&[cond_t]);
        let back = g.add_raw(Op::Jmp, Mode::X, body, &[]);
        g.add_input(header, back);
        let exit = g.new_block(&[cond_f]);
        let ret = g.add_raw(Op::Return, Mode::X, exit, &[g.no_mem()]);
        let end_block = g.end_block();
        g.add_input(end_block, ret);
        (header, body, exit)
    }

    #[test]
    fn simple_loop_tree() {
        let mut g = graph();
        let (header, body, exit) = build_simple_loop(&mut g);
        g.assure(GraphProps::CONSISTENT_LOOPINFO);
        let tree = g.loop_tree();
        assert_eq!(tree.n_loops(), 2);
        let l = tree.loop_of_block(header);
        assert_ne!(l, LoopId::ROOT);
        assert_eq!(tree.info(l).head, Some(header));
        assert!(tree.block_is_inside(body, l));
        assert_eq!(tree.loop_of_block(exit), LoopId::ROOT);
        assert!(!tree.info(l).irreducible);
        assert_eq!(tree.innermost_loops(), vec![l]);
    }

    #[test]
    fn straight_line_has_only_root() {
        let mut g = graph();
        let jmp = g.add_raw(Op::Jmp, Mode::X, g.start_block(), &[]);
        let b = g.new_block(&[jmp]);
        let ret = g.add_raw(Op::Return, Mode::X, b, &[g.no_mem()]);
        let end_block = g.end_block();
        g.add_input(end_block, ret);
        g.assure(GraphProps::CONSISTENT_LOOPINFO);
        assert_eq!(g.loop_tree().n_loops(), 1);
    }

    #[test]
    fn nested_loops_form_a_tree() {
        let mut g = graph();
        // start -> h1 -> h2 <-> b2, h2 -> b1 -> h1, h1 -> exit
        let start_jmp = g.add_raw(Op::Jmp, Mode::X, g.start_block(), &[]);
        let h1 = g.new_block(&[start_jmp]);
        let h1_in = g.add_raw(Op::Jmp, Mode::X, h1, &[]);
        let h1_out = g.add_raw(Op::Jmp, Mode::X, h1, &[]);
        let h2 = g.new_block(&[h1_in]);
        let h2_in = g.add_raw(Op::Jmp, Mode::X, h2, &[]);
        let h2_out = g.add_raw(Op::Jmp, Mode::X, h2, &[]);
        let b2 = g.new_block(&[h2_in]);
        let b2_back = g.add_raw(Op::Jmp, Mode::X, b2, &[]);
        g.add_input(h2, b2_back);
        let b1 = g.new_block(&[h2_out]);
        let b1_back = g.add_raw(Op::Jmp, Mode::X, b1, &[]);
        g.add_input(h1, b1_back);
        let exit = g.new_block(&[h1_out]);
        let ret = g.add_raw(Op::Return, Mode::X, exit, &[g.no_mem()]);
        let end_block = g.end_block();
        g.add_input(end_block, ret);

        g.assure(GraphProps::CONSISTENT_LOOPINFO);
        let tree = g.loop_tree();
        assert_eq!(tree.n_loops(), 3);
        let outer = tree.loop_of_block(h1);
        let inner = tree.loop_of_block(h2);
        assert_ne!(outer, inner);
        assert_eq!(tree.info(inner).parent, outer);
        assert_eq!(tree.info(inner).depth, 2);
        assert_eq!(tree.info(outer).depth, 1);
        assert!(tree.is_inner_loop(outer, inner));
        assert!(tree.block_is_inside(b2, outer));
        assert!(!tree.block_is_inside(b1, inner));
        assert_eq!(tree.innermost_loops(), vec![inner]);
        assert_eq!(tree.info(outer).children, vec![inner]);
    }

    #[test]
    fn two_entry_cycle_is_not_a_loop() {
        let mut g = graph();
        // start branches into both halves of an a <-> b cycle: neither
        // block dominates the other, so no natural loop exists
        let start_a = g.add_raw(Op::Jmp, Mode::X, g.start_block(), &[]);
        let start_b = g.add_raw(Op::Jmp, Mode::X, g.start_block(), &[]);
        let a = g.new_block(&[start_a]);
        let a_jmp = g.add_raw(Op::Jmp, Mode::X, a, &[]);
        let b = g.new_block(&[start_b, a_jmp]);
        let b_jmp = g.add_raw(Op::Jmp, Mode::X, b, &[]);
        g.add_input(a, b_jmp);
        g.assure(GraphProps::CONSISTENT_LOOPINFO);
        assert_eq!(g.loop_tree().n_loops(), 1);
    }
}
