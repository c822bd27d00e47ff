//! Dominance and post-dominance.
//!
//! Cooper-Harvey-Kennedy iterative idom computation over a reverse
//! post-order of the block CFG. Post-dominance runs the same machinery on
//! the reversed CFG rooted at the end block.

use rustc_hash::FxHashMap;

use crate::ir::graph::Graph;
use crate::ir::node::NodeId;

/// Immediate-dominator tree over blocks.
#[derive(Debug)]
pub struct DomTree {
    idom: FxHashMap<NodeId, NodeId>,
    depth: FxHashMap<NodeId, u32>,
    /// Reverse post-order of reachable blocks; the root comes first.
    pub order: Vec<NodeId>,
}

impl DomTree {
    pub fn idom(&self, block: NodeId) -> Option<NodeId> {
        let id = self.idom.get(&block).copied()?;
        if id == block {
            None
        } else {
            Some(id)
        }
    }

    pub fn depth(&self, block: NodeId) -> u32 {
        self.depth.get(&block).copied().unwrap_or(0)
    }

    pub fn is_reachable(&self, block: NodeId) -> bool {
        self.idom.contains_key(&block)
    }

    /// Strict or reflexive dominance test: `a` dominates `b`.
    pub fn dominates(&self, a: NodeId, b: NodeId) -> bool {
        let (Some(&da), Some(&db)) = (self.depth.get(&a), self.depth.get(&b)) else {
            return false;
        };
        let mut cur = b;
        let mut cur_depth = db;
        while cur_depth > da {
            cur = self.idom[&cur];
            cur_depth = self.depth[&cur];
        }
        cur == a
    }
}

/// Reverse post-order of blocks from `root` following `succs`.
fn rpo_blocks(
    root: NodeId,
    succs: &FxHashMap<NodeId, Vec<NodeId>>,
) -> Vec<NodeId> {
    let mut post = Vec::new();
    let mut visited: rustc_hash::FxHashSet<NodeId> = rustc_hash::FxHashSet::default();
    let mut stack = vec![(root, false)];
    while let Some((block, processed)) = stack.pop() {
        if processed {
            post.push(block);
            continue;
        }
        if !visited.insert(block) {
            continue;
        }
        stack.push((block, true));
        if let Some(ss) = succs.get(&block) {
            for &s in ss {
                stack.push((s, false));
            }
        }
    }
    post.reverse();
    post
}

fn compute(root: NodeId, succs: FxHashMap<NodeId, Vec<NodeId>>) -> DomTree {
    let order = rpo_blocks(root, &succs);
    let mut index: FxHashMap<NodeId, usize> = FxHashMap::default();
    for (i, &b) in order.iter().enumerate() {
        index.insert(b, i);
    }
    // predecessor lists restricted to reachable blocks
    let mut preds: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
    for &b in &order {
        if let Some(ss) = succs.get(&b) {
            for &s in ss {
                if index.contains_key(&s) {
                    preds.entry(s).or_default().push(b);
                }
            }
        }
    }

    let mut idom: FxHashMap<NodeId, NodeId> = FxHashMap::default();
    idom.insert(root, root);

    let intersect = |idom: &FxHashMap<NodeId, NodeId>,
                     index: &FxHashMap<NodeId, usize>,
                     mut a: NodeId,
                     mut b: NodeId| {
        while a != b {
            while index[&a] > index[&b] {
                a = idom[&a];
            }
            while index[&b] > index[&a] {
                b = idom[&b];
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &b in order.iter().skip(1) {
            let Some(ps) = preds.get(&b) else { continue };
            let mut new_idom: Option<NodeId> = None;
            for &p in ps {
                if !idom.contains_key(&p) {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(&idom, &index, p, cur),
                });
            }
            if let Some(ni) = new_idom {
                if idom.get(&b) != Some(&ni) {
                    idom.insert(b, ni);
                    changed = true;
                }
            }
        }
    }

    let mut depth: FxHashMap<NodeId, u32> = FxHashMap::default();
    depth.insert(root, 0);
    for &b in order.iter().skip(1) {
        if let Some(&id) = idom.get(&b) {
            let d = depth.get(&id).copied().unwrap_or(0) + 1;
            depth.insert(b, d);
        }
    }

    DomTree { idom, depth, order }
}

/// Dominance from the start block.
pub fn compute_doms(g: &Graph) -> DomTree {
    let mut succs: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
    for b in g.blocks() {
        succs.insert(b, g.block_succs(b));
    }
    compute(g.start_block(), succs)
}

/// Post-dominance from the end block, over the reversed CFG.
pub fn compute_postdoms(g: &Graph) -> DomTree {
    let mut rsuccs: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
    for b in g.blocks() {
        for s in g.block_succs(b) {
            rsuccs.entry(s).or_default().push(b);
        }
    }
    compute(g.end_block(), rsuccs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_of(edges: &[(u32, u32)], root: u32) -> DomTree {
        let mut succs: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
        for &(a, b) in edges {
            succs.entry(NodeId(a)).or_default().push(NodeId(b));
        }
        compute(NodeId(root), succs)
    }

    #[test]
    fn diamond_idoms() {
        // 0 -> 1, 0 -> 2, 1 -> 3, 2 -> 3
        let t = tree_of(&[(0, 1), (0, 2), (1, 3), (2, 3)], 0);
        assert_eq!(t.idom(NodeId(1)), Some(NodeId(0)));
        assert_eq!(t.idom(NodeId(2)), Some(NodeId(0)));
        assert_eq!(t.idom(NodeId(3)), Some(NodeId(0)));
        assert!(t.dominates(NodeId(0), NodeId(3)));
        assert!(!t.dominates(NodeId(1), NodeId(3)));
        assert!(t.dominates(NodeId(3), NodeId(3)));
    }

    #[test]
    fn loop_idoms() {
        // 0 -> 1 -> 2 -> 1, 1 -> 3
        let t = tree_of(&[(0, 1), (1, 2), (2, 1), (1, 3)], 0);
        assert_eq!(t.idom(NodeId(2)), Some(NodeId(1)));
        assert!(t.dominates(NodeId(1), NodeId(2)));
        assert!(t.dominates(NodeId(1), NodeId(3)));
    }

    #[test]
    fn unreachable_blocks_are_not_dominated() {
        let t = tree_of(&[(0, 1)], 0);
        assert!(!t.dominates(NodeId(0), NodeId(9)));
        assert!(!t.is_reachable(NodeId(9)));
    }
}
