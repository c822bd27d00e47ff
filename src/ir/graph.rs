//! The per-procedure graph.
//!
//! Nodes live in an index-addressed pool owned by the graph; peers refer to
//! each other by [`NodeId`], so the cyclic phi/loop structure needs no
//! shared ownership and the whole pool is reclaimed when the graph drops.
//! Out-edges and block membership are side tables maintained incrementally
//! by node creation, input rewrites and [`Graph::exchange`].
//!
//! Cached properties (dominance, loop tree, ...) follow the declare
//! discipline: a pass calls [`Graph::assure`] with what it requires and
//! [`Graph::confirm`] with what it preserved; the framework recomputes the
//! rest on demand.

use std::hash::{Hash, Hasher};
use std::io::Write;
use std::sync::Arc;

use bitflags::bitflags;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::ana;
use crate::ir::mode::Mode;
use crate::ir::node::{pn, NodeData, NodeId, Op};
use crate::ir::prog::Program;
use crate::ir::ty::{EntityId, TypeId};

bitflags! {
    /// Properties a graph may cache. A set bit means the cached result
    /// precisely reflects the current graph.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct GraphProps: u16 {
        const CONSISTENT_OUTS          = 1 << 0;
        const CONSISTENT_DOMINANCE     = 1 << 1;
        const CONSISTENT_POSTDOMINANCE = 1 << 2;
        const CONSISTENT_LOOPINFO      = 1 << 3;
        const NO_BADS                  = 1 << 4;
        const LCSSA                    = 1 << 5;
    }
}

/// Value-numbering key: opcode + attributes, block (for pinned candidates
/// the slot is unused), mode and input identities in order.
#[derive(PartialEq, Eq, Debug)]
pub(crate) struct VnKey {
    pub op: Op,
    pub mode: Mode,
    pub block: NodeId,
    pub ins: SmallVec<[NodeId; 4]>,
}

impl Hash for VnKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.op).hash(state);
        match &self.op {
            Op::Const(tv) => tv.hash(state),
            Op::Address(e) => e.hash(state),
            Op::Member(e) => e.hash(state),
            Op::Sel(t) => t.hash(state),
            Op::Load(t) | Op::Store(t) | Op::Call(t) => t.hash(state),
            Op::Cmp(r) => r.hash(state),
            Op::Proj(n) => n.hash(state),
            Op::Alloc(a) => a.hash(state),
            _ => {}
        }
        self.mode.hash(state);
        self.block.hash(state);
        self.ins.hash(state);
    }
}

#[derive(Debug)]
pub struct Graph {
    prog: Arc<Program>,
    entity: EntityId,
    frame_type: TypeId,
    pub(crate) nodes: Vec<NodeData>,
    /// Reverse edges: for each node, its users and the input position.
    outs: Vec<Vec<(NodeId, u32)>>,
    /// Nodes owned by each block (the pool index of non-blocks is unused).
    members: Vec<Vec<NodeId>>,
    visited: Vec<u64>,
    visit_epoch: u64,
    pub(crate) vn: FxHashMap<VnKey, NodeId>,
    props: GraphProps,
    pub(crate) dom: Option<ana::dom::DomTree>,
    pub(crate) postdom: Option<ana::dom::DomTree>,
    pub(crate) loops: Option<ana::loops::LoopTree>,
    open_blocks: Vec<NodeId>,
    n_locals: usize,

    start_block: NodeId,
    end_block: NodeId,
    start: NodeId,
    end: NodeId,
    no_mem: NodeId,
    frame: NodeId,
}

impl Graph {
    pub fn new(
        prog: Arc<Program>,
        entity: EntityId,
        frame_type: TypeId,
        n_locals: usize,
    ) -> Graph {
        let mut g = Graph {
            prog,
            entity,
            frame_type,
            nodes: Vec::new(),
            outs: Vec::new(),
            members: Vec::new(),
            visited: Vec::new(),
            visit_epoch: 0,
            vn: FxHashMap::default(),
            props: GraphProps::CONSISTENT_OUTS,
            dom: None,
            postdom: None,
            loops: None,
            open_blocks: Vec::new(),
            n_locals,
            start_block: NodeId(0),
            end_block: NodeId(0),
            start: NodeId(0),
            end: NodeId(0),
            no_mem: NodeId(0),
            frame: NodeId(0),
        };
        let start_block = g.add_raw(Op::Block, Mode::X, NodeId(0), &[]);
        let end_block = g.add_raw(Op::Block, Mode::X, NodeId(0), &[]);
        let start = g.add_raw(Op::Start, Mode::T, start_block, &[]);
        let end = g.add_raw(Op::End, Mode::X, end_block, &[]);
        let no_mem = g.add_raw(Op::NoMem, Mode::M, start_block, &[]);
        let frame = g.add_raw(Op::Proj(pn::start::FRAME), Mode::P, start_block, &[start]);
        g.start_block = start_block;
        g.end_block = end_block;
        g.start = start;
        g.end = end;
        g.no_mem = no_mem;
        g.frame = frame;
        g.open_blocks.push(end_block);
        g
    }

    pub fn prog(&self) -> &Arc<Program> {
        &self.prog
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn frame_type(&self) -> TypeId {
        self.frame_type
    }

    pub fn n_locals(&self) -> usize {
        self.n_locals
    }

    pub fn start_block(&self) -> NodeId {
        self.start_block
    }

    pub fn end_block(&self) -> NodeId {
        self.end_block
    }

    pub fn start(&self) -> NodeId {
        self.start
    }

    pub fn end(&self) -> NodeId {
        self.end
    }

    pub fn no_mem(&self) -> NodeId {
        self.no_mem
    }

    pub fn frame(&self) -> NodeId {
        self.frame
    }

    // ---- pool access -----------------------------------------------------

    pub fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.idx()]
    }

    pub fn op(&self, id: NodeId) -> &Op {
        &self.nodes[id.idx()].op
    }

    pub fn mode(&self, id: NodeId) -> Mode {
        self.nodes[id.idx()].mode
    }

    pub fn block_of(&self, id: NodeId) -> NodeId {
        self.nodes[id.idx()].block
    }

    pub fn ins(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.idx()].ins
    }

    pub fn arity(&self, id: NodeId) -> usize {
        self.nodes[id.idx()].ins.len()
    }

    pub fn input(&self, id: NodeId, pos: usize) -> NodeId {
        self.nodes[id.idx()].ins[pos]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    pub fn is_block(&self, id: NodeId) -> bool {
        matches!(self.op(id), Op::Block)
    }

    pub fn is_bad(&self, id: NodeId) -> bool {
        matches!(self.op(id), Op::Bad)
    }

    pub fn is_phi(&self, id: NodeId) -> bool {
        matches!(self.op(id), Op::Phi { .. })
    }

    // ---- node creation and rewiring --------------------------------------

    /// Append a node to the pool without optimization. The construction
    /// facade routes through the local optimizer instead; passes use this
    /// when they build shapes the optimizer must not touch. Blocks own
    /// themselves; the `block` argument is ignored for them.
    pub fn add_raw(&mut self, op: Op, mode: Mode, block: NodeId, ins: &[NodeId]) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let is_block = matches!(op, Op::Block);
        let block = if is_block { id } else { block };
        self.nodes.push(NodeData::new(op, mode, block, ins));
        self.outs.push(Vec::new());
        self.members.push(Vec::new());
        self.visited.push(0);
        for (pos, &pred) in ins.iter().enumerate() {
            self.outs[pred.idx()].push((id, pos as u32));
        }
        if !is_block {
            self.members[block.idx()].push(id);
        }
        id
    }

    /// Exact copy of a node: same opcode, mode, block and inputs.
    pub fn copy_node(&mut self, n: NodeId) -> NodeId {
        let data = self.nodes[n.idx()].clone();
        let ins: Vec<NodeId> = data.ins.iter().copied().collect();
        self.add_raw(data.op, data.mode, data.block, &ins)
    }

    pub fn set_input(&mut self, user: NodeId, pos: usize, new_pred: NodeId) {
        let old = self.nodes[user.idx()].ins[pos];
        if old == new_pred {
            return;
        }
        self.outs[old.idx()].retain(|&(u, p)| !(u == user && p == pos as u32));
        self.nodes[user.idx()].ins[pos] = new_pred;
        self.outs[new_pred.idx()].push((user, pos as u32));
    }

    pub fn set_inputs(&mut self, user: NodeId, new_ins: &[NodeId]) {
        let old: SmallVec<[NodeId; 4]> = self.nodes[user.idx()].ins.clone();
        for (pos, &pred) in old.iter().enumerate() {
            self.outs[pred.idx()].retain(|&(u, p)| !(u == user && p == pos as u32));
        }
        self.nodes[user.idx()].ins = SmallVec::from_slice(new_ins);
        for (pos, &pred) in new_ins.iter().enumerate() {
            self.outs[pred.idx()].push((user, pos as u32));
        }
    }

    /// Append one input.
    pub fn add_input(&mut self, user: NodeId, pred: NodeId) {
        let pos = self.nodes[user.idx()].ins.len();
        self.nodes[user.idx()].ins.push(pred);
        self.outs[pred.idx()].push((user, pos as u32));
    }

    /// Prepend one input, shifting the rest.
    pub fn prepend_input(&mut self, user: NodeId, pred: NodeId) {
        let mut ins: Vec<NodeId> = vec![pred];
        ins.extend(self.nodes[user.idx()].ins.iter().copied());
        self.set_inputs(user, &ins);
    }

    /// Remove the input at `pos`, shifting the rest.
    pub fn remove_input(&mut self, user: NodeId, pos: usize) {
        let mut ins: Vec<NodeId> = self.nodes[user.idx()].ins.iter().copied().collect();
        ins.remove(pos);
        self.set_inputs(user, &ins);
    }

    pub fn set_block(&mut self, id: NodeId, block: NodeId) {
        let old = self.nodes[id.idx()].block;
        if old == block {
            return;
        }
        self.members[old.idx()].retain(|&m| m != id);
        self.nodes[id.idx()].block = block;
        self.members[block.idx()].push(id);
    }

    /// Users of a node with the input position they use it at.
    pub fn outs(&self, id: NodeId) -> &[(NodeId, u32)] {
        &self.outs[id.idx()]
    }

    pub fn n_outs(&self, id: NodeId) -> usize {
        self.outs[id.idx()].len()
    }

    /// Nodes owned by a block, including phis.
    pub fn block_members(&self, block: NodeId) -> &[NodeId] {
        &self.members[block.idx()]
    }

    /// Reroute every use of `old` to `new` and kill `old`.
    pub fn exchange(&mut self, old: NodeId, new: NodeId) {
        if old == new {
            return;
        }
        let users: Vec<(NodeId, u32)> = self.outs[old.idx()].clone();
        for (user, pos) in users {
            let pos = pos as usize;
            self.nodes[user.idx()].ins[pos] = new;
            self.outs[new.idx()].push((user, pos as u32));
        }
        self.outs[old.idx()].clear();
        self.kill(old);
        // identity-map entries may reference the dead node's shape
        self.vn.clear();
    }

    /// Turn a node into Bad, detaching it from its inputs.
    pub fn kill(&mut self, id: NodeId) {
        let ins: SmallVec<[NodeId; 4]> = self.nodes[id.idx()].ins.clone();
        for (pos, &pred) in ins.iter().enumerate() {
            self.outs[pred.idx()].retain(|&(u, p)| !(u == id && p == pos as u32));
        }
        let block = self.nodes[id.idx()].block;
        if block != id {
            self.members[block.idx()].retain(|&m| m != id);
        }
        let data = &mut self.nodes[id.idx()];
        data.ins.clear();
        data.op = Op::Bad;
        data.mode = Mode::Bad;
        self.props.remove(GraphProps::NO_BADS);
    }

    // ---- blocks ----------------------------------------------------------

    /// New block with the given control predecessors, immediately matured.
    pub fn new_block(&mut self, preds: &[NodeId]) -> NodeId {
        self.add_raw(Op::Block, Mode::X, NodeId(0), preds)
    }

    /// New open block; predecessors are added later, then the block is
    /// matured exactly once.
    pub fn new_imm_block(&mut self) -> NodeId {
        let b = self.new_block(&[]);
        self.open_blocks.push(b);
        b
    }

    pub fn is_matured(&self, block: NodeId) -> bool {
        !self.open_blocks.contains(&block)
    }

    pub(crate) fn mark_matured(&mut self, block: NodeId) {
        let before = self.open_blocks.len();
        self.open_blocks.retain(|&b| b != block);
        if self.open_blocks.len() == before {
            crate::init::fatal("block matured twice");
        }
    }

    pub fn open_block_count(&self) -> usize {
        self.open_blocks.len()
    }

    pub fn first_open_block(&self) -> Option<NodeId> {
        self.open_blocks.first().copied()
    }

    /// All live block nodes in pool order.
    pub fn blocks(&self) -> Vec<NodeId> {
        self.ids()
            .filter(|&id| self.is_block(id))
            .collect()
    }

    /// Control-flow successor blocks of `block`.
    pub fn block_succs(&self, block: NodeId) -> Vec<NodeId> {
        let mut succs = Vec::new();
        for &m in self.block_members(block) {
            if self.mode(m) != Mode::X {
                continue;
            }
            for &(user, _) in self.outs(m) {
                if self.is_block(user) && !succs.contains(&user) {
                    succs.push(user);
                }
            }
        }
        succs
    }

    /// Predecessor block that control enters through input `i`.
    pub fn cfg_pred_block(&self, block: NodeId, i: usize) -> NodeId {
        self.block_of(self.input(block, i))
    }

    // ---- keep-alives -----------------------------------------------------

    pub fn keep_alive(&mut self, node: NodeId) {
        if !self.ins(self.end).contains(&node) {
            let end = self.end;
            self.add_input(end, node);
        }
    }

    pub fn remove_keep_alive(&mut self, node: NodeId) {
        let end = self.end;
        let positions: Vec<usize> = self
            .ins(end)
            .iter()
            .enumerate()
            .filter(|&(_, &n)| n == node)
            .map(|(i, _)| i)
            .collect();
        for pos in positions.into_iter().rev() {
            self.remove_input(end, pos);
        }
    }

    // ---- visited marks ---------------------------------------------------

    pub fn inc_visited(&mut self) {
        self.visit_epoch += 1;
    }

    pub fn mark_visited(&mut self, id: NodeId) {
        self.visited[id.idx()] = self.visit_epoch;
    }

    pub fn is_visited(&self, id: NodeId) -> bool {
        self.visited[id.idx()] == self.visit_epoch
    }

    // ---- property cache --------------------------------------------------

    pub fn props(&self) -> GraphProps {
        self.props
    }

    /// Recompute every requested property whose cache is stale.
    pub fn assure(&mut self, want: GraphProps) {
        if want.contains(GraphProps::NO_BADS) && !self.props.contains(GraphProps::NO_BADS) {
            crate::opt::dce::remove_bads(self);
            self.props.insert(GraphProps::NO_BADS);
        }
        if want.contains(GraphProps::CONSISTENT_DOMINANCE)
            && !self.props.contains(GraphProps::CONSISTENT_DOMINANCE)
        {
            self.dom = Some(ana::dom::compute_doms(self));
            self.props.insert(GraphProps::CONSISTENT_DOMINANCE);
        }
        if want.contains(GraphProps::CONSISTENT_POSTDOMINANCE)
            && !self.props.contains(GraphProps::CONSISTENT_POSTDOMINANCE)
        {
            self.postdom = Some(ana::dom::compute_postdoms(self));
            self.props.insert(GraphProps::CONSISTENT_POSTDOMINANCE);
        }
        if want.contains(GraphProps::CONSISTENT_LOOPINFO)
            && !self.props.contains(GraphProps::CONSISTENT_LOOPINFO)
        {
            self.assure(GraphProps::CONSISTENT_DOMINANCE);
            self.loops = Some(ana::loops::compute_loop_tree(self));
            self.props.insert(GraphProps::CONSISTENT_LOOPINFO);
        }
        if want.contains(GraphProps::LCSSA) && !self.props.contains(GraphProps::LCSSA) {
            ana::lcssa::assure_lcssa(self);
            self.props.insert(GraphProps::LCSSA);
        }
        // out edges are maintained incrementally and never go stale
        self.props.insert(GraphProps::CONSISTENT_OUTS);
    }

    /// Declare that only `kept` properties survived the pass.
    pub fn confirm(&mut self, kept: GraphProps) {
        let lost = self.props - (kept | GraphProps::CONSISTENT_OUTS);
        if lost.contains(GraphProps::CONSISTENT_DOMINANCE) {
            self.dom = None;
        }
        if lost.contains(GraphProps::CONSISTENT_POSTDOMINANCE) {
            self.postdom = None;
        }
        if lost.contains(GraphProps::CONSISTENT_LOOPINFO) {
            self.loops = None;
        }
        self.props &= kept | GraphProps::CONSISTENT_OUTS;
    }

    pub fn dom_tree(&self) -> &ana::dom::DomTree {
        self.dom
            .as_ref()
            .unwrap_or_else(|| crate::init::fatal("dominance requested but not assured"))
    }

    pub fn loop_tree(&self) -> &ana::loops::LoopTree {
        self.loops
            .as_ref()
            .unwrap_or_else(|| crate::init::fatal("loop info requested but not assured"))
    }

    /// `a` dominates `b` (both blocks).
    pub fn block_dominates(&self, a: NodeId, b: NodeId) -> bool {
        self.dom_tree().dominates(a, b)
    }

    // ---- verification ----------------------------------------------------

    /// Check the structural graph invariants, writing findings to `out`.
    /// Returns true when the graph is fine. Never mutates the graph
    /// structure (dominance is assured first).
    pub fn verify(&mut self, out: &mut dyn Write) -> bool {
        self.assure(GraphProps::CONSISTENT_DOMINANCE);
        let entity_name = self.prog.entity_ld_name(self.entity);
        let mut fine = true;
        let warn = |g: &Graph, node: NodeId, msg: &str, out: &mut dyn Write| {
            let _ = writeln!(
                out,
                "verify: {}: {:?} ({}) in {:?}: {}",
                entity_name,
                node,
                g.op(node).name(),
                g.block_of(node),
                msg
            );
        };
        for id in self.ids() {
            if self.is_bad(id) {
                continue;
            }
            match self.op(id) {
                Op::Phi { .. } => {
                    let block = self.block_of(id);
                    if self.arity(id) != self.arity(block) {
                        warn(self, id, "phi arity differs from block arity", out);
                        fine = false;
                    }
                    for (i, &pred) in self.ins(id).iter().enumerate() {
                        if self.is_bad(pred) || self.is_block(pred) {
                            continue;
                        }
                        if i >= self.arity(block) {
                            break;
                        }
                        let pred_block = self.cfg_pred_block(block, i);
                        let def_block = self.block_of(pred);
                        if self.mode(pred) != Mode::M
                            && !self.dominates_or_is(def_block, pred_block)
                        {
                            warn(self, id, "phi operand does not dominate pred block", out);
                            fine = false;
                        }
                    }
                }
                Op::Proj(num) => {
                    let pred = self.input(id, 0);
                    let ok = match self.op(pred) {
                        Op::Start => true,
                        Op::Cond => *num <= pn::cond::TRUE,
                        Op::Load(_) => *num <= pn::load::RES,
                        Op::Store(_) => *num == pn::store::M,
                        Op::Div | Op::Mod => *num <= pn::div::RES,
                        Op::Alloc(_) => *num <= pn::alloc::RES,
                        Op::Call(_) => true,
                        Op::Tuple => (*num as usize) < self.arity(pred),
                        Op::Mach(_) => true,
                        Op::Bad => true,
                        _ => false,
                    };
                    if !ok {
                        warn(self, id, "proj on a non-tuple producer", out);
                        fine = false;
                    }
                }
                Op::Block | Op::End | Op::Start | Op::Bad | Op::NoMem | Op::Unknown => {}
                _ => {
                    // block of every use is dominated by the def's block
                    let def_block = self.block_of(id);
                    for &(user, pos) in self.outs(id) {
                        if self.is_bad(user) || self.is_phi(user) || self.is_block(user) {
                            continue;
                        }
                        if matches!(self.op(user), Op::End | Op::Keep) {
                            continue;
                        }
                        let _ = pos;
                        let use_block = self.block_of(user);
                        if self.mode(id) != Mode::M
                            && self.mode(id) != Mode::X
                            && !self.dominates_or_is(def_block, use_block)
                        {
                            warn(self, id, "definition does not dominate use", out);
                            fine = false;
                        }
                    }
                }
            }
        }
        if !self.verify_memory_acyclic(out, entity_name.as_str()) {
            fine = false;
        }
        fine
    }

    fn dominates_or_is(&self, a: NodeId, b: NodeId) -> bool {
        a == b || self.dom_tree().dominates(a, b)
    }

    /// The memory sub-DAG must be acyclic when phis are cut at back edges;
    /// a straight cycle without a phi is a corruption.
    fn verify_memory_acyclic(&mut self, out: &mut dyn Write, entity: &str) -> bool {
        let mut fine = true;
        let mut state: FxHashMap<NodeId, u8> = FxHashMap::default();
        for id in self.ids() {
            if self.mode(id) != Mode::M || self.is_bad(id) {
                continue;
            }
            if state.contains_key(&id) {
                continue;
            }
            let mut stack = vec![(id, 0usize)];
            state.insert(id, 1);
            while let Some(&(n, i)) = stack.last() {
                let mem_ins: Vec<NodeId> = if self.is_phi(n) {
                    Vec::new() // phis close the cycles by construction
                } else {
                    self.ins(n)
                        .iter()
                        .copied()
                        .filter(|&p| self.mode(p) == Mode::M && !self.is_bad(p))
                        .collect()
                };
                if i < mem_ins.len() {
                    let next = mem_ins[i];
                    stack.last_mut().unwrap().1 += 1;
                    match state.get(&next) {
                        Some(1) => {
                            let _ = writeln!(
                                out,
                                "verify: {}: cycle in memory edges at {:?}",
                                entity, next
                            );
                            fine = false;
                        }
                        Some(_) => {}
                        None => {
                            state.insert(next, 1);
                            stack.push((next, 0));
                        }
                    }
                } else {
                    state.insert(n, 2);
                    stack.pop();
                }
            }
        }
        fine
    }
}
