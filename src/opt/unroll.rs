//! Loop unrolling over loop-closed SSA form.
//!
//! Two strategies share one cloning engine:
//!
//! - **Static unrolling** clones the body `factor` times with the header
//!   replicated between copies; when the iteration count equals the
//!   factor, the back edge is removed and local optimization collapses
//!   the replicated headers into straight-line code.
//! - **Duff-style unrolling** handles symbolic bounds: the body is cloned
//!   `factor` times, the replicated headers are removed so the main loop
//!   advances by `factor` steps per test, the header compare's bound is
//!   tightened by `|c|*(factor-1)` (or the multiplicative analogue), and
//!   a fix-up - either a literal duplicate of the loop or a compare-chain
//!   switch over the residue - runs the remaining iterations.
//!
//! Eligibility is decided by an induction-variable recognizer that
//! requires a single-exit loop, a compare against a valid base (constant,
//! loop invariant, or pure call whose arguments are valid bases and whose
//! result cannot alias any store in the loop) and exactly one increment
//! reached through the header phi's back edge.
//!
//! Any precondition failure declines the transformation and leaves the
//! graph untouched.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ana::loops::LoopId;
use crate::ir::graph::{Graph, GraphProps};
use crate::ir::mode::Mode;
use crate::ir::node::{pn, NodeId, Op, Relation};
use crate::ir::tarval::Tarval;

/// Shape of the residue fix-up for Duff-style unrolling.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FixupStrategy {
    /// Switch fix-up when eligible, loop fix-up otherwise.
    Auto,
    Loop,
    Switch,
}

#[derive(Clone, Debug)]
pub struct UnrollConfig {
    /// Unroll factor for the Duff strategy and cap for the static one.
    pub factor: u32,
    /// Loops with more nodes than this are left alone.
    pub maxsize: u32,
    /// Enable the static (known-trip-count) strategy. Off by default;
    /// only the Duff path ships enabled until the trip-count analysis
    /// has seen more validation.
    pub static_enable: bool,
    pub fixup: FixupStrategy,
}

impl Default for UnrollConfig {
    fn default() -> Self {
        UnrollConfig {
            factor: 4,
            maxsize: 400,
            static_enable: false,
            fixup: FixupStrategy::Auto,
        }
    }
}

/// Unroll eligible innermost loops of `g`. Returns the number of loops
/// changed. Requires a finalized graph; establishes loop-closed SSA.
pub fn unroll_loops(g: &mut Graph, cfg: &UnrollConfig) -> u32 {
    if g.open_block_count() > 0 {
        log::warn!("unroll: graph has open blocks, declining");
        return 0;
    }
    let mut n_unrolled = 0;
    let props = GraphProps::LCSSA
        | GraphProps::CONSISTENT_LOOPINFO
        | GraphProps::CONSISTENT_DOMINANCE
        | GraphProps::NO_BADS;
    g.assure(props);

    // the candidates are fixed up front; loops materialized by the
    // transformation itself (fix-up loops) are not revisited
    let candidates: Vec<NodeId> = {
        let tree = g.loop_tree();
        tree.innermost_loops()
            .into_iter()
            .filter_map(|l| resolve_header(g, l))
            .collect()
    };

    for header in candidates {
        g.assure(props);
        let Some(scope) = scope_for_header(g, header) else {
            continue;
        };
        if scope.irreducible {
            log::debug!("unroll: irreducible region at {:?}, skipping", scope.header);
            continue;
        }
        if scope.node_count(g) >= cfg.maxsize as usize {
            log::debug!("unroll: loop at {:?} exceeds maxsize", scope.header);
            continue;
        }
        // each strategy declares its own invalidations on the way out
        if try_unroll(g, &scope, cfg) {
            n_unrolled += 1;
        }
    }
    log::debug!("unroll: {} loops unrolled", n_unrolled);
    n_unrolled
}

fn try_unroll(g: &mut Graph, scope: &LoopScope, cfg: &UnrollConfig) -> bool {
    if cfg.static_enable {
        if let Some((factor, fully)) = find_suitable_factor(g, scope, cfg.factor) {
            if factor > 1 || fully {
                unroll_static(g, scope, factor, fully);
                return true;
            }
        }
    }
    if cfg.factor <= 1 {
        return false;
    }
    let Some((info, unrollability)) = determine_lin_unroll_info(g, scope) else {
        return false;
    };
    if unrollability == Unrollability::None {
        return false;
    }
    unroll_loop_duff(g, scope, cfg, &info, unrollability)
}

// ---- loop scope ----------------------------------------------------------

/// Snapshot of one loop taken before any mutation: the loop tree itself
/// goes stale as soon as cloning starts.
struct LoopScope {
    header: NodeId,
    blocks: Vec<NodeId>,
    block_set: FxHashSet<NodeId>,
    irreducible: bool,
}

impl LoopScope {
    fn contains(&self, block: NodeId) -> bool {
        self.block_set.contains(&block)
    }

    fn node_count(&self, g: &Graph) -> usize {
        self.blocks.iter().map(|&b| g.block_members(b).len()).sum()
    }
}

/// The scope of the innermost loop currently headed by `header`, if it
/// still exists in the recomputed tree.
fn scope_for_header(g: &Graph, header: NodeId) -> Option<LoopScope> {
    let tree = g.loop_tree();
    for l in tree.innermost_loops() {
        if resolve_header(g, l) != Some(header) {
            continue;
        }
        let blocks = tree.all_blocks(l);
        let block_set: FxHashSet<NodeId> = blocks.iter().copied().collect();
        return Some(LoopScope {
            header,
            block_set,
            blocks,
            irreducible: tree.info(l).irreducible,
        });
    }
    None
}

/// The block that dominates every block of the loop, found by walking the
/// dominance tree upwards from an arbitrary member.
fn resolve_header(g: &Graph, l: LoopId) -> Option<NodeId> {
    let tree = g.loop_tree();
    let mut header = *tree.info(l).blocks.first()?;
    while let Some(idom) = g.dom_tree().idom(header) {
        if !tree.block_is_inside(idom, l) {
            break;
        }
        header = idom;
    }
    let all = tree.all_blocks(l);
    if all.iter().all(|&b| b == header || g.dom_tree().dominates(header, b)) {
        Some(header)
    } else {
        None
    }
}

/// The header's conditional exit: the in-loop continuation and the
/// out-of-loop target with their Proj nodes.
struct HeaderTargets {
    in_proj: NodeId,
    in_block: NodeId,
    exit_proj: NodeId,
    post_block: NodeId,
}

fn header_targets(g: &Graph, scope: &LoopScope, header: NodeId) -> Option<HeaderTargets> {
    let mut in_t = None;
    let mut out_t = None;
    for &m in g.block_members(header) {
        if g.mode(m) != Mode::X || !matches!(g.op(m), Op::Proj(_)) {
            continue;
        }
        let cond = g.input(m, 0);
        if !matches!(g.op(cond), Op::Cond) {
            continue;
        }
        if !matches!(g.op(g.input(cond, 0)), Op::Cmp(_)) {
            continue;
        }
        for &(user, _) in g.outs(m) {
            if !g.is_block(user) {
                continue;
            }
            if scope.contains(user) {
                in_t = Some((m, user));
            } else {
                out_t = Some((m, user));
            }
        }
    }
    let (in_proj, in_block) = in_t?;
    let (exit_proj, post_block) = out_t?;
    Some(HeaderTargets {
        in_proj,
        in_block,
        exit_proj,
        post_block,
    })
}

fn loop_exit_count(g: &Graph, scope: &LoopScope) -> usize {
    let mut exits = 0;
    for &b in &scope.blocks {
        for &m in g.block_members(b) {
            if g.mode(m) != Mode::X {
                continue;
            }
            for &(user, _) in g.outs(m) {
                if g.is_block(user) && !scope.contains(user) {
                    exits += 1;
                }
            }
        }
    }
    exits
}

// ---- cloning engine ------------------------------------------------------

/// Per-unroll link state. `fwd` mirrors the link field of the original
/// implementation: the original's entry points at its most recent copy and
/// the previous copy is re-pointed at the newest one, which threads the
/// copies of one value into a chain across rounds. `origin` maps every
/// copy back to the original it was cloned from.
#[derive(Default)]
struct Links {
    fwd: FxHashMap<NodeId, NodeId>,
    origin: FxHashMap<NodeId, NodeId>,
}

impl Links {
    fn get(&self, n: NodeId) -> Option<NodeId> {
        self.fwd.get(&n).copied()
    }

    fn origin_of(&self, n: NodeId) -> Option<NodeId> {
        self.origin.get(&n).copied()
    }

    fn is_copy(&self, n: NodeId) -> bool {
        self.origin.contains_key(&n)
    }
}

fn duplicate_node(g: &mut Graph, links: &mut Links, node: NodeId, new_block: Option<NodeId>) -> NodeId {
    let copy = g.copy_node(node);
    if let Some(block) = new_block {
        g.set_block(copy, block);
    }
    if let Some(prev) = links.get(node) {
        links.fwd.insert(prev, copy);
    }
    links.fwd.insert(node, copy);
    links.fwd.insert(copy, node);
    links.origin.insert(copy, node);
    copy
}

fn duplicate_block(g: &mut Graph, links: &mut Links, block: NodeId) -> NodeId {
    let new_block = duplicate_node(g, links, block, None);
    for m in g.block_members(block).to_vec() {
        if g.is_bad(m) {
            continue;
        }
        duplicate_node(g, links, m, Some(new_block));
    }
    new_block
}

/// A successor block outside the loop gains one predecessor per clone
/// round; its phis follow suit.
fn rewire_successor_block(g: &mut Graph, links: &Links, block: NodeId, pos: usize) {
    let node = g.input(block, pos);
    let new_node = links.get(node).expect("cloned control must be linked");
    g.add_input(block, new_node);
    for phi in g.block_members(block).to_vec() {
        if !g.is_phi(phi) {
            continue;
        }
        let pred = g.input(phi, pos);
        let new_pred = links.get(pred).unwrap_or(pred);
        g.add_input(phi, new_pred);
    }
}

fn rewire_node(g: &mut Graph, links: &mut Links, node: NodeId, header: NodeId) {
    let new_node = links.get(node).expect("node was duplicated this round");

    // successors outside the loop and keep-alive roots
    for (succ, pos) in g.outs(node).to_vec() {
        if links.get(succ).is_none() && g.is_block(succ) {
            rewire_successor_block(g, links, succ, pos as usize);
        } else if matches!(g.op(succ), Op::End) {
            g.keep_alive(new_node);
        }
    }

    if node == header {
        // the copy takes over the old back edges; the original's back
        // edges come from the newest copies instead
        let arity = g.arity(node);
        let mut new_ins = Vec::new();
        for i in 0..arity {
            let pred = g.input(header, i);
            if let Some(new_pred) = links.get(pred) {
                g.set_input(node, i, new_pred);
                new_ins.push(pred);
            }
        }
        g.set_inputs(new_node, &new_ins);
        return;
    }

    if g.is_phi(node) && g.block_of(node) == header {
        let arity = g.arity(node);
        let mut new_ins = Vec::new();
        for i in 0..arity {
            if links.get(g.input(header, i)).is_some() {
                let pred = g.input(node, i);
                if let Some(new_pred) = links.get(pred) {
                    g.set_input(node, i, new_pred);
                }
                new_ins.push(pred);
            }
        }
        g.set_inputs(new_node, &new_ins);
        return;
    }

    let arity = g.arity(new_node);
    for i in 0..arity {
        let pred = g.input(new_node, i);
        if let Some(new_pred) = links.get(pred) {
            g.set_input(new_node, i, new_pred);
        }
    }
}

fn rewire_block(g: &mut Graph, links: &mut Links, block: NodeId, header: NodeId) {
    rewire_node(g, links, block, header);
    for m in g.block_members(block).to_vec() {
        if g.is_bad(m) || links.get(m).is_none() {
            continue;
        }
        rewire_node(g, links, m, header);
    }
}

/// Clone the loop body `factor - 1` times, chaining the copies through
/// replicated headers. Returns the header copies in creation order.
fn rewire_loop(
    g: &mut Graph,
    scope: &LoopScope,
    factor: u32,
    links: &mut Links,
    copies: &mut Vec<NodeId>,
) -> Vec<NodeId> {
    let mut header_copies = Vec::new();
    for _round in 1..factor {
        for &b in &scope.blocks {
            let dup = duplicate_block(g, links, b);
            copies.push(dup);
            if b == scope.header {
                header_copies.push(dup);
            }
        }
        for &b in &scope.blocks {
            rewire_block(g, links, b, scope.header);
        }
    }
    header_copies
}

// ---- static strategy -----------------------------------------------------

/// Remove one control predecessor of a block, keeping phis in sync. When
/// a single predecessor remains, the phis collapse to their surviving
/// operand.
fn remove_block_input(g: &mut Graph, block: NodeId, idx: usize) {
    let n = g.arity(block) - 1;
    let phis: Vec<NodeId> = g
        .block_members(block)
        .iter()
        .copied()
        .filter(|&m| g.is_phi(m))
        .collect();
    if n == 1 {
        for phi in phis {
            if g.is_bad(phi) {
                continue;
            }
            if let Op::Phi { loop_: true } = g.op(phi) {
                g.remove_keep_alive(phi);
                g.nodes[phi.idx()].op = Op::Phi { loop_: false };
            }
            let keep = g.input(phi, idx ^ 1);
            g.exchange(phi, keep);
        }
    } else {
        for phi in phis {
            if !g.is_bad(phi) && idx < g.arity(phi) {
                g.remove_input(phi, idx);
            }
        }
    }
    g.remove_input(block, idx);
}

/// After a full unroll the loop header's in-loop predecessors jump to the
/// block after the loop instead, and the control-flow loop disappears.
fn rewire_fully_unrolled(g: &mut Graph, scope: &LoopScope, links: &Links, factor: u32) {
    let header = scope.header;

    // find the block after the loop
    let mut after_loop = None;
    let mut n_after = 0;
    for &m in g.block_members(header).to_vec().iter() {
        if !matches!(g.op(m), Op::Proj(_)) || g.mode(m) != Mode::X {
            continue;
        }
        for &(succ, pos) in g.outs(m) {
            if g.is_block(succ) && !links.is_copy(succ) && !scope.contains(succ) {
                after_loop = Some(succ);
                n_after = pos as usize;
            }
        }
    }
    let Some(after_loop) = after_loop else { return };

    let mut i = 0;
    while i < g.arity(header) {
        let pred_block = g.block_of(g.input(header, i));
        let in_loop = scope.contains(pred_block) || links.is_copy(pred_block);
        if (links.get(pred_block).is_none() && factor > 1) || !in_loop {
            i += 1;
            continue;
        }

        // jump into after_loop instead of back into the header
        let old_jump = g.input(header, i);
        g.add_input(after_loop, old_jump);

        for phi in g.block_members(after_loop).to_vec() {
            if !g.is_phi(phi) {
                continue;
            }
            let pred = g.input(phi, n_after);
            let new_pred = if g.is_phi(pred) && g.block_of(pred) == header {
                g.input(pred, i)
            } else if g.mode(phi) == Mode::M {
                // find the memory phi feeding this path
                let mut cur = pred;
                while !g.is_phi(cur) {
                    cur = g.input(cur, 0);
                }
                g.input(cur, i)
            } else if let Some(link) = links.get(pred) {
                link
            } else {
                pred
            };
            g.add_input(phi, new_pred);
        }

        remove_block_input(g, header, i);
    }

    crate::opt::dce::remove_bads(g);
}

fn unroll_static(g: &mut Graph, scope: &LoopScope, factor: u32, fully: bool) {
    log::debug!(
        "unroll: static unroll of loop at {:?}, factor {}, fully: {}",
        scope.header,
        factor,
        fully
    );
    let mut links = Links::default();
    let mut copies = Vec::new();
    rewire_loop(g, scope, factor, &mut links, &mut copies);
    if fully {
        rewire_fully_unrolled(g, scope, &links, factor);
        crate::opt::local::optimize_graph(g);
        crate::opt::dce::remove_bads(g);
    }
    g.confirm(GraphProps::empty());
}

/// Trip count analysis of the header compare; returns the chosen factor
/// and whether the loop can be unrolled completely.
fn find_suitable_factor(g: &Graph, scope: &LoopScope, max: u32) -> Option<(u32, bool)> {
    let header = scope.header;
    for &node in g.block_members(header) {
        let Op::Cmp(rel) = g.op(node) else {
            continue;
        };
        let mut rel = *rel;
        if rel == Relation::LESS_GREATER
            || rel == Relation::EQUAL
            || rel.contains(Relation::UNORDERED)
        {
            return None;
        }
        let cmp_right = g.input(node, 1);
        let (header_phi, mut limit) = match g.op(cmp_right) {
            Op::Const(tv) if tv.mode().is_int() => {
                let left = g.input(node, 0);
                if !g.is_phi(left) {
                    return None;
                }
                (left, *tv)
            }
            _ => return None,
        };

        let mut init: Option<Tarval> = None;
        let mut step: Option<Tarval> = None;
        let mut cnt_add: Option<NodeId> = None;
        for j in 0..g.arity(header_phi) {
            let mut pred = g.input(header_phi, j);
            if let Op::Const(tv) = g.op(pred) {
                if tv.mode().is_int() {
                    match init {
                        None => {
                            init = Some(*tv);
                            continue;
                        }
                        Some(prev) if prev.compare(*tv) == Relation::EQUAL => continue,
                        Some(_) => {}
                    }
                }
            }
            pred = skip_trivial_phis(g, pred);
            if matches!(g.op(pred), Op::Add) && cnt_add.is_none() {
                cnt_add = Some(pred);
                let left = g.input(pred, 0);
                let right = g.input(pred, 1);
                if let Op::Const(step_tv) = g.op(right) {
                    if g.is_phi(left) {
                        // loop-closed construction may interpose phis
                        let mut cur = left;
                        let mut found = false;
                        loop {
                            if cur == header_phi {
                                found = true;
                                step = Some(*step_tv);
                                break;
                            }
                            if !g.is_phi(cur) || g.arity(cur) != 1 {
                                break;
                            }
                            cur = g.input(cur, 0);
                        }
                        if found {
                            continue;
                        }
                    }
                }
                return None;
            }
            if Some(pred) == cnt_add {
                continue;
            }
            return None;
        }

        let mut init = init?;
        let mut step_tv = step?;

        // normalize to a less/less-equal relation
        if rel.contains(Relation::GREATER) {
            std::mem::swap(&mut init, &mut limit);
            step_tv = step_tv.neg();
            rel = rel.inversed();
        }
        let mut interval = limit.sub(init);
        if interval.is_negative() || step_tv.is_negative() {
            return None;
        }
        let one = Tarval::one(interval.mode());
        if !rel.contains(Relation::EQUAL) {
            interval = interval.sub(one);
        }
        if step_tv.is_null() {
            return None;
        }
        let loop_count = interval.div(step_tv)?.add(one).as_i64();
        if loop_count <= 0 {
            return None;
        }
        let factor = find_optimal_factor(loop_count as u64, max);
        let fully = factor as u64 == loop_count as u64;
        log::debug!(
            "unroll: init {} step {} limit {} count {} factor {}",
            init,
            step_tv,
            limit,
            loop_count,
            factor
        );
        return Some((factor, fully));
    }
    None
}

/// Complete unrolls take the count itself; otherwise look for a
/// power-of-two divisor no larger than `max`.
fn find_optimal_factor(number: u64, max: u32) -> u32 {
    if number <= max as u64 {
        return number as u32;
    }
    let mut i = 2;
    while i <= number / 2 {
        if number % i == 0 {
            let candidate = number / i;
            if candidate <= max as u64 && candidate.is_power_of_two() {
                return candidate as u32;
            }
        }
        i += 1;
    }
    0
}

fn skip_trivial_phis(g: &Graph, mut node: NodeId) -> NodeId {
    while g.is_phi(node) && g.arity(node) == 1 {
        node = g.input(node, 0);
    }
    node
}

// ---- induction recognizer ------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum IncrOp {
    Add,
    Sub,
    Mul,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Unrollability {
    None,
    LoopFixup,
    All,
}

struct LinearUnrollInfo {
    op: IncrOp,
    cmp: NodeId,
    rel: Relation,
    /// The step value `c`.
    incr: NodeId,
    phi: NodeId,
    bound: NodeId,
}

/// Addresses stored to inside the loop; the bound and increment must not
/// read through any of them.
struct AliasCandidates {
    stores: Vec<(NodeId, crate::ir::ty::TypeId, u32)>,
}

impl AliasCandidates {
    fn collect(g: &Graph, scope: &LoopScope) -> AliasCandidates {
        let mut stores = Vec::new();
        for &b in &scope.blocks {
            for &m in g.block_members(b) {
                match g.op(m) {
                    Op::Store(ty) => {
                        let ty = *ty;
                        let size = g.prog().type_size(ty);
                        stores.push((g.input(m, 1), ty, size));
                    }
                    Op::Call(mty) => {
                        // a call that may write anywhere poisons every
                        // pointer argument it receives
                        if !g.prog().is_method_pure(*mty) {
                            let psize = g.prog().params().pointer_size;
                            for i in 2..g.arity(m) {
                                let arg = g.input(m, i);
                                if g.mode(arg) == Mode::P {
                                    let ty = g.prog().new_primitive_type(Mode::Iu64);
                                    stores.push((arg, ty, psize));
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        AliasCandidates { stores }
    }

    fn is_aliased(&self, g: &Graph, addr: NodeId, ty: crate::ir::ty::TypeId) -> bool {
        let size = g.prog().type_size(ty);
        self.stores.iter().any(|&(saddr, sty, ssize)| {
            crate::ana::alias::get_alias_relation(g, saddr, sty, ssize, addr, ty, size)
                != crate::ana::alias::AliasRelation::NoAlias
        })
    }
}

/// A valid base is a value the unrolled iteration space may be computed
/// from: constant, defined outside the loop, a load or pure call whose
/// address cannot alias any store in the loop, a phi of valid bases, or a
/// conversion of one.
fn is_valid_base(
    g: &Graph,
    scope: &LoopScope,
    aliases: &AliasCandidates,
    node: NodeId,
    visited: &mut FxHashSet<NodeId>,
) -> bool {
    if !visited.insert(node) {
        return false;
    }
    if matches!(g.op(node), Op::Const(_) | Op::Address(_)) {
        return true;
    }
    if !scope.contains(g.block_of(node)) {
        return true;
    }
    match g.op(node) {
        Op::Proj(_) => {
            let pred = g.input(node, 0);
            match g.op(pred) {
                Op::Proj(_) => {
                    let call = g.input(pred, 0);
                    let Op::Call(mty) = g.op(call) else {
                        return false;
                    };
                    let mty = *mty;
                    if !scope.contains(g.block_of(call)) {
                        return true;
                    }
                    if !g.prog().is_method_pure(mty) {
                        return false;
                    }
                    for i in 2..g.arity(call) {
                        let arg = g.input(call, i);
                        if !is_valid_base(g, scope, aliases, arg, visited) {
                            return false;
                        }
                    }
                    let ty = g.prog().new_primitive_type(Mode::Iu64);
                    !aliases.is_aliased(g, g.input(call, 1), ty)
                }
                Op::Load(ty) => {
                    let ty = *ty;
                    let ptr = g.input(pred, 1);
                    if matches!(g.op(ptr), Op::Proj(_))
                        && !is_valid_base(g, scope, aliases, ptr, visited)
                    {
                        return false;
                    }
                    !aliases.is_aliased(g, ptr, ty)
                }
                _ => false,
            }
        }
        Op::Phi { .. } => {
            let mut pointing_into_loop = 0;
            for i in 0..g.arity(node) {
                let pred = g.input(node, i);
                if scope.contains(g.block_of(pred)) {
                    pointing_into_loop += 1;
                }
                if !is_valid_base(g, scope, aliases, pred, visited) {
                    return false;
                }
            }
            pointing_into_loop <= 1
        }
        Op::Conv => is_valid_base(g, scope, aliases, g.input(node, 0), visited),
        _ => false,
    }
}

fn climb_single_phi(g: &Graph, node: NodeId) -> NodeId {
    if g.is_phi(node) && g.arity(node) == 1 {
        return climb_single_phi(g, g.input(node, 0));
    }
    node
}

fn binop_to_op(g: &Graph, node: NodeId) -> Option<IncrOp> {
    match g.op(node) {
        Op::Add => Some(IncrOp::Add),
        Op::Sub => Some(IncrOp::Sub),
        Op::Mul => Some(IncrOp::Mul),
        _ => None,
    }
}

/// Does `node` look like `phi <op> c` with a valid base `c`? Fills in the
/// step on success.
fn is_valid_incr(
    g: &Graph,
    scope: &LoopScope,
    aliases: &AliasCandidates,
    info: &mut LinearUnrollInfo,
    node: NodeId,
) -> bool {
    let Some(op) = binop_to_op(g, node) else {
        return false;
    };
    let left = climb_single_phi(g, g.input(node, 0));
    let right = climb_single_phi(g, g.input(node, 1));
    let mut step = None;
    if left == info.phi {
        step = Some(right);
    } else if right == info.phi {
        step = Some(left);
    }
    let Some(step) = step else {
        return false;
    };
    if op == IncrOp::Mul && !matches!(g.op(step), Op::Const(_)) {
        log::debug!("unroll: multiplicative step must be constant");
        return false;
    }
    let mut visited = FxHashSet::default();
    if !is_valid_base(g, scope, aliases, step, &mut visited) {
        return false;
    }
    info.op = op;
    info.incr = step;
    true
}

fn check_phi(
    g: &Graph,
    scope: &LoopScope,
    aliases: &AliasCandidates,
    info: &mut LinearUnrollInfo,
) -> Unrollability {
    let phi = info.phi;
    if g.arity(phi) < 2 {
        return Unrollability::None;
    }
    let mut preds_in_loop = 0;
    for i in 0..g.arity(phi) {
        if scope.contains(g.block_of(g.input(phi, i))) {
            preds_in_loop += 1;
        }
    }
    if preds_in_loop > 1 {
        return Unrollability::None;
    }

    let mut switch_ok = true;
    let mut incr_found = false;
    for i in 0..g.arity(phi) {
        let pred = g.input(phi, i);
        if is_valid_incr(g, scope, aliases, info, pred) {
            if incr_found {
                return Unrollability::None;
            }
            incr_found = true;
            continue;
        }
        let mut visited = FxHashSet::default();
        if !is_valid_base(g, scope, aliases, pred, &mut visited) {
            switch_ok = false;
        }
    }
    if !incr_found {
        return Unrollability::None;
    }
    if !g.mode(phi).is_int() {
        switch_ok = false;
    }
    if switch_ok {
        Unrollability::All
    } else {
        Unrollability::LoopFixup
    }
}

fn determine_lin_unroll_info(
    g: &Graph,
    scope: &LoopScope,
) -> Option<(LinearUnrollInfo, Unrollability)> {
    if scope.blocks.len() <= 1 {
        return None;
    }
    let header = scope.header;
    for i in 0..g.arity(header) {
        if g.block_of(g.input(header, i)) == header {
            return None; // self loop on the header
        }
    }
    header_targets(g, scope, header)?;
    if loop_exit_count(g, scope) > 1 {
        return None;
    }

    let aliases = AliasCandidates::collect(g, scope);
    for &node in g.block_members(header) {
        let Op::Cmp(rel) = g.op(node) else { continue };
        let rel = *rel;
        if rel != Relation::GREATER_EQUAL
            && rel != Relation::GREATER
            && rel != Relation::LESS_EQUAL
            && rel != Relation::LESS
        {
            continue;
        }
        let left = g.input(node, 0);
        let right = g.input(node, 1);
        if !g.is_phi(left) && !g.is_phi(right) {
            return None;
        }
        let mut best = None;
        for (phi, bound) in [(left, right), (right, left)] {
            if !g.is_phi(phi) {
                continue;
            }
            let mut info = LinearUnrollInfo {
                op: IncrOp::Add,
                cmp: node,
                rel,
                incr: phi,
                phi,
                bound,
            };
            let mut ret = check_phi(g, scope, &aliases, &mut info);
            let mut visited = FxHashSet::default();
            if !is_valid_base(g, scope, &aliases, bound, &mut visited) {
                ret = Unrollability::None;
            }
            if info.op == IncrOp::Mul && ret == Unrollability::All {
                ret = Unrollability::LoopFixup;
            }
            if ret != Unrollability::None {
                // the step must be usable at the header for the bound
                // rewrite
                let step_ok = matches!(g.op(info.incr), Op::Const(_))
                    || !scope.contains(g.block_of(info.incr));
                if step_ok {
                    best = Some((info, ret));
                    break;
                }
            }
        }
        return best;
    }
    None
}

// ---- Duff strategy -------------------------------------------------------

fn unroll_loop_duff(
    g: &mut Graph,
    scope: &LoopScope,
    cfg: &UnrollConfig,
    info: &LinearUnrollInfo,
    unrollability: Unrollability,
) -> bool {
    let factor = cfg.factor;
    let Some(targets) = header_targets(g, scope, scope.header) else {
        return false;
    };
    let use_switch = match cfg.fixup {
        FixupStrategy::Loop => false,
        FixupStrategy::Switch => unrollability == Unrollability::All,
        FixupStrategy::Auto => unrollability == Unrollability::All,
    };
    if cfg.fixup == FixupStrategy::Switch && unrollability != Unrollability::All {
        return false;
    }
    log::debug!(
        "unroll: duff unroll at {:?}, factor {}, {} fixup",
        scope.header,
        factor,
        if use_switch { "switch" } else { "loop" }
    );

    // 1. residue fix-up behind the loop exit
    if use_switch {
        create_fixup_switch(g, scope, &targets, factor, info);
    } else {
        create_fixup_loop(g, scope, &targets);
    }

    // 2. replicate the body inside the loop
    let mut links = Links::default();
    let mut copies = Vec::new();
    let header_copies = rewire_loop(g, scope, factor, &mut links, &mut copies);

    // 3. delete the replicated headers: the copies run back to back
    remove_excess_headers(g, scope, &links, &header_copies);

    // 4. tighten the main loop's bound
    update_header_condition(g, info, factor);

    // 5. the loop shape changed wholesale
    g.confirm(GraphProps::empty());
    crate::opt::dce::remove_bads(g);
    g.assure(GraphProps::LCSSA);
    true
}

/// A literal duplicate of the loop placed behind the exit: the main loop
/// (whose bound gets tightened afterwards) falls into the duplicate,
/// which runs the remaining iterations against the original bound.
fn create_fixup_loop(g: &mut Graph, scope: &LoopScope, targets: &HeaderTargets) {
    let header = scope.header;
    let mut links = Links::default();
    for &b in &scope.blocks {
        duplicate_block(g, &mut links, b);
    }
    // internal edges point at the copies
    for &b in &scope.blocks {
        let bc = links.get(b).unwrap();
        for i in 0..g.arity(bc) {
            let pred = g.input(bc, i);
            if let Some(c) = links.get(pred) {
                if links.is_copy(c) {
                    g.set_input(bc, i, c);
                }
            }
        }
        for m in g.block_members(b).to_vec() {
            let Some(mc) = links.get(m) else { continue };
            for i in 0..g.arity(mc) {
                let pred = g.input(mc, i);
                if let Some(c) = links.get(pred) {
                    if links.is_copy(c) {
                        g.set_input(mc, i, c);
                    }
                }
            }
        }
    }

    let h2 = links.get(header).unwrap();
    // the duplicate is entered through the original loop's exit
    let mut h2_ins = vec![targets.exit_proj];
    let mut back_positions = Vec::new();
    for i in 0..g.arity(header) {
        let pred = g.input(header, i);
        if scope.contains(g.block_of(pred)) {
            h2_ins.push(links.get(pred).unwrap_or(pred));
            back_positions.push(i);
        }
    }
    g.set_inputs(h2, &h2_ins);
    for m in g.block_members(header).to_vec() {
        if !g.is_phi(m) {
            continue;
        }
        let mc = links.get(m).unwrap();
        // entering the duplicate, the variable holds the original loop's
        // final value, which is the header phi itself
        let mut ins = vec![m];
        for &i in &back_positions {
            let pred = g.input(m, i);
            ins.push(links.get(pred).unwrap_or(pred));
        }
        g.set_inputs(mc, &ins);
    }

    // the block after the loop is now entered from the duplicate
    let exit2 = links.get(targets.exit_proj).unwrap();
    let exit_pos = g
        .ins(targets.post_block)
        .iter()
        .position(|&p| p == targets.exit_proj)
        .expect("post block must be entered through the exit proj");
    g.set_input(targets.post_block, exit_pos, exit2);
    for phi in g.block_members(targets.post_block).to_vec() {
        if !g.is_phi(phi) {
            continue;
        }
        let v = g.input(phi, exit_pos);
        if let Some(vc) = links.get(v) {
            if links.is_copy(vc) {
                g.set_input(phi, exit_pos, vc);
            }
        }
    }
}

/// Compare-chain fix-up: `factor - 1` copies of the loop body laid out
/// behind the exit, entered through a chain of compares on the residue
/// `|N - i| + (|c| - 1)`; each landing pad falls through the remaining
/// copies into the block after the loop.
fn create_fixup_switch(
    g: &mut Graph,
    scope: &LoopScope,
    targets: &HeaderTargets,
    factor: u32,
    info: &LinearUnrollInfo,
) {
    let header = scope.header;
    let body_blocks: Vec<NodeId> = scope
        .blocks
        .iter()
        .copied()
        .filter(|&b| b != header)
        .collect();
    let entry_body = targets.in_block;

    // back-edge control and the per-phi back-edge value positions
    let back_pos = (0..g.arity(header))
        .find(|&i| scope.contains(g.block_of(g.input(header, i))))
        .expect("loop must have a back edge");
    let header_phis: Vec<NodeId> = g
        .block_members(header)
        .iter()
        .copied()
        .filter(|&m| g.is_phi(m))
        .collect();

    let exit_pos = g
        .ins(targets.post_block)
        .iter()
        .position(|&p| p == targets.exit_proj)
        .expect("post block must be entered through the exit proj");

    // current value of each header phi's quantity entering the next copy
    let mut quantity: FxHashMap<NodeId, NodeId> =
        header_phis.iter().map(|&p| (p, p)).collect();
    // merge phis in landing pads, with the header phi they track
    let mut merge_roots: FxHashMap<NodeId, NodeId> = FxHashMap::default();

    let mut landing_pads: Vec<NodeId> = Vec::new();
    let mut fallthrough: Option<NodeId> = None;

    for k in 0..factor.saturating_sub(1) {
        let mut links = Links::default();
        for &b in &body_blocks {
            duplicate_block(g, &mut links, b);
        }
        // internal rewiring among this copy's blocks
        for &b in &body_blocks {
            let bc = links.get(b).unwrap();
            for i in 0..g.arity(bc) {
                let pred = g.input(bc, i);
                if let Some(c) = links.get(pred) {
                    if links.is_copy(c) {
                        g.set_input(bc, i, c);
                    }
                }
            }
            for m in g.block_members(b).to_vec() {
                let Some(mc) = links.get(m) else { continue };
                for i in 0..g.arity(mc) {
                    let pred = g.input(mc, i);
                    if let Some(c) = links.get(pred) {
                        if links.is_copy(c) {
                            g.set_input(mc, i, c);
                        }
                    }
                }
            }
        }

        let entry_copy = links.get(entry_body).unwrap();
        landing_pads.push(entry_copy);

        // entry control: fall through from the previous copy, landing
        // pad proj added by the switch header afterwards
        let mut entry_ins = Vec::new();
        if let Some(ft) = fallthrough {
            entry_ins.push(ft);
        }
        g.set_inputs(entry_copy, &entry_ins);

        // seed the quantities: with one predecessor the value is plain,
        // with two a phi merges fall-through and landing values
        let mut local_value: FxHashMap<NodeId, NodeId> = FxHashMap::default();
        for &p in &header_phis {
            let incoming = quantity[&p];
            let v = if k == 0 {
                incoming
            } else {
                let phi = g.add_raw(
                    Op::Phi { loop_: false },
                    g.mode(p),
                    entry_copy,
                    &[incoming],
                );
                merge_roots.insert(phi, p);
                phi
            };
            local_value.insert(p, v);
        }

        // patch copy nodes that referenced header phis
        for &b in &body_blocks {
            for m in g.block_members(b).to_vec() {
                let Some(mc) = links.get(m) else { continue };
                for i in 0..g.arity(mc) {
                    let pred = g.input(mc, i);
                    if let Some(&v) = local_value.get(&pred) {
                        g.set_input(mc, i, v);
                    }
                }
            }
        }

        // quantity after this copy: the back-edge value, mapped into it
        let mut next_quantity = FxHashMap::default();
        for &p in &header_phis {
            let back_val = g.input(p, back_pos);
            let after = if let Some(c) = links.get(back_val) {
                if links.is_copy(c) {
                    c
                } else {
                    back_val
                }
            } else if let Some(&v) = local_value.get(&back_val) {
                v
            } else {
                back_val
            };
            next_quantity.insert(p, after);
        }
        quantity = next_quantity;

        // the copy's back jump becomes the fall through to the next copy
        let back_ctrl = g.input(header, back_pos);
        let back_copy = links.get(back_ctrl).expect("back edge control is in the body");
        fallthrough = Some(back_copy);
    }

    // the final fall through enters the block after the loop
    if let Some(ft) = fallthrough {
        g.add_input(targets.post_block, ft);
        for phi in g.block_members(targets.post_block).to_vec() {
            if !g.is_phi(phi) {
                continue;
            }
            let v = g.input(phi, exit_pos);
            let after = quantity.get(&v).copied().unwrap_or(v);
            g.add_input(phi, after);
        }
    }

    build_switch_header(g, targets, factor, info, &landing_pads, &merge_roots, exit_pos);
}

/// |x| as shift/xor/sub, the branch-free form.
fn create_abs(g: &mut Graph, block: NodeId, node: NodeId) -> NodeId {
    let mode = g.mode(node);
    if !mode.is_signed() {
        return node;
    }
    let bits = g.add_raw(
        Op::Const(Tarval::from_u64(mode.bits() as u64 - 1, Mode::Iu32)),
        Mode::Iu32,
        g.start_block(),
        &[],
    );
    let shrs = g.add_raw(Op::Shrs, mode, block, &[node, bits]);
    let eor = g.add_raw(Op::Eor, mode, block, &[shrs, node]);
    g.add_raw(Op::Sub, mode, block, &[eor, shrs])
}

/// The compare chain selecting the landing pad from the residue.
fn build_switch_header(
    g: &mut Graph,
    targets: &HeaderTargets,
    factor: u32,
    info: &LinearUnrollInfo,
    landing_pads: &[NodeId],
    merge_roots: &FxHashMap<NodeId, NodeId>,
    exit_pos: usize,
) {
    let sb = g.add_raw(Op::Block, Mode::X, NodeId(0), &[targets.exit_proj]);

    let mode = g.mode(info.phi);
    let n_abs = {
        let n = info.bound;
        create_abs(g, sb, n)
    };
    let c_abs = create_abs(g, sb, info.incr);
    let one = g.add_raw(
        Op::Const(Tarval::one(mode)),
        mode,
        g.start_block(),
        &[],
    );
    let mut n_minus_i = if is_less(g, info) {
        g.add_raw(Op::Sub, mode, sb, &[n_abs, info.phi])
    } else {
        g.add_raw(Op::Sub, mode, sb, &[info.phi, n_abs])
    };
    if info.rel == Relation::LESS_EQUAL || info.rel == Relation::GREATER_EQUAL {
        n_minus_i = g.add_raw(Op::Add, mode, sb, &[n_minus_i, one]);
    }
    let c_one = g.add_raw(Op::Sub, mode, sb, &[c_abs, one]);
    let res = g.add_raw(Op::Add, mode, sb, &[n_minus_i, c_one]);

    let mut prev_jmp = g.add_raw(Op::Jmp, Mode::X, sb, &[]);
    for i in 0..(factor as usize - 1) {
        let steps = g.add_raw(
            Op::Const(Tarval::from_u64((factor as u64 - 1) - i as u64, mode)),
            mode,
            g.start_block(),
            &[],
        );
        let c_times = g.add_raw(Op::Mul, mode, sb, &[steps, c_abs]);
        let cmp_block = g.add_raw(Op::Block, Mode::X, NodeId(0), &[prev_jmp]);
        let cmp = g.add_raw(
            Op::Cmp(Relation::GREATER_EQUAL),
            Mode::B,
            cmp_block,
            &[res, c_times],
        );
        let cond = g.add_raw(Op::Cond, Mode::T, cmp_block, &[cmp]);
        let t = g.add_raw(Op::Proj(pn::cond::TRUE), Mode::X, cmp_block, &[cond]);
        prev_jmp = g.add_raw(Op::Proj(pn::cond::FALSE), Mode::X, cmp_block, &[cond]);

        // land in copy i
        g.add_input(landing_pads[i], t);
        // landing pads past the first merge in the loop's exit value,
        // which is the header phi the merge tracks
        for phi in g.block_members(landing_pads[i]).to_vec() {
            if g.is_phi(phi) && g.arity(phi) < g.arity(landing_pads[i]) {
                if let Some(&root) = merge_roots.get(&phi) {
                    g.add_input(phi, root);
                }
            }
        }
    }

    // no residue left: straight to the block after the loop
    g.set_input(targets.post_block, exit_pos, prev_jmp);
}

/// Remove the replicated headers between body copies: their phis are
/// single-operand merges, their compare always continues, and the block
/// after the loop must forget their exit edges.
fn remove_excess_headers(
    g: &mut Graph,
    scope: &LoopScope,
    links: &Links,
    header_copies: &[NodeId],
) {
    let header_copy_set: FxHashSet<NodeId> = header_copies.iter().copied().collect();
    for &hc in header_copies {
        // single-operand phis collapse onto the value from the previous
        // body copy
        for m in g.block_members(hc).to_vec() {
            if !g.is_phi(m) || g.is_bad(m) {
                continue;
            }
            if g.arity(m) == 1 {
                if let Op::Phi { loop_: true } = g.op(m) {
                    g.remove_keep_alive(m);
                }
                let operand = g.input(m, 0);
                g.exchange(m, operand);
            }
        }

        // locate the copy's continuation and exit projections
        let mut in_edge = None;
        let mut out_edges = Vec::new();
        for &m in g.block_members(hc).to_vec().iter() {
            if g.mode(m) != Mode::X || !matches!(g.op(m), Op::Proj(_)) {
                continue;
            }
            for &(user, pos) in g.outs(m).to_vec().iter() {
                if !g.is_block(user) {
                    continue;
                }
                if links.is_copy(user) || scope.contains(user) {
                    in_edge = Some((m, user, pos as usize));
                } else {
                    out_edges.push((user, pos as usize));
                }
            }
        }

        // forget the exit edges of the dead header
        out_edges.sort_by_key(|&(_, pos)| std::cmp::Reverse(pos));
        for (block, pos) in out_edges {
            remove_block_input(g, block, pos);
        }

        // control flows straight from the previous body into this one
        if let Some((_, in_block, in_pos)) = in_edge {
            debug_assert_eq!(g.arity(hc), 1);
            let pred = g.input(hc, 0);
            g.set_input(in_block, in_pos, pred);
        }
    }

    // stray references into a dead header resolve to the original
    // header's node
    for id in g.ids().collect::<Vec<_>>() {
        if g.is_bad(id) || g.is_block(id) {
            continue;
        }
        if header_copy_set.contains(&g.block_of(id)) {
            continue;
        }
        for i in 0..g.arity(id) {
            let pred = g.input(id, i);
            if g.is_bad(pred) {
                continue;
            }
            if header_copy_set.contains(&g.block_of(pred)) {
                if let Some(orig) = links.origin_of(pred) {
                    g.set_input(id, i, orig);
                }
            }
        }
    }

    for &hc in header_copies {
        for m in g.block_members(hc).to_vec() {
            if !g.is_bad(m) {
                g.kill(m);
            }
        }
        g.remove_keep_alive(hc);
        g.kill(hc);
    }
}

// ---- header condition update ---------------------------------------------

fn is_less(g: &Graph, info: &LinearUnrollInfo) -> bool {
    let less = info.rel == Relation::LESS || info.rel == Relation::LESS_EQUAL;
    let inverted = info.phi == g.input(info.cmp, 1);
    less ^ inverted
}

fn create_pow(g: &mut Graph, block: NodeId, base: NodeId, exp: u64) -> NodeId {
    if exp == 0 {
        let mode = g.mode(base);
        return g.add_raw(
            Op::Const(Tarval::one(mode)),
            mode,
            g.start_block(),
            &[],
        );
    }
    if exp == 1 {
        return base;
    }
    let rest = create_pow(g, block, base, exp - 1);
    let mode = g.mode(base);
    g.add_raw(Op::Mul, mode, block, &[base, rest])
}

/// Rewrite the main loop's compare so the unrolled body never overruns:
/// additive steps move the bound by `|c| * (factor - 1)` towards the
/// start, multiplicative steps divide by `c^factor` and scale back.
fn update_header_condition(g: &mut Graph, info: &LinearUnrollInfo, factor: u32) {
    let cmp = info.cmp;
    let header = g.block_of(cmp);
    let left = g.input(cmp, 0);
    let (n, side) = if left == info.phi {
        (g.input(cmp, 1), 1)
    } else {
        (g.input(cmp, 0), 0)
    };
    let mode = g.mode(n);
    let less = is_less(g, info);

    // the step value, made available at the header
    let c = if let Op::Const(tv) = g.op(info.incr) {
        let tv = *tv;
        let sb = g.start_block();
        g.add_raw(Op::Const(tv), mode, sb, &[])
    } else {
        info.incr
    };
    let sb = g.start_block();
    let factor_const = g.add_raw(
        Op::Const(Tarval::from_u64(factor as u64, mode)),
        mode,
        sb,
        &[],
    );

    let new_n = match info.op {
        IncrOp::Add | IncrOp::Sub => {
            let c_abs = create_abs(g, header, c);
            let one = g.add_raw(Op::Const(Tarval::one(mode)), mode, sb, &[]);
            let factor_offset = g.add_raw(Op::Sub, mode, header, &[factor_const, one]);
            let mul = g.add_raw(Op::Mul, mode, header, &[c_abs, factor_offset]);
            if less {
                g.add_raw(Op::Sub, mode, header, &[n, mul])
            } else {
                g.add_raw(Op::Add, mode, header, &[n, mul])
            }
        }
        IncrOp::Mul => {
            let pow = create_pow(g, header, c, factor as u64);
            let no_mem = g.no_mem();
            let div = g.add_raw(Op::Div, Mode::T, header, &[no_mem, n, pow]);
            let div_res = g.add_raw(Op::Proj(pn::div::RES), mode, header, &[div]);
            g.add_raw(Op::Mul, mode, header, &[c, div_res])
        }
    };
    g.set_input(cmp, side, new_n);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimal_factor_prefers_full_unroll() {
        assert_eq!(find_optimal_factor(4, 8), 4);
        assert_eq!(find_optimal_factor(4, 4), 4);
    }

    #[test]
    fn optimal_factor_picks_power_of_two_divisor() {
        assert_eq!(find_optimal_factor(24, 8), 8);
        assert_eq!(find_optimal_factor(12, 4), 4);
        // no power-of-two divisor below the cap
        assert_eq!(find_optimal_factor(7, 4), 0);
    }

    #[test]
    fn default_config_keeps_static_path_disabled() {
        let cfg = UnrollConfig::default();
        assert!(!cfg.static_enable);
        assert_eq!(cfg.factor, 4);
    }
}
