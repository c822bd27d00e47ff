//! The construction facade.
//!
//! A [`Builder`] threads the ambient construction state (current graph,
//! current block, local-variable definitions) as an explicit value. Front
//! ends drive it imperatively: `set_value`/`get_value` read and write
//! numbered local slots, and the builder inserts the minimal phis on
//! demand when control flow merges. Blocks start open, collect their
//! predecessors, and are matured exactly once; reading a slot in an open
//! block yields a placeholder that maturation patches.
//!
//! Every typed constructor routes its node through the local optimizer,
//! so the returned id may be an existing canonical node or a folded
//! constant rather than a fresh node.

use rustc_hash::FxHashMap;

use crate::error::{BuildError, BuildResult};
use crate::ir::graph::Graph;
use crate::ir::mode::Mode;
use crate::ir::node::{pn, NodeData, NodeId, Op, Relation};
use crate::ir::tarval::Tarval;
use crate::ir::ty::{EntityId, TypeId};
use crate::opt::local;

pub struct Builder<'g> {
    g: &'g mut Graph,
    cur_block: NodeId,
    /// Definition of (block, slot); the memory state uses the slot after
    /// the last local.
    defs: FxHashMap<(NodeId, usize), NodeId>,
    /// Placeholder phis of open blocks, patched at maturation.
    incomplete: FxHashMap<NodeId, Vec<(usize, NodeId)>>,
}

impl<'g> Builder<'g> {
    pub fn new(g: &'g mut Graph) -> Builder<'g> {
        let start_block = g.start_block();
        let start = g.start();
        let initial_mem = local::optimize(
            g,
            NodeData::new(Op::Proj(pn::start::M), Mode::M, start_block, &[start]),
        );
        let mut b = Builder {
            g,
            cur_block: start_block,
            defs: FxHashMap::default(),
            incomplete: FxHashMap::default(),
        };
        let mem_slot = b.mem_slot();
        b.defs.insert((start_block, mem_slot), initial_mem);
        b
    }

    pub fn graph(&mut self) -> &mut Graph {
        &mut *self.g
    }

    fn mem_slot(&self) -> usize {
        self.g.n_locals()
    }

    // ---- blocks ----------------------------------------------------------

    pub fn cur_block(&self) -> NodeId {
        self.cur_block
    }

    pub fn set_cur_block(&mut self, block: NodeId) {
        self.cur_block = block;
    }

    /// New open block; use [`Builder::add_pred`] and
    /// [`Builder::mature_block`] to finish it.
    pub fn new_imm_block(&mut self) -> NodeId {
        self.g.new_imm_block()
    }

    /// Append a control-flow predecessor to an open block.
    pub fn add_pred(&mut self, block: NodeId, ctrl: NodeId) {
        if self.g.is_matured(block) {
            crate::init::fatal("add_pred on a matured block");
        }
        self.g.add_input(block, ctrl);
    }

    /// Close the block's arity and patch every placeholder read with the
    /// minimal phi. Maturing twice is a contract violation.
    pub fn mature_block(&mut self, block: NodeId) {
        self.g.mark_matured(block);
        if let Some(pending) = self.incomplete.remove(&block) {
            for (slot, phi) in pending {
                let mode = self.g.mode(phi);
                let arity = self.g.arity(block);
                for i in 0..arity {
                    let pred_block = self.g.cfg_pred_block(block, i);
                    let operand = self.read_var(pred_block, slot, mode);
                    self.g.add_input(phi, operand);
                }
                self.try_remove_trivial(phi);
            }
        }
    }

    // ---- SSA variable machinery ------------------------------------------

    /// Record `node` as the value of local `slot` in the current block.
    pub fn set_value(&mut self, slot: usize, node: NodeId) {
        debug_assert!(slot < self.mem_slot());
        self.defs.insert((self.cur_block, slot), node);
    }

    /// Value of local `slot` in the current block, inserting phis on
    /// demand. On an open block this returns a placeholder phi resolved at
    /// maturation.
    pub fn get_value(&mut self, slot: usize, mode: Mode) -> NodeId {
        debug_assert!(slot < self.mem_slot());
        self.read_var(self.cur_block, slot, mode)
    }

    /// Current memory state.
    pub fn get_store(&mut self) -> NodeId {
        let slot = self.mem_slot();
        self.read_var(self.cur_block, slot, Mode::M)
    }

    pub fn set_store(&mut self, mem: NodeId) {
        let slot = self.mem_slot();
        self.defs.insert((self.cur_block, slot), mem);
    }

    fn read_var(&mut self, block: NodeId, slot: usize, mode: Mode) -> NodeId {
        if let Some(&def) = self.defs.get(&(block, slot)) {
            return def;
        }
        if !self.g.is_matured(block) {
            let phi = self
                .g
                .add_raw(Op::Phi { loop_: false }, mode, block, &[]);
            self.incomplete.entry(block).or_default().push((slot, phi));
            self.defs.insert((block, slot), phi);
            return phi;
        }
        self.read_var_recursive(block, slot, mode)
    }

    fn read_var_recursive(&mut self, block: NodeId, slot: usize, mode: Mode) -> NodeId {
        let arity = self.g.arity(block);
        let val = match arity {
            0 => {
                // no definition reaches: an explicit Unknown
                let sb = self.g.start_block();
                self.g.add_raw(Op::Unknown, mode, sb, &[])
            }
            1 => {
                let pred_block = self.g.cfg_pred_block(block, 0);
                self.read_var(pred_block, slot, mode)
            }
            _ => {
                // write the phi first to terminate cycles through back edges
                let phi = self
                    .g
                    .add_raw(Op::Phi { loop_: false }, mode, block, &[]);
                self.defs.insert((block, slot), phi);
                for i in 0..arity {
                    let pred_block = self.g.cfg_pred_block(block, i);
                    let operand = self.read_var(pred_block, slot, mode);
                    self.g.add_input(phi, operand);
                }
                self.try_remove_trivial(phi)
            }
        };
        self.defs.insert((block, slot), val);
        val
    }

    /// Replace a phi whose operands all agree by the operand; ripples to
    /// phi users that become trivial in turn.
    fn try_remove_trivial(&mut self, phi: NodeId) -> NodeId {
        let mut same: Option<NodeId> = None;
        for &op in self.g.ins(phi) {
            if op == phi {
                continue;
            }
            match same {
                None => same = Some(op),
                Some(s) if s == op => {}
                Some(_) => return phi,
            }
        }
        let replacement = match same {
            Some(s) => s,
            None => {
                let sb = self.g.start_block();
                let mode = self.g.mode(phi);
                self.g.add_raw(Op::Unknown, mode, sb, &[])
            }
        };
        let phi_users: Vec<NodeId> = self
            .g
            .outs(phi)
            .iter()
            .map(|&(u, _)| u)
            .filter(|&u| u != phi && self.g.is_phi(u))
            .collect();
        self.g.exchange(phi, replacement);
        for (_, def) in self.defs.iter_mut() {
            if *def == phi {
                *def = replacement;
            }
        }
        for user in phi_users {
            if !self.g.is_bad(user) {
                self.try_remove_trivial(user);
            }
        }
        replacement
    }

    // ---- typed constructors ----------------------------------------------

    fn opt(&mut self, nd: NodeData) -> NodeId {
        local::optimize(self.g, nd)
    }

    pub fn const_(&mut self, tv: Tarval) -> NodeId {
        let sb = self.g.start_block();
        self.opt(NodeData::new(Op::Const(tv), tv.mode(), sb, &[]))
    }

    pub fn const_i(&mut self, value: i64, mode: Mode) -> NodeId {
        self.const_(Tarval::from_i64(value, mode))
    }

    pub fn address(&mut self, ent: EntityId) -> NodeId {
        let sb = self.g.start_block();
        self.opt(NodeData::new(Op::Address(ent), Mode::P, sb, &[]))
    }

    /// Argument `i` of the current procedure.
    pub fn arg(&mut self, i: u32, mode: Mode) -> NodeId {
        let sb = self.g.start_block();
        let start = self.g.start();
        self.opt(NodeData::new(
            Op::Proj(pn::start::ARGS + i),
            mode,
            sb,
            &[start],
        ))
    }

    fn binop(&mut self, op: Op, l: NodeId, r: NodeId) -> BuildResult<NodeId> {
        let (lm, rm) = (self.g.mode(l), self.g.mode(r));
        if lm != rm {
            return Err(BuildError::ModeDisagreement {
                op: op.name(),
                left: lm,
                right: rm,
            });
        }
        if !lm.is_num() && lm != Mode::B {
            return Err(BuildError::TypeMismatch {
                op: op.name(),
                expected: Mode::Is32,
                found: lm,
            });
        }
        let block = self.cur_block;
        Ok(self.opt(NodeData::new(op, lm, block, &[l, r])))
    }

    pub fn add(&mut self, l: NodeId, r: NodeId) -> BuildResult<NodeId> {
        self.binop(Op::Add, l, r)
    }

    pub fn sub(&mut self, l: NodeId, r: NodeId) -> BuildResult<NodeId> {
        self.binop(Op::Sub, l, r)
    }

    pub fn mul(&mut self, l: NodeId, r: NodeId) -> BuildResult<NodeId> {
        self.binop(Op::Mul, l, r)
    }

    pub fn and(&mut self, l: NodeId, r: NodeId) -> BuildResult<NodeId> {
        self.binop(Op::And, l, r)
    }

    pub fn or(&mut self, l: NodeId, r: NodeId) -> BuildResult<NodeId> {
        self.binop(Op::Or, l, r)
    }

    pub fn eor(&mut self, l: NodeId, r: NodeId) -> BuildResult<NodeId> {
        self.binop(Op::Eor, l, r)
    }

    fn shift(&mut self, op: Op, l: NodeId, r: NodeId) -> BuildResult<NodeId> {
        let (lm, rm) = (self.g.mode(l), self.g.mode(r));
        if !lm.is_int() || !rm.is_int() {
            return Err(BuildError::TypeMismatch {
                op: op.name(),
                expected: Mode::Iu32,
                found: if lm.is_int() { rm } else { lm },
            });
        }
        let block = self.cur_block;
        Ok(self.opt(NodeData::new(op, lm, block, &[l, r])))
    }

    pub fn shl(&mut self, l: NodeId, r: NodeId) -> BuildResult<NodeId> {
        self.shift(Op::Shl, l, r)
    }

    pub fn shr(&mut self, l: NodeId, r: NodeId) -> BuildResult<NodeId> {
        self.shift(Op::Shr, l, r)
    }

    pub fn shrs(&mut self, l: NodeId, r: NodeId) -> BuildResult<NodeId> {
        self.shift(Op::Shrs, l, r)
    }

    pub fn minus(&mut self, v: NodeId) -> BuildResult<NodeId> {
        let m = self.g.mode(v);
        if !m.is_num() {
            return Err(BuildError::TypeMismatch {
                op: "Minus",
                expected: Mode::Is32,
                found: m,
            });
        }
        let block = self.cur_block;
        Ok(self.opt(NodeData::new(Op::Minus, m, block, &[v])))
    }

    pub fn not(&mut self, v: NodeId) -> BuildResult<NodeId> {
        let m = self.g.mode(v);
        if !m.is_int() && m != Mode::B {
            return Err(BuildError::TypeMismatch {
                op: "Not",
                expected: Mode::B,
                found: m,
            });
        }
        let block = self.cur_block;
        Ok(self.opt(NodeData::new(Op::Not, m, block, &[v])))
    }

    pub fn conv(&mut self, v: NodeId, to: Mode) -> BuildResult<NodeId> {
        let from = self.g.mode(v);
        if !from.convertible_to(to) {
            return Err(BuildError::TypeMismatch {
                op: "Conv",
                expected: to,
                found: from,
            });
        }
        let block = self.cur_block;
        Ok(self.opt(NodeData::new(Op::Conv, to, block, &[v])))
    }

    pub fn cmp(&mut self, l: NodeId, r: NodeId, rel: Relation) -> BuildResult<NodeId> {
        let (lm, rm) = (self.g.mode(l), self.g.mode(r));
        if lm != rm {
            return Err(BuildError::ModeDisagreement {
                op: "Cmp",
                left: lm,
                right: rm,
            });
        }
        let block = self.cur_block;
        Ok(self.opt(NodeData::new(Op::Cmp(rel), Mode::B, block, &[l, r])))
    }

    pub fn mux(&mut self, sel: NodeId, if_false: NodeId, if_true: NodeId) -> BuildResult<NodeId> {
        if self.g.mode(sel) != Mode::B {
            return Err(BuildError::TypeMismatch {
                op: "Mux",
                expected: Mode::B,
                found: self.g.mode(sel),
            });
        }
        let m = self.g.mode(if_false);
        if m != self.g.mode(if_true) {
            return Err(BuildError::ModeDisagreement {
                op: "Mux",
                left: m,
                right: self.g.mode(if_true),
            });
        }
        let block = self.cur_block;
        Ok(self.opt(NodeData::new(Op::Mux, m, block, &[sel, if_false, if_true])))
    }

    /// Two-way branch; returns `(false_proj, true_proj)`.
    pub fn cond(&mut self, sel: NodeId) -> BuildResult<(NodeId, NodeId)> {
        if self.g.mode(sel) != Mode::B {
            return Err(BuildError::TypeMismatch {
                op: "Cond",
                expected: Mode::B,
                found: self.g.mode(sel),
            });
        }
        let block = self.cur_block;
        let cond = self.opt(NodeData::new(Op::Cond, Mode::T, block, &[sel]));
        let f = self.opt(NodeData::new(
            Op::Proj(pn::cond::FALSE),
            Mode::X,
            block,
            &[cond],
        ));
        let t = self.opt(NodeData::new(
            Op::Proj(pn::cond::TRUE),
            Mode::X,
            block,
            &[cond],
        ));
        Ok((f, t))
    }

    pub fn jmp(&mut self) -> NodeId {
        let block = self.cur_block;
        self.opt(NodeData::new(Op::Jmp, Mode::X, block, &[]))
    }

    pub fn proj(&mut self, pred: NodeId, num: u32, mode: Mode) -> NodeId {
        let block = self.g.block_of(pred);
        self.opt(NodeData::new(Op::Proj(num), mode, block, &[pred]))
    }

    /// Load a value of type `ty`; threads the memory state.
    pub fn load(&mut self, ptr: NodeId, ty: TypeId) -> BuildResult<NodeId> {
        if self.g.mode(ptr) != Mode::P {
            return Err(BuildError::TypeMismatch {
                op: "Load",
                expected: Mode::P,
                found: self.g.mode(ptr),
            });
        }
        let mem = self.get_store();
        let block = self.cur_block;
        let load = self.opt(NodeData::new(Op::Load(ty), Mode::T, block, &[mem, ptr]));
        let value_mode = self.g.prog().type_mode(ty);
        let res = self.proj(load, pn::load::RES, value_mode);
        let forwarded = !(matches!(self.g.op(res), Op::Proj(_)) && self.g.input(res, 0) == load);
        if forwarded {
            // the value came straight from a dominating store; the load
            // never happens and the memory chain stays on `mem`
            self.g.kill(load);
        } else {
            let m = self.proj(load, pn::load::M, Mode::M);
            self.set_store(m);
        }
        Ok(res)
    }

    /// Store a value of type `ty`; threads the memory state.
    pub fn store(&mut self, ptr: NodeId, value: NodeId, ty: TypeId) -> BuildResult<NodeId> {
        if self.g.mode(ptr) != Mode::P {
            return Err(BuildError::TypeMismatch {
                op: "Store",
                expected: Mode::P,
                found: self.g.mode(ptr),
            });
        }
        let expected = self.g.prog().type_mode(ty);
        if self.g.mode(value) != expected {
            return Err(BuildError::TypeMismatch {
                op: "Store",
                expected,
                found: self.g.mode(value),
            });
        }
        let mem = self.get_store();
        let block = self.cur_block;
        let store = self.opt(NodeData::new(
            Op::Store(ty),
            Mode::T,
            block,
            &[mem, ptr, value],
        ));
        let m = self.proj(store, pn::store::M, Mode::M);
        self.set_store(m);
        Ok(store)
    }

    /// Call through `callee` (usually an Address) with the given method
    /// type; threads the memory state. Use [`Builder::call_result`] for
    /// the results.
    pub fn call(
        &mut self,
        callee: NodeId,
        args: &[NodeId],
        method_ty: TypeId,
    ) -> BuildResult<NodeId> {
        if self.g.mode(callee) != Mode::P {
            return Err(BuildError::TypeMismatch {
                op: "Call",
                expected: Mode::P,
                found: self.g.mode(callee),
            });
        }
        let mem = self.get_store();
        let block = self.cur_block;
        let mut ins = vec![mem, callee];
        ins.extend_from_slice(args);
        let call = self.opt(NodeData::new(Op::Call(method_ty), Mode::T, block, &ins));
        let m = self.proj(call, pn::call::M, Mode::M);
        self.set_store(m);
        Ok(call)
    }

    pub fn call_result(&mut self, call: NodeId, i: u32, mode: Mode) -> NodeId {
        self.proj(call, pn::call::RES + i, mode)
    }

    /// Allocate `size` bytes on the stack; returns the address.
    pub fn alloc(&mut self, size: NodeId, alignment: u32) -> BuildResult<NodeId> {
        let mem = self.get_store();
        let block = self.cur_block;
        let alloc = self.opt(NodeData::new(
            Op::Alloc(alignment),
            Mode::T,
            block,
            &[mem, size],
        ));
        let m = self.proj(alloc, pn::alloc::M, Mode::M);
        self.set_store(m);
        Ok(self.proj(alloc, pn::alloc::RES, Mode::P))
    }

    /// Address of member `ent` of the compound `ptr` points to.
    pub fn member(&mut self, ptr: NodeId, ent: EntityId) -> BuildResult<NodeId> {
        if self.g.mode(ptr) != Mode::P {
            return Err(BuildError::TypeMismatch {
                op: "Member",
                expected: Mode::P,
                found: self.g.mode(ptr),
            });
        }
        let block = self.cur_block;
        Ok(self.opt(NodeData::new(Op::Member(ent), Mode::P, block, &[ptr])))
    }

    /// Address of element `index` of the array `ptr` points to.
    pub fn sel(&mut self, ptr: NodeId, index: NodeId, array_ty: TypeId) -> BuildResult<NodeId> {
        if self.g.mode(ptr) != Mode::P {
            return Err(BuildError::TypeMismatch {
                op: "Sel",
                expected: Mode::P,
                found: self.g.mode(ptr),
            });
        }
        if !self.g.mode(index).is_int() {
            return Err(BuildError::TypeMismatch {
                op: "Sel",
                expected: Mode::Is64,
                found: self.g.mode(index),
            });
        }
        let block = self.cur_block;
        Ok(self.opt(NodeData::new(Op::Sel(array_ty), Mode::P, block, &[ptr, index])))
    }

    /// Return from the procedure; wires the new Return into the end block.
    pub fn ret(&mut self, values: &[NodeId]) -> BuildResult<NodeId> {
        let mem = self.get_store();
        let block = self.cur_block;
        let mut ins = vec![mem];
        ins.extend_from_slice(values);
        let ret = self.opt(NodeData::new(Op::Return, Mode::X, block, &ins));
        let end_block = self.g.end_block();
        self.g.add_input(end_block, ret);
        Ok(ret)
    }

    /// Mature the end block and hand the graph over to the passes. Fails
    /// when a block other than the end block is still open.
    pub fn finalize(mut self) -> BuildResult<()> {
        let end_block = self.g.end_block();
        if !self.g.is_matured(end_block) {
            self.mature_block(end_block);
        }
        if let Some(open) = self.g.first_open_block() {
            return Err(BuildError::OpenBlock(open));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::InitParams;
    use crate::ir::prog::Program;
    use crate::ir::ty::MethodProps;
    use std::sync::Arc;

    fn graph_with(n_args: usize, n_locals: usize) -> (Arc<Program>, Graph) {
        let prog = Program::new(InitParams::host());
        let i32t = prog.new_primitive_type(Mode::Is32);
        let mty = prog.new_method_type(vec![i32t; n_args], vec![i32t], MethodProps::empty());
        let ent = prog.new_global_entity("f", mty);
        let g = prog.new_graph(ent, n_locals);
        (prog, g)
    }

    #[test]
    fn straight_line_function() {
        let (_p, mut g) = graph_with(2, 0);
        let mut b = Builder::new(&mut g);
        let a0 = b.arg(0, Mode::Is32);
        let a1 = b.arg(1, Mode::Is32);
        let sum = b.add(a0, a1).unwrap();
        b.ret(&[sum]).unwrap();
        b.finalize().unwrap();
        assert_eq!(g.open_block_count(), 0);
    }

    #[test]
    fn mode_mismatch_is_reported() {
        let (_p, mut g) = graph_with(1, 0);
        let mut b = Builder::new(&mut g);
        let a0 = b.arg(0, Mode::Is32);
        let f = b.const_(Tarval::from_f64(1.0, Mode::F64));
        let err = b.add(a0, f).unwrap_err();
        assert!(matches!(err, BuildError::ModeDisagreement { .. }));
    }

    #[test]
    fn phi_inserted_at_merge() {
        let (_p, mut g) = graph_with(1, 1);
        let mut b = Builder::new(&mut g);
        let a0 = b.arg(0, Mode::Is32);
        let two = b.const_i(2, Mode::Is32);
        let cmp = b.cmp(a0, two, Relation::GREATER).unwrap();
        let (f_proj, t_proj) = b.cond(cmp).unwrap();

        let then_block = b.new_imm_block();
        b.add_pred(then_block, t_proj);
        b.mature_block(then_block);
        b.set_cur_block(then_block);
        let one = b.const_i(1, Mode::Is32);
        b.set_value(0, one);
        let then_jmp = b.jmp();

        let else_block = b.new_imm_block();
        b.add_pred(else_block, f_proj);
        b.mature_block(else_block);
        b.set_cur_block(else_block);
        b.set_value(0, a0);
        let else_jmp = b.jmp();

        let merge = b.new_imm_block();
        b.add_pred(merge, then_jmp);
        b.add_pred(merge, else_jmp);
        b.mature_block(merge);
        b.set_cur_block(merge);
        let v = b.get_value(0, Mode::Is32);
        assert!(b.graph().is_phi(v));
        assert_eq!(b.graph().arity(v), 2);
        b.ret(&[v]).unwrap();
        b.finalize().unwrap();
    }

    #[test]
    fn trivial_phi_is_removed() {
        let (_p, mut g) = graph_with(1, 1);
        let mut b = Builder::new(&mut g);
        let a0 = b.arg(0, Mode::Is32);
        b.set_value(0, a0);
        let two = b.const_i(2, Mode::Is32);
        let cmp = b.cmp(a0, two, Relation::GREATER).unwrap();
        let (f_proj, t_proj) = b.cond(cmp).unwrap();

        // both sides leave the variable untouched
        let then_block = b.new_imm_block();
        b.add_pred(then_block, t_proj);
        b.mature_block(then_block);
        b.set_cur_block(then_block);
        let then_jmp = b.jmp();

        let else_block = b.new_imm_block();
        b.add_pred(else_block, f_proj);
        b.mature_block(else_block);
        b.set_cur_block(else_block);
        let else_jmp = b.jmp();

        let merge = b.new_imm_block();
        b.add_pred(merge, then_jmp);
        b.add_pred(merge, else_jmp);
        b.mature_block(merge);
        b.set_cur_block(merge);
        let v = b.get_value(0, Mode::Is32);
        assert_eq!(v, a0);
    }

    #[test]
    fn open_block_read_yields_placeholder() {
        let (_p, mut g) = graph_with(0, 1);
        let mut b = Builder::new(&mut g);
        let jmp = b.jmp();
        let loop_header = b.new_imm_block();
        b.add_pred(loop_header, jmp);
        b.set_cur_block(loop_header);
        // read before maturation: placeholder phi
        let v = b.get_value(0, Mode::Is32);
        assert!(b.graph().is_phi(v));
        assert_eq!(b.graph().arity(v), 0);

        let one = b.const_i(1, Mode::Is32);
        let next = b.add(v, one).unwrap();
        b.set_value(0, next);
        let back = b.jmp();
        b.add_pred(loop_header, back);
        b.mature_block(loop_header);
        // after maturation the placeholder has one input per predecessor
        assert_eq!(b.graph().arity(v), 2);
    }

    #[test]
    fn finalize_reports_open_blocks() {
        let (_p, mut g) = graph_with(0, 0);
        let mut b = Builder::new(&mut g);
        let _orphan = b.new_imm_block();
        b.ret(&[]).unwrap();
        assert!(matches!(
            b.finalize(),
            Err(BuildError::OpenBlock(_))
        ));
    }
}
