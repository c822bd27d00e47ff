//! Call inlining.
//!
//! Splices the body of a known callee into the caller at a Call site:
//! argument projections map to the call's arguments, the callee's initial
//! memory maps to the call's memory input, and the Return's operands
//! replace the call's result projections. Only straight-line callees
//! (every node in the entry block, exactly one Return) are inlined; a
//! declined callee leaves the graph untouched.

use rustc_hash::FxHashMap;

use crate::ir::graph::Graph;
use crate::ir::node::{pn, NodeId, Op};

/// Inline `call` (a Call node in `g`) using the finished `callee` graph.
/// Returns false when the callee shape is not supported; the graph is
/// unchanged in that case.
pub fn inline_call(g: &mut Graph, call: NodeId, callee: &Graph) -> bool {
    debug_assert!(matches!(g.op(call), Op::Call(_)));

    // exactly one Return, and every callee node lives in the entry block
    let mut returns = Vec::new();
    for &pred in callee.ins(callee.end_block()) {
        if matches!(callee.op(pred), Op::Return) {
            returns.push(pred);
        }
    }
    if returns.len() != 1 {
        log::debug!("inline: callee has {} returns, declining", returns.len());
        return false;
    }
    let ret = returns[0];
    if callee.block_of(ret) != callee.start_block() {
        log::debug!("inline: callee has control flow, declining");
        return false;
    }
    for id in callee.ids() {
        if callee.is_bad(id) || callee.is_block(id) {
            continue;
        }
        let block = callee.block_of(id);
        if block != callee.start_block() && block != callee.end_block() {
            log::debug!("inline: callee has control flow, declining");
            return false;
        }
        if matches!(callee.op(id), Op::Proj(n) if *n == pn::start::FRAME)
            && callee.n_outs(id) > 0
        {
            log::debug!("inline: callee uses its frame, declining");
            return false;
        }
    }

    let call_block = g.block_of(call);
    let call_mem = g.input(call, 0);
    let call_args: Vec<NodeId> = g.ins(call)[2..].to_vec();

    // copy the callee body into the caller, mapping the seam nodes
    let mut map: FxHashMap<NodeId, NodeId> = FxHashMap::default();
    map.insert(callee.no_mem(), g.no_mem());

    fn copy_rec(
        g: &mut Graph,
        callee: &Graph,
        n: NodeId,
        call_block: NodeId,
        call_mem: NodeId,
        call_args: &[NodeId],
        map: &mut FxHashMap<NodeId, NodeId>,
    ) -> NodeId {
        if let Some(&mapped) = map.get(&n) {
            return mapped;
        }
        let mapped = match callee.op(n) {
            Op::Proj(num) if matches!(callee.op(callee.input(n, 0)), Op::Start) => {
                let num = *num;
                if num == pn::start::M {
                    call_mem
                } else if num >= pn::start::ARGS {
                    let idx = (num - pn::start::ARGS) as usize;
                    call_args.get(idx).copied().unwrap_or_else(|| {
                        let mode = callee.mode(n);
                        let sb = g.start_block();
                        g.add_raw(Op::Unknown, mode, sb, &[])
                    })
                } else {
                    g.frame()
                }
            }
            Op::Const(tv) => {
                let tv = *tv;
                let mode = callee.mode(n);
                let sb = g.start_block();
                g.add_raw(Op::Const(tv), mode, sb, &[])
            }
            op => {
                let op = op.clone();
                let mode = callee.mode(n);
                let ins: Vec<NodeId> = callee
                    .ins(n)
                    .iter()
                    .map(|&p| copy_rec(g, callee, p, call_block, call_mem, call_args, map))
                    .collect();
                g.add_raw(op, mode, call_block, &ins)
            }
        };
        map.insert(n, mapped);
        mapped
    }

    // the return's operands become the call's results
    let ret_mem = copy_rec(
        g,
        callee,
        callee.input(ret, 0),
        call_block,
        call_mem,
        &call_args,
        &mut map,
    );
    let mut ret_vals = Vec::new();
    for i in 1..callee.arity(ret) {
        let v = copy_rec(
            g,
            callee,
            callee.input(ret, i),
            call_block,
            call_mem,
            &call_args,
            &mut map,
        );
        ret_vals.push(v);
    }

    // reroute the call's projections
    for (user, _) in g.outs(call).to_vec() {
        if let Op::Proj(num) = g.op(user).clone() {
            if num == pn::call::M {
                g.exchange(user, ret_mem);
            } else {
                let idx = (num - pn::call::RES) as usize;
                if let Some(&v) = ret_vals.get(idx) {
                    g.exchange(user, v);
                }
            }
        }
    }
    g.kill(call);
    log::debug!("inlined call, {} result values", ret_vals.len());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::InitParams;
    use crate::ir::build::Builder;
    use crate::ir::mode::Mode;
    use crate::ir::prog::Program;
    use crate::ir::ty::MethodProps;
    use std::sync::Arc;

    fn prog() -> Arc<Program> {
        Program::new(InitParams::host())
    }

    #[test]
    fn straight_line_callee_is_spliced() {
        let p = prog();
        let i32t = p.new_primitive_type(Mode::Is32);

        // callee: fn double(x) { return x + x; }
        let dbl_ty = p.new_method_type(vec![i32t], vec![i32t], MethodProps::empty());
        let dbl_ent = p.new_global_entity("double", dbl_ty);
        let mut callee = p.new_graph(dbl_ent, 0);
        {
            let mut b = Builder::new(&mut callee);
            let x = b.arg(0, Mode::Is32);
            let two_x = b.add(x, x).unwrap();
            b.ret(&[two_x]).unwrap();
            b.finalize().unwrap();
        }

        // caller: fn f(a) { return double(a); }
        let f_ty = p.new_method_type(vec![i32t], vec![i32t], MethodProps::empty());
        let f_ent = p.new_global_entity("f", f_ty);
        let mut caller = p.new_graph(f_ent, 0);
        let (call, ret);
        {
            let mut b = Builder::new(&mut caller);
            let a = b.arg(0, Mode::Is32);
            let callee_addr = b.address(dbl_ent);
            call = b.call(callee_addr, &[a], dbl_ty).unwrap();
            let res = b.call_result(call, 0, Mode::Is32);
            ret = b.ret(&[res]).unwrap();
            b.finalize().unwrap();
        }

        assert!(inline_call(&mut caller, call, &callee));
        crate::opt::local::optimize_graph(&mut caller);
        crate::opt::dce::dead_node_elimination(&mut caller);

        // no call remains, and the return computes a + a
        for id in caller.ids() {
            assert!(
                !matches!(caller.op(id), Op::Call(_)),
                "call must be gone after inlining"
            );
        }
        let result = caller.input(ret, 1);
        assert!(matches!(caller.op(result), Op::Add));
    }

    #[test]
    fn multi_block_callee_is_declined() {
        let p = prog();
        let i32t = p.new_primitive_type(Mode::Is32);
        let ty = p.new_method_type(vec![i32t], vec![i32t], MethodProps::empty());
        let ent = p.new_global_entity("branchy", ty);
        let mut callee = p.new_graph(ent, 0);
        {
            let mut b = Builder::new(&mut callee);
            let x = b.arg(0, Mode::Is32);
            let zero = b.const_i(0, Mode::Is32);
            let cmp = b
                .cmp(x, zero, crate::ir::node::Relation::GREATER)
                .unwrap();
            let (f_proj, t_proj) = b.cond(cmp).unwrap();
            let bt = b.new_imm_block();
            b.add_pred(bt, t_proj);
            b.mature_block(bt);
            b.set_cur_block(bt);
            b.ret(&[x]).unwrap();
            let bf = b.new_imm_block();
            b.add_pred(bf, f_proj);
            b.mature_block(bf);
            b.set_cur_block(bf);
            b.ret(&[zero]).unwrap();
            b.finalize().unwrap();
        }

        let f_ent = p.new_global_entity("g", ty);
        let mut caller = p.new_graph(f_ent, 0);
        let call;
        {
            let mut b = Builder::new(&mut caller);
            let a = b.arg(0, Mode::Is32);
            let addr = b.address(ent);
            call = b.call(addr, &[a], ty).unwrap();
            let res = b.call_result(call, 0, Mode::Is32);
            b.ret(&[res]).unwrap();
            b.finalize().unwrap();
        }
        let before = caller.node_count();
        assert!(!inline_call(&mut caller, call, &callee));
        assert_eq!(caller.node_count(), before);
    }
}
