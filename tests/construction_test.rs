//! Facade construction and local-optimization scenarios: an empty
//! procedure, a short-circuit conditional, and inlining with store-load
//! forwarding.

use sonir::ir::build::Builder;
use sonir::ir::graph::Graph;
use sonir::ir::mode::Mode;
use sonir::ir::node::{Op, Relation};
use sonir::ir::prog::Program;
use sonir::ir::tarval::Tarval;
use sonir::ir::ty::MethodProps;
use sonir::opt;
use sonir::InitParams;
use std::sync::Arc;

fn live_ops(g: &Graph) -> Vec<&'static str> {
    g.ids()
        .filter(|&id| !g.is_bad(id))
        .map(|id| g.op(id).name())
        .collect()
}

fn count_op(g: &Graph, name: &str) -> usize {
    live_ops(g).iter().filter(|&&n| n == name).count()
}

#[test]
fn empty_main_builds_and_verifies() {
    let prog = Program::new(InitParams::host());
    let mty = prog.new_method_type(vec![], vec![], MethodProps::empty());
    let ent = prog.new_global_entity("main", mty);
    let mut g = prog.new_graph(ent, 0);
    {
        let mut b = Builder::new(&mut g);
        b.ret(&[]).unwrap();
        b.finalize().unwrap();
    }
    let mut diag = Vec::new();
    assert!(g.verify(&mut diag));
    assert!(diag.is_empty());
    assert_eq!(count_op(&g, "Return"), 1);
    assert_eq!(g.open_block_count(), 0);
}

/// `int f(int a) { return (a > 2 && a < 10) ? 1 : a; }`
fn build_conditional() -> (Arc<Program>, Graph) {
    let prog = Program::new(InitParams::host());
    let i32t = prog.new_primitive_type(Mode::Is32);
    let mty = prog.new_method_type(vec![i32t], vec![i32t], MethodProps::empty());
    let ent = prog.new_global_entity("f", mty);
    let mut g = prog.new_graph(ent, 1);
    {
        let mut b = Builder::new(&mut g);
        let a = b.arg(0, Mode::Is32);
        let two = b.const_i(2, Mode::Is32);
        let ten = b.const_i(10, Mode::Is32);
        let gt = b.cmp(a, two, Relation::GREATER).unwrap();
        let lt = b.cmp(a, ten, Relation::LESS).unwrap();
        let both = b.and(gt, lt).unwrap();
        let (f_proj, t_proj) = b.cond(both).unwrap();

        let then_b = b.new_imm_block();
        b.add_pred(then_b, t_proj);
        b.mature_block(then_b);
        b.set_cur_block(then_b);
        let one = b.const_i(1, Mode::Is32);
        b.set_value(0, one);
        let tj = b.jmp();

        let else_b = b.new_imm_block();
        b.add_pred(else_b, f_proj);
        b.mature_block(else_b);
        b.set_cur_block(else_b);
        b.set_value(0, a);
        let ej = b.jmp();

        let merge = b.new_imm_block();
        b.add_pred(merge, tj);
        b.add_pred(merge, ej);
        b.mature_block(merge);
        b.set_cur_block(merge);
        let v = b.get_value(0, Mode::Is32);
        b.ret(&[v]).unwrap();
        b.finalize().unwrap();
    }
    (prog, g)
}

#[test]
fn conditional_has_expected_shape() {
    let (_prog, mut g) = build_conditional();
    opt::local::optimize_graph(&mut g);
    opt::dce::dead_node_elimination(&mut g);

    // one greater-compare, one less-compare, one And, one Cond, one phi
    let cmps: Vec<Relation> = g
        .ids()
        .filter(|&id| !g.is_bad(id))
        .filter_map(|id| match g.op(id) {
            Op::Cmp(rel) => Some(*rel),
            _ => None,
        })
        .collect();
    assert_eq!(cmps.len(), 2);
    assert!(cmps.contains(&Relation::GREATER));
    assert!(cmps.contains(&Relation::LESS));
    assert_eq!(count_op(&g, "And"), 1);
    assert_eq!(count_op(&g, "Cond"), 1);
    assert_eq!(count_op(&g, "Phi"), 1);

    // no folding happened: the compares still read the argument
    let mut diag = Vec::new();
    assert!(g.verify(&mut diag), "{}", String::from_utf8_lossy(&diag));
}

#[test]
fn conditional_folds_once_the_argument_is_constant() {
    // the same body built around a constant folds completely at
    // construction time
    let prog = Program::new(InitParams::host());
    let i32t = prog.new_primitive_type(Mode::Is32);
    let mty = prog.new_method_type(vec![], vec![i32t], MethodProps::empty());
    let ent = prog.new_global_entity("f5", mty);
    let mut g = prog.new_graph(ent, 0);
    {
        let mut b = Builder::new(&mut g);
        let a = b.const_i(5, Mode::Is32);
        let two = b.const_i(2, Mode::Is32);
        let ten = b.const_i(10, Mode::Is32);
        let gt = b.cmp(a, two, Relation::GREATER).unwrap();
        let lt = b.cmp(a, ten, Relation::LESS).unwrap();
        let both = b.and(gt, lt).unwrap();
        // 5 > 2 && 5 < 10 folds to true at construction
        assert!(matches!(b.graph().op(both), Op::Const(tv) if !tv.is_null()));
    }
}

/// Setter/getter pair on a fresh allocation; inlining plus local
/// optimization forwards the stored value and removes every call and
/// load.
#[test]
fn inline_and_cse_forward_the_stored_value() {
    let prog = Program::new(InitParams::host());
    let i32t = prog.new_primitive_type(Mode::Is32);
    let ptr_t = prog.new_pointer_type(i32t);

    let set_ty = prog.new_method_type(vec![ptr_t, i32t], vec![], MethodProps::empty());
    let set_ent = prog.new_global_entity("setter", set_ty);
    let mut setter = prog.new_graph(set_ent, 0);
    {
        let mut b = Builder::new(&mut setter);
        let p = b.arg(0, Mode::P);
        let v = b.arg(1, Mode::Is32);
        b.store(p, v, i32t).unwrap();
        b.ret(&[]).unwrap();
        b.finalize().unwrap();
    }

    let get_ty = prog.new_method_type(vec![ptr_t], vec![i32t], MethodProps::empty());
    let get_ent = prog.new_global_entity("getter", get_ty);
    let mut getter = prog.new_graph(get_ent, 0);
    {
        let mut b = Builder::new(&mut getter);
        let p = b.arg(0, Mode::P);
        let v = b.load(p, i32t).unwrap();
        b.ret(&[v]).unwrap();
        b.finalize().unwrap();
    }

    let f_ty = prog.new_method_type(vec![i32t], vec![i32t], MethodProps::empty());
    let f_ent = prog.new_global_entity("f", f_ty);
    let mut caller = prog.new_graph(f_ent, 0);
    let (set_call, get_call, ret);
    {
        let mut b = Builder::new(&mut caller);
        let arg = b.arg(0, Mode::Is32);
        let four = b.const_i(4, Mode::Iu64);
        let p = b.alloc(four, 4).unwrap();
        let seven = b.const_i(7, Mode::Is32);
        let set_addr = b.address(set_ent);
        set_call = b.call(set_addr, &[p, seven], set_ty).unwrap();
        let get_addr = b.address(get_ent);
        get_call = b.call(get_addr, &[p], get_ty).unwrap();
        let x = b.call_result(get_call, 0, Mode::Is32);
        let sum = b.add(arg, x).unwrap();
        ret = b.ret(&[sum]).unwrap();
        b.finalize().unwrap();
    }

    assert!(opt::inline::inline_call(&mut caller, set_call, &setter));
    assert!(opt::inline::inline_call(&mut caller, get_call, &getter));
    opt::local::optimize_graph(&mut caller);
    opt::dce::remove_dead_loads(&mut caller);
    opt::dce::dead_node_elimination(&mut caller);

    assert_eq!(count_op(&caller, "Call"), 0, "calls must be inlined away");
    assert_eq!(count_op(&caller, "Load"), 0, "the load must be forwarded");

    // the function returns arg + 7
    let sum = caller.input(ret, 1);
    assert!(matches!(caller.op(sum), Op::Add));
    let operands: Vec<_> = caller.ins(sum).to_vec();
    let has_const7 = operands
        .iter()
        .any(|&o| matches!(caller.op(o), Op::Const(tv) if tv.as_i64() == 7));
    assert!(has_const7, "the stored constant is forwarded into the add");
}

#[test]
fn local_optimizer_is_idempotent_on_a_whole_graph() {
    let (_prog, mut g) = build_conditional();
    opt::local::optimize_graph(&mut g);
    let before = g.node_count();
    let text_probe: Vec<&str> = live_ops(&g);
    opt::local::optimize_graph(&mut g);
    assert_eq!(g.node_count(), before);
    assert_eq!(live_ops(&g), text_probe);
}

#[test]
fn verifier_flags_phi_arity_mismatch() {
    let (_prog, mut g) = build_conditional();
    // break a phi on purpose
    let phi = g
        .ids()
        .find(|&id| g.is_phi(id) && g.mode(id) == Mode::Is32)
        .unwrap();
    let first = g.input(phi, 0);
    g.set_inputs(phi, &[first]);
    let mut diag = Vec::new();
    assert!(!g.verify(&mut diag));
    let text = String::from_utf8(diag).unwrap();
    assert!(text.contains("phi arity"));
}

#[test]
fn constants_live_in_the_start_block_and_are_shared() {
    let prog = Program::new(InitParams::host());
    let i32t = prog.new_primitive_type(Mode::Is32);
    let mty = prog.new_method_type(vec![], vec![i32t], MethodProps::empty());
    let ent = prog.new_global_entity("c", mty);
    let mut g = prog.new_graph(ent, 0);
    let mut b = Builder::new(&mut g);
    let c1 = b.const_(Tarval::from_i64(42, Mode::Is32));
    let c2 = b.const_(Tarval::from_i64(42, Mode::Is32));
    assert_eq!(c1, c2);
    assert_eq!(b.graph().block_of(c1), b.graph().start_block());
}
