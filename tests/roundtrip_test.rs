//! Round-trip and idempotence laws: textual IR persistence, local
//! optimizer and loop-closed SSA re-runs, verifier non-mutation.

use sonir::ir::build::Builder;
use sonir::ir::graph::{Graph, GraphProps};
use sonir::ir::mode::Mode;
use sonir::ir::node::Relation;
use sonir::ir::prog::Program;
use sonir::ir::ty::MethodProps;
use sonir::{irio, opt, InitParams};
use std::sync::Arc;

fn build_two_functions() -> (Arc<Program>, Vec<Graph>) {
    let prog = Program::new(InitParams::host());
    let i32t = prog.new_primitive_type(Mode::Is32);
    let ptr_t = prog.new_pointer_type(i32t);

    let id_ty = prog.new_method_type(vec![i32t], vec![i32t], MethodProps::empty());
    let id_ent = prog.new_global_entity("identity", id_ty);
    let mut id_g = prog.new_graph(id_ent, 0);
    {
        let mut b = Builder::new(&mut id_g);
        let a = b.arg(0, Mode::Is32);
        b.ret(&[a]).unwrap();
        b.finalize().unwrap();
    }

    let ld_ty = prog.new_method_type(vec![ptr_t], vec![i32t], MethodProps::PURE);
    let ld_ent = prog.new_global_entity("deref", ld_ty);
    let mut ld_g = prog.new_graph(ld_ent, 0);
    {
        let mut b = Builder::new(&mut ld_g);
        let p = b.arg(0, Mode::P);
        let v = b.load(p, i32t).unwrap();
        b.ret(&[v]).unwrap();
        b.finalize().unwrap();
    }

    (prog, vec![id_g, ld_g])
}

#[test]
fn multi_graph_program_round_trips() {
    let (prog, graphs) = build_two_functions();
    let refs: Vec<&Graph> = graphs.iter().collect();
    let text1 = irio::write_program_to_string(&prog, &refs);

    let (prog2, graphs2) = irio::read_program(&text1, InitParams::host()).unwrap();
    assert_eq!(graphs2.len(), 2);
    let refs2: Vec<&Graph> = graphs2.iter().collect();
    let text2 = irio::write_program_to_string(&prog2, &refs2);
    assert_eq!(text1, text2, "serialize(deserialize(x)) == x");
}

#[test]
fn read_graphs_pass_the_verifier() {
    let (prog, graphs) = build_two_functions();
    let refs: Vec<&Graph> = graphs.iter().collect();
    let text = irio::write_program_to_string(&prog, &refs);
    let (_prog2, mut graphs2) = irio::read_program(&text, InitParams::host()).unwrap();
    for g in graphs2.iter_mut() {
        let mut diag = Vec::new();
        assert!(g.verify(&mut diag), "{}", String::from_utf8_lossy(&diag));
    }
}

#[test]
fn method_properties_survive_persistence() {
    let (prog, graphs) = build_two_functions();
    let refs: Vec<&Graph> = graphs.iter().collect();
    let text = irio::write_program_to_string(&prog, &refs);
    let (prog2, graphs2) = irio::read_program(&text, InitParams::host()).unwrap();
    // the second function's method type carried the pure property
    let deref_ty = prog2.entity_type(graphs2[1].entity());
    assert!(prog2.is_method_pure(deref_ty));
}

fn build_loop_graph() -> Graph {
    let prog = Program::new(InitParams::host());
    let i32t = prog.new_primitive_type(Mode::Is32);
    let mty = prog.new_method_type(vec![i32t], vec![i32t], MethodProps::empty());
    let ent = prog.new_global_entity("looped", mty);
    let mut g = prog.new_graph(ent, 1);
    {
        let mut b = Builder::new(&mut g);
        let n = b.arg(0, Mode::Is32);
        let zero = b.const_i(0, Mode::Is32);
        b.set_value(0, zero);
        let entry_jmp = b.jmp();
        let header = b.new_imm_block();
        b.add_pred(header, entry_jmp);
        b.set_cur_block(header);
        let i = b.get_value(0, Mode::Is32);
        let cmp = b.cmp(i, n, Relation::LESS).unwrap();
        let (exit_proj, body_proj) = b.cond(cmp).unwrap();
        let body = b.new_imm_block();
        b.add_pred(body, body_proj);
        b.mature_block(body);
        b.set_cur_block(body);
        let one = b.const_i(1, Mode::Is32);
        let i_b = b.get_value(0, Mode::Is32);
        let i2 = b.add(i_b, one).unwrap();
        b.set_value(0, i2);
        let back = b.jmp();
        b.add_pred(header, back);
        b.mature_block(header);
        let exit = b.new_imm_block();
        b.add_pred(exit, exit_proj);
        b.mature_block(exit);
        b.set_cur_block(exit);
        let out = b.get_value(0, Mode::Is32);
        b.ret(&[out]).unwrap();
        b.finalize().unwrap();
    }
    g
}

#[test]
fn lcssa_on_closed_graph_is_a_no_op() {
    let mut g = build_loop_graph();
    g.assure(GraphProps::LCSSA);
    let count = g.node_count();
    // force the property stale and re-establish it
    g.confirm(GraphProps::empty());
    g.assure(GraphProps::LCSSA);
    assert_eq!(g.node_count(), count);
}

#[test]
fn local_optimizer_twice_equals_once() {
    let mut g = build_loop_graph();
    opt::local::optimize_graph(&mut g);
    let snapshot: Vec<String> = g
        .ids()
        .filter(|&i| !g.is_bad(i))
        .map(|i| format!("{:?}", g.node(i)))
        .collect();
    opt::local::optimize_graph(&mut g);
    let again: Vec<String> = g
        .ids()
        .filter(|&i| !g.is_bad(i))
        .map(|i| format!("{:?}", g.node(i)))
        .collect();
    assert_eq!(snapshot, again);
}

#[test]
fn verifier_leaves_the_graph_unchanged() {
    let mut g = build_loop_graph();
    g.assure(GraphProps::CONSISTENT_DOMINANCE);
    let before: Vec<String> = g.ids().map(|i| format!("{:?}", g.node(i))).collect();
    let mut diag = Vec::new();
    let fine = g.verify(&mut diag);
    assert!(fine, "{}", String::from_utf8_lossy(&diag));
    let after: Vec<String> = g.ids().map(|i| format!("{:?}", g.node(i))).collect();
    assert_eq!(before, after);
}

#[test]
fn dead_code_elimination_then_round_trip() {
    let mut g = build_loop_graph();
    opt::local::optimize_graph(&mut g);
    opt::dce::dead_node_elimination(&mut g);
    let prog = g.prog().clone();
    let text = irio::write_program_to_string(&prog, &[&g]);
    let (_p2, g2) = irio::read_program(&text, InitParams::host()).unwrap();
    let live = |g: &Graph| g.ids().filter(|&i| !g.is_bad(i)).count();
    assert_eq!(live(&g), live(&g2[0]));
}
