//! End-to-end back-end runs: emitted assembly for whole procedures plus
//! verifier behavior on the pipeline results.

use sonir::be::{self, TargetRegistry};
use sonir::ir::build::Builder;
use sonir::ir::graph::Graph;
use sonir::ir::mode::Mode;
use sonir::ir::node::Relation;
use sonir::ir::prog::Program;
use sonir::ir::ty::MethodProps;
use sonir::InitParams;
use std::sync::Arc;

fn compile(g: &mut Graph) -> (String, String) {
    let registry = TargetRegistry::with_builtins();
    let target = registry.get("amd64").unwrap();
    let mut out = Vec::new();
    let mut diag = Vec::new();
    be::generate_code(g, target, &mut out, &mut diag).unwrap();
    (
        String::from_utf8(out).unwrap(),
        String::from_utf8(diag).unwrap(),
    )
}

fn empty_main() -> (Arc<Program>, Graph) {
    let prog = Program::new(InitParams::host());
    let mty = prog.new_method_type(vec![], vec![], MethodProps::empty());
    let ent = prog.new_global_entity("main", mty);
    let mut g = prog.new_graph(ent, 0);
    {
        let mut b = Builder::new(&mut g);
        b.ret(&[]).unwrap();
        b.finalize().unwrap();
    }
    (prog, g)
}

#[test]
fn empty_main_emits_label_and_single_return() {
    let (_prog, mut g) = empty_main();
    let (asm, _diag) = compile(&mut g);

    assert!(asm.contains(".globl\tmain"));
    assert_eq!(asm.matches("main:").count(), 1, "exactly one entry label");
    assert_eq!(asm.matches("\tret").count(), 1, "exactly one return");
    // a zero-sized frame gets no stack adjustment at all
    assert!(!asm.contains("%rsp"));
}

#[test]
fn add_function_computes_into_rax() {
    let prog = Program::new(InitParams::host());
    let i64t = prog.new_primitive_type(Mode::Is64);
    let mty = prog.new_method_type(vec![i64t; 2], vec![i64t], MethodProps::empty());
    let ent = prog.new_global_entity("addq2", mty);
    let mut g = prog.new_graph(ent, 0);
    {
        let mut b = Builder::new(&mut g);
        let a0 = b.arg(0, Mode::Is64);
        let a1 = b.arg(1, Mode::Is64);
        let sum = b.add(a0, a1).unwrap();
        b.ret(&[sum]).unwrap();
        b.finalize().unwrap();
    }
    let (asm, diag) = compile(&mut g);
    assert!(asm.contains("addq"), "assembly:\n{}", asm);
    assert!(asm.contains("\tret"));
    assert!(
        !diag.contains("share a register"),
        "verifier findings:\n{}",
        diag
    );
}

#[test]
fn conditional_emits_compare_and_branches() {
    let prog = Program::new(InitParams::host());
    let i64t = prog.new_primitive_type(Mode::Is64);
    let mty = prog.new_method_type(vec![i64t], vec![i64t], MethodProps::empty());
    let ent = prog.new_global_entity("clamp", mty);
    let mut g = prog.new_graph(ent, 1);
    {
        let mut b = Builder::new(&mut g);
        let a = b.arg(0, Mode::Is64);
        let zero = b.const_i(0, Mode::Is64);
        let cmp = b.cmp(a, zero, Relation::LESS).unwrap();
        let (f_proj, t_proj) = b.cond(cmp).unwrap();

        let neg_b = b.new_imm_block();
        b.add_pred(neg_b, t_proj);
        b.mature_block(neg_b);
        b.set_cur_block(neg_b);
        b.set_value(0, zero);
        let tj = b.jmp();

        let pos_b = b.new_imm_block();
        b.add_pred(pos_b, f_proj);
        b.mature_block(pos_b);
        b.set_cur_block(pos_b);
        b.set_value(0, a);
        let ej = b.jmp();

        let merge = b.new_imm_block();
        b.add_pred(merge, tj);
        b.add_pred(merge, ej);
        b.mature_block(merge);
        b.set_cur_block(merge);
        let v = b.get_value(0, Mode::Is64);
        b.ret(&[v]).unwrap();
        b.finalize().unwrap();
    }
    let (asm, _diag) = compile(&mut g);
    assert!(asm.contains("cmpq"), "assembly:\n{}", asm);
    assert!(asm.contains("\tjl"), "assembly:\n{}", asm);
    assert!(asm.contains("jmp"), "assembly:\n{}", asm);
    // branch targets reference labels of the function
    assert!(asm.contains(".Lclamp_"), "assembly:\n{}", asm);
}

#[test]
fn store_load_sequence_emits_memory_moves() {
    let prog = Program::new(InitParams::host());
    let i64t = prog.new_primitive_type(Mode::Is64);
    let ptr_t = prog.new_pointer_type(i64t);
    let mty = prog.new_method_type(vec![ptr_t, i64t], vec![i64t], MethodProps::empty());
    let ent = prog.new_global_entity("stld", mty);
    let mut g = prog.new_graph(ent, 0);
    {
        let mut b = Builder::new(&mut g);
        let p = b.arg(0, Mode::P);
        let v = b.arg(1, Mode::Is64);
        b.store(p, v, i64t).unwrap();
        // a second pointer dereference the forwarding must not touch:
        // load through an offset pointer
        let eight = b.const_i(8, Mode::P);
        let q = b.add(p, eight).unwrap();
        let loaded = b.load(q, i64t).unwrap();
        b.ret(&[loaded]).unwrap();
        b.finalize().unwrap();
    }
    let (asm, _diag) = compile(&mut g);
    assert!(asm.contains("movq\t%"), "store emitted: \n{}", asm);
    assert!(asm.contains("), %"), "load emitted: \n{}", asm);
}

#[test]
fn unknown_target_is_reported() {
    let registry = TargetRegistry::with_builtins();
    let err = registry.get("pdp11").unwrap_err();
    assert!(format!("{}", err).contains("pdp11"));
}

#[test]
fn call_emits_symbol_call() {
    let prog = Program::new(InitParams::host());
    let i64t = prog.new_primitive_type(Mode::Is64);
    let callee_ty = prog.new_method_type(vec![i64t], vec![i64t], MethodProps::empty());
    let callee_ent = prog.new_global_entity("helper", callee_ty);
    let mty = prog.new_method_type(vec![i64t], vec![i64t], MethodProps::empty());
    let ent = prog.new_global_entity("caller", mty);
    let mut g = prog.new_graph(ent, 0);
    {
        let mut b = Builder::new(&mut g);
        let a = b.arg(0, Mode::Is64);
        let addr = b.address(callee_ent);
        let call = b.call(addr, &[a], callee_ty).unwrap();
        let res = b.call_result(call, 0, Mode::Is64);
        b.ret(&[res]).unwrap();
        b.finalize().unwrap();
    }
    let (asm, _diag) = compile(&mut g);
    assert!(asm.contains("call\thelper"), "assembly:\n{}", asm);
}
