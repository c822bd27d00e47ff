//! Loop unrolling scenarios: complete unrolling of a constant-trip loop
//! and Duff-style unrolling with a symbolic bound.

use sonir::ana::loops;
use sonir::ir::build::Builder;
use sonir::ir::graph::{Graph, GraphProps};
use sonir::ir::mode::Mode;
use sonir::ir::node::{NodeId, Op, Relation};
use sonir::ir::prog::Program;
use sonir::ir::ty::MethodProps;
use sonir::opt::unroll::{unroll_loops, FixupStrategy, UnrollConfig};
use sonir::InitParams;
use std::sync::Arc;

fn count_live(g: &Graph, name: &str) -> usize {
    g.ids()
        .filter(|&id| !g.is_bad(id) && g.op(id).name() == name)
        .count()
}

/// `for (int i = 0; i < 4; ++i) s += a[i]; return s;` with `s` seeded
/// from the second parameter.
fn build_sum_loop() -> (Arc<Program>, Graph) {
    let prog = Program::new(InitParams::host());
    let i32t = prog.new_primitive_type(Mode::Is32);
    let arr_t = prog.new_array_type(i32t, 4);
    let ptr_t = prog.new_pointer_type(arr_t);
    let mty = prog.new_method_type(vec![ptr_t, i32t], vec![i32t], MethodProps::empty());
    let ent = prog.new_global_entity("sum4", mty);
    let mut g = prog.new_graph(ent, 2);
    {
        let mut b = Builder::new(&mut g);
        let a = b.arg(0, Mode::P);
        let s0 = b.arg(1, Mode::Is32);
        let zero = b.const_i(0, Mode::Is32);
        b.set_value(0, zero); // i
        b.set_value(1, s0); // s
        let entry_jmp = b.jmp();

        let header = b.new_imm_block();
        b.add_pred(header, entry_jmp);
        b.set_cur_block(header);
        let i = b.get_value(0, Mode::Is32);
        let four = b.const_i(4, Mode::Is32);
        let cmp = b.cmp(i, four, Relation::LESS).unwrap();
        let (exit_proj, body_proj) = b.cond(cmp).unwrap();

        let body = b.new_imm_block();
        b.add_pred(body, body_proj);
        b.mature_block(body);
        b.set_cur_block(body);
        let i_in_body = b.get_value(0, Mode::Is32);
        let elem = b.sel(a, i_in_body, arr_t).unwrap();
        let val = b.load(elem, i32t).unwrap();
        let s = b.get_value(1, Mode::Is32);
        let s2 = b.add(s, val).unwrap();
        b.set_value(1, s2);
        let one = b.const_i(1, Mode::Is32);
        let i2 = b.add(i_in_body, one).unwrap();
        b.set_value(0, i2);
        let back = b.jmp();
        b.add_pred(header, back);
        b.mature_block(header);

        let exit = b.new_imm_block();
        b.add_pred(exit, exit_proj);
        b.mature_block(exit);
        b.set_cur_block(exit);
        let s_out = b.get_value(1, Mode::Is32);
        b.ret(&[s_out]).unwrap();
        b.finalize().unwrap();
    }
    (prog, g)
}

#[test]
fn constant_trip_loop_unrolls_completely() {
    let (_prog, mut g) = build_sum_loop();
    assert_eq!(count_live(&g, "Load"), 1);

    let cfg = UnrollConfig {
        factor: 4,
        static_enable: true,
        ..UnrollConfig::default()
    };
    let n = unroll_loops(&mut g, &cfg);
    assert_eq!(n, 1);

    // straight line: the loop is gone
    g.confirm(GraphProps::empty());
    g.assure(GraphProps::CONSISTENT_LOOPINFO);
    assert_eq!(g.loop_tree().n_loops(), 1, "no loop may remain");

    // exactly four load/add pairs
    assert_eq!(count_live(&g, "Load"), 4);
    let accum_adds = g
        .ids()
        .filter(|&id| !g.is_bad(id) && matches!(g.op(id), Op::Add))
        .filter(|&id| {
            g.ins(id).iter().any(|&i| {
                matches!(g.op(i), Op::Proj(_))
                    && matches!(g.op(g.input(i, 0)), Op::Load(_))
            })
        })
        .count();
    assert_eq!(accum_adds, 4, "one accumulating add per load");
}

#[test]
fn default_config_declines_the_static_path() {
    let (_prog, mut g) = build_sum_loop();
    // without static unrolling the constant-trip loop stays a loop: the
    // Duff recognizer wants a load-free increment chain but the static
    // trip analysis is disabled
    let cfg = UnrollConfig {
        factor: 4,
        fixup: FixupStrategy::Loop,
        ..UnrollConfig::default()
    };
    assert!(!cfg.static_enable);
    let loads_before = count_live(&g, "Load");
    unroll_loops(&mut g, &cfg);
    g.confirm(GraphProps::empty());
    g.assure(GraphProps::CONSISTENT_LOOPINFO);
    // either declined (1 load) or duff-unrolled (loop remains); in both
    // cases a loop still exists, unlike the static full unroll
    assert!(g.loop_tree().n_loops() >= 1);
    assert!(count_live(&g, "Load") >= loads_before);
}

/// `for (int i = 0; i < n; i += 2) s += i; return s;` with symbolic n.
fn build_symbolic_loop() -> (Arc<Program>, Graph, NodeId) {
    let prog = Program::new(InitParams::host());
    let i32t = prog.new_primitive_type(Mode::Is32);
    let mty = prog.new_method_type(vec![i32t], vec![i32t], MethodProps::empty());
    let ent = prog.new_global_entity("sumn", mty);
    let mut g = prog.new_graph(ent, 2);
    let n_arg;
    {
        let mut b = Builder::new(&mut g);
        n_arg = b.arg(0, Mode::Is32);
        let zero = b.const_i(0, Mode::Is32);
        b.set_value(0, zero);
        b.set_value(1, zero);
        let entry_jmp = b.jmp();

        let header = b.new_imm_block();
        b.add_pred(header, entry_jmp);
        b.set_cur_block(header);
        let i = b.get_value(0, Mode::Is32);
        let cmp = b.cmp(i, n_arg, Relation::LESS).unwrap();
        let (exit_proj, body_proj) = b.cond(cmp).unwrap();

        let body = b.new_imm_block();
        b.add_pred(body, body_proj);
        b.mature_block(body);
        b.set_cur_block(body);
        let i_b = b.get_value(0, Mode::Is32);
        let s = b.get_value(1, Mode::Is32);
        let s2 = b.add(s, i_b).unwrap();
        b.set_value(1, s2);
        let two = b.const_i(2, Mode::Is32);
        let i2 = b.add(i_b, two).unwrap();
        b.set_value(0, i2);
        let back = b.jmp();
        b.add_pred(header, back);
        b.mature_block(header);

        let exit = b.new_imm_block();
        b.add_pred(exit, exit_proj);
        b.mature_block(exit);
        b.set_cur_block(exit);
        let s_out = b.get_value(1, Mode::Is32);
        b.ret(&[s_out]).unwrap();
        b.finalize().unwrap();
    }
    (prog, g, n_arg)
}

fn step_increment_count(g: &Graph) -> usize {
    // adds of the form `x + 2` are the induction increments
    g.ids()
        .filter(|&id| !g.is_bad(id) && matches!(g.op(id), Op::Add))
        .filter(|&id| {
            g.ins(id)
                .iter()
                .any(|&i| matches!(g.op(i), Op::Const(tv) if tv.as_i64() == 2))
        })
        .count()
}

fn count_cmp_bounds(g: &Graph, n_arg: NodeId) -> (usize, usize) {
    // (compares against N - |c|*(factor-1), compares against plain N)
    let mut sub_bound = 0;
    let mut plain_bound = 0;
    for id in g.ids().filter(|&id| !g.is_bad(id)) {
        let Op::Cmp(_) = g.op(id) else { continue };
        let bound = g.input(id, 1);
        if bound == n_arg {
            plain_bound += 1;
        } else if matches!(g.op(bound), Op::Sub) {
            let sub = bound;
            if g.input(sub, 0) == n_arg && matches!(g.op(g.input(sub, 1)), Op::Mul) {
                sub_bound += 1;
            }
        }
    }
    (sub_bound, plain_bound)
}

fn duff_common_checks(g: &mut Graph, n_arg: NodeId) {
    // loop-closed SSA was re-established
    assert!(g.props().contains(GraphProps::LCSSA));
    // the main header compare bound became N - 3*c
    let (sub_bound, _plain) = count_cmp_bounds(g, n_arg);
    assert_eq!(sub_bound, 1, "main loop bound must be N - |c|*(factor-1)");
}

#[test]
fn duff_unroll_with_loop_fixup() {
    let (_prog, mut g, n_arg) = build_symbolic_loop();
    assert_eq!(step_increment_count(&g), 1);

    let cfg = UnrollConfig {
        factor: 4,
        fixup: FixupStrategy::Loop,
        ..UnrollConfig::default()
    };
    let n = unroll_loops(&mut g, &cfg);
    assert_eq!(n, 1, "the symbolic loop is eligible for duff unrolling");

    // four replicas in the main loop plus one in the fix-up loop
    assert_eq!(step_increment_count(&g), 5);
    duff_common_checks(&mut g, n_arg);
    // the fix-up is a literal duplicate testing against the original
    // bound
    let (_sub, plain) = count_cmp_bounds(&g, n_arg);
    assert!(plain >= 1, "the fix-up tests against the original bound");

    // the fix-up is itself a loop: two loops in the tree
    g.confirm(GraphProps::empty());
    g.assure(GraphProps::CONSISTENT_LOOPINFO);
    assert_eq!(g.loop_tree().n_loops(), 3);
}

#[test]
fn duff_unroll_with_switch_fixup() {
    let (_prog, mut g, n_arg) = build_symbolic_loop();
    let cfg = UnrollConfig {
        factor: 4,
        fixup: FixupStrategy::Switch,
        ..UnrollConfig::default()
    };
    let n = unroll_loops(&mut g, &cfg);
    assert_eq!(n, 1);

    // four replicas in the main loop plus three switch landing pads
    assert_eq!(step_increment_count(&g), 7);
    duff_common_checks(&mut g, n_arg);

    // the compare chain introduced greater-equal compares
    let ge_cmps = g
        .ids()
        .filter(|&id| {
            !g.is_bad(id) && matches!(g.op(id), Op::Cmp(r) if *r == Relation::GREATER_EQUAL)
        })
        .count();
    assert_eq!(ge_cmps, 3, "one landing-pad compare per residue value");
}

#[test]
fn ineligible_loops_are_left_alone() {
    // a loop whose exit condition is an equality is never unrolled
    let prog = Program::new(InitParams::host());
    let i32t = prog.new_primitive_type(Mode::Is32);
    let mty = prog.new_method_type(vec![i32t], vec![i32t], MethodProps::empty());
    let ent = prog.new_global_entity("eqloop", mty);
    let mut g = prog.new_graph(ent, 1);
    {
        let mut b = Builder::new(&mut g);
        let n_arg = b.arg(0, Mode::Is32);
        let zero = b.const_i(0, Mode::Is32);
        b.set_value(0, zero);
        let entry_jmp = b.jmp();
        let header = b.new_imm_block();
        b.add_pred(header, entry_jmp);
        b.set_cur_block(header);
        let i = b.get_value(0, Mode::Is32);
        let cmp = b.cmp(i, n_arg, Relation::LESS_GREATER).unwrap();
        let (exit_proj, body_proj) = b.cond(cmp).unwrap();
        let body = b.new_imm_block();
        b.add_pred(body, body_proj);
        b.mature_block(body);
        b.set_cur_block(body);
        let i_b = b.get_value(0, Mode::Is32);
        let one = b.const_i(1, Mode::Is32);
        let i2 = b.add(i_b, one).unwrap();
        b.set_value(0, i2);
        let back = b.jmp();
        b.add_pred(header, back);
        b.mature_block(header);
        let exit = b.new_imm_block();
        b.add_pred(exit, exit_proj);
        b.mature_block(exit);
        b.set_cur_block(exit);
        let iv = b.get_value(0, Mode::Is32);
        b.ret(&[iv]).unwrap();
        b.finalize().unwrap();
    }
    let node_count = g.node_count();
    let cfg = UnrollConfig {
        factor: 4,
        static_enable: true,
        ..UnrollConfig::default()
    };
    let n = unroll_loops(&mut g, &cfg);
    assert_eq!(n, 0);
    // LCSSA construction may add exit phis, but no unrolling happened
    assert_eq!(step_count_of(&g, 1), 1);
    let _ = node_count;
}

fn step_count_of(g: &Graph, step: i64) -> usize {
    g.ids()
        .filter(|&id| !g.is_bad(id) && matches!(g.op(id), Op::Add))
        .filter(|&id| {
            g.ins(id)
                .iter()
                .any(|&i| matches!(g.op(i), Op::Const(tv) if tv.as_i64() == step))
        })
        .count()
}

#[test]
fn loop_tree_reports_the_nest() {
    let (_prog, mut g) = build_sum_loop();
    g.assure(GraphProps::CONSISTENT_LOOPINFO);
    let tree = g.loop_tree();
    assert_eq!(tree.n_loops(), 2);
    let inner = tree.innermost_loops();
    assert_eq!(inner.len(), 1);
    let info = tree.info(inner[0]);
    assert!(!info.irreducible);
    assert_eq!(info.depth, 1);
    let _ = loops::LoopId::ROOT;
}
