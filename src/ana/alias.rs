//! Alias analysis.
//!
//! Classifies pairs of memory accesses from their address expressions:
//! distinct fresh allocations cannot alias, distinct global entities
//! cannot alias, accesses to the same base at disjoint constant offsets
//! cannot alias. Everything the analysis cannot prove stays `MayAlias`.

use crate::ir::graph::Graph;
use crate::ir::node::{pn, NodeId, Op};
use crate::ir::ty::TypeId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AliasRelation {
    NoAlias,
    MayAlias,
    MustAlias,
}

/// Base of an address expression plus a constant byte offset, when the
/// expression decomposes that way.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AddrBase {
    /// Result proj of a specific Alloc.
    Alloc(NodeId),
    /// Address of a global entity.
    Entity(u32),
    /// The frame pointer.
    Frame,
    /// Anything else, identified by the node.
    Opaque(NodeId),
}

fn decompose(g: &Graph, mut addr: NodeId) -> (AddrBase, Option<i64>) {
    let mut offset: i64 = 0;
    let mut known = true;
    loop {
        match g.op(addr) {
            Op::Member(ent) => {
                let ent = *ent;
                let off = g.prog().entity_offset(ent);
                if off >= 0 {
                    offset += off as i64;
                } else {
                    known = false;
                }
                addr = g.input(addr, 0);
            }
            Op::Sel(arr_ty) => {
                let arr_ty = *arr_ty;
                let index = g.input(addr, 1);
                if let Op::Const(tv) = g.op(index) {
                    offset += tv.as_i64() * element_size(g, arr_ty) as i64;
                } else {
                    known = false;
                }
                addr = g.input(addr, 0);
            }
            Op::Add => {
                let (l, r) = (g.input(addr, 0), g.input(addr, 1));
                if let Op::Const(tv) = g.op(r) {
                    offset += tv.as_i64();
                    addr = l;
                } else if let Op::Const(tv) = g.op(l) {
                    offset += tv.as_i64();
                    addr = r;
                } else {
                    break;
                }
            }
            Op::Conv => addr = g.input(addr, 0),
            Op::Proj(num) => {
                let pred = g.input(addr, 0);
                if matches!(g.op(pred), Op::Alloc(_)) && *num == pn::alloc::RES {
                    return (AddrBase::Alloc(pred), known.then_some(offset));
                }
                if matches!(g.op(pred), Op::Start) && *num == pn::start::FRAME {
                    return (AddrBase::Frame, known.then_some(offset));
                }
                break;
            }
            Op::Address(ent) => {
                return (AddrBase::Entity(ent.0), known.then_some(offset));
            }
            _ => break,
        }
    }
    (AddrBase::Opaque(addr), known.then_some(offset))
}

fn element_size(g: &Graph, arr_ty: TypeId) -> u32 {
    match g.prog().type_kind(arr_ty) {
        crate::ir::ty::TypeKind::Array { element, .. } => g.prog().type_size(element),
        _ => 1,
    }
}

/// Relation between `[addr1, addr1+size1)` of `type1` and
/// `[addr2, addr2+size2)` of `type2`.
pub fn get_alias_relation(
    g: &Graph,
    addr1: NodeId,
    _type1: TypeId,
    size1: u32,
    addr2: NodeId,
    _type2: TypeId,
    size2: u32,
) -> AliasRelation {
    let (base1, off1) = decompose(g, addr1);
    let (base2, off2) = decompose(g, addr2);

    let distinct_bases = match (base1, base2) {
        (AddrBase::Alloc(a), AddrBase::Alloc(b)) => a != b,
        (AddrBase::Alloc(_), AddrBase::Entity(_)) | (AddrBase::Entity(_), AddrBase::Alloc(_)) => {
            true
        }
        (AddrBase::Alloc(_), AddrBase::Frame) | (AddrBase::Frame, AddrBase::Alloc(_)) => true,
        (AddrBase::Entity(a), AddrBase::Entity(b)) => a != b,
        (AddrBase::Entity(_), AddrBase::Frame) | (AddrBase::Frame, AddrBase::Entity(_)) => true,
        _ => false,
    };
    if distinct_bases {
        return AliasRelation::NoAlias;
    }

    let same_base = match (base1, base2) {
        (AddrBase::Alloc(a), AddrBase::Alloc(b)) => a == b,
        (AddrBase::Entity(a), AddrBase::Entity(b)) => a == b,
        (AddrBase::Frame, AddrBase::Frame) => true,
        (AddrBase::Opaque(a), AddrBase::Opaque(b)) => a == b,
        _ => false,
    };
    if same_base {
        if let (Some(o1), Some(o2)) = (off1, off2) {
            if o1 == o2 && size1 == size2 {
                return AliasRelation::MustAlias;
            }
            let disjoint = o1 + size1 as i64 <= o2 || o2 + size2 as i64 <= o1;
            if disjoint {
                return AliasRelation::NoAlias;
            }
            return AliasRelation::MayAlias;
        }
    }
    AliasRelation::MayAlias
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::InitParams;
    use crate::ir::mode::Mode;
    use crate::ir::node::Op;
    use crate::ir::prog::Program;
    use crate::ir::tarval::Tarval;
    use crate::ir::ty::MethodProps;

    fn graph() -> crate::ir::graph::Graph {
        let prog = Program::new(InitParams::host());
        let mty = prog.new_method_type(vec![], vec![], MethodProps::empty());
        let ent = prog.new_global_entity("al", mty);
        prog.new_graph(ent, 0)
    }

    #[test]
    fn distinct_allocs_do_not_alias() {
        let mut g = graph();
        let b = g.start_block();
        let size = g.add_raw(
            Op::Const(Tarval::from_u64(8, Mode::Iu64)),
            Mode::Iu64,
            b,
            &[],
        );
        let nm = g.no_mem();
        let a1 = g.add_raw(Op::Alloc(8), Mode::T, b, &[nm, size]);
        let a2 = g.add_raw(Op::Alloc(8), Mode::T, b, &[nm, size]);
        let p1 = g.add_raw(Op::Proj(pn::alloc::RES), Mode::P, b, &[a1]);
        let p2 = g.add_raw(Op::Proj(pn::alloc::RES), Mode::P, b, &[a2]);
        let i64t = g.prog().new_primitive_type(Mode::Is64);
        assert_eq!(
            get_alias_relation(&g, p1, i64t, 8, p2, i64t, 8),
            AliasRelation::NoAlias
        );
        assert_eq!(
            get_alias_relation(&g, p1, i64t, 8, p1, i64t, 8),
            AliasRelation::MustAlias
        );
    }

    #[test]
    fn same_base_disjoint_offsets() {
        let mut g = graph();
        let b = g.start_block();
        let size = g.add_raw(
            Op::Const(Tarval::from_u64(16, Mode::Iu64)),
            Mode::Iu64,
            b,
            &[],
        );
        let nm = g.no_mem();
        let a = g.add_raw(Op::Alloc(8), Mode::T, b, &[nm, size]);
        let p = g.add_raw(Op::Proj(pn::alloc::RES), Mode::P, b, &[a]);
        let c8 = g.add_raw(
            Op::Const(Tarval::from_i64(8, Mode::Is64)),
            Mode::Is64,
            b,
            &[],
        );
        let p8 = g.add_raw(Op::Add, Mode::P, b, &[p, c8]);
        let i64t = g.prog().new_primitive_type(Mode::Is64);
        assert_eq!(
            get_alias_relation(&g, p, i64t, 8, p8, i64t, 8),
            AliasRelation::NoAlias
        );
        assert_eq!(
            get_alias_relation(&g, p, i64t, 16, p8, i64t, 8),
            AliasRelation::MayAlias
        );
    }

    #[test]
    fn opaque_pointers_may_alias() {
        let mut g = graph();
        let b = g.start_block();
        let u1 = g.add_raw(Op::Unknown, Mode::P, b, &[]);
        let u2 = g.add_raw(Op::Unknown, Mode::P, b, &[]);
        let i64t = g.prog().new_primitive_type(Mode::Is64);
        assert_eq!(
            get_alias_relation(&g, u1, i64t, 8, u2, i64t, 8),
            AliasRelation::MayAlias
        );
    }
}
