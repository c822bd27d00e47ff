//! The amd64 reference target.
//!
//! Two allocatable classes (general purpose and SSE) plus a one-register
//! flags class. Selection produces two-address machine nodes with
//! should-be-same constraints the generic fix-up driver resolves; the
//! target hook rewrites `sub` into `neg; add` (with the carry-preserving
//! `cmc; not; adc; cmc` variant when a carry-reading consumer hangs off
//! the flags) and `shld` into `shrd` with the complemented count.
//! Emission is textual AT&T-flavored assembly.

use std::io::Write;

use smallvec::smallvec;

use crate::error::{BackendError, BackendResult};
use crate::ir::graph::Graph;
use crate::ir::mode::Mode;
use crate::ir::node::{pn, MachAttr, MachOpDesc, NodeId, Op, RegReq, Relation};
use crate::ir::tarval::Tarval;
use crate::ir::ty::TypeKind;

use super::target::{IsaDescriptor, Reg, RegClassDesc, RegisterDesc, Target};
use super::BeState;

pub const CLASS_GP: u8 = 0;
pub const CLASS_FP: u8 = 1;
pub const CLASS_FLAGS: u8 = 2;

pub const RAX: Reg = Reg::new(CLASS_GP, 0);
pub const RCX: Reg = Reg::new(CLASS_GP, 1);
pub const RDX: Reg = Reg::new(CLASS_GP, 2);
pub const RSP: Reg = Reg::new(CLASS_GP, 4);
pub const RSI: Reg = Reg::new(CLASS_GP, 6);
pub const RDI: Reg = Reg::new(CLASS_GP, 7);
pub const R8: Reg = Reg::new(CLASS_GP, 8);
pub const R9: Reg = Reg::new(CLASS_GP, 9);
pub const R11: Reg = Reg::new(CLASS_GP, 11);
pub const FLAGS: Reg = Reg::new(CLASS_FLAGS, 0);

const PARAM_REGS: [Reg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

const fn plain_op(name: &'static str) -> MachOpDesc {
    MachOpDesc {
        name,
        is_cf: false,
        is_spill: false,
        is_reload: false,
        is_copy: false,
        is_incsp: false,
    }
}

const fn cf_op(name: &'static str) -> MachOpDesc {
    MachOpDesc {
        is_cf: true,
        ..plain_op(name)
    }
}

pub static OP_MOV_IMM: MachOpDesc = plain_op("mov_imm");
pub static OP_MOV_SYM: MachOpDesc = plain_op("mov_sym");
pub static OP_ADD: MachOpDesc = plain_op("add");
pub static OP_SUB: MachOpDesc = plain_op("sub");
pub static OP_IMUL: MachOpDesc = plain_op("imul");
pub static OP_NEG: MachOpDesc = plain_op("neg");
pub static OP_NOT: MachOpDesc = plain_op("not");
pub static OP_AND: MachOpDesc = plain_op("and");
pub static OP_OR: MachOpDesc = plain_op("or");
pub static OP_XOR: MachOpDesc = plain_op("xor");
pub static OP_SHL: MachOpDesc = plain_op("shl");
pub static OP_SHR: MachOpDesc = plain_op("shr");
pub static OP_SAR: MachOpDesc = plain_op("sar");
pub static OP_SHLD: MachOpDesc = plain_op("shld");
pub static OP_SHRD: MachOpDesc = plain_op("shrd");
pub static OP_MOVX: MachOpDesc = plain_op("movx");
pub static OP_CMP: MachOpDesc = plain_op("cmp");
pub static OP_ADC: MachOpDesc = plain_op("adc");
pub static OP_CMC: MachOpDesc = plain_op("cmc");
pub static OP_STC: MachOpDesc = plain_op("stc");
pub static OP_LOAD: MachOpDesc = plain_op("load");
pub static OP_STORE: MachOpDesc = plain_op("store");
pub static OP_CALL: MachOpDesc = plain_op("call");
pub static OP_JMP: MachOpDesc = cf_op("jmp");
pub static OP_JCC: MachOpDesc = cf_op("jcc");
pub static OP_RET: MachOpDesc = cf_op("ret");
pub static OP_SPILL: MachOpDesc = MachOpDesc {
    is_spill: true,
    ..plain_op("spill")
};
pub static OP_RELOAD: MachOpDesc = MachOpDesc {
    is_reload: true,
    ..plain_op("reload")
};
pub static OP_COPY: MachOpDesc = MachOpDesc {
    is_copy: true,
    ..plain_op("copy")
};
pub static OP_INCSP: MachOpDesc = MachOpDesc {
    is_incsp: true,
    ..plain_op("incsp")
};

const GP_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

#[derive(Debug)]
pub struct Amd64 {
    isa: IsaDescriptor,
}

impl Amd64 {
    pub fn new() -> Amd64 {
        let mut registers = Vec::new();
        for (i, &name) in GP_NAMES.iter().enumerate() {
            registers.push(RegisterDesc {
                name,
                index: i as u8,
                global_index: i as u16,
                class: CLASS_GP,
                is_virtual: false,
            });
        }
        let xmm_names: [&'static str; 16] = [
            "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9",
            "xmm10", "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
        ];
        for (i, &name) in xmm_names.iter().enumerate() {
            registers.push(RegisterDesc {
                name,
                index: i as u8,
                global_index: (16 + i) as u16,
                class: CLASS_FP,
                is_virtual: false,
            });
        }
        registers.push(RegisterDesc {
            name: "eflags",
            index: 0,
            global_index: 32,
            class: CLASS_FLAGS,
            is_virtual: false,
        });
        Amd64 {
            isa: IsaDescriptor {
                name: "amd64",
                classes: vec![
                    RegClassDesc {
                        name: "gp",
                        mode: Mode::Is64,
                        n_regs: 16,
                        // everything but rsp and rbp
                        allocatable: 0xFFFF & !(1 << 4) & !(1 << 5),
                    },
                    RegClassDesc {
                        name: "fp",
                        mode: Mode::F64,
                        n_regs: 16,
                        allocatable: 0xFFFF,
                    },
                    RegClassDesc {
                        name: "flags",
                        mode: Mode::B,
                        n_regs: 1,
                        allocatable: 0x1,
                    },
                ],
                registers,
                non_ssa_regs: vec![RSP],
            },
        }
    }

    fn mach(
        &self,
        g: &mut Graph,
        opcode: &'static MachOpDesc,
        mode: Mode,
        block: NodeId,
        ins: &[NodeId],
        attr_fn: impl FnOnce(&mut MachAttr),
    ) -> NodeId {
        let mut attr = MachAttr::new(opcode);
        attr_fn(&mut attr);
        g.add_raw(Op::Mach(attr), mode, block, ins)
    }

    fn binop_2addr(
        &self,
        g: &mut Graph,
        opcode: &'static MachOpDesc,
        node: NodeId,
        commutative: bool,
    ) -> NodeId {
        let block = g.block_of(node);
        let mode = g.mode(node);
        let ins: Vec<NodeId> = g.ins(node).to_vec();
        self.mach(g, opcode, mode, block, &ins, |attr| {
            attr.in_reqs = smallvec![RegReq::class(CLASS_GP), RegReq::class(CLASS_GP)];
            let mut out = RegReq::class(CLASS_GP);
            out.same_as = Some(0);
            attr.out_reqs = smallvec![out, RegReq::class(CLASS_FLAGS)];
            attr.commutative = commutative;
        })
    }
}

impl Default for Amd64 {
    fn default() -> Self {
        Self::new()
    }
}

fn cc_name(rel: Relation) -> &'static str {
    match rel {
        r if r == Relation::EQUAL => "e",
        r if r == Relation::LESS => "l",
        r if r == Relation::LESS_EQUAL => "le",
        r if r == Relation::GREATER => "g",
        r if r == Relation::GREATER_EQUAL => "ge",
        r if r == Relation::LESS_GREATER => "ne",
        _ => "ne",
    }
}

/// Conditions that read the carry flag (unsigned below family).
pub fn reads_carry(rel: Relation) -> bool {
    rel == Relation::LESS || rel == Relation::LESS_EQUAL
}

impl Target for Amd64 {
    fn name(&self) -> &'static str {
        "amd64"
    }

    fn isa(&self) -> &IsaDescriptor {
        &self.isa
    }

    fn class_for_mode(&self, mode: Mode) -> Option<u8> {
        match mode {
            m if m.is_int() || m == Mode::P => Some(CLASS_GP),
            m if m.is_float() => Some(CLASS_FP),
            Mode::B => Some(CLASS_FLAGS),
            _ => None,
        }
    }

    fn param_reg(&self, i: usize) -> Option<Reg> {
        PARAM_REGS.get(i).copied()
    }

    /// Address arithmetic becomes plain adds and multiplies; the
    /// selector only ever sees machine-word operations.
    fn lower_for_target(&self, g: &mut Graph) -> BackendResult<()> {
        for id in g.ids().collect::<Vec<_>>() {
            if g.is_bad(id) {
                continue;
            }
            match g.op(id).clone() {
                Op::Member(ent) => {
                    let offset = g.prog().entity_offset(ent).max(0) as i64;
                    let block = g.block_of(id);
                    let ptr = g.input(id, 0);
                    let replacement = if offset == 0 {
                        ptr
                    } else {
                        let sb = g.start_block();
                        let off = g.add_raw(
                            Op::Const(Tarval::from_i64(offset, Mode::P)),
                            Mode::P,
                            sb,
                            &[],
                        );
                        g.add_raw(Op::Add, Mode::P, block, &[ptr, off])
                    };
                    g.exchange(id, replacement);
                }
                Op::Sel(arr_ty) => {
                    let esize = match g.prog().type_kind(arr_ty) {
                        TypeKind::Array { element, .. } => g.prog().type_size(element),
                        _ => 1,
                    };
                    let block = g.block_of(id);
                    let ptr = g.input(id, 0);
                    let index = g.input(id, 1);
                    let sb = g.start_block();
                    let idx_p = g.add_raw(Op::Conv, Mode::P, block, &[index]);
                    let size_c = g.add_raw(
                        Op::Const(Tarval::from_i64(esize as i64, Mode::P)),
                        Mode::P,
                        sb,
                        &[],
                    );
                    let scaled = g.add_raw(Op::Mul, Mode::P, block, &[idx_p, size_c]);
                    let addr = g.add_raw(Op::Add, Mode::P, block, &[ptr, scaled]);
                    g.exchange(id, addr);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn select_node(&self, g: &mut Graph, node: NodeId) -> BackendResult<()> {
        let block = g.block_of(node);
        let mode = g.mode(node);
        let replacement = match g.op(node).clone() {
            Op::Const(tv) => Some(self.mach(g, &OP_MOV_IMM, mode, block, &[], |attr| {
                attr.imm = Some(tv);
                attr.out_reqs = smallvec![RegReq::class(CLASS_GP)];
            })),
            Op::Address(ent) => Some(self.mach(g, &OP_MOV_SYM, mode, block, &[], |attr| {
                attr.frame_entity = Some(ent);
                attr.out_reqs = smallvec![RegReq::class(CLASS_GP)];
            })),
            Op::Add => Some(self.binop_2addr(g, &OP_ADD, node, true)),
            Op::Sub => Some(self.binop_2addr(g, &OP_SUB, node, false)),
            Op::Mul => Some(self.binop_2addr(g, &OP_IMUL, node, true)),
            Op::And => Some(self.binop_2addr(g, &OP_AND, node, true)),
            Op::Or => Some(self.binop_2addr(g, &OP_OR, node, true)),
            Op::Eor => Some(self.binop_2addr(g, &OP_XOR, node, true)),
            Op::Shl | Op::Shr | Op::Shrs => {
                let opcode = match g.op(node) {
                    Op::Shl => &OP_SHL,
                    Op::Shr => &OP_SHR,
                    _ => &OP_SAR,
                };
                let ins: Vec<NodeId> = g.ins(node).to_vec();
                Some(self.mach(g, opcode, mode, block, &ins, |attr| {
                    // the count lives in cl
                    attr.in_reqs = smallvec![
                        RegReq::class(CLASS_GP),
                        RegReq::limited(CLASS_GP, 1 << RCX.index),
                    ];
                    let mut out = RegReq::class(CLASS_GP);
                    out.same_as = Some(0);
                    attr.out_reqs = smallvec![out, RegReq::class(CLASS_FLAGS)];
                }))
            }
            Op::Minus => {
                let ins: Vec<NodeId> = g.ins(node).to_vec();
                Some(self.mach(g, &OP_NEG, mode, block, &ins, |attr| {
                    attr.in_reqs = smallvec![RegReq::class(CLASS_GP)];
                    let mut out = RegReq::class(CLASS_GP);
                    out.same_as = Some(0);
                    attr.out_reqs = smallvec![out, RegReq::class(CLASS_FLAGS)];
                }))
            }
            Op::Not => {
                let ins: Vec<NodeId> = g.ins(node).to_vec();
                Some(self.mach(g, &OP_NOT, mode, block, &ins, |attr| {
                    attr.in_reqs = smallvec![RegReq::class(CLASS_GP)];
                    let mut out = RegReq::class(CLASS_GP);
                    out.same_as = Some(0);
                    attr.out_reqs = smallvec![out];
                }))
            }
            Op::Conv => {
                let ins: Vec<NodeId> = g.ins(node).to_vec();
                if g.mode(ins[0]).is_float() || mode.is_float() {
                    return Err(BackendError::Unsupported {
                        node,
                        op: "Conv",
                        stage: "amd64 selection",
                    });
                }
                Some(self.mach(g, &OP_MOVX, mode, block, &ins, |attr| {
                    attr.in_reqs = smallvec![RegReq::class(CLASS_GP)];
                    attr.out_reqs = smallvec![RegReq::class(CLASS_GP)];
                }))
            }
            Op::Cmp(rel) => {
                let ins: Vec<NodeId> = g.ins(node).to_vec();
                Some(self.mach(g, &OP_CMP, mode, block, &ins, |attr| {
                    attr.in_reqs = smallvec![RegReq::class(CLASS_GP), RegReq::class(CLASS_GP)];
                    attr.out_reqs = smallvec![RegReq::class(CLASS_FLAGS)];
                    attr.cond = Some(rel);
                }))
            }
            Op::Cond => {
                let sel = g.input(node, 0);
                let cond = match g.op(sel) {
                    Op::Mach(attr) => attr.cond,
                    _ => None,
                };
                Some(self.mach(g, &OP_JCC, Mode::T, block, &[sel], |attr| {
                    attr.in_reqs = smallvec![RegReq::class(CLASS_FLAGS)];
                    attr.cond = cond;
                }))
            }
            Op::Jmp => Some(self.mach(g, &OP_JMP, Mode::X, block, &[], |_| {})),
            Op::Return => {
                let ins: Vec<NodeId> = g.ins(node).to_vec();
                let n_ins = ins.len();
                Some(self.mach(g, &OP_RET, Mode::X, block, &ins, |attr| {
                    attr.in_reqs = smallvec![RegReq::none()];
                    for _ in 1..n_ins {
                        attr.in_reqs
                            .push(RegReq::limited(CLASS_GP, 1 << RAX.index));
                    }
                }))
            }
            Op::Load(_) => {
                let ins: Vec<NodeId> = g.ins(node).to_vec();
                Some(self.mach(g, &OP_LOAD, Mode::T, block, &ins, |attr| {
                    attr.in_reqs = smallvec![RegReq::none(), RegReq::class(CLASS_GP)];
                    attr.out_reqs = smallvec![RegReq::none(), RegReq::class(CLASS_GP)];
                }))
            }
            Op::Store(_) => {
                let ins: Vec<NodeId> = g.ins(node).to_vec();
                Some(self.mach(g, &OP_STORE, Mode::T, block, &ins, |attr| {
                    attr.in_reqs = smallvec![
                        RegReq::none(),
                        RegReq::class(CLASS_GP),
                        RegReq::class(CLASS_GP),
                    ];
                    attr.out_reqs = smallvec![RegReq::none()];
                }))
            }
            Op::Call(_) => {
                let ins: Vec<NodeId> = g.ins(node).to_vec();
                let n_args = ins.len().saturating_sub(2);
                if n_args > PARAM_REGS.len() {
                    return Err(BackendError::Unsupported {
                        node,
                        op: "Call",
                        stage: "amd64 selection",
                    });
                }
                Some(self.mach(g, &OP_CALL, Mode::T, block, &ins, |attr| {
                    attr.in_reqs = smallvec![RegReq::none(), RegReq::class(CLASS_GP)];
                    for i in 0..n_args {
                        attr.in_reqs
                            .push(RegReq::limited(CLASS_GP, 1 << PARAM_REGS[i].index));
                    }
                    attr.out_reqs = smallvec![
                        RegReq::none(),
                        RegReq::limited(CLASS_GP, 1 << RAX.index),
                    ];
                }))
            }
            op => {
                return Err(BackendError::Unsupported {
                    node,
                    op: op.name(),
                    stage: "amd64 selection",
                })
            }
        };
        if let Some(m) = replacement {
            g.exchange(node, m);
        }
        Ok(())
    }

    fn new_spill(&self, g: &mut Graph, value: NodeId, block: NodeId) -> NodeId {
        self.mach(g, &OP_SPILL, Mode::M, block, &[value], |attr| {
            // non general-purpose spills are not implemented on this
            // target
            attr.in_reqs = smallvec![RegReq::class(CLASS_GP)];
            attr.out_reqs = smallvec![RegReq::none()];
        })
    }

    fn new_reload(&self, g: &mut Graph, mode: Mode, spill: NodeId, block: NodeId) -> NodeId {
        if self.class_for_mode(mode) != Some(CLASS_GP) {
            crate::init::fatal("unimplemented mode");
        }
        self.mach(g, &OP_RELOAD, mode, block, &[spill], |attr| {
            attr.in_reqs = smallvec![RegReq::none()];
            attr.out_reqs = smallvec![RegReq::class(CLASS_GP)];
        })
    }

    fn new_copy(&self, g: &mut Graph, value: NodeId, block: NodeId) -> NodeId {
        let mode = g.mode(value);
        let class = self.class_for_mode(mode).unwrap_or(CLASS_GP);
        self.mach(g, &OP_COPY, mode, block, &[value], |attr| {
            attr.in_reqs = smallvec![RegReq::class(class)];
            attr.out_reqs = smallvec![RegReq::class(class)];
        })
    }

    fn new_incsp(&self, g: &mut Graph, block: NodeId, delta: i32) -> NodeId {
        self.mach(g, &OP_INCSP, Mode::Is64, block, &[], |attr| {
            attr.imm = Some(Tarval::from_i64(delta as i64, Mode::Is64));
        })
    }

    fn op_estimated_cost(&self, g: &Graph, node: NodeId) -> u32 {
        match g.op(node) {
            Op::Mach(attr) => match attr.opcode.name {
                "imul" => 3,
                "load" | "reload" => 4,
                "store" | "spill" => 4,
                "call" => 10,
                _ => 1,
            },
            _ => 1,
        }
    }

    fn is_valid_clobber(&self, name: &str) -> bool {
        self.isa.registers.iter().any(|r| r.name == name)
            || name == "memory"
            || name == "cc"
    }

    fn handle_2addr(
        &self,
        g: &mut Graph,
        state: &mut BeState,
        node: NodeId,
        in_idx: usize,
        reg: Reg,
    ) -> bool {
        let Op::Mach(attr) = g.op(node).clone() else {
            return false;
        };
        // commutative: swapping operands satisfies the constraint
        if attr.commutative && in_idx == 0 && g.arity(node) >= 2 {
            let other = g.input(node, 1);
            if state.reg_of(other) == Some(reg) {
                let (a, b) = (g.input(node, 0), g.input(node, 1));
                g.set_input(node, 0, b);
                g.set_input(node, 1, a);
                log::debug!("2addr: swapped inputs of {:?}", node);
                return true;
            }
        }
        if std::ptr::eq(attr.opcode, &OP_SUB) {
            return self.transform_sub_to_neg_add(g, state, node, reg);
        }
        if std::ptr::eq(attr.opcode, &OP_SHLD) {
            self.transform_shld_to_shrd(g, state, node, reg);
            return true;
        }
        false
    }

    fn emit_node(
        &self,
        g: &Graph,
        state: &BeState,
        node: NodeId,
        out: &mut dyn Write,
    ) -> std::io::Result<()> {
        let Op::Mach(attr) = g.op(node) else {
            return Ok(());
        };
        let isa = self.isa();
        let reg_name = |n: NodeId| {
            state
                .reg_of(n)
                .map(|r| isa.reg_name(r))
                .unwrap_or("?")
        };
        let out_name = reg_name(node);
        match attr.opcode.name {
            "mov_imm" => {
                let imm = attr.imm.map(|t| t.as_i64()).unwrap_or(0);
                writeln!(out, "\tmovq\t${}, %{}", imm, out_name)
            }
            "mov_sym" => {
                let name = attr
                    .frame_entity
                    .map(|e| g.prog().entity_ld_name(e).as_str())
                    .unwrap_or("?");
                writeln!(out, "\tleaq\t{}(%rip), %{}", name, out_name)
            }
            "add" | "sub" | "imul" | "and" | "or" | "xor" | "adc" => writeln!(
                out,
                "\t{}q\t%{}, %{}",
                attr.opcode.name,
                reg_name(g.input(node, 1)),
                out_name
            ),
            "neg" | "not" => writeln!(out, "\t{}q\t%{}", attr.opcode.name, out_name),
            "shl" | "shr" | "sar" => writeln!(out, "\t{}q\t%cl, %{}", attr.opcode.name, out_name),
            "shld" | "shrd" => {
                let n = attr.imm.map(|t| t.as_i64()).unwrap_or(0);
                writeln!(
                    out,
                    "\t{}q\t${}, %{}, %{}",
                    attr.opcode.name,
                    n,
                    reg_name(g.input(node, 1)),
                    out_name
                )
            }
            "movx" => writeln!(
                out,
                "\tmovq\t%{}, %{}",
                reg_name(g.input(node, 0)),
                out_name
            ),
            "cmp" => writeln!(
                out,
                "\tcmpq\t%{}, %{}",
                reg_name(g.input(node, 1)),
                reg_name(g.input(node, 0))
            ),
            "cmc" => writeln!(out, "\tcmc"),
            "stc" => writeln!(out, "\tstc"),
            "load" => {
                let res = proj_of(g, node, pn::load::RES);
                writeln!(
                    out,
                    "\tmovq\t(%{}), %{}",
                    reg_name(g.input(node, 1)),
                    res.map(reg_name).unwrap_or("?")
                )
            }
            "store" => writeln!(
                out,
                "\tmovq\t%{}, (%{})",
                reg_name(g.input(node, 2)),
                reg_name(g.input(node, 1))
            ),
            "spill" => writeln!(
                out,
                "\tmovq\t%{}, {}(%rsp)",
                reg_name(g.input(node, 0)),
                attr.frame_offset.unwrap_or(0)
            ),
            "reload" => writeln!(
                out,
                "\tmovq\t{}(%rsp), %{}",
                attr.frame_offset.unwrap_or(0),
                out_name
            ),
            "copy" => writeln!(
                out,
                "\tmovq\t%{}, %{}",
                reg_name(g.input(node, 0)),
                out_name
            ),
            "incsp" => {
                let bytes = attr.imm.map(|t| t.as_i64()).unwrap_or(0);
                if bytes > 0 {
                    writeln!(out, "\tsubq\t${}, %rsp", bytes)
                } else if bytes < 0 {
                    writeln!(out, "\taddq\t${}, %rsp", -bytes)
                } else {
                    Ok(())
                }
            }
            "call" => {
                let callee = g.input(node, 1);
                match g.op(callee) {
                    Op::Mach(ca) if std::ptr::eq(ca.opcode, &OP_MOV_SYM) => {
                        let name = ca
                            .frame_entity
                            .map(|e| g.prog().entity_ld_name(e).as_str())
                            .unwrap_or("?");
                        writeln!(out, "\tcall\t{}", name)
                    }
                    _ => writeln!(out, "\tcall\t*%{}", reg_name(callee)),
                }
            }
            "jmp" => {
                let target = g
                    .outs(node)
                    .iter()
                    .map(|&(u, _)| u)
                    .find(|&u| g.is_block(u));
                match target {
                    Some(b) => writeln!(out, "\tjmp\t{}", super::emit::block_label(g, state, b)),
                    None => Ok(()),
                }
            }
            "jcc" => {
                let cc = attr.cond.map(cc_name).unwrap_or("ne");
                let mut t_block = None;
                let mut f_block = None;
                for &(user, _) in g.outs(node) {
                    if let Op::Proj(num) = g.op(user) {
                        let target = g
                            .outs(user)
                            .iter()
                            .map(|&(u, _)| u)
                            .find(|&u| g.is_block(u));
                        if *num == pn::cond::TRUE {
                            t_block = target;
                        } else {
                            f_block = target;
                        }
                    }
                }
                if let Some(t) = t_block {
                    writeln!(out, "\tj{}\t{}", cc, super::emit::block_label(g, state, t))?;
                }
                if let Some(f) = f_block {
                    writeln!(out, "\tjmp\t{}", super::emit::block_label(g, state, f))?;
                }
                Ok(())
            }
            "ret" => writeln!(out, "\tret"),
            other => writeln!(out, "\t# {}", other),
        }
    }
}

fn proj_of(g: &Graph, node: NodeId, num: u32) -> Option<NodeId> {
    g.outs(node)
        .iter()
        .map(|&(u, _)| u)
        .find(|&u| matches!(g.op(u), Op::Proj(n) if *n == num))
}

impl Amd64 {
    /// `sub` whose output register equals the subtrahend becomes
    /// `neg right; add left`. When a consumer reads the carry out of the
    /// sub's flags, the rewrite switches to the carry-preserving
    /// `cmc; not right; adc left, right; cmc` and the flags projection
    /// moves to the final `cmc`.
    fn transform_sub_to_neg_add(
        &self,
        g: &mut Graph,
        state: &mut BeState,
        node: NodeId,
        out_reg: Reg,
    ) -> bool {
        let in2 = g.input(node, 1);
        if state.reg_of(in2) != Some(out_reg) {
            return false;
        }
        let block = g.block_of(node);
        let mode = g.mode(node);
        let in1 = g.input(node, 0);

        // does anything read the carry out of this sub's flags?
        let flags_proj = proj_of(g, node, 1);
        let mut needs_carry = false;
        if let Some(fp) = flags_proj {
            for &(user, _) in g.outs(fp) {
                if let Op::Mach(ua) = g.op(user) {
                    if std::ptr::eq(ua.opcode, &OP_ADC)
                        || ua.cond.map(reads_carry).unwrap_or(false)
                    {
                        needs_carry = true;
                        break;
                    }
                }
            }
        }

        if needs_carry {
            let cmc1 = self.mach(g, &OP_CMC, Mode::B, block, &[], |attr| {
                attr.out_reqs = smallvec![RegReq::class(CLASS_FLAGS)];
            });
            state.regs.insert(cmc1, FLAGS);
            state.sched_add_before(block, node, cmc1);

            let nnot = self.mach(g, &OP_NOT, mode, block, &[in2], |attr| {
                attr.in_reqs = smallvec![RegReq::class(CLASS_GP)];
                let mut out = RegReq::class(CLASS_GP);
                out.same_as = Some(0);
                attr.out_reqs = smallvec![out];
            });
            state.regs.insert(nnot, out_reg);
            state.sched_add_before(block, node, nnot);

            let adc = self.mach(g, &OP_ADC, mode, block, &[nnot, in1, cmc1], |attr| {
                attr.in_reqs = smallvec![
                    RegReq::class(CLASS_GP),
                    RegReq::class(CLASS_GP),
                    RegReq::class(CLASS_FLAGS),
                ];
                let mut out = RegReq::class(CLASS_GP);
                out.same_as = Some(0);
                attr.out_reqs = smallvec![out, RegReq::class(CLASS_FLAGS)];
                attr.commutative = true;
            });
            state.regs.insert(adc, out_reg);
            state.sched_replace(block, node, adc);

            if let Some(fp) = flags_proj {
                let adc_flags = g.add_raw(Op::Proj(1), Mode::B, block, &[adc]);
                state.regs.insert(adc_flags, FLAGS);
                let cmc2 = self.mach(g, &OP_CMC, Mode::B, block, &[adc_flags], |attr| {
                    attr.in_reqs = smallvec![RegReq::class(CLASS_FLAGS)];
                    attr.out_reqs = smallvec![RegReq::class(CLASS_FLAGS)];
                });
                state.regs.insert(cmc2, FLAGS);
                state.sched_add_after(block, adc, cmc2);
                g.exchange(fp, cmc2);
            }
            g.exchange(node, adc);
            state.sched_remove(block, node);
            log::debug!("2addr: rewrote sub {:?} to cmc/not/adc/cmc", node);
        } else {
            let neg = self.mach(g, &OP_NEG, mode, block, &[in2], |attr| {
                attr.in_reqs = smallvec![RegReq::class(CLASS_GP)];
                let mut out = RegReq::class(CLASS_GP);
                out.same_as = Some(0);
                attr.out_reqs = smallvec![out, RegReq::class(CLASS_FLAGS)];
            });
            state.regs.insert(neg, out_reg);
            state.sched_add_before(block, node, neg);

            let add = self.mach(g, &OP_ADD, mode, block, &[neg, in1], |attr| {
                attr.in_reqs = smallvec![RegReq::class(CLASS_GP), RegReq::class(CLASS_GP)];
                let mut out = RegReq::class(CLASS_GP);
                out.same_as = Some(0);
                attr.out_reqs = smallvec![out, RegReq::class(CLASS_FLAGS)];
                attr.commutative = true;
            });
            state.regs.insert(add, out_reg);
            state.sched_replace(block, node, add);
            g.exchange(node, add);
            state.sched_remove(block, node);
            log::debug!("2addr: rewrote sub {:?} to neg/add", node);
        }
        true
    }

    /// `a = shld(b, a, n)` becomes `a = shrd(a, b, 32 - n)`.
    fn transform_shld_to_shrd(
        &self,
        g: &mut Graph,
        state: &mut BeState,
        node: NodeId,
        out_reg: Reg,
    ) {
        let Op::Mach(attr) = g.op(node).clone() else {
            return;
        };
        let n = attr.imm.map(|t| t.as_i64()).unwrap_or(0);
        let block = g.block_of(node);
        let mode = g.mode(node);
        let hi = g.input(node, 0);
        let lo = g.input(node, 1);
        let shrd = self.mach(g, &OP_SHRD, mode, block, &[lo, hi], |a| {
            a.in_reqs = smallvec![RegReq::class(CLASS_GP), RegReq::class(CLASS_GP)];
            let mut out = RegReq::class(CLASS_GP);
            out.same_as = Some(0);
            a.out_reqs = smallvec![out, RegReq::class(CLASS_FLAGS)];
            a.imm = Some(Tarval::from_i64(32 - n, Mode::Iu32));
        });
        state.regs.insert(shrd, out_reg);
        state.sched_replace(block, node, shrd);
        g.exchange(node, shrd);
        state.sched_remove(block, node);
        log::debug!("2addr: rewrote shld {:?} to shrd with {}", node, 32 - n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isa_shape() {
        let t = Amd64::new();
        let isa = t.isa();
        assert_eq!(isa.classes[CLASS_GP as usize].n_regs, 16);
        // rsp and rbp are not allocatable
        assert_eq!(isa.classes[CLASS_GP as usize].n_allocatable(), 14);
        assert_eq!(isa.reg_name(RAX), "rax");
        assert_eq!(isa.reg_name(RSP), "rsp");
        assert!(isa.is_non_ssa(RSP));
    }

    #[test]
    fn clobber_names() {
        let t = Amd64::new();
        assert!(t.is_valid_clobber("rax"));
        assert!(t.is_valid_clobber("memory"));
        assert!(t.is_valid_clobber("cc"));
        assert!(!t.is_valid_clobber("z9"));
    }

    #[test]
    fn param_regs_follow_sysv_order() {
        let t = Amd64::new();
        assert_eq!(t.param_reg(0), Some(RDI));
        assert_eq!(t.param_reg(1), Some(RSI));
        assert_eq!(t.param_reg(5), Some(R9));
        assert_eq!(t.param_reg(6), None);
    }
}
