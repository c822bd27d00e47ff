//! Nodes and opcodes.
//!
//! A node is an entry in its graph's pool: an opcode with an attribute
//! payload, a result mode, an owning block and an ordered input array.
//! Generic passes look only at the common fields; opcode-specific passes
//! match the [`Op`] variant.

use std::fmt;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::ir::mode::Mode;
use crate::ir::tarval::Tarval;
use crate::ir::ty::{EntityId, TypeId};

/// Index of a node in its graph's pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

bitflags! {
    /// Result of a comparison, and the condition a Cmp node tests for.
    ///
    /// A relation is the set of outcomes it accepts; `LESS | EQUAL` is
    /// "less or equal". Floating comparisons may additionally accept the
    /// unordered outcome.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct Relation: u8 {
        const EQUAL     = 1 << 0;
        const LESS      = 1 << 1;
        const GREATER   = 1 << 2;
        const UNORDERED = 1 << 3;
    }
}

impl Relation {
    pub const FALSE: Relation = Relation::empty();
    pub const LESS_EQUAL: Relation = Relation::LESS.union(Relation::EQUAL);
    pub const GREATER_EQUAL: Relation = Relation::GREATER.union(Relation::EQUAL);
    pub const LESS_GREATER: Relation = Relation::LESS.union(Relation::GREATER);
    pub const ORDERED: Relation = Relation::LESS_GREATER.union(Relation::EQUAL);

    /// The relation accepting exactly the outcomes this one rejects.
    pub fn negated(self) -> Relation {
        Relation::ORDERED.union(Relation::UNORDERED).difference(self)
    }

    /// The relation with the operands swapped.
    pub fn inversed(self) -> Relation {
        let mut r = self & (Relation::EQUAL | Relation::UNORDERED);
        if self.contains(Relation::LESS) {
            r |= Relation::GREATER;
        }
        if self.contains(Relation::GREATER) {
            r |= Relation::LESS;
        }
        r
    }

    /// Whether `outcome` (one of EQUAL/LESS/GREATER/UNORDERED) satisfies
    /// this relation.
    pub fn holds(self, outcome: Relation) -> bool {
        self.intersects(outcome)
    }

    pub fn name(self) -> &'static str {
        match self {
            r if r == Relation::FALSE => "false",
            r if r == Relation::EQUAL => "eq",
            r if r == Relation::LESS => "lt",
            r if r == Relation::GREATER => "gt",
            r if r == Relation::LESS_EQUAL => "le",
            r if r == Relation::GREATER_EQUAL => "ge",
            r if r == Relation::LESS_GREATER => "ne",
            r if r == Relation::ORDERED => "ord",
            r if r == Relation::UNORDERED => "uo",
            _ => "rel",
        }
    }
}

/// Projection numbers, per producing node class.
pub mod pn {
    pub mod start {
        pub const M: u32 = 0;
        pub const FRAME: u32 = 1;
        /// Argument `i` projects as `ARGS + i`.
        pub const ARGS: u32 = 2;
    }
    pub mod cond {
        pub const FALSE: u32 = 0;
        pub const TRUE: u32 = 1;
    }
    pub mod load {
        pub const M: u32 = 0;
        pub const RES: u32 = 1;
    }
    pub mod store {
        pub const M: u32 = 0;
    }
    pub mod call {
        pub const M: u32 = 0;
        /// Result `i` projects as `RES + i`.
        pub const RES: u32 = 1;
    }
    pub mod alloc {
        pub const M: u32 = 0;
        pub const RES: u32 = 1;
    }
    pub mod div {
        pub const M: u32 = 0;
        pub const RES: u32 = 1;
    }
}

/// Opcode tag plus attribute payload. The set is closed; target-specific
/// operations appear only as [`Op::Mach`] after instruction selection.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Op {
    /// Function entry; produces memory, frame pointer and arguments.
    Start,
    /// Function exit collector; inputs are Returns and keep-alive edges.
    End,
    /// Basic block; inputs are control-flow predecessors.
    Block,
    /// Result of a removed or unreachable computation.
    Bad,
    /// The memory sentinel for memory-less operations.
    NoMem,
    /// Placeholder for a value not yet defined on some path.
    Unknown,
    Const(Tarval),
    /// Address of an entity (global, function).
    Address(EntityId),
    /// Merge node; one input per block predecessor. `loop_` marks phis
    /// inserted by loop-closed SSA construction that carry a keep-alive.
    Phi { loop_: bool },
    Add,
    Sub,
    Mul,
    /// Division; takes and produces memory (may trap).
    Div,
    /// Remainder; takes and produces memory (may trap).
    Mod,
    Minus,
    And,
    Or,
    Eor,
    Not,
    Shl,
    Shr,
    Shrs,
    Conv,
    Cmp(Relation),
    /// Binary branch on a boolean selector.
    Cond,
    Jmp,
    /// Value select: Mux(sel, false_val, true_val).
    Mux,
    Proj(u32),
    Tuple,
    Load(TypeId),
    Store(TypeId),
    /// Call; the payload is the callee's method type.
    Call(TypeId),
    Return,
    /// Stack allocation with the given alignment.
    Alloc(u32),
    /// Address of a compound member.
    Member(EntityId),
    /// Address of an array element: Sel(ptr, index) for the array type.
    Sel(TypeId),
    /// Artificial user keeping otherwise-dead nodes alive.
    Keep,
    /// Target-specific operation produced by instruction selection.
    Mach(MachAttr),
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Start => "Start",
            Op::End => "End",
            Op::Block => "Block",
            Op::Bad => "Bad",
            Op::NoMem => "NoMem",
            Op::Unknown => "Unknown",
            Op::Const(_) => "Const",
            Op::Address(_) => "Address",
            Op::Phi { .. } => "Phi",
            Op::Add => "Add",
            Op::Sub => "Sub",
            Op::Mul => "Mul",
            Op::Div => "Div",
            Op::Mod => "Mod",
            Op::Minus => "Minus",
            Op::And => "And",
            Op::Or => "Or",
            Op::Eor => "Eor",
            Op::Not => "Not",
            Op::Shl => "Shl",
            Op::Shr => "Shr",
            Op::Shrs => "Shrs",
            Op::Conv => "Conv",
            Op::Cmp(_) => "Cmp",
            Op::Cond => "Cond",
            Op::Jmp => "Jmp",
            Op::Mux => "Mux",
            Op::Proj(_) => "Proj",
            Op::Tuple => "Tuple",
            Op::Load(_) => "Load",
            Op::Store(_) => "Store",
            Op::Call(_) => "Call",
            Op::Return => "Return",
            Op::Alloc(_) => "Alloc",
            Op::Member(_) => "Member",
            Op::Sel(_) => "Sel",
            Op::Keep => "Keep",
            Op::Mach(attr) => attr.opcode.name,
        }
    }

    /// Binary arithmetic with a left and right operand.
    pub fn is_binop(&self) -> bool {
        matches!(
            self,
            Op::Add
                | Op::Sub
                | Op::Mul
                | Op::And
                | Op::Or
                | Op::Eor
                | Op::Shl
                | Op::Shr
                | Op::Shrs
        )
    }

    pub fn is_commutative(&self) -> bool {
        matches!(self, Op::Add | Op::Mul | Op::And | Op::Or | Op::Eor)
    }

    /// Operations that must stay in their block (touch memory or control
    /// flow, or observe the block's position).
    pub fn is_pinned(&self) -> bool {
        matches!(
            self,
            Op::Start
                | Op::End
                | Op::Block
                | Op::Phi { .. }
                | Op::Cond
                | Op::Jmp
                | Op::Load(_)
                | Op::Store(_)
                | Op::Call(_)
                | Op::Return
                | Op::Alloc(_)
                | Op::Div
                | Op::Mod
                | Op::Keep
                | Op::Mach(_)
        )
    }

    /// Whether two occurrences with equal inputs may be merged by value
    /// numbering.
    pub fn is_cse_candidate(&self) -> bool {
        !matches!(
            self,
            Op::Start
                | Op::End
                | Op::Block
                | Op::Phi { .. }
                | Op::Cond
                | Op::Jmp
                | Op::Load(_)
                | Op::Store(_)
                | Op::Call(_)
                | Op::Return
                | Op::Alloc(_)
                | Op::Div
                | Op::Mod
                | Op::Keep
                | Op::Bad
                | Op::Unknown
                | Op::Mach(_)
        )
    }
}

/// Static description of a target opcode. Targets define these as statics;
/// machine nodes reference them by identity.
#[derive(Debug)]
pub struct MachOpDesc {
    pub name: &'static str,
    /// Ends its block (branch, jump, return).
    pub is_cf: bool,
    /// Writes a value to its frame entity.
    pub is_spill: bool,
    /// Reads a value back from its frame entity.
    pub is_reload: bool,
    /// Register-to-register copy inserted by the allocator.
    pub is_copy: bool,
    /// Stack pointer adjustment.
    pub is_incsp: bool,
}

/// Reference to a target opcode descriptor; compared by identity.
pub type MachOpcode = &'static MachOpDesc;

/// Register-requirement of one machine operand.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct RegReq {
    /// Register class index within the target ISA.
    pub class: u8,
    /// When set, only registers whose bit is set are admissible.
    pub limited: Option<u64>,
    /// Output must be assigned the same register as this input.
    pub same_as: Option<u8>,
    /// Bitmask of inputs this output must differ from.
    pub must_be_different: u64,
    /// Number of consecutive registers occupied.
    pub width: u8,
    /// First register index must be a multiple of `width`.
    pub aligned: bool,
}

impl RegReq {
    pub fn class(class: u8) -> RegReq {
        RegReq {
            class,
            width: 1,
            ..RegReq::default()
        }
    }

    /// Requirement of a memory or control operand: no register at all.
    pub fn none() -> RegReq {
        RegReq {
            class: u8::MAX,
            width: 0,
            ..RegReq::default()
        }
    }

    pub fn is_none(&self) -> bool {
        self.class == u8::MAX
    }

    pub fn limited(class: u8, mask: u64) -> RegReq {
        RegReq {
            class,
            limited: Some(mask),
            width: 1,
            ..RegReq::default()
        }
    }
}

/// Payload of a machine node.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MachAttr {
    pub opcode: MachOpcode,
    pub in_reqs: SmallVec<[RegReq; 4]>,
    pub out_reqs: SmallVec<[RegReq; 2]>,
    /// Immediate operand, when the instruction carries one.
    pub imm: Option<Tarval>,
    /// Frame entity for spills, reloads and frame accesses.
    pub frame_entity: Option<EntityId>,
    /// Resolved sp-relative offset, filled by stack finalization.
    pub frame_offset: Option<i32>,
    /// Left/right operands may be swapped.
    pub commutative: bool,
    /// Condition tested or produced (compares, conditional jumps).
    pub cond: Option<Relation>,
}

impl MachAttr {
    pub fn new(opcode: MachOpcode) -> MachAttr {
        MachAttr {
            opcode,
            in_reqs: SmallVec::new(),
            out_reqs: SmallVec::new(),
            imm: None,
            frame_entity: None,
            frame_offset: None,
            commutative: false,
            cond: None,
        }
    }
}

impl PartialEq for MachOpDesc {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for MachOpDesc {}

/// One node in the pool.
#[derive(Clone, Debug)]
pub struct NodeData {
    pub op: Op,
    pub mode: Mode,
    /// Owning block. Blocks own themselves; End lives in the end block.
    pub block: NodeId,
    pub ins: SmallVec<[NodeId; 4]>,
}

impl NodeData {
    pub fn new(op: Op, mode: Mode, block: NodeId, ins: &[NodeId]) -> NodeData {
        NodeData {
            op,
            mode,
            block,
            ins: SmallVec::from_slice(ins),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_negation_and_inversion() {
        assert_eq!(Relation::LESS.negated(), Relation::GREATER_EQUAL | Relation::UNORDERED);
        assert_eq!(Relation::LESS.inversed(), Relation::GREATER);
        assert_eq!(Relation::LESS_EQUAL.inversed(), Relation::GREATER_EQUAL);
        assert_eq!(Relation::EQUAL.inversed(), Relation::EQUAL);
    }

    #[test]
    fn relation_holds() {
        assert!(Relation::LESS_EQUAL.holds(Relation::EQUAL));
        assert!(Relation::LESS_EQUAL.holds(Relation::LESS));
        assert!(!Relation::LESS_EQUAL.holds(Relation::GREATER));
    }

    #[test]
    fn op_classification() {
        assert!(Op::Add.is_binop());
        assert!(Op::Add.is_commutative());
        assert!(!Op::Sub.is_commutative());
        assert!(Op::Phi { loop_: false }.is_pinned());
        assert!(Op::Add.is_cse_candidate());
        assert!(!Op::Load(crate::ir::ty::TypeId(0)).is_cse_candidate());
    }
}
