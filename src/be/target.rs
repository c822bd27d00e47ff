//! Target registration and the ISA descriptor.
//!
//! A target registers under a short name and describes its ISA: register
//! classes with their allocatable masks, register descriptors, and the
//! entry points the pipeline calls (lowering, selection, spill/reload
//! creation, cost estimates, two-address handling, emission).

use std::io::Write;

use rustc_hash::FxHashMap;

use crate::error::{BackendError, BackendResult};
use crate::ir::graph::Graph;
use crate::ir::mode::Mode;
use crate::ir::node::NodeId;

use super::BeState;

/// A physical register: class index plus index within the class.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Reg {
    pub class: u8,
    pub index: u8,
}

impl Reg {
    pub const fn new(class: u8, index: u8) -> Reg {
        Reg { class, index }
    }
}

/// One register class (general purpose, float, flags, ...).
#[derive(Debug)]
pub struct RegClassDesc {
    pub name: &'static str,
    /// Mode values of this class naturally have.
    pub mode: Mode,
    pub n_regs: u8,
    /// Bit per register: may the allocator hand it out?
    pub allocatable: u64,
}

impl RegClassDesc {
    pub fn n_allocatable(&self) -> u32 {
        self.allocatable.count_ones()
    }
}

/// One register.
#[derive(Debug)]
pub struct RegisterDesc {
    pub name: &'static str,
    /// Index within its class.
    pub index: u8,
    /// Index across all classes.
    pub global_index: u16,
    pub class: u8,
    /// Virtual registers exist only before allocation.
    pub is_virtual: bool,
}

/// Full ISA description a target hands to the pipeline.
#[derive(Debug)]
pub struct IsaDescriptor {
    pub name: &'static str,
    pub classes: Vec<RegClassDesc>,
    pub registers: Vec<RegisterDesc>,
    /// Registers exempt from the single-definition checks (stack
    /// pointer and friends).
    pub non_ssa_regs: Vec<Reg>,
}

impl IsaDescriptor {
    pub fn class(&self, idx: u8) -> &RegClassDesc {
        &self.classes[idx as usize]
    }

    pub fn reg_name(&self, reg: Reg) -> &'static str {
        self.registers
            .iter()
            .find(|r| r.class == reg.class && r.index == reg.index)
            .map(|r| r.name)
            .unwrap_or("?")
    }

    pub fn is_non_ssa(&self, reg: Reg) -> bool {
        self.non_ssa_regs.contains(&reg)
    }
}

/// Parameter block a target advertises to the middle end.
#[derive(Debug, Clone, Copy)]
pub struct TargetParams {
    pub pointer_size: u32,
    pub stack_param_align: u32,
    /// Shift amounts wrap at this value in hardware.
    pub modulo_shift: u32,
}

/// The contract every architecture implements.
pub trait Target: std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn isa(&self) -> &IsaDescriptor;

    fn init(&self) {}

    fn finish(&self) {}

    fn get_params(&self) -> TargetParams {
        TargetParams {
            pointer_size: 8,
            stack_param_align: 8,
            modulo_shift: 64,
        }
    }

    /// Register class for values of the given mode.
    fn class_for_mode(&self, mode: Mode) -> Option<u8>;

    /// Register the i-th integer parameter arrives in.
    fn param_reg(&self, _i: usize) -> Option<Reg> {
        None
    }

    /// Rewrite constructs the ISA cannot express (wide arithmetic,
    /// switches, soft float).
    fn lower_for_target(&self, g: &mut Graph) -> BackendResult<()>;

    /// Replace a generic node by machine nodes; the walker calls this
    /// for every node that still carries a generic opcode.
    fn select_node(&self, g: &mut Graph, node: NodeId) -> BackendResult<()>;

    /// Create a spill of `value` (a machine node holding a register).
    fn new_spill(&self, g: &mut Graph, value: NodeId, block: NodeId) -> NodeId;

    /// Create a reload of a spilled value.
    fn new_reload(&self, g: &mut Graph, mode: Mode, spill: NodeId, block: NodeId) -> NodeId;

    /// Create a register-to-register copy of `value`.
    fn new_copy(&self, g: &mut Graph, value: NodeId, block: NodeId) -> NodeId;

    /// Create a stack-pointer adjustment by `delta` bytes (positive
    /// grows the frame).
    fn new_incsp(&self, g: &mut Graph, block: NodeId, delta: i32) -> NodeId;

    /// Rough cost of executing the node once, used by spill heuristics.
    fn op_estimated_cost(&self, g: &Graph, node: NodeId) -> u32;

    /// Whether an asm clobber name denotes a register of this ISA.
    fn is_valid_clobber(&self, name: &str) -> bool;

    /// Try to repair an unfulfilled should-be-same constraint in place;
    /// returning false makes the generic driver insert a copy.
    fn handle_2addr(
        &self,
        g: &mut Graph,
        state: &mut BeState,
        node: NodeId,
        in_idx: usize,
        reg: Reg,
    ) -> bool;

    /// Final target-specific rewrites on the scheduled, allocated graph.
    fn peephole(&self, _g: &mut Graph, _state: &mut BeState) {}

    /// Write the assembly for one scheduled node.
    fn emit_node(
        &self,
        g: &Graph,
        state: &BeState,
        node: NodeId,
        out: &mut dyn Write,
    ) -> std::io::Result<()>;
}

/// Name-keyed registry of targets.
pub struct TargetRegistry {
    targets: FxHashMap<&'static str, Box<dyn Target>>,
}

impl TargetRegistry {
    pub fn new() -> TargetRegistry {
        TargetRegistry {
            targets: FxHashMap::default(),
        }
    }

    /// Registry pre-populated with the built-in targets.
    pub fn with_builtins() -> TargetRegistry {
        let mut r = TargetRegistry::new();
        r.register(Box::new(super::amd64::Amd64::new()));
        r
    }

    pub fn register(&mut self, target: Box<dyn Target>) {
        self.targets.insert(target.name(), target);
    }

    pub fn get(&self, name: &str) -> BackendResult<&dyn Target> {
        self.targets
            .get(name)
            .map(|t| t.as_ref())
            .ok_or_else(|| BackendError::UnknownTarget(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.targets.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_amd64() {
        let r = TargetRegistry::with_builtins();
        assert!(r.get("amd64").is_ok());
        assert!(r.get("m68k").is_err());
        assert_eq!(r.names(), vec!["amd64"]);
    }

    #[test]
    fn descriptor_queries() {
        let r = TargetRegistry::with_builtins();
        let t = r.get("amd64").unwrap();
        let isa = t.isa();
        assert!(isa.classes.len() >= 2);
        assert!(isa.class(0).n_allocatable() > 0);
        let sp = isa.non_ssa_regs[0];
        assert!(isa.is_non_ssa(sp));
        assert_eq!(t.get_params().pointer_size, 8);
        assert_eq!(t.get_params().modulo_shift, 64);
    }
}
