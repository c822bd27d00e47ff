//! The program: init parameters plus the shared type/entity store.
//!
//! A `Program` is shared between graphs (and threads) through an `Arc`;
//! graphs own their node pools exclusively, so parallel compilation only
//! contends on the store mutex.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::init::InitParams;
use crate::ir::graph::Graph;
use crate::ir::ident::Ident;
use crate::ir::mode::Mode;
use crate::ir::ty::{EntityId, MethodProps, TypeId, TypeKind, TypeStore};

#[derive(Debug)]
pub struct Program {
    params: InitParams,
    store: Mutex<TypeStore>,
}

impl Program {
    pub fn new(params: InitParams) -> Arc<Program> {
        let store = TypeStore::new(params.pointer_size);
        Arc::new(Program {
            params,
            store: Mutex::new(store),
        })
    }

    pub fn params(&self) -> &InitParams {
        &self.params
    }

    /// Lock the type store for a batch of queries.
    pub fn store(&self) -> MutexGuard<'_, TypeStore> {
        self.store.lock().unwrap()
    }

    pub fn new_primitive_type(&self, mode: Mode) -> TypeId {
        self.store().new_primitive(mode)
    }

    pub fn new_pointer_type(&self, to: TypeId) -> TypeId {
        self.store().new_pointer(to)
    }

    pub fn new_array_type(&self, element: TypeId, length: u32) -> TypeId {
        self.store().new_array(element, length)
    }

    pub fn new_struct_type(&self, name: &str) -> TypeId {
        self.store().new_compound(Ident::new(name), false, false)
    }

    pub fn new_class_type(&self, name: &str) -> TypeId {
        self.store().new_compound(Ident::new(name), true, false)
    }

    pub fn new_method_type(
        &self,
        params: Vec<TypeId>,
        results: Vec<TypeId>,
        props: MethodProps,
    ) -> TypeId {
        self.store().new_method(params, results, props)
    }

    pub fn add_member(&self, owner: TypeId, name: &str, ty: TypeId) -> EntityId {
        self.store().add_member(owner, Ident::new(name), ty)
    }

    pub fn layout_compound(&self, ty: TypeId) {
        self.store().layout_compound(ty)
    }

    pub fn new_global_entity(&self, name: &str, ty: TypeId) -> EntityId {
        self.store().new_global_entity(Ident::new(name), ty)
    }

    pub fn type_size(&self, ty: TypeId) -> u32 {
        self.store().type_data(ty).size
    }

    pub fn type_align(&self, ty: TypeId) -> u32 {
        self.store().type_data(ty).align
    }

    pub fn type_mode(&self, ty: TypeId) -> Mode {
        self.store().type_mode(ty)
    }

    pub fn type_kind(&self, ty: TypeId) -> TypeKind {
        self.store().type_data(ty).kind.clone()
    }

    pub fn entity_type(&self, ent: EntityId) -> TypeId {
        self.store().entity_data(ent).ty
    }

    pub fn entity_name(&self, ent: EntityId) -> Ident {
        self.store().entity_data(ent).name
    }

    pub fn entity_ld_name(&self, ent: EntityId) -> Ident {
        self.store().entity_data(ent).ld_name
    }

    pub fn entity_offset(&self, ent: EntityId) -> i32 {
        self.store().entity_data(ent).offset
    }

    /// Whether the method type carries the pure property.
    pub fn is_method_pure(&self, method_ty: TypeId) -> bool {
        match &self.store().type_data(method_ty).kind {
            TypeKind::Method { props, .. } => props.contains(MethodProps::PURE),
            _ => false,
        }
    }

    pub fn method_signature(&self, method_ty: TypeId) -> (Vec<TypeId>, Vec<TypeId>) {
        match &self.store().type_data(method_ty).kind {
            TypeKind::Method {
                params, results, ..
            } => (params.clone(), results.clone()),
            _ => (Vec::new(), Vec::new()),
        }
    }

    /// Create a graph for `entity` with `n_locals` local-variable slots.
    pub fn new_graph(self: &Arc<Program>, entity: EntityId, n_locals: usize) -> Graph {
        let name = self.entity_name(entity);
        let frame = self
            .store()
            .new_compound(Ident::new(&format!("frame.{}", name)), false, true);
        Graph::new(self.clone(), entity, frame, n_locals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_owns_shared_store() {
        let prog = Program::new(InitParams::host());
        let i32t = prog.new_primitive_type(Mode::Is32);
        let ptr = prog.new_pointer_type(i32t);
        assert_eq!(prog.type_size(i32t), 4);
        assert_eq!(prog.type_size(ptr), 8);
        assert_eq!(prog.type_mode(ptr), Mode::P);
    }

    #[test]
    fn graph_gets_a_frame_type() {
        let prog = Program::new(InitParams::host());
        let mty = prog.new_method_type(vec![], vec![], MethodProps::empty());
        let ent = prog.new_global_entity("f", mty);
        let g = prog.new_graph(ent, 0);
        let kind = prog.type_kind(g.frame_type());
        assert!(matches!(kind, TypeKind::Compound { is_frame: true, .. }));
    }
}
