//! The type graph and entities.
//!
//! Types and entities live in a store shared by all graphs of a program;
//! the store sits behind a mutex in [`crate::Program`] because identifier
//! and type creation is read-mostly, write-rare. Compound layout assigns
//! member offsets by ascending alignment, which is also how the back end
//! lays out stack frames.

use bitflags::bitflags;

use crate::ir::ident::Ident;
use crate::ir::mode::Mode;

/// Handle of a type in the program's store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TypeId(pub u32);

/// Handle of an entity in the program's store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EntityId(pub u32);

bitflags! {
    /// Additional properties of a method type.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct MethodProps: u8 {
        /// No side effects; result depends only on arguments.
        const PURE     = 1 << 0;
        const NORETURN = 1 << 1;
        const NOTHROW  = 1 << 2;
    }
}

/// Structure of a type.
#[derive(Clone, Debug, PartialEq)]
pub enum TypeKind {
    Primitive(Mode),
    Pointer(TypeId),
    Array { element: TypeId, length: u32 },
    /// Struct, class and frame types share the compound representation;
    /// classes additionally allow a supertype.
    Compound {
        name: Ident,
        members: Vec<EntityId>,
        supertype: Option<TypeId>,
        is_class: bool,
        is_frame: bool,
    },
    Method {
        params: Vec<TypeId>,
        results: Vec<TypeId>,
        props: MethodProps,
    },
}

#[derive(Clone, Debug)]
pub struct TypeData {
    pub kind: TypeKind,
    /// Size in bytes; compounds get theirs at layout time.
    pub size: u32,
    pub align: u32,
    pub layouted: bool,
}

/// What an entity names.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntityKind {
    /// Global variable or function.
    Global,
    /// Member of a compound.
    Member,
    /// Frame slot created for a spilled value.
    Spill,
}

#[derive(Clone, Debug)]
pub struct EntityData {
    pub name: Ident,
    /// Linker-visible name; diagnostics prefix with this.
    pub ld_name: Ident,
    pub ty: TypeId,
    pub owner: Option<TypeId>,
    pub kind: EntityKind,
    /// Byte offset inside the owner; -1 until laid out.
    pub offset: i32,
}

/// Backing store for types and entities.
#[derive(Default, Debug)]
pub struct TypeStore {
    pub types: Vec<TypeData>,
    pub entities: Vec<EntityData>,
    pointer_size: u32,
}

impl TypeStore {
    pub fn new(pointer_size: u32) -> TypeStore {
        TypeStore {
            types: Vec::new(),
            entities: Vec::new(),
            pointer_size,
        }
    }

    fn push_type(&mut self, kind: TypeKind, size: u32, align: u32, layouted: bool) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeData {
            kind,
            size,
            align,
            layouted,
        });
        id
    }

    pub fn new_primitive(&mut self, mode: Mode) -> TypeId {
        let size = mode.bytes();
        self.push_type(TypeKind::Primitive(mode), size, size.max(1), true)
    }

    pub fn new_pointer(&mut self, to: TypeId) -> TypeId {
        let size = self.pointer_size;
        self.push_type(TypeKind::Pointer(to), size, size, true)
    }

    pub fn new_array(&mut self, element: TypeId, length: u32) -> TypeId {
        let esize = self.types[element.0 as usize].size;
        let ealign = self.types[element.0 as usize].align;
        self.push_type(
            TypeKind::Array { element, length },
            esize * length,
            ealign,
            true,
        )
    }

    pub fn new_compound(&mut self, name: Ident, is_class: bool, is_frame: bool) -> TypeId {
        self.push_type(
            TypeKind::Compound {
                name,
                members: Vec::new(),
                supertype: None,
                is_class,
                is_frame,
            },
            0,
            1,
            false,
        )
    }

    pub fn new_method(
        &mut self,
        params: Vec<TypeId>,
        results: Vec<TypeId>,
        props: MethodProps,
    ) -> TypeId {
        self.push_type(
            TypeKind::Method {
                params,
                results,
                props,
            },
            0,
            1,
            true,
        )
    }

    fn push_entity(&mut self, data: EntityData) -> EntityId {
        let id = EntityId(self.entities.len() as u32);
        self.entities.push(data);
        id
    }

    pub fn new_global_entity(&mut self, name: Ident, ty: TypeId) -> EntityId {
        self.push_entity(EntityData {
            name,
            ld_name: name,
            ty,
            owner: None,
            kind: EntityKind::Global,
            offset: -1,
        })
    }

    /// Add a member to a compound; offset assigned by [`Self::layout_compound`].
    pub fn add_member(&mut self, owner: TypeId, name: Ident, ty: TypeId) -> EntityId {
        let ent = self.push_entity(EntityData {
            name,
            ld_name: name,
            ty,
            owner: Some(owner),
            kind: EntityKind::Member,
            offset: -1,
        });
        match &mut self.types[owner.0 as usize].kind {
            TypeKind::Compound { members, .. } => members.push(ent),
            _ => crate::init::fatal("add_member on non-compound type"),
        }
        self.types[owner.0 as usize].layouted = false;
        ent
    }

    /// Add a spill slot of `size`/`align` bytes to a frame type.
    pub fn frame_alloc_entity(&mut self, frame: TypeId, size: u32, align: u32) -> EntityId {
        debug_assert!(matches!(
            self.types[frame.0 as usize].kind,
            TypeKind::Compound { is_frame: true, .. }
        ));
        let prim = self.new_blob_type(size, align);
        let name = Ident::unique("spill");
        let ent = self.push_entity(EntityData {
            name,
            ld_name: name,
            ty: prim,
            owner: Some(frame),
            kind: EntityKind::Spill,
            offset: -1,
        });
        match &mut self.types[frame.0 as usize].kind {
            TypeKind::Compound { members, .. } => members.push(ent),
            _ => unreachable!(),
        }
        self.types[frame.0 as usize].layouted = false;
        ent
    }

    fn new_blob_type(&mut self, size: u32, align: u32) -> TypeId {
        let mode = match size {
            1 => Mode::Iu8,
            2 => Mode::Iu16,
            4 => Mode::Iu32,
            _ => Mode::Iu64,
        };
        let id = self.push_type(TypeKind::Primitive(mode), size, align, true);
        id
    }

    /// Assign member offsets by ascending alignment and compute the size.
    pub fn layout_compound(&mut self, ty: TypeId) {
        let members = match &self.types[ty.0 as usize].kind {
            TypeKind::Compound { members, .. } => members.clone(),
            _ => return,
        };
        let mut order: Vec<EntityId> = members;
        order.sort_by_key(|e| {
            let mty = self.entities[e.0 as usize].ty;
            self.types[mty.0 as usize].align
        });
        let mut offset = 0u32;
        let mut max_align = 1u32;
        for ent in order {
            let mty = self.entities[ent.0 as usize].ty;
            let size = self.types[mty.0 as usize].size;
            let align = self.types[mty.0 as usize].align.max(1);
            offset = (offset + align - 1) & !(align - 1);
            self.entities[ent.0 as usize].offset = offset as i32;
            offset += size;
            max_align = max_align.max(align);
        }
        let data = &mut self.types[ty.0 as usize];
        data.size = (offset + max_align - 1) & !(max_align - 1);
        data.align = max_align;
        data.layouted = true;
    }

    pub fn type_data(&self, ty: TypeId) -> &TypeData {
        &self.types[ty.0 as usize]
    }

    pub fn entity_data(&self, ent: EntityId) -> &EntityData {
        &self.entities[ent.0 as usize]
    }

    /// The mode a value of this type has when loaded into a register.
    pub fn type_mode(&self, ty: TypeId) -> Mode {
        match &self.types[ty.0 as usize].kind {
            TypeKind::Primitive(m) => *m,
            TypeKind::Pointer(_) => Mode::P,
            _ => Mode::P,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_orders_by_ascending_alignment() {
        let mut ts = TypeStore::new(8);
        let i8t = ts.new_primitive(Mode::Iu8);
        let i64t = ts.new_primitive(Mode::Is64);
        let i16t = ts.new_primitive(Mode::Is16);
        let s = ts.new_compound(Ident::new("s"), false, false);
        let a = ts.add_member(s, Ident::new("a"), i64t);
        let b = ts.add_member(s, Ident::new("b"), i8t);
        let c = ts.add_member(s, Ident::new("c"), i16t);
        ts.layout_compound(s);
        // ascending alignment: b (1), c (2), a (8)
        assert_eq!(ts.entity_data(b).offset, 0);
        assert_eq!(ts.entity_data(c).offset, 2);
        assert_eq!(ts.entity_data(a).offset, 8);
        assert_eq!(ts.type_data(s).size, 16);
        assert_eq!(ts.type_data(s).align, 8);
    }

    #[test]
    fn array_size() {
        let mut ts = TypeStore::new(8);
        let i32t = ts.new_primitive(Mode::Is32);
        let arr = ts.new_array(i32t, 4);
        assert_eq!(ts.type_data(arr).size, 16);
        assert_eq!(ts.type_data(arr).align, 4);
    }

    #[test]
    fn method_props() {
        let mut ts = TypeStore::new(8);
        let i32t = ts.new_primitive(Mode::Is32);
        let m = ts.new_method(vec![i32t], vec![i32t], MethodProps::PURE);
        match &ts.type_data(m).kind {
            TypeKind::Method { props, .. } => assert!(props.contains(MethodProps::PURE)),
            _ => panic!("not a method"),
        }
    }
}
