//! The IR kernel: modes, tarvals, identifiers, types, nodes, graphs and the
//! construction facade.

pub mod build;
pub mod graph;
pub mod ident;
pub mod mode;
pub mod node;
pub mod prog;
pub mod tarval;
pub mod ty;

pub use ident::Ident;
pub use mode::Mode;
pub use node::{NodeId, Op, Relation};
pub use tarval::Tarval;
pub use ty::{EntityId, TypeId};
