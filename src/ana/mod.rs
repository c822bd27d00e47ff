//! Graph analyses.
//!
//! Every analysis reads the graph and fills a cache owned by the graph (or
//! returns its result to the caller); freshness is tracked through
//! [`crate::ir::graph::GraphProps`]. Re-running an analysis on an
//! unchanged graph produces the same result.

pub mod alias;
pub mod dom;
pub mod lcssa;
pub mod liveness;
pub mod loops;
