//! Error types for graph construction and the back end.
//!
//! Contract violations (maturing a block twice, running a pass with unmet
//! preconditions) are programmer errors and panic through the hook in
//! [`crate::init`]; everything here is a recoverable condition reported to
//! the caller.

use thiserror::Error;

use crate::ir::mode::Mode;
use crate::ir::node::NodeId;

/// Errors surfaced by the construction facade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("operation requires finalized graph but block {0:?} is still open")]
    OpenBlock(NodeId),

    #[error("{op}: input mode {found} incompatible with expected {expected}")]
    TypeMismatch {
        op: &'static str,
        expected: Mode,
        found: Mode,
    },

    #[error("{op}: operand modes {left} and {right} disagree")]
    ModeDisagreement {
        op: &'static str,
        left: Mode,
        right: Mode,
    },

    #[error("entity has no graph to inline")]
    NoGraph,
}

/// Result alias for facade operations.
pub type BuildResult<T> = Result<T, BuildError>;

/// Errors surfaced by the back-end pipeline. Verifier findings are not
/// errors; they go to the diagnostic stream and the pipeline proceeds.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("no target registered under name '{0}'")]
    UnknownTarget(String),

    #[error("unsupported node {node:?} ({op}) reached {stage}")]
    Unsupported {
        node: NodeId,
        op: &'static str,
        stage: &'static str,
    },

    #[error("register allocation failed: {reason}")]
    RegisterAllocation { reason: String },

    #[error("emission failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for back-end operations.
pub type BackendResult<T> = Result<T, BackendError>;
