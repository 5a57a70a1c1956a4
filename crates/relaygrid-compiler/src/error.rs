//! Compiler error types.

use thiserror::Error;

use relay_core::NodeId;

/// Errors that abort the compile of one node.
///
/// Template problems are not errors here: a bad fragment is skipped and
/// recorded in the compile report.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("runtime disabled on node {0}")]
    RuntimeDisabled(NodeId),

    #[error("program {program:?} not available for node {node_id}")]
    ProgramNotFound { node_id: NodeId, program: String },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store error: {0}")]
    State(#[from] relaygrid_state::StateError),
}

pub type CompileResult<T> = Result<T, CompileError>;
