//! Graph compilation errors: raised by `StateGraph::compile` when the edge
//! table is inconsistent.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompilationError {
    /// An edge or conditional source references a node id that was never added.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// No edge from START.
    #[error("graph has no entry edge from START")]
    MissingStart,

    /// No path reaches END.
    #[error("graph has no edge to END")]
    MissingEnd,

    /// A conditional path map targets a node id that was never added.
    #[error("conditional path map targets unknown node: {0}")]
    InvalidConditionalPathMap(String),

    /// A node has both an unconditional outgoing edge and conditional edges.
    #[error("node has both an edge and conditional edges: {0}")]
    NodeHasBothEdgeAndConditional(String),

    /// The edge table is structurally invalid (duplicate outgoing edge,
    /// multiple START edges, unreachable node).
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
}
