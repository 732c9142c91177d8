//! Graph execution errors.

use thiserror::Error;

use crate::checkpoint::CheckpointError;

/// Error from driving a compiled graph.
///
/// Node functions are expected to absorb collaborator failures into their
/// state update (the routers send error-carrying states to the failure sink);
/// `GraphError` covers what the engine itself cannot route around.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A node failed in a way the routing policy cannot absorb.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The run was cancelled at a node boundary or mid-node.
    #[error("execution cancelled")]
    Cancelled,

    /// Writing or reading a checkpoint failed; the run is aborted and the
    /// last durable checkpoint remains authoritative.
    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Resume was requested for a thread with no saved state.
    #[error("no saved state for thread: {0}")]
    NoSavedState(String),

    /// A router returned a node name outside its declared target set.
    #[error("router at '{from}' returned unreachable target '{target}'")]
    UnknownRouteTarget { from: String, target: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Display of each variant carries the expected keywords.
    #[test]
    fn graph_error_display() {
        assert!(GraphError::ExecutionFailed("x".into())
            .to_string()
            .contains("execution failed"));
        assert!(GraphError::Cancelled.to_string().contains("cancelled"));
        assert!(GraphError::NoSavedState("t".into())
            .to_string()
            .contains("no saved state"));
        let e = GraphError::UnknownRouteTarget {
            from: "reviewer".into(),
            target: "nowhere".into(),
        };
        assert!(e.to_string().contains("reviewer"));
        assert!(e.to_string().contains("nowhere"));
    }
}
