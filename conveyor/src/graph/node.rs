//! Graph node trait: one phase step in a pipeline graph.
//!
//! Receives the merged state `S`, returns a partial update `U`. The engine
//! applies the update through the graph's reducer and then consults the
//! routing table, so nodes never choose their successor.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::GraphError;

/// Per-run context handed to every node.
///
/// Carries the thread id (for working-directory naming and logs) and the
/// cancellation token the runner trips on cancel or timeout. Long-running
/// nodes should pass the token into their agent sessions; the engine also
/// races every node against it, so an un-cooperative node is still dropped
/// at its next await point.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub thread_id: String,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(thread_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            thread_id: thread_id.into(),
            cancel,
        }
    }
}

/// One step in a graph: state in, partial update out.
///
/// Contract (every pipeline node follows it):
/// - read only what it needs, never mutate the input;
/// - return only the fields it changes, with `current_phase` set to its own;
/// - append at least one log entry;
/// - absorb collaborator failures into the update's `errors` instead of
///   returning `Err`; the routers send error-carrying states to the failure
///   sink; `Err` is reserved for cancellation and programming errors.
#[async_trait]
pub trait Node<S, U>: Send + Sync
where
    S: Clone + Send + Sync + 'static,
    U: Send + 'static,
{
    /// Node id (e.g. `"research"`). Must be unique within a graph.
    fn id(&self) -> &str;

    /// One step: state in, partial update out.
    async fn run(&self, state: S, ctx: &RunContext) -> Result<U, GraphError>;
}
