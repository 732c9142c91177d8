//! Checkpointer trait and CheckpointError.
//!
//! Saves and loads checkpoints keyed by `thread_id`. A concurrent
//! `get_latest` sees either a fully written checkpoint or none.

use async_trait::async_trait;

use super::Checkpoint;

/// Error type for checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("storage: {0}")]
    Storage(String),
}

/// Saves and loads checkpoints by thread id.
///
/// Implementations: [`MemorySaver`](super::MemorySaver),
/// [`SqliteSaver`](super::SqliteSaver), [`PostgresSaver`](super::PostgresSaver).
///
/// **Interaction**: injected at graph compile via
/// `StateGraph::compile_with_checkpointer`; the run loop calls `put` after
/// every node, and status endpoints read through `get_latest` / `history`.
#[async_trait]
pub trait Checkpointer<S>: Send + Sync
where
    S: Clone + Send + Sync + 'static,
{
    /// Appends a checkpoint for the thread. Atomic with respect to readers.
    async fn put(&self, thread_id: &str, checkpoint: &Checkpoint<S>) -> Result<(), CheckpointError>;

    /// The most recent checkpoint for the thread, or `None` if never written.
    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint<S>>, CheckpointError>;

    /// All checkpoints for the thread, newest first.
    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint<S>>, CheckpointError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Display of each CheckpointError variant contains expected keywords.
    #[test]
    fn checkpoint_error_display() {
        assert!(CheckpointError::Serialization("err".into())
            .to_string()
            .contains("serialization"));
        assert!(CheckpointError::Storage("io".into())
            .to_string()
            .contains("storage"));
    }
}
