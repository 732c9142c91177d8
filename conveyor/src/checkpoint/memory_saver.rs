//! In-memory checkpointer (MemorySaver). Not persistent; for dev and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::checkpointer::{CheckpointError, Checkpointer};
use super::Checkpoint;

/// In-memory checkpointer: each thread id holds a list of checkpoints, newest
/// last. Writers append under the write lock, so readers see either the full
/// new record or none.
pub struct MemorySaver<S> {
    inner: Arc<RwLock<HashMap<String, Vec<Checkpoint<S>>>>>,
}

impl<S> MemorySaver<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<S> Default for MemorySaver<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S> Checkpointer<S> for MemorySaver<S>
where
    S: Clone + Send + Sync + 'static,
{
    async fn put(&self, thread_id: &str, checkpoint: &Checkpoint<S>) -> Result<(), CheckpointError> {
        let mut guard = self.inner.write().await;
        guard
            .entry(thread_id.to_string())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint<S>>, CheckpointError> {
        let guard = self.inner.read().await;
        Ok(guard.get(thread_id).and_then(|list| list.last().cloned()))
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint<S>>, CheckpointError> {
        let guard = self.inner.read().await;
        Ok(guard
            .get(thread_id)
            .map(|list| list.iter().rev().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: put then get_latest returns the newest checkpoint;
    /// history is newest first.
    #[tokio::test]
    async fn put_get_history() {
        let saver: MemorySaver<u32> = MemorySaver::new();
        assert!(saver.get_latest("t1").await.unwrap().is_none());

        let first = Checkpoint::new(1, None, 10, vec!["b".into()]);
        let second = Checkpoint::new(2, Some(first.id.clone()), 20, vec![]);
        saver.put("t1", &first).await.unwrap();
        saver.put("t1", &second).await.unwrap();

        let latest = saver.get_latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.state, 20);
        assert!(latest.next_nodes.is_empty());

        let history = saver.history("t1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].state, 20);
        assert_eq!(history[1].state, 10);
    }

    /// **Scenario**: Threads are isolated from each other.
    #[tokio::test]
    async fn threads_are_isolated() {
        let saver: MemorySaver<u32> = MemorySaver::new();
        saver
            .put("t1", &Checkpoint::new(1, None, 1, vec![]))
            .await
            .unwrap();
        assert!(saver.get_latest("t2").await.unwrap().is_none());
        assert!(saver.history("t2").await.unwrap().is_empty());
    }
}
