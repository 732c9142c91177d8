//! Checkpoint persistence: the append-only history of `(thread_id,
//! checkpoint_id, state, next_nodes)` that makes pipelines durable.
//!
//! Three stores share one trait: [`MemorySaver`] (tests/dev), [`SqliteSaver`]
//! (single-file embedded), [`PostgresSaver`] (network, multi-pipeline). The
//! process-wide store is chosen once from settings by [`build_checkpointer`].

mod checkpointer;
mod memory_saver;
mod postgres_saver;
mod serializer;
mod sqlite_saver;

pub use checkpointer::{CheckpointError, Checkpointer};
pub use memory_saver::MemorySaver;
pub use postgres_saver::PostgresSaver;
pub use serializer::{JsonSerializer, Serializer};
pub use sqlite_saver::SqliteSaver;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::settings::{CheckpointerType, Settings};

/// One checkpoint: an immutable snapshot of state plus outgoing-edge
/// candidates, written atomically at every node boundary.
///
/// `id` is `<zero-padded step>-<random suffix>` so the id sequence for a
/// thread is strictly monotonic under plain string ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint<S> {
    pub id: String,
    pub parent_id: Option<String>,
    /// Node-boundary counter, starting at 1 for the first completed node.
    pub step: i64,
    pub state: S,
    /// Nodes eligible to run next; empty for a terminal checkpoint.
    pub next_nodes: Vec<String>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

impl<S> Checkpoint<S> {
    pub fn new(step: i64, parent_id: Option<String>, state: S, next_nodes: Vec<String>) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{step:08}-{suffix}"),
            parent_id,
            step,
            state,
            next_nodes,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Builds the process-wide checkpoint store from settings.
///
/// Held for process lifetime by the runner; dropping it closes the
/// connection. Postgres requires `ORCH_POSTGRES_URL`.
pub async fn build_checkpointer<S>(
    settings: &Settings,
) -> Result<Arc<dyn Checkpointer<S>>, CheckpointError>
where
    S: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    let serializer: Arc<dyn Serializer<S>> = Arc::new(JsonSerializer);
    match settings.checkpointer_type {
        CheckpointerType::Memory => {
            tracing::info!("using in-memory checkpointer (no persistence)");
            Ok(Arc::new(MemorySaver::new()))
        }
        CheckpointerType::Sqlite => {
            tracing::info!(path = %settings.sqlite_db_path, "using sqlite checkpointer");
            Ok(Arc::new(SqliteSaver::new(
                &settings.sqlite_db_path,
                serializer,
            )?))
        }
        CheckpointerType::Postgres => {
            let url = settings.postgres_url.as_deref().ok_or_else(|| {
                CheckpointError::Storage(
                    "ORCH_POSTGRES_URL is required for the postgres checkpointer".into(),
                )
            })?;
            tracing::info!("using postgres checkpointer");
            let saver = PostgresSaver::connect(url, serializer).await?;
            Ok(Arc::new(saver))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Checkpoint ids order by step under plain string comparison.
    #[test]
    fn checkpoint_ids_monotonic_by_step() {
        let a: Checkpoint<u32> = Checkpoint::new(1, None, 0, vec![]);
        let b: Checkpoint<u32> = Checkpoint::new(2, Some(a.id.clone()), 0, vec![]);
        let c: Checkpoint<u32> = Checkpoint::new(10, Some(b.id.clone()), 0, vec![]);
        assert!(a.id < b.id);
        assert!(b.id < c.id);
        assert_eq!(c.parent_id.as_deref(), Some(b.id.as_str()));
    }
}
