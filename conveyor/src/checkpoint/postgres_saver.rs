//! PostgreSQL-backed checkpointer (PostgresSaver). For multi-pipeline,
//! multi-node deployments.
//!
//! Holds one client behind an async mutex; concurrent pipelines interleave
//! statements and rely on row-level isolation. The connection driver runs on
//! a spawned task for the life of the saver.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::NoTls;

use super::checkpointer::{CheckpointError, Checkpointer};
use super::serializer::Serializer;
use super::Checkpoint;

/// PostgreSQL-backed checkpointer. Key: `(thread_id, checkpoint_id)`.
pub struct PostgresSaver<S> {
    client: Arc<Mutex<tokio_postgres::Client>>,
    serializer: Arc<dyn Serializer<S>>,
}

impl<S> PostgresSaver<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Connects, spawns the connection driver task, and creates the table.
    pub async fn connect(
        url: &str,
        serializer: Arc<dyn Serializer<S>>,
    ) -> Result<Self, CheckpointError> {
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .map_err(|e| CheckpointError::Storage(format!("postgres connect: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "postgres connection error");
            }
        });

        let saver = Self {
            client: Arc::new(Mutex::new(client)),
            serializer,
        };
        saver.setup().await?;
        Ok(saver)
    }

    /// Creates the checkpoints table when missing.
    async fn setup(&self) -> Result<(), CheckpointError> {
        let client = self.client.lock().await;
        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS checkpoints (
                    thread_id TEXT NOT NULL,
                    checkpoint_id TEXT NOT NULL,
                    parent_id TEXT,
                    step BIGINT NOT NULL,
                    state_blob BYTEA NOT NULL,
                    next_nodes TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (thread_id, checkpoint_id)
                )
                "#,
            )
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))
    }

    fn checkpoint_from_row(&self, row: &tokio_postgres::Row) -> Result<Checkpoint<S>, CheckpointError> {
        let blob: Vec<u8> = row.get(3);
        let next_nodes_json: String = row.get(4);
        Ok(Checkpoint {
            id: row.get(0),
            parent_id: row.get(1),
            step: row.get(2),
            state: self.serializer.deserialize(&blob)?,
            next_nodes: serde_json::from_str(&next_nodes_json)
                .map_err(|e| CheckpointError::Serialization(e.to_string()))?,
            created_at: row.get(5),
        })
    }
}

const SELECT_COLUMNS: &str =
    "checkpoint_id, parent_id, step, state_blob, next_nodes, created_at";

#[async_trait]
impl<S> Checkpointer<S> for PostgresSaver<S>
where
    S: Clone + Send + Sync + 'static,
{
    async fn put(&self, thread_id: &str, checkpoint: &Checkpoint<S>) -> Result<(), CheckpointError> {
        let blob = self.serializer.serialize(&checkpoint.state)?;
        let next_nodes = serde_json::to_string(&checkpoint.next_nodes)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let client = self.client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO checkpoints
                (thread_id, checkpoint_id, parent_id, step, state_blob, next_nodes, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (thread_id, checkpoint_id) DO UPDATE
                SET state_blob = EXCLUDED.state_blob, next_nodes = EXCLUDED.next_nodes
                "#,
                &[
                    &thread_id,
                    &checkpoint.id,
                    &checkpoint.parent_id,
                    &checkpoint.step,
                    &blob,
                    &next_nodes,
                    &checkpoint.created_at,
                ],
            )
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint<S>>, CheckpointError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM checkpoints
             WHERE thread_id = $1 ORDER BY checkpoint_id DESC LIMIT 1"
        );
        let client = self.client.lock().await;
        let rows = client
            .query(sql.as_str(), &[&thread_id])
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        rows.first().map(|r| self.checkpoint_from_row(r)).transpose()
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint<S>>, CheckpointError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM checkpoints
             WHERE thread_id = $1 ORDER BY checkpoint_id DESC"
        );
        let client = self.client.lock().await;
        let rows = client
            .query(sql.as_str(), &[&thread_id])
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        rows.iter().map(|r| self.checkpoint_from_row(r)).collect()
    }
}
