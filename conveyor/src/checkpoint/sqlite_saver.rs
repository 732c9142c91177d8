//! SQLite-backed checkpointer (SqliteSaver). Persistent across process restarts.
//!
//! One shared connection guarded by a mutex: concurrent pipelines on the same
//! file serialize their writes through it. All calls go through
//! `spawn_blocking` so the async executor never blocks on disk I/O.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::params;

use super::checkpointer::{CheckpointError, Checkpointer};
use super::serializer::Serializer;
use super::Checkpoint;

/// SQLite-backed checkpointer. Key: `(thread_id, checkpoint_id)`.
pub struct SqliteSaver<S> {
    conn: Arc<Mutex<rusqlite::Connection>>,
    serializer: Arc<dyn Serializer<S>>,
}

impl<S> SqliteSaver<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Opens (or creates) the database file and ensures the table exists.
    pub fn new(
        path: impl AsRef<Path>,
        serializer: Arc<dyn Serializer<S>>,
    ) -> Result<Self, CheckpointError> {
        let conn = rusqlite::Connection::open(path.as_ref())
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT NOT NULL,
                checkpoint_id TEXT NOT NULL,
                parent_id TEXT,
                step INTEGER NOT NULL,
                state_blob BLOB NOT NULL,
                next_nodes TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (thread_id, checkpoint_id)
            )
            "#,
            [],
        )
        .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            serializer,
        })
    }

    fn lock_err() -> CheckpointError {
        CheckpointError::Storage("sqlite connection mutex poisoned".into())
    }
}

fn decode_next_nodes(json: &str) -> Result<Vec<String>, CheckpointError> {
    serde_json::from_str(json).map_err(|e| CheckpointError::Serialization(e.to_string()))
}

type Row = (String, Option<String>, i64, Vec<u8>, String, String);

fn row_to_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

impl<S> SqliteSaver<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn checkpoint_from_row(&self, row: Row) -> Result<Checkpoint<S>, CheckpointError> {
        let (id, parent_id, step, blob, next_nodes_json, created_at) = row;
        Ok(Checkpoint {
            id,
            parent_id,
            step,
            state: self.serializer.deserialize(&blob)?,
            next_nodes: decode_next_nodes(&next_nodes_json)?,
            created_at,
        })
    }
}

#[async_trait]
impl<S> Checkpointer<S> for SqliteSaver<S>
where
    S: Clone + Send + Sync + 'static,
{
    async fn put(&self, thread_id: &str, checkpoint: &Checkpoint<S>) -> Result<(), CheckpointError> {
        let blob = self.serializer.serialize(&checkpoint.state)?;
        let next_nodes = serde_json::to_string(&checkpoint.next_nodes)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let thread_id = thread_id.to_string();
        let id = checkpoint.id.clone();
        let parent_id = checkpoint.parent_id.clone();
        let step = checkpoint.step;
        let created_at = checkpoint.created_at.clone();
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| Self::lock_err())?;
            conn.execute(
                r#"
                INSERT OR REPLACE INTO checkpoints
                (thread_id, checkpoint_id, parent_id, step, state_blob, next_nodes, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![thread_id, id, parent_id, step, blob, next_nodes, created_at],
            )
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
            Ok::<(), CheckpointError>(())
        })
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))?
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint<S>>, CheckpointError> {
        let thread_id = thread_id.to_string();
        let conn = self.conn.clone();
        let row = tokio::task::spawn_blocking(move || -> Result<Option<Row>, CheckpointError> {
            let conn = conn.lock().map_err(|_| Self::lock_err())?;
            let mut stmt = conn
                .prepare(
                    "SELECT checkpoint_id, parent_id, step, state_blob, next_nodes, created_at
                     FROM checkpoints WHERE thread_id = ?1
                     ORDER BY checkpoint_id DESC LIMIT 1",
                )
                .map_err(|e| CheckpointError::Storage(e.to_string()))?;
            let mut rows = stmt
                .query(params![thread_id])
                .map_err(|e| CheckpointError::Storage(e.to_string()))?;
            match rows
                .next()
                .map_err(|e| CheckpointError::Storage(e.to_string()))?
            {
                Some(row) => Ok(Some(
                    row_to_parts(row).map_err(|e| CheckpointError::Storage(e.to_string()))?,
                )),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))??;

        row.map(|r| self.checkpoint_from_row(r)).transpose()
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint<S>>, CheckpointError> {
        let thread_id = thread_id.to_string();
        let conn = self.conn.clone();
        let rows = tokio::task::spawn_blocking(move || -> Result<Vec<Row>, CheckpointError> {
            let conn = conn.lock().map_err(|_| Self::lock_err())?;
            let mut stmt = conn
                .prepare(
                    "SELECT checkpoint_id, parent_id, step, state_blob, next_nodes, created_at
                     FROM checkpoints WHERE thread_id = ?1
                     ORDER BY checkpoint_id DESC",
                )
                .map_err(|e| CheckpointError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params![thread_id], row_to_parts)
                .map_err(|e| CheckpointError::Storage(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| CheckpointError::Storage(e.to_string()))
        })
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))??;

        rows.into_iter()
            .map(|r| self.checkpoint_from_row(r))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::JsonSerializer;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct TestState {
        n: u32,
        label: Option<String>,
    }

    fn saver(path: &std::path::Path) -> SqliteSaver<TestState> {
        SqliteSaver::new(path, Arc::new(JsonSerializer)).unwrap()
    }

    /// **Scenario**: Checkpoints survive reopening the database file, with
    /// every field round-tripped.
    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("checkpoints.db");

        let first = Checkpoint::new(
            1,
            None,
            TestState {
                n: 1,
                label: None,
            },
            vec!["generator".into()],
        );
        let second = Checkpoint::new(
            2,
            Some(first.id.clone()),
            TestState {
                n: 2,
                label: Some("x".into()),
            },
            vec![],
        );
        {
            let s = saver(&db);
            s.put("t1", &first).await.unwrap();
            s.put("t1", &second).await.unwrap();
        }

        let s = saver(&db);
        let latest = s.get_latest("t1").await.unwrap().unwrap();
        assert_eq!(latest, second);

        let history = s.history("t1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.id);
        assert_eq!(history[1].id, first.id);
        assert_eq!(history[1].next_nodes, vec!["generator"]);
    }

    /// **Scenario**: get_latest on an unknown thread returns None.
    #[tokio::test]
    async fn unknown_thread_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let s = saver(&dir.path().join("checkpoints.db"));
        assert!(s.get_latest("ghost").await.unwrap().is_none());
        assert!(s.history("ghost").await.unwrap().is_empty());
    }
}
