//! Compiled graph: immutable, executes nodes with per-node checkpointing.
//!
//! Built by [`StateGraph::compile`](super::StateGraph::compile) or
//! `compile_with_checkpointer`. The run loop:
//!
//! 1. run the current node (raced against the cancellation token);
//! 2. merge its partial update through the graph's reducer;
//! 3. resolve the next node (unconditional edge or router over merged state);
//! 4. write one checkpoint `{state, next_nodes}` for the thread;
//! 5. emit the merged state to the stream; stop on END.
//!
//! Resume (`stream(None, ..)` / `invoke(None, ..)`) loads the latest
//! checkpoint and continues from its saved `next_nodes`; the node that
//! produced the checkpoint is not re-executed. A cancelled node writes no
//! checkpoint, so resume re-enters it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

use crate::checkpoint::{Checkpoint, Checkpointer};

use super::conditional::NextEntry;
use super::node::{Node, RunContext};
use super::state_graph::END;
use super::updater::BoxedReducer;
use super::GraphError;

/// State plus outgoing-edge candidates for one thread, as read back from the
/// checkpoint store.
#[derive(Debug, Clone)]
pub struct StateSnapshot<S> {
    pub values: S,
    pub next_nodes: Vec<String>,
    pub checkpoint_id: String,
}

/// Compiled graph: immutable structure, shared behind cheap clones.
pub struct CompiledGraph<S, U> {
    pub(super) nodes: HashMap<String, Arc<dyn Node<S, U>>>,
    pub(super) entry: String,
    pub(super) next_map: HashMap<String, NextEntry<S>>,
    reducer: BoxedReducer<S, U>,
    checkpointer: Option<Arc<dyn Checkpointer<S>>>,
}

impl<S, U> Clone for CompiledGraph<S, U> {
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            entry: self.entry.clone(),
            next_map: self.next_map.clone(),
            reducer: self.reducer.clone(),
            checkpointer: self.checkpointer.clone(),
        }
    }
}

impl<S, U> CompiledGraph<S, U>
where
    S: Clone + Send + Sync + 'static,
    U: Send + 'static,
{
    pub(super) fn new(
        nodes: HashMap<String, Arc<dyn Node<S, U>>>,
        entry: String,
        next_map: HashMap<String, NextEntry<S>>,
        reducer: BoxedReducer<S, U>,
        checkpointer: Option<Arc<dyn Checkpointer<S>>>,
    ) -> Self {
        Self {
            nodes,
            entry,
            next_map,
            reducer,
            checkpointer,
        }
    }

    /// Latest persisted state and outgoing nodes for a thread, or `None` when
    /// the thread has never checkpointed (or the graph has no checkpointer).
    pub async fn get_state(&self, thread_id: &str) -> Result<Option<StateSnapshot<S>>, GraphError> {
        let Some(cp) = &self.checkpointer else {
            return Ok(None);
        };
        let latest = cp.get_latest(thread_id).await?;
        Ok(latest.map(|c| StateSnapshot {
            values: c.state,
            next_nodes: c.next_nodes,
            checkpoint_id: c.id,
        }))
    }

    /// Full checkpoint history for a thread, newest first.
    pub async fn state_history(&self, thread_id: &str) -> Result<Vec<StateSnapshot<S>>, GraphError> {
        let Some(cp) = &self.checkpointer else {
            return Ok(Vec::new());
        };
        let history = cp.history(thread_id).await?;
        Ok(history
            .into_iter()
            .map(|c| StateSnapshot {
                values: c.state,
                next_nodes: c.next_nodes,
                checkpoint_id: c.id,
            })
            .collect())
    }

    /// Runs the graph to completion and returns the final state.
    ///
    /// `initial = None` resumes from the latest checkpoint for
    /// `ctx.thread_id`; fails with [`GraphError::NoSavedState`] when none
    /// exists.
    pub async fn invoke(&self, initial: Option<S>, ctx: RunContext) -> Result<S, GraphError> {
        let (mut state, start, mut step, mut parent) = self.prepare(initial, &ctx.thread_id).await?;
        let Some(mut current) = start else {
            return Ok(state); // thread already ran to a terminal checkpoint
        };
        self.run_loop(&mut state, &mut current, &mut step, &mut parent, &ctx, None)
            .await?;
        Ok(state)
    }

    /// Runs the graph, yielding the merged state after every node.
    ///
    /// The last item is `Err(..)` when the run fails or is cancelled; the
    /// channel closes when the run reaches END.
    pub fn stream(&self, initial: Option<S>, ctx: RunContext) -> ReceiverStream<Result<S, GraphError>> {
        let (tx, rx) = mpsc::channel(64);
        let graph = self.clone();
        tokio::spawn(async move {
            let (mut state, start, mut step, mut parent) =
                match graph.prepare(initial, &ctx.thread_id).await {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
            let Some(mut current) = start else {
                let _ = tx.send(Ok(state)).await;
                return;
            };
            if let Err(e) = graph
                .run_loop(&mut state, &mut current, &mut step, &mut parent, &ctx, Some(&tx))
                .await
            {
                let _ = tx.send(Err(e)).await;
            }
        });
        ReceiverStream::new(rx)
    }

    /// Resolves the starting point: fresh state at the entry node, or the
    /// latest checkpoint's `next_nodes`. Returns `(state, Some(node), step,
    /// parent_checkpoint)`; `None` for the node means the thread is already
    /// terminal.
    async fn prepare(
        &self,
        initial: Option<S>,
        thread_id: &str,
    ) -> Result<(S, Option<String>, i64, Option<String>), GraphError> {
        match initial {
            Some(state) => Ok((state, Some(self.entry.clone()), 0, None)),
            None => {
                let Some(cp) = &self.checkpointer else {
                    return Err(GraphError::NoSavedState(thread_id.to_string()));
                };
                let Some(saved) = cp.get_latest(thread_id).await? else {
                    return Err(GraphError::NoSavedState(thread_id.to_string()));
                };
                info!(thread_id, checkpoint_id = %saved.id, next = ?saved.next_nodes, "resuming from checkpoint");
                let next = saved.next_nodes.first().cloned();
                Ok((saved.state, next, saved.step, Some(saved.id)))
            }
        }
    }

    async fn run_loop(
        &self,
        state: &mut S,
        current: &mut String,
        step: &mut i64,
        parent: &mut Option<String>,
        ctx: &RunContext,
        emit: Option<&mpsc::Sender<Result<S, GraphError>>>,
    ) -> Result<(), GraphError> {
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(GraphError::Cancelled);
            }
            let node = self
                .nodes
                .get(current.as_str())
                .cloned()
                .ok_or_else(|| GraphError::ExecutionFailed(format!("unknown node '{current}'")))?;

            debug!(thread_id = %ctx.thread_id, node = %current, "node start");
            // Biased so a node that finished in the same poll as a cancel
            // still gets its checkpoint; the cancel lands at the loop top.
            let update = tokio::select! {
                biased;
                result = node.run(state.clone(), ctx) => result?,
                _ = ctx.cancel.cancelled() => return Err(GraphError::Cancelled),
            };
            self.reducer.apply(state, update);
            debug!(thread_id = %ctx.thread_id, node = %current, "node complete");

            let target = match self.next_map.get(current.as_str()) {
                Some(NextEntry::Unconditional(to)) => to.clone(),
                Some(NextEntry::Conditional(router)) => {
                    let target = router.resolve_next(state);
                    debug!(thread_id = %ctx.thread_id, from = %current, to = %target, "conditional routing");
                    target
                }
                None => END.to_string(),
            };
            if target != END && !self.nodes.contains_key(target.as_str()) {
                error!(thread_id = %ctx.thread_id, from = %current, target = %target, "router escaped declared targets");
                return Err(GraphError::UnknownRouteTarget {
                    from: current.clone(),
                    target,
                });
            }

            let next_nodes = if target == END {
                Vec::new()
            } else {
                vec![target.clone()]
            };

            if let Some(saver) = &self.checkpointer {
                *step += 1;
                let checkpoint =
                    Checkpoint::new(*step, parent.clone(), state.clone(), next_nodes.clone());
                let id = checkpoint.id.clone();
                saver.put(&ctx.thread_id, &checkpoint).await?;
                *parent = Some(id);
            }

            if let Some(tx) = emit {
                // A slow or dropped consumer must not stall the pipeline.
                let _ = tx.try_send(Ok(state.clone()));
            }

            if target == END {
                info!(thread_id = %ctx.thread_id, "graph run complete");
                return Ok(());
            }
            *current = target;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio_stream::StreamExt;

    use crate::checkpoint::MemorySaver;
    use crate::graph::{reducer_fn, StateGraph, START};

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Counter {
        hits: Vec<String>,
    }

    struct Hit(&'static str);

    #[async_trait]
    impl Node<Counter, String> for Hit {
        fn id(&self) -> &str {
            self.0
        }
        async fn run(&self, _state: Counter, _ctx: &RunContext) -> Result<String, GraphError> {
            Ok(self.0.to_string())
        }
    }

    fn reducer() -> BoxedReducer<Counter, String> {
        reducer_fn(|s: &mut Counter, u: String| s.hits.push(u))
    }

    fn linear_graph() -> StateGraph<Counter, String> {
        let mut graph = StateGraph::new();
        graph.add_node("a", Arc::new(Hit("a")));
        graph.add_node("b", Arc::new(Hit("b")));
        graph.add_edge(START, "a");
        graph.add_edge("a", "b");
        graph.add_edge("b", END);
        graph
    }

    /// **Scenario**: invoke runs nodes in edge order and returns the merged state.
    #[tokio::test]
    async fn invoke_runs_linear_chain() {
        let app = linear_graph().compile(reducer()).unwrap();
        let final_state = app
            .invoke(Some(Counter::default()), RunContext::new("t1"))
            .await
            .unwrap();
        assert_eq!(final_state.hits, vec!["a", "b"]);
    }

    /// **Scenario**: stream yields the state once per node.
    #[tokio::test]
    async fn stream_emits_state_per_node() {
        let app = linear_graph().compile(reducer()).unwrap();
        let states: Vec<_> = app
            .stream(Some(Counter::default()), RunContext::new("t1"))
            .collect::<Vec<_>>()
            .await;
        assert_eq!(states.len(), 2);
        assert_eq!(states[1].as_ref().unwrap().hits, vec!["a", "b"]);
    }

    /// **Scenario**: With a checkpointer, each node writes one checkpoint and
    /// the checkpoint ids are strictly increasing.
    #[tokio::test]
    async fn checkpoints_one_per_node_monotonic() {
        let saver = Arc::new(MemorySaver::new());
        let app = linear_graph()
            .compile_with_checkpointer(reducer(), saver)
            .unwrap();
        app.invoke(Some(Counter::default()), RunContext::new("t1"))
            .await
            .unwrap();

        let history = app.state_history("t1").await.unwrap();
        assert_eq!(history.len(), 2);
        // Newest first; ids compare lexicographically by step prefix.
        assert!(history[0].checkpoint_id > history[1].checkpoint_id);
        assert!(history[0].next_nodes.is_empty());
        assert_eq!(history[1].next_nodes, vec!["b"]);
    }

    /// **Scenario**: Resume from the checkpoint written after node "a"
    /// continues at "b" without re-running "a"; checkpoint count stays one
    /// per node boundary.
    #[tokio::test]
    async fn resume_skips_completed_nodes() {
        let saver = Arc::new(MemorySaver::new());

        // First process: stop after node "a" by cancelling before "b".
        struct CancelAfter(&'static str, tokio_util::sync::CancellationToken);
        #[async_trait]
        impl Node<Counter, String> for CancelAfter {
            fn id(&self) -> &str {
                self.0
            }
            async fn run(&self, _state: Counter, _ctx: &RunContext) -> Result<String, GraphError> {
                self.1.cancel();
                Ok(self.0.to_string())
            }
        }

        let token = tokio_util::sync::CancellationToken::new();
        let mut graph = StateGraph::new();
        graph.add_node("a", Arc::new(CancelAfter("a", token.clone())));
        graph.add_node("b", Arc::new(Hit("b")));
        graph.add_edge(START, "a");
        graph.add_edge("a", "b");
        graph.add_edge("b", END);
        let app = graph
            .compile_with_checkpointer(reducer(), saver.clone())
            .unwrap();

        let ctx = RunContext::with_cancel("t1", token);
        let err = app.invoke(Some(Counter::default()), ctx).await.unwrap_err();
        assert!(matches!(err, GraphError::Cancelled));

        // The checkpoint for "a" exists and points at "b".
        let snapshot = app.get_state("t1").await.unwrap().unwrap();
        assert_eq!(snapshot.next_nodes, vec!["b"]);
        assert_eq!(snapshot.values.hits, vec!["a"]);

        // Second process: resume; only "b" runs.
        let app2 = linear_graph()
            .compile_with_checkpointer(reducer(), saver)
            .unwrap();
        let final_state = app2.invoke(None, RunContext::new("t1")).await.unwrap();
        assert_eq!(final_state.hits, vec!["a", "b"]);
        assert_eq!(app2.state_history("t1").await.unwrap().len(), 2);
    }

    /// **Scenario**: Resuming a thread with no saved state fails.
    #[tokio::test]
    async fn resume_unknown_thread_fails() {
        let saver = Arc::new(MemorySaver::new());
        let app = linear_graph()
            .compile_with_checkpointer(reducer(), saver)
            .unwrap();
        let err = app.invoke(None, RunContext::new("ghost")).await.unwrap_err();
        assert!(matches!(err, GraphError::NoSavedState(t) if t == "ghost"));
    }

    /// **Scenario**: Resuming a terminal thread returns its final state
    /// without running any node.
    #[tokio::test]
    async fn resume_terminal_thread_is_noop() {
        let saver = Arc::new(MemorySaver::new());
        let app = linear_graph()
            .compile_with_checkpointer(reducer(), saver)
            .unwrap();
        app.invoke(Some(Counter::default()), RunContext::new("t1"))
            .await
            .unwrap();

        let resumed = app.invoke(None, RunContext::new("t1")).await.unwrap();
        assert_eq!(resumed.hits, vec!["a", "b"]);
        assert_eq!(app.state_history("t1").await.unwrap().len(), 2);
    }

    /// **Scenario**: A router escaping its declared target set is fatal.
    #[tokio::test]
    async fn router_escape_is_fatal() {
        let mut graph = StateGraph::new();
        graph.add_node("a", Arc::new(Hit("a")));
        graph.add_edge(START, "a");
        // Path map declares END only, but the router returns a raw unknown key.
        graph.add_conditional_edges(
            "a",
            Arc::new(|_: &Counter| "ghost".to_string()),
            Some([(END.to_string(), END.to_string())].into_iter().collect()),
        );
        let app = graph.compile(reducer()).unwrap();
        let err = app
            .invoke(Some(Counter::default()), RunContext::new("t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownRouteTarget { .. }));
    }
}
