//! State graph builder: nodes plus explicit edges (from → to) and conditional edges.
//!
//! Add nodes with `add_node`, define edges with `add_edge(from, to)` using
//! `START` and `END` for graph entry/exit, and `add_conditional_edges` to
//! route on state. Then `compile` (optionally with a checkpointer) to get a
//! [`CompiledGraph`].
//!
//! A node has either one unconditional outgoing edge or conditional edges,
//! never both. Back-edges are allowed (the pipeline graph is cyclic by
//! design) and every cycle must be bounded by the routing policy's counters,
//! not by the engine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::checkpoint::Checkpointer;

use super::compile_error::CompilationError;
use super::compiled::CompiledGraph;
use super::conditional::{ConditionalRouter, ConditionalRouterFn, NextEntry};
use super::node::Node;
use super::updater::BoxedReducer;

/// Sentinel for graph entry: use as `from` in `add_edge(START, first_node)`.
pub const START: &str = "__start__";

/// Sentinel for graph exit: use as `to` in `add_edge(last_node, END)` or as a
/// conditional target.
pub const END: &str = "__end__";

/// State graph under construction. Generic over state `S` and update `U`.
pub struct StateGraph<S, U> {
    nodes: HashMap<String, Arc<dyn Node<S, U>>>,
    /// Edges (from, to). A node may have one outgoing edge or conditional edges, not both.
    edges: Vec<(String, String)>,
    /// Conditional edges: source node id -> router. Resolved from state at runtime.
    conditional_edges: HashMap<String, ConditionalRouter<S>>,
}

impl<S, U> Default for StateGraph<S, U>
where
    S: Clone + Send + Sync + 'static,
    U: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, U> StateGraph<S, U>
where
    S: Clone + Send + Sync + 'static,
    U: Send + 'static,
{
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: Vec::new(),
            conditional_edges: HashMap::new(),
        }
    }

    /// Adds a node; id must be unique. Replaces if same id.
    pub fn add_node(&mut self, id: impl Into<String>, node: Arc<dyn Node<S, U>>) -> &mut Self {
        self.nodes.insert(id.into(), node);
        self
    }

    /// Adds an edge from `from` to `to`. Use `START` and `END` for entry/exit.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Adds conditional edges from `source`: after the source node's update is
    /// applied, `path(state)` returns a key looked up in `path_map` (or used
    /// directly). All declared targets must be registered nodes or `END`.
    pub fn add_conditional_edges(
        &mut self,
        source: impl Into<String>,
        path: ConditionalRouterFn<S>,
        path_map: Option<HashMap<String, String>>,
    ) -> &mut Self {
        self.conditional_edges
            .insert(source.into(), ConditionalRouter::new(path, path_map));
        self
    }

    /// Builds the executable graph without persistence (tests, diagrams).
    pub fn compile(self, reducer: BoxedReducer<S, U>) -> Result<CompiledGraph<S, U>, CompilationError> {
        self.compile_internal(reducer, None)
    }

    /// Builds the executable graph with a checkpointer: every node completion
    /// writes a checkpoint for the run's thread id, and `stream(None, ..)`
    /// resumes from the latest one.
    pub fn compile_with_checkpointer(
        self,
        reducer: BoxedReducer<S, U>,
        checkpointer: Arc<dyn Checkpointer<S>>,
    ) -> Result<CompiledGraph<S, U>, CompilationError> {
        self.compile_internal(reducer, Some(checkpointer))
    }

    fn compile_internal(
        self,
        reducer: BoxedReducer<S, U>,
        checkpointer: Option<Arc<dyn Checkpointer<S>>>,
    ) -> Result<CompiledGraph<S, U>, CompilationError> {
        for (from, to) in &self.edges {
            if from != START && !self.nodes.contains_key(from) {
                return Err(CompilationError::NodeNotFound(from.clone()));
            }
            if to != END && !self.nodes.contains_key(to) {
                return Err(CompilationError::NodeNotFound(to.clone()));
            }
        }
        for (source, router) in &self.conditional_edges {
            if !self.nodes.contains_key(source) {
                return Err(CompilationError::NodeNotFound(source.clone()));
            }
            if let Some(targets) = router.declared_targets() {
                for target in targets {
                    if target != END && !self.nodes.contains_key(target) {
                        return Err(CompilationError::InvalidConditionalPathMap(target.clone()));
                    }
                }
            }
        }

        let start_edges: Vec<_> = self
            .edges
            .iter()
            .filter(|(f, _)| f == START)
            .map(|(_, t)| t.clone())
            .collect();
        let entry = match start_edges.len() {
            0 => return Err(CompilationError::MissingStart),
            1 => start_edges.into_iter().next().unwrap(),
            _ => {
                return Err(CompilationError::InvalidGraph(
                    "multiple edges from START".into(),
                ))
            }
        };

        let has_end = self.edges.iter().any(|(_, t)| t == END)
            || self.conditional_edges.values().any(|r| {
                r.declared_targets()
                    .map_or(true, |mut targets| targets.any(|t| t == END))
            });
        if !has_end {
            return Err(CompilationError::MissingEnd);
        }

        // One outgoing edge per node, and never both kinds.
        let mut seen_from: HashSet<&str> = HashSet::new();
        for (from, _) in self.edges.iter().filter(|(f, _)| f != START) {
            if !seen_from.insert(from.as_str()) {
                return Err(CompilationError::InvalidGraph(format!(
                    "duplicate outgoing edge from '{from}'"
                )));
            }
        }
        for source in self.conditional_edges.keys() {
            if seen_from.contains(source.as_str()) {
                return Err(CompilationError::NodeHasBothEdgeAndConditional(
                    source.clone(),
                ));
            }
        }

        let mut next_map: HashMap<String, NextEntry<S>> = self
            .edges
            .iter()
            .filter(|(f, _)| f != START)
            .map(|(f, t)| (f.clone(), NextEntry::Unconditional(t.clone())))
            .collect();
        for (source, router) in &self.conditional_edges {
            next_map.insert(source.clone(), NextEntry::Conditional(router.clone()));
        }

        // Every node must be reachable from the entry through the next map.
        let mut reachable: HashSet<String> = HashSet::new();
        let mut stack = vec![entry.clone()];
        while let Some(id) = stack.pop() {
            if id == END || !reachable.insert(id.clone()) {
                continue;
            }
            match next_map.get(&id) {
                Some(NextEntry::Unconditional(to)) => stack.push(to.clone()),
                Some(NextEntry::Conditional(router)) => {
                    if let Some(targets) = router.declared_targets() {
                        stack.extend(targets.cloned());
                    }
                }
                None => {}
            }
        }
        for id in self.nodes.keys() {
            if !reachable.contains(id) {
                return Err(CompilationError::InvalidGraph(format!(
                    "node '{id}' is unreachable from START"
                )));
            }
        }

        Ok(CompiledGraph::new(
            self.nodes,
            entry,
            next_map,
            reducer,
            checkpointer,
        ))
    }
}
