//! Conditional edges: route to the next node based on state.
//!
//! A source node has a routing function that takes the current (merged) state
//! and returns a key; the key is looked up in a path map of declared targets.
//! The declared target set is validated at compile time, and a router that
//! escapes it at runtime is a fatal [`GraphError::UnknownRouteTarget`].
//!
//! **Interaction**: stored by `StateGraph::add_conditional_edges`; resolved by
//! the `CompiledGraph` run loop after the source node's update is applied.

use std::collections::HashMap;
use std::sync::Arc;

/// Router function: takes a reference to state and returns a routing key.
pub type ConditionalRouterFn<S> = Arc<dyn Fn(&S) -> String + Send + Sync>;

/// Conditional edge definition: routing function plus optional path map.
///
/// - When `path_map` is `None`, the router's return value is the next node id.
/// - When `path_map` is `Some(map)`, the return value is the key; the next
///   node id is `map[key]` if present, otherwise the key itself.
pub struct ConditionalRouter<S> {
    pub(super) path: ConditionalRouterFn<S>,
    pub(super) path_map: Option<HashMap<String, String>>,
}

impl<S> Clone for ConditionalRouter<S> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            path_map: self.path_map.clone(),
        }
    }
}

impl<S> ConditionalRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(path: ConditionalRouterFn<S>, path_map: Option<HashMap<String, String>>) -> Self {
        Self { path, path_map }
    }

    /// Resolves the next node id (or END) from the current state.
    pub fn resolve_next(&self, state: &S) -> String {
        let key = (self.path)(state);
        self.path_map
            .as_ref()
            .and_then(|m| m.get(&key))
            .cloned()
            .unwrap_or(key)
    }

    /// All node ids this router may target (for compile-time validation).
    pub(super) fn declared_targets(&self) -> Option<impl Iterator<Item = &String>> {
        self.path_map.as_ref().map(|m| m.values())
    }
}

/// How to determine the next node after a given node runs.
pub enum NextEntry<S> {
    /// Single fixed next node (or END).
    Unconditional(String),
    /// Next node decided by the router from the merged state.
    Conditional(ConditionalRouter<S>),
}

impl<S> Clone for NextEntry<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Unconditional(s) => Self::Unconditional(s.clone()),
            Self::Conditional(r) => Self::Conditional(r.clone()),
        }
    }
}
