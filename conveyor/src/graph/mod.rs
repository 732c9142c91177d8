//! Generic state-graph engine: nodes plus explicit and conditional edges,
//! compiled into an executable graph that checkpoints at every node boundary.
//!
//! Nodes return partial updates of type `U`; a [`StateReducer`] merges each
//! update into the state `S`. Conditional edges route on the merged state.
//! With a checkpointer attached, every node completion persists a checkpoint
//! and `stream(None, ..)` resumes from the latest one.

mod compile_error;
mod compiled;
mod conditional;
mod error;
mod node;
mod state_graph;
mod updater;
mod visualization;

pub use compile_error::CompilationError;
pub use compiled::{CompiledGraph, StateSnapshot};
pub use conditional::{ConditionalRouter, ConditionalRouterFn, NextEntry};
pub use error::GraphError;
pub use node::{Node, RunContext};
pub use state_graph::{StateGraph, END, START};
pub use updater::{reducer_fn, BoxedReducer, StateReducer};
pub use visualization::mermaid_diagram;
