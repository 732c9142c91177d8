//! Conveyor: durable, checkpointed orchestration of multi-agent connector pipelines.
//!
//! A pipeline takes a connector name and a natural-language request and drives
//! seven role-specialized agent phases (research, generator, mock generator,
//! tester, test reviewer, reviewer, publisher) through a cyclic state graph
//! with conditional routing, bounded retry loops, and a checkpoint written at
//! every node boundary so a killed process resumes where it left off.
//!
//! Crate layout:
//! - [`state`]: the pipeline state record, partial updates, and reducers.
//! - [`graph`]: the generic state-graph engine (build, compile, run, stream, resume).
//! - [`checkpoint`]: checkpoint record, store trait, and memory/sqlite/postgres stores.
//! - [`routing`]: the two pure routing functions over agent verdicts and counters.
//! - [`nodes`]: one node per phase, translating agent results into state updates.
//! - [`agents`]: the per-phase LLM session adapters and the scripted test double.
//! - [`pipeline`]: wires nodes and routers into the compiled graph.
//! - [`runner`]: background execution, registry, cancellation, timeout, cleanup.
//! - [`settings`]: typed configuration from `ORCH_`-prefixed environment variables.

pub mod agents;
pub mod checkpoint;
pub mod graph;
pub mod nodes;
pub mod pipeline;
pub mod routing;
pub mod runner;
pub mod settings;
pub mod state;

pub use checkpoint::{build_checkpointer, Checkpoint, CheckpointError, Checkpointer};
pub use graph::{CompiledGraph, Node, StateGraph, END, START};
pub use pipeline::{build_pipeline, pipeline_diagram, PipelineApp};
pub use runner::{Runner, RunnerError};
pub use settings::Settings;
pub use state::{PipelinePhase, PipelineState, PipelineStatus, StateUpdate};
