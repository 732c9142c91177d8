//! Failure sink: stamp the terminal failed state.
//!
//! Reached when a retry ceiling is hit, a router sees accumulated errors, or
//! a verdict is missing. Runs no agent.

use async_trait::async_trait;

use crate::graph::{GraphError, Node, RunContext};
use crate::routing::NODE_FAILED;
use crate::state::{PipelinePhase, PipelineState, PipelineStatus, StateUpdate};

use super::{elapsed_since, log_entry};

pub struct FailedNode;

#[async_trait]
impl Node<PipelineState, StateUpdate> for FailedNode {
    fn id(&self) -> &str {
        NODE_FAILED
    }

    async fn run(&self, state: PipelineState, _ctx: &RunContext) -> Result<StateUpdate, GraphError> {
        tracing::error!(
            connector = %state.connector_name,
            test_retries = state.test_retries,
            gen_fix_retries = state.gen_fix_retries,
            review_retries = state.review_retries,
            research_retries = state.research_retries,
            "pipeline failed"
        );

        let logs = vec![
            log_entry(format!(
                "Pipeline failed at phase: {}",
                state.current_phase
            )),
            format!("Coverage ratio: {:.1}%", state.coverage_ratio * 100.0),
        ];

        Ok(StateUpdate {
            current_phase: Some(PipelinePhase::Failed),
            status: Some(PipelineStatus::Failed),
            completed_at: Some(chrono::Utc::now().to_rfc3339()),
            total_duration: Some(elapsed_since(&state.created_at)),
            logs,
            ..StateUpdate::default()
        })
    }
}
