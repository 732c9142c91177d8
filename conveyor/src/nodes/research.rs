//! Research node: produce the structured research document for the target API.
//!
//! First entry runs unconditional research. Re-entry (after REJECT:CONTEXT)
//! folds the accumulated context gaps into the request so the investigation
//! is targeted, and clears the `review_decision` the reviewer left behind for
//! the router.

use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::{AgentService, ResearchRequest};
use crate::graph::{GraphError, Node, RunContext};
use crate::routing::NODE_RESEARCH;
use crate::state::{Field, PipelinePhase, PipelineState, ResearchOutput, StateUpdate};

use super::log_entry;

pub struct ResearchNode {
    agent: Arc<dyn AgentService>,
}

impl ResearchNode {
    pub fn new(agent: Arc<dyn AgentService>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Node<PipelineState, StateUpdate> for ResearchNode {
    fn id(&self) -> &str {
        NODE_RESEARCH
    }

    async fn run(&self, state: PipelineState, _ctx: &RunContext) -> Result<StateUpdate, GraphError> {
        let is_re_research = state.research_retries > 0 || !state.context_gaps.is_empty();
        let mut logs = Vec::new();

        if is_re_research {
            logs.push(log_entry(format!(
                "[RESEARCH] Re-researching {} (retry {})...",
                state.connector_name, state.research_retries
            )));
            logs.push(format!(
                "[RESEARCH] Context gaps to address: {:?}",
                state.context_gaps
            ));
        } else {
            logs.push(log_entry(format!(
                "[RESEARCH] Starting research for {}...",
                state.connector_name
            )));
        }

        let additional_context = if state.context_gaps.is_empty() {
            None
        } else {
            let gap_list = state
                .context_gaps
                .iter()
                .map(|g| format!("- {g}"))
                .collect::<Vec<_>>()
                .join("\n");
            Some(format!(
                "## Previous Research Gaps\n\n\
                 The previous research was insufficient. Specifically address these gaps:\n\n\
                 {gap_list}\n\n\
                 Focus the investigation on filling these knowledge gaps."
            ))
        };

        let result = self
            .agent
            .research(ResearchRequest {
                connector_name: state.connector_name.clone(),
                api_doc_url: state.api_doc_url.clone(),
                additional_context,
            })
            .await;

        match result {
            Ok(result) if result.success => {
                logs.push(log_entry(format!(
                    "[RESEARCH] Completed, {} chars of research",
                    result.output.len()
                )));
                Ok(StateUpdate {
                    research_output: Field::Set(ResearchOutput {
                        full_document: result.output,
                        connector_name: state.connector_name.clone(),
                        context_gaps_addressed: state.context_gaps.clone(),
                        researched_at: chrono::Utc::now().to_rfc3339(),
                        duration_seconds: result.duration_seconds,
                        tokens_used: result.tokens_used,
                    }),
                    // The reviewer preserved its decision solely for routing.
                    review_decision: if is_re_research {
                        Field::Clear
                    } else {
                        Field::Keep
                    },
                    current_phase: Some(PipelinePhase::Researching),
                    logs,
                    ..StateUpdate::default()
                })
            }
            Ok(result) => {
                let error = result.error.unwrap_or_else(|| "unknown failure".into());
                logs.push(log_entry(format!("[RESEARCH] FAILED: {error}")));
                Ok(StateUpdate {
                    current_phase: Some(PipelinePhase::Researching),
                    errors: vec![format!("Research failed: {error}")],
                    logs,
                    ..StateUpdate::default()
                })
            }
            Err(e) => {
                logs.push(log_entry(format!("[RESEARCH] EXCEPTION: {e}")));
                Ok(StateUpdate {
                    current_phase: Some(PipelinePhase::Researching),
                    errors: vec![format!("Research exception: {e}")],
                    logs,
                    ..StateUpdate::default()
                })
            }
        }
    }
}
