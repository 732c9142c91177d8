//! Reviewer node: decide whether to ship, driven by the coverage ratio.
//!
//! Thresholds: 100% approve clean; >=80% approve in degraded mode with the
//! failing streams named; 50–79% reject the code back to the generator;
//! below 50% the API contract was misunderstood: reject the context, scrub
//! the artifacts, and send the pipeline back to research. The re-research
//! reset increments `research_retries` here, which is why the router's check
//! for that counter is strict-greater.

use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::{AgentService, ReviewRequest};
use crate::graph::{GraphError, Node, RunContext};
use crate::routing::NODE_REVIEWER;
use crate::settings::Settings;
use crate::state::{
    reset_for_re_research, Field, PipelinePhase, PipelineState, ReviewDecision, StateUpdate,
    COVERAGE_FULL_PASS, COVERAGE_PARTIAL_MIN, COVERAGE_REJECT_CODE_MIN,
};

use super::{connector_dir, log_entry};

pub struct ReviewerNode {
    agent: Arc<dyn AgentService>,
    settings: Arc<Settings>,
}

impl ReviewerNode {
    pub fn new(agent: Arc<dyn AgentService>, settings: Arc<Settings>) -> Self {
        Self { agent, settings }
    }
}

fn strings(json: &serde_json::Value, key: &str) -> Vec<String> {
    json.get(key)
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// The coverage-threshold triage: full or partial coverage ships, a mid-range
/// shortfall is a code problem, and anything below half means the API
/// contract itself was misunderstood.
fn decision_for_coverage(coverage: f64) -> ReviewDecision {
    if coverage >= COVERAGE_PARTIAL_MIN {
        ReviewDecision::Approve
    } else if coverage >= COVERAGE_REJECT_CODE_MIN {
        ReviewDecision::RejectCode
    } else {
        ReviewDecision::RejectContext
    }
}

#[async_trait]
impl Node<PipelineState, StateUpdate> for ReviewerNode {
    fn id(&self) -> &str {
        NODE_REVIEWER
    }

    async fn run(&self, state: PipelineState, _ctx: &RunContext) -> Result<StateUpdate, GraphError> {
        let mut logs = Vec::new();
        let coverage = state.coverage_ratio;
        logs.push(log_entry(format!(
            "[REVIEWER] Reviewing {} (coverage {:.0}%, review_retries={}, research_retries={})",
            state.connector_name,
            coverage * 100.0,
            state.review_retries,
            state.research_retries
        )));

        let outcome = self
            .agent
            .review(ReviewRequest {
                connector_name: state.connector_name.clone(),
                connector_dir: connector_dir(&self.settings, &state),
                coverage_ratio: coverage,
                test_results: state.test_results.clone(),
            })
            .await;

        let result = match outcome {
            Ok(result) if result.success => result,
            Ok(result) => {
                let error = result.error.unwrap_or_else(|| "unknown failure".into());
                logs.push(log_entry(format!("[REVIEWER] FAILED: {error}")));
                return Ok(StateUpdate {
                    current_phase: Some(PipelinePhase::Reviewing),
                    errors: vec![format!("Reviewer failed: {error}")],
                    logs,
                    ..StateUpdate::default()
                });
            }
            Err(e) => {
                logs.push(log_entry(format!("[REVIEWER] EXCEPTION: {e}")));
                return Ok(StateUpdate {
                    current_phase: Some(PipelinePhase::Reviewing),
                    errors: vec![format!("Reviewer exception: {e}")],
                    logs,
                    ..StateUpdate::default()
                });
            }
        };

        let json = result.output_json().unwrap_or_default();
        let agent_feedback = strings(&json, "feedback");
        let agent_streams = strings(&json, "degraded_streams");

        // Coverage drives the decision; the agent may override it on semantic
        // grounds (e.g. passing tests against a misunderstood API contract).
        let decision = match json.get("decision").and_then(|v| v.as_str()) {
            Some("approve") => ReviewDecision::Approve,
            Some("reject_code") => ReviewDecision::RejectCode,
            Some("reject_context") => ReviewDecision::RejectContext,
            _ => decision_for_coverage(coverage),
        };

        if decision == ReviewDecision::Approve && coverage >= COVERAGE_FULL_PASS {
            logs.push(log_entry("[REVIEWER] APPROVE (full coverage) -> publisher"));
            Ok(StateUpdate {
                current_phase: Some(PipelinePhase::Reviewing),
                review_decision: Field::Set(ReviewDecision::Approve),
                review_feedback: Some(Vec::new()),
                degraded_mode: Some(false),
                degraded_streams: Some(Vec::new()),
                logs,
                ..StateUpdate::default()
            })
        } else if decision == ReviewDecision::Approve {
            // Name the failing streams: the agent's list when it gave one,
            // otherwise a count proportional to the coverage shortfall.
            let streams = if agent_streams.is_empty() {
                let missing = ((1.0 - coverage) * 10.0) as usize;
                (0..missing).map(|i| format!("stream_{i}")).collect()
            } else {
                agent_streams
            };
            logs.push(log_entry(format!(
                "[REVIEWER] APPROVE (degraded mode, {:.0}% coverage) -> publisher",
                coverage * 100.0
            )));
            logs.push(format!("[REVIEWER] Disabled streams: {streams:?}"));
            Ok(StateUpdate {
                current_phase: Some(PipelinePhase::Reviewing),
                review_decision: Field::Set(ReviewDecision::Approve),
                review_feedback: Some(Vec::new()),
                degraded_mode: Some(true),
                degraded_streams: Some(streams),
                logs,
                ..StateUpdate::default()
            })
        } else if decision == ReviewDecision::RejectCode {
            let feedback = if agent_feedback.is_empty() {
                vec![
                    "Improve test coverage".to_string(),
                    "Fix failing streams".to_string(),
                ]
            } else {
                agent_feedback
            };
            logs.push(log_entry(format!(
                "[REVIEWER] REJECT:CODE -> generator (review_retries now {})",
                state.review_retries + 1
            )));
            Ok(StateUpdate {
                current_phase: Some(PipelinePhase::Reviewing),
                review_decision: Field::Set(ReviewDecision::RejectCode),
                review_feedback: Some(feedback),
                review_retries: Some(state.review_retries + 1),
                degraded_mode: Some(false),
                logs,
                ..StateUpdate::default()
            })
        } else {
            let gap = agent_feedback
                .first()
                .cloned()
                .unwrap_or_else(|| "Need more API context based on test failures".to_string());
            logs.push(log_entry(format!(
                "[REVIEWER] REJECT:CONTEXT -> research (research_retries now {})",
                state.research_retries + 1
            )));
            let mut update = reset_for_re_research(&state, gap);
            // The decision is preserved for the router and cleared by the
            // research node once routing has consumed it.
            update.review_decision = Field::Set(ReviewDecision::RejectContext);
            update.degraded_mode = Some(false);
            update.current_phase = Some(PipelinePhase::Reviewing);
            update.logs = logs;
            Ok(update)
        }
    }
}
