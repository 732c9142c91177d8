//! TestReviewer node: classify why tests failed, or confirm they passed.
//!
//! Fast path: a passing run is VALID_PASS with no session and no counter
//! increment. On failure the adapter analyzes tests against source and
//! returns INVALID (tests buggy, increments `test_retries`) or VALID_FAIL
//! (code buggy, increments `gen_fix_retries`). When the adapter itself
//! fails, the verdict defaults to VALID_FAIL (fixing code is the safer bet
//! when the signal is unclear) and the retry is still counted.

use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::{AgentResult, AgentService, TestReviewRequest};
use crate::graph::{GraphError, Node, RunContext};
use crate::routing::NODE_TEST_REVIEWER;
use crate::settings::Settings;
use crate::state::{
    Field, PipelinePhase, PipelineState, StateUpdate, TestResults, TestReviewDecision, TestStatus,
};

use super::{connector_dir, log_entry};

pub struct TestReviewerNode {
    agent: Arc<dyn AgentService>,
    settings: Arc<Settings>,
}

impl TestReviewerNode {
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

fn valid_fail_default(
    state: &PipelineState,
    reason: String,
    mut logs: Vec<String>,
) -> StateUpdate {
    logs.push(log_entry(
        "[TEST_REVIEWER] Falling back to VALID_FAIL (prefer fixing code on unclear signal)",
    ));
    StateUpdate {
        current_phase: Some(PipelinePhase::TestReviewing),
        test_review_decision: Field::Set(TestReviewDecision::ValidFail),
        test_review_feedback: Some(vec![format!("Test review failed: {reason}")]),
        gen_fix_retries: Some(state.gen_fix_retries + 1),
        logs,
        ..StateUpdate::default()
    }
}

#[async_trait]
impl Node<PipelineState, StateUpdate> for TestReviewerNode {
    fn id(&self) -> &str {
        NODE_TEST_REVIEWER
    }

    async fn run(&self, state: PipelineState, _ctx: &RunContext) -> Result<StateUpdate, GraphError> {
        let mut logs = Vec::new();
        logs.push(log_entry(format!(
            "[TEST_REVIEWER] Analyzing test results for {}...",
            state.connector_name
        )));

        let results = state.test_results.clone().unwrap_or(TestResults {
            status: TestStatus::Error,
            passed: false,
            tests_passed: 0,
            tests_failed: 0,
            errors: vec!["no test results in state".into()],
            details: None,
            duration_seconds: 0.0,
            tokens_used: 0,
        });

        // Fast path: nothing to triage.
        if results.passed {
            logs.push(log_entry("[TEST_REVIEWER] Tests PASSED - routing to reviewer"));
            return Ok(StateUpdate {
                current_phase: Some(PipelinePhase::TestReviewing),
                test_review_decision: Field::Set(TestReviewDecision::ValidPass),
                test_review_feedback: Some(Vec::new()),
                logs,
                ..StateUpdate::default()
            });
        }

        logs.push(format!(
            "[TEST_REVIEWER] Tests failed - analyzing root cause ({} errors)",
            results.errors.len()
        ));

        let original_errors = results.errors.clone();
        let outcome = self
            .agent
            .review_tests(TestReviewRequest {
                connector_name: state.connector_name.clone(),
                connector_dir: connector_dir(&self.settings, &state),
                test_results: results,
                files: state
                    .generated_code
                    .as_ref()
                    .map(|g| g.files.clone())
                    .unwrap_or_default(),
            })
            .await;

        let result: AgentResult = match outcome {
            Ok(result) if result.success => result,
            Ok(result) => {
                let reason = result.error.unwrap_or_else(|| "unknown failure".into());
                logs.push(log_entry(format!("[TEST_REVIEWER] FAILED: {reason}")));
                return Ok(valid_fail_default(&state, reason, logs));
            }
            Err(e) => {
                logs.push(log_entry(format!("[TEST_REVIEWER] EXCEPTION: {e}")));
                return Ok(valid_fail_default(&state, e.to_string(), logs));
            }
        };

        let Some(json) = result.output_json() else {
            logs.push(log_entry("[TEST_REVIEWER] Unparseable verdict"));
            return Ok(valid_fail_default(&state, "unparseable verdict".into(), logs));
        };

        let decision = json
            .get("decision")
            .and_then(|v| v.as_str())
            .unwrap_or("valid_fail")
            .to_lowercase();
        let confidence = json.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.5);
        let analysis = json
            .get("analysis")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        logs.push(log_entry(format!(
            "[TEST_REVIEWER] Decision: {} (confidence {confidence:.2})",
            decision.to_uppercase()
        )));
        if !analysis.is_empty() {
            logs.push(format!(
                "[TEST_REVIEWER] Analysis: {}",
                analysis.chars().take(200).collect::<String>()
            ));
        }

        match decision.as_str() {
            "invalid" => {
                let mut feedback: Vec<String> = strings(&json, "test_issues")
                    .into_iter()
                    .take(10)
                    .map(|i| format!("TEST_ISSUE: {i}"))
                    .collect();
                feedback.extend(
                    strings(&json, "recommendations")
                        .into_iter()
                        .take(5)
                        .map(|r| format!("FIX: {r}")),
                );
                logs.push("[TEST_REVIEWER] Tests are INVALID - routing to tester".to_string());
                Ok(StateUpdate {
                    current_phase: Some(PipelinePhase::TestReviewing),
                    test_review_decision: Field::Set(TestReviewDecision::Invalid),
                    test_review_feedback: Some(feedback),
                    test_retries: Some(state.test_retries + 1),
                    logs,
                    ..StateUpdate::default()
                })
            }
            "valid_pass" => {
                logs.push("[TEST_REVIEWER] Tests PASSED - routing to reviewer".to_string());
                Ok(StateUpdate {
                    current_phase: Some(PipelinePhase::TestReviewing),
                    test_review_decision: Field::Set(TestReviewDecision::ValidPass),
                    test_review_feedback: Some(Vec::new()),
                    logs,
                    ..StateUpdate::default()
                })
            }
            _ => {
                let mut feedback: Vec<String> = strings(&json, "code_issues")
                    .into_iter()
                    .take(10)
                    .map(|i| format!("CODE_BUG: {i}"))
                    .collect();
                feedback.extend(
                    strings(&json, "recommendations")
                        .into_iter()
                        .take(5)
                        .map(|r| format!("FIX: {r}")),
                );
                feedback.extend(
                    original_errors
                        .into_iter()
                        .take(5)
                        .map(|e| format!("TEST_ERROR: {e}")),
                );
                logs.push("[TEST_REVIEWER] Code has bugs - routing to generator".to_string());
                Ok(StateUpdate {
                    current_phase: Some(PipelinePhase::TestReviewing),
                    test_review_decision: Field::Set(TestReviewDecision::ValidFail),
                    test_review_feedback: Some(feedback),
                    gen_fix_retries: Some(state.gen_fix_retries + 1),
                    logs,
                    ..StateUpdate::default()
                })
            }
        }
    }
}
