//! Routing policy: two pure functions mapping state to the next node name.
//!
//! Both routers send error-carrying states to the failure sink before looking
//! at any verdict, so a node that recorded a collaborator failure always
//! terminates the pipeline.
//!
//! Counter checks differ on purpose: `reject_code` uses `>=` (the counter is
//! incremented by the reviewer only when routing back), while
//! `reject_context` uses strict `>` because the re-research reset has already
//! incremented `research_retries` before this router runs; equality means
//! "the retry we just granted", only an overshoot is fatal.

use tracing::{info, warn};

use crate::state::{PipelineState, ReviewDecision, TestReviewDecision};

pub const NODE_RESEARCH: &str = "research";
pub const NODE_GENERATOR: &str = "generator";
pub const NODE_MOCK_GENERATOR: &str = "mock_generator";
pub const NODE_TESTER: &str = "tester";
pub const NODE_TEST_REVIEWER: &str = "test_reviewer";
pub const NODE_REVIEWER: &str = "reviewer";
pub const NODE_PUBLISHER: &str = "publisher";
pub const NODE_FAILED: &str = "failed";

/// Route after TestReviewer based on test validity and code pass/fail.
///
/// - INVALID tests -> tester (fix tests) while `test_retries < max`
/// - VALID+FAIL -> generator (fix code) while `gen_fix_retries < max`
/// - VALID+PASS -> reviewer
/// - ceiling hit, errors present, or no decision -> failed
pub fn route_after_test_review(state: &PipelineState) -> String {
    if !state.errors.is_empty() {
        warn!(errors = ?state.errors, "pipeline has fatal errors");
        return NODE_FAILED.to_string();
    }

    match state.test_review_decision {
        Some(TestReviewDecision::Invalid) => {
            if state.test_retries >= state.max_test_retries {
                warn!(
                    max = state.max_test_retries,
                    "max test retries exceeded -> failed"
                );
                NODE_FAILED.to_string()
            } else {
                info!(
                    retry = state.test_retries,
                    max = state.max_test_retries,
                    "tests invalid -> tester"
                );
                NODE_TESTER.to_string()
            }
        }
        Some(TestReviewDecision::ValidFail) => {
            if state.gen_fix_retries >= state.max_gen_fix_retries {
                warn!(
                    max = state.max_gen_fix_retries,
                    "max gen-fix retries exceeded -> failed"
                );
                NODE_FAILED.to_string()
            } else {
                info!(
                    retry = state.gen_fix_retries,
                    max = state.max_gen_fix_retries,
                    "tests valid but code fails -> generator"
                );
                NODE_GENERATOR.to_string()
            }
        }
        Some(TestReviewDecision::ValidPass) => {
            info!("tests valid and passing -> reviewer");
            NODE_REVIEWER.to_string()
        }
        None => {
            warn!("missing test_review_decision -> failed");
            NODE_FAILED.to_string()
        }
    }
}

/// Route after Reviewer based on review decision and counters.
///
/// - APPROVE -> publisher (degraded mode was decided by the reviewer node)
/// - REJECT:CODE -> generator while `review_retries < max`
/// - REJECT:CONTEXT -> research while `research_retries <= max` (already
///   incremented by the re-research reset)
/// - ceiling hit, errors present, or no decision -> failed
pub fn route_after_review(state: &PipelineState) -> String {
    if !state.errors.is_empty() {
        warn!(errors = ?state.errors, "pipeline has fatal errors");
        return NODE_FAILED.to_string();
    }

    match state.review_decision {
        Some(ReviewDecision::Approve) => {
            info!(
                coverage = state.coverage_ratio,
                degraded = state.degraded_mode,
                "review approved -> publisher"
            );
            NODE_PUBLISHER.to_string()
        }
        Some(ReviewDecision::RejectCode) => {
            if state.review_retries >= state.max_review_retries {
                warn!(
                    max = state.max_review_retries,
                    "max review retries exceeded -> failed"
                );
                NODE_FAILED.to_string()
            } else {
                info!(
                    retry = state.review_retries,
                    max = state.max_review_retries,
                    "review reject:code -> generator"
                );
                NODE_GENERATOR.to_string()
            }
        }
        Some(ReviewDecision::RejectContext) => {
            if state.research_retries > state.max_research_retries {
                warn!(
                    max = state.max_research_retries,
                    "max research retries exceeded -> failed"
                );
                NODE_FAILED.to_string()
            } else {
                info!(
                    retry = state.research_retries,
                    max = state.max_research_retries,
                    "review reject:context -> research"
                );
                NODE_RESEARCH.to_string()
            }
        }
        None => {
            warn!("missing review_decision -> failed");
            NODE_FAILED.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ConnectorType, RetryLimits};

    fn state() -> PipelineState {
        PipelineState::initial(
            "widget-api",
            ConnectorType::Source,
            None,
            None,
            RetryLimits::default(),
        )
    }

    /// **Scenario**: Exhaustive table for route_after_test_review, including
    /// the boundary `test_retries == max_test_retries`.
    #[test]
    fn test_review_routing_table() {
        // Errors dominate every decision.
        let mut s = state();
        s.test_review_decision = Some(TestReviewDecision::ValidPass);
        s.errors.push("agent exploded".into());
        assert_eq!(route_after_test_review(&s), NODE_FAILED);

        // INVALID below / at the ceiling.
        let mut s = state();
        s.test_review_decision = Some(TestReviewDecision::Invalid);
        s.test_retries = 2;
        assert_eq!(route_after_test_review(&s), NODE_TESTER);
        s.test_retries = 3;
        assert_eq!(route_after_test_review(&s), NODE_FAILED);
        s.test_retries = 4;
        assert_eq!(route_after_test_review(&s), NODE_FAILED);

        // VALID_FAIL below / at the ceiling.
        let mut s = state();
        s.test_review_decision = Some(TestReviewDecision::ValidFail);
        s.gen_fix_retries = 2;
        assert_eq!(route_after_test_review(&s), NODE_GENERATOR);
        s.gen_fix_retries = 3;
        assert_eq!(route_after_test_review(&s), NODE_FAILED);

        // VALID_PASS ignores counters.
        let mut s = state();
        s.test_review_decision = Some(TestReviewDecision::ValidPass);
        s.test_retries = 3;
        s.gen_fix_retries = 3;
        assert_eq!(route_after_test_review(&s), NODE_REVIEWER);

        // No decision is a failure.
        let s = state();
        assert_eq!(route_after_test_review(&s), NODE_FAILED);
    }

    /// **Scenario**: Exhaustive table for route_after_review, including the
    /// strict `>` on reject_context (reset already incremented the counter).
    #[test]
    fn review_routing_table() {
        // Errors dominate.
        let mut s = state();
        s.review_decision = Some(ReviewDecision::Approve);
        s.errors.push("boom".into());
        assert_eq!(route_after_review(&s), NODE_FAILED);

        // Approve goes to publisher regardless of coverage; degraded mode is
        // the reviewer node's call, not the router's.
        let mut s = state();
        s.review_decision = Some(ReviewDecision::Approve);
        s.coverage_ratio = 0.85;
        s.degraded_mode = true;
        assert_eq!(route_after_review(&s), NODE_PUBLISHER);
        s.coverage_ratio = 1.0;
        s.degraded_mode = false;
        assert_eq!(route_after_review(&s), NODE_PUBLISHER);

        // REJECT:CODE below / at the ceiling.
        let mut s = state();
        s.review_decision = Some(ReviewDecision::RejectCode);
        s.review_retries = 1;
        assert_eq!(route_after_review(&s), NODE_GENERATOR);
        s.review_retries = 2;
        assert_eq!(route_after_review(&s), NODE_FAILED);

        // REJECT:CONTEXT: equality proceeds (counter pre-incremented by the
        // reset), only an overshoot fails.
        let mut s = state();
        s.review_decision = Some(ReviewDecision::RejectContext);
        s.research_retries = 1; // == max
        assert_eq!(route_after_review(&s), NODE_RESEARCH);
        s.research_retries = 2; // > max
        assert_eq!(route_after_review(&s), NODE_FAILED);

        // No decision is a failure.
        let s = state();
        assert_eq!(route_after_review(&s), NODE_FAILED);
    }
}
