//! Partial state updates and the reducers that merge them.
//!
//! Nodes return a [`StateUpdate`] containing only the fields they change.
//! Per-field merge policy:
//! - `errors`, `context_gaps`: append.
//! - `logs`: append, then keep only the newest [`MAX_LOGS_IN_STATE`] entries.
//! - `test_review_feedback`, `review_feedback`, `degraded_streams`, `fixtures_created`:
//!   overwrite when present (`Some(vec![])` clears; the generator relies on
//!   this to clear consumed feedback).
//! - Nullable fields: three-way [`Field`] so "no change" is distinct from
//!   "set to null".
//! - Remaining scalars: overwrite when present.
//!
//! The reducer is pure and total: any update applies to any state.

use super::{
    FileMap, GeneratedCode, MockGenerationOutput, PipelinePhase, PipelineStatus, ResearchOutput,
    ReviewDecision, TestResults, TestReviewDecision, MAX_LOGS_IN_STATE,
};

/// Update to a nullable state field: keep the current value, set a new one,
/// or clear it to null.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Field<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> Field<T> {
    fn apply(self, slot: &mut Option<T>) {
        match self {
            Field::Keep => {}
            Field::Set(v) => *slot = Some(v),
            Field::Clear => *slot = None,
        }
    }
}

/// Partial update returned by a node. `Default` means "change nothing".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub current_phase: Option<PipelinePhase>,
    pub status: Option<PipelineStatus>,

    pub test_retries: Option<u32>,
    pub gen_fix_retries: Option<u32>,
    pub review_retries: Option<u32>,
    pub research_retries: Option<u32>,

    pub research_output: Field<ResearchOutput>,
    pub generated_code: Field<GeneratedCode>,
    pub mock_generation_output: Field<MockGenerationOutput>,
    pub fixtures_created: Option<Vec<String>>,
    pub mock_generation_skipped: Option<bool>,
    pub test_code: Field<FileMap>,
    pub connector_dir: Option<String>,

    pub test_results: Field<TestResults>,
    pub coverage_ratio: Option<f64>,

    pub test_review_decision: Field<TestReviewDecision>,
    pub test_review_feedback: Option<Vec<String>>,
    pub review_decision: Field<ReviewDecision>,
    pub review_feedback: Option<Vec<String>>,

    pub published: Option<bool>,
    pub pr_url: Option<String>,
    pub degraded_mode: Option<bool>,
    pub degraded_streams: Option<Vec<String>>,

    /// Appended to `state.context_gaps`.
    pub context_gaps: Vec<String>,
    /// Appended to `state.errors`.
    pub errors: Vec<String>,
    /// Appended to `state.logs`, then trimmed to the newest entries.
    pub logs: Vec<String>,

    pub completed_at: Option<String>,
    pub total_duration: Option<f64>,
}

/// Merges a partial update into the state. Pure and total.
pub fn apply_update(state: &mut super::PipelineState, update: StateUpdate) {
    if let Some(v) = update.current_phase {
        state.current_phase = v;
    }
    if let Some(v) = update.status {
        state.status = v;
    }
    if let Some(v) = update.test_retries {
        state.test_retries = v;
    }
    if let Some(v) = update.gen_fix_retries {
        state.gen_fix_retries = v;
    }
    if let Some(v) = update.review_retries {
        state.review_retries = v;
    }
    if let Some(v) = update.research_retries {
        state.research_retries = v;
    }

    update.research_output.apply(&mut state.research_output);
    update.generated_code.apply(&mut state.generated_code);
    update
        .mock_generation_output
        .apply(&mut state.mock_generation_output);
    if let Some(v) = update.fixtures_created {
        state.fixtures_created = v;
    }
    if let Some(v) = update.mock_generation_skipped {
        state.mock_generation_skipped = v;
    }
    update.test_code.apply(&mut state.test_code);
    if let Some(v) = update.connector_dir {
        state.connector_dir = Some(v);
    }

    update.test_results.apply(&mut state.test_results);
    if let Some(v) = update.coverage_ratio {
        state.coverage_ratio = v;
    }

    update
        .test_review_decision
        .apply(&mut state.test_review_decision);
    if let Some(v) = update.test_review_feedback {
        state.test_review_feedback = v;
    }
    update.review_decision.apply(&mut state.review_decision);
    if let Some(v) = update.review_feedback {
        state.review_feedback = v;
    }

    if let Some(v) = update.published {
        state.published = v;
    }
    if let Some(v) = update.pr_url {
        state.pr_url = Some(v);
    }
    if let Some(v) = update.degraded_mode {
        state.degraded_mode = v;
    }
    if let Some(v) = update.degraded_streams {
        state.degraded_streams = v;
    }

    state.errors.extend(update.errors);
    state.context_gaps.extend(update.context_gaps);

    state.logs.extend(update.logs);
    if state.logs.len() > MAX_LOGS_IN_STATE {
        let excess = state.logs.len() - MAX_LOGS_IN_STATE;
        state.logs.drain(..excess);
    }

    if let Some(v) = update.completed_at {
        state.completed_at = Some(v);
    }
    if let Some(v) = update.total_duration {
        state.total_duration = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ConnectorType, PipelineState, RetryLimits};

    fn base_state() -> PipelineState {
        PipelineState::initial(
            "widget-api",
            ConnectorType::Source,
            None,
            None,
            RetryLimits::default(),
        )
    }

    /// **Scenario**: An empty update changes nothing.
    #[test]
    fn empty_update_is_identity() {
        let mut s = base_state();
        let before = s.clone();
        apply_update(&mut s, StateUpdate::default());
        assert_eq!(s, before);
    }

    /// **Scenario**: errors and context_gaps append; feedback overwrites.
    #[test]
    fn append_vs_overwrite_semantics() {
        let mut s = base_state();
        apply_update(
            &mut s,
            StateUpdate {
                errors: vec!["e1".into()],
                context_gaps: vec!["g1".into()],
                test_review_feedback: Some(vec!["TEST_ISSUE: bad mock".into()]),
                ..StateUpdate::default()
            },
        );
        apply_update(
            &mut s,
            StateUpdate {
                errors: vec!["e2".into()],
                context_gaps: vec!["g2".into()],
                test_review_feedback: Some(vec![]),
                ..StateUpdate::default()
            },
        );
        assert_eq!(s.errors, vec!["e1", "e2"]);
        assert_eq!(s.context_gaps, vec!["g1", "g2"]);
        assert!(s.test_review_feedback.is_empty(), "Some(vec![]) clears");
    }

    /// **Scenario**: A feedback field left as None keeps its current value.
    #[test]
    fn feedback_none_keeps_existing() {
        let mut s = base_state();
        s.review_feedback = vec!["keep me".into()];
        apply_update(&mut s, StateUpdate::default());
        assert_eq!(s.review_feedback, vec!["keep me"]);
    }

    /// **Scenario**: logs append then trim to the newest MAX_LOGS_IN_STATE entries.
    #[test]
    fn logs_trim_keeps_newest() {
        let mut s = base_state();
        for i in 0..(MAX_LOGS_IN_STATE + 25) {
            apply_update(
                &mut s,
                StateUpdate {
                    logs: vec![format!("line {i}")],
                    ..StateUpdate::default()
                },
            );
        }
        assert_eq!(s.logs.len(), MAX_LOGS_IN_STATE);
        assert_eq!(s.logs.first().unwrap(), "line 25");
        assert_eq!(
            s.logs.last().unwrap(),
            &format!("line {}", MAX_LOGS_IN_STATE + 24)
        );
    }

    /// **Scenario**: Append reducers are associative: applying updates A then B
    /// equals applying their concatenation.
    #[test]
    fn append_reducer_associative() {
        let a = StateUpdate {
            errors: vec!["a1".into(), "a2".into()],
            context_gaps: vec!["ga".into()],
            ..StateUpdate::default()
        };
        let b = StateUpdate {
            errors: vec!["b1".into()],
            context_gaps: vec!["gb".into()],
            ..StateUpdate::default()
        };
        let ab = StateUpdate {
            errors: vec!["a1".into(), "a2".into(), "b1".into()],
            context_gaps: vec!["ga".into(), "gb".into()],
            ..StateUpdate::default()
        };

        let mut sequential = base_state();
        apply_update(&mut sequential, a);
        apply_update(&mut sequential, b);

        let mut concatenated = base_state();
        apply_update(&mut concatenated, ab);

        assert_eq!(sequential.errors, concatenated.errors);
        assert_eq!(sequential.context_gaps, concatenated.context_gaps);
    }

    /// **Scenario**: Field::Clear nulls a field, Field::Keep leaves it, Field::Set replaces it.
    #[test]
    fn field_three_way() {
        let mut s = base_state();
        s.connector_dir = Some("out/source-widget-api".into());
        s.test_review_decision = Some(crate::state::TestReviewDecision::Invalid);

        apply_update(
            &mut s,
            StateUpdate {
                test_review_decision: Field::Clear,
                ..StateUpdate::default()
            },
        );
        assert!(s.test_review_decision.is_none());
        assert_eq!(s.connector_dir.as_deref(), Some("out/source-widget-api"));

        apply_update(
            &mut s,
            StateUpdate {
                test_review_decision: Field::Set(crate::state::TestReviewDecision::ValidPass),
                ..StateUpdate::default()
            },
        );
        assert_eq!(
            s.test_review_decision,
            Some(crate::state::TestReviewDecision::ValidPass)
        );
    }
}
