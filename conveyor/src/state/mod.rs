//! Pipeline state: the single record threaded through every node.
//!
//! Explicit retry counters for each loop, coverage-ratio thresholds, degraded
//! mode for partial success, and the REJECT:CODE vs REJECT:CONTEXT paths.
//! List fields merge through the reducers in [`update`]; see [`StateUpdate`].

mod update;

pub use update::{apply_update, Field, StateUpdate};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Map of repository-relative path to file content.
pub type FileMap = BTreeMap<String, String>;

/// Current phase of the pipeline. Mirrors the node that last ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Pending,
    Researching,
    Generating,
    MockGenerating,
    Testing,
    TestReviewing,
    Reviewing,
    Publishing,
    Completed,
    Failed,
}

impl PipelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::Pending => "pending",
            PipelinePhase::Researching => "researching",
            PipelinePhase::Generating => "generating",
            PipelinePhase::MockGenerating => "mock_generating",
            PipelinePhase::Testing => "testing",
            PipelinePhase::TestReviewing => "test_reviewing",
            PipelinePhase::Reviewing => "reviewing",
            PipelinePhase::Publishing => "publishing",
            PipelinePhase::Completed => "completed",
            PipelinePhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final status of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    /// 100% tests pass.
    Success,
    /// >=80% tests pass (degraded mode).
    Partial,
    /// Max retries exceeded or <80% pass.
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Running => "running",
            PipelineStatus::Success => "success",
            PipelineStatus::Partial => "partial",
            PipelineStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reviewer decision types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    /// Code bugs -> Generator.
    RejectCode,
    /// Missing API context -> Research.
    RejectContext,
}

/// TestReviewer decision types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestReviewDecision {
    /// Tests valid, code passes -> Reviewer.
    ValidPass,
    /// Tests valid, code fails -> Generator.
    ValidFail,
    /// Tests invalid -> Tester.
    Invalid,
}

/// Kind of connector being generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorType {
    Source,
    Destination,
}

impl ConnectorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorType::Source => "source",
            ConnectorType::Destination => "destination",
        }
    }

    /// Parses `"source"` / `"destination"`; anything else is rejected at the control plane.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "source" => Some(ConnectorType::Source),
            "destination" => Some(ConnectorType::Destination),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Retry limits and coverage thresholds ────────────────────────────────────

/// TestReviewer -> Tester (invalid tests).
pub const DEFAULT_MAX_TEST_RETRIES: u32 = 3;
/// TestReviewer -> Generator (code fails).
pub const DEFAULT_MAX_GEN_FIX_RETRIES: u32 = 3;
/// Reviewer -> Generator (REJECT:CODE).
pub const DEFAULT_MAX_REVIEW_RETRIES: u32 = 2;
/// Reviewer -> Research (REJECT:CONTEXT).
pub const DEFAULT_MAX_RESEARCH_RETRIES: u32 = 1;

/// 100% -> APPROVE.
pub const COVERAGE_FULL_PASS: f64 = 1.0;
/// >=80% -> APPROVE in degraded mode.
pub const COVERAGE_PARTIAL_MIN: f64 = 0.80;
/// 50-79% -> REJECT:CODE. Below -> REJECT:CONTEXT.
pub const COVERAGE_REJECT_CODE_MIN: f64 = 0.50;

/// Log trimming bound: `logs` keeps only the newest entries.
pub const MAX_LOGS_IN_STATE: usize = 100;

/// Per-loop retry ceilings, configurable at pipeline start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLimits {
    pub max_test_retries: u32,
    pub max_gen_fix_retries: u32,
    pub max_review_retries: u32,
    pub max_research_retries: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            max_test_retries: DEFAULT_MAX_TEST_RETRIES,
            max_gen_fix_retries: DEFAULT_MAX_GEN_FIX_RETRIES,
            max_review_retries: DEFAULT_MAX_REVIEW_RETRIES,
            max_research_retries: DEFAULT_MAX_RESEARCH_RETRIES,
        }
    }
}

// ─── Artifact payloads ───────────────────────────────────────────────────────

/// Structured research document produced by the research phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchOutput {
    pub full_document: String,
    pub connector_name: String,
    pub context_gaps_addressed: Vec<String>,
    pub researched_at: String,
    pub duration_seconds: f64,
    pub tokens_used: u64,
}

/// Generated connector source, persisted in state so artifacts survive the
/// loss of the working tree across process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedCode {
    pub files: FileMap,
    /// What the generator did this cycle ("Generating code", "Fixing code", "Improving code").
    pub action: String,
    pub reason: String,
    pub generated_at: String,
    pub duration_seconds: f64,
    pub tokens_used: u64,
    pub file_count: usize,
    pub total_size: usize,
}

/// Fixture metadata from the mock-generation phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockGenerationOutput {
    pub fixtures_dir: String,
    pub conftest_path: String,
    pub fixture_count: usize,
    pub duration_seconds: f64,
    pub tokens_used: u64,
    pub generated_at: String,
}

/// Outcome of one tester run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    /// Execution infrastructure failed; the test reviewer triages this.
    Error,
}

/// Test results from the latest tester run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    pub status: TestStatus,
    pub passed: bool,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub errors: Vec<String>,
    pub details: Option<serde_json::Value>,
    pub duration_seconds: f64,
    pub tokens_used: u64,
}

impl TestResults {
    pub fn total(&self) -> u32 {
        self.tests_passed + self.tests_failed
    }

    /// `tests_passed / total`, zero when no tests ran. Always within [0, 1].
    pub fn coverage_ratio(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            f64::from(self.tests_passed) / f64::from(total)
        }
    }
}

// ─── The state record ────────────────────────────────────────────────────────

/// Shared state across all pipeline nodes.
///
/// Passed into every node and persisted via checkpointing after each node
/// returns. Nodes never mutate it directly; they return a [`StateUpdate`]
/// merged by [`apply_update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    // Immutable request information (set once).
    pub connector_name: String,
    pub connector_type: ConnectorType,
    /// Original user request, preserved across re-research cycles.
    pub original_request: String,
    pub api_doc_url: Option<String>,
    pub created_at: String,

    // Pipeline control.
    pub current_phase: PipelinePhase,
    pub status: PipelineStatus,

    // Retry counters, one per loop.
    pub test_retries: u32,
    pub gen_fix_retries: u32,
    pub review_retries: u32,
    pub research_retries: u32,
    pub max_test_retries: u32,
    pub max_gen_fix_retries: u32,
    pub max_review_retries: u32,
    pub max_research_retries: u32,

    // Research output; context gaps accumulate across REJECT:CONTEXT cycles.
    pub research_output: Option<ResearchOutput>,
    pub context_gaps: Vec<String>,

    // Generated artifacts (cleared on REJECT:CONTEXT -> Research).
    pub generated_code: Option<GeneratedCode>,
    pub mock_generation_output: Option<MockGenerationOutput>,
    pub fixtures_created: Vec<String>,
    pub mock_generation_skipped: bool,
    pub test_code: Option<FileMap>,
    pub connector_dir: Option<String>,

    // Test results.
    pub test_results: Option<TestResults>,
    pub coverage_ratio: f64,

    // Verdicts (replaced each cycle).
    pub test_review_decision: Option<TestReviewDecision>,
    pub test_review_feedback: Vec<String>,
    pub review_decision: Option<ReviewDecision>,
    pub review_feedback: Vec<String>,

    // Publish results.
    pub published: bool,
    pub pr_url: Option<String>,
    pub degraded_mode: bool,
    pub degraded_streams: Vec<String>,

    // Execution metadata. Errors accumulate, logs are trimmed.
    pub errors: Vec<String>,
    pub logs: Vec<String>,
    pub completed_at: Option<String>,
    pub total_duration: f64,
}

impl PipelineState {
    /// Creates the initial state for a new pipeline run.
    pub fn initial(
        connector_name: impl Into<String>,
        connector_type: ConnectorType,
        api_doc_url: Option<String>,
        original_request: Option<String>,
        limits: RetryLimits,
    ) -> Self {
        let connector_name = connector_name.into();
        let original_request = original_request.unwrap_or_else(|| {
            format!("Generate {connector_type} connector for {connector_name}")
        });
        Self {
            connector_name,
            connector_type,
            original_request,
            api_doc_url,
            created_at: chrono::Utc::now().to_rfc3339(),
            current_phase: PipelinePhase::Pending,
            status: PipelineStatus::Running,
            test_retries: 0,
            gen_fix_retries: 0,
            review_retries: 0,
            research_retries: 0,
            max_test_retries: limits.max_test_retries,
            max_gen_fix_retries: limits.max_gen_fix_retries,
            max_review_retries: limits.max_review_retries,
            max_research_retries: limits.max_research_retries,
            research_output: None,
            context_gaps: Vec::new(),
            generated_code: None,
            mock_generation_output: None,
            fixtures_created: Vec::new(),
            mock_generation_skipped: false,
            test_code: None,
            connector_dir: None,
            test_results: None,
            coverage_ratio: 0.0,
            test_review_decision: None,
            test_review_feedback: Vec::new(),
            review_decision: None,
            review_feedback: Vec::new(),
            published: false,
            pr_url: None,
            degraded_mode: false,
            degraded_streams: Vec::new(),
            errors: Vec::new(),
            logs: Vec::new(),
            completed_at: None,
            total_duration: 0.0,
        }
    }

    /// Lowercase kebab-case slug of the connector name, used for working
    /// directories, publish branches, and thread ids.
    pub fn connector_slug(&self) -> String {
        slugify(&self.connector_name)
    }
}

/// Lowercase kebab-case slug: spaces and underscores become hyphens.
pub fn slugify(name: &str) -> String {
    name.to_lowercase().replace([' ', '_'], "-")
}

/// State updates applied when REJECT:CONTEXT triggers re-research.
///
/// Clears generated artifacts but preserves research context. `context_gaps`
/// appends through its reducer, so only the new gap is supplied.
///
/// Does NOT clear `review_decision`: routing happens after this update is
/// applied, and the router must still see REJECT:CONTEXT. The research node
/// clears the decision on re-entry.
pub fn reset_for_re_research(state: &PipelineState, context_gap: impl Into<String>) -> StateUpdate {
    StateUpdate {
        generated_code: Field::Clear,
        test_code: Field::Clear,
        test_results: Field::Clear,
        coverage_ratio: Some(0.0),
        test_review_decision: Field::Clear,
        test_review_feedback: Some(Vec::new()),
        review_feedback: Some(Vec::new()),
        context_gaps: vec![context_gap.into()],
        research_retries: Some(state.research_retries + 1),
        current_phase: Some(PipelinePhase::Researching),
        ..StateUpdate::default()
    }
}
