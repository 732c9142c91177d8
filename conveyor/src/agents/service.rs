//! The per-phase agent contract: typed requests, one result shape.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::state::{ConnectorType, FileMap, TestResults};

/// Agent invocation error: the session itself could not run (API failure,
/// exhausted turn budget, missing scripted result). Nodes absorb this into
/// the state's error list; they never propagate it upward.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent execution failed: {0}")]
    ExecutionFailed(String),
}

/// Result of one agent session.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    pub success: bool,
    /// Final output: free text or a JSON document, phase-dependent.
    pub output: String,
    pub error: Option<String>,
    pub duration_seconds: f64,
    pub tokens_used: u64,
}

impl AgentResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            duration_seconds: 0.0,
            tokens_used: 0,
        }
    }

    pub fn ok_json(value: serde_json::Value) -> Self {
        Self::ok(value.to_string())
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            duration_seconds: 0.0,
            tokens_used: 0,
        }
    }

    /// Parses the output as JSON when possible.
    pub fn output_json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.output).ok()
    }
}

/// Research phase input.
#[derive(Debug, Clone)]
pub struct ResearchRequest {
    pub connector_name: String,
    pub api_doc_url: Option<String>,
    /// Accumulated context gaps to target on re-research.
    pub additional_context: Option<String>,
}

/// What the generator is being asked to do, computed from state pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorMode {
    /// Initial generation from the research document.
    Generate,
    /// Repair code so the existing tests pass.
    Fix,
    /// Address code-review comments.
    Improve,
}

impl GeneratorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeneratorMode::Generate => "generate",
            GeneratorMode::Fix => "fix",
            GeneratorMode::Improve => "improve",
        }
    }
}

/// Generator phase input.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub connector_name: String,
    pub connector_type: ConnectorType,
    pub research_document: String,
    pub mode: GeneratorMode,
    /// Test-review feedback driving a fix cycle.
    pub fix_errors: Vec<String>,
    /// Code-review feedback driving an improve cycle.
    pub review_feedback: Vec<String>,
    pub connector_dir: PathBuf,
}

/// MockGenerator phase input.
#[derive(Debug, Clone)]
pub struct MockGenerateRequest {
    pub connector_name: String,
    pub connector_type: ConnectorType,
    pub connector_dir: PathBuf,
    pub research_summary: Option<String>,
}

/// Tester sub-mode, computed from counters and feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TesterMode {
    /// First entry: author the suite from scratch.
    Generate,
    /// Re-execute the existing suite after a code fix.
    Rerun,
    /// Repair the suite itself after an INVALID verdict.
    Fix,
}

impl TesterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TesterMode::Generate => "generate",
            TesterMode::Rerun => "rerun",
            TesterMode::Fix => "fix",
        }
    }
}

/// Tester phase input.
#[derive(Debug, Clone)]
pub struct TestRequest {
    pub connector_name: String,
    pub connector_type: ConnectorType,
    pub connector_dir: PathBuf,
    pub mode: TesterMode,
    pub implementation_doc: Option<String>,
    /// `TEST_ISSUE:` entries stripped of their tag (fix mode).
    pub test_issues: Vec<String>,
    /// `FIX:` entries stripped of their tag (fix mode).
    pub fix_feedback: Vec<String>,
}

/// TestReviewer phase input.
#[derive(Debug, Clone)]
pub struct TestReviewRequest {
    pub connector_name: String,
    pub connector_dir: PathBuf,
    pub test_results: TestResults,
    pub files: FileMap,
}

/// Reviewer phase input. The decision itself is coverage-driven in the node;
/// the agent contributes semantic feedback.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub connector_name: String,
    pub connector_dir: PathBuf,
    pub coverage_ratio: f64,
    pub test_results: Option<TestResults>,
}

/// Publisher phase input.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub connector_name: String,
    pub connector_dir: PathBuf,
    pub files: FileMap,
    pub repo_owner: String,
    pub repo_name: String,
    pub token: String,
    pub branch_name: String,
    pub degraded_mode: bool,
}

/// One LLM session per phase invocation.
///
/// Expected output per phase (all tolerantly parsed by the nodes):
/// - `research`: the research document as text.
/// - `generate`: free text; generated files land in the working directory
///   (a `files` JSON object is an accepted fallback).
/// - `generate_mocks`: JSON `{fixture_count, fixtures?}`.
/// - `run_tests`: JSON `{unit_tests_passed, unit_tests_failed, errors?}`.
/// - `review_tests`: JSON `{decision, analysis?, test_issues?, code_issues?,
///   recommendations?}` with decision in {invalid, valid_fail, valid_pass}.
/// - `review`: JSON `{feedback?, degraded_streams?}` (optional).
/// - `publish`: JSON `{branch_name, commit_hash?, remote_url?, pr_url?}`.
#[async_trait]
pub trait AgentService: Send + Sync {
    async fn research(&self, req: ResearchRequest) -> Result<AgentResult, AgentError>;
    async fn generate(&self, req: GenerateRequest) -> Result<AgentResult, AgentError>;
    async fn generate_mocks(&self, req: MockGenerateRequest) -> Result<AgentResult, AgentError>;
    async fn run_tests(&self, req: TestRequest) -> Result<AgentResult, AgentError>;
    async fn review_tests(&self, req: TestReviewRequest) -> Result<AgentResult, AgentError>;
    async fn review(&self, req: ReviewRequest) -> Result<AgentResult, AgentError>;
    async fn publish(&self, req: PublishRequest) -> Result<AgentResult, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: output_json parses JSON output and rejects plain text.
    #[test]
    fn agent_result_output_json() {
        let r = AgentResult::ok_json(serde_json::json!({"fixture_count": 3}));
        assert_eq!(r.output_json().unwrap()["fixture_count"], 3);
        assert!(AgentResult::ok("free text").output_json().is_none());
        assert!(AgentResult::failed("boom").error.is_some());
    }
}
