//! Live agent service: one OpenAI tool-calling session per phase invocation.
//!
//! Each phase gets its own system prompt, tool allowlist, and turn budget.
//! Session failures (API errors, exhausted budgets) come back as failed
//! [`AgentResult`]s so every node handles success and failure uniformly.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::settings::Settings;

use super::llm::ChatOpenAI;
use super::service::{
    AgentError, AgentResult, AgentService, GenerateRequest, GeneratorMode, MockGenerateRequest,
    PublishRequest, ResearchRequest, ReviewRequest, TestRequest, TestReviewRequest, TesterMode,
};
use super::session::LlmSession;
use super::tools::{
    EditFileTool, FetchUrlTool, ReadFileTool, RunShellTool, Tool, ToolRegistry, WriteFileTool,
};

// Per-phase turn budgets.
const RESEARCH_MAX_TURNS: u32 = 40;
const GENERATOR_MAX_TURNS: u32 = 60;
const MOCK_GENERATOR_MAX_TURNS: u32 = 35;
const TESTER_MAX_TURNS: u32 = 50;
const TEST_REVIEWER_MAX_TURNS: u32 = 25;
const REVIEWER_MAX_TURNS: u32 = 15;
const PUBLISHER_MAX_TURNS: u32 = 20;

/// Live [`AgentService`] backed by OpenAI chat completions.
pub struct OpenAiAgentService {
    model: String,
    temperature: f32,
}

impl OpenAiAgentService {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.2,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.model.clone())
    }

    fn session(&self, registry: ToolRegistry, max_turns: u32) -> LlmSession {
        let client = ChatOpenAI::new(self.model.clone())
            .with_tools(registry.specs())
            .with_temperature(self.temperature);
        LlmSession::new(Arc::new(client), registry, max_turns)
    }

    /// Runs a session and folds transport failures into a failed result.
    async fn run_phase(
        &self,
        registry: ToolRegistry,
        max_turns: u32,
        system: &str,
        user: &str,
    ) -> AgentResult {
        let started = Instant::now();
        match self.session(registry, max_turns).run(system, user).await {
            Ok(outcome) => AgentResult {
                success: true,
                output: outcome.final_text,
                error: None,
                duration_seconds: started.elapsed().as_secs_f64(),
                tokens_used: outcome.tokens_used,
            },
            Err(AgentError::ExecutionFailed(msg)) => AgentResult {
                success: false,
                output: String::new(),
                error: Some(msg),
                duration_seconds: started.elapsed().as_secs_f64(),
                tokens_used: 0,
            },
        }
    }
}

fn workspace_tools(dir: &Path) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ReadFileTool::new(dir)),
        Arc::new(WriteFileTool::new(dir)),
        Arc::new(EditFileTool::new(dir)),
        Arc::new(RunShellTool::new(dir)),
    ]
}

fn bulleted(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl AgentService for OpenAiAgentService {
    async fn research(&self, req: ResearchRequest) -> Result<AgentResult, AgentError> {
        let registry = ToolRegistry::new(vec![Arc::new(FetchUrlTool::new())]);
        let system = "You are an API research specialist for data connectors. \
            Investigate the target API's authentication, endpoints, pagination, rate limits, \
            error model, and token formats. Use fetch_url to read documentation pages. \
            Answer with a single comprehensive markdown research document.";
        let mut user = format!(
            "Research the {} API thoroughly so a connector can be implemented against it.",
            req.connector_name
        );
        if let Some(url) = &req.api_doc_url {
            user.push_str(&format!("\nStart from the official documentation: {url}"));
        }
        if let Some(ctx) = &req.additional_context {
            user.push_str("\n\n");
            user.push_str(ctx);
        }
        Ok(self
            .run_phase(registry, RESEARCH_MAX_TURNS, system, &user)
            .await)
    }

    async fn generate(&self, req: GenerateRequest) -> Result<AgentResult, AgentError> {
        let registry = ToolRegistry::new(workspace_tools(&req.connector_dir));
        let system = "You are a senior connector engineer. Write complete, working Python \
            connector code with write_file, organized as src/ modules plus requirements.txt and \
            an IMPLEMENTATION.md describing the public client methods. Never leave stubs.";
        let user = match req.mode {
            GeneratorMode::Generate => format!(
                "Implement a {} connector named '{}' from this research document:\n\n{}",
                req.connector_type, req.connector_name, req.research_document
            ),
            GeneratorMode::Fix => format!(
                "The test suite for connector '{}' fails. Fix the connector source (not the \
                 tests) so the existing tests pass. Failures and suggested fixes:\n{}",
                req.connector_name,
                bulleted(&req.fix_errors)
            ),
            GeneratorMode::Improve => format!(
                "Code review rejected connector '{}'. Address every review comment:\n{}",
                req.connector_name,
                bulleted(&req.review_feedback)
            ),
        };
        Ok(self
            .run_phase(registry, GENERATOR_MAX_TURNS, system, &user)
            .await)
    }

    async fn generate_mocks(&self, req: MockGenerateRequest) -> Result<AgentResult, AgentError> {
        let registry = ToolRegistry::new(workspace_tools(&req.connector_dir));
        let system = "You are a test-fixture engineer. Read the connector source and \
            IMPLEMENTATION.md, then create realistic JSON API fixtures under tests/fixtures/ and \
            a tests/conftest.py that loads them and patches the HTTP layer. Do not run tests. \
            Answer with JSON: {\"fixture_count\": <n>, \"fixtures\": [<paths>]}.";
        let mut user = format!(
            "Create mock fixtures for the {} connector '{}'.",
            req.connector_type, req.connector_name
        );
        if let Some(research) = &req.research_summary {
            user.push_str(&format!(
                "\n\nAPI research for realistic payloads:\n{research}"
            ));
        }
        Ok(self
            .run_phase(registry, MOCK_GENERATOR_MAX_TURNS, system, &user)
            .await)
    }

    async fn run_tests(&self, req: TestRequest) -> Result<AgentResult, AgentError> {
        let registry = ToolRegistry::new(workspace_tools(&req.connector_dir));
        let system = "You are a connector test engineer. Work against the mocked API fixtures in \
            tests/fixtures (never the live API). Run the suite with run_shell (pytest) and write \
            machine-readable results to tests/test_results.json. Answer with JSON: \
            {\"unit_tests_passed\": <n>, \"unit_tests_failed\": <n>, \"errors\": [<strings>]}.";
        let mut user = match req.mode {
            TesterMode::Generate => format!(
                "Author a comprehensive pytest suite for the {} connector '{}' (config, \
                 connection, discovery, read paths), then run it and report.",
                req.connector_type, req.connector_name
            ),
            TesterMode::Rerun => format!(
                "The connector source for '{}' was just fixed. Re-run the existing test suite \
                 unchanged and report the results.",
                req.connector_name
            ),
            TesterMode::Fix => format!(
                "The test suite itself for '{}' is defective. Repair the tests, then run them \
                 and report.\nKnown test issues:\n{}\nSuggested fixes:\n{}",
                req.connector_name,
                bulleted(&req.test_issues),
                bulleted(&req.fix_feedback)
            ),
        };
        if let Some(doc) = &req.implementation_doc {
            user.push_str(&format!("\n\nIMPLEMENTATION.md:\n{doc}"));
        }
        let mut result = self
            .run_phase(registry, TESTER_MAX_TURNS, system, &user)
            .await;

        // Prefer the machine-readable results file over the model's answer.
        let results_path = req.connector_dir.join("tests").join("test_results.json");
        if let Ok(contents) = tokio::fs::read_to_string(&results_path).await {
            if serde_json::from_str::<serde_json::Value>(&contents).is_ok() {
                result.output = contents;
            }
        }
        Ok(result)
    }

    async fn review_tests(&self, req: TestReviewRequest) -> Result<AgentResult, AgentError> {
        let registry = ToolRegistry::new(vec![Arc::new(ReadFileTool::new(&req.connector_dir))]);
        let system = "You are a test-failure triage specialist. Decide whether failing tests are \
            themselves defective (bad mocks, wrong assertions, wrong patch targets) or correct \
            tests exposing connector bugs. Read both the tests and the source. Answer with JSON: \
            {\"decision\": \"invalid\"|\"valid_fail\"|\"valid_pass\", \"confidence\": <0..1>, \
            \"analysis\": <string>, \"test_issues\": [..], \"code_issues\": [..], \
            \"recommendations\": [..]}.";
        let user = format!(
            "Triage the failing test run for connector '{}'.\nTest status: {:?}, passed {}, \
             failed {}.\nReported errors:\n{}",
            req.connector_name,
            req.test_results.status,
            req.test_results.tests_passed,
            req.test_results.tests_failed,
            bulleted(&req.test_results.errors)
        );
        Ok(self
            .run_phase(registry, TEST_REVIEWER_MAX_TURNS, system, &user)
            .await)
    }

    async fn review(&self, req: ReviewRequest) -> Result<AgentResult, AgentError> {
        let registry = ToolRegistry::new(vec![Arc::new(ReadFileTool::new(&req.connector_dir))]);
        let system = "You are a connector code reviewer. The ship decision is coverage-driven; \
            your job is the semantic review: note code-quality problems and name any data \
            streams whose tests fail. Answer with JSON: {\"feedback\": [<strings>], \
            \"degraded_streams\": [<stream names>]}.";
        let user = format!(
            "Review connector '{}' at coverage {:.0}%.\nLatest test errors:\n{}",
            req.connector_name,
            req.coverage_ratio * 100.0,
            bulleted(
                &req.test_results
                    .as_ref()
                    .map(|t| t.errors.clone())
                    .unwrap_or_default()
            )
        );
        Ok(self
            .run_phase(registry, REVIEWER_MAX_TURNS, system, &user)
            .await)
    }

    async fn publish(&self, req: PublishRequest) -> Result<AgentResult, AgentError> {
        let registry = ToolRegistry::new(vec![
            Arc::new(ReadFileTool::new(&req.connector_dir)),
            Arc::new(RunShellTool::new(&req.connector_dir).with_env("GIT_TOKEN", &req.token)),
        ]);
        let system = "You are a release engineer. Publish the working directory to the given \
            GitHub repository with run_shell git commands: init if needed, create or reuse the \
            branch, commit all files in one commit, push with the token-authenticated remote. \
            Never force-push. Answer with JSON: {\"branch_name\": <string>, \"commit_hash\": \
            <string>, \"remote_url\": <string>}.";
        let degraded_note = if req.degraded_mode {
            "\nThis is a degraded (partial) release; mention that in the commit message."
        } else {
            ""
        };
        let user = format!(
            "Publish connector '{}' ({} files) to https://github.com/{}/{} on branch '{}'. \
             Authenticate pushes with the token in the GIT_TOKEN environment variable.{}",
            req.connector_name,
            req.files.len(),
            req.repo_owner,
            req.repo_name,
            req.branch_name,
            degraded_note
        );
        Ok(self
            .run_phase(registry, PUBLISHER_MAX_TURNS, system, &user)
            .await)
    }
}
