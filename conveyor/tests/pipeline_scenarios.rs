//! End-to-end pipeline scenarios against scripted agents.
//!
//! Each test wires the real graph, nodes, routers, and a checkpoint store;
//! only the agent sessions are scripted. Terminal states, counters, and
//! checkpoint counts are asserted per scenario.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use conveyor::agents::{
    AgentError, AgentResult, AgentService, GenerateRequest, MockGenerateRequest, PublishRequest,
    ResearchRequest, ReviewRequest, ScriptedAgentService, TestRequest, TestReviewRequest,
};
use conveyor::checkpoint::{JsonSerializer, MemorySaver, SqliteSaver};
use conveyor::graph::RunContext;
use conveyor::settings::Settings;
use conveyor::state::{PipelinePhase, PipelineState, PipelineStatus, ConnectorType};
use conveyor::{build_pipeline, PipelineApp};

fn test_settings(dir: &std::path::Path) -> Arc<Settings> {
    Arc::new(Settings {
        output_base_dir: dir.join("out"),
        github_repo_owner: Some("acme".into()),
        github_repo_name: Some("connectors".into()),
        github_token: Some("test-token".into()),
        ..Settings::default()
    })
}

fn initial_state(settings: &Settings) -> PipelineState {
    PipelineState::initial(
        "widget-api",
        ConnectorType::Source,
        None,
        None,
        settings.retry_limits,
    )
}

fn research_ok() -> AgentResult {
    AgentResult::ok("# widget-api research\n\nAuth: bearer tokens. Endpoints: /records, /users.")
}

fn generate_ok() -> AgentResult {
    AgentResult::ok_json(json!({
        "files": {
            "src/__init__.py": "",
            "src/client.py": "class WidgetClient:\n    pass\n",
            "src/streams.py": "STREAMS = ['records', 'users']\n",
            "requirements.txt": "requests>=2.31\n",
            "IMPLEMENTATION.md": "# widget-api connector\n\nWidgetClient.fetch_records()\n",
        }
    }))
}

fn mocks_ok() -> AgentResult {
    AgentResult::ok_json(json!({
        "fixture_count": 3,
        "fixtures": [
            "tests/fixtures/records.json",
            "tests/fixtures/users.json",
            "tests/fixtures/errors.json",
        ]
    }))
}

fn tests_result(passed: u32, failed: u32) -> AgentResult {
    let errors: Vec<String> = if failed > 0 {
        (0..failed.min(3))
            .map(|i| format!("test_stream_{i} assertion failed"))
            .collect()
    } else {
        Vec::new()
    };
    AgentResult::ok_json(json!({
        "unit_tests_passed": passed,
        "unit_tests_failed": failed,
        "errors": errors,
    }))
}

fn publish_ok() -> AgentResult {
    AgentResult::ok_json(json!({
        "branch_name": "connector/widget-api",
        "commit_hash": "3f2a1b9c0d",
        "remote_url": "https://github.com/acme/connectors",
    }))
}

fn build(
    agent: Arc<dyn AgentService>,
    settings: Arc<Settings>,
    saver: Arc<MemorySaver<PipelineState>>,
) -> PipelineApp {
    build_pipeline(agent, settings, saver).expect("pipeline compiles")
}

/// **Scenario A**: happy path, first try: every phase succeeds, coverage is
/// 1.0, and exactly one checkpoint per node is written.
#[tokio::test]
async fn scenario_a_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let agent = Arc::new(ScriptedAgentService::new());
    agent.push_research(research_ok());
    agent.push_generate(generate_ok());
    agent.push_mocks(mocks_ok());
    agent.push_tests(tests_result(20, 0));
    agent.push_review(AgentResult::ok_json(json!({})));
    agent.push_publish(publish_ok());

    let saver = Arc::new(MemorySaver::new());
    let app = build(agent, settings.clone(), saver);
    let state = initial_state(&settings);

    let final_state = app
        .invoke(Some(state), RunContext::new("pipeline-widget-api-00000001"))
        .await
        .unwrap();

    assert_eq!(final_state.status, PipelineStatus::Success);
    assert_eq!(final_state.current_phase, PipelinePhase::Completed);
    assert_eq!(final_state.coverage_ratio, 1.0);
    assert_eq!(final_state.test_retries, 0);
    assert_eq!(final_state.gen_fix_retries, 0);
    assert_eq!(final_state.review_retries, 0);
    assert_eq!(final_state.research_retries, 0);
    assert!(!final_state.degraded_mode);
    assert!(final_state.published);
    assert_eq!(
        final_state.pr_url.as_deref(),
        Some("https://github.com/acme/connectors/tree/connector/widget-api")
    );
    assert!(final_state.completed_at.is_some());
    assert!(final_state.errors.is_empty());
    assert_eq!(final_state.generated_code.as_ref().unwrap().file_count, 5);
    assert_eq!(final_state.fixtures_created.len(), 3);

    // One checkpoint per node boundary: research .. publisher.
    let history = app
        .state_history("pipeline-widget-api-00000001")
        .await
        .unwrap();
    assert_eq!(history.len(), 7);
    assert!(history[0].next_nodes.is_empty());
}

/// **Scenario B**: test-fix cycle, then success: one invalid-test repair and
/// two code-fix loops before a clean pass.
#[tokio::test]
async fn scenario_b_test_fix_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let agent = Arc::new(ScriptedAgentService::new());
    agent.push_research(research_ok());
    // Initial generation plus two fix cycles.
    agent.push_generate(generate_ok());
    agent.push_generate(generate_ok());
    agent.push_generate(generate_ok());
    // Mock generation re-enters after each generator pass.
    agent.push_mocks(mocks_ok());
    agent.push_mocks(mocks_ok());
    agent.push_mocks(mocks_ok());
    // Four tester runs: empty suite, then failing, then failing, then green.
    agent.push_tests(tests_result(0, 0));
    agent.push_tests(tests_result(20, 5));
    agent.push_tests(tests_result(23, 2));
    agent.push_tests(tests_result(25, 0));
    // Verdicts for the three non-passing runs; the green run takes the fast path.
    agent.push_test_review(AgentResult::ok_json(json!({
        "decision": "invalid",
        "confidence": 0.9,
        "analysis": "conftest patches the wrong module path",
        "test_issues": ["mock patches src.clients instead of src.client"],
        "recommendations": ["patch src.client.WidgetClient"],
    })));
    agent.push_test_review(AgentResult::ok_json(json!({
        "decision": "valid_fail",
        "code_issues": ["pagination cursor never advances"],
        "recommendations": ["advance cursor from response next_token"],
    })));
    agent.push_test_review(AgentResult::ok_json(json!({
        "decision": "valid_fail",
        "code_issues": ["retry loop drops the last page"],
    })));
    agent.push_review(AgentResult::ok_json(json!({})));
    agent.push_publish(publish_ok());

    let saver = Arc::new(MemorySaver::new());
    let app = build(agent, settings.clone(), saver);
    let state = initial_state(&settings);

    let final_state = app
        .invoke(Some(state), RunContext::new("pipeline-widget-api-0000000b"))
        .await
        .unwrap();

    assert_eq!(final_state.status, PipelineStatus::Success);
    assert_eq!(final_state.current_phase, PipelinePhase::Completed);
    assert_eq!(final_state.test_retries, 1);
    assert_eq!(final_state.gen_fix_retries, 2);
    assert_eq!(final_state.review_retries, 0);
    assert_eq!(final_state.research_retries, 0);
    assert_eq!(final_state.coverage_ratio, 1.0);
    // Feedback was consumed and cleared by the generator.
    assert!(final_state.test_review_feedback.is_empty());
    assert!(final_state.review_feedback.is_empty());
}

/// **Scenario C**: reject-context triggers re-research (with the artifact
/// reset), then a reject-code improvement cycle, then success.
#[tokio::test]
async fn scenario_c_re_research_then_success() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let agent = Arc::new(ScriptedAgentService::new());
    agent.push_research(research_ok());
    agent.push_research(AgentResult::ok(
        "# widget-api research, take two\n\nPagination uses cursor tokens on /records.",
    ));
    agent.push_generate(generate_ok());
    agent.push_generate(generate_ok());
    agent.push_generate(generate_ok());
    agent.push_mocks(mocks_ok());
    agent.push_mocks(mocks_ok());
    agent.push_mocks(mocks_ok());
    agent.push_tests(tests_result(20, 0));
    agent.push_tests(tests_result(20, 0));
    agent.push_tests(tests_result(20, 0));
    // Reviewer overrides the coverage verdict on semantic grounds, then
    // rejects the code once, then approves.
    agent.push_review(AgentResult::ok_json(json!({
        "decision": "reject_context",
        "feedback": ["pagination endpoint missing"],
    })));
    agent.push_review(AgentResult::ok_json(json!({
        "decision": "reject_code",
        "feedback": ["Add better error handling"],
    })));
    agent.push_review(AgentResult::ok_json(json!({})));
    agent.push_publish(publish_ok());

    let saver = Arc::new(MemorySaver::new());
    let app = build(agent, settings.clone(), saver);
    let state = initial_state(&settings);

    let final_state = app
        .invoke(Some(state), RunContext::new("pipeline-widget-api-0000000c"))
        .await
        .unwrap();

    assert_eq!(final_state.status, PipelineStatus::Success);
    assert_eq!(final_state.research_retries, 1);
    assert_eq!(final_state.review_retries, 1);
    assert_eq!(final_state.test_retries, 0);
    assert_eq!(final_state.gen_fix_retries, 0);
    assert_eq!(
        final_state.context_gaps,
        vec!["pagination endpoint missing"]
    );
    // The re-research cleared the routing decision once consumed.
    assert!(final_state.published);
}

/// **Scenario D**: exhausted test retries: repeated INVALID verdicts hit the
/// ceiling and the router terminates the pipeline.
#[tokio::test]
async fn scenario_d_exhausted_test_retries() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let agent = Arc::new(ScriptedAgentService::new());
    agent.push_research(research_ok());
    agent.push_generate(generate_ok());
    agent.push_mocks(mocks_ok());
    for _ in 0..3 {
        agent.push_tests(tests_result(0, 4));
        agent.push_test_review(AgentResult::ok_json(json!({
            "decision": "invalid",
            "test_issues": ["fixtures missing required fields"],
        })));
    }

    let saver = Arc::new(MemorySaver::new());
    let app = build(agent, settings.clone(), saver);
    let state = initial_state(&settings);

    let final_state = app
        .invoke(Some(state), RunContext::new("pipeline-widget-api-0000000d"))
        .await
        .unwrap();

    assert_eq!(final_state.status, PipelineStatus::Failed);
    assert_eq!(final_state.current_phase, PipelinePhase::Failed);
    // The router observed test_retries >= max_test_retries and chose failed.
    assert_eq!(final_state.test_retries, settings.retry_limits.max_test_retries);
    assert!(final_state.completed_at.is_some());
    assert!(!final_state.published);
}

/// **Scenario E**: degraded-mode publish: 85% coverage ships as partial with
/// the failing streams recorded.
#[tokio::test]
async fn scenario_e_degraded_publish() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let agent = Arc::new(ScriptedAgentService::new());
    agent.push_research(research_ok());
    agent.push_generate(generate_ok());
    agent.push_mocks(mocks_ok());
    agent.push_tests(tests_result(17, 3));
    agent.push_test_review(AgentResult::ok_json(json!({ "decision": "valid_pass" })));
    agent.push_review(AgentResult::ok_json(json!({
        "degraded_streams": ["stream_3", "stream_4"],
    })));
    agent.push_publish(publish_ok());

    let saver = Arc::new(MemorySaver::new());
    let app = build(agent, settings.clone(), saver);
    let state = initial_state(&settings);

    let final_state = app
        .invoke(Some(state), RunContext::new("pipeline-widget-api-0000000e"))
        .await
        .unwrap();

    assert_eq!(final_state.status, PipelineStatus::Partial);
    assert_eq!(final_state.current_phase, PipelinePhase::Completed);
    assert!(final_state.degraded_mode);
    assert_eq!(final_state.degraded_streams, vec!["stream_3", "stream_4"]);
    assert!((final_state.coverage_ratio - 0.85).abs() < 1e-9);
    assert!(final_state.pr_url.is_some());
}

/// Delegating agent that trips the cancellation token right after the tester
/// session returns: the process "dies" with the tester checkpoint durable.
struct CancelAfterTests {
    inner: ScriptedAgentService,
    cancel: CancellationToken,
}

#[async_trait]
impl AgentService for CancelAfterTests {
    async fn research(&self, req: ResearchRequest) -> Result<AgentResult, AgentError> {
        self.inner.research(req).await
    }
    async fn generate(&self, req: GenerateRequest) -> Result<AgentResult, AgentError> {
        self.inner.generate(req).await
    }
    async fn generate_mocks(&self, req: MockGenerateRequest) -> Result<AgentResult, AgentError> {
        self.inner.generate_mocks(req).await
    }
    async fn run_tests(&self, req: TestRequest) -> Result<AgentResult, AgentError> {
        let result = self.inner.run_tests(req).await;
        self.cancel.cancel();
        result
    }
    async fn review_tests(&self, req: TestReviewRequest) -> Result<AgentResult, AgentError> {
        self.inner.review_tests(req).await
    }
    async fn review(&self, req: ReviewRequest) -> Result<AgentResult, AgentError> {
        self.inner.review(req).await
    }
    async fn publish(&self, req: PublishRequest) -> Result<AgentResult, AgentError> {
        self.inner.publish(req).await
    }
}

/// **Scenario F**: crash-and-resume durability over a shared SQLite file: a
/// second process resumes at test_reviewer (not tester) and reaches the same
/// terminal state as an uninterrupted run, with seven checkpoints total.
#[tokio::test]
async fn scenario_f_crash_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let db_path = dir.path().join("checkpoints.db");
    let thread_id = "pipeline-widget-api-0000000f";

    // Process one: dies immediately after the tester checkpoint is written.
    {
        let scripted = ScriptedAgentService::new();
        scripted.push_research(research_ok());
        scripted.push_generate(generate_ok());
        scripted.push_mocks(mocks_ok());
        scripted.push_tests(tests_result(20, 0));

        let token = CancellationToken::new();
        let agent = Arc::new(CancelAfterTests {
            inner: scripted,
            cancel: token.clone(),
        });
        let saver = Arc::new(SqliteSaver::new(&db_path, Arc::new(JsonSerializer)).unwrap());
        let app = build_pipeline(agent, settings.clone(), saver).unwrap();

        let err = app
            .invoke(
                Some(initial_state(&settings)),
                RunContext::with_cancel(thread_id, token),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, conveyor::graph::GraphError::Cancelled));

        // Four checkpoints durable; the saved frontier is test_reviewer.
        let snapshot = app.get_state(thread_id).await.unwrap().unwrap();
        assert_eq!(snapshot.next_nodes, vec!["test_reviewer"]);
        assert_eq!(app.state_history(thread_id).await.unwrap().len(), 4);
    }

    // Process two: fresh store handle on the same file, fresh agents for the
    // remaining phases only.
    {
        let agent = Arc::new(ScriptedAgentService::new());
        agent.push_review(AgentResult::ok_json(json!({})));
        agent.push_publish(publish_ok());

        let saver = Arc::new(SqliteSaver::new(&db_path, Arc::new(JsonSerializer)).unwrap());
        let app = build_pipeline(agent, settings.clone(), saver).unwrap();

        let final_state = app.invoke(None, RunContext::new(thread_id)).await.unwrap();

        assert_eq!(final_state.status, PipelineStatus::Success);
        assert_eq!(final_state.current_phase, PipelinePhase::Completed);
        assert_eq!(final_state.coverage_ratio, 1.0);
        assert_eq!(final_state.test_retries, 0);
        assert_eq!(final_state.gen_fix_retries, 0);
        assert!(final_state.pr_url.is_some());

        // No duplicate checkpoint for the tester: 4 + 3 remaining nodes.
        assert_eq!(app.state_history(thread_id).await.unwrap().len(), 7);
    }
}
