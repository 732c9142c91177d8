//! Scripted agent service: deterministic queued results for tests.
//!
//! Each phase holds a FIFO of results; a drained queue is an execution
//! failure, which exercises the same paths a real session failure would.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::service::{
    AgentError, AgentResult, AgentService, GenerateRequest, MockGenerateRequest, PublishRequest,
    ResearchRequest, ReviewRequest, TestRequest, TestReviewRequest,
};

#[derive(Default)]
struct Queues {
    research: VecDeque<AgentResult>,
    generate: VecDeque<AgentResult>,
    mocks: VecDeque<AgentResult>,
    tests: VecDeque<AgentResult>,
    test_review: VecDeque<AgentResult>,
    review: VecDeque<AgentResult>,
    publish: VecDeque<AgentResult>,
}

/// Deterministic [`AgentService`]: pops pre-loaded results per phase.
#[derive(Default)]
pub struct ScriptedAgentService {
    queues: Mutex<Queues>,
}

impl ScriptedAgentService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_research(&self, result: AgentResult) -> &Self {
        self.queues.lock().unwrap().research.push_back(result);
        self
    }

    pub fn push_generate(&self, result: AgentResult) -> &Self {
        self.queues.lock().unwrap().generate.push_back(result);
        self
    }

    pub fn push_mocks(&self, result: AgentResult) -> &Self {
        self.queues.lock().unwrap().mocks.push_back(result);
        self
    }

    pub fn push_tests(&self, result: AgentResult) -> &Self {
        self.queues.lock().unwrap().tests.push_back(result);
        self
    }

    pub fn push_test_review(&self, result: AgentResult) -> &Self {
        self.queues.lock().unwrap().test_review.push_back(result);
        self
    }

    pub fn push_review(&self, result: AgentResult) -> &Self {
        self.queues.lock().unwrap().review.push_back(result);
        self
    }

    pub fn push_publish(&self, result: AgentResult) -> &Self {
        self.queues.lock().unwrap().publish.push_back(result);
        self
    }

    fn pop(
        &self,
        phase: &str,
        pick: impl FnOnce(&mut Queues) -> Option<AgentResult>,
    ) -> Result<AgentResult, AgentError> {
        pick(&mut self.queues.lock().unwrap())
            .ok_or_else(|| AgentError::ExecutionFailed(format!("no scripted {phase} result")))
    }
}

#[async_trait]
impl AgentService for ScriptedAgentService {
    async fn research(&self, _req: ResearchRequest) -> Result<AgentResult, AgentError> {
        self.pop("research", |q| q.research.pop_front())
    }

    async fn generate(&self, _req: GenerateRequest) -> Result<AgentResult, AgentError> {
        self.pop("generate", |q| q.generate.pop_front())
    }

    async fn generate_mocks(&self, _req: MockGenerateRequest) -> Result<AgentResult, AgentError> {
        self.pop("generate_mocks", |q| q.mocks.pop_front())
    }

    async fn run_tests(&self, _req: TestRequest) -> Result<AgentResult, AgentError> {
        self.pop("run_tests", |q| q.tests.pop_front())
    }

    async fn review_tests(&self, _req: TestReviewRequest) -> Result<AgentResult, AgentError> {
        self.pop("review_tests", |q| q.test_review.pop_front())
    }

    async fn review(&self, _req: ReviewRequest) -> Result<AgentResult, AgentError> {
        self.pop("review", |q| q.review.pop_front())
    }

    async fn publish(&self, _req: PublishRequest) -> Result<AgentResult, AgentError> {
        self.pop("publish", |q| q.publish.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: Queued results pop in order; a drained queue errors.
    #[tokio::test]
    async fn pops_in_order_then_errors() {
        let svc = ScriptedAgentService::new();
        svc.push_research(AgentResult::ok("first"));
        svc.push_research(AgentResult::ok("second"));

        let req = || ResearchRequest {
            connector_name: "widget-api".into(),
            api_doc_url: None,
            additional_context: None,
        };
        assert_eq!(svc.research(req()).await.unwrap().output, "first");
        assert_eq!(svc.research(req()).await.unwrap().output, "second");
        assert!(svc.research(req()).await.is_err());
    }
}
