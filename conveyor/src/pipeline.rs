//! Pipeline assembly: the seven phase nodes plus the failure sink, wired into
//! the cyclic routing graph.
//!
//! ```text
//! research -> generator -> mock_generator -> tester -> test_reviewer
//!     ^           ^                             ^           |
//!     |           |                             +- INVALID -+
//!     |           +------------- VALID+FAIL ----------------+
//!     |           |                                         +- VALID+PASS -> reviewer
//!     |           +------------- REJECT:CODE -------------------------------+   |
//!     +--------------------------REJECT:CONTEXT-----------------------------+   +- APPROVE -> publisher -> END
//!                                                                  failed <-+ (ceilings, errors)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::agents::{AgentService, ScriptedAgentService};
use crate::checkpoint::Checkpointer;
use crate::graph::{
    mermaid_diagram, reducer_fn, BoxedReducer, CompilationError, CompiledGraph, StateGraph, END,
    START,
};
use crate::nodes::{
    FailedNode, GeneratorNode, MockGeneratorNode, PublisherNode, ResearchNode, ReviewerNode,
    TestReviewerNode, TesterNode,
};
use crate::routing::{
    route_after_review, route_after_test_review, NODE_FAILED, NODE_GENERATOR, NODE_MOCK_GENERATOR,
    NODE_PUBLISHER, NODE_RESEARCH, NODE_REVIEWER, NODE_TESTER, NODE_TEST_REVIEWER,
};
use crate::settings::Settings;
use crate::state::{apply_update, PipelineState, StateUpdate};

/// The compiled connector pipeline.
pub type PipelineApp = CompiledGraph<PipelineState, StateUpdate>;

fn pipeline_reducer() -> BoxedReducer<PipelineState, StateUpdate> {
    reducer_fn(apply_update)
}

fn identity_map(keys: &[&str]) -> HashMap<String, String> {
    keys.iter().map(|k| (k.to_string(), k.to_string())).collect()
}

fn build_graph(
    agent: Arc<dyn AgentService>,
    settings: Arc<Settings>,
) -> StateGraph<PipelineState, StateUpdate> {
    let mut graph = StateGraph::new();
    graph.add_node(NODE_RESEARCH, Arc::new(ResearchNode::new(agent.clone())));
    graph.add_node(
        NODE_GENERATOR,
        Arc::new(GeneratorNode::new(agent.clone(), settings.clone())),
    );
    graph.add_node(
        NODE_MOCK_GENERATOR,
        Arc::new(MockGeneratorNode::new(agent.clone(), settings.clone())),
    );
    graph.add_node(
        NODE_TESTER,
        Arc::new(TesterNode::new(agent.clone(), settings.clone())),
    );
    graph.add_node(
        NODE_TEST_REVIEWER,
        Arc::new(TestReviewerNode::new(agent.clone(), settings.clone())),
    );
    graph.add_node(
        NODE_REVIEWER,
        Arc::new(ReviewerNode::new(agent.clone(), settings.clone())),
    );
    graph.add_node(
        NODE_PUBLISHER,
        Arc::new(PublisherNode::new(agent, settings)),
    );
    graph.add_node(NODE_FAILED, Arc::new(FailedNode));

    // Happy-path spine.
    graph.add_edge(START, NODE_RESEARCH);
    graph.add_edge(NODE_RESEARCH, NODE_GENERATOR);
    graph.add_edge(NODE_GENERATOR, NODE_MOCK_GENERATOR);
    graph.add_edge(NODE_MOCK_GENERATOR, NODE_TESTER);
    graph.add_edge(NODE_TESTER, NODE_TEST_REVIEWER);

    // TestReviewer verdicts.
    graph.add_conditional_edges(
        NODE_TEST_REVIEWER,
        Arc::new(|state: &PipelineState| route_after_test_review(state)),
        Some(identity_map(&[
            NODE_TESTER,
            NODE_GENERATOR,
            NODE_REVIEWER,
            NODE_FAILED,
        ])),
    );

    // Reviewer verdicts.
    graph.add_conditional_edges(
        NODE_REVIEWER,
        Arc::new(|state: &PipelineState| route_after_review(state)),
        Some(identity_map(&[
            NODE_GENERATOR,
            NODE_RESEARCH,
            NODE_PUBLISHER,
            NODE_FAILED,
        ])),
    );

    // Terminal edges.
    graph.add_edge(NODE_PUBLISHER, END);
    graph.add_edge(NODE_FAILED, END);
    graph
}

/// Builds the compiled pipeline with the given agent service and checkpointer.
pub fn build_pipeline(
    agent: Arc<dyn AgentService>,
    settings: Arc<Settings>,
    checkpointer: Arc<dyn Checkpointer<PipelineState>>,
) -> Result<PipelineApp, CompilationError> {
    build_graph(agent, settings).compile_with_checkpointer(pipeline_reducer(), checkpointer)
}

/// Mermaid diagram of the pipeline structure (served by the control plane).
pub fn pipeline_diagram() -> String {
    let graph = build_graph(
        Arc::new(ScriptedAgentService::new()),
        Arc::new(Settings::default()),
    );
    match graph.compile(pipeline_reducer()) {
        Ok(app) => mermaid_diagram(&app),
        Err(e) => format!("graph TD\n    error[\"{e}\"]\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: The pipeline graph compiles; the diagram names every
    /// phase and both conditional fan-outs.
    #[test]
    fn pipeline_compiles_and_renders() {
        let diagram = pipeline_diagram();
        for node in [
            NODE_RESEARCH,
            NODE_GENERATOR,
            NODE_MOCK_GENERATOR,
            NODE_TESTER,
            NODE_TEST_REVIEWER,
            NODE_REVIEWER,
            NODE_PUBLISHER,
            NODE_FAILED,
        ] {
            assert!(diagram.contains(node), "diagram missing {node}");
        }
        assert!(diagram.contains("test_reviewer -.->|tester| tester"));
        assert!(diagram.contains("reviewer -.->|research| research"));
    }
}
