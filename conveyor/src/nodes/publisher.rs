//! Publisher node: push the generated connector to the code host.
//!
//! Publishes to a branch derived from the connector name. Success is the
//! pipeline's terminal happy path: `published`, `pr_url`, final status
//! (`partial` when degraded), `completed_at`. Missing repository
//! configuration or a failed publish terminates the pipeline as failed;
//! this node's only outgoing edge is END, so it stamps the terminal state
//! itself.

use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::{AgentService, PublishRequest};
use crate::graph::{GraphError, Node, RunContext};
use crate::routing::NODE_PUBLISHER;
use crate::settings::Settings;
use crate::state::{PipelinePhase, PipelineState, PipelineStatus, StateUpdate};

use super::{connector_dir, elapsed_since, log_entry};

pub struct PublisherNode {
    agent: Arc<dyn AgentService>,
    settings: Arc<Settings>,
}

impl PublisherNode {
    pub fn new(agent: Arc<dyn AgentService>, settings: Arc<Settings>) -> Self {
        Self { agent, settings }
    }

    fn fail(state: &PipelineState, error: String, mut logs: Vec<String>) -> StateUpdate {
        logs.push(log_entry(format!("[PUBLISHER] ERROR: {error}")));
        StateUpdate {
            current_phase: Some(PipelinePhase::Failed),
            status: Some(PipelineStatus::Failed),
            completed_at: Some(chrono::Utc::now().to_rfc3339()),
            total_duration: Some(elapsed_since(&state.created_at)),
            errors: vec![error],
            logs,
            ..StateUpdate::default()
        }
    }
}

#[async_trait]
impl Node<PipelineState, StateUpdate> for PublisherNode {
    fn id(&self) -> &str {
        NODE_PUBLISHER
    }

    async fn run(&self, state: PipelineState, _ctx: &RunContext) -> Result<StateUpdate, GraphError> {
        let mut logs = Vec::new();
        if state.degraded_mode {
            logs.push(log_entry(format!(
                "[PUBLISHER] Publishing {} in DEGRADED MODE (coverage {:.0}%)...",
                state.connector_name,
                state.coverage_ratio * 100.0
            )));
            logs.push(format!(
                "[PUBLISHER] Disabled streams: {:?}",
                state.degraded_streams
            ));
        } else {
            logs.push(log_entry(format!(
                "[PUBLISHER] Publishing {}...",
                state.connector_name
            )));
        }

        let (Some(repo_owner), Some(repo_name)) = (
            self.settings.github_repo_owner.clone(),
            self.settings.github_repo_name.clone(),
        ) else {
            return Ok(Self::fail(
                &state,
                "GitHub repository owner and name must be configured \
                 (ORCH_GITHUB_REPO_OWNER, ORCH_GITHUB_REPO_NAME)"
                    .into(),
                logs,
            ));
        };
        let Some(token) = self.settings.github_token.clone() else {
            return Ok(Self::fail(
                &state,
                "GitHub personal access token must be configured (ORCH_GITHUB_TOKEN)".into(),
                logs,
            ));
        };

        let files = state
            .generated_code
            .as_ref()
            .map(|g| g.files.clone())
            .unwrap_or_default();
        if files.is_empty() {
            return Ok(Self::fail(
                &state,
                "Publishing failed: no generated files in state".into(),
                logs,
            ));
        }

        let branch_name = format!("connector/{}", state.connector_slug());
        logs.push(log_entry(format!(
            "[PUBLISHER] Target: {repo_owner}/{repo_name} branch {branch_name} ({} files)",
            files.len()
        )));

        let result = self
            .agent
            .publish(PublishRequest {
                connector_name: state.connector_name.clone(),
                connector_dir: connector_dir(&self.settings, &state),
                files,
                repo_owner: repo_owner.clone(),
                repo_name: repo_name.clone(),
                token,
                branch_name: branch_name.clone(),
                degraded_mode: state.degraded_mode,
            })
            .await;

        let result = match result {
            Ok(result) if result.success => result,
            Ok(result) => {
                let error = result.error.unwrap_or_else(|| "unknown failure".into());
                return Ok(Self::fail(&state, format!("Publishing failed: {error}"), logs));
            }
            Err(e) => {
                return Ok(Self::fail(&state, format!("Publisher exception: {e}"), logs));
            }
        };

        let json = result.output_json().unwrap_or_default();
        let branch = json
            .get("branch_name")
            .and_then(|v| v.as_str())
            .unwrap_or(&branch_name);
        let pr_url = json
            .get("pr_url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| {
                json.get("remote_url")
                    .and_then(|v| v.as_str())
                    .map(|remote| format!("{}/tree/{branch}", remote.trim_end_matches('/')))
            })
            .unwrap_or_else(|| {
                format!("https://github.com/{repo_owner}/{repo_name}/tree/{branch}")
            });
        if let Some(commit) = json.get("commit_hash").and_then(|v| v.as_str()) {
            logs.push(format!(
                "[PUBLISHER] Commit: {}",
                commit.chars().take(8).collect::<String>()
            ));
        }

        let status = if state.degraded_mode {
            logs.push(log_entry(format!("[PUBLISHER] Published (PARTIAL): {pr_url}")));
            PipelineStatus::Partial
        } else {
            logs.push(log_entry(format!("[PUBLISHER] Published (SUCCESS): {pr_url}")));
            PipelineStatus::Success
        };

        Ok(StateUpdate {
            published: Some(true),
            pr_url: Some(pr_url),
            status: Some(status),
            current_phase: Some(PipelinePhase::Completed),
            completed_at: Some(chrono::Utc::now().to_rfc3339()),
            total_duration: Some(elapsed_since(&state.created_at)),
            logs,
            ..StateUpdate::default()
        })
    }
}
