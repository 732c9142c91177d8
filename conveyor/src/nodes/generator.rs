//! Generator node: produce or repair connector source in the working directory.
//!
//! Sub-mode is computed from state pattern, not passed explicitly:
//! test-review feedback present means a fix cycle, review feedback means an
//! improve cycle, otherwise initial generation. Both feedback lists are
//! cleared by explicit overwrite once consumed.

use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::{AgentService, GenerateRequest, GeneratorMode};
use crate::graph::{GraphError, Node, RunContext};
use crate::routing::NODE_GENERATOR;
use crate::settings::Settings;
use crate::state::{Field, FileMap, GeneratedCode, PipelinePhase, PipelineState, StateUpdate};

use super::{connector_dir, log_entry, read_workspace_files};

pub struct GeneratorNode {
    agent: Arc<dyn AgentService>,
    settings: Arc<Settings>,
}

impl GeneratorNode {
    pub fn new(agent: Arc<dyn AgentService>, settings: Arc<Settings>) -> Self {
        Self { agent, settings }
    }
}

/// Pulls a `files` object out of the agent's JSON answer when the working
/// tree came back empty (the in-state copy is what survives restarts).
fn files_from_output(output: &str) -> FileMap {
    serde_json::from_str::<serde_json::Value>(output)
        .ok()
        .and_then(|v| {
            v.get("files").and_then(|f| {
                serde_json::from_value::<FileMap>(f.clone()).ok()
            })
        })
        .unwrap_or_default()
}

#[async_trait]
impl Node<PipelineState, StateUpdate> for GeneratorNode {
    fn id(&self) -> &str {
        NODE_GENERATOR
    }

    async fn run(&self, state: PipelineState, _ctx: &RunContext) -> Result<StateUpdate, GraphError> {
        let mut logs = Vec::new();

        let (mode, action, reason) = if !state.test_review_feedback.is_empty() {
            logs.push(log_entry(format!(
                "[GENERATOR] Fixing code for {} (test failures)...",
                state.connector_name
            )));
            (
                GeneratorMode::Fix,
                "Fixing code",
                format!("test failures: {:?}", &state.test_review_feedback[..state.test_review_feedback.len().min(3)]),
            )
        } else if !state.review_feedback.is_empty() {
            logs.push(log_entry(format!(
                "[GENERATOR] Improving code for {} (review feedback)...",
                state.connector_name
            )));
            (
                GeneratorMode::Improve,
                "Improving code",
                format!("review feedback: {:?}", &state.review_feedback[..state.review_feedback.len().min(3)]),
            )
        } else {
            logs.push(log_entry(format!(
                "[GENERATOR] Generating code for {}...",
                state.connector_name
            )));
            (
                GeneratorMode::Generate,
                "Generating code",
                "initial generation".to_string(),
            )
        };
        logs.push(format!(
            "[GENERATOR] gen_fix_retries={}, review_retries={}",
            state.gen_fix_retries, state.review_retries
        ));

        let Some(research_document) = state
            .research_output
            .as_ref()
            .map(|r| r.full_document.clone())
        else {
            logs.push(log_entry("[GENERATOR] ERROR: no research document in state"));
            return Ok(StateUpdate {
                current_phase: Some(PipelinePhase::Generating),
                errors: vec!["Generator failed: No research document available".into()],
                logs,
                ..StateUpdate::default()
            });
        };

        let dir = connector_dir(&self.settings, &state);
        logs.push(format!("[GENERATOR] Output directory: {}", dir.display()));
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            logs.push(log_entry(format!("[GENERATOR] ERROR: cannot create working directory: {e}")));
            return Ok(StateUpdate {
                current_phase: Some(PipelinePhase::Generating),
                errors: vec![format!("Generator failed: cannot create working directory: {e}")],
                logs,
                ..StateUpdate::default()
            });
        }

        let result = self
            .agent
            .generate(GenerateRequest {
                connector_name: state.connector_name.clone(),
                connector_type: state.connector_type,
                research_document,
                mode,
                fix_errors: state.test_review_feedback.clone(),
                review_feedback: state.review_feedback.clone(),
                connector_dir: dir.clone(),
            })
            .await;

        let result = match result {
            Ok(result) if result.success => result,
            Ok(result) => {
                let error = result.error.unwrap_or_else(|| "unknown failure".into());
                logs.push(log_entry(format!("[GENERATOR] FAILED: {error}")));
                return Ok(StateUpdate {
                    current_phase: Some(PipelinePhase::Generating),
                    errors: vec![format!("Generator failed: {error}")],
                    logs,
                    ..StateUpdate::default()
                });
            }
            Err(e) => {
                logs.push(log_entry(format!("[GENERATOR] EXCEPTION: {e}")));
                return Ok(StateUpdate {
                    current_phase: Some(PipelinePhase::Generating),
                    errors: vec![format!("Generator exception: {e}")],
                    logs,
                    ..StateUpdate::default()
                });
            }
        };

        // The working tree is the primary artifact; the session's JSON file
        // map is the fallback, materialized to disk for the nodes downstream.
        let mut files = read_workspace_files(&dir);
        if files.is_empty() {
            files = files_from_output(&result.output);
            for (path, content) in &files {
                let full = dir.join(path);
                if let Some(parent) = full.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                if let Err(e) = tokio::fs::write(&full, content).await {
                    logs.push(format!("[GENERATOR] WARNING: could not write {path}: {e}"));
                }
            }
        }

        if files.is_empty() {
            logs.push(log_entry("[GENERATOR] WARNING: no files in output directory"));
            return Ok(StateUpdate {
                current_phase: Some(PipelinePhase::Generating),
                errors: vec!["Generator failed: No files were generated".into()],
                logs,
                ..StateUpdate::default()
            });
        }

        logs.push(log_entry(format!(
            "[GENERATOR] Completed, {} files",
            files.len()
        )));
        for (path, content) in &files {
            logs.push(format!("[GENERATOR]   - {path} ({} chars)", content.len()));
        }

        let total_size = files.values().map(String::len).sum();
        let file_count = files.len();
        Ok(StateUpdate {
            generated_code: Field::Set(GeneratedCode {
                files,
                action: action.to_string(),
                reason,
                generated_at: chrono::Utc::now().to_rfc3339(),
                duration_seconds: result.duration_seconds,
                tokens_used: result.tokens_used,
                file_count,
                total_size,
            }),
            connector_dir: Some(dir.to_string_lossy().into_owned()),
            current_phase: Some(PipelinePhase::Generating),
            // Feedback consumed; clear by explicit overwrite.
            test_review_feedback: Some(Vec::new()),
            review_feedback: Some(Vec::new()),
            logs,
            ..StateUpdate::default()
        })
    }
}
