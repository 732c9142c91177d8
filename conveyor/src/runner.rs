//! Pipeline runner: background execution, run registry, cancellation,
//! timeout, and event streaming.
//!
//! Each run is a spawned task driving the compiled graph's stream; the
//! registry keeps a live status snapshot per thread id so the control plane
//! can answer before the first checkpoint lands and after the run finishes.
//! Completed handles linger for status queries until the periodic sweep
//! removes them.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::graph::{GraphError, RunContext};
use crate::pipeline::PipelineApp;
use crate::settings::Settings;
use crate::state::{slugify, ConnectorType, PipelineState};

/// Errors surfaced to the control plane; each maps to one HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("too many concurrent pipelines (limit {0})")]
    ResourceExhausted(usize),
    #[error("pipeline not found: {0}")]
    UnknownThread(String),
    #[error("internal: {0}")]
    Internal(String),
}

/// Request to start a new pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    pub connector_name: String,
    #[serde(default)]
    pub connector_type: Option<String>,
    #[serde(default)]
    pub api_doc_url: Option<String>,
    #[serde(default)]
    pub original_request: Option<String>,
}

/// Live status snapshot for one run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub thread_id: String,
    pub connector_name: String,
    pub status: String,
    pub current_phase: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

struct RunHandle {
    info: PipelineRun,
    cancel: CancellationToken,
}

/// Event emitted on the SSE stream, one per node completion plus lifecycle
/// markers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Started {
        thread_id: String,
        connector_name: String,
    },
    Progress {
        thread_id: String,
        phase: String,
        status: String,
        coverage_ratio: f64,
        test_retries: u32,
        gen_fix_retries: u32,
        review_retries: u32,
        research_retries: u32,
    },
    Completed {
        thread_id: String,
        status: String,
        pr_url: Option<String>,
    },
    Error {
        thread_id: String,
        error: String,
    },
}

/// Status payload for `GET /pipeline/status/{thread_id}`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub found: bool,
    pub thread_id: String,
    pub connector_name: Option<String>,
    pub status: Option<String>,
    pub current_phase: Option<String>,
    pub coverage_ratio: f64,
    pub test_retries: u32,
    pub gen_fix_retries: u32,
    pub review_retries: u32,
    pub research_retries: u32,
    pub degraded_mode: bool,
    pub pr_url: Option<String>,
    pub next_nodes: Vec<String>,
    pub is_active: bool,
    pub logs: Vec<String>,
}

/// One row of `GET /pipeline/history/{thread_id}`.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub phase: String,
    pub status: String,
    pub next_nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryReport {
    pub found: bool,
    pub thread_id: String,
    pub checkpoints: Vec<CheckpointSummary>,
    pub total_checkpoints: usize,
}

/// Owns background pipeline tasks and their lifecycle.
pub struct Runner {
    app: PipelineApp,
    settings: Arc<Settings>,
    runs: Arc<DashMap<String, RunHandle>>,
}

/// `pipeline-<slug>-<8 hex chars>`.
pub fn generate_thread_id(connector_name: &str) -> String {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    format!("pipeline-{}-{}", slugify(connector_name), suffix)
}

impl Runner {
    pub fn new(app: PipelineApp, settings: Arc<Settings>) -> Self {
        Self {
            app,
            settings,
            runs: Arc::new(DashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn active_count(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| r.info.completed_at.is_none())
            .count()
    }

    fn check_capacity(&self) -> Result<(), RunnerError> {
        let limit = self.settings.max_concurrent_pipelines;
        if self.active_count() >= limit {
            return Err(RunnerError::ResourceExhausted(limit));
        }
        Ok(())
    }

    fn validate(req: &StartRequest) -> Result<ConnectorType, RunnerError> {
        if req.connector_name.trim().is_empty() {
            return Err(RunnerError::Validation("connector_name is required".into()));
        }
        match req.connector_type.as_deref() {
            None => Ok(ConnectorType::Source),
            Some(raw) => ConnectorType::parse(raw).ok_or_else(|| {
                RunnerError::Validation(format!(
                    "connector_type must be 'source' or 'destination', got '{raw}'"
                ))
            }),
        }
    }

    /// Starts a new pipeline in the background. Returns its thread id.
    pub fn start(&self, req: StartRequest) -> Result<String, RunnerError> {
        let connector_type = Self::validate(&req)?;
        self.check_capacity()?;

        let thread_id = generate_thread_id(&req.connector_name);
        let state = PipelineState::initial(
            req.connector_name.trim(),
            connector_type,
            req.api_doc_url,
            req.original_request,
            self.settings.retry_limits,
        );

        let cancel = CancellationToken::new();
        self.runs.insert(
            thread_id.clone(),
            RunHandle {
                info: PipelineRun {
                    thread_id: thread_id.clone(),
                    connector_name: state.connector_name.clone(),
                    status: "running".into(),
                    current_phase: "pending".into(),
                    started_at: chrono::Utc::now().to_rfc3339(),
                    completed_at: None,
                    error: None,
                },
                cancel: cancel.clone(),
            },
        );
        info!(thread_id, connector = %state.connector_name, "pipeline started");
        self.spawn_run(thread_id.clone(), Some(state), cancel, None);
        Ok(thread_id)
    }

    /// Resumes an interrupted pipeline from its latest checkpoint.
    pub async fn resume(&self, thread_id: &str) -> Result<(), RunnerError> {
        let snapshot = self
            .app
            .get_state(thread_id)
            .await
            .map_err(|e| RunnerError::Internal(e.to_string()))?
            .ok_or_else(|| RunnerError::UnknownThread(thread_id.to_string()))?;
        self.check_capacity()?;

        let cancel = CancellationToken::new();
        self.runs.insert(
            thread_id.to_string(),
            RunHandle {
                info: PipelineRun {
                    thread_id: thread_id.to_string(),
                    connector_name: snapshot.values.connector_name.clone(),
                    status: "resuming".into(),
                    current_phase: snapshot.values.current_phase.as_str().into(),
                    started_at: chrono::Utc::now().to_rfc3339(),
                    completed_at: None,
                    error: None,
                },
                cancel: cancel.clone(),
            },
        );
        info!(thread_id, next = ?snapshot.next_nodes, "pipeline resuming");
        self.spawn_run(thread_id.to_string(), None, cancel, None);
        Ok(())
    }

    /// Cancels a running pipeline. The interrupted node writes no checkpoint,
    /// so a later resume re-enters it.
    pub fn cancel(&self, thread_id: &str) -> Result<(), RunnerError> {
        let mut handle = self
            .runs
            .get_mut(thread_id)
            .ok_or_else(|| RunnerError::UnknownThread(thread_id.to_string()))?;
        if handle.info.completed_at.is_some() {
            return Err(RunnerError::UnknownThread(thread_id.to_string()));
        }
        handle.cancel.cancel();
        handle.info.status = "cancelled".into();
        handle.info.completed_at = Some(chrono::Utc::now().to_rfc3339());
        info!(thread_id, "pipeline cancelled");
        Ok(())
    }

    /// Starts a pipeline and streams its progress events.
    pub fn stream_events(
        &self,
        req: StartRequest,
    ) -> Result<ReceiverStream<PipelineEvent>, RunnerError> {
        let connector_type = Self::validate(&req)?;
        self.check_capacity()?;

        let thread_id = generate_thread_id(&req.connector_name);
        let state = PipelineState::initial(
            req.connector_name.trim(),
            connector_type,
            req.api_doc_url,
            req.original_request,
            self.settings.retry_limits,
        );

        let (tx, rx) = mpsc::channel(64);
        let _ = tx.try_send(PipelineEvent::Started {
            thread_id: thread_id.clone(),
            connector_name: state.connector_name.clone(),
        });

        let cancel = CancellationToken::new();
        self.runs.insert(
            thread_id.clone(),
            RunHandle {
                info: PipelineRun {
                    thread_id: thread_id.clone(),
                    connector_name: state.connector_name.clone(),
                    status: "running".into(),
                    current_phase: "pending".into(),
                    started_at: chrono::Utc::now().to_rfc3339(),
                    completed_at: None,
                    error: None,
                },
                cancel: cancel.clone(),
            },
        );
        self.spawn_run(thread_id, Some(state), cancel, Some(tx));
        Ok(ReceiverStream::new(rx))
    }

    fn spawn_run(
        &self,
        thread_id: String,
        initial: Option<PipelineState>,
        cancel: CancellationToken,
        events: Option<mpsc::Sender<PipelineEvent>>,
    ) {
        let app = self.app.clone();
        let runs = self.runs.clone();
        let timeout = self.settings.pipeline_timeout;

        tokio::spawn(async move {
            let ctx = RunContext::with_cancel(thread_id.clone(), cancel.clone());
            let drive = async {
                let mut stream = app.stream(initial, ctx);
                let mut last: Option<PipelineState> = None;
                let mut failure: Option<GraphError> = None;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(state) => {
                            if let Some(mut handle) = runs.get_mut(&thread_id) {
                                handle.info.current_phase = state.current_phase.as_str().into();
                                handle.info.status = state.status.as_str().into();
                            }
                            if let Some(tx) = &events {
                                let _ = tx
                                    .send(PipelineEvent::Progress {
                                        thread_id: thread_id.clone(),
                                        phase: state.current_phase.as_str().into(),
                                        status: state.status.as_str().into(),
                                        coverage_ratio: state.coverage_ratio,
                                        test_retries: state.test_retries,
                                        gen_fix_retries: state.gen_fix_retries,
                                        review_retries: state.review_retries,
                                        research_retries: state.research_retries,
                                    })
                                    .await;
                            }
                            last = Some(state);
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                (last, failure)
            };

            let outcome = tokio::time::timeout(timeout, drive).await;
            let now = chrono::Utc::now().to_rfc3339();
            match outcome {
                Ok((last, None)) => {
                    let status = last
                        .as_ref()
                        .map(|s| s.status.as_str().to_string())
                        .unwrap_or_else(|| "failed".into());
                    if let Some(mut handle) = runs.get_mut(&thread_id) {
                        handle.info.status = status.clone();
                        handle.info.completed_at = Some(now);
                    }
                    info!(thread_id, status, "pipeline finished");
                    if let Some(tx) = &events {
                        let _ = tx
                            .send(PipelineEvent::Completed {
                                thread_id: thread_id.clone(),
                                status,
                                pr_url: last.and_then(|s| s.pr_url),
                            })
                            .await;
                    }
                }
                Ok((_, Some(GraphError::Cancelled))) => {
                    if let Some(mut handle) = runs.get_mut(&thread_id) {
                        handle.info.status = "cancelled".into();
                        handle.info.completed_at.get_or_insert(now);
                    }
                    info!(thread_id, "pipeline run cancelled");
                    if let Some(tx) = &events {
                        let _ = tx
                            .send(PipelineEvent::Error {
                                thread_id: thread_id.clone(),
                                error: "cancelled".into(),
                            })
                            .await;
                    }
                }
                Ok((_, Some(e))) => {
                    warn!(thread_id, error = %e, "pipeline run failed");
                    if let Some(mut handle) = runs.get_mut(&thread_id) {
                        handle.info.status = "failed".into();
                        handle.info.error = Some(e.to_string());
                        handle.info.completed_at = Some(now);
                    }
                    if let Some(tx) = &events {
                        let _ = tx
                            .send(PipelineEvent::Error {
                                thread_id: thread_id.clone(),
                                error: e.to_string(),
                            })
                            .await;
                    }
                }
                Err(_) => {
                    cancel.cancel();
                    warn!(thread_id, "pipeline timeout");
                    if let Some(mut handle) = runs.get_mut(&thread_id) {
                        handle.info.status = "failed".into();
                        handle.info.error = Some("pipeline timeout".into());
                        handle.info.completed_at = Some(now);
                    }
                    if let Some(tx) = &events {
                        let _ = tx
                            .send(PipelineEvent::Error {
                                thread_id: thread_id.clone(),
                                error: "pipeline timeout".into(),
                            })
                            .await;
                    }
                }
            }
        });
    }

    /// Current status: checkpointed state first, registry fallback for runs
    /// that have not checkpointed yet.
    pub async fn status(&self, thread_id: &str) -> Result<StatusReport, RunnerError> {
        let is_active = self
            .runs
            .get(thread_id)
            .map(|h| h.info.completed_at.is_none())
            .unwrap_or(false);

        match self.app.get_state(thread_id).await {
            Ok(Some(snapshot)) => {
                let state = snapshot.values;
                let logs = state
                    .logs
                    .iter()
                    .rev()
                    .take(10)
                    .rev()
                    .cloned()
                    .collect();
                return Ok(StatusReport {
                    found: true,
                    thread_id: thread_id.to_string(),
                    connector_name: Some(state.connector_name),
                    status: Some(state.status.as_str().into()),
                    current_phase: Some(state.current_phase.as_str().into()),
                    coverage_ratio: state.coverage_ratio,
                    test_retries: state.test_retries,
                    gen_fix_retries: state.gen_fix_retries,
                    review_retries: state.review_retries,
                    research_retries: state.research_retries,
                    degraded_mode: state.degraded_mode,
                    pr_url: state.pr_url,
                    next_nodes: snapshot.next_nodes,
                    is_active,
                    logs,
                });
            }
            Ok(None) => {}
            Err(e) => warn!(thread_id, error = %e, "could not read checkpoint state"),
        }

        let handle = self
            .runs
            .get(thread_id)
            .ok_or_else(|| RunnerError::UnknownThread(thread_id.to_string()))?;
        let info = &handle.info;
        Ok(StatusReport {
            found: true,
            thread_id: thread_id.to_string(),
            connector_name: Some(info.connector_name.clone()),
            status: Some(info.status.clone()),
            current_phase: Some(info.current_phase.clone()),
            coverage_ratio: 0.0,
            test_retries: 0,
            gen_fix_retries: 0,
            review_retries: 0,
            research_retries: 0,
            degraded_mode: false,
            pr_url: None,
            next_nodes: Vec::new(),
            is_active,
            logs: Vec::new(),
        })
    }

    /// Checkpoint history, newest first.
    pub async fn history(&self, thread_id: &str) -> Result<HistoryReport, RunnerError> {
        let snapshots = self
            .app
            .state_history(thread_id)
            .await
            .map_err(|e| RunnerError::Internal(e.to_string()))?;
        if snapshots.is_empty() && self.runs.get(thread_id).is_none() {
            return Err(RunnerError::UnknownThread(thread_id.to_string()));
        }
        let checkpoints: Vec<CheckpointSummary> = snapshots
            .into_iter()
            .map(|s| CheckpointSummary {
                checkpoint_id: s.checkpoint_id,
                phase: s.values.current_phase.as_str().into(),
                status: s.values.status.as_str().into(),
                next_nodes: s.next_nodes,
            })
            .collect();
        Ok(HistoryReport {
            found: true,
            thread_id: thread_id.to_string(),
            total_checkpoints: checkpoints.len(),
            checkpoints,
        })
    }

    /// All run handles still in the registry (active plus recently finished).
    pub fn active_runs(&self) -> Vec<PipelineRun> {
        self.runs.iter().map(|h| h.info.clone()).collect()
    }

    /// Number of runs currently executing.
    pub fn active_pipelines(&self) -> usize {
        self.active_count()
    }

    /// Sweeps handles that completed more than the configured age ago.
    pub fn cleanup_completed_runs(&self) {
        let max_age = chrono::Duration::from_std(self.settings.run_cleanup_max_age)
            .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let now = chrono::Utc::now();
        let before = self.runs.len();
        self.runs.retain(|_, handle| {
            let Some(completed_at) = &handle.info.completed_at else {
                return true;
            };
            match chrono::DateTime::parse_from_rfc3339(completed_at) {
                Ok(t) => now - t.with_timezone(&chrono::Utc) <= max_age,
                Err(_) => false,
            }
        });
        let removed = before - self.runs.len();
        if removed > 0 {
            info!(removed, "cleaned up completed pipeline runs");
        }
    }

    /// Cancels every active run; called on server shutdown.
    pub fn shutdown(&self) {
        for handle in self.runs.iter() {
            if handle.info.completed_at.is_none() {
                handle.cancel.cancel();
            }
        }
    }
}
