//! REST + SSE control plane for Conveyor pipelines (axum).
//!
//! Endpoints under `/orchestrator`: start, status, history, resume, cancel,
//! stream (SSE), diagram, active pipelines, health.
//!
//! **Public API**: [`run_serve`], [`run_serve_on_listener`].

mod app;

use std::sync::Arc;

use conveyor::Runner;
use tokio::net::TcpListener;
use tracing::info;

pub use app::router;

/// How often completed run handles are swept from the registry.
const CLEANUP_INTERVAL_SECS: u64 = 300;

/// Serves on an existing listener. Used by tests (bind 127.0.0.1:0, pass the
/// listener). Returns when the listener task ends.
pub async fn run_serve_on_listener(
    listener: TcpListener,
    runner: Arc<Runner>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("control plane listening on http://{addr}");

    let cleanup_runner = runner.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(CLEANUP_INTERVAL_SECS));
        interval.tick().await; // immediate first tick is a no-op
        loop {
            interval.tick().await;
            cleanup_runner.cleanup_completed_runs();
        }
    });

    let app = router(runner.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down, cancelling active pipelines");
            runner.shutdown();
        })
        .await?;
    Ok(())
}

/// Binds `addr` and serves until interrupted.
pub async fn run_serve(
    addr: &str,
    runner: Arc<Runner>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    run_serve_on_listener(listener, runner).await
}
