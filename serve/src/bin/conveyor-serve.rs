//! Conveyor control-plane server.
//!
//! Loads `.env` / XDG config into the environment, reads typed settings,
//! builds the checkpointer and pipeline, then serves the REST/SSE API.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use conveyor::agents::OpenAiAgentService;
use conveyor::{build_checkpointer, build_pipeline, Runner, Settings};

#[derive(Parser, Debug)]
#[command(name = "conveyor-serve", about = "Connector pipeline orchestrator")]
struct Args {
    /// Bind address; overrides ORCH_BIND_ADDR.
    #[arg(long)]
    addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = config::load_and_apply("conveyor", None) {
        tracing::warn!(error = %e, "config load failed, continuing with process env");
    }

    let args = Args::parse();
    let settings = Arc::new(Settings::from_env());
    let addr = args.addr.unwrap_or_else(|| settings.bind_addr.clone());

    let checkpointer = build_checkpointer(&settings).await?;
    let agent = Arc::new(OpenAiAgentService::from_settings(&settings));
    let app = build_pipeline(agent, settings.clone(), checkpointer)?;
    let runner = Arc::new(Runner::new(app, settings));

    serve::run_serve(&addr, runner).await
}
