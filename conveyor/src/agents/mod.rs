//! Agent adapters: one LLM session per phase invocation.
//!
//! [`AgentService`] is the seam between node functions and the LLM: one
//! method per phase, typed requests in, [`AgentResult`] out. The live
//! implementation ([`OpenAiAgentService`]) drives a chat-completions session
//! with a restricted tool set against the run's working directory; the
//! scripted implementation replays queued results for tests.

mod llm;
mod openai;
mod scripted;
mod service;
mod session;
mod tools;

pub use llm::{ChatOpenAI, LlmClient, LlmResponse, LlmUsage, Message, ToolCall};
pub use openai::OpenAiAgentService;
pub use scripted::ScriptedAgentService;
pub use service::{
    AgentError, AgentResult, AgentService, GenerateRequest, GeneratorMode, MockGenerateRequest,
    PublishRequest, ResearchRequest, ReviewRequest, TestRequest, TestReviewRequest, TesterMode,
};
pub use session::{LlmSession, SessionOutcome};
pub use tools::{
    resolve_path_under, EditFileTool, FetchUrlTool, ReadFileTool, RunShellTool, Tool, ToolError,
    ToolRegistry, ToolSpec, WriteFileTool,
};
