//! One LLM session: a bounded tool-calling loop against a working directory.
//!
//! The model is invoked with the session's tool specs; returned tool calls
//! are executed through the registry and fed back as observation messages.
//! The loop ends when the model answers without tool calls or the turn
//! budget runs out.

use std::sync::Arc;

use tracing::{debug, warn};

use super::llm::{LlmClient, Message};
use super::service::AgentError;
use super::tools::ToolRegistry;

/// Observation text longer than this is truncated before re-entering the
/// transcript; a single huge file read must not blow the context.
const MAX_OBSERVATION_CHARS: usize = 30_000;

/// Result of a completed session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// The model's final answer (no tool calls requested).
    pub final_text: String,
    pub tokens_used: u64,
    pub turns: u32,
}

/// A bounded tool-calling session.
pub struct LlmSession {
    client: Arc<dyn LlmClient>,
    registry: ToolRegistry,
    max_turns: u32,
}

impl LlmSession {
    pub fn new(client: Arc<dyn LlmClient>, registry: ToolRegistry, max_turns: u32) -> Self {
        Self {
            client,
            registry,
            max_turns,
        }
    }

    /// Drives the session to a final answer.
    ///
    /// Tool failures are reported back to the model as observations so it can
    /// correct itself; only transport-level LLM failures and an exhausted
    /// turn budget abort the session.
    pub async fn run(&self, system: &str, user: &str) -> Result<SessionOutcome, AgentError> {
        let mut messages = vec![
            Message::System(system.to_string()),
            Message::User(user.to_string()),
        ];
        let mut tokens_used: u64 = 0;

        for turn in 1..=self.max_turns {
            let response = self.client.invoke(&messages).await?;
            if let Some(usage) = response.usage {
                tokens_used += u64::from(usage.total_tokens);
            }

            if response.tool_calls.is_empty() {
                debug!(turn, tokens_used, "session complete");
                return Ok(SessionOutcome {
                    final_text: response.content,
                    tokens_used,
                    turns: turn,
                });
            }

            messages.push(Message::Assistant(response.content));
            for call in response.tool_calls {
                let args = parse_arguments(&call.arguments);
                debug!(turn, tool = %call.name, "tool call");
                let observation = match self.registry.call(&call.name, args).await {
                    Ok(text) => text,
                    Err(e) => format!("Error: {e}\nPlease fix your mistakes."),
                };
                messages.push(Message::User(format!(
                    "Tool {} returned: {}",
                    call.name,
                    truncate(&observation, MAX_OBSERVATION_CHARS)
                )));
            }
        }

        warn!(max_turns = self.max_turns, "session exhausted its turn budget");
        Err(AgentError::ExecutionFailed(format!(
            "session exceeded {} turns",
            self.max_turns
        )))
    }
}

/// Parses ToolCall.arguments to JSON, tolerating empty and double-encoded strings.
fn parse_arguments(arguments: &str) -> serde_json::Value {
    let raw = if arguments.trim().is_empty() {
        serde_json::json!({})
    } else {
        match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "tool arguments JSON parse failed, using empty object");
                serde_json::json!({})
            }
        }
    };
    if let Some(s) = raw.as_str() {
        serde_json::from_str(s).unwrap_or(raw)
    } else {
        raw
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.len() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push_str("\n[truncated]");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::agents::llm::{LlmResponse, LlmUsage, ToolCall};
    use crate::agents::tools::{Tool, ToolError, ToolSpec};

    /// First invoke returns a tool call; second returns a final answer.
    struct TwoStepLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for TwoStepLlm {
        async fn invoke(&self, messages: &[Message]) -> Result<LlmResponse, AgentError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(LlmResponse {
                    content: "checking".into(),
                    tool_calls: vec![ToolCall {
                        name: "echo".into(),
                        arguments: r#"{"text":"ping"}"#.into(),
                        id: Some("call-1".into()),
                    }],
                    usage: Some(LlmUsage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                        total_tokens: 15,
                    }),
                })
            } else {
                // The observation from the echo tool must be in the transcript.
                assert!(messages
                    .iter()
                    .any(|m| matches!(m, Message::User(s) if s.contains("echo returned: ping"))));
                Ok(LlmResponse {
                    content: "done".into(),
                    tool_calls: vec![],
                    usage: Some(LlmUsage {
                        prompt_tokens: 20,
                        completion_tokens: 5,
                        total_tokens: 25,
                    }),
                })
            }
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".into(),
                description: None,
                input_schema: serde_json::json!({}),
            }
        }
        async fn call(&self, args: serde_json::Value) -> Result<String, ToolError> {
            Ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    /// **Scenario**: The loop executes tool calls, feeds observations back,
    /// and accumulates usage across turns.
    #[tokio::test]
    async fn tool_loop_runs_to_final_answer() {
        let session = LlmSession::new(
            Arc::new(TwoStepLlm {
                calls: AtomicUsize::new(0),
            }),
            ToolRegistry::new(vec![Arc::new(EchoTool)]),
            5,
        );
        let outcome = session.run("system", "user").await.unwrap();
        assert_eq!(outcome.final_text, "done");
        assert_eq!(outcome.turns, 2);
        assert_eq!(outcome.tokens_used, 40);
    }

    /// **Scenario**: A model that never stops calling tools exhausts the
    /// turn budget and errors.
    #[tokio::test]
    async fn turn_budget_enforced() {
        struct LoopingLlm;
        #[async_trait]
        impl LlmClient for LoopingLlm {
            async fn invoke(&self, _messages: &[Message]) -> Result<LlmResponse, AgentError> {
                Ok(LlmResponse {
                    content: String::new(),
                    tool_calls: vec![ToolCall {
                        name: "echo".into(),
                        arguments: "{}".into(),
                        id: None,
                    }],
                    usage: None,
                })
            }
        }
        let session = LlmSession::new(
            Arc::new(LoopingLlm),
            ToolRegistry::new(vec![Arc::new(EchoTool)]),
            3,
        );
        let err = session.run("s", "u").await.unwrap_err();
        assert!(err.to_string().contains("exceeded 3 turns"));
    }

    /// **Scenario**: Double-encoded tool arguments are tolerated.
    #[test]
    fn argument_parsing_tolerates_double_encoding() {
        assert_eq!(parse_arguments(""), serde_json::json!({}));
        assert_eq!(
            parse_arguments(r#"{"a":1}"#),
            serde_json::json!({"a": 1})
        );
        assert_eq!(
            parse_arguments(r#""{\"a\":1}""#),
            serde_json::json!({"a": 1})
        );
    }
}
