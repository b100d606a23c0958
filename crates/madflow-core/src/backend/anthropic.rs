//! Anthropic Messages API backend with an explicit bash tool loop.
//!
//! Session state is the message history, re-sent on every turn. One `send`
//! runs up to [`MAX_TURNS`] API round-trips: each `tool_use` block in the
//! response is executed through the bash tool and fed back as a
//! `tool_result`; a response with no tool calls ends the exchange.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::bash::BashTool;
use super::{is_rate_limit_text, AgentProcess, BackendError, BackendSettings};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const MAX_TOKENS: u32 = 8192;

/// Turn cap for one send's agentic loop.
const MAX_TURNS: usize = 20;

pub struct AnthropicProcess {
    client: Client,
    api_key: String,
    model: String,
    system_prompt: String,
    bash: BashTool,
    history: Mutex<Vec<ApiMessage>>,
}

impl AnthropicProcess {
    pub fn new(settings: BackendSettings, api_key: String, client: Client) -> Self {
        let bash = BashTool::new(settings.workdir.clone(), settings.bash_timeout);
        Self {
            client,
            api_key,
            model: settings.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_prompt: settings.system_prompt,
            bash,
            history: Mutex::new(Vec::new()),
        }
    }

    fn bash_tool_definition() -> Value {
        json!({
            "name": "bash",
            "description": "Execute a shell command in the working directory and return its combined output.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to execute"
                    }
                },
                "required": ["command"]
            }
        })
    }

    async fn call_api(&self, messages: &[ApiMessage]) -> Result<ApiResponse, BackendError> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": messages,
            "tools": [Self::bash_tool_definition()],
        });
        if !self.system_prompt.is_empty() {
            body["system"] = json!(self.system_prompt);
        }

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transient(format!("anthropic request: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Transient(format!("anthropic response body: {e}")))?;

        if !status.is_success() {
            if status.as_u16() == 429 || is_rate_limit_text(&text) {
                return Err(BackendError::RateLimit(format!("anthropic {status}: {text}")));
            }
            return Err(BackendError::Transient(format!("anthropic {status}: {text}")));
        }

        serde_json::from_str(&text)
            .map_err(|e| BackendError::Transient(format!("parsing anthropic response: {e}")))
    }
}

#[async_trait]
impl AgentProcess for AnthropicProcess {
    async fn send(&self, cancel: &CancellationToken, prompt: &str) -> Result<String, BackendError> {
        let mut history = self.history.lock().await;
        history.push(ApiMessage::user_text(prompt));

        let mut last_text = String::new();

        for turn in 1..=MAX_TURNS {
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                response = self.call_api(&history) => response?,
            };

            let text: String = response
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            if !text.is_empty() {
                last_text = text;
            }

            let tool_uses: Vec<(String, String)> = response
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { id, name, input } if name == "bash" => {
                        let command = input
                            .get("command")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        Some((id.clone(), command))
                    }
                    _ => None,
                })
                .collect();

            history.push(ApiMessage {
                role: "assistant".to_string(),
                content: response.content,
            });

            if tool_uses.is_empty() {
                debug!(turns = turn, "anthropic exchange finished");
                return Ok(last_text);
            }

            let mut results = Vec::with_capacity(tool_uses.len());
            for (id, command) in tool_uses {
                let output = self.bash.run(&command).await;
                results.push(ContentBlock::ToolResult {
                    tool_use_id: id,
                    content: output,
                });
            }
            history.push(ApiMessage {
                role: "user".to_string(),
                content: results,
            });
        }

        warn!(turns = MAX_TURNS, "anthropic tool loop hit its turn cap");
        Err(BackendError::MaxIterations { partial: last_text })
    }

    async fn reset(&self) -> Result<(), BackendError> {
        self.history.lock().await.clear();
        Ok(())
    }

    async fn close(&self) {}
}

// ── Messages API wire types ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: Vec<ContentBlock>,
}

impl ApiMessage {
    fn user_text(text: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: vec![ContentBlock::Text { text: text.to_string() }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    #[allow(dead_code)]
    stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let raw = r#"{
            "content": [
                {"type": "text", "text": "running it"},
                {"type": "tool_use", "id": "tu_1", "name": "bash", "input": {"command": "ls"}}
            ],
            "stop_reason": "tool_use"
        }"#;
        let resp: ApiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.content.len(), 2);
        assert!(matches!(&resp.content[0], ContentBlock::Text { text } if text == "running it"));
        assert!(matches!(
            &resp.content[1],
            ContentBlock::ToolUse { name, .. } if name == "bash"
        ));
    }

    #[test]
    fn test_tool_result_serialization() {
        let msg = ApiMessage {
            role: "user".to_string(),
            content: vec![ContentBlock::ToolResult {
                tool_use_id: "tu_1".to_string(),
                content: "ok".to_string(),
            }],
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["content"][0]["type"], "tool_result");
        assert_eq!(value["content"][0]["tool_use_id"], "tu_1");
    }
}
