//! Gemini generateContent backend with an explicit bash tool loop.
//!
//! Same shape as the Anthropic backend: history re-sent per turn, bash
//! function calls executed locally, up to [`MAX_TURNS`] round-trips per send.
//! Gemini models drift towards describing commands instead of calling the
//! tool, so every prompt gets a hard preamble demanding tool use.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::bash::BashTool;
use super::{is_rate_limit_text, AgentProcess, BackendError, BackendSettings};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_MODEL: &str = "gemini-2.5-pro";
const MAX_OUTPUT_TOKENS: u32 = 65536;

/// Turn cap for one send's agentic loop.
const MAX_TURNS: usize = 25;

/// Prepended to every prompt.
const TOOL_PREAMBLE: &str =
    "Use the bash tool for all side effects. Never describe a command instead of running it.";

pub struct GeminiProcess {
    client: Client,
    api_key: String,
    model: String,
    system_prompt: String,
    bash: BashTool,
    history: Mutex<Vec<Content>>,
}

impl GeminiProcess {
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

    fn bash_declaration() -> Value {
        json!({
            "name": "bash",
            "description": "Execute a shell command in the working directory and return its combined output.",
            "parameters": {
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

    async fn call_api(&self, contents: &[Content]) -> Result<GenerateResponse, BackendError> {
        let url = format!(
            "{API_BASE}/{model}:generateContent?key={key}",
            model = self.model,
            key = self.api_key
        );

        let mut body = json!({
            "contents": contents,
            "tools": [{ "function_declarations": [Self::bash_declaration()] }],
            "generation_config": { "maxOutputTokens": MAX_OUTPUT_TOKENS },
        });
        if !self.system_prompt.is_empty() {
            body["system_instruction"] = json!({ "parts": [{ "text": self.system_prompt }] });
        }

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transient(format!("gemini request: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Transient(format!("gemini response body: {e}")))?;

        if !status.is_success() {
            if status.as_u16() == 429 || is_rate_limit_text(&text) {
                return Err(BackendError::RateLimit(format!("gemini {status}: {text}")));
            }
            return Err(BackendError::Transient(format!("gemini {status}: {text}")));
        }

        serde_json::from_str(&text)
            .map_err(|e| BackendError::Transient(format!("parsing gemini response: {e}")))
    }
}

#[async_trait]
impl AgentProcess for GeminiProcess {
    async fn send(&self, cancel: &CancellationToken, prompt: &str) -> Result<String, BackendError> {
        let mut history = self.history.lock().await;
        history.push(Content {
            role: "user".to_string(),
            parts: vec![Part::text(format!("{TOOL_PREAMBLE}\n\n{prompt}"))],
        });

        let mut last_text = String::new();

        for turn in 1..=MAX_TURNS {
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                response = self.call_api(&history) => response?,
            };

            let content = response
                .candidates
                .into_iter()
                .next()
                .and_then(|c| c.content)
                .ok_or_else(|| {
                    BackendError::Transient("gemini returned no candidates".to_string())
                })?;

            let text: String = content
                .parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n");
            if !text.is_empty() {
                last_text = text;
            }

            let calls: Vec<FunctionCall> = content
                .parts
                .iter()
                .filter_map(|part| part.function_call.clone())
                .filter(|call| call.name == "bash")
                .collect();

            history.push(Content {
                role: "model".to_string(),
                parts: content.parts,
            });

            if calls.is_empty() {
                debug!(turns = turn, "gemini exchange finished");
                return Ok(last_text);
            }

            let mut parts = Vec::with_capacity(calls.len());
            for call in calls {
                let command = call
                    .args
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let output = self.bash.run(command).await;
                parts.push(Part::function_response(&call.name, output));
            }
            history.push(Content {
                role: "user".to_string(),
                parts,
            });
        }

        warn!(turns = MAX_TURNS, "gemini tool loop hit its turn cap");
        Err(BackendError::MaxIterations { partial: last_text })
    }

    async fn reset(&self) -> Result<(), BackendError> {
        self.history.lock().await.clear();
        Ok(())
    }

    async fn close(&self) {}
}

// ── generateContent wire types ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "functionCall", skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(rename = "functionResponse", skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: String) -> Self {
        Self { text: Some(text), ..Default::default() }
    }

    fn function_response(name: &str, output: String) -> Self {
        Self {
            function_response: Some(FunctionResponse {
                name: name.to_string(),
                response: json!({ "output": output }),
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_with_function_call() {
        let raw = r#"{
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "checking"},
                        {"functionCall": {"name": "bash", "args": {"command": "pwd"}}}
                    ]
                }
            }]
        }"#;
        let resp: GenerateResponse = serde_json::from_str(raw).unwrap();
        let content = resp.candidates[0].content.as_ref().unwrap();
        assert_eq!(content.parts.len(), 2);
        let call = content.parts[1].function_call.as_ref().unwrap();
        assert_eq!(call.name, "bash");
        assert_eq!(call.args["command"], "pwd");
    }

    #[test]
    fn test_function_response_serialization() {
        let part = Part::function_response("bash", "done".to_string());
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["functionResponse"]["name"], "bash");
        assert_eq!(value["functionResponse"]["response"]["output"], "done");
        assert!(value.get("text").is_none());
    }
}
