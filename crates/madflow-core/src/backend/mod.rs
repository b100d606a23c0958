//! Backend processes: the "send one prompt, get one reply" contract.
//!
//! A backend may internally run an agentic tool-use loop (the model calls a
//! bash tool, the backend executes it and feeds the output back), but to the
//! agent runtime every variant looks the same: [`AgentProcess::send`] takes a
//! prompt and eventually yields text or a classified [`BackendError`].
//!
//! Four variants:
//! - [`claude_cli`] — one `claude` subprocess per call
//! - [`claude_stream`] — a persistent `claude` subprocess speaking stream-json
//! - [`anthropic`] — the Anthropic Messages API with an explicit bash loop
//! - [`gemini`] — the Gemini generateContent API with an explicit bash loop

pub mod anthropic;
pub mod bash;
pub mod claude_cli;
pub mod claude_stream;
pub mod gemini;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Substrings that mark a provider-side throttling response, matched
/// case-insensitively against error text and response bodies.
pub const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "token limit",
    "usage limit",
    "too many requests",
    "429",
    "overloaded",
    "resource_exhausted",
    "quota exceeded",
];

/// Environment variables removed from child processes so a nested `claude`
/// invocation does not refuse to start.
pub const STRIPPED_ENV: &[&str] = &["CLAUDECODE", "CLAUDE_CODE_ENTRYPOINT"];

/// True when `text` looks like a provider throttling signal.
pub fn is_rate_limit_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Classified backend failure. The variant tells the caller what to do:
/// dormancy on `RateLimit`, continuation on `MaxIterations`, no retry on
/// `ProcessStart`, backoff-retry on `Transient`.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("provider rate limited: {0}")]
    RateLimit(String),

    /// The tool-use loop hit its turn cap; carries the text produced so far.
    #[error("tool loop exhausted its turn budget")]
    MaxIterations { partial: String },

    /// The underlying executable could not be launched. Permanent.
    #[error("backend process failed to start: {0}")]
    ProcessStart(String),

    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("cancelled")]
    Cancelled,
}

impl BackendError {
    /// Classify free-form failure text: throttling markers become
    /// [`BackendError::RateLimit`], everything else is transient.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_rate_limit_text(&message) {
            Self::RateLimit(message)
        } else {
            Self::Transient(message)
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimit(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::ProcessStart(_))
    }
}

/// One supervised LLM backend.
///
/// Implementations keep any session state behind interior mutability so
/// `send` takes `&self`; the dormancy probe shares the process handle with
/// the agent's own send loop.
#[async_trait]
pub trait AgentProcess: Send + Sync {
    /// Send one prompt and return the model's final text for this exchange.
    async fn send(&self, cancel: &CancellationToken, prompt: &str) -> Result<String, BackendError>;

    /// Drop session state; the next `send` starts a fresh session.
    async fn reset(&self) -> Result<(), BackendError>;

    /// Release subprocess and network resources.
    async fn close(&self);
}

/// Which backend variant to run. Spelled the way it appears in config.json.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    ClaudeCli,
    ClaudeStream,
    AnthropicApi,
    GeminiApi,
}

impl Default for ProviderKind {
    fn default() -> Self {
        Self::ClaudeCli
    }
}

/// Creation-time settings shared by every backend variant. Immutable after
/// construction.
#[derive(Debug, Clone, Default)]
pub struct BackendSettings {
    pub system_prompt: String,
    pub model: Option<String>,
    pub workdir: PathBuf,
    pub bash_timeout: Option<Duration>,
    pub allowed_tools: Vec<String>,
    pub max_budget_usd: Option<f64>,
}

/// Build the configured backend variant.
///
/// HTTP variants read their API key from the environment
/// (`ANTHROPIC_API_KEY`, `GOOGLE_API_KEY` / `GEMINI_API_KEY`); a missing key
/// is a [`BackendError::ProcessStart`] because no amount of retrying fixes it.
pub fn build(
    kind: ProviderKind,
    settings: BackendSettings,
    client: reqwest::Client,
) -> Result<Arc<dyn AgentProcess>, BackendError> {
    match kind {
        ProviderKind::ClaudeCli => Ok(Arc::new(claude_cli::ClaudeCliProcess::new(settings))),
        ProviderKind::ClaudeStream => {
            Ok(Arc::new(claude_stream::ClaudeStreamProcess::new(settings)))
        }
        ProviderKind::AnthropicApi => {
            let key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
                BackendError::ProcessStart("ANTHROPIC_API_KEY is not set".to_string())
            })?;
            Ok(Arc::new(anthropic::AnthropicProcess::new(settings, key, client)))
        }
        ProviderKind::GeminiApi => {
            let key = std::env::var("GOOGLE_API_KEY")
                .or_else(|_| std::env::var("GEMINI_API_KEY"))
                .map_err(|_| {
                    BackendError::ProcessStart(
                        "neither GOOGLE_API_KEY nor GEMINI_API_KEY is set".to_string(),
                    )
                })?;
            Ok(Arc::new(gemini::GeminiProcess::new(settings, key, client)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_markers() {
        assert!(is_rate_limit_text("Error: Rate Limit exceeded"));
        assert!(is_rate_limit_text("HTTP 429 Too Many Requests"));
        assert!(is_rate_limit_text("RESOURCE_EXHAUSTED: quota exceeded"));
        assert!(is_rate_limit_text("the model is overloaded"));
        assert!(!is_rate_limit_text("connection reset by peer"));
        assert!(!is_rate_limit_text("no such file or directory"));
    }

    #[test]
    fn test_classify_splits_rate_limit_from_transient() {
        assert!(BackendError::classify("usage limit reached").is_rate_limit());
        assert!(matches!(
            BackendError::classify("connection refused"),
            BackendError::Transient(_)
        ));
    }

    #[test]
    fn test_only_process_start_is_permanent() {
        assert!(BackendError::ProcessStart("enoent".into()).is_permanent());
        assert!(!BackendError::Transient("x".into()).is_permanent());
        assert!(!BackendError::RateLimit("x".into()).is_permanent());
        assert!(!BackendError::Cancelled.is_permanent());
    }

    #[test]
    fn test_provider_kind_config_spelling() {
        let kind: ProviderKind = serde_json::from_str("\"anthropic-api\"").unwrap();
        assert_eq!(kind, ProviderKind::AnthropicApi);
        let kind: ProviderKind = serde_json::from_str("\"claude-stream\"").unwrap();
        assert_eq!(kind, ProviderKind::ClaudeStream);
    }
}
