//! One-shot `claude` subprocess backend.
//!
//! Each `send` forks a fresh `claude --print` process, writes the prompt to
//! its stdin, and waits for it to exit. The subprocess runs its own tool
//! loop; we only classify the outcome. No session survives between calls,
//! so `reset` is a no-op.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{AgentProcess, BackendError, BackendSettings, STRIPPED_ENV};

pub struct ClaudeCliProcess {
    settings: BackendSettings,
}

impl ClaudeCliProcess {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("claude");
        cmd.args(["--print", "--output-format", "text", "--dangerously-skip-permissions"]);

        if !self.settings.system_prompt.is_empty() {
            cmd.args(["--system-prompt", &self.settings.system_prompt]);
        }
        if let Some(ref model) = self.settings.model {
            cmd.args(["--model", model]);
        }
        if !self.settings.allowed_tools.is_empty() {
            cmd.args(["--allowedTools", &self.settings.allowed_tools.join(",")]);
        }
        if let Some(budget) = self.settings.max_budget_usd {
            cmd.args(["--max-budget-usd", &format!("{:.2}", budget)]);
        }

        cmd.current_dir(&self.settings.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Allow `claude` to run inside a session started by `claude`.
        for var in STRIPPED_ENV {
            cmd.env_remove(var);
        }

        cmd
    }
}

#[async_trait]
impl AgentProcess for ClaudeCliProcess {
    async fn send(&self, cancel: &CancellationToken, prompt: &str) -> Result<String, BackendError> {
        let mut child = self
            .command()
            .spawn()
            .map_err(|e| BackendError::ProcessStart(format!("claude: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::ProcessStart("claude: no stdin pipe".to_string()))?;
        stdin
            .write_all(prompt.as_bytes())
            .await
            .map_err(|e| BackendError::Transient(format!("writing prompt: {e}")))?;
        drop(stdin);

        // kill_on_drop reaps the child if we bail out on cancellation.
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            output = child.wait_with_output() => {
                output.map_err(|e| BackendError::Transient(format!("waiting for claude: {e}")))?
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if output.status.success() {
            debug!(reply_len = stdout.len(), "claude subprocess finished");
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr.trim().to_string() };
        Err(BackendError::classify(format!(
            "claude exited with {}: {detail}",
            output.status
        )))
    }

    async fn reset(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn which_claude() -> Option<PathBuf> {
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join("claude"))
            .find(|candidate| candidate.is_file())
    }

    /// An unlaunchable executable must surface as the permanent
    /// process-start error, not as a retryable one.
    #[tokio::test]
    async fn test_missing_binary_is_process_start() {
        if which_claude().is_some() {
            // Machine has a real `claude`; nothing to assert here.
            return;
        }
        let process = ClaudeCliProcess::new(BackendSettings {
            workdir: PathBuf::from("."),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let err = process.send(&cancel, "hello").await.unwrap_err();
        assert!(matches!(err, BackendError::ProcessStart(_)));
    }
}
