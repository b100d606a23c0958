//! Persistent `claude` subprocess speaking the stream-json protocol.
//!
//! One long-lived process per agent. Prompts go in as NDJSON user events on
//! stdin; replies come back as a stream of events on stdout, terminated by a
//! `result` event per exchange. The startup handshake waits for the initial
//! `system` event carrying a `session_id` before the first send; an `error`
//! event before init is fatal.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AgentProcess, BackendError, BackendSettings, STRIPPED_ENV};

/// Hard bound on waiting for the `result` event of one send. On expiry the
/// process is killed and the failure surfaces to the caller.
const RESULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Bound on the startup handshake (`system` event with a session id).
const INIT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ClaudeStreamProcess {
    settings: BackendSettings,
    session: Mutex<Option<StreamSession>>,
}

struct StreamSession {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    session_id: String,
}

impl StreamSession {
    async fn kill(mut self) {
        let _ = self.child.kill().await;
    }
}

impl ClaudeStreamProcess {
    pub fn new(settings: BackendSettings) -> Self {
        Self {
            settings,
            session: Mutex::new(None),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("claude");
        cmd.args([
            "--print",
            "--verbose",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--no-session-persistence",
            "--dangerously-skip-permissions",
        ]);

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
            .stderr(Stdio::null())
            .kill_on_drop(true);

        for var in STRIPPED_ENV {
            cmd.env_remove(var);
        }

        cmd
    }

    /// Spawn the subprocess and run the init handshake.
    async fn start_session(&self) -> Result<StreamSession, BackendError> {
        let mut child = self
            .command()
            .spawn()
            .map_err(|e| BackendError::ProcessStart(format!("claude: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::ProcessStart("claude: no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::ProcessStart("claude: no stdout pipe".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let handshake = async {
            loop {
                let line = lines
                    .next_line()
                    .await
                    .map_err(|e| BackendError::ProcessStart(format!("reading init event: {e}")))?;
                let Some(line) = line else {
                    return Err(BackendError::ProcessStart(
                        "claude exited before the init event".to_string(),
                    ));
                };
                match parse_event(&line) {
                    StreamEvent::System { session_id: Some(id) } => return Ok(id),
                    StreamEvent::Error { message } => {
                        return Err(BackendError::ProcessStart(format!(
                            "claude init failed: {message}"
                        )));
                    }
                    _ => {}
                }
            }
        };

        let session_id = match tokio::time::timeout(INIT_TIMEOUT, handshake).await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(BackendError::ProcessStart(
                    "claude init handshake timed out".to_string(),
                ));
            }
        };

        debug!(session_id = %session_id, "claude stream session started");
        Ok(StreamSession { child, stdin, lines, session_id })
    }

    /// One prompt/result exchange over an established session.
    async fn exchange(
        session: &mut StreamSession,
        cancel: &CancellationToken,
        prompt: &str,
    ) -> Result<String, BackendError> {
        let event = json!({
            "type": "user",
            "message": { "role": "user", "content": prompt },
        });
        let write = async {
            session.stdin.write_all(event.to_string().as_bytes()).await?;
            session.stdin.write_all(b"\n").await?;
            session.stdin.flush().await
        };
        write
            .await
            .map_err(|e| BackendError::Transient(format!("writing to claude: {e}")))?;

        let read_result = async {
            loop {
                let line = session
                    .lines
                    .next_line()
                    .await
                    .map_err(|e| BackendError::Transient(format!("reading from claude: {e}")))?;
                let Some(line) = line else {
                    return Err(BackendError::Transient("claude stream closed".to_string()));
                };
                match parse_event(&line) {
                    StreamEvent::Result { result, is_error } => {
                        let text = result.unwrap_or_default();
                        if is_error {
                            return Err(BackendError::classify(text));
                        }
                        return Ok(text);
                    }
                    StreamEvent::Error { message } => {
                        return Err(BackendError::classify(message));
                    }
                    _ => {}
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(BackendError::Cancelled),
            outcome = tokio::time::timeout(RESULT_TIMEOUT, read_result) => match outcome {
                Ok(inner) => inner,
                Err(_) => Err(BackendError::Transient(
                    "timed out waiting for a result event".to_string(),
                )),
            },
        }
    }
}

#[async_trait]
impl AgentProcess for ClaudeStreamProcess {
    async fn send(&self, cancel: &CancellationToken, prompt: &str) -> Result<String, BackendError> {
        let mut guard = self.session.lock().await;

        if guard.is_none() {
            *guard = Some(self.start_session().await?);
        }

        let outcome = {
            let session = guard.as_mut().expect("session just ensured");
            Self::exchange(session, cancel, prompt).await
        };

        if outcome.is_err() {
            // A failed exchange leaves the stream in an unknown state; kill
            // the process so the next send re-handshakes from scratch.
            if let Some(session) = guard.take() {
                warn!(session_id = %session.session_id, "dropping claude stream session after error");
                session.kill().await;
            }
        }
        outcome
    }

    async fn reset(&self) -> Result<(), BackendError> {
        if let Some(session) = self.session.lock().await.take() {
            debug!(session_id = %session.session_id, "resetting claude stream session");
            session.kill().await;
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.kill().await;
        }
    }
}

// ── stream-json events ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    System {
        #[serde(default)]
        session_id: Option<String>,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    Error {
        #[serde(default, alias = "error")]
        message: String,
    },
    #[serde(other)]
    Other,
}

fn parse_event(line: &str) -> StreamEvent {
    match serde_json::from_str(line) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, line, "unparseable stream-json event");
            StreamEvent::Other
        }
    }
}
