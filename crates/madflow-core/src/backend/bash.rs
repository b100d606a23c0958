//! Bash tool executor shared by the HTTP backends.
//!
//! Runs one shell command in the agent's working directory with a timeout
//! and returns combined output. Failures are reported as output text, never
//! as errors — the model reads them and decides what to do next.

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_OUTPUT_BYTES: usize = 50_000;

#[derive(Debug, Clone)]
pub struct BashTool {
    workdir: PathBuf,
    timeout: Duration,
}

impl BashTool {
    pub fn new(workdir: PathBuf, timeout: Option<Duration>) -> Self {
        Self {
            workdir,
            timeout: timeout.unwrap_or(DEFAULT_TIMEOUT),
        }
    }

    /// Execute `command` under `sh -c` and return its output.
    pub async fn run(&self, command: &str) -> String {
        debug!(command, workdir = %self.workdir.display(), "executing bash tool call");

        let result = tokio::time::timeout(
            self.timeout,
            Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.workdir)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let exit_code = output.status.code().unwrap_or(-1);

                let mut combined = String::new();
                if !stdout.is_empty() {
                    combined.push_str(&stdout);
                }
                if !stderr.is_empty() {
                    if !combined.is_empty() {
                        combined.push('\n');
                    }
                    combined.push_str("[stderr]\n");
                    combined.push_str(&stderr);
                }
                if exit_code != 0 {
                    combined.push_str(&format!("\n[exit code: {}]", exit_code));
                }

                if combined.is_empty() {
                    "(no output)".into()
                } else if combined.len() > MAX_OUTPUT_BYTES {
                    let cut = combined
                        .char_indices()
                        .take_while(|(i, _)| *i < MAX_OUTPUT_BYTES)
                        .last()
                        .map(|(i, c)| i + c.len_utf8())
                        .unwrap_or(0);
                    format!(
                        "{}\n\n... (truncated, {} total bytes)",
                        &combined[..cut],
                        combined.len()
                    )
                } else {
                    combined
                }
            }
            Ok(Err(e)) => format!("Error executing command: {}", e),
            Err(_) => format!(
                "Error: command timed out after {} seconds",
                self.timeout.as_secs()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> BashTool {
        BashTool::new(std::env::temp_dir(), Some(Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let out = tool().run("echo hello").await;
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_reports_stderr_and_exit_code() {
        let out = tool().run("echo oops >&2; exit 3").await;
        assert!(out.contains("[stderr]"));
        assert!(out.contains("oops"));
        assert!(out.contains("[exit code: 3]"));
    }

    #[tokio::test]
    async fn test_empty_output_marker() {
        let out = tool().run("true").await;
        assert_eq!(out, "(no output)");
    }

    #[tokio::test]
    async fn test_timeout() {
        let tool = BashTool::new(std::env::temp_dir(), Some(Duration::from_millis(100)));
        let out = tool.run("sleep 5").await;
        assert!(out.contains("timed out"));
    }
}
