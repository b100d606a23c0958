//! Typed configuration, loaded from `<data_dir>/config.json`.
//!
//! Every field has a serde default so a partial config file works; an empty
//! or missing file yields a usable local-only setup (no repos, no API
//! throttle, claude CLI backend).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backend::ProviderKind;

pub const CONFIG_FILE: &str = "config.json";
pub const DEFAULT_DATA_DIR: &str = ".madflow";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub agents: AgentsConfig,
    pub sync: SyncConfig,

    /// Where chatlog, issues, and memos live. Normally injected from the
    /// CLI rather than the file itself.
    #[serde(skip)]
    pub data_dir: PathBuf,
}

impl Config {
    /// Load from `<data_dir>/config.json`; a missing file is the default
    /// configuration.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str::<Config>(&content)?
        } else {
            Config::default()
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    pub fn chatlog_path(&self) -> PathBuf {
        self.data_dir.join("chatlog.txt")
    }

    pub fn issues_dir(&self) -> PathBuf {
        self.data_dir.join("issues")
    }

    pub fn memos_dir(&self) -> PathBuf {
        self.data_dir.join("memos")
    }

    pub fn reset_interval(&self) -> Duration {
        Duration::from_secs(self.agents.reset_interval_minutes * 60)
    }

    pub fn bash_timeout(&self) -> Option<Duration> {
        self.agents.bash_timeout_seconds.map(Duration::from_secs)
    }

    pub fn authorized_users(&self) -> HashSet<String> {
        self.sync.authorized_users.iter().cloned().collect()
    }

    pub fn github_token(&self) -> Option<String> {
        std::env::var(&self.sync.github_token_env).ok().filter(|t| !t.is_empty())
    }

    /// Write the starter config template; returns the written path.
    pub fn write_default_template(data_dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(CONFIG_FILE);

        let template = serde_json::json!({
            "provider": {
                "kind": "claude-cli",
                "model": null
            },
            "agents": {
                "maxTeams": 4,
                "resetIntervalMinutes": 8,
                "requestsPerMinute": 0,
                "workdir": "."
            },
            "sync": {
                "repos": [],
                "intervalSeconds": 60,
                "idleIntervalSeconds": 300,
                "idleThresholdSeconds": 300,
                "dormancyThresholdSeconds": 0,
                "eventsIntervalSeconds": 60,
                "authorizedUsers": []
            }
        });

        std::fs::write(&path, serde_json::to_string_pretty(&template)?)?;
        Ok(path)
    }

    /// Collect every configuration problem at once.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for repo in &self.sync.repos {
            if repo.split('/').filter(|part| !part.is_empty()).count() != 2 {
                errors.push(format!("sync.repos entry '{repo}' is not owner/repo"));
            }
        }
        if self.agents.reset_interval_minutes == 0 {
            errors.push("agents.resetIntervalMinutes must be at least 1".to_string());
        }
        if !self.agents.workdir.is_empty() && !Path::new(&self.agents.workdir).exists() {
            errors.push(format!("agents.workdir '{}' does not exist", self.agents.workdir));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// ── Provider ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Model identifier; each backend has its own default.
    pub model: Option<String>,
    /// Comma-separated tool allowlist for the CLI backends.
    pub allowed_tools: Vec<String>,
    /// Per-send spend cap for the CLI backends.
    pub max_budget_usd: Option<f64>,
}

// ── Agents ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentsConfig {
    /// Engineer team cap; non-positive falls back to the built-in default.
    pub max_teams: i64,
    pub reset_interval_minutes: u64,
    pub bash_timeout_seconds: Option<u64>,
    /// Provider-wide request budget; 0 disables throttling.
    pub requests_per_minute: i64,
    /// Directory the agents work in.
    pub workdir: String,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_teams: 4,
            reset_interval_minutes: 8,
            bash_timeout_seconds: None,
            requests_per_minute: 0,
            workdir: ".".to_string(),
        }
    }
}

// ── Sync ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// `owner/repo` entries to mirror.
    pub repos: Vec<String>,
    pub interval_seconds: u64,
    pub idle_interval_seconds: u64,
    pub idle_threshold_seconds: u64,
    /// 0 disables dormancy.
    pub dormancy_threshold_seconds: u64,
    pub events_interval_seconds: u64,
    /// Accounts whose tickets start work without approval. Empty set
    /// approves everyone.
    pub authorized_users: Vec<String>,
    /// Environment variable holding the API token.
    pub github_token_env: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            repos: Vec::new(),
            interval_seconds: 60,
            idle_interval_seconds: 300,
            idle_threshold_seconds: 300,
            dormancy_threshold_seconds: 0,
            events_interval_seconds: 60,
            authorized_users: Vec::new(),
            github_token_env: "GITHUB_TOKEN".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.agents.max_teams, 4);
        assert_eq!(config.agents.reset_interval_minutes, 8);
        assert_eq!(config.sync.interval_seconds, 60);
        assert_eq!(config.sync.github_token_env, "GITHUB_TOKEN");
        assert!(matches!(config.provider.kind, ProviderKind::ClaudeCli));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.agents.max_teams, 4);
        assert_eq!(config.data_dir, dir.path());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{
                "provider": {"kind": "anthropic-api", "model": "claude-sonnet-4-5"},
                "agents": {"maxTeams": 2, "requestsPerMinute": 30},
                "sync": {"repos": ["acme/widgets"], "authorizedUsers": ["alice"]}
            }"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert!(matches!(config.provider.kind, ProviderKind::AnthropicApi));
        assert_eq!(config.provider.model.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(config.agents.max_teams, 2);
        assert_eq!(config.agents.requests_per_minute, 30);
        assert_eq!(config.sync.repos, vec!["acme/widgets".to_string()]);
        assert!(config.authorized_users().contains("alice"));
        // Untouched sections keep their defaults.
        assert_eq!(config.sync.interval_seconds, 60);
    }

    #[test]
    fn test_template_roundtrips() {
        let dir = TempDir::new().unwrap();
        let path = Config::write_default_template(dir.path()).unwrap();
        assert!(path.exists());
        let config = Config::load(dir.path()).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.sync.repos = vec!["not-a-repo".to_string(), "also/bad/path".to_string()];
        config.agents.reset_interval_minutes = 0;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}
