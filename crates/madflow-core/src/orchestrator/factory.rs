//! Production agent factory: builds agent runtimes from the configuration.
//!
//! One factory instance serves both the superintendent (built once at
//! startup) and every engineer the team manager asks for. Each agent gets
//! its own backend process; the throttle and dormancy handles are shared
//! across all of them because they guard the same provider.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::agent::id::AgentId;
use crate::agent::prompt::role_preamble;
use crate::agent::{AgentConfig, AgentRuntime};
use crate::backend::{self, BackendSettings, ProviderKind};
use crate::config::Config;
use crate::dormancy::Dormancy;
use crate::issue::store::IssueStore;
use crate::team::EngineerFactory;
use crate::throttle::Throttle;

pub struct AgentFactory {
    provider: ProviderKind,
    model: Option<String>,
    allowed_tools: Vec<String>,
    max_budget_usd: Option<f64>,
    workdir: PathBuf,
    bash_timeout: Option<Duration>,
    chatlog_path: PathBuf,
    memos_dir: PathBuf,
    reset_interval: Duration,
    store: Arc<dyn IssueStore>,
    throttle: Option<Arc<Throttle>>,
    dormancy: Option<Arc<Dormancy>>,
    client: reqwest::Client,
}

impl AgentFactory {
    pub fn from_config(
        config: &Config,
        store: Arc<dyn IssueStore>,
        throttle: Option<Arc<Throttle>>,
        dormancy: Option<Arc<Dormancy>>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            provider: config.provider.kind,
            model: config.provider.model.clone(),
            allowed_tools: config.provider.allowed_tools.clone(),
            max_budget_usd: config.provider.max_budget_usd,
            workdir: PathBuf::from(&config.agents.workdir),
            bash_timeout: config.bash_timeout(),
            chatlog_path: config.chatlog_path(),
            memos_dir: config.memos_dir(),
            reset_interval: config.reset_interval(),
            store,
            throttle,
            dormancy,
            client,
        }
    }

    pub fn build_superintendent(&self) -> anyhow::Result<Arc<AgentRuntime>> {
        self.build_runtime(AgentId::superintendent(), None)
    }

    fn build_runtime(
        &self,
        id: AgentId,
        initial_task: Option<String>,
    ) -> anyhow::Result<Arc<AgentRuntime>> {
        let preamble = role_preamble(id.role);
        let settings = BackendSettings {
            system_prompt: preamble.to_string(),
            model: self.model.clone(),
            workdir: self.workdir.clone(),
            bash_timeout: self.bash_timeout,
            allowed_tools: self.allowed_tools.clone(),
            max_budget_usd: self.max_budget_usd,
        };
        let process = backend::build(self.provider, settings, self.client.clone())?;

        let config = AgentConfig {
            id,
            role_preamble: preamble.to_string(),
            chatlog_path: self.chatlog_path.clone(),
            memos_dir: self.memos_dir.clone(),
            reset_interval: self.reset_interval,
            initial_task,
        };
        Ok(Arc::new(AgentRuntime::new(
            config,
            process,
            self.throttle.clone(),
            self.dormancy.clone(),
        )))
    }

    /// Text of the engineer's original task, from the issue when available.
    fn task_for(&self, issue_id: &str) -> Option<String> {
        if issue_id.is_empty() {
            return None;
        }
        match self.store.get(issue_id) {
            Ok(Some(issue)) if issue.body.is_empty() => {
                Some(format!("issue {}: {}", issue.id, issue.title))
            }
            Ok(Some(issue)) => {
                Some(format!("issue {}: {}\n\n{}", issue.id, issue.title, issue.body))
            }
            _ => Some(format!("issue {issue_id} を担当してください")),
        }
    }
}

#[async_trait]
impl EngineerFactory for AgentFactory {
    async fn build(&self, team_num: u32, issue_id: &str) -> anyhow::Result<Arc<AgentRuntime>> {
        let task = self.task_for(issue_id);
        self.build_runtime(AgentId::engineer(team_num), task)
    }
}
