//! Orchestrator: the top-level coordinator.
//!
//! Runs the superintendent agent under supervision, boots the full set of
//! engineer teams, starts the sync poller and event watcher, and then tails
//! the chatlog for directives addressed to `@orchestrator`. The
//! superintendent steers everything through those textual commands; the
//! orchestrator is the only component that mutates issue and team state in
//! response.

pub mod factory;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::id::ORCHESTRATOR_RECIPIENT;
use crate::agent::AgentRuntime;
use crate::chatlog::{Chatlog, Message};
use crate::issue::store::IssueStore;
use crate::issue::{IssueStatus, StatusFilter};
use crate::sync::events::{EventWatcher, IssueEvent};
use crate::sync::SyncPoller;
use crate::team::TeamManager;

const RESTART_DELAY: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    chatlog: Chatlog,
    store: Arc<dyn IssueStore>,
    teams: Arc<TeamManager>,
    superintendent: Arc<AgentRuntime>,
    poller: Option<SyncPoller>,
    watcher: Option<EventWatcher>,
    events_rx: Option<mpsc::Receiver<IssueEvent>>,
    restart_delay: Duration,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chatlog: Chatlog,
        store: Arc<dyn IssueStore>,
        teams: Arc<TeamManager>,
        superintendent: Arc<AgentRuntime>,
        poller: Option<SyncPoller>,
        watcher: Option<EventWatcher>,
        events_rx: mpsc::Receiver<IssueEvent>,
    ) -> Self {
        Self {
            chatlog,
            store,
            teams,
            superintendent,
            poller,
            watcher,
            events_rx: Some(events_rx),
            restart_delay: RESTART_DELAY,
        }
    }

    /// Run until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!("orchestrator starting");

        self.spawn_superintendent(cancel.clone());
        self.boot_teams(&cancel).await;

        if let Some(poller) = self.poller.take() {
            tokio::spawn(poller.run(cancel.clone()));
        }
        if let Some(watcher) = self.watcher.take() {
            tokio::spawn(watcher.run(cancel.clone()));
        }

        let mut commands = self.chatlog.watch(cancel.clone(), ORCHESTRATOR_RECIPIENT);
        let mut events_rx = self.events_rx.take().expect("run called once");
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("orchestrator stopping");
                    return Ok(());
                }
                msg = commands.recv() => match msg {
                    Some(msg) => self.handle_command(&cancel, &msg).await,
                    None => return Ok(()),
                },
                event = events_rx.recv(), if events_open => match event {
                    Some(event) => self.handle_issue_event(&event),
                    None => events_open = false,
                },
            }
        }
    }

    /// Supervise the superintendent exactly like an engineer team: one
    /// subscription, restart on crash, 5 s backoff.
    fn spawn_superintendent(&self, cancel: CancellationToken) {
        let agent = Arc::clone(&self.superintendent);
        let chatlog = self.chatlog.clone();
        let restart_delay = self.restart_delay;

        tokio::spawn(async move {
            let recipient = agent.id().to_string();
            let mut subscription = chatlog.watch(cancel.clone(), &recipient);
            loop {
                let result = agent.run(&cancel, &mut subscription).await;
                if cancel.is_cancelled() {
                    return;
                }
                match result {
                    Ok(()) => warn!("superintendent run ended, restarting"),
                    Err(e) => warn!(error = %e, "superintendent crashed, restarting"),
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(restart_delay) => {}
                }
            }
        });
    }

    /// Boot one team per assignable issue, then fill the remaining slots
    /// with standby teams. Pending-approval issues are skipped.
    async fn boot_teams(&self, cancel: &CancellationToken) {
        let assignable = match self.store.list(StatusFilter::any()) {
            Ok(issues) => issues
                .into_iter()
                .filter(|issue| issue.status.is_active() && !issue.pending_approval)
                .collect::<Vec<_>>(),
            Err(e) => {
                warn!(error = %e, "listing issues at boot failed");
                Vec::new()
            }
        };

        let max = self.teams.max_teams();
        for issue in assignable.iter().take(max) {
            if let Err(e) = self.create_team_for(cancel, &issue.id).await {
                warn!(issue = %issue.id, error = %e, "boot team creation failed");
            }
        }

        while self.teams.count() < max {
            match self.teams.create(cancel, "").await {
                Ok(num) => info!(team = num, "standby team started"),
                Err(e) => {
                    warn!(error = %e, "standby team creation failed");
                    break;
                }
            }
        }
    }

    /// Create a team bound to `issue_id` and persist the assignment.
    async fn create_team_for(
        &self,
        cancel: &CancellationToken,
        issue_id: &str,
    ) -> anyhow::Result<u32> {
        let mut issue = self
            .store
            .get(issue_id)?
            .ok_or_else(|| anyhow::anyhow!("issue {issue_id} not found"))?;

        issue.status = IssueStatus::InProgress;
        let team_num = self.teams.create(cancel, issue_id).await?;
        issue.assigned_team = team_num;
        self.store.update(&issue)?;
        Ok(team_num)
    }

    /// Dispatch one directive. Unknown commands are logged and ignored.
    async fn handle_command(&self, cancel: &CancellationToken, msg: &Message) {
        let body = msg.body.trim();
        let (command, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
        let rest = rest.trim();

        info!(from = %msg.sender, command, "directive received");
        match command {
            "TEAM_CREATE" => self.handle_team_create(cancel, rest).await,
            "TEAM_DISBAND" => self.handle_team_disband(rest),
            "ISSUE_CREATE" => self.handle_issue_create(rest),
            "ISSUE_CLOSE" => self.handle_issue_close(rest),
            other => info!(command = other, "ignoring unknown command"),
        }
    }

    async fn handle_team_create(&self, cancel: &CancellationToken, issue_id: &str) {
        if issue_id.is_empty() {
            self.report("TEAM_CREATE には issue id が必要です");
            return;
        }
        if self.teams.has_issue(issue_id) {
            self.report(&format!("issue {issue_id} には既にチームが割り当てられています"));
            return;
        }

        match self.store.get(issue_id) {
            Ok(Some(issue)) if issue.pending_approval => {
                self.report(&format!("issue {issue_id} は承認待ちのため着手できません"));
            }
            Ok(Some(_)) => match self.create_team_for(cancel, issue_id).await {
                Ok(num) => info!(issue = issue_id, team = num, "team created by directive"),
                Err(e) => {
                    self.report(&format!("issue {issue_id} のチーム作成に失敗しました: {e}"));
                }
            },
            Ok(None) => self.report(&format!("issue {issue_id} が見つかりません")),
            Err(e) => self.report(&format!("issue {issue_id} の読み込みに失敗しました: {e}")),
        }
    }

    fn handle_team_disband(&self, issue_id: &str) {
        if issue_id.is_empty() {
            self.report("TEAM_DISBAND には issue id が必要です");
            return;
        }
        let disbanded = self.teams.disband_by_issue(issue_id);
        if disbanded == 0 {
            self.report(&format!("issue {issue_id} のチームが見つかりません"));
        } else {
            self.report(&format!("issue {issue_id} のチームを解散しました"));
        }
    }

    fn handle_issue_create(&self, rest: &str) {
        let (title, body) = match rest.split_once('|') {
            Some((title, body)) => (title.trim(), body.trim()),
            None => (rest, ""),
        };
        if title.is_empty() {
            self.report("ISSUE_CREATE にはタイトルが必要です");
            return;
        }
        match self.store.create(title, body) {
            Ok(issue) => self.report(&format!("issue {} を作成しました: {}", issue.id, issue.title)),
            Err(e) => self.report(&format!("issue の作成に失敗しました: {e}")),
        }
    }

    fn handle_issue_close(&self, issue_id: &str) {
        if issue_id.is_empty() {
            self.report("ISSUE_CLOSE には issue id が必要です");
            return;
        }
        match self.store.get(issue_id) {
            Ok(Some(mut issue)) => {
                issue.status = IssueStatus::Closed;
                if let Err(e) = self.store.update(&issue) {
                    self.report(&format!("issue {issue_id} の更新に失敗しました: {e}"));
                    return;
                }
                let disbanded = self.teams.disband_by_issue(issue_id);
                self.report(&format!(
                    "issue {issue_id} をクローズしました (解散チーム: {disbanded})"
                ));
            }
            Ok(None) => self.report(&format!("issue {issue_id} が見つかりません")),
            Err(e) => self.report(&format!("issue {issue_id} の読み込みに失敗しました: {e}")),
        }
    }

    /// Forward tracker activity to the superintendent. Bot comments,
    /// missing comments, and finished issues are filtered out so the
    /// agents' own automated comments never trigger more work.
    fn handle_issue_event(&self, event: &IssueEvent) {
        let issue = match self.store.get(&event.issue_id) {
            Ok(Some(issue)) => issue,
            Ok(None) => return,
            Err(e) => {
                warn!(issue = %event.issue_id, error = %e, "loading issue for event failed");
                return;
            }
        };
        if matches!(issue.status, IssueStatus::Resolved | IssueStatus::Closed) {
            return;
        }

        match event.kind.as_str() {
            "issue_comment" => {
                let Some(comment) = &event.comment else {
                    return;
                };
                if comment.is_bot {
                    return;
                }
                self.report(&format!(
                    "issue {} に {} からコメント: {}",
                    issue.id, comment.author, comment.body
                ));
            }
            "issues" => {
                self.report(&format!("issue {} が更新されました: {}", issue.id, issue.title));
            }
            _ => {}
        }
    }

    /// All user-visible reporting goes through the chatlog.
    fn report(&self, text: &str) {
        if let Err(e) = self.chatlog.append("superintendent", ORCHESTRATOR_RECIPIENT, text) {
            warn!(error = %e, "failed to report to superintendent");
        }
    }
}
