//! Team manager: bounded-concurrency scheduler for engineer agents.
//!
//! A team is one engineer agent bound to at most one issue. Creation
//! reserves a pending slot under the lock before the (possibly slow) agent
//! factory runs, so concurrent creates can never overshoot the cap or double
//! up on one issue. Each team gets a supervising task that restarts the
//! agent after a crash; the chatlog subscription is opened once outside the
//! restart loop so messages arriving during the restart delay stay buffered
//! instead of being dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::AgentRuntime;
use crate::chatlog::Chatlog;

const DEFAULT_MAX_TEAMS: usize = 4;
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Bound on waiting for the engineer's first send before announcing.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TeamError {
    #[error("team capacity reached (max {0})")]
    AtCapacity(usize),

    #[error("a team for issue {0} is already being created")]
    DuplicatePending(String),

    #[error("no team {0}")]
    NotFound(u32),

    #[error("building engineer agent: {0}")]
    Factory(#[from] anyhow::Error),
}

/// Builds one engineer agent runtime for a team. The factory may block on
/// subprocess startup and may fail; both happen outside the manager lock.
#[async_trait]
pub trait EngineerFactory: Send + Sync {
    async fn build(&self, team_num: u32, issue_id: &str) -> anyhow::Result<Arc<AgentRuntime>>;
}

/// Point-in-time view of one team.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamSnapshot {
    pub num: u32,
    /// Empty for a standby team.
    pub issue_id: String,
}

struct TeamEntry {
    issue_id: String,
    cancel: CancellationToken,
}

struct TmState {
    teams: HashMap<u32, TeamEntry>,
    pending_issues: HashSet<String>,
    pending_count: usize,
    next_id: u32,
}

pub struct TeamManager {
    factory: Arc<dyn EngineerFactory>,
    chatlog: Chatlog,
    max_teams: usize,
    state: Mutex<TmState>,
    restart_delay: Duration,
}

impl TeamManager {
    /// `max_teams <= 0` falls back to the default cap.
    pub fn new(factory: Arc<dyn EngineerFactory>, chatlog: Chatlog, max_teams: i64) -> Self {
        let max_teams = if max_teams <= 0 {
            DEFAULT_MAX_TEAMS
        } else {
            max_teams as usize
        };

        Self {
            factory,
            chatlog,
            max_teams,
            state: Mutex::new(TmState {
                teams: HashMap::new(),
                pending_issues: HashSet::new(),
                pending_count: 0,
                next_id: 1,
            }),
            restart_delay: RESTART_DELAY,
        }
    }

    pub fn max_teams(&self) -> usize {
        self.max_teams
    }

    /// Create a team, optionally bound to `issue_id` (empty = standby).
    /// Returns the team number. Team numbers are never reused.
    pub async fn create(
        &self,
        parent: &CancellationToken,
        issue_id: &str,
    ) -> Result<u32, TeamError> {
        // Phase 1: reserve a slot under the lock.
        let team_num = {
            let mut state = self.state.lock().expect("team lock poisoned");
            if state.teams.len() + state.pending_count >= self.max_teams {
                return Err(TeamError::AtCapacity(self.max_teams));
            }
            if !issue_id.is_empty() && state.pending_issues.contains(issue_id) {
                return Err(TeamError::DuplicatePending(issue_id.to_string()));
            }
            let num = state.next_id;
            state.next_id += 1;
            state.pending_count += 1;
            if !issue_id.is_empty() {
                state.pending_issues.insert(issue_id.to_string());
            }
            num
        };

        // Phase 2: build the agent outside the lock; release the
        // reservation on failure.
        let agent = match self.factory.build(team_num, issue_id).await {
            Ok(agent) => agent,
            Err(e) => {
                let mut state = self.state.lock().expect("team lock poisoned");
                state.pending_count -= 1;
                state.pending_issues.remove(issue_id);
                return Err(TeamError::Factory(e));
            }
        };

        // Phase 3: promote the reservation into a live team.
        let team_cancel = parent.child_token();
        {
            let mut state = self.state.lock().expect("team lock poisoned");
            state.teams.insert(
                team_num,
                TeamEntry {
                    issue_id: issue_id.to_string(),
                    cancel: team_cancel.clone(),
                },
            );
            state.pending_count -= 1;
            state.pending_issues.remove(issue_id);
        }

        let engineer_id = agent.id().to_string();
        info!(team = team_num, engineer = %engineer_id, issue = issue_id, "team created");

        self.spawn_supervisor(Arc::clone(&agent), team_cancel.clone(), engineer_id.clone());

        // Wait for the engineer's first send before announcing, so the
        // superintendent never addresses an agent that is not listening yet.
        tokio::select! {
            _ = agent.ready() => {}
            _ = tokio::time::sleep(READY_TIMEOUT) => {
                warn!(team = team_num, "engineer not ready after timeout, announcing anyway");
            }
            _ = parent.cancelled() => {}
        }

        self.announce(team_num, &engineer_id, issue_id);
        Ok(team_num)
    }

    /// Supervisor task: run the agent, restart on any non-cancel return.
    /// The subscription outlives each `run` so nothing is lost in between.
    fn spawn_supervisor(
        &self,
        agent: Arc<AgentRuntime>,
        team_cancel: CancellationToken,
        engineer_id: String,
    ) {
        let chatlog = self.chatlog.clone();
        let restart_delay = self.restart_delay;

        tokio::spawn(async move {
            let mut subscription = chatlog.watch(team_cancel.clone(), &engineer_id);
            loop {
                let result = agent.run(&team_cancel, &mut subscription).await;
                if team_cancel.is_cancelled() {
                    return;
                }
                match result {
                    Ok(()) => warn!(agent = %engineer_id, "agent run ended, restarting"),
                    Err(e) => warn!(agent = %engineer_id, error = %e, "agent crashed, restarting"),
                }
                tokio::select! {
                    _ = team_cancel.cancelled() => return,
                    _ = tokio::time::sleep(restart_delay) => {}
                }
            }
        });
    }

    /// Two announce messages: the team notice to the superintendent, and —
    /// for a bound team — a direct assignment to the engineer written under
    /// the superintendent's identity. The direct message guards against the
    /// superintendent addressing a wrong engineer id before it has seen the
    /// team notice.
    fn announce(&self, team_num: u32, engineer_id: &str, issue_id: &str) {
        let notice = if issue_id.is_empty() {
            format!("チーム{team_num}を待機状態で開始しました (担当: {engineer_id})")
        } else {
            format!("チーム{team_num}を開始しました (担当: {engineer_id}, issue: {issue_id})")
        };
        if let Err(e) = self.chatlog.append("superintendent", "orchestrator", &notice) {
            warn!(team = team_num, error = %e, "failed to announce team start");
        }

        if !issue_id.is_empty() {
            let assignment =
                format!("issue {issue_id} をあなたのチームに割り当てました。実装に着手してください。");
            if let Err(e) = self.chatlog.append(engineer_id, "superintendent", &assignment) {
                warn!(team = team_num, error = %e, "failed to send assignment");
            }
        }
    }

    /// Remove the team and cancel its agent.
    pub fn disband(&self, team_num: u32) -> Result<(), TeamError> {
        let entry = self
            .state
            .lock()
            .expect("team lock poisoned")
            .teams
            .remove(&team_num)
            .ok_or(TeamError::NotFound(team_num))?;
        entry.cancel.cancel();
        info!(team = team_num, issue = %entry.issue_id, "team disbanded");
        Ok(())
    }

    /// Disband every team working on `issue_id`; returns how many were.
    pub fn disband_by_issue(&self, issue_id: &str) -> usize {
        let nums: Vec<u32> = {
            let state = self.state.lock().expect("team lock poisoned");
            state
                .teams
                .iter()
                .filter(|(_, entry)| entry.issue_id == issue_id)
                .map(|(num, _)| *num)
                .collect()
        };
        for num in &nums {
            let _ = self.disband(*num);
        }
        nums.len()
    }

    pub fn list(&self) -> Vec<TeamSnapshot> {
        let state = self.state.lock().expect("team lock poisoned");
        let mut teams: Vec<TeamSnapshot> = state
            .teams
            .iter()
            .map(|(num, entry)| TeamSnapshot { num: *num, issue_id: entry.issue_id.clone() })
            .collect();
        teams.sort_by_key(|t| t.num);
        teams
    }

    /// Live teams plus in-flight reservations.
    pub fn count(&self) -> usize {
        let state = self.state.lock().expect("team lock poisoned");
        state.teams.len() + state.pending_count
    }

    /// True when `issue_id` has a live or pending team.
    pub fn has_issue(&self, issue_id: &str) -> bool {
        if issue_id.is_empty() {
            return false;
        }
        let state = self.state.lock().expect("team lock poisoned");
        state.pending_issues.contains(issue_id)
            || state.teams.values().any(|entry| entry.issue_id == issue_id)
    }
}
