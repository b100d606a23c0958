//! Issue synchronization with the external tracker.
//!
//! Two cooperating loops share one [`IdleDetector`]:
//! - the [`SyncPoller`] reconciles every open ticket of every configured
//!   repo into the issue store at an adaptive interval;
//! - the [`events::EventWatcher`] tails the repo events feed with
//!   ETag-conditional requests and reacts to individual changes.

pub mod events;
pub mod github;
pub mod idle;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::issue::store::IssueStore;
use crate::issue::{Comment, Issue, IssueStatus, StatusFilter};

use github::{external_issue_id, GithubClient, RemoteComment, RemoteIssue};
use idle::IdleDetector;

/// While dormant, only this flag is re-checked; no external call is made.
const DORMANT_RECHECK: Duration = Duration::from_secs(30);

/// True when a ticket by `author` must wait for approval before a team may
/// pick it up. An empty authorized set approves everyone.
fn requires_approval(authorized: &HashSet<String>, author: &str) -> bool {
    !authorized.is_empty() && !authorized.contains(author)
}

/// True when this comment lifts the pending-approval flag.
fn clears_approval(authorized: &HashSet<String>, comment: &Comment) -> bool {
    !comment.is_bot && comment.body.contains("/approve") && authorized.contains(&comment.author)
}

fn comment_from_remote(remote: &RemoteComment) -> Comment {
    Comment {
        id: remote.id,
        author: remote.author.clone(),
        body: remote.body.clone(),
        created_at: remote.created_at.clone(),
        updated_at: remote.updated_at.clone(),
        is_bot: remote.author_is_bot,
    }
}

/// Create-or-refresh the local issue for one remote ticket. The title and
/// body follow the remote side only while the issue is still active locally.
fn upsert_remote_issue(
    store: &dyn IssueStore,
    repo: &str,
    remote: &RemoteIssue,
    authorized: &HashSet<String>,
) -> anyhow::Result<Issue> {
    let id = external_issue_id(repo, remote.number);

    let mut issue = match store.get(&id)? {
        Some(existing) => existing,
        None => {
            let mut issue = Issue::new(id.clone(), &remote.title, &remote.body);
            issue.url = remote.html_url.clone();
            issue.repos = vec![repo.to_string()];
            issue.pending_approval = requires_approval(authorized, &remote.author);
            info!(issue = %id, author = %remote.author, pending = issue.pending_approval, "imported new ticket");
            issue
        }
    };

    if issue.status.is_active() {
        issue.title = remote.title.clone();
        issue.body = remote.body.clone();
        issue.labels = remote.labels.clone();
    }

    store.update(&issue)?;
    Ok(issue)
}

/// Periodic full reconcile of all configured repos.
pub struct SyncPoller {
    store: Arc<dyn IssueStore>,
    github: GithubClient,
    repos: Vec<String>,
    idle: Arc<IdleDetector>,
    interval: Duration,
    idle_interval: Duration,
    authorized: HashSet<String>,
}

impl SyncPoller {
    pub fn new(
        store: Arc<dyn IssueStore>,
        github: GithubClient,
        repos: Vec<String>,
        idle: Arc<IdleDetector>,
        interval: Duration,
        idle_interval: Duration,
        authorized: HashSet<String>,
    ) -> Self {
        Self { store, github, repos, idle, interval, idle_interval, authorized }
    }

    /// Run until cancelled. Errors are logged and survived; the next tick
    /// retries from scratch.
    pub async fn run(self, cancel: CancellationToken) {
        info!(repos = self.repos.len(), interval_secs = self.interval.as_secs(), "sync poller started");

        loop {
            if self.idle.is_dormant() {
                debug!("dormant, skipping external sync");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(DORMANT_RECHECK) => {}
                }
                continue;
            }

            self.sync_once().await;
            self.observe_idleness();

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.current_interval()) => {}
            }
        }
    }

    async fn sync_once(&self) {
        for repo in &self.repos {
            let remote = match self.github.list_open_issues(repo).await {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(repo, error = %e, "listing open tickets failed");
                    continue;
                }
            };

            let mut fetched = HashSet::new();
            for ticket in &remote {
                fetched.insert(external_issue_id(repo, ticket.number));
                if let Err(e) = self.import_ticket(repo, ticket).await {
                    warn!(repo, number = ticket.number, error = %e, "importing ticket failed");
                }
            }

            // Only after every ticket of this repo was processed: anything
            // local that vanished from the open set is closed out.
            if let Err(e) = self.close_stale(repo, &fetched) {
                warn!(repo, error = %e, "closing stale issues failed");
            }
        }
    }

    async fn import_ticket(&self, repo: &str, remote: &RemoteIssue) -> anyhow::Result<()> {
        let mut issue = upsert_remote_issue(self.store.as_ref(), repo, remote, &self.authorized)?;

        match self.github.list_comments(repo, remote.number).await {
            Ok(comments) => {
                let mut changed = false;
                for remote_comment in &comments {
                    let comment = comment_from_remote(remote_comment);
                    let lifts = clears_approval(&self.authorized, &comment);
                    if issue.add_comment(comment) {
                        changed = true;
                    }
                    if lifts && issue.pending_approval {
                        info!(issue = %issue.id, "approval granted");
                        issue.pending_approval = false;
                        changed = true;
                    }
                }
                if changed {
                    self.store.update(&issue)?;
                }
            }
            Err(e) => warn!(repo, number = remote.number, error = %e, "listing comments failed"),
        }

        Ok(())
    }

    /// Close every local issue of `repo` that no longer appears in the
    /// fetched open set.
    fn close_stale(&self, repo: &str, fetched: &HashSet<String>) -> anyhow::Result<()> {
        for mut issue in self.store.list(StatusFilter::any())? {
            if issue.status == IssueStatus::Closed {
                continue;
            }
            if !issue.repos.iter().any(|r| r == repo) {
                continue;
            }
            if fetched.contains(&issue.id) {
                continue;
            }
            info!(issue = %issue.id, "ticket gone from open set, closing");
            issue.status = IssueStatus::Closed;
            self.store.update(&issue)?;
        }
        Ok(())
    }

    /// After each poll: does any active issue remain?
    fn observe_idleness(&self) {
        match self.store.list(StatusFilter::any()) {
            Ok(issues) => {
                let active = issues.iter().any(|issue| issue.status.is_active());
                self.idle.set_has_issues(active);
            }
            Err(e) => warn!(error = %e, "idleness check failed"),
        }
    }

    /// The idle interval applies only when idle, and never shrinks the
    /// normal one.
    fn current_interval(&self) -> Duration {
        if self.idle.is_idle() {
            self.idle_interval.max(self.interval)
        } else {
            self.interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::store::FileIssueStore;
    use tempfile::TempDir;

    fn remote(number: u64, author: &str) -> RemoteIssue {
        RemoteIssue {
            number,
            title: format!("ticket {number}"),
            body: "body".to_string(),
            state: "open".to_string(),
            html_url: format!("https://github.com/acme/widgets/issues/{number}"),
            author: author.to_string(),
            author_is_bot: false,
            labels: vec![],
        }
    }

    fn poller(store: Arc<dyn IssueStore>, idle: Arc<IdleDetector>, authorized: &[&str]) -> SyncPoller {
        SyncPoller::new(
            store,
            GithubClient::new(reqwest::Client::new(), None),
            vec!["acme/widgets".to_string()],
            idle,
            Duration::from_secs(60),
            Duration::from_secs(300),
            authorized.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_upsert_creates_and_refreshes() {
        let dir = TempDir::new().unwrap();
        let store = FileIssueStore::new(dir.path());
        let authorized = HashSet::new();

        let issue = upsert_remote_issue(&store, "acme/widgets", &remote(5, "alice"), &authorized).unwrap();
        assert_eq!(issue.id, "acme-widgets-5");
        assert!(!issue.pending_approval);
        assert_eq!(issue.repos, vec!["acme/widgets".to_string()]);

        let mut changed = remote(5, "alice");
        changed.title = "renamed".to_string();
        let issue = upsert_remote_issue(&store, "acme/widgets", &changed, &authorized).unwrap();
        assert_eq!(issue.title, "renamed");
    }

    #[test]
    fn test_closed_issue_title_is_frozen() {
        let dir = TempDir::new().unwrap();
        let store = FileIssueStore::new(dir.path());
        let authorized = HashSet::new();

        let mut issue =
            upsert_remote_issue(&store, "acme/widgets", &remote(5, "alice"), &authorized).unwrap();
        issue.status = IssueStatus::Resolved;
        store.update(&issue).unwrap();

        let mut changed = remote(5, "alice");
        changed.title = "renamed after resolve".to_string();
        let issue = upsert_remote_issue(&store, "acme/widgets", &changed, &authorized).unwrap();
        assert_eq!(issue.title, "ticket 5");
    }

    #[test]
    fn test_unauthorized_author_needs_approval() {
        let dir = TempDir::new().unwrap();
        let store = FileIssueStore::new(dir.path());
        let authorized: HashSet<String> = ["alice".to_string()].into();

        let by_alice = upsert_remote_issue(&store, "acme/widgets", &remote(1, "alice"), &authorized).unwrap();
        assert!(!by_alice.pending_approval);

        let by_mallory = upsert_remote_issue(&store, "acme/widgets", &remote(2, "mallory"), &authorized).unwrap();
        assert!(by_mallory.pending_approval);
    }

    #[test]
    fn test_approve_comment_rules() {
        let authorized: HashSet<String> = ["alice".to_string()].into();
        let comment = |author: &str, body: &str, is_bot: bool| Comment {
            id: 1,
            author: author.to_string(),
            body: body.to_string(),
            created_at: String::new(),
            updated_at: String::new(),
            is_bot,
        };

        assert!(clears_approval(&authorized, &comment("alice", "/approve", false)));
        assert!(clears_approval(&authorized, &comment("alice", "LGTM /approve", false)));
        assert!(!clears_approval(&authorized, &comment("mallory", "/approve", false)));
        assert!(!clears_approval(&authorized, &comment("alice", "/approve", true)));
        assert!(!clears_approval(&authorized, &comment("alice", "approve", false)));
    }

    #[test]
    fn test_close_stale_only_touches_missing_repo_issues() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn IssueStore> = Arc::new(FileIssueStore::new(dir.path()));
        let idle = Arc::new(IdleDetector::new(Duration::ZERO, Duration::ZERO));
        let authorized = HashSet::new();

        let kept = upsert_remote_issue(store.as_ref(), "acme/widgets", &remote(1, "alice"), &authorized).unwrap();
        let gone = upsert_remote_issue(store.as_ref(), "acme/widgets", &remote(2, "alice"), &authorized).unwrap();
        let local = store.create("local only", "").unwrap();

        let poller = poller(Arc::clone(&store), idle, &[]);
        let fetched: HashSet<String> = [kept.id.clone()].into();
        poller.close_stale("acme/widgets", &fetched).unwrap();

        assert_eq!(store.get(&kept.id).unwrap().unwrap().status, IssueStatus::Open);
        assert_eq!(store.get(&gone.id).unwrap().unwrap().status, IssueStatus::Closed);
        assert_eq!(store.get(&local.id).unwrap().unwrap().status, IssueStatus::Open, "local issues have no repo and are never stale-closed");
    }

    #[test]
    fn test_interval_never_shrinks_when_idle() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn IssueStore> = Arc::new(FileIssueStore::new(dir.path()));
        let idle = Arc::new(IdleDetector::new(Duration::ZERO, Duration::ZERO));

        let mut poller = poller(Arc::clone(&store), Arc::clone(&idle), &[]);
        assert_eq!(poller.current_interval(), Duration::from_secs(60));

        idle.set_has_issues(false);
        assert!(idle.is_idle());
        assert_eq!(poller.current_interval(), Duration::from_secs(300));

        // A misconfigured idle interval shorter than the normal one must
        // not speed up polling.
        poller.idle_interval = Duration::from_secs(10);
        assert_eq!(poller.current_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_observe_idleness_follows_store_state() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn IssueStore> = Arc::new(FileIssueStore::new(dir.path()));
        let idle = Arc::new(IdleDetector::new(Duration::ZERO, Duration::ZERO));
        let poller = poller(Arc::clone(&store), Arc::clone(&idle), &[]);

        poller.observe_idleness();
        assert!(idle.is_idle(), "empty store means no active issues");

        store.create("work", "").unwrap();
        poller.observe_idleness();
        assert!(!idle.is_idle());
    }
}
