//! Event watcher: reacts to individual tracker events between full polls.
//!
//! Polls the repo events feed with ETag-conditional requests, deduplicates
//! by event id (bounded memory, full clear on overflow), updates the issue
//! store, wakes the idle detector, and forwards issue activity to the
//! orchestrator for superintendent notification.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::issue::store::IssueStore;
use crate::issue::Comment;

use super::github::{GithubClient, RemoteEvent};
use super::idle::IdleDetector;
use super::{clears_approval, comment_from_remote, upsert_remote_issue};

/// Remembered event ids; cleared wholesale when full.
const MAX_SEEN_EVENTS: usize = 1000;

/// One issue-affecting event, forwarded to the orchestrator.
#[derive(Debug, Clone)]
pub struct IssueEvent {
    /// `issues` or `issue_comment`.
    pub kind: String,
    pub issue_id: String,
    pub comment: Option<Comment>,
}

pub struct EventWatcher {
    store: Arc<dyn IssueStore>,
    github: GithubClient,
    repos: Vec<String>,
    idle: Arc<IdleDetector>,
    interval: Duration,
    authorized: HashSet<String>,
    events_tx: mpsc::Sender<IssueEvent>,
}

impl EventWatcher {
    pub fn new(
        store: Arc<dyn IssueStore>,
        github: GithubClient,
        repos: Vec<String>,
        idle: Arc<IdleDetector>,
        interval: Duration,
        authorized: HashSet<String>,
        events_tx: mpsc::Sender<IssueEvent>,
    ) -> Self {
        Self { store, github, repos, idle, interval, authorized, events_tx }
    }

    /// Run until cancelled; errors are logged and the next tick retries.
    pub async fn run(self, cancel: CancellationToken) {
        info!(repos = self.repos.len(), interval_secs = self.interval.as_secs(), "event watcher started");

        let mut etags: HashMap<String, String> = HashMap::new();
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }

            for repo in &self.repos {
                let page = match self.github.events(repo, etags.get(repo).map(String::as_str)).await {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(repo, error = %e, "fetching events failed");
                        continue;
                    }
                };
                if page.not_modified {
                    continue;
                }
                if let Some(etag) = page.etag {
                    etags.insert(repo.clone(), etag);
                }

                for event in page.events {
                    if seen.contains(&event.id) {
                        continue;
                    }
                    if seen.len() >= MAX_SEEN_EVENTS {
                        debug!("seen-event set full, clearing");
                        seen.clear();
                    }
                    seen.insert(event.id.clone());

                    if let Err(e) = self.handle_event(repo, &event).await {
                        warn!(repo, event = %event.id, error = %e, "handling event failed");
                    }
                }
            }
        }
    }

    /// Apply one event to the store and forward it when it is issue
    /// activity worth the superintendent's attention.
    async fn handle_event(&self, repo: &str, event: &RemoteEvent) -> anyhow::Result<()> {
        match (event.kind.as_str(), event.action.as_str()) {
            ("IssuesEvent", "opened" | "edited") => {
                let Some(ref remote) = event.issue else {
                    return Ok(());
                };
                let issue =
                    upsert_remote_issue(self.store.as_ref(), repo, remote, &self.authorized)?;
                self.idle.wake();
                self.forward(IssueEvent {
                    kind: "issues".to_string(),
                    issue_id: issue.id,
                    comment: None,
                })
                .await;
            }
            ("IssueCommentEvent", "created") => {
                let (Some(remote), Some(remote_comment)) = (&event.issue, &event.comment) else {
                    return Ok(());
                };
                let mut issue =
                    upsert_remote_issue(self.store.as_ref(), repo, remote, &self.authorized)?;
                let comment = comment_from_remote(remote_comment);
                let added = issue.add_comment(comment.clone());
                if clears_approval(&self.authorized, &comment) && issue.pending_approval {
                    info!(issue = %issue.id, "approval granted");
                    issue.pending_approval = false;
                }
                self.store.update(&issue)?;
                self.idle.wake();
                if added {
                    self.forward(IssueEvent {
                        kind: "issue_comment".to_string(),
                        issue_id: issue.id,
                        comment: Some(comment),
                    })
                    .await;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn forward(&self, event: IssueEvent) {
        if self.events_tx.send(event).await.is_err() {
            debug!("orchestrator event channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::store::FileIssueStore;
    use crate::sync::github::{RemoteComment, RemoteIssue};
    use tempfile::TempDir;

    fn watcher(
        store: Arc<dyn IssueStore>,
        idle: Arc<IdleDetector>,
    ) -> (EventWatcher, mpsc::Receiver<IssueEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let watcher = EventWatcher::new(
            store,
            GithubClient::new(reqwest::Client::new(), None),
            vec!["acme/widgets".to_string()],
            idle,
            Duration::from_secs(60),
            HashSet::new(),
            tx,
        );
        (watcher, rx)
    }

    fn issue_event(kind: &str, action: &str, number: u64, comment: Option<RemoteComment>) -> RemoteEvent {
        RemoteEvent {
            id: "1".to_string(),
            kind: kind.to_string(),
            action: action.to_string(),
            issue: Some(RemoteIssue {
                number,
                title: "t".to_string(),
                body: "b".to_string(),
                state: "open".to_string(),
                html_url: String::new(),
                author: "alice".to_string(),
                author_is_bot: false,
                labels: vec![],
            }),
            comment,
        }
    }

    #[tokio::test]
    async fn test_issue_opened_upserts_and_wakes() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn IssueStore> = Arc::new(FileIssueStore::new(dir.path()));
        let idle = Arc::new(IdleDetector::new(Duration::ZERO, Duration::ZERO));
        idle.set_has_issues(false);
        let (watcher, mut rx) = watcher(Arc::clone(&store), Arc::clone(&idle));

        let event = issue_event("IssuesEvent", "opened", 3, None);
        watcher.handle_event("acme/widgets", &event).await.unwrap();

        assert!(store.get("acme-widgets-3").unwrap().is_some());
        assert!(!idle.is_idle());
        let forwarded = rx.try_recv().unwrap();
        assert_eq!(forwarded.kind, "issues");
        assert_eq!(forwarded.issue_id, "acme-widgets-3");
    }

    #[tokio::test]
    async fn test_comment_created_dedups_by_id() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn IssueStore> = Arc::new(FileIssueStore::new(dir.path()));
        let idle = Arc::new(IdleDetector::new(Duration::ZERO, Duration::ZERO));
        let (watcher, mut rx) = watcher(Arc::clone(&store), idle);

        let comment = RemoteComment {
            id: 42,
            author: "alice".to_string(),
            author_is_bot: false,
            body: "please look".to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        let event = issue_event("IssueCommentEvent", "created", 3, Some(comment));

        watcher.handle_event("acme/widgets", &event).await.unwrap();
        watcher.handle_event("acme/widgets", &event).await.unwrap();

        let issue = store.get("acme-widgets-3").unwrap().unwrap();
        assert_eq!(issue.comments.len(), 1, "comment import is idempotent by id");

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "duplicate comment must not be forwarded twice");
    }

    #[tokio::test]
    async fn test_unrelated_events_are_ignored() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn IssueStore> = Arc::new(FileIssueStore::new(dir.path()));
        let idle = Arc::new(IdleDetector::new(Duration::ZERO, Duration::ZERO));
        let (watcher, mut rx) = watcher(Arc::clone(&store), idle);

        let event = RemoteEvent {
            id: "9".to_string(),
            kind: "PushEvent".to_string(),
            action: String::new(),
            issue: None,
            comment: None,
        };
        watcher.handle_event("acme/widgets", &event).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(store.list(crate::issue::StatusFilter::any()).unwrap().is_empty());
    }
}
