//! Minimal GitHub REST client for issue sync.
//!
//! Three endpoints: open issues per repo, comments per issue, and the repo
//! events feed. The events call is ETag-conditional so an unchanged feed
//! costs a 304 with no payload.

use anyhow::{bail, Context};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "madflow";

/// `owner/repo` + ticket number → the store's issue id.
pub fn external_issue_id(repo: &str, number: u64) -> String {
    format!("{}-{}", repo.replace('/', "-"), number)
}

#[derive(Debug, Clone)]
pub struct GithubClient {
    client: Client,
    token: Option<String>,
    api_base: String,
}

impl GithubClient {
    pub fn new(client: Client, token: Option<String>) -> Self {
        Self { client, token, api_base: DEFAULT_API_BASE.to_string() }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(url)
            .header("user-agent", USER_AGENT)
            .header("accept", "application/vnd.github+json");
        if let Some(ref token) = self.token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        req
    }

    /// All open issues of `owner/repo`. Pull requests are filtered out.
    pub async fn list_open_issues(&self, repo: &str) -> anyhow::Result<Vec<RemoteIssue>> {
        let url = format!("{}/repos/{}/issues?state=open&per_page=100", self.api_base, repo);
        let response = self.request(&url).send().await.context("listing issues")?;
        let status = response.status();
        let body = response.text().await.context("reading issue list")?;
        if !status.is_success() {
            bail!("github {status} listing issues for {repo}: {body}");
        }

        let raw: Vec<RawIssue> = serde_json::from_str(&body).context("parsing issue list")?;
        Ok(raw
            .into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .map(RemoteIssue::from)
            .collect())
    }

    /// All comments of one issue.
    pub async fn list_comments(&self, repo: &str, number: u64) -> anyhow::Result<Vec<RemoteComment>> {
        let url = format!(
            "{}/repos/{}/issues/{}/comments?per_page=100",
            self.api_base, repo, number
        );
        let response = self.request(&url).send().await.context("listing comments")?;
        let status = response.status();
        let body = response.text().await.context("reading comment list")?;
        if !status.is_success() {
            bail!("github {status} listing comments for {repo}#{number}: {body}");
        }

        let raw: Vec<RawComment> = serde_json::from_str(&body).context("parsing comment list")?;
        Ok(raw.into_iter().map(RemoteComment::from).collect())
    }

    /// One page of the repo events feed, conditional on `etag`.
    pub async fn events(&self, repo: &str, etag: Option<&str>) -> anyhow::Result<EventsPage> {
        let url = format!("{}/repos/{}/events?per_page=100", self.api_base, repo);
        let mut req = self.request(&url);
        if let Some(etag) = etag {
            req = req.header("if-none-match", etag);
        }

        let response = req.send().await.context("fetching events")?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            debug!(repo, "events feed unchanged");
            return Ok(EventsPage { events: Vec::new(), etag: None, not_modified: true });
        }

        let new_etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.context("reading events")?;
        if !status.is_success() {
            bail!("github {status} fetching events for {repo}: {body}");
        }

        let raw: Vec<RawEvent> = serde_json::from_str(&body).context("parsing events")?;
        Ok(EventsPage {
            events: raw.into_iter().map(RemoteEvent::from).collect(),
            etag: new_etag,
            not_modified: false,
        })
    }
}

// ── normalized shapes ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RemoteIssue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: String,
    pub html_url: String,
    pub author: String,
    pub author_is_bot: bool,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteComment {
    pub id: i64,
    pub author: String,
    pub author_is_bot: bool,
    pub body: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub id: String,
    pub kind: String,
    pub action: String,
    pub issue: Option<RemoteIssue>,
    pub comment: Option<RemoteComment>,
}

#[derive(Debug)]
pub struct EventsPage {
    pub events: Vec<RemoteEvent>,
    pub etag: Option<String>,
    pub not_modified: bool,
}

// ── raw wire shapes ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawUser {
    #[serde(default)]
    login: String,
    #[serde(rename = "type", default)]
    kind: String,
}

impl RawUser {
    fn is_bot(&self) -> bool {
        self.kind == "Bot" || self.login.ends_with("[bot]")
    }
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    user: Option<RawUser>,
    #[serde(default)]
    labels: Vec<RawLabel>,
    /// Present when the "issue" is actually a pull request.
    #[serde(default)]
    pull_request: Option<Value>,
}

impl From<RawIssue> for RemoteIssue {
    fn from(raw: RawIssue) -> Self {
        let (author, author_is_bot) = raw
            .user
            .map(|u| (u.login.clone(), u.is_bot()))
            .unwrap_or_default();
        Self {
            number: raw.number,
            title: raw.title,
            body: raw.body.unwrap_or_default(),
            state: raw.state,
            html_url: raw.html_url,
            author,
            author_is_bot,
            labels: raw.labels.into_iter().map(|l| l.name).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawComment {
    id: i64,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    user: Option<RawUser>,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    updated_at: String,
}

impl From<RawComment> for RemoteComment {
    fn from(raw: RawComment) -> Self {
        let (author, author_is_bot) = raw
            .user
            .map(|u| (u.login.clone(), u.is_bot()))
            .unwrap_or_default();
        Self {
            id: raw.id,
            author,
            author_is_bot,
            body: raw.body.unwrap_or_default(),
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    payload: RawPayload,
}

#[derive(Debug, Deserialize, Default)]
struct RawPayload {
    #[serde(default)]
    action: String,
    #[serde(default)]
    issue: Option<RawIssue>,
    #[serde(default)]
    comment: Option<RawComment>,
}

impl From<RawEvent> for RemoteEvent {
    fn from(raw: RawEvent) -> Self {
        Self {
            id: raw.id,
            kind: raw.kind,
            action: raw.payload.action,
            issue: raw.payload.issue.map(RemoteIssue::from),
            comment: raw.payload.comment.map(RemoteComment::from),
        }
    }
}
