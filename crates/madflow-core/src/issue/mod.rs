//! Issue model: the unit of work agents are assigned to.
//!
//! Issues originate locally (`local-NNN`) or from an external tracker
//! (`<owner>-<repo>-NNN`). The runtime only mutates `status`,
//! `assigned_team`, and `pending_approval`; everything else mirrors the
//! external ticket.

pub mod store;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Resolved => "resolved",
            IssueStatus::Closed => "closed",
        }
    }

    /// Open or in-progress: something a team can still work on.
    pub fn is_active(&self) -> bool {
        matches!(self, IssueStatus::Open | IssueStatus::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub author: String,
    pub body: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    #[serde(default)]
    pub status: IssueStatus,
    /// 0 when no team is assigned.
    #[serde(default)]
    pub assigned_team: u32,
    /// Held back from team assignment until an authorized user approves.
    #[serde(default)]
    pub pending_approval: bool,
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// Empty for local-only issues.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Issue {
    pub fn new(id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: IssueStatus::Open,
            assigned_team: 0,
            pending_approval: false,
            title: title.into(),
            body: body.into(),
            url: String::new(),
            repos: Vec::new(),
            labels: Vec::new(),
            comments: Vec::new(),
        }
    }

    /// Add a comment unless one with the same id exists. Returns whether the
    /// comment was actually added, making the operation idempotent by id.
    pub fn add_comment(&mut self, comment: Comment) -> bool {
        if self.comments.iter().any(|c| c.id == comment.id) {
            return false;
        }
        self.comments.push(comment);
        true
    }
}

/// Store query filter carrying at most one status.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusFilter(pub Option<IssueStatus>);

impl StatusFilter {
    pub fn any() -> Self {
        Self(None)
    }

    pub fn only(status: IssueStatus) -> Self {
        Self(Some(status))
    }

    pub fn matches(&self, issue: &Issue) -> bool {
        self.0.map_or(true, |status| issue.status == status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_comment_is_idempotent_by_id() {
        let mut issue = Issue::new("local-001", "t", "b");
        let comment = Comment {
            id: 7,
            author: "alice".into(),
            body: "first".into(),
            created_at: String::new(),
            updated_at: String::new(),
            is_bot: false,
        };
        assert!(issue.add_comment(comment.clone()));
        assert!(!issue.add_comment(comment));
        assert_eq!(issue.comments.len(), 1);
    }

    #[test]
    fn test_status_filter() {
        let mut issue = Issue::new("local-001", "t", "b");
        assert!(StatusFilter::any().matches(&issue));
        assert!(StatusFilter::only(IssueStatus::Open).matches(&issue));
        issue.status = IssueStatus::Closed;
        assert!(!StatusFilter::only(IssueStatus::Open).matches(&issue));
    }

    #[test]
    fn test_status_toml_spelling() {
        let issue = Issue {
            status: IssueStatus::InProgress,
            ..Issue::new("local-001", "t", "b")
        };
        let doc = toml::to_string(&issue).unwrap();
        assert!(doc.contains("status = \"in_progress\""));
    }
}
