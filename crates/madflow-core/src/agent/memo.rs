//! Work memos: distilled agent state carried across context resets.
//!
//! At reset time the model answers the distillation prompt with four labeled
//! lines; the parsed memo is written to
//! `<memos_dir>/<agent_id>-<YYYYMMDDTHHMMSS>.md` and the latest file is read
//! back into the next initial prompt.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::warn;

use super::id::AgentId;

const FILENAME_TS_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Distilled state of one agent at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkMemo {
    pub agent_id: String,
    pub timestamp: String,
    pub current_state: String,
    pub decisions: String,
    pub open_issues: String,
    pub next_step: String,
}

impl WorkMemo {
    /// Parse the model's reply to the distillation prompt.
    ///
    /// Lines are prefix-matched against the four tags; missing tags stay
    /// empty. When neither `STATE:` nor `DECISIONS:` was found the reply did
    /// not follow the format at all, so the whole raw text becomes
    /// `current_state` rather than losing it.
    pub fn from_distillation(agent_id: &AgentId, reply: &str) -> Self {
        let mut memo = Self {
            agent_id: agent_id.to_string(),
            timestamp: Local::now().format(FILENAME_TS_FORMAT).to_string(),
            ..Self::default()
        };

        let mut saw_state = false;
        let mut saw_decisions = false;

        for line in reply.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("STATE:") {
                memo.current_state = rest.trim().to_string();
                saw_state = true;
            } else if let Some(rest) = line.strip_prefix("DECISIONS:") {
                memo.decisions = rest.trim().to_string();
                saw_decisions = true;
            } else if let Some(rest) = line.strip_prefix("OPEN:") {
                memo.open_issues = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("NEXT:") {
                memo.next_step = rest.trim().to_string();
            }
        }

        if !saw_state && !saw_decisions {
            memo.current_state = reply.trim().to_string();
            memo.decisions.clear();
            memo.open_issues.clear();
            memo.next_step.clear();
        }

        memo
    }

    /// Render the memo body as carried into the next initial prompt.
    pub fn render(&self) -> String {
        format!(
            "STATE: {}\nDECISIONS: {}\nOPEN: {}\nNEXT: {}",
            self.current_state, self.decisions, self.open_issues, self.next_step
        )
    }

    fn filename(&self) -> String {
        format!("{}-{}.md", self.agent_id, self.timestamp)
    }
}

/// Directory of memo files, one per reset.
#[derive(Debug, Clone)]
pub struct MemoStore {
    dir: PathBuf,
}

impl MemoStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist one memo; returns the written path.
    pub fn save(&self, memo: &WorkMemo) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(memo.filename());
        fs::write(&path, memo.render())?;
        Ok(path)
    }

    /// Content of the newest memo for `agent_id`, empty when none exists.
    ///
    /// Filenames embed a sortable timestamp, so lexicographic order is
    /// chronological order. A missing directory is an empty store.
    pub fn load_latest(&self, agent_id: &AgentId) -> String {
        let prefix = format!("{}-", agent_id);

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return String::new(),
        };

        let mut latest: Option<String> = None;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) || !name.ends_with(".md") {
                continue;
            }
            if latest.as_deref().map_or(true, |current| name.as_str() > current) {
                latest = Some(name);
            }
        }

        let Some(name) = latest else {
            return String::new();
        };
        match fs::read_to_string(self.dir.join(&name)) {
            Ok(content) => content,
            Err(e) => {
                warn!(file = %name, error = %e, "failed to read memo");
                String::new()
            }
        }
    }
}
