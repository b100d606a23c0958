//! Issue store: one TOML document per issue under `<data_dir>/issues/`.
//!
//! The store serializes its own mutations with an internal lock and writes
//! atomically (temp file + rename), so a crash mid-write never leaves a
//! half-written issue behind.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use tracing::warn;

use super::{Issue, StatusFilter};

/// Contract consumed by the orchestrator and the sync poller.
pub trait IssueStore: Send + Sync {
    /// Create a locally-numbered issue (`local-NNN`).
    fn create(&self, title: &str, body: &str) -> anyhow::Result<Issue>;

    fn get(&self, id: &str) -> anyhow::Result<Option<Issue>>;

    /// Upsert by id. Used both for runtime mutations and for importing
    /// externally-numbered issues.
    fn update(&self, issue: &Issue) -> anyhow::Result<()>;

    fn list(&self, filter: StatusFilter) -> anyhow::Result<Vec<Issue>>;

    /// Issues whose id is not in `known`.
    fn list_new(&self, known: &HashSet<String>) -> anyhow::Result<Vec<Issue>>;
}

pub struct FileIssueStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileIssueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), lock: Mutex::new(()) }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.toml"))
    }

    fn write_issue(&self, issue: &Issue) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let doc = toml::to_string_pretty(issue).context("serializing issue")?;
        let path = self.path_for(&issue.id);
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, doc)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_all(&self) -> anyhow::Result<Vec<Issue>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut issues = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "unreadable issue file");
                    continue;
                }
            };
            match toml::from_str::<Issue>(&content) {
                Ok(issue) => issues.push(issue),
                Err(e) => warn!(file = %path.display(), error = %e, "malformed issue file"),
            }
        }
        issues.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(issues)
    }

    /// Highest already-used local number.
    fn last_local_number(&self) -> u32 {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_prefix("local-")?
                    .strip_suffix(".toml")?
                    .parse::<u32>()
                    .ok()
            })
            .max()
            .unwrap_or(0)
    }
}

impl IssueStore for FileIssueStore {
    fn create(&self, title: &str, body: &str) -> anyhow::Result<Issue> {
        let _guard = self.lock.lock().expect("issue store lock poisoned");
        let next = self.last_local_number() + 1;
        let issue = Issue::new(format!("local-{next:03}"), title, body);
        self.write_issue(&issue)?;
        Ok(issue)
    }

    fn get(&self, id: &str) -> anyhow::Result<Option<Issue>> {
        let _guard = self.lock.lock().expect("issue store lock poisoned");
        let path = self.path_for(id);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let issue = toml::from_str(&content)
            .with_context(|| format!("parsing issue file {}", path.display()))?;
        Ok(Some(issue))
    }

    fn update(&self, issue: &Issue) -> anyhow::Result<()> {
        let _guard = self.lock.lock().expect("issue store lock poisoned");
        self.write_issue(issue)
    }

    fn list(&self, filter: StatusFilter) -> anyhow::Result<Vec<Issue>> {
        let _guard = self.lock.lock().expect("issue store lock poisoned");
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|issue| filter.matches(issue))
            .collect())
    }

    fn list_new(&self, known: &HashSet<String>) -> anyhow::Result<Vec<Issue>> {
        let _guard = self.lock.lock().expect("issue store lock poisoned");
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|issue| !known.contains(&issue.id))
            .collect())
    }
}
