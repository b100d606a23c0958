//! Idle detection shared by the sync poller and the event watcher.
//!
//! Tracks whether any active issue exists and for how long none has. The
//! poller widens its interval when idle and suspends external calls
//! entirely when dormant; any sign of life calls [`IdleDetector::wake`].

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct IdleDetector {
    inner: Mutex<IdleState>,
    idle_threshold: Duration,
    dormancy_threshold: Duration,
}

#[derive(Debug)]
struct IdleState {
    has_issues: bool,
    issues_gone_at: Option<Instant>,
}

impl IdleDetector {
    /// `dormancy_threshold` of zero disables dormancy entirely.
    pub fn new(idle_threshold: Duration, dormancy_threshold: Duration) -> Self {
        Self {
            inner: Mutex::new(IdleState { has_issues: true, issues_gone_at: None }),
            idle_threshold,
            dormancy_threshold,
        }
    }

    /// Record the current "any active issue?" observation. Repeated `false`
    /// observations keep the original disappearance time.
    pub fn set_has_issues(&self, has_issues: bool) {
        let mut state = self.inner.lock().expect("idle lock poisoned");
        if has_issues {
            state.has_issues = true;
            state.issues_gone_at = None;
        } else if state.has_issues {
            state.has_issues = false;
            state.issues_gone_at = Some(Instant::now());
        }
    }

    /// Force-transition back to active, e.g. on an incoming external event.
    pub fn wake(&self) {
        self.set_has_issues(true);
    }

    fn gone_for(&self) -> Option<Duration> {
        let state = self.inner.lock().expect("idle lock poisoned");
        if state.has_issues {
            None
        } else {
            state.issues_gone_at.map(|at| at.elapsed())
        }
    }

    pub fn is_idle(&self) -> bool {
        self.gone_for().map_or(false, |gone| gone >= self.idle_threshold)
    }

    pub fn is_dormant(&self) -> bool {
        !self.dormancy_threshold.is_zero()
            && self.gone_for().map_or(false, |gone| gone >= self.dormancy_threshold)
    }
}
