//! Sliding-window rate limiter shared by all agents bound to one provider.
//!
//! The window holds the timestamps of recent acquisitions; a caller is
//! admitted when fewer than `rpm` acquisitions happened inside the window,
//! otherwise it sleeps until the oldest one ages out and tries again.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Per-provider request throttle.
///
/// `rpm <= 0` builds a no-op throttle whose [`Throttle::wait`] always returns
/// immediately.
#[derive(Debug)]
pub struct Throttle {
    rpm: usize,
    window: Duration,
    stamps: Mutex<VecDeque<Instant>>,
}

impl Throttle {
    pub fn new(rpm: i64) -> Self {
        Self::with_window(rpm, DEFAULT_WINDOW)
    }

    pub fn with_window(rpm: i64, window: Duration) -> Self {
        Self {
            rpm: rpm.max(0) as usize,
            window,
            stamps: Mutex::new(VecDeque::new()),
        }
    }

    /// True when this throttle never blocks.
    pub fn is_noop(&self) -> bool {
        self.rpm == 0
    }

    /// Block until a request slot is free inside the sliding window.
    ///
    /// Returns `true` once a slot was acquired, `false` when `cancel` fired
    /// first. The check-and-record step runs under one lock, so concurrent
    /// callers can never over-admit.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        if self.rpm == 0 {
            return true;
        }

        loop {
            let wait_for = {
                let mut stamps = self.stamps.lock().expect("throttle lock poisoned");
                let now = Instant::now();

                while let Some(&oldest) = stamps.front() {
                    if now.duration_since(oldest) >= self.window {
                        stamps.pop_front();
                    } else {
                        break;
                    }
                }

                if stamps.len() < self.rpm {
                    stamps.push_back(now);
                    return true;
                }

                // Full window: sleep until the oldest retained stamp ages out.
                let oldest = *stamps.front().expect("window is non-empty here");
                self.window - now.duration_since(oldest)
            };

            debug!(wait_ms = wait_for.as_millis() as u64, "throttle window full, waiting");

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait_for) => {}
            }
        }
    }
}
