//! Process-wide dormancy latch for provider-level rate limiting.
//!
//! When any agent observes a rate-limit error it arms the latch; every
//! concurrent `send` across all agents then blocks in [`Dormancy::wait`]
//! until a background probe confirms the provider recovered. During a
//! dormant period the probe is the only traffic that reaches the provider.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(15 * 60);
const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Shared latch entered on rate-limit, released by a successful probe.
#[derive(Debug)]
pub struct Dormancy {
    /// `true` while sleeping. Waiters subscribe and wait for `false`.
    sleeping: watch::Sender<bool>,
    guard: Mutex<()>,
    probe_interval: Duration,
    max_probe_interval: Duration,
}

impl Dormancy {
    pub fn new() -> Arc<Self> {
        Self::with_probe_interval(DEFAULT_PROBE_INTERVAL, MAX_PROBE_INTERVAL)
    }

    pub fn with_probe_interval(initial: Duration, max: Duration) -> Arc<Self> {
        let (sleeping, _) = watch::channel(false);
        Arc::new(Self {
            sleeping,
            guard: Mutex::new(()),
            probe_interval: initial,
            max_probe_interval: max,
        })
    }

    pub fn is_sleeping(&self) -> bool {
        *self.sleeping.borrow()
    }

    /// Arm the latch and start the probe loop. Idempotent: a second call
    /// while already sleeping changes nothing.
    ///
    /// `probe` is invoked once per interval and must return `true` when the
    /// provider has recovered (any outcome other than a rate-limit error).
    /// While the probe keeps reporting a rate limit, the interval doubles up
    /// to the configured cap. Cancelling `cancel` stops the probe loop
    /// without waking the waiters.
    pub fn enter<F, Fut>(self: &Arc<Self>, cancel: CancellationToken, probe: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        {
            let _guard = self.guard.lock().expect("dormancy lock poisoned");
            if *self.sleeping.borrow() {
                return;
            }
            self.sleeping.send_replace(true);
        }

        warn!("rate limit observed, entering dormancy");

        let latch = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = latch.probe_interval;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                if probe().await {
                    info!("dormancy probe succeeded, waking all agents");
                    let _guard = latch.guard.lock().expect("dormancy lock poisoned");
                    latch.sleeping.send_replace(false);
                    return;
                }

                interval = (interval * 2).min(latch.max_probe_interval);
                warn!(
                    next_probe_secs = interval.as_secs(),
                    "dormancy probe still rate limited"
                );
            }
        });
    }

    /// Return immediately when awake; otherwise block until the probe wakes
    /// the latch. Returns `false` when `cancel` fired first.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        let mut rx = {
            let _guard = self.guard.lock().expect("dormancy lock poisoned");
            if !*self.sleeping.borrow() {
                return true;
            }
            self.sleeping.subscribe()
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() || !*rx.borrow() {
                        return true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_passes_when_awake() {
        let latch = Dormancy::new();
        let cancel = CancellationToken::new();
        assert!(!latch.is_sleeping());
        assert!(latch.wait(&cancel).await);
    }

    #[tokio::test]
    async fn test_enter_is_idempotent() {
        let latch = Dormancy::with_probe_interval(Duration::from_secs(600), Duration::from_secs(600));
        let cancel = CancellationToken::new();
        let probes = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let probes = Arc::clone(&probes);
            latch.enter(cancel.clone(), move || {
                probes.fetch_add(1, Ordering::SeqCst);
                async { true }
            });
        }

        assert!(latch.is_sleeping());
        // Only the first enter started a probe loop; neither has fired yet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probes.load(Ordering::SeqCst), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_probe_wakes_on_second_attempt() {
        let latch = Dormancy::with_probe_interval(Duration::from_millis(20), Duration::from_millis(40));
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        let probe_attempts = Arc::clone(&attempts);
        latch.enter(cancel.clone(), move || {
            let n = probe_attempts.fetch_add(1, Ordering::SeqCst);
            async move { n >= 1 }
        });
        assert!(latch.is_sleeping());

        let woke = tokio::time::timeout(Duration::from_secs(2), latch.wait(&cancel)).await;
        assert!(woke.expect("waiter never woke"));
        assert!(!latch.is_sleeping());
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_probe_without_waking() {
        let latch = Dormancy::with_probe_interval(Duration::from_millis(10), Duration::from_millis(10));
        let cancel = CancellationToken::new();

        latch.enter(cancel.clone(), || async { true });
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Probe loop is gone, latch still sleeping.
        assert!(latch.is_sleeping());

        let waiter_cancel = CancellationToken::new();
        waiter_cancel.cancel();
        assert!(!latch.wait(&waiter_cancel).await);
    }
}
