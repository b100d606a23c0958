//! Agent runtime: one supervised LLM-backed worker.
//!
//! Wraps an [`AgentProcess`] with everything the backend does not know
//! about: the chatlog subscription, memo-based context carry-over, the
//! periodic context reset, throttle and dormancy gating, retry with
//! backoff, auto-continuation after a cut-off tool loop, and a one-shot
//! ready signal for the team manager.

pub mod id;
pub mod memo;
pub mod prompt;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{AgentProcess, BackendError};
use crate::chatlog::{self, Chatlog, Message};
use crate::dormancy::Dormancy;
use crate::throttle::Throttle;

use id::AgentId;
use memo::{MemoStore, WorkMemo};
use prompt::{build_initial_prompt, build_message_prompt, CONTINUATION_PROMPT, DISTILLATION_PROMPT};

/// Transient failures inside one send are retried this many times.
const RETRY_ATTEMPTS: u32 = 3;

/// Base backoff for transient retries, doubled per attempt.
const RETRY_BASE: Duration = Duration::from_secs(2);

/// A cut-off tool loop is auto-continued at most this many times per send.
const MAX_CONTINUATIONS: u32 = 3;

/// The startup send gets this many extra whole-send retries.
const STARTUP_RETRIES: u32 = 3;

/// Window for reporting duplicate rescued chatlog lines.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(10);

/// Wall-clock timer for the context-reset protocol. Consulted only at
/// message boundaries; an in-flight send is never preempted.
#[derive(Debug)]
pub struct ResetTimer {
    interval: Duration,
    started_at: Instant,
}

impl ResetTimer {
    pub fn new(interval: Duration) -> Self {
        Self { interval, started_at: Instant::now() }
    }

    pub fn expired(&self) -> bool {
        self.started_at.elapsed() >= self.interval
    }

    pub fn reset(&mut self) {
        self.started_at = Instant::now();
    }
}

/// Creation-time agent configuration. Immutable after construction.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub id: AgentId,
    pub role_preamble: String,
    pub chatlog_path: PathBuf,
    pub memos_dir: PathBuf,
    pub reset_interval: Duration,
    /// Original task text; a standby agent has none.
    pub initial_task: Option<String>,
}

/// One running agent. `run` is the supervised entry point; everything else
/// is plumbing shared between the startup send and the main loop.
pub struct AgentRuntime {
    config: AgentConfig,
    process: Arc<dyn AgentProcess>,
    chatlog: Chatlog,
    memos: MemoStore,
    throttle: Option<Arc<Throttle>>,
    dormancy: Option<Arc<Dormancy>>,
    timer: Mutex<ResetTimer>,
    ready: watch::Sender<bool>,
    recent_appends: Mutex<VecDeque<(String, Instant)>>,
    retry_base: Duration,
}

impl AgentRuntime {
    pub fn new(
        config: AgentConfig,
        process: Arc<dyn AgentProcess>,
        throttle: Option<Arc<Throttle>>,
        dormancy: Option<Arc<Dormancy>>,
    ) -> Self {
        let chatlog = Chatlog::new(config.chatlog_path.clone());
        let memos = MemoStore::new(config.memos_dir.clone());
        let timer = Mutex::new(ResetTimer::new(config.reset_interval));
        let (ready, _) = watch::channel(false);

        Self {
            config,
            process,
            chatlog,
            memos,
            throttle,
            dormancy,
            timer,
            ready,
            recent_appends: Mutex::new(VecDeque::new()),
            retry_base: RETRY_BASE,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.config.id
    }

    /// Resolves once the first send of a `run` has completed, successfully
    /// or not. The team manager waits on this before announcing the team.
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Main loop. Returns only on cancellation, a closed subscription, or a
    /// continuation-exhausted tool loop (which the supervisor treats as a
    /// crash). The subscription is borrowed, not owned: messages buffered
    /// while a crashed agent waits for restart are delivered to the next
    /// `run` call.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        incoming: &mut mpsc::Receiver<Message>,
    ) -> Result<(), BackendError> {
        info!(agent = %self.config.id, "agent starting");

        let carried_memo = self.memos.load_latest(&self.config.id);
        let initial = self.initial_prompt(&carried_memo);

        let first = self.startup_send(cancel, &initial).await;
        self.ready.send_replace(true);
        match first {
            Ok(reply) => self.rescue_chatlog_lines(&reply),
            Err(BackendError::Cancelled) => {
                self.process.close().await;
                return Ok(());
            }
            Err(e @ BackendError::MaxIterations { .. }) => {
                self.process.close().await;
                return Err(e);
            }
            Err(e) => {
                warn!(agent = %self.config.id, error = %e, "startup send failed, waiting for messages anyway");
            }
        }

        let result = self.message_loop(cancel, incoming).await;
        self.process.close().await;
        info!(agent = %self.config.id, "agent stopped");
        result
    }

    async fn message_loop(
        &self,
        cancel: &CancellationToken,
        incoming: &mut mpsc::Receiver<Message>,
    ) -> Result<(), BackendError> {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = incoming.recv() => match msg {
                    Some(msg) => msg,
                    None => return Ok(()),
                },
            };

            // Drain whatever else is already buffered so a burst becomes one
            // round-trip instead of several.
            let mut batch = vec![first];
            while let Ok(msg) = incoming.try_recv() {
                batch.push(msg);
            }
            debug!(agent = %self.config.id, coalesced = batch.len(), "processing messages");

            if self.timer.lock().expect("timer lock poisoned").expired() {
                match self.run_reset_protocol(cancel).await {
                    Ok(()) => {}
                    Err(BackendError::Cancelled) => return Ok(()),
                    Err(e @ BackendError::MaxIterations { .. }) => return Err(e),
                    Err(e) => {
                        warn!(agent = %self.config.id, error = %e, "context reset failed, keeping session");
                    }
                }
            }

            let prompt = build_message_prompt(&batch);
            match self.send(cancel, &prompt).await {
                Ok(reply) => self.rescue_chatlog_lines(&reply),
                Err(BackendError::Cancelled) => return Ok(()),
                Err(e @ BackendError::MaxIterations { .. }) => return Err(e),
                Err(e) => {
                    warn!(agent = %self.config.id, error = %e, "send failed after retries, continuing");
                }
            }
        }
    }

    /// Context-reset protocol: distill, persist, reset the backend, and
    /// re-prime it with an initial prompt carrying the fresh memo.
    async fn run_reset_protocol(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        info!(agent = %self.config.id, "reset interval elapsed, distilling context");

        let reply = self.send(cancel, DISTILLATION_PROMPT).await?;
        let memo = WorkMemo::from_distillation(&self.config.id, &reply);
        match self.memos.save(&memo) {
            Ok(path) => debug!(agent = %self.config.id, memo = %path.display(), "memo persisted"),
            Err(e) => warn!(agent = %self.config.id, error = %e, "failed to persist memo"),
        }

        self.process.reset().await?;

        let initial = self.initial_prompt(&memo.render());
        let reply = self.send(cancel, &initial).await?;
        self.rescue_chatlog_lines(&reply);

        self.timer.lock().expect("timer lock poisoned").reset();
        Ok(())
    }

    fn initial_prompt(&self, memo: &str) -> String {
        build_initial_prompt(
            &self.config.role_preamble,
            &self.config.id,
            &self.config.chatlog_path,
            self.config.initial_task.as_deref(),
            memo,
        )
    }

    /// The startup send re-runs the whole pipeline a few extra times so a
    /// transient initialization failure does not wedge the agent before it
    /// even subscribes to the chatlog.
    async fn startup_send(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
    ) -> Result<String, BackendError> {
        let mut result = self.send(cancel, prompt).await;
        for extra in 1..=STARTUP_RETRIES {
            match result {
                Ok(_) | Err(BackendError::Cancelled) | Err(BackendError::MaxIterations { .. }) => {
                    break;
                }
                Err(ref e) => {
                    let backoff = self.retry_base * 2u32.pow(extra - 1);
                    warn!(
                        agent = %self.config.id,
                        error = %e,
                        retry = extra,
                        backoff_secs = backoff.as_secs(),
                        "startup send failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    result = self.send(cancel, prompt).await;
                }
            }
        }
        result
    }

    /// One logical send: throttle, dormancy, retry, and auto-continuation.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
    ) -> Result<String, BackendError> {
        let mut prompt = prompt.to_string();
        let mut continuations = 0;

        loop {
            match self.send_gated(cancel, &prompt).await {
                Err(BackendError::MaxIterations { .. }) if continuations < MAX_CONTINUATIONS => {
                    continuations += 1;
                    warn!(
                        agent = %self.config.id,
                        continuation = continuations,
                        "tool loop was cut off, sending continuation prompt"
                    );
                    prompt = CONTINUATION_PROMPT.to_string();
                }
                other => return other,
            }
        }
    }

    /// Inner send: gate on throttle and dormancy, classify the outcome.
    async fn send_gated(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
    ) -> Result<String, BackendError> {
        let mut attempts = 0u32;

        loop {
            if let Some(throttle) = &self.throttle {
                if !throttle.wait(cancel).await {
                    return Err(BackendError::Cancelled);
                }
            }
            if let Some(dormancy) = &self.dormancy {
                if !dormancy.wait(cancel).await {
                    return Err(BackendError::Cancelled);
                }
            }

            match self.process.send(cancel, prompt).await {
                Ok(text) => return Ok(text),
                Err(BackendError::RateLimit(msg)) => {
                    if let Some(dormancy) = &self.dormancy {
                        warn!(agent = %self.config.id, error = %msg, "rate limited, arming dormancy");
                        self.arm_dormancy(dormancy, cancel);
                        // Loop: the next iteration blocks in dormancy.wait
                        // until the probe clears.
                        continue;
                    }
                    // No shared latch configured; back off locally instead
                    // of hammering the provider.
                    attempts += 1;
                    if attempts >= RETRY_ATTEMPTS {
                        return Err(BackendError::RateLimit(msg));
                    }
                    if !self.backoff_sleep(cancel, attempts).await {
                        return Err(BackendError::Cancelled);
                    }
                }
                Err(e @ BackendError::ProcessStart(_)) => return Err(e),
                Err(e @ BackendError::MaxIterations { .. }) => return Err(e),
                Err(BackendError::Cancelled) => return Err(BackendError::Cancelled),
                Err(BackendError::Transient(msg)) => {
                    attempts += 1;
                    if attempts >= RETRY_ATTEMPTS {
                        return Err(BackendError::Transient(msg));
                    }
                    warn!(
                        agent = %self.config.id,
                        error = %msg,
                        attempt = attempts,
                        "transient backend failure, backing off"
                    );
                    if !self.backoff_sleep(cancel, attempts).await {
                        return Err(BackendError::Cancelled);
                    }
                }
            }
        }
    }

    async fn backoff_sleep(&self, cancel: &CancellationToken, attempt: u32) -> bool {
        let backoff = self.retry_base * 2u32.pow(attempt - 1);
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(backoff) => true,
        }
    }

    /// Arm the shared dormancy latch with a trivial probe against this
    /// agent's own backend process.
    fn arm_dormancy(&self, dormancy: &Arc<Dormancy>, cancel: &CancellationToken) {
        let process = Arc::clone(&self.process);
        let probe_cancel = cancel.clone();
        dormancy.enter(cancel.clone(), move || {
            let process = Arc::clone(&process);
            let cancel = probe_cancel.clone();
            async move {
                !matches!(
                    process.send(&cancel, "hello").await,
                    Err(BackendError::RateLimit(_))
                )
            }
        });
    }

    /// Rescue: the model sometimes replies with formatted chatlog lines as
    /// plain text instead of executing the echo command. Without this those
    /// messages would be lost, so any reply line that parses as a chatlog
    /// message is appended verbatim. Duplicates inside a short window are
    /// reported but still appended.
    fn rescue_chatlog_lines(&self, reply: &str) {
        for line in reply.lines() {
            let line = line.trim();
            let Ok(msg) = chatlog::parse_message(line) else {
                continue;
            };

            if self.note_recent_append(&msg.raw) {
                warn!(agent = %self.config.id, line = %msg.raw, "duplicate chatlog line rescued within window");
            }

            match self.chatlog.append_raw(&msg.raw) {
                Ok(()) => {
                    debug!(agent = %self.config.id, recipient = %msg.recipient, "rescued chatlog line from reply")
                }
                Err(e) => warn!(agent = %self.config.id, error = %e, "failed to rescue chatlog line"),
            }
        }
    }

    /// Record an appended line; returns true when the identical raw line was
    /// already appended inside the duplicate window.
    fn note_recent_append(&self, raw: &str) -> bool {
        let mut recent = self.recent_appends.lock().expect("append lock poisoned");
        let now = Instant::now();
        while let Some((_, at)) = recent.front() {
            if now.duration_since(*at) >= DUPLICATE_WINDOW {
                recent.pop_front();
            } else {
                break;
            }
        }
        let duplicate = recent.iter().any(|(line, _)| line == raw);
        recent.push_back((raw.to_string(), now));
        duplicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatlog::format_message;
    use std::collections::VecDeque as Script;
    use tempfile::TempDir;

    /// Scripted fake backend. Pops one reply per send; once the script runs
    /// dry every send returns `Ok("")`.
    struct FakeProcess {
        script: Mutex<Script<Result<String, BackendError>>>,
        calls: Mutex<Vec<String>>,
        resets: Mutex<u32>,
    }

    impl FakeProcess {
        fn new(script: Vec<Result<String, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
                resets: Mutex::new(0),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl AgentProcess for FakeProcess {
        async fn send(
            &self,
            _cancel: &CancellationToken,
            prompt: &str,
        ) -> Result<String, BackendError> {
            self.calls.lock().unwrap().push(prompt.to_string());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }

        async fn reset(&self) -> Result<(), BackendError> {
            *self.resets.lock().unwrap() += 1;
            Ok(())
        }

        async fn close(&self) {}
    }

    fn runtime_in(
        dir: &TempDir,
        id: AgentId,
        task: Option<&str>,
        process: Arc<FakeProcess>,
        reset_interval: Duration,
        dormancy: Option<Arc<Dormancy>>,
    ) -> AgentRuntime {
        let config = AgentConfig {
            id,
            role_preamble: "テスト用エージェントです。".to_string(),
            chatlog_path: dir.path().join("chatlog.txt"),
            memos_dir: dir.path().join("memos"),
            reset_interval,
            initial_task: task.map(str::to_string),
        };
        let mut runtime = AgentRuntime::new(config, process, None, dormancy);
        runtime.retry_base = Duration::from_millis(10);
        runtime
    }

    #[test]
    fn test_reset_timer() {
        let mut timer = ResetTimer::new(Duration::from_secs(3600));
        assert!(!timer.expired());
        let mut expired = ResetTimer::new(Duration::ZERO);
        assert!(expired.expired());
        expired.reset();
        // Zero interval expires again right away; a real interval does not.
        assert!(expired.expired());
        timer.reset();
        assert!(!timer.expired());
    }

    #[tokio::test]
    async fn test_ready_fires_after_first_send() {
        let dir = TempDir::new().unwrap();
        let process = FakeProcess::new(vec![Ok("了解".to_string())]);
        let runtime = Arc::new(runtime_in(
            &dir,
            AgentId::engineer(1),
            Some("fix it"),
            Arc::clone(&process),
            Duration::from_secs(3600),
            None,
        ));

        let cancel = CancellationToken::new();
        let (_tx, mut rx) = mpsc::channel(16);
        let run = {
            let runtime = Arc::clone(&runtime);
            let cancel = cancel.clone();
            tokio::spawn(async move { runtime.run(&cancel, &mut rx).await })
        };

        tokio::time::timeout(Duration::from_secs(2), runtime.ready())
            .await
            .expect("ready never fired");

        // The initial prompt carried the task and the chatlog contract.
        let calls = process.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("元の依頼内容"));
        assert!(calls[0].contains("fix it"));

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_messages_are_coalesced() {
        let dir = TempDir::new().unwrap();
        let process = FakeProcess::new(vec![Ok(String::new())]);
        let runtime = Arc::new(runtime_in(
            &dir,
            AgentId::engineer(1),
            None,
            Arc::clone(&process),
            Duration::from_secs(3600),
            None,
        ));

        let (tx, mut rx) = mpsc::channel(16);
        for body in ["one", "two", "three"] {
            let line = format_message("engineer-1", "superintendent", body);
            tx.send(crate::chatlog::parse_message(&line).unwrap()).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let run = {
            let runtime = Arc::clone(&runtime);
            let cancel = cancel.clone();
            tokio::spawn(async move { runtime.run(&cancel, &mut rx).await })
        };

        // Wait until the batch prompt went out, then stop the agent.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if process.calls().len() >= 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message prompt never sent");

        cancel.cancel();
        run.await.unwrap().unwrap();

        let calls = process.calls();
        assert_eq!(calls.len(), 2, "three buffered messages must become one prompt");
        for body in ["one", "two", "three"] {
            assert!(calls[1].contains(body));
        }
    }

    #[tokio::test]
    async fn test_rescue_appends_formatted_reply_lines() {
        let dir = TempDir::new().unwrap();
        let rescued = format_message("superintendent", "engineer-1", "完了しました");
        let reply = format!("作業しました。\n{rescued}\n以上です。");
        let process = FakeProcess::new(vec![Ok(reply)]);
        let runtime = Arc::new(runtime_in(
            &dir,
            AgentId::engineer(1),
            None,
            process,
            Duration::from_secs(3600),
            None,
        ));

        let cancel = CancellationToken::new();
        let (_tx, mut rx) = mpsc::channel(16);
        let run = {
            let runtime = Arc::clone(&runtime);
            let cancel = cancel.clone();
            tokio::spawn(async move { runtime.run(&cancel, &mut rx).await })
        };
        tokio::time::timeout(Duration::from_secs(2), runtime.ready()).await.unwrap();
        cancel.cancel();
        run.await.unwrap().unwrap();

        let log = Chatlog::new(dir.path().join("chatlog.txt"));
        let msgs = log.poll("superintendent");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body, "完了しました");
        assert_eq!(msgs[0].sender, "engineer-1");
    }

    #[tokio::test]
    async fn test_exhausted_continuations_crash_the_run() {
        let dir = TempDir::new().unwrap();
        // Initial send is fine; the message send then hits the cap on the
        // first try and all three continuations.
        let mut script = vec![Ok(String::new())];
        for _ in 0..4 {
            script.push(Err(BackendError::MaxIterations { partial: "半分まで".into() }));
        }
        let process = FakeProcess::new(script);
        let runtime = Arc::new(runtime_in(
            &dir,
            AgentId::engineer(1),
            None,
            Arc::clone(&process),
            Duration::from_secs(3600),
            None,
        ));

        let (tx, mut rx) = mpsc::channel(16);
        let line = format_message("engineer-1", "superintendent", "続けて");
        tx.send(crate::chatlog::parse_message(&line).unwrap()).await.unwrap();

        let cancel = CancellationToken::new();
        let result = runtime.run(&cancel, &mut rx).await;
        assert!(matches!(result, Err(BackendError::MaxIterations { .. })));

        let calls = process.calls();
        // initial + first try + 3 continuations
        assert_eq!(calls.len(), 5);
        assert_eq!(calls[2], CONTINUATION_PROMPT);
        assert_eq!(calls[3], CONTINUATION_PROMPT);
        assert_eq!(calls[4], CONTINUATION_PROMPT);
    }

    #[tokio::test]
    async fn test_reset_protocol_distills_and_reprimes() {
        let dir = TempDir::new().unwrap();
        let process = FakeProcess::new(vec![
            Ok(String::new()),                                      // initial
            Ok("STATE: 途中\nDECISIONS: 方針A\nOPEN: なし\nNEXT: 続き".to_string()), // distillation
            Ok(String::new()),                                      // re-primed initial
            Ok(String::new()),                                      // message batch
        ]);
        // Zero interval: expired at the first message boundary.
        let runtime = Arc::new(runtime_in(
            &dir,
            AgentId::engineer(2),
            None,
            Arc::clone(&process),
            Duration::ZERO,
            None,
        ));

        let (tx, mut rx) = mpsc::channel(16);
        let line = format_message("engineer-2", "superintendent", "状況は?");
        tx.send(crate::chatlog::parse_message(&line).unwrap()).await.unwrap();

        let cancel = CancellationToken::new();
        let run = {
            let runtime = Arc::clone(&runtime);
            let cancel = cancel.clone();
            tokio::spawn(async move { runtime.run(&cancel, &mut rx).await })
        };

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if process.calls().len() >= 4 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("reset protocol did not complete");

        cancel.cancel();
        run.await.unwrap().unwrap();

        let calls = process.calls();
        assert_eq!(calls[1], DISTILLATION_PROMPT);
        assert!(calls[2].contains("直近の作業メモ"));
        assert!(calls[2].contains("STATE: 途中"));
        assert_eq!(*process.resets.lock().unwrap(), 1);

        // The memo landed on disk for the next incarnation.
        let memos = MemoStore::new(dir.path().join("memos"));
        assert!(memos.load_latest(&AgentId::engineer(2)).contains("DECISIONS: 方針A"));
    }

    /// Ten agents share one dormancy latch. One rate-limited send puts every
    /// agent to sleep; only the probe talks to the backend until it clears,
    /// then all ten resume.
    #[tokio::test]
    async fn test_rate_limit_dormancy_blocks_all_agents() {
        let dir = TempDir::new().unwrap();
        let dormancy =
            Dormancy::with_probe_interval(Duration::from_millis(100), Duration::from_millis(200));
        let cancel = CancellationToken::new();

        // The triggering agent: rate-limited send, then a rate-limited
        // probe, then a successful probe, then the resumed send.
        let trigger_process = FakeProcess::new(vec![
            Err(BackendError::RateLimit("usage limit reached".into())),
            Err(BackendError::RateLimit("usage limit reached".into())),
            Ok("probe ok".to_string()),
            Ok("resumed".to_string()),
        ]);
        let trigger = Arc::new(runtime_in(
            &dir,
            AgentId::engineer(1),
            None,
            Arc::clone(&trigger_process),
            Duration::from_secs(3600),
            Some(Arc::clone(&dormancy)),
        ));

        let trigger_task = {
            let trigger = Arc::clone(&trigger);
            let cancel = cancel.clone();
            tokio::spawn(async move { trigger.send(&cancel, "work").await })
        };

        // Wait until the latch armed.
        tokio::time::timeout(Duration::from_secs(2), async {
            while !dormancy.is_sleeping() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dormancy never armed");

        // Nine more agents try to send while dormant: all must block without
        // touching their backends.
        let mut others = Vec::new();
        for i in 2..=10 {
            let process = FakeProcess::new(vec![Ok("done".to_string())]);
            let runtime = Arc::new(runtime_in(
                &dir,
                AgentId::engineer(i),
                None,
                Arc::clone(&process),
                Duration::from_secs(3600),
                Some(Arc::clone(&dormancy)),
            ));
            let task = {
                let runtime = Arc::clone(&runtime);
                let cancel = cancel.clone();
                tokio::spawn(async move { runtime.send(&cancel, "work").await })
            };
            others.push((process, task));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        for (process, task) in &others {
            assert!(!task.is_finished(), "send completed during dormancy");
            assert!(process.calls().is_empty(), "backend called during dormancy");
        }

        // The probe succeeds on its second attempt; everyone resumes.
        for (_, task) in others {
            let result = tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .expect("agent never woke from dormancy")
                .unwrap();
            assert_eq!(result.unwrap(), "done");
        }
        let result = tokio::time::timeout(Duration::from_secs(2), trigger_task)
            .await
            .expect("triggering agent never resumed")
            .unwrap();
        assert_eq!(result.unwrap(), "resumed");
        assert!(!dormancy.is_sleeping());
    }

    #[tokio::test]
    async fn test_startup_send_retries_transient_failures() {
        let dir = TempDir::new().unwrap();
        // send_gated retries internally first (3 attempts), so exhaust one
        // full send, then succeed in the first startup retry.
        let process = FakeProcess::new(vec![
            Err(BackendError::Transient("boom".into())),
            Err(BackendError::Transient("boom".into())),
            Err(BackendError::Transient("boom".into())),
            Ok("up".to_string()),
        ]);
        let runtime = Arc::new(runtime_in(
            &dir,
            AgentId::superintendent(),
            None,
            Arc::clone(&process),
            Duration::from_secs(3600),
            None,
        ));

        let cancel = CancellationToken::new();
        let result = runtime.startup_send(&cancel, "boot").await;
        assert_eq!(result.unwrap(), "up");
        assert_eq!(process.calls().len(), 4);
    }

    #[test]
    fn test_duplicate_window_reports_repeats() {
        let dir = TempDir::new().unwrap();
        let process = FakeProcess::new(vec![]);
        let runtime = runtime_in(
            &dir,
            AgentId::engineer(1),
            None,
            process,
            Duration::from_secs(3600),
            None,
        );

        assert!(!runtime.note_recent_append("line A"));
        assert!(!runtime.note_recent_append("line B"));
        assert!(runtime.note_recent_append("line A"));
    }
}
