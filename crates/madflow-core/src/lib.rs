//! madflow-core: runtime for a small fleet of LLM agents working tickets.
//!
//! A persistent superintendent agent directs short-lived engineer teams;
//! all coordination happens over one append-only chatlog file. The runtime
//! never interprets agent reasoning — it brokers messages, restarts crashed
//! agents, throttles provider traffic, and mirrors an external tracker into
//! the local issue store.
//!
//! Building blocks, leaves first:
//!
//! - [`chatlog`] — the tailing-file message bus
//! - [`throttle`] — sliding-window provider rate limiter
//! - [`dormancy`] — process-wide latch entered on rate limits
//! - [`backend`] — "send one prompt, get one reply" over CLI or HTTP
//! - [`agent`] — the supervised agent runtime around a backend
//! - [`team`] — bounded-concurrency engineer scheduling
//! - [`issue`] — issue model and TOML-file store
//! - [`sync`] — tracker polling, events feed, idle detection
//! - [`orchestrator`] — the command loop tying it all together
//! - [`config`] — typed configuration

pub mod agent;
pub mod backend;
pub mod chatlog;
pub mod config;
pub mod dormancy;
pub mod issue;
pub mod orchestrator;
pub mod sync;
pub mod team;
pub mod throttle;
