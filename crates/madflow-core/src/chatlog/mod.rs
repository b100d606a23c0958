//! Append-only chatlog: the shared message bus between agents.
//!
//! Every message is one line of a plain text file:
//!
//! ```text
//! [2025-07-01T09:30:00] [@engineer-2] superintendent: issue local-004 をお願いします
//! ```
//!
//! Agents append lines by running shell commands; the runtime appends on
//! their behalf and tails the file for new messages. Readers tolerate
//! arbitrary garbage between valid lines — anything that does not match the
//! grammar is skipped.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Line grammar: `[timestamp] [@recipient] sender: body`.
static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})\] \[@([^\]]+)\] ([^:]+): (.+)$")
        .expect("chatlog line regex is valid")
});

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// How often the tailer re-stats the file.
const POLL_TICK: Duration = Duration::from_millis(500);

/// Buffered messages per subscription.
const SUBSCRIPTION_CAPACITY: usize = 16;

/// One parsed chatlog line.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub timestamp: NaiveDateTime,
    pub recipient: String,
    pub sender: String,
    pub body: String,
    /// The original line, without trailing newline.
    pub raw: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatlogError {
    #[error("line does not match the chatlog grammar")]
    InvalidFormat,
    #[error("timestamp does not parse: {0}")]
    BadTimestamp(String),
    #[error("chatlog io: {0}")]
    Io(#[from] std::io::Error),
}

/// Format one chatlog line with the current local timestamp.
pub fn format_message(recipient: &str, sender: &str, body: &str) -> String {
    format!(
        "[{}] [@{}] {}: {}",
        Local::now().format(TIMESTAMP_FORMAT),
        recipient,
        sender,
        body
    )
}

/// Parse one chatlog line.
pub fn parse_message(line: &str) -> Result<Message, ChatlogError> {
    let caps = LINE_RE.captures(line).ok_or(ChatlogError::InvalidFormat)?;
    let ts_str = &caps[1];
    let timestamp = NaiveDateTime::parse_from_str(ts_str, TIMESTAMP_FORMAT)
        .map_err(|_| ChatlogError::BadTimestamp(ts_str.to_string()))?;

    Ok(Message {
        timestamp,
        recipient: caps[2].to_string(),
        sender: caps[3].to_string(),
        body: caps[4].to_string(),
        raw: line.to_string(),
    })
}

/// Handle to the chatlog file. Cheap to clone; every operation re-opens the
/// file, so concurrent readers and writers never share descriptors.
#[derive(Debug, Clone)]
pub struct Chatlog {
    path: PathBuf,
}

impl Chatlog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one formatted line. Opens with O_APPEND so concurrent writers
    /// interleave at line granularity as long as a line stays under the
    /// platform's atomic append size (4 KiB is safe everywhere we run).
    pub fn append(&self, recipient: &str, sender: &str, body: &str) -> Result<(), ChatlogError> {
        let line = format_message(recipient, sender, body);
        self.append_raw(&line)
    }

    /// Append an already-formatted line verbatim.
    pub fn append_raw(&self, line: &str) -> Result<(), ChatlogError> {
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o644);
        }
        let mut file = opts.open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Read the whole file and return every message addressed to `recipient`.
    /// A missing file is an empty chatlog, not an error.
    pub fn poll(&self, recipient: &str) -> Vec<Message> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        content
            .lines()
            .filter_map(|line| parse_message(line).ok())
            .filter(|m| m.recipient == recipient)
            .collect()
    }

    /// Subscribe to messages addressed to `recipient` that are appended
    /// *after* this call. Lines already in the file are not replayed.
    pub fn watch(&self, cancel: CancellationToken, recipient: &str) -> mpsc::Receiver<Message> {
        self.spawn_tailer(cancel, Some(recipient.to_string()))
    }

    /// Like [`Chatlog::watch`] but without a recipient filter.
    pub fn watch_all(&self, cancel: CancellationToken) -> mpsc::Receiver<Message> {
        self.spawn_tailer(cancel, None)
    }

    fn spawn_tailer(
        &self,
        cancel: CancellationToken,
        recipient: Option<String>,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut tailer = Tailer::at_end(self.path.clone());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(recipient = recipient.as_deref().unwrap_or("*"), "chatlog watch stopped");
                        return;
                    }
                    _ = tokio::time::sleep(POLL_TICK) => {}
                }

                let messages = match tailer.read_new() {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "chatlog tail read failed");
                        continue;
                    }
                };

                for msg in messages {
                    if let Some(ref want) = recipient {
                        if msg.recipient != *want {
                            continue;
                        }
                    }
                    if tx.send(msg).await.is_err() {
                        // Subscriber dropped the receiver.
                        return;
                    }
                }
            }
        });

        rx
    }

    /// Keep only the trailing `max_lines` lines, atomically (temp file in the
    /// same directory + rename). A file with `max_lines` or fewer lines is
    /// left untouched.
    pub fn truncate(&self, max_lines: usize) -> Result<(), ChatlogError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = content.lines().collect();
        if lines.len() <= max_lines {
            return Ok(());
        }

        let keep = &lines[lines.len() - max_lines..];
        let mut out = keep.join("\n");
        out.push('\n');

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, out)?;
        fs::rename(&tmp, &self.path)?;

        debug!(dropped = lines.len() - max_lines, kept = max_lines, "chatlog truncated");
        Ok(())
    }
}

// ── Tailer ──────────────────────────────────────────────────────────

/// Offset-tracking reader used by [`Chatlog::watch`].
///
/// The offset only ever moves past whole lines, so a writer caught mid-append
/// just delays delivery by one tick. When the file shrinks below the stored
/// offset a truncation happened underneath us: skip straight to the new end
/// without replaying the retained prefix, because those lines were already
/// observed (and acting on them twice would, for example, re-create teams).
#[derive(Debug)]
pub struct Tailer {
    path: PathBuf,
    offset: u64,
}

impl Tailer {
    /// Start tailing at the current end of the file (0 if it does not exist).
    pub fn at_end(path: PathBuf) -> Self {
        let offset = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self { path, offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read every complete line appended since the last call.
    pub fn read_new(&mut self) -> std::io::Result<Vec<Message>> {
        let size = match fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        if size < self.offset {
            // Truncated underneath us; resume at the new end.
            self.offset = size;
            return Ok(Vec::new());
        }
        if size == self.offset {
            return Ok(Vec::new());
        }

        let mut file = fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::with_capacity((size - self.offset) as usize);
        file.take(size - self.offset).read_to_end(&mut buf)?;

        // Only consume through the last newline; a partial trailing line is
        // picked up on the next tick once the writer finishes it.
        let consumed = match buf.iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => return Ok(Vec::new()),
        };

        let chunk = String::from_utf8_lossy(&buf[..consumed]);
        let messages = chunk
            .lines()
            .filter_map(|line| parse_message(line).ok())
            .collect();

        self.offset += consumed as u64;
        Ok(messages)
    }
}
