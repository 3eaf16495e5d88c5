//! ELM327 command channel
//!
//! Frames ASCII commands onto a [`Transport`], collects the reply up to the
//! `>` prompt and strips adapter noise. The whole write/read cycle runs under
//! one async mutex, so a second command can never interleave with the reply
//! of the first.

use crate::error::ObdError;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Command terminator expected by the adapter
pub const COMMAND_TERMINATOR: u8 = b'\r';

/// Prompt the adapter prints when it is ready for the next command
pub const PROMPT: u8 = b'>';

/// Status tokens the adapter mixes into replies
const NOISE_TOKENS: [&str; 7] = [
    "SEARCHING",
    "BUSINIT:",
    "BUSINIT",
    "NODATA",
    "STOPPED",
    "OK",
    "...",
];

/// Replies that mean the request never reached a responding ECU
const ERROR_MARKERS: [&str; 2] = ["UNABLETOCONNECT", "ERROR"];

/// Upper bound on chunks read while draining after a timeout
const MAX_DRAIN_CHUNKS: usize = 16;

/// How long a command may take, by kind of command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Adapter reset (`AT Z`, `AT WS`, `AT D`): the chip reboots
    Reset,
    /// Any other AT configuration command
    Config,
    /// OBD request sent to the vehicle bus
    Query,
}

/// One request unit, e.g. `AT Z` or `0105`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command(pub(crate) String);

impl Command {
    /// Build a command, rejecting text that would break framing
    pub fn new(text: impl Into<String>) -> Result<Self, ObdError> {
        let text = text.into();
        let trimmed = text.trim();
        if trimmed.is_empty()
            || !trimmed.is_ascii()
            || trimmed.bytes().any(|b| b == b'\r' || b == b'\n' || b == PROMPT)
        {
            return Err(ObdError::InvalidCommand(text));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Command text uppercased with spaces removed (`AT SP 5` -> `ATSP5`)
    pub fn compact(&self) -> String {
        self.0
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect::<String>()
            .to_ascii_uppercase()
    }

    pub fn class(&self) -> CommandClass {
        let compact = self.compact();
        match compact.as_str() {
            "ATZ" | "ATWS" | "ATD" => CommandClass::Reset,
            c if c.starts_with("AT") => CommandClass::Config,
            _ => CommandClass::Query,
        }
    }

    fn framed(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.0.len() + 1);
        bytes.extend_from_slice(self.0.as_bytes());
        bytes.push(COMMAND_TERMINATOR);
        bytes
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sanitized adapter reply: uppercase, no whitespace, echo or status noise
///
/// Line boundaries survive as frames, since each line the adapter prints is
/// one ECU message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    compact: String,
    frames: Vec<String>,
    unfiltered: String,
}

impl RawResponse {
    /// Clean up the text the adapter printed before its prompt
    pub fn sanitize(command: &Command, text: &str) -> Self {
        let mut lines = text
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .peekable();

        // Echo is its own line when `AT E0` has not been applied yet
        let echoed = command.compact();
        if lines.peek().is_some_and(|first| strip_whitespace(first).eq_ignore_ascii_case(&echoed)) {
            lines.next();
        }

        let lines: Vec<&str> = lines.collect();
        let frames: Vec<String> = lines
            .iter()
            .map(|line| strip_noise(line))
            .filter(|frame| !frame.is_empty())
            .collect();

        Self {
            compact: frames.concat(),
            frames,
            unfiltered: lines.iter().map(|line| strip_whitespace(line)).collect(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.compact
    }

    /// Non-empty sanitized lines, in arrival order
    pub fn frames(&self) -> impl Iterator<Item = &str> {
        self.frames.iter().map(String::as_str)
    }

    /// Reply with only echo and whitespace removed; case and status text kept
    pub fn unfiltered(&self) -> &str {
        &self.unfiltered
    }

    pub fn is_empty(&self) -> bool {
        self.compact.is_empty()
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.compact.contains(pattern)
    }

    /// Whether the adapter rejected the command (`?`)
    pub fn is_rejected(&self) -> bool {
        self.compact.contains('?')
    }

    /// Whether the reply carries a bus or adapter error report
    pub fn has_error_marker(&self) -> bool {
        self.is_rejected() || ERROR_MARKERS.iter().any(|marker| self.compact.contains(marker))
    }

    /// Text following the first occurrence of `header`
    pub fn payload_after(&self, header: &str) -> Option<&str> {
        self.compact
            .find(header)
            .map(|start| &self.compact[start + header.len()..])
    }
}

fn strip_whitespace(line: &str) -> String {
    line.chars().filter(|c| !c.is_whitespace()).collect()
}

fn strip_noise(line: &str) -> String {
    let mut frame = strip_whitespace(line).to_uppercase();
    for token in NOISE_TOKENS {
        frame = frame.replace(token, "");
    }
    frame
}

impl fmt::Display for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.compact)
    }
}

/// Per-class command timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTimeouts {
    /// Adapter reset timeout in milliseconds
    pub reset_ms: u64,
    /// AT configuration timeout in milliseconds
    pub config_ms: u64,
    /// OBD query timeout in milliseconds
    pub query_ms: u64,
    /// Window for draining late bytes after a timeout, in milliseconds
    pub drain_ms: u64,
    /// Longest wait for the prompt of a reply that outlived its drain, in
    /// milliseconds
    pub resync_ms: u64,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            reset_ms: 5000,
            config_ms: 2000,
            query_ms: 3000,
            drain_ms: 250,
            resync_ms: 3000,
        }
    }
}

impl CommandTimeouts {
    pub fn for_class(&self, class: CommandClass) -> Duration {
        Duration::from_millis(match class {
            CommandClass::Reset => self.reset_ms,
            CommandClass::Config => self.config_ms,
            CommandClass::Query => self.query_ms,
        })
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_ms)
    }

    pub fn resync_window(&self) -> Duration {
        Duration::from_millis(self.resync_ms)
    }
}

/// Framing of the byte stream between two commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Last reply ended with its prompt
    Clean,
    /// A timed-out reply never showed its prompt; `partial` if some of it
    /// arrived
    Abandoned { partial: bool },
}

/// Exclusive access to the transport, held for a full command cycle
pub struct Link<T> {
    transport: T,
    drain_window: Duration,
    resync_window: Duration,
    framing: Framing,
}

impl<T: Transport> Link<T> {
    /// Write `command` and wait for the prompt
    pub async fn exchange(
        &mut self,
        command: &Command,
        timeout: Duration,
    ) -> Result<RawResponse, ObdError> {
        if !self.transport.is_open() {
            return Err(ObdError::NotConnected);
        }
        self.resync().await?;

        debug!("-> {}", command);
        self.transport.write(&command.framed()).await?;

        let deadline = Instant::now() + timeout;
        let mut buf = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let chunk = if remaining.is_zero() {
                None
            } else {
                self.transport.read(remaining).await?
            };

            let Some(chunk) = chunk else {
                warn!(
                    "No prompt for `{}` within {}ms ({} bytes pending)",
                    command,
                    timeout.as_millis(),
                    buf.len()
                );
                let (prompt_seen, drained) = self.discard_until_prompt(self.drain_window).await?;
                if !prompt_seen {
                    warn!("Reply to `{}` still outstanding after drain", command);
                    self.framing = Framing::Abandoned {
                        partial: !buf.is_empty() || drained > 0,
                    };
                }
                return Err(ObdError::Timeout {
                    command: command.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            };

            buf.extend_from_slice(&chunk);
            if let Some(end) = buf.iter().position(|&b| b == PROMPT) {
                if end + 1 < buf.len() {
                    debug!("Discarding {} bytes after prompt", buf.len() - end - 1);
                }
                buf.truncate(end);
                break;
            }
        }

        let text = String::from_utf8_lossy(&buf);
        let response = RawResponse::sanitize(command, &text);
        debug!("<- {:?} => {}", text, response);
        Ok(response)
    }

    /// Whether the last reply on this link ended with its prompt
    pub fn is_framed(&self) -> bool {
        self.framing == Framing::Clean
    }

    /// Bring the stream back to a prompt boundary before the next write
    ///
    /// An abandoned reply gets one more window to finish. If nothing of it
    /// ever arrived the adapter dropped the command; if it arrived in part
    /// and still has no prompt, framing is lost and the transport is closed.
    async fn resync(&mut self) -> Result<(), ObdError> {
        if let Framing::Abandoned { partial } = self.framing {
            let (prompt_seen, drained) = self.discard_until_prompt(self.resync_window).await?;
            if !prompt_seen && (partial || drained > 0) {
                warn!("Adapter framing lost, closing transport");
                if let Err(e) = self.transport.close().await {
                    debug!("Ignoring close error: {}", e);
                }
                return Err(ObdError::Transport(
                    "adapter reply never reached its prompt".to_string(),
                ));
            }
            if !prompt_seen {
                debug!("Abandoned command never answered");
            }
            self.framing = Framing::Clean;
        }

        // Anything already buffered predates the next command
        let mut stale = 0usize;
        for _ in 0..MAX_DRAIN_CHUNKS {
            match self.transport.read(Duration::ZERO).await? {
                Some(chunk) => stale += chunk.len(),
                None => break,
            }
        }
        if stale > 0 {
            debug!("Discarded {} stale bytes before write", stale);
        }
        Ok(())
    }

    /// Swallow input until a prompt or a quiet `window`; returns whether a
    /// prompt was seen and how many bytes went
    async fn discard_until_prompt(&mut self, window: Duration) -> Result<(bool, usize), ObdError> {
        let mut drained = 0usize;
        let mut prompt_seen = false;
        for _ in 0..MAX_DRAIN_CHUNKS {
            match self.transport.read(window).await? {
                Some(chunk) => {
                    drained += chunk.len();
                    if chunk.contains(&PROMPT) {
                        prompt_seen = true;
                        break;
                    }
                }
                None => break,
            }
        }
        if drained > 0 {
            debug!("Drained {} late bytes", drained);
        }
        Ok((prompt_seen, drained))
    }

    /// Close (if needed) and open the transport again
    pub async fn reopen(&mut self) -> Result<(), ObdError> {
        if let Err(e) = self.transport.close().await {
            debug!("Ignoring close error before reopen: {}", e);
        }
        self.framing = Framing::Clean;
        self.transport.open().await
    }

    pub async fn close(&mut self) -> Result<(), ObdError> {
        self.framing = Framing::Clean;
        self.transport.close().await
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

/// Single-flight command channel shared by every component of a session
pub struct CommandChannel<T> {
    link: Mutex<Link<T>>,
    timeouts: CommandTimeouts,
}

impl<T: Transport> CommandChannel<T> {
    pub fn new(transport: T, timeouts: CommandTimeouts) -> Self {
        Self {
            link: Mutex::new(Link {
                transport,
                drain_window: timeouts.drain_window(),
                resync_window: timeouts.resync_window(),
                framing: Framing::Clean,
            }),
            timeouts,
        }
    }

    /// Send one command using the timeout for its class
    pub async fn send(&self, command: &Command) -> Result<RawResponse, ObdError> {
        self.send_with_timeout(command, self.timeout_for(command)).await
    }

    /// Send one command with an explicit timeout
    pub async fn send_with_timeout(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<RawResponse, ObdError> {
        let mut link = self.link.lock().await;
        link.exchange(command, timeout).await
    }

    /// Hold the channel for a multi-command sequence
    pub async fn lock(&self) -> MutexGuard<'_, Link<T>> {
        self.link.lock().await
    }

    pub fn timeout_for(&self, command: &Command) -> Duration {
        self.timeouts.for_class(command.class())
    }
}
