//! Scripted in-memory ELM327 for tests
//!
//! Replies are looked up by the command text with spaces removed. Each
//! command holds a queue of replies; the last one is sticky. Unscripted
//! commands get what a healthy ELM327 on a live bus would answer.

use crate::error::ObdError;
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// One scripted adapter answer
#[derive(Debug, Clone)]
pub enum Reply {
    /// Chunks released after the given delay from the write, sent verbatim
    Chunks(Vec<(Duration, String)>),
    /// Held back until the gate is notified, then sent with prompt
    Gated(Arc<Notify>, String),
    /// The write itself fails
    WriteError,
}

impl Reply {
    /// Response text followed by the usual `\r\r>` trailer
    pub fn text(body: &str) -> Self {
        Reply::Chunks(vec![(Duration::ZERO, format!("{body}\r\r>"))])
    }

    /// Exact bytes, no prompt added
    pub fn raw(bytes: &str) -> Self {
        Reply::Chunks(vec![(Duration::ZERO, bytes.to_string())])
    }

    /// Adapter never answers
    pub fn silent() -> Self {
        Reply::Chunks(Vec::new())
    }

    /// Response held until `gate` is notified
    pub fn gated(gate: Arc<Notify>, body: &str) -> Self {
        Reply::Gated(gate, format!("{body}\r\r>"))
    }
}

#[derive(Default)]
struct MockState {
    open: bool,
    fail_open: bool,
    echo: bool,
    open_count: usize,
    close_count: usize,
    writes: Vec<String>,
    replies: HashMap<String, VecDeque<Reply>>,
    pending: VecDeque<(Instant, Vec<u8>)>,
    gate: Option<Arc<Notify>>,
    awaiting_prompt: bool,
    overlaps: usize,
}

/// Cloneable handle to a scripted adapter; clones share state
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Closed adapter with echo enabled, as after power-on
    pub fn new() -> Self {
        let mock = Self::default();
        mock.lock().echo = true;
        mock
    }

    /// Adapter whose link is already open
    pub fn opened() -> Self {
        let mock = Self::new();
        {
            let mut state = mock.lock();
            state.open = true;
            state.open_count = 1;
        }
        mock
    }

    /// Script a single sticky reply for `command`
    pub fn on(&self, command: &str, reply: Reply) -> &Self {
        self.on_sequence(command, vec![reply])
    }

    /// Script replies served in order; the last one repeats
    pub fn on_sequence(&self, command: &str, replies: Vec<Reply>) -> &Self {
        self.lock()
            .replies
            .insert(compact(command), replies.into_iter().collect());
        self
    }

    /// Make the next `open` fail
    pub fn fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Simulate the remote end dropping (or restoring) the link
    pub fn set_open(&self, open: bool) {
        self.lock().open = open;
    }

    /// Commands written so far, without the carriage return
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    /// Writes issued while a previous command still awaited its prompt
    pub fn overlaps(&self) -> usize {
        self.lock().overlaps
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn compact(command: &str) -> String {
    command
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

fn default_reply(command: &str) -> Reply {
    match command {
        "ATZ" => Reply::text("\rELM327 v1.5"),
        "ATRV" => Reply::text("12.4V"),
        "0100" => Reply::text("SEARCHING...\r41 00 BE 3E B8 11"),
        c if c.starts_with("AT") => Reply::text("OK"),
        _ => Reply::text("NO DATA"),
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<(), ObdError> {
        let mut state = self.lock();
        if state.fail_open {
            return Err(ObdError::Transport("mock open refused".to_string()));
        }
        state.open = true;
        state.open_count += 1;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ObdError> {
        let mut state = self.lock();
        if !state.open {
            return Err(ObdError::NotConnected);
        }

        let text = String::from_utf8_lossy(bytes);
        let command = text.trim_end_matches('\r').to_string();
        let key = compact(&command);

        let reply = match state.replies.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        }
        .unwrap_or_else(|| default_reply(&key));

        if matches!(reply, Reply::WriteError) {
            return Err(ObdError::Transport("mock write failed".to_string()));
        }

        if state.awaiting_prompt {
            state.overlaps += 1;
        }
        state.awaiting_prompt = true;
        state.writes.push(command.clone());

        let echo = if state.echo { format!("{command}\r") } else { String::new() };
        match key.as_str() {
            "ATE0" => state.echo = false,
            "ATE1" => state.echo = true,
            _ => {}
        }

        let now = Instant::now();
        match reply {
            Reply::Chunks(chunks) => {
                let mut first = true;
                for (delay, chunk) in chunks {
                    let chunk = if first { format!("{echo}{chunk}") } else { chunk };
                    first = false;
                    state.pending.push_back((now + delay, chunk.into_bytes()));
                }
            }
            Reply::Gated(gate, body) => {
                state.gate = Some(gate);
                state.pending.push_back((now, format!("{echo}{body}").into_bytes()));
            }
            Reply::WriteError => {}
        }
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ObdError> {
        let gate = {
            let state = self.lock();
            if !state.open {
                return Err(ObdError::NotConnected);
            }
            state.gate.clone()
        };

        if let Some(gate) = gate {
            if tokio::time::timeout(timeout, gate.notified()).await.is_err() {
                return Ok(None);
            }
            self.lock().gate = None;
        }

        let ready_at = self.lock().pending.front().map(|(at, _)| *at);
        let Some(ready_at) = ready_at else {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        };

        let now = Instant::now();
        if ready_at > now {
            if ready_at - now > timeout {
                tokio::time::sleep(timeout).await;
                return Ok(None);
            }
            tokio::time::sleep_until(ready_at).await;
        }

        let mut state = self.lock();
        let chunk = state.pending.pop_front().map(|(_, bytes)| bytes);
        if chunk.as_ref().is_some_and(|bytes| bytes.contains(&b'>')) {
            state.awaiting_prompt = false;
        }
        Ok(chunk)
    }

    async fn close(&mut self) -> Result<(), ObdError> {
        let mut state = self.lock();
        if state.open {
            state.open = false;
            state.close_count += 1;
        }
        state.pending.clear();
        state.awaiting_prompt = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }
}
