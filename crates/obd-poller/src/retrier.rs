//! Bounded retry around single PID reads

use async_trait::async_trait;
use obd_session::{ObdError, PhysicalValue, Session, Transport};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Anything that can perform one PID read
#[async_trait]
pub trait ParameterSource: Send + Sync {
    async fn read_parameter(&self, pid: &str) -> Result<PhysicalValue, ObdError>;
}

#[async_trait]
impl<T: Transport + 'static> ParameterSource for Session<T> {
    async fn read_parameter(&self, pid: &str) -> Result<PhysicalValue, ObdError> {
        Session::read_parameter(self, pid).await
    }
}

/// Retry policy for a polled PID
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Attempts before giving up (at least one is always made)
    pub max_attempts: u32,
    /// Pause between attempts in milliseconds
    pub interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            // Older K-Line buses need settle time between queries
            interval_ms: 1200,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Where a poll stands after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollPhase {
    /// Attempt gave nothing, another one follows
    Retrying,
    Succeeded,
    /// Last attempt gave nothing
    Exhausted,
}

/// Progress report emitted after every attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollStatus {
    /// Human-readable parameter name, e.g. "Engine Load"
    pub label: String,
    pub pid: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub phase: PollPhase,
}

/// Sink for poll progress
pub trait PollObserver: Send {
    fn on_status(&mut self, status: &PollStatus);
}

impl<F> PollObserver for F
where
    F: FnMut(&PollStatus) + Send,
{
    fn on_status(&mut self, status: &PollStatus) {
        self(status)
    }
}

impl PollObserver for mpsc::Sender<PollStatus> {
    fn on_status(&mut self, status: &PollStatus) {
        // Progress is best-effort; a slow consumer must not stall the bus
        let _ = self.try_send(status.clone());
    }
}

/// Terminal result of a poll
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    /// Decoded value, `Unavailable` when every attempt failed
    pub value: PhysicalValue,
    /// Attempts made, always >= 1
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Repeats a PID read until it yields a value or attempts run out
pub struct PollingRetrier<'a, S: ?Sized> {
    source: &'a S,
    config: PollConfig,
    cancel: CancellationToken,
}

impl<'a, S: ParameterSource + ?Sized> PollingRetrier<'a, S> {
    pub fn new(source: &'a S, config: PollConfig) -> Self {
        Self {
            source,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort between attempts when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Poll `pid`, reporting progress to `observer` after every attempt
    ///
    /// Running out of attempts is not an error: the outcome carries
    /// `Unavailable`. A command timeout counts as a failed attempt; any other
    /// error aborts the poll. Cancellation is checked between attempts, never
    /// in the middle of a command.
    pub async fn poll<O: PollObserver + ?Sized>(
        &self,
        pid: &str,
        label: &str,
        observer: &mut O,
    ) -> Result<PollOutcome, ObdError> {
        let max_attempts = self.config.max_attempts.max(1);
        let started = Instant::now();
        info!("Reading {} ({})", label, pid);

        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ObdError::Cancelled);
            }
            attempt += 1;

            let value = match self.source.read_parameter(pid).await {
                Ok(value) => value,
                Err(e @ ObdError::Timeout { .. }) => {
                    warn!("{} attempt {} timed out: {}", label, attempt, e);
                    PhysicalValue::Unavailable
                }
                Err(e) => return Err(e),
            };

            let phase = if value.is_available() {
                PollPhase::Succeeded
            } else if attempt >= max_attempts {
                PollPhase::Exhausted
            } else {
                PollPhase::Retrying
            };

            observer.on_status(&PollStatus {
                label: label.to_string(),
                pid: pid.to_string(),
                attempt,
                max_attempts,
                phase,
            });

            match phase {
                PollPhase::Succeeded => {
                    debug!("{} = {} after {} attempt(s)", label, value, attempt);
                    return Ok(PollOutcome {
                        value,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
                PollPhase::Exhausted => {
                    warn!("{} unavailable after {} attempts", label, attempt);
                    return Ok(PollOutcome {
                        value,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
                PollPhase::Retrying => {
                    debug!("Reading {} (retry {})", label, attempt);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(ObdError::Cancelled),
                        _ = tokio::time::sleep(self.config.interval()) => {}
                    }
                }
            }
        }
    }
}
