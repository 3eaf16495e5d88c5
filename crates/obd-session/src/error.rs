//! OBD-II Session Error Types

use crate::handshake::HandshakeStep;
use thiserror::Error;

/// Errors that can occur while talking to an ELM327 adapter
///
/// A PID that cannot be decoded is not an error: it degrades to
/// [`PhysicalValue::Unavailable`](crate::PhysicalValue::Unavailable).
#[derive(Debug, Error)]
pub enum ObdError {
    /// Transport has not been opened (or was closed)
    #[error("OBD adapter is not connected")]
    NotConnected,

    /// No prompt arrived before the per-command timeout
    #[error("Timeout waiting for `{command}` response after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// The underlying byte stream reported an error
    #[error("Transport error: {0}")]
    Transport(String),

    /// A handshake step failed; the session is left in `Failed`
    #[error("Handshake failed at step {step}: {source}")]
    HandshakeFailed {
        step: HandshakeStep,
        #[source]
        source: Box<ObdError>,
    },

    /// Adapter answered with something the step cannot accept
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Command text cannot be framed on the wire
    #[error("Invalid command: {0:?}")]
    InvalidCommand(String),

    /// Protocol identifier not supported by this core
    #[error("Protocol not supported: {0}")]
    UnsupportedProtocol(String),

    /// Operation aborted by a cancellation signal
    #[error("Operation cancelled")]
    Cancelled,
}

impl ObdError {
    /// Whether the error means the link itself is gone, as opposed to a
    /// single slow or rejected command.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, ObdError::NotConnected | ObdError::Transport(_))
    }

    pub(crate) fn at_step(self, step: HandshakeStep) -> Self {
        ObdError::HandshakeFailed {
            step,
            source: Box::new(self),
        }
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Transport(err.to_string())
    }
}

impl From<tokio_serial::Error> for ObdError {
    fn from(err: tokio_serial::Error) -> Self {
        ObdError::Transport(err.to_string())
    }
}
