//! Byte-stream transport boundary
//!
//! The session never constructs a Bluetooth or serial link itself; the host
//! hands it something implementing [`Transport`].

use crate::error::ObdError;
use async_trait::async_trait;
use std::time::Duration;

/// Bidirectional byte stream to an ELM327 adapter
#[async_trait]
pub trait Transport: Send {
    /// Open the underlying link
    async fn open(&mut self) -> Result<(), ObdError>;

    /// Write all bytes to the adapter
    async fn write(&mut self, bytes: &[u8]) -> Result<(), ObdError>;

    /// Read whatever bytes are available, waiting at most `timeout`
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ObdError>;

    /// Close the link; closing an already closed link is a no-op
    async fn close(&mut self) -> Result<(), ObdError>;

    /// Whether the link is open and usable
    fn is_open(&self) -> bool;
}
