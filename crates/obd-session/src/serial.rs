//! Serial-port transport
//!
//! Bluetooth SPP adapters show up as RFCOMM serial devices (`/dev/rfcomm0`),
//! so the same transport serves USB and Bluetooth ELM327 clones.

use crate::error::ObdError;
use crate::transport::Transport;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

/// Size of a single read from the port
const READ_CHUNK: usize = 256;

/// [`Transport`] over a tokio-serial port
pub struct SerialTransport {
    /// Serial device path (e.g. "/dev/rfcomm0" or "COM3")
    device: String,
    baud_rate: u32,
    port: Option<SerialStream>,
}

impl SerialTransport {
    /// Create a transport for `device`; nothing is opened until [`Transport::open`]
    pub fn new(device: &str, baud_rate: u32) -> Self {
        Self {
            device: device.to_string(),
            baud_rate,
            port: None,
        }
    }

    /// Device path this transport points at
    pub fn device(&self) -> &str {
        &self.device
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<(), ObdError> {
        info!("Opening {} at {} baud", self.device, self.baud_rate);
        let port = tokio_serial::new(&self.device, self.baud_rate).open_native_async()?;
        self.port = Some(port);
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ObdError> {
        let port = self.port.as_mut().ok_or(ObdError::NotConnected)?;
        port.write_all(bytes).await?;
        port.flush().await?;
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ObdError> {
        let port = self.port.as_mut().ok_or(ObdError::NotConnected)?;
        let mut buf = [0u8; READ_CHUNK];

        match tokio::time::timeout(timeout, port.read(&mut buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => {
                // EOF: the remote end dropped the link
                self.port = None;
                Err(ObdError::Transport(format!("{} closed", self.device)))
            }
            Ok(Ok(n)) => Ok(Some(buf[..n].to_vec())),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn close(&mut self) -> Result<(), ObdError> {
        if self.port.take().is_some() {
            debug!("Closed {}", self.device);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}
