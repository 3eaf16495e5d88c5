//! ELM327 reset/configure sequence
//!
//! Every step is one command followed by a settle delay. Slow K-Line buses
//! (ISO 14230) need those pauses, so each one is a named, tunable setting.

use crate::channel::{Command, CommandChannel, Link};
use crate::error::ObdError;
use crate::protocol::ObdProtocol;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Steps of the handshake, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// `AT Z`: full adapter reset
    Reset,
    /// `AT E0`: echo off
    EchoOff,
    /// `AT S0`: no spaces between response bytes
    SpacesOff,
    /// `AT SP <id>`: force the protocol
    SelectProtocol,
    /// `0100`: supported-PIDs probe, proves the vehicle bus answers
    Probe,
}

impl HandshakeStep {
    pub const SEQUENCE: [HandshakeStep; 5] = [
        HandshakeStep::Reset,
        HandshakeStep::EchoOff,
        HandshakeStep::SpacesOff,
        HandshakeStep::SelectProtocol,
        HandshakeStep::Probe,
    ];

    /// Command issued for this step
    pub fn command(&self, protocol: ObdProtocol) -> Command {
        match self {
            HandshakeStep::Reset => Command("AT Z".to_string()),
            HandshakeStep::EchoOff => Command("AT E0".to_string()),
            HandshakeStep::SpacesOff => Command("AT S0".to_string()),
            HandshakeStep::SelectProtocol => protocol.select_command(),
            HandshakeStep::Probe => Command("0100".to_string()),
        }
    }

    /// Whether a failure here points at the vehicle bus rather than the adapter
    pub fn involves_vehicle(&self) -> bool {
        matches!(self, HandshakeStep::Probe)
    }
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeStep::Reset => "reset (AT Z)",
            HandshakeStep::EchoOff => "echo off (AT E0)",
            HandshakeStep::SpacesOff => "spaces off (AT S0)",
            HandshakeStep::SelectProtocol => "protocol select (AT SP)",
            HandshakeStep::Probe => "bus probe (0100)",
        };
        f.write_str(name)
    }
}

/// Settle delays after each handshake step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Pause after `AT Z` while the adapter chip reboots (ms)
    pub reset_settle_ms: u64,
    /// Pause after `AT E0` (ms)
    pub echo_settle_ms: u64,
    /// Pause after `AT S0` (ms)
    pub spacing_settle_ms: u64,
    /// Pause after `AT SP` (ms)
    pub protocol_settle_ms: u64,
    /// Pause after the probe for bus init to finish (ms)
    pub probe_settle_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            reset_settle_ms: 800,
            echo_settle_ms: 200,
            spacing_settle_ms: 200,
            protocol_settle_ms: 200,
            probe_settle_ms: 500,
        }
    }
}

impl HandshakeConfig {
    pub fn settle_after(&self, step: HandshakeStep) -> Duration {
        Duration::from_millis(match step {
            HandshakeStep::Reset => self.reset_settle_ms,
            HandshakeStep::EchoOff => self.echo_settle_ms,
            HandshakeStep::SpacesOff => self.spacing_settle_ms,
            HandshakeStep::SelectProtocol => self.protocol_settle_ms,
            HandshakeStep::Probe => self.probe_settle_ms,
        })
    }
}

/// Run the full sequence on a held link
///
/// Stops at the first failing step; later steps are never sent.
pub(crate) async fn run<T: Transport>(
    channel: &CommandChannel<T>,
    link: &mut Link<T>,
    protocol: ObdProtocol,
    config: &HandshakeConfig,
) -> Result<(), ObdError> {
    if protocol.is_k_line() {
        debug!("K-Line protocol selected, expect slow bus init");
    }

    for step in HandshakeStep::SEQUENCE {
        let command = step.command(protocol);
        info!("Handshake step: {}", step);

        let response = link
            .exchange(&command, channel.timeout_for(&command))
            .await
            .map_err(|e| e.at_step(step))?;

        if response.is_rejected() {
            return Err(ObdError::InvalidResponse(format!("`{command}` rejected")).at_step(step));
        }
        if step == HandshakeStep::Probe && (response.is_empty() || response.has_error_marker()) {
            return Err(ObdError::InvalidResponse("vehicle bus did not answer".to_string())
                .at_step(step));
        }

        tokio::time::sleep(config.settle_after(step)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_commands() {
        let protocol = ObdProtocol::Iso14230_4KwpFast;
        let commands: Vec<_> = HandshakeStep::SEQUENCE
            .iter()
            .map(|s| s.command(protocol).to_string())
            .collect();
        assert_eq!(commands, vec!["AT Z", "AT E0", "AT S0", "AT SP 5", "0100"]);
    }

    #[test]
    fn test_reset_has_longest_settle() {
        let config = HandshakeConfig::default();
        let reset = config.settle_after(HandshakeStep::Reset);
        for step in HandshakeStep::SEQUENCE {
            assert!(config.settle_after(step) <= reset);
        }
    }
}
