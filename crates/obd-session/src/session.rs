//! ELM327 session: one transport, one command channel, one state machine
//!
//! All state transitions go through [`Session::connect`],
//! [`Session::disconnect`] or a link fault observed by an operation.

use crate::channel::{Command, CommandChannel, CommandTimeouts};
use crate::dtc::{DtcCode, DtcDecoder};
use crate::error::ObdError;
use crate::handshake::{self, HandshakeConfig};
use crate::pid::{ParameterDecoder, PhysicalValue};
use crate::protocol::ObdProtocol;
use crate::transport::Transport;
use crate::voltage::{filter_voltage, VoltageReading, READ_VOLTAGE_COMMAND};
use tokio::sync::watch;
use tracing::{info, warn};

/// Connection lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Running the AT sequence
    Handshaking,
    Ready,
    Failed,
}

/// Owned ELM327 session
pub struct Session<T> {
    channel: CommandChannel<T>,
    state: watch::Sender<ConnectionState>,
    handshake: HandshakeConfig,
    protocol: watch::Sender<Option<ObdProtocol>>,
}

impl<T: Transport> Session<T> {
    /// Session with default timeouts and settle delays
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, HandshakeConfig::default(), CommandTimeouts::default())
    }

    pub fn with_config(transport: T, handshake: HandshakeConfig, timeouts: CommandTimeouts) -> Self {
        Self {
            channel: CommandChannel::new(transport, timeouts),
            state: watch::Sender::new(ConnectionState::Disconnected),
            handshake,
            protocol: watch::Sender::new(None),
        }
    }

    /// Open the transport if needed and run the adapter handshake
    ///
    /// On an already open, live transport the link is reused but the whole
    /// AT sequence still runs, so no earlier adapter setup survives. A link
    /// left waiting on an abandoned reply is reopened instead.
    pub async fn connect(&self, protocol: ObdProtocol) -> Result<(), ObdError> {
        let mut link = self.channel.lock().await;

        if link.transport().is_open() && link.is_framed() {
            info!("Transport already open, resetting adapter");
        } else {
            self.set_state(ConnectionState::Connecting);
            if let Err(e) = link.reopen().await {
                warn!("Failed to open transport: {}", e);
                self.set_state(ConnectionState::Failed);
                return Err(e);
            }
        }

        self.set_state(ConnectionState::Handshaking);
        self.protocol.send_replace(None);

        match handshake::run(&self.channel, &mut link, protocol, &self.handshake).await {
            Ok(()) => {
                self.protocol.send_replace(Some(protocol));
                self.set_state(ConnectionState::Ready);
                info!("Adapter ready on {}", protocol);
                Ok(())
            }
            Err(e) => {
                warn!("{}", e);
                self.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// Close the transport
    pub async fn disconnect(&self) {
        let mut link = self.channel.lock().await;
        if let Err(e) = link.close().await {
            warn!("Error closing transport: {}", e);
        }
        self.protocol.send_replace(None);
        self.set_state(ConnectionState::Disconnected);
        info!("Session disconnected");
    }

    /// Single-attempt PID read
    pub async fn read_parameter(&self, pid: &str) -> Result<PhysicalValue, ObdError> {
        let result = ParameterDecoder::new(&self.channel).read(pid).await;
        self.observe(result)
    }

    /// Mode 03 trouble-code scan
    pub async fn read_dtc(&self) -> Result<Vec<DtcCode>, ObdError> {
        let result = DtcDecoder::new(&self.channel).read_dtc().await;
        self.observe(result)
    }

    /// Battery voltage with the fallback policy of [`filter_voltage`]
    pub async fn read_voltage(&self) -> Result<VoltageReading, ObdError> {
        let result = self.channel.send(&Command::new(READ_VOLTAGE_COMMAND)?).await;
        let reading = filter_voltage(self.observe(result)?.unfiltered());
        if reading.is_fallback() {
            warn!("Unusable voltage reply, reporting fallback reading");
        }
        Ok(reading)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Protocol forced by the last successful handshake
    pub fn protocol(&self) -> Option<ObdProtocol> {
        *self.protocol.borrow()
    }

    /// A dead link fails the session; slow or rejected commands do not
    fn observe<V>(&self, result: Result<V, ObdError>) -> Result<V, ObdError> {
        if let Err(e) = &result {
            if e.is_link_fault() && self.state() == ConnectionState::Ready {
                warn!("Link fault, session failed: {}", e);
                self.set_state(ConnectionState::Failed);
            }
        }
        result
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("Session state {:?} -> {:?}", previous, next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeStep;
    use crate::mock::{MockTransport, Reply};

    const HANDSHAKE: [&str; 5] = ["AT Z", "AT E0", "AT S0", "AT SP 5", "0100"];

    #[tokio::test(start_paused = true)]
    async fn test_connect_runs_full_sequence() {
        let mock = MockTransport::new();
        let session = Session::new(mock.clone());
        assert_eq!(session.state(), ConnectionState::Disconnected);

        session.connect(ObdProtocol::Iso14230_4KwpFast).await.unwrap();

        assert_eq!(session.state(), ConnectionState::Ready);
        assert_eq!(session.protocol(), Some(ObdProtocol::Iso14230_4KwpFast));
        assert_eq!(mock.writes(), HANDSHAKE);
        assert_eq!(mock.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_transitions_are_observable() {
        let session = Session::new(MockTransport::new());
        let mut rx = session.subscribe_state();

        session.connect(ObdProtocol::Auto).await.unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_failure_stops_before_probe() {
        let mock = MockTransport::new();
        mock.on("AT SP 5", Reply::WriteError);
        let session = Session::new(mock.clone());

        let err = session.connect(ObdProtocol::Iso14230_4KwpFast).await.unwrap_err();

        match err {
            ObdError::HandshakeFailed { step, .. } => assert_eq!(step, HandshakeStep::SelectProtocol),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(session.state(), ConnectionState::Failed);
        assert!(!mock.writes().iter().any(|c| c == "0100"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_protocol_fails_step() {
        let mock = MockTransport::new();
        mock.on("AT SP 5", Reply::text("?"));
        let session = Session::new(mock.clone());

        let err = session.connect(ObdProtocol::Iso14230_4KwpFast).await.unwrap_err();
        assert!(matches!(err, ObdError::HandshakeFailed { step: HandshakeStep::SelectProtocol, .. }));
        assert_eq!(mock.writes().last().map(String::as_str), Some("AT SP 5"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_bus_fails_probe() {
        let mock = MockTransport::new();
        mock.on("0100", Reply::text("SEARCHING...\rUNABLE TO CONNECT"));
        let session = Session::new(mock);

        let err = session.connect(ObdProtocol::Auto).await.unwrap_err();
        match err {
            ObdError::HandshakeFailed { step, .. } => {
                assert_eq!(step, HandshakeStep::Probe);
                assert!(step.involves_vehicle());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(session.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_probe_fails() {
        let mock = MockTransport::new();
        mock.on("0100", Reply::text("NO DATA"));
        let session = Session::new(mock);

        let err = session.connect(ObdProtocol::Auto).await.unwrap_err();
        assert!(matches!(err, ObdError::HandshakeFailed { step: HandshakeStep::Probe, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_adapter_fails_reset() {
        let mock = MockTransport::new();
        mock.on("AT Z", Reply::silent());
        let session = Session::new(mock.clone());

        let err = session.connect(ObdProtocol::Auto).await.unwrap_err();
        match err {
            ObdError::HandshakeFailed { step, source } => {
                assert_eq!(step, HandshakeStep::Reset);
                assert!(matches!(*source, ObdError::Timeout { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(mock.writes(), vec!["AT Z"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure() {
        let mock = MockTransport::new();
        mock.fail_open(true);
        let session = Session::new(mock.clone());

        let err = session.connect(ObdProtocol::Auto).await.unwrap_err();
        assert!(matches!(err, ObdError::Transport(_)));
        assert_eq!(session.state(), ConnectionState::Failed);
        assert!(mock.writes().is_empty());

        // A later attempt starts from scratch
        mock.fail_open(false);
        session.connect(ObdProtocol::Auto).await.unwrap();
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_reuses_live_transport_and_resets() {
        let mock = MockTransport::new();
        let session = Session::new(mock.clone());

        session.connect(ObdProtocol::Iso14230_4KwpFast).await.unwrap();
        session.connect(ObdProtocol::Auto).await.unwrap();

        assert_eq!(mock.open_count(), 1);
        let writes = mock.writes();
        assert_eq!(writes.len(), 10);
        assert_eq!(&writes[5..], ["AT Z", "AT E0", "AT S0", "AT SP 0", "0100"]);
        assert_eq!(session.protocol(), Some(ObdProtocol::Auto));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replaces_dead_transport() {
        let mock = MockTransport::new();
        let session = Session::new(mock.clone());
        session.connect(ObdProtocol::Auto).await.unwrap();

        mock.set_open(false);
        let err = session.read_parameter("0105").await.unwrap_err();
        assert!(matches!(err, ObdError::NotConnected));
        assert_eq!(session.state(), ConnectionState::Failed);

        session.connect(ObdProtocol::Auto).await.unwrap();
        assert_eq!(mock.open_count(), 2);
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_after_handshake() {
        let mock = MockTransport::new();
        mock.on("0105", Reply::text("41 05 5A"));
        mock.on("03", Reply::text("43 04 00 00 00 00 00"));
        mock.on("AT RV", Reply::text("12.6V"));
        let session = Session::new(mock);
        session.connect(ObdProtocol::Auto).await.unwrap();

        assert_eq!(session.read_parameter("0105").await.unwrap().to_string(), "50°C");
        let codes = session.read_dtc().await.unwrap();
        assert_eq!(codes.iter().map(ToString::to_string).collect::<Vec<_>>(), ["P0400"]);
        assert_eq!(
            session.read_voltage().await.unwrap(),
            VoltageReading::Measured("12.6V".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_voltage_uses_fallback() {
        let mock = MockTransport::new();
        mock.on("AT RV", Reply::text("BUFFER FULL 41 0C"));
        let session = Session::new(mock);
        session.connect(ObdProtocol::Auto).await.unwrap();

        let reading = session.read_voltage().await.unwrap();
        assert!(reading.is_fallback());
        assert_eq!(reading.to_string(), "12.6V");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_fail_session() {
        let mock = MockTransport::new();
        mock.on("0105", Reply::silent());
        let session = Session::new(mock);
        session.connect(ObdProtocol::Auto).await.unwrap();

        let err = session.read_parameter("0105").await.unwrap_err();
        assert!(matches!(err, ObdError::Timeout { .. }));
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_framing_fails_session_and_reconnect_reopens() {
        let mock = MockTransport::new();
        mock.on("0105", Reply::raw("41 05"));
        let session = Session::new(mock.clone());
        session.connect(ObdProtocol::Auto).await.unwrap();

        let err = session.read_parameter("0105").await.unwrap_err();
        assert!(matches!(err, ObdError::Timeout { .. }));
        assert_eq!(session.state(), ConnectionState::Ready);

        let err = session.read_parameter("0104").await.unwrap_err();
        assert!(matches!(err, ObdError::Transport(_)));
        assert_eq!(session.state(), ConnectionState::Failed);

        session.connect(ObdProtocol::Auto).await.unwrap();
        assert_eq!(mock.open_count(), 2);
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_voltage_behind_bus_init_text_falls_back() {
        let mock = MockTransport::new();
        mock.on("AT RV", Reply::text("BUS INIT: ...12.6V"));
        let session = Session::new(mock);
        session.connect(ObdProtocol::Auto).await.unwrap();

        assert!(session.read_voltage().await.unwrap().is_fallback());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_transport() {
        let mock = MockTransport::new();
        let session = Session::new(mock.clone());
        session.connect(ObdProtocol::Auto).await.unwrap();

        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(mock.close_count(), 1);
        assert!(matches!(
            session.read_parameter("0105").await,
            Err(ObdError::NotConnected)
        ));
    }
}
