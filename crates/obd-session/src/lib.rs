//! ELM327 Session Core
//!
//! Drives an ELM327-compatible OBD-II adapter over any byte-stream
//! [`Transport`]: handshake and reset sequencing, single-flight command
//! framing with response sanitization, Mode 01 PID decoding and Mode 03
//! trouble-code decoding. Supports ISO 15765-4 (CAN) and ISO 14230 (K-Line)
//! protocol selection.

mod channel;
mod dtc;
mod error;
mod handshake;
mod pid;
mod protocol;
mod serial;
mod session;
mod transport;
mod voltage;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use channel::{
    Command, CommandChannel, CommandClass, CommandTimeouts, Link, RawResponse, PROMPT,
};
pub use dtc::{decode_dtc_response, DtcCategory, DtcCode, DtcDecoder};
pub use error::ObdError;
pub use handshake::{HandshakeConfig, HandshakeStep};
pub use pid::{decode, Magnitude, ParameterDecoder, PhysicalValue, PidSpec, Unit, PID_TABLE};
pub use protocol::ObdProtocol;
pub use serial::SerialTransport;
pub use session::{ConnectionState, Session};
pub use transport::Transport;
pub use voltage::{filter_voltage, VoltageReading, FALLBACK_VOLTAGE};

