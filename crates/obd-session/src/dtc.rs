//! Mode 03 diagnostic trouble codes

use crate::channel::{Command, CommandChannel, RawResponse};
use crate::error::ObdError;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Mode 03 request
pub const READ_DTC_COMMAND: &str = "03";

/// Mode 03 positive-response header
pub const DTC_HEADER: &str = "43";

/// System a trouble code belongs to, from the top two bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtcCategory {
    /// Powertrain (00)
    Powertrain,
    /// Chassis (01)
    Chassis,
    /// Body (10)
    Body,
    /// Network (11)
    Network,
}

impl DtcCategory {
    pub fn letter(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }
}

/// A stored trouble code such as `P0400`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DtcCode {
    pub category: DtcCategory,
    /// Low 14 bits of the encoding, printed as four hex digits
    pub number: u16,
}

impl DtcCode {
    /// Decode the two-byte encoding; `00 00` is padding and yields `None`
    pub fn from_bytes(a: u8, b: u8) -> Option<Self> {
        if a == 0 && b == 0 {
            return None;
        }
        let category = match a >> 6 {
            0b00 => DtcCategory::Powertrain,
            0b01 => DtcCategory::Chassis,
            0b10 => DtcCategory::Body,
            _ => DtcCategory::Network,
        };
        Some(Self {
            category,
            number: u16::from(a & 0x3F) << 8 | u16::from(b),
        })
    }
}

impl fmt::Display for DtcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:04X}", self.category.letter(), self.number)
    }
}

/// Decode a sanitized Mode 03 reply
///
/// Every line is its own `43` frame (several ECUs, or more codes than fit in
/// one K-Line frame). A frame without the header or with a non-hex payload
/// contributes nothing: at this layer "no stored codes" and "could not
/// confirm" look the same.
pub fn decode_dtc_response(response: &RawResponse) -> Vec<DtcCode> {
    response.frames().flat_map(decode_frame).collect()
}

fn decode_frame(frame: &str) -> Vec<DtcCode> {
    let Some(payload) = frame.strip_prefix(DTC_HEADER) else {
        return Vec::new();
    };
    if !payload.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Vec::new();
    }

    // Whole 2-byte groups only; a trailing fragment is ignored
    payload
        .as_bytes()
        .chunks_exact(4)
        .filter_map(|group| {
            let group = std::str::from_utf8(group).ok()?;
            let a = u8::from_str_radix(&group[..2], 16).ok()?;
            let b = u8::from_str_radix(&group[2..], 16).ok()?;
            DtcCode::from_bytes(a, b)
        })
        .collect()
}

/// Mode 03 reader over a command channel
pub struct DtcDecoder<'a, T> {
    channel: &'a CommandChannel<T>,
}

impl<'a, T: Transport> DtcDecoder<'a, T> {
    pub fn new(channel: &'a CommandChannel<T>) -> Self {
        Self { channel }
    }

    /// Read stored trouble codes
    pub async fn read_dtc(&self) -> Result<Vec<DtcCode>, ObdError> {
        let response = self.channel.send(&Command::new(READ_DTC_COMMAND)?).await?;
        let codes = decode_dtc_response(&response);
        if codes.is_empty() {
            debug!("No trouble codes in {:?}", response.as_str());
        } else {
            info!("Read {} trouble code(s)", codes.len());
        }
        Ok(codes)
    }
}
