//! OBD-II PID Definitions and Response Decoding
//!
//! The supported Mode 01 PIDs live in one closed table. Each row carries the
//! PID code, its payload width and a pure decoding rule per SAE J1979.
//! Adding a PID means adding a row.

use crate::channel::{Command, CommandChannel, RawResponse};
use crate::error::ObdError;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Mode 01 positive-response service byte
const MODE_01_RESPONSE: &str = "41";

/// Measurement unit of a decoded PID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    Celsius,
    Percent,
    GramsPerSecond,
    Bar,
}

impl Unit {
    /// Suffix appended to the magnitude when rendering
    pub fn suffix(&self) -> &'static str {
        match self {
            Unit::Celsius => "°C",
            Unit::Percent => "%",
            Unit::GramsPerSecond => " g/s",
            Unit::Bar => " bar",
        }
    }
}

/// Numeric part of a measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Magnitude {
    /// Formula with integer division
    Integer(i64),
    Decimal(f64),
}

impl Magnitude {
    pub fn as_f64(&self) -> f64 {
        match self {
            Magnitude::Integer(v) => *v as f64,
            Magnitude::Decimal(v) => *v,
        }
    }
}

impl fmt::Display for Magnitude {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Magnitude::Integer(v) => write!(f, "{v}"),
            // Debug keeps the trailing ".0" on whole numbers
            Magnitude::Decimal(v) => write!(f, "{v:?}"),
        }
    }
}

/// A decoded measurement, or the explicit absence of one
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PhysicalValue {
    Measured { magnitude: Magnitude, unit: Unit },
    /// Header missing, payload malformed, or PID not in the table
    Unavailable,
}

impl PhysicalValue {
    /// Rendering used for unavailable values
    pub const UNAVAILABLE: &'static str = "N/A";

    pub fn is_available(&self) -> bool {
        matches!(self, PhysicalValue::Measured { .. })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PhysicalValue::Measured { magnitude, .. } => Some(magnitude.as_f64()),
            PhysicalValue::Unavailable => None,
        }
    }

    pub fn unit(&self) -> Option<Unit> {
        match self {
            PhysicalValue::Measured { unit, .. } => Some(*unit),
            PhysicalValue::Unavailable => None,
        }
    }
}

impl fmt::Display for PhysicalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalValue::Measured { magnitude, unit } => {
                write!(f, "{}{}", magnitude, unit.suffix())
            }
            PhysicalValue::Unavailable => f.write_str(Self::UNAVAILABLE),
        }
    }
}

/// One row of the PID table
#[derive(Debug)]
pub struct PidSpec {
    /// Request code, e.g. "0105"
    pub pid: &'static str,
    pub name: &'static str,
    /// Payload width in bytes
    pub data_bytes: usize,
    pub unit: Unit,
    /// Formula applied to the big-endian payload
    formula: fn(u32) -> Magnitude,
}

/// Supported Mode 01 PIDs
pub static PID_TABLE: [PidSpec; 4] = [
    PidSpec {
        pid: "0105",
        name: "Engine coolant temperature",
        data_bytes: 1,
        unit: Unit::Celsius,
        // A - 40
        formula: |raw| Magnitude::Integer(raw as i64 - 40),
    },
    PidSpec {
        pid: "0104",
        name: "Calculated engine load",
        data_bytes: 1,
        unit: Unit::Percent,
        // A * 100 / 255
        formula: |raw| Magnitude::Integer(raw as i64 * 100 / 255),
    },
    PidSpec {
        pid: "0110",
        name: "Mass air flow rate",
        data_bytes: 2,
        unit: Unit::GramsPerSecond,
        // ((A * 256) + B) / 100
        formula: |raw| Magnitude::Decimal(raw as f64 / 100.0),
    },
    PidSpec {
        pid: "0123",
        name: "Fuel rail pressure",
        data_bytes: 2,
        unit: Unit::Bar,
        // ((A * 256) + B) * 10 kPa, reported in bar
        formula: |raw| Magnitude::Integer(raw as i64 * 10 / 1000),
    },
];

impl PidSpec {
    /// Find the table row for `pid` (case-insensitive)
    pub fn lookup(pid: &str) -> Option<&'static PidSpec> {
        PID_TABLE
            .iter()
            .find(|spec| spec.pid.eq_ignore_ascii_case(pid.trim()))
    }

    /// Header a positive reply starts with: "41" + the PID's last two chars
    pub fn expected_header(&self) -> String {
        format!("{}{}", MODE_01_RESPONSE, &self.pid[2..])
    }

    /// Decode a sanitized reply; anything unexpected is `Unavailable`
    pub fn decode(&self, response: &RawResponse) -> PhysicalValue {
        let Some(payload) = response.payload_after(&self.expected_header()) else {
            return PhysicalValue::Unavailable;
        };

        match parse_hex(payload, self.data_bytes) {
            Some(raw) => PhysicalValue::Measured {
                magnitude: (self.formula)(raw),
                unit: self.unit,
            },
            None => PhysicalValue::Unavailable,
        }
    }
}

/// Parse the first `bytes` bytes of a hex payload as big-endian
fn parse_hex(payload: &str, bytes: usize) -> Option<u32> {
    let digits = payload.get(..bytes * 2)?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

/// Decode a reply for `pid` without touching the bus
pub fn decode(pid: &str, response: &RawResponse) -> PhysicalValue {
    PidSpec::lookup(pid)
        .map(|spec| spec.decode(response))
        .unwrap_or(PhysicalValue::Unavailable)
}

/// Single-attempt PID reader over a command channel
pub struct ParameterDecoder<'a, T> {
    channel: &'a CommandChannel<T>,
}

impl<'a, T: Transport> ParameterDecoder<'a, T> {
    pub fn new(channel: &'a CommandChannel<T>) -> Self {
        Self { channel }
    }

    /// Query `pid` once
    ///
    /// Transport failures propagate; decode failures come back as
    /// [`PhysicalValue::Unavailable`]. PIDs outside the table are never sent.
    pub async fn read(&self, pid: &str) -> Result<PhysicalValue, ObdError> {
        let Some(spec) = PidSpec::lookup(pid) else {
            debug!("PID {} is not in the decode table", pid);
            return Ok(PhysicalValue::Unavailable);
        };

        let response = self.channel.send(&Command::new(spec.pid)?).await?;
        let value = spec.decode(&response);
        debug!("PID {} ({}) => {}", spec.pid, spec.name, value);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CommandTimeouts;
    use crate::mock::{MockTransport, Reply};
    use proptest::prelude::*;

    fn response(pid: &str, text: &str) -> RawResponse {
        RawResponse::sanitize(&Command::new(pid).unwrap(), text)
    }

    #[test]
    fn test_expected_headers() {
        let headers: Vec<_> = PID_TABLE.iter().map(|s| s.expected_header()).collect();
        assert_eq!(headers, vec!["4105", "4104", "4110", "4123"]);
    }

    #[test]
    fn test_coolant_temp_decode() {
        // 0x5A = 90, so temp = 90 - 40 = 50°C
        let value = decode("0105", &response("0105", "41 05 5A"));
        assert_eq!(value.as_f64(), Some(50.0));
        assert_eq!(value.to_string(), "50°C");

        let value = decode("0105", &response("0105", "41 05 00"));
        assert_eq!(value.to_string(), "-40°C");
    }

    #[test]
    fn test_engine_load_decode() {
        // 0x80 = 128, 128 * 100 / 255 = 50 (integer division)
        let value = decode("0104", &response("0104", "41 04 80"));
        assert_eq!(value.to_string(), "50%");
        assert_eq!(decode("0104", &response("0104", "41 04 FF")).to_string(), "100%");
    }

    #[test]
    fn test_maf_decode() {
        // 0x019A = 410, 410 / 100 = 4.1 g/s
        let value = decode("0110", &response("0110", "41 10 01 9A"));
        assert_eq!(value.to_string(), "4.1 g/s");
        assert_eq!(decode("0110", &response("0110", "41 10 01 90")).to_string(), "4.0 g/s");
    }

    #[test]
    fn test_fuel_rail_decode() {
        // 0x0BB8 = 3000, 3000 * 10 / 1000 = 30 bar
        let value = decode("0123", &response("0123", "41 23 0B B8"));
        assert_eq!(value.to_string(), "30 bar");
        assert_eq!(value.unit(), Some(Unit::Bar));
    }

    #[test]
    fn test_missing_header_is_unavailable() {
        assert_eq!(decode("0105", &response("0105", "NO DATA")), PhysicalValue::Unavailable);
        assert_eq!(decode("0105", &response("0105", "41 04 5A")), PhysicalValue::Unavailable);
        assert_eq!(PhysicalValue::Unavailable.to_string(), "N/A");
    }

    #[test]
    fn test_short_or_malformed_payload_is_unavailable() {
        assert_eq!(decode("0110", &response("0110", "41 10 01")), PhysicalValue::Unavailable);
        assert_eq!(decode("0105", &response("0105", "41 05 ZZ")), PhysicalValue::Unavailable);
        assert_eq!(decode("0105", &response("0105", "41 05 +5")), PhysicalValue::Unavailable);
    }

    #[test]
    fn test_unknown_pid_is_unavailable() {
        assert_eq!(decode("010C", &response("010C", "41 0C 1A F8")), PhysicalValue::Unavailable);
    }

    #[tokio::test]
    async fn test_read_queries_channel() {
        let mock = MockTransport::opened();
        mock.on("0105", Reply::text("41 05 5A"));
        let channel = CommandChannel::new(mock.clone(), CommandTimeouts::default());

        let value = ParameterDecoder::new(&channel).read("0105").await.unwrap();
        assert_eq!(value.to_string(), "50°C");
        assert_eq!(mock.writes(), vec!["0105"]);
    }

    #[tokio::test]
    async fn test_read_unknown_pid_sends_nothing() {
        let mock = MockTransport::opened();
        let channel = CommandChannel::new(mock.clone(), CommandTimeouts::default());

        let value = ParameterDecoder::new(&channel).read("010C").await.unwrap();
        assert_eq!(value, PhysicalValue::Unavailable);
        assert!(mock.writes().is_empty());
    }

    proptest! {
        #[test]
        fn prop_valid_one_byte_replies_follow_formula(a in 0u8..=255) {
            let text = format!("41 05 {a:02X}");
            let value = decode("0105", &response("0105", &text));
            prop_assert_eq!(value.as_f64(), Some(a as f64 - 40.0));

            let text = format!("41 04 {a:02X}");
            let value = decode("0104", &response("0104", &text));
            prop_assert_eq!(value.as_f64(), Some((a as i64 * 100 / 255) as f64));
        }

        #[test]
        fn prop_valid_two_byte_replies_follow_formula(a in 0u8..=255, b in 0u8..=255) {
            let raw = (a as u32) << 8 | b as u32;

            let text = format!("41 10 {a:02X} {b:02X}");
            let value = decode("0110", &response("0110", &text));
            prop_assert_eq!(value.as_f64(), Some(raw as f64 / 100.0));

            let text = format!("41 23 {a:02X} {b:02X}");
            let value = decode("0123", &response("0123", &text));
            prop_assert_eq!(value.as_f64(), Some((raw as i64 * 10 / 1000) as f64));
        }

        #[test]
        fn prop_arbitrary_text_never_panics(text in "\\PC{0,40}") {
            for spec in PID_TABLE.iter() {
                let _ = decode(spec.pid, &response(spec.pid, &text));
            }
        }

        #[test]
        fn prop_reply_without_header_is_unavailable(payload in "[0-9A-F]{0,16}") {
            for spec in PID_TABLE.iter() {
                let text = format!("7F 01 {payload}");
                let r = response(spec.pid, &text);
                prop_assume!(!r.contains(&spec.expected_header()));
                prop_assert_eq!(spec.decode(&r), PhysicalValue::Unavailable);
            }
        }
    }
}
