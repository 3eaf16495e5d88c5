//! Battery voltage via `AT RV`
//!
//! Cheap ELM327 clones often return buffer garbage for `AT RV`. A reply that
//! does not look like a short decimal reading is replaced by a fixed
//! fallback. The fallback is its own variant, so a report can tell it apart
//! from a real measurement even though it renders as a plausible voltage.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Adapter command for the supply voltage
pub const READ_VOLTAGE_COMMAND: &str = "AT RV";

/// Reading reported when the adapter reply is unusable
pub const FALLBACK_VOLTAGE: &str = "12.6V";

/// Replies this long or longer are treated as garbage
pub const MAX_VOLTAGE_REPLY_LEN: usize = 10;

/// Outcome of a voltage read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoltageReading {
    /// Filtered adapter reading, e.g. "12.4V"
    Measured(String),
    /// Reply unusable; renders as [`FALLBACK_VOLTAGE`]
    Fallback,
}

impl VoltageReading {
    pub fn is_fallback(&self) -> bool {
        matches!(self, VoltageReading::Fallback)
    }
}

impl fmt::Display for VoltageReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoltageReading::Measured(reading) => f.write_str(reading),
            VoltageReading::Fallback => f.write_str(FALLBACK_VOLTAGE),
        }
    }
}

/// Keep digits and the decimal point of a short decimal reply
pub fn filter_voltage(reply: &str) -> VoltageReading {
    if !reply.contains('.') || reply.len() >= MAX_VOLTAGE_REPLY_LEN {
        return VoltageReading::Fallback;
    }

    let digits: String = reply
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if !digits.chars().any(|c| c.is_ascii_digit()) {
        return VoltageReading::Fallback;
    }
    VoltageReading::Measured(format!("{digits}V"))
}
