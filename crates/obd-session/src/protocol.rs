//! OBD-II Protocol Selection

use crate::channel::Command;
use crate::error::ObdError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Protocols the session can force with `AT SP <id>`
///
/// Older K-Line ECUs are unreliable under auto-detect, so the caller picks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ObdProtocol {
    /// Automatic protocol detection
    #[default]
    Auto,
    /// ISO 14230-4 KWP (5 baud init, 10.4 kbaud)
    Iso14230_4KwpSlow,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

impl ObdProtocol {
    /// ELM327 protocol number
    pub fn id(&self) -> char {
        match self {
            ObdProtocol::Auto => '0',
            ObdProtocol::Iso14230_4KwpSlow => '4',
            ObdProtocol::Iso14230_4KwpFast => '5',
            ObdProtocol::Iso15765_4Can11bit500 => '6',
            ObdProtocol::Iso15765_4Can29bit500 => '7',
            ObdProtocol::Iso15765_4Can11bit250 => '8',
            ObdProtocol::Iso15765_4Can29bit250 => '9',
        }
    }

    /// Look up a protocol by its ELM327 number
    pub fn from_id(id: char) -> Result<Self, ObdError> {
        match id {
            '0' => Ok(ObdProtocol::Auto),
            '4' => Ok(ObdProtocol::Iso14230_4KwpSlow),
            '5' => Ok(ObdProtocol::Iso14230_4KwpFast),
            '6' => Ok(ObdProtocol::Iso15765_4Can11bit500),
            '7' => Ok(ObdProtocol::Iso15765_4Can29bit500),
            '8' => Ok(ObdProtocol::Iso15765_4Can11bit250),
            '9' => Ok(ObdProtocol::Iso15765_4Can29bit250),
            other => Err(ObdError::UnsupportedProtocol(other.to_string())),
        }
    }

    /// `AT SP <id>` command forcing this protocol
    pub fn select_command(&self) -> Command {
        Command(format!("AT SP {}", self.id()))
    }

    /// K-Line buses need the long settle delays
    pub fn is_k_line(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso14230_4KwpSlow | ObdProtocol::Iso14230_4KwpFast
        )
    }
}

impl FromStr for ObdProtocol {
    type Err = ObdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(id), None) => Self::from_id(id.to_ascii_uppercase()),
            _ => Err(ObdError::UnsupportedProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for ObdProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.id())
    }
}
