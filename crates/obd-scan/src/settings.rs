//! Scan settings
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! config file, then `OBD_SCAN_*` environment variables (`__` separates
//! nested keys, e.g. `OBD_SCAN_POLL__MAX_ATTEMPTS=8`).

use config::{Config, ConfigError, Environment, File};
use obd_poller::PollConfig;
use obd_session::{CommandTimeouts, HandshakeConfig};
use serde::{Deserialize, Serialize};

/// Default config file base name, looked up without extension
pub const DEFAULT_CONFIG_NAME: &str = "obd-scan";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "OBD_SCAN";

/// Everything the scan binary can be tuned with
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Serial device of the adapter (Bluetooth SPP shows up as rfcomm)
    pub device: String,
    pub baud_rate: u32,
    /// ELM327 protocol number passed to `AT SP`
    pub protocol: String,
    /// Max tracing level (error, warn, info, debug, trace)
    pub log_level: String,
    pub handshake: HandshakeConfig,
    pub timeouts: CommandTimeouts,
    pub poll: PollConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            device: "/dev/rfcomm0".to_string(),
            baud_rate: 38400,
            protocol: "0".to_string(),
            log_level: "info".to_string(),
            handshake: HandshakeConfig::default(),
            timeouts: CommandTimeouts::default(),
            poll: PollConfig::default(),
        }
    }
}

impl ScanConfig {
    /// Load from `path` (required if given) or the optional default file,
    /// then apply environment overrides
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
