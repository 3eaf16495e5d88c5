//! ELM327 Diagnostic Scan - Main Entry Point
//!
//! Usage: `obd-scan [config-file]`. Settings can also come from
//! `OBD_SCAN_*` environment variables.

use anyhow::Context;
use obd_poller::CancellationToken;
use obd_scan::{init_logging, run, ScanConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1);
    let config = ScanConfig::load(config_path.as_deref()).context("loading configuration")?;
    init_logging(&config.log_level)?;

    info!("=== OBD Scan v{} ===", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current command");
                cancel.cancel();
            }
        }
    });

    let data = run(&config, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&data)?);

    Ok(())
}
