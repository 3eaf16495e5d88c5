//! ELM327 Diagnostic Scan
//!
//! Wires configuration, logging, the serial transport, the session
//! handshake and a full scan together.

mod settings;

pub use settings::ScanConfig;

use anyhow::Context;
use obd_poller::{run_scan, CancellationToken, ObdData, PollStatus};
use obd_session::{ObdProtocol, SerialTransport, Session, Transport};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Initialize logging at the given max level
pub fn init_logging(level: &str) -> anyhow::Result<()> {
    let level: Level = level
        .parse()
        .with_context(|| format!("invalid log level {level:?}"))?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;
    Ok(())
}

/// Open the configured serial device and run one scan
pub async fn run(config: &ScanConfig, cancel: CancellationToken) -> anyhow::Result<ObdData> {
    let transport = SerialTransport::new(&config.device, config.baud_rate);
    info!("Scanning via {} at {} baud", transport.device(), config.baud_rate);
    run_with_transport(transport, config, cancel).await
}

/// Handshake and scan over an arbitrary transport
pub async fn run_with_transport<T: Transport + 'static>(
    transport: T,
    config: &ScanConfig,
    cancel: CancellationToken,
) -> anyhow::Result<ObdData> {
    let protocol: ObdProtocol = config.protocol.parse()?;
    let session = Session::with_config(transport, config.handshake.clone(), config.timeouts.clone());

    session
        .connect(protocol)
        .await
        .with_context(|| format!("adapter handshake on {protocol}"))?;

    let mut progress = |status: &PollStatus| {
        info!(
            "Reading {} ({}/{}) {:?}",
            status.label, status.attempt, status.max_attempts, status.phase
        );
    };
    let data = run_scan(&session, &config.poll, &mut progress, cancel)
        .await
        .context("diagnostic scan")?;

    session.disconnect().await;
    Ok(data)
}
