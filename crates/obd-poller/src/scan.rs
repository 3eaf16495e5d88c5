//! Full diagnostic scan
//!
//! Battery voltage, the supported PIDs (each through the retrier) and the
//! stored trouble codes, collected into the record handed to report
//! submission.

use crate::retrier::{PollConfig, PollObserver, PollingRetrier};
use obd_session::{ObdError, PhysicalValue, Session, Transport, VoltageReading};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// PIDs read by a scan, with the labels used in progress reports
pub const SCAN_PLAN: [(&str, &str); 4] = [
    ("0105", "ECT (Coolant Temp)"),
    ("0104", "Engine Load"),
    ("0110", "MAF (Mass Air Flow)"),
    ("0123", "Fuel Rail Pressure"),
];

/// Result of a scan, every field already rendered for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObdData {
    pub battery_voltage: String,
    /// Whether `battery_voltage` is the fixed fallback, not a measurement
    pub battery_voltage_fallback: bool,
    pub dtc_codes: Vec<String>,
    pub coolant_temp: String,
    pub mass_air_flow: String,
    pub engine_load: String,
    /// Not measured by this core
    pub intake_air_temp: String,
    pub fuel_rail_pressure: String,
}

/// Run a full scan on a ready session
///
/// A timed-out read degrades to its fallback (voltage), `N/A` (PIDs) or an
/// empty list (DTCs); link faults still abort. Cancellation is honoured between reads; a cancelled scan closes the
/// transport before returning [`ObdError::Cancelled`].
pub async fn run_scan<T, O>(
    session: &Session<T>,
    config: &PollConfig,
    observer: &mut O,
    cancel: CancellationToken,
) -> Result<ObdData, ObdError>
where
    T: Transport + 'static,
    O: PollObserver + ?Sized,
{
    let result = scan(session, config, observer, &cancel).await;
    if matches!(result, Err(ObdError::Cancelled)) {
        warn!("Scan cancelled, tearing down transport");
        session.disconnect().await;
    }
    result
}

async fn scan<T, O>(
    session: &Session<T>,
    config: &PollConfig,
    observer: &mut O,
    cancel: &CancellationToken,
) -> Result<ObdData, ObdError>
where
    T: Transport + 'static,
    O: PollObserver + ?Sized,
{
    let check_cancel = || {
        if cancel.is_cancelled() {
            Err(ObdError::Cancelled)
        } else {
            Ok(())
        }
    };

    check_cancel()?;
    let voltage = match session.read_voltage().await {
        Err(e @ ObdError::Timeout { .. }) => {
            warn!("Voltage read failed, reporting fallback: {}", e);
            VoltageReading::Fallback
        }
        other => other?,
    };

    let retrier = PollingRetrier::new(session, config.clone()).with_cancellation(cancel.clone());
    let mut values = [PhysicalValue::Unavailable; SCAN_PLAN.len()];
    for ((pid, label), slot) in SCAN_PLAN.iter().zip(values.iter_mut()) {
        let outcome = retrier.poll(pid, label, observer).await?;
        *slot = outcome.value;
    }
    let [coolant_temp, engine_load, mass_air_flow, fuel_rail_pressure] = values;

    check_cancel()?;
    info!("Scanning DTC memory");
    let dtc_codes = match session.read_dtc().await {
        Err(e @ ObdError::Timeout { .. }) => {
            warn!("DTC scan failed, reporting no codes: {}", e);
            Vec::new()
        }
        other => other?,
    };

    Ok(ObdData {
        battery_voltage: voltage.to_string(),
        battery_voltage_fallback: voltage.is_fallback(),
        dtc_codes: dtc_codes.iter().map(ToString::to_string).collect(),
        coolant_temp: coolant_temp.to_string(),
        mass_air_flow: mass_air_flow.to_string(),
        engine_load: engine_load.to_string(),
        intake_air_temp: PhysicalValue::Unavailable.to_string(),
        fuel_rail_pressure: fuel_rail_pressure.to_string(),
    })
}
