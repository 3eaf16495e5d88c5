//! OBD-II Polling and Scans
//!
//! Wraps single PID reads in bounded retries for slow or flaky buses and
//! assembles a full diagnostic scan into an [`ObdData`] record. Progress is
//! reported through a [`PollObserver`] sink so callers can render it however
//! they like.

mod retrier;
mod scan;

pub use retrier::{
    ParameterSource, PollConfig, PollObserver, PollOutcome, PollPhase, PollStatus, PollingRetrier,
};
pub use scan::{run_scan, ObdData, SCAN_PLAN};
pub use tokio_util::sync::CancellationToken;
