//! Observations emitted by the monitor and the sinks that consume them.

use crate::{
    critical,
    metrics,
    monitor::{
        SyncStatus,
        Transition,
    },
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{
    info,
    warn,
};

/// Something the monitor reports to the outside world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    /// Emitted once per successful cycle.
    Status(SyncStatus),
    /// Emitted only when the sync state flips.
    Transition {
        transition: Transition,
        status: SyncStatus,
    },
    /// A cycle failed; state was left untouched and the next cycle will retry.
    TransientError { message: String },
}

/// Consumer of [`Observation`]s. Alert delivery lives behind this trait.
pub trait ObservationSink: Send {
    fn observe(&mut self, observation: &Observation);
}

/// Logs observations with `tracing` and mirrors them into metrics.
///
/// Degradations are logged through [`critical!`] so log-based alerting picks
/// them up.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ObservationSink for TracingSink {
    fn observe(&mut self, observation: &Observation) {
        match observation {
            Observation::Status(status) => {
                metrics::record_status(status);
                info!(
                    target = "coverage_monitor::status",
                    in_sync = status.in_sync,
                    latest_block = status.latest_block,
                    oldest_uncovered = status.oldest_uncovered,
                    lag = status.lag(),
                    "Status: {}",
                    if status.in_sync { "sync" } else { "out of sync" }
                );
            }
            Observation::Transition {
                transition: Transition::Degraded,
                status,
            } => {
                metrics::record_transition(Transition::Degraded);
                critical!(
                    latest_block = status.latest_block,
                    oldest_uncovered = status.oldest_uncovered,
                    lag = status.lag(),
                    "Coverage fell out of sync with the chain tip"
                );
            }
            Observation::Transition {
                transition: Transition::Recovered,
                status,
            } => {
                metrics::record_transition(Transition::Recovered);
                info!(
                    target = "coverage_monitor::status",
                    latest_block = status.latest_block,
                    oldest_uncovered = status.oldest_uncovered,
                    "Coverage is back in sync with the chain tip"
                );
            }
            Observation::TransientError { message } => {
                metrics::record_transient_error();
                warn!(
                    target = "coverage_monitor::status",
                    error = %message,
                    "Error happened, will continue"
                );
            }
        }
    }
}

/// Forwards observations to a channel, e.g. for an alerting task. A closed
/// receiver is ignored.
impl ObservationSink for mpsc::UnboundedSender<Observation> {
    fn observe(&mut self, observation: &Observation) {
        let _ = self.send(observation.clone());
    }
}
