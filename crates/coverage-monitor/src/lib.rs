#![doc = include_str!("../README.md")]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::unreachable)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![warn(clippy::indexing_slicing)]
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::indexing_slicing))]

pub mod backfill;
pub mod cli;
pub mod config;
pub mod coverage;
pub mod event_source;
mod macros;
pub mod metrics;
pub mod monitor;
pub mod observer;
pub mod rpc_source;
#[cfg(test)]
mod test_utils;

pub use backfill::{
    BackfillError,
    Backfilled,
    HistoryBackfiller,
};
pub use config::{
    Checkpoint,
    ConfigError,
    MonitorConfig,
};
pub use coverage::{
    BlockRange,
    CoverageError,
    CoverageEvent,
    CoverageSet,
    MalformedRange,
};
pub use event_source::{
    EventCursor,
    EventSource,
    EventSourceError,
    SpanningCursor,
};
pub use monitor::{
    MonitorError,
    SyncMonitor,
    SyncStatus,
    Transition,
};
pub use observer::{
    Observation,
    ObservationSink,
    TracingSink,
};
pub use rpc_source::RpcEventSource;

use anyhow::{
    Context,
    Result,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Backfill coverage from `source`, then monitor it until `shutdown` is
/// cancelled.
///
/// Everything before the first poll cycle is fatal: the monitor never starts
/// from a partially reconstructed coverage set.
pub async fn run<S, O>(
    source: S,
    sink: O,
    config: MonitorConfig,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: EventSource,
    O: ObservationSink,
{
    let config = config.validate().context("invalid monitor configuration")?;

    source
        .health_check()
        .await
        .context("event source is not reachable")?;

    let backfiller = HistoryBackfiller::new(&source, &config);
    let backfilled = tokio::select! {
        result = backfiller.run() => {
            result.context("failed to backfill coverage history")?
        }
        () = shutdown.cancelled() => {
            info!("Shutdown requested during backfill");
            return Ok(());
        }
    };

    let mut monitor = SyncMonitor::start(source, backfilled, sink, &config)
        .await
        .context("failed to start sync monitor")?;

    monitor.run(shutdown).await;
    info!("Sync monitor stopped");
    Ok(())
}
