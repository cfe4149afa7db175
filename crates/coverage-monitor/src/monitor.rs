//! Steady-state sync monitoring.
//!
//! After the backfill, [`SyncMonitor`] owns the coverage set. On every tick it
//! pulls the events emitted since the previous pull, folds them into the set,
//! reads the tip and derives a [`SyncStatus`]. Transitions between in-sync and
//! out-of-sync are reported exactly once, on the edge.

use crate::{
    backfill::Backfilled,
    config::MonitorConfig,
    coverage::{
        CoverageError,
        CoverageSet,
    },
    critical,
    event_source::{
        EventCursor,
        EventSource,
        EventSourceError,
    },
    metrics,
    observer::{
        Observation,
        ObservationSink,
    },
};
use serde::Serialize;
use std::{
    error::Error,
    time::Duration,
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    warn,
};

/// Sync status derived in one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub in_sync: bool,
    pub latest_block: u64,
    pub oldest_uncovered: u64,
}

impl SyncStatus {
    /// In sync iff `oldest_uncovered > latest_block - sync_threshold`.
    ///
    /// Evaluated as `oldest_uncovered + sync_threshold > latest_block` so a
    /// tip below the threshold does not underflow.
    pub fn evaluate(oldest_uncovered: u64, latest_block: u64, sync_threshold: u64) -> Self {
        Self {
            in_sync: oldest_uncovered.saturating_add(sync_threshold) > latest_block,
            latest_block,
            oldest_uncovered,
        }
    }

    /// Blocks between the oldest uncovered block and the tip.
    pub fn lag(&self) -> u64 {
        self.latest_block.saturating_sub(self.oldest_uncovered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Out of sync -> in sync.
    Recovered,
    /// In sync -> out of sync.
    Degraded,
}

impl Transition {
    pub fn between(previous_in_sync: bool, in_sync: bool) -> Option<Self> {
        match (previous_in_sync, in_sync) {
            (false, true) => Some(Self::Recovered),
            (true, false) => Some(Self::Degraded),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recovered => "recovered",
            Self::Degraded => "degraded",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("failed to open the event cursor")]
    Watch(#[source] EventSourceError),
    #[error("failed to pull new coverage events")]
    PullEvents(#[source] EventSourceError),
    #[error("failed to read the chain tip")]
    Tip(#[source] EventSourceError),
    #[error("coverage set cannot be evaluated")]
    Coverage(#[from] CoverageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorRecoverability {
    Recoverable,
    Unrecoverable,
}

impl From<&MonitorError> for ErrorRecoverability {
    fn from(e: &MonitorError) -> Self {
        match e {
            // Network errors are recoverable, the next cycle retries
            MonitorError::Watch(_) | MonitorError::PullEvents(_) | MonitorError::Tip(_) => {
                ErrorRecoverability::Recoverable
            }
            // Coverage only grows after a valid backfill, so losing the
            // anchor means the set was built wrong
            MonitorError::Coverage(_) => ErrorRecoverability::Unrecoverable,
        }
    }
}

/// Owns the coverage set for the lifetime of the process and drives poll
/// cycles against an [`EventSource`].
pub struct SyncMonitor<S: EventSource, O: ObservationSink> {
    source: S,
    cursor: Box<dyn EventCursor>,
    coverage: CoverageSet,
    sink: O,
    sync_threshold: u64,
    poll_interval: Duration,
    previous_in_sync: bool,
}

impl<S: EventSource, O: ObservationSink> SyncMonitor<S, O> {
    /// Takes over the backfilled coverage and opens a cursor at the tip the
    /// backfill scanned up to.
    ///
    /// The remembered sync state starts from the status of the backfilled
    /// coverage against that tip.
    pub async fn start(
        source: S,
        backfilled: Backfilled,
        sink: O,
        config: &MonitorConfig,
    ) -> Result<Self, MonitorError> {
        let Backfilled { coverage, tip } = backfilled;
        let oldest = coverage.oldest_uncovered_boundary()?;
        let initial = SyncStatus::evaluate(oldest, tip, config.sync_threshold);

        let cursor = source.watch(tip).await.map_err(MonitorError::Watch)?;

        info!(
            target = "coverage_monitor::monitor",
            from_block = tip,
            in_sync = initial.in_sync,
            oldest_uncovered = oldest,
            sync_threshold = config.sync_threshold,
            "Monitor initialised"
        );

        Ok(Self {
            source,
            cursor,
            coverage,
            sink,
            sync_threshold: config.sync_threshold,
            poll_interval: config.poll_interval,
            previous_in_sync: initial.in_sync,
        })
    }

    /// Drive poll cycles on a fixed interval until `shutdown` is cancelled.
    ///
    /// Failed cycles are reported and skipped; they never end the loop.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            target = "coverage_monitor::monitor",
            poll_interval_ms = self.poll_interval.as_millis(),
            "Starting sync monitor"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!(target = "coverage_monitor::monitor", "Shutdown requested, stopping monitor");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Err(err) = self.poll_once().await {
                self.report_error(&err);
            }
        }
    }

    /// Perform a single cycle: pull, merge, read the tip, derive the status
    /// and emit observations.
    ///
    /// On error nothing after the failing step runs, so the remembered sync
    /// state is unchanged. A failed pull also leaves the coverage unchanged.
    pub async fn poll_once(&mut self) -> Result<SyncStatus, MonitorError> {
        let events = self
            .cursor
            .next_events()
            .await
            .map_err(MonitorError::PullEvents)?;

        if !events.is_empty() {
            debug!(
                target = "coverage_monitor::monitor",
                new_events = events.len(),
                "Applying new coverage events"
            );
            self.coverage.add_ranges(&events);
            metrics::set_coverage_ranges(self.coverage.len());
        }

        let latest = self
            .source
            .tip_block_number()
            .await
            .map_err(MonitorError::Tip)?;
        let oldest = self.coverage.oldest_uncovered_boundary()?;
        let status = SyncStatus::evaluate(oldest, latest, self.sync_threshold);

        if let Some(transition) = Transition::between(self.previous_in_sync, status.in_sync) {
            self.sink
                .observe(&Observation::Transition { transition, status });
        }
        self.sink.observe(&Observation::Status(status));
        self.previous_in_sync = status.in_sync;

        Ok(status)
    }

    fn report_error(&mut self, err: &MonitorError) {
        let message = error_chain(err);
        match ErrorRecoverability::from(err) {
            ErrorRecoverability::Recoverable => {
                warn!(
                    target = "coverage_monitor::monitor",
                    error = %message,
                    "Poll cycle failed, retrying on next tick"
                );
            }
            ErrorRecoverability::Unrecoverable => {
                critical!(error = %message, "Poll cycle failed on corrupted coverage state");
            }
        }
        self.sink.observe(&Observation::TransientError { message });
    }

    pub fn coverage(&self) -> &CoverageSet {
        &self.coverage
    }

    /// Sync state observed in the last successful cycle.
    pub fn previous_in_sync(&self) -> bool {
        self.previous_in_sync
    }

    pub fn sink(&self) -> &O {
        &self.sink
    }
}

/// Renders an error with its source chain, `outer: inner: root`.
fn error_chain(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
