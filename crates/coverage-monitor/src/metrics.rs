//! Prometheus-style metrics for the coverage monitor.
//!
//! Only the `metrics` facade is used here; exporting is up to whichever
//! recorder the host process installs.

#![allow(clippy::cast_precision_loss)]

use crate::monitor::{
    SyncStatus,
    Transition,
};
use metrics::{
    counter,
    gauge,
};

/// Record the status derived in a poll cycle.
///
/// ## Metrics recorded
///
/// ### Gauges
/// - `coverage_monitor_in_sync`: 1 when in sync, 0 otherwise
/// - `coverage_monitor_latest_block`: chain tip seen in the cycle
/// - `coverage_monitor_oldest_uncovered_block`: first block not covered from genesis
/// - `coverage_monitor_lag_blocks`: distance between the two above
///
/// ### Counters
/// - `coverage_monitor_cycles_total`: completed poll cycles
pub fn record_status(status: &SyncStatus) {
    gauge!("coverage_monitor_in_sync").set(if status.in_sync { 1.0 } else { 0.0 });
    gauge!("coverage_monitor_latest_block").set(status.latest_block as f64);
    gauge!("coverage_monitor_oldest_uncovered_block").set(status.oldest_uncovered as f64);
    gauge!("coverage_monitor_lag_blocks").set(status.lag() as f64);
    counter!("coverage_monitor_cycles_total").increment(1);
}

/// Committed as a `Counter`: `coverage_monitor_transitions_total{kind}`
pub fn record_transition(transition: Transition) {
    counter!("coverage_monitor_transitions_total", "kind" => transition.as_str()).increment(1);
}

/// Committed as a `Counter`: `coverage_monitor_transient_errors_total`
pub fn record_transient_error() {
    counter!("coverage_monitor_transient_errors_total").increment(1);
}

/// Committed as a `Gauge`: `coverage_monitor_coverage_ranges`
pub fn set_coverage_ranges(count: usize) {
    gauge!("coverage_monitor_coverage_ranges").set(count as f64);
}

/// Committed as a `Gauge`: `coverage_monitor_backfilling`
pub fn set_backfilling(backfilling: bool) {
    gauge!("coverage_monitor_backfilling").set(if backfilling { 1.0 } else { 0.0 });
}

/// Record one completed backfill window and the events it returned.
pub fn record_backfill_window(events: usize) {
    counter!("coverage_monitor_backfill_windows_total").increment(1);
    counter!("coverage_monitor_backfill_events_total").increment(events as u64);
}

/// Committed as a `Counter`: `coverage_monitor_backfill_splits_total`
pub fn record_backfill_split() {
    counter!("coverage_monitor_backfill_splits_total").increment(1);
}
