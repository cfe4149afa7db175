//! One-shot reconstruction of historical coverage.
//!
//! The backfiller reads the tip, then either scans the full historical span in
//! a single request (cold start) or seeds the set from a [`Checkpoint`], and
//! finally walks from there to the tip in fixed-size windows. A window the
//! source refuses to return in one response is split in half until it fits or
//! reaches `min_chunk_size`.

use crate::{
    config::{
        Checkpoint,
        MonitorConfig,
    },
    coverage::{
        BlockRange,
        CoverageError,
        CoverageEvent,
        CoverageSet,
        GENESIS_BLOCK,
    },
    event_source::{
        EventSource,
        EventSourceError,
    },
    metrics,
};
use futures::{
    StreamExt,
    stream,
};
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("failed to read the chain tip")]
    Tip(#[source] EventSourceError),
    #[error("failed to fetch coverage events for blocks {window}")]
    Fetch {
        window: BlockRange,
        #[source]
        source: EventSourceError,
    },
    #[error(
        "blocks {window} still return too many results at the minimum window size of {min_chunk_size} blocks"
    )]
    WindowTooLarge {
        window: BlockRange,
        min_chunk_size: u64,
        #[source]
        source: EventSourceError,
    },
    #[error("backfill finished without coverage anchored at genesis")]
    NotAnchored(#[source] CoverageError),
}

/// Coverage reconstructed up to `tip`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backfilled {
    pub coverage: CoverageSet,
    /// Tip read when the backfill started. Every event emitted at or before it
    /// has been applied.
    pub tip: u64,
}

impl Backfilled {
    /// A checkpoint that reproduces this coverage on the next start, if the
    /// coverage is a single contiguous range. Gaps further up cannot be
    /// expressed as a checkpoint.
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        let [range] = self.coverage.ranges() else {
            return None;
        };
        (range.start() == GENESIS_BLOCK).then(|| {
            Checkpoint {
                resume_from: self.tip,
                resume_coverage_end: range.end(),
            }
        })
    }
}

/// Brings a [`CoverageSet`] from nothing to "covers `[0, tip]` modulo gaps".
pub struct HistoryBackfiller<'a, S: EventSource + ?Sized> {
    source: &'a S,
    chunk_size: u64,
    min_chunk_size: u64,
    fetch_concurrency: usize,
    historical_scan_end: u64,
    checkpoint: Option<Checkpoint>,
}

impl<'a, S: EventSource + ?Sized> HistoryBackfiller<'a, S> {
    pub fn new(source: &'a S, config: &MonitorConfig) -> Self {
        Self {
            source,
            chunk_size: config.chunk_size.max(1),
            min_chunk_size: config.min_chunk_size.max(1),
            fetch_concurrency: config.fetch_concurrency.max(1),
            historical_scan_end: config.historical_scan_end,
            checkpoint: config.checkpoint,
        }
    }

    /// Run the backfill to completion.
    ///
    /// Any error is fatal: the caller must not start monitoring from a
    /// partially reconstructed set.
    pub async fn run(&self) -> Result<Backfilled, BackfillError> {
        metrics::set_backfilling(true);
        let result = self.backfill().await;
        metrics::set_backfilling(false);
        result
    }

    async fn backfill(&self) -> Result<Backfilled, BackfillError> {
        let tip = self
            .source
            .tip_block_number()
            .await
            .map_err(BackfillError::Tip)?;

        let (mut coverage, scan_from) = match self.checkpoint {
            Some(checkpoint) => {
                info!(
                    target = "coverage_monitor::backfill",
                    tip,
                    resume_from = checkpoint.resume_from,
                    resume_coverage_end = checkpoint.resume_coverage_end,
                    "Resuming backfill from checkpoint"
                );
                (
                    CoverageSet::seeded(checkpoint.resume_coverage_end),
                    checkpoint.resume_from,
                )
            }
            None => {
                let historical_end = self.historical_scan_end.min(tip.saturating_add(1));
                info!(
                    target = "coverage_monitor::backfill",
                    tip,
                    historical_end,
                    "Cold start, scanning full history"
                );

                let mut coverage = CoverageSet::default();
                let events = self
                    .fetch_window(BlockRange::new(GENESIS_BLOCK, historical_end))
                    .await?;
                coverage.add_ranges(&events);
                (coverage, self.historical_scan_end)
            }
        };

        let scan_to = tip.saturating_add(1);
        info!(
            target = "coverage_monitor::backfill",
            scan_from,
            tip,
            windows = window_count(scan_from, scan_to, self.chunk_size),
            chunk_size = self.chunk_size,
            "Scanning up to tip"
        );

        let mut fetched = stream::iter(chunk_windows(scan_from, scan_to, self.chunk_size))
            .map(|window| self.fetch_window(window))
            .buffered(self.fetch_concurrency);

        while let Some(events) = fetched.next().await {
            coverage.add_ranges(&events?);
        }

        if let Err(err) = coverage.oldest_uncovered_boundary() {
            warn!(
                target = "coverage_monitor::backfill",
                error = %err,
                ranges = coverage.len(),
                "Backfill did not anchor coverage at genesis"
            );
            return Err(BackfillError::NotAnchored(err));
        }

        metrics::set_coverage_ranges(coverage.len());
        let backfilled = Backfilled { coverage, tip };

        info!(
            target = "coverage_monitor::backfill",
            tip,
            ranges = backfilled.coverage.len(),
            oldest_uncovered = ?backfilled.coverage.oldest_uncovered_boundary().ok(),
            "Backfill complete"
        );
        if let Some(checkpoint) = backfilled.checkpoint() {
            info!(
                target = "coverage_monitor::backfill",
                resume_from = checkpoint.resume_from,
                resume_coverage_end = checkpoint.resume_coverage_end,
                "Checkpoint for the next start"
            );
        }

        Ok(backfilled)
    }

    /// Fetch every event emitted in `window`, splitting it when the source
    /// reports too many results.
    async fn fetch_window(&self, window: BlockRange) -> Result<Vec<CoverageEvent>, BackfillError> {
        let mut pending = vec![window];
        let mut events = Vec::new();

        while let Some(current) = pending.pop() {
            if current.is_empty() {
                continue;
            }

            match self
                .source
                .historical_events(current.start(), current.end())
                .await
            {
                Ok(batch) => {
                    debug!(
                        target = "coverage_monitor::backfill",
                        window = %current,
                        events = batch.len(),
                        "Fetched window"
                    );
                    metrics::record_backfill_window(batch.len());
                    events.extend(batch);
                }
                Err(source @ EventSourceError::TooManyResults { .. }) => {
                    if current.len() <= self.min_chunk_size {
                        return Err(BackfillError::WindowTooLarge {
                            window: current,
                            min_chunk_size: self.min_chunk_size,
                            source,
                        });
                    }

                    let mid = current.start() + current.len() / 2;
                    warn!(
                        target = "coverage_monitor::backfill",
                        window = %current,
                        mid,
                        "Too many results, splitting window"
                    );
                    metrics::record_backfill_split();

                    // Lower half is popped first.
                    pending.push(BlockRange::new(mid, current.end()));
                    pending.push(BlockRange::new(current.start(), mid));
                }
                Err(source) => {
                    return Err(BackfillError::Fetch {
                        window: current,
                        source,
                    });
                }
            }
        }

        Ok(events)
    }
}

/// Splits `[from, to)` into consecutive windows of at most `chunk_size` blocks,
/// produced lazily.
fn chunk_windows(from: u64, to: u64, chunk_size: u64) -> impl Iterator<Item = BlockRange> {
    let mut left = from;
    std::iter::from_fn(move || {
        if left >= to {
            return None;
        }
        let right = left.saturating_add(chunk_size).min(to);
        let window = BlockRange::new(left, right);
        left = right;
        Some(window)
    })
}

/// Number of windows [`chunk_windows`] yields for the same arguments.
fn window_count(from: u64, to: u64, chunk_size: u64) -> u64 {
    to.saturating_sub(from).div_ceil(chunk_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockEventSource;
    use assert_matches::assert_matches;

    fn config(chunk_size: u64, historical_scan_end: u64) -> MonitorConfig {
        MonitorConfig {
            chunk_size,
            historical_scan_end,
            ..MonitorConfig::default()
        }
    }

    /// Events emitted every 100 blocks, each covering the 100 blocks that
    /// ended 300 blocks earlier.
    fn steady_history(source: &MockEventSource, until: u64) {
        let mut emitted_at = 400;
        while emitted_at <= until {
            let start = emitted_at - 400;
            source.emit(emitted_at, CoverageEvent::new(start, 100));
            emitted_at += 100;
        }
    }

    #[test]
    fn test_chunk_windows() {
        let windows: Vec<_> = chunk_windows(5000, 7500, 1000).collect();
        assert_eq!(
            windows,
            vec![
                BlockRange::new(5000, 6000),
                BlockRange::new(6000, 7000),
                BlockRange::new(7000, 7500),
            ]
        );
        assert_eq!(window_count(5000, 7500, 1000), 3);
        assert_eq!(chunk_windows(10, 10, 1000).count(), 0);
        assert_eq!(chunk_windows(20, 10, 1000).count(), 0);
        assert_eq!(window_count(20, 10, 1000), 0);
    }

    #[test]
    fn test_chunk_windows_are_lazy() {
        // A full materialisation would need billions of entries.
        let mut windows = chunk_windows(0, u64::MAX, 1);
        assert_eq!(windows.next(), Some(BlockRange::new(0, 1)));
        assert_eq!(windows.next(), Some(BlockRange::new(1, 2)));
        assert_eq!(window_count(0, u64::MAX, 1), u64::MAX);

        let mut tail = chunk_windows(u64::MAX - 3, u64::MAX, 1000);
        assert_eq!(tail.next(), Some(BlockRange::new(u64::MAX - 3, u64::MAX)));
        assert_eq!(tail.next(), None);
    }

    #[tokio::test]
    async fn test_cold_start_covers_history_and_catch_up() {
        let source = MockEventSource::new(10_000);
        steady_history(&source, 10_000);

        let backfilled = HistoryBackfiller::new(&source, &config(1000, 5000))
            .run()
            .await
            .unwrap();

        assert_eq!(backfilled.tip, 10_000);
        assert_eq!(backfilled.coverage.ranges(), &[BlockRange::new(0, 9700)]);

        // One historical request, then [5000, 10001) in 1000-block windows.
        let requests = source.historical_requests();
        assert_eq!(requests[0], (0, 5000));
        assert_eq!(requests[1], (5000, 6000));
        assert_eq!(requests.last(), Some(&(10_000, 10_001)));
        assert_eq!(requests.len(), 7);
    }

    #[tokio::test]
    async fn test_checkpoint_resume_matches_cold_start() {
        let source = MockEventSource::new(12_345);
        // Coverage from events emitted before 5000 ends exactly at 5000.
        source.emit(1200, CoverageEvent::new(0, 1024));
        source.emit(2500, CoverageEvent::new(1024, 2000));
        source.emit(4900, CoverageEvent::new(3024, 1976));
        source.emit(5000, CoverageEvent::new(5000, 1500));
        source.emit(7777, CoverageEvent::new(6500, 1000));
        source.emit(9999, CoverageEvent::new(9000, 2000));
        source.emit(12_345, CoverageEvent::new(7500, 500));

        let cold = HistoryBackfiller::new(&source, &config(1000, 3000))
            .run()
            .await
            .unwrap();

        let resumed_config = MonitorConfig {
            checkpoint: Some(Checkpoint {
                resume_from: 5000,
                resume_coverage_end: 5000,
            }),
            ..config(1000, 3000)
        };
        let resumed = HistoryBackfiller::new(&source, &resumed_config)
            .run()
            .await
            .unwrap();

        assert_eq!(cold, resumed);
        assert_eq!(
            resumed.coverage.ranges(),
            &[BlockRange::new(0, 8000), BlockRange::new(9000, 11_000)]
        );
    }

    #[tokio::test]
    async fn test_resume_skips_historical_scan() {
        let source = MockEventSource::new(7000);
        let resumed_config = MonitorConfig {
            checkpoint: Some(Checkpoint {
                resume_from: 6000,
                resume_coverage_end: 5800,
            }),
            ..config(500, 5000)
        };

        let backfilled = HistoryBackfiller::new(&source, &resumed_config)
            .run()
            .await
            .unwrap();

        assert_eq!(backfilled.coverage.oldest_uncovered_boundary(), Ok(5800));
        assert_eq!(
            source.historical_requests(),
            vec![(6000, 6500), (6500, 7000), (7000, 7001)]
        );
    }

    #[tokio::test]
    async fn test_events_spanning_window_boundaries() {
        let source = MockEventSource::new(3000);
        source.emit(999, CoverageEvent::new(0, 1500));
        source.emit(1000, CoverageEvent::new(1500, 700));
        source.emit(2999, CoverageEvent::new(2200, 300));

        let backfilled = HistoryBackfiller::new(&source, &config(1000, 0))
            .run()
            .await
            .unwrap();

        assert_eq!(backfilled.coverage.ranges(), &[BlockRange::new(0, 2500)]);
    }

    #[tokio::test]
    async fn test_too_many_results_splits_window() {
        let source = MockEventSource::new(2000);
        steady_history(&source, 2000);
        source.set_max_results(Some(3));

        let backfilled = HistoryBackfiller::new(&source, &config(1000, 0))
            .run()
            .await
            .unwrap();

        assert_eq!(backfilled.coverage.ranges(), &[BlockRange::new(0, 1700)]);
        let requests = source.historical_requests();
        assert!(requests.contains(&(1000, 1500)));
        assert!(requests.contains(&(1500, 2000)));
    }

    #[tokio::test]
    async fn test_window_that_never_fits_is_fatal() {
        let source = MockEventSource::new(1000);
        source.emit(10, CoverageEvent::new(0, 5));
        source.emit(10, CoverageEvent::new(5, 5));
        source.set_max_results(Some(1));

        let result = HistoryBackfiller::new(&source, &config(1000, 0))
            .run()
            .await;

        assert_matches!(
            result,
            Err(BackfillError::WindowTooLarge { window, min_chunk_size: 1, .. })
                if window == BlockRange::new(10, 11)
        );
    }

    #[tokio::test]
    async fn test_unanchored_coverage_is_fatal() {
        let source = MockEventSource::new(5000);
        source.emit(4000, CoverageEvent::new(100, 3000));

        let result = HistoryBackfiller::new(&source, &config(1000, 0))
            .run()
            .await;

        assert_matches!(
            result,
            Err(BackfillError::NotAnchored(CoverageError::NotAnchored { first_start: 100 }))
        );
    }

    #[tokio::test]
    async fn test_empty_history_is_fatal() {
        let source = MockEventSource::new(5000);
        let result = HistoryBackfiller::new(&source, &config(1000, 0))
            .run()
            .await;
        assert_matches!(
            result,
            Err(BackfillError::NotAnchored(CoverageError::Empty))
        );
    }

    #[tokio::test]
    async fn test_source_failure_is_fatal() {
        let source = MockEventSource::new(5000);
        steady_history(&source, 5000);
        source.fail_historical_from(3000);

        let result = HistoryBackfiller::new(&source, &config(1000, 0))
            .run()
            .await;

        assert_matches!(
            result,
            Err(BackfillError::Fetch { window, .. }) if window == BlockRange::new(3000, 4000)
        );
    }

    #[tokio::test]
    async fn test_concurrent_fetch_matches_sequential() {
        let source = MockEventSource::new(20_000);
        steady_history(&source, 20_000);
        source.emit(15_000, CoverageEvent::new(25_000, 10));

        let sequential = HistoryBackfiller::new(&source, &config(700, 2000))
            .run()
            .await
            .unwrap();

        let concurrent_config = MonitorConfig {
            fetch_concurrency: 8,
            ..config(700, 2000)
        };
        let concurrent = HistoryBackfiller::new(&source, &concurrent_config)
            .run()
            .await
            .unwrap();

        assert_eq!(sequential, concurrent);
        assert_eq!(sequential.coverage.len(), 2);
        assert_eq!(sequential.checkpoint(), None);
    }

    #[tokio::test]
    async fn test_contiguous_backfill_suggests_checkpoint() {
        let source = MockEventSource::new(3000);
        steady_history(&source, 3000);

        let backfilled = HistoryBackfiller::new(&source, &config(1000, 0))
            .run()
            .await
            .unwrap();

        assert_eq!(
            backfilled.checkpoint(),
            Some(Checkpoint {
                resume_from: 3000,
                resume_coverage_end: 2700,
            })
        );
    }
}
