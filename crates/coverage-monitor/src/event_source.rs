use crate::coverage::CoverageEvent;
use async_trait::async_trait;
use tracing::{
    debug,
    warn,
};

/// Trait abstracting where coverage events come from.
///
/// Implementations may query a JSON-RPC node, an indexer database, a mock,
/// or any other data source.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Verify that the event source is reachable and healthy.
    ///
    /// The default implementation calls [`tip_block_number`](Self::tip_block_number)
    /// and succeeds if the call completes without error.
    async fn health_check(&self) -> Result<(), EventSourceError> {
        self.tip_block_number().await?;
        Ok(())
    }

    /// Fetch all coverage events emitted in blocks `[from_block, to_block)`.
    ///
    /// Implementations that cannot return the whole window in one response
    /// must fail with [`EventSourceError::TooManyResults`] rather than return
    /// a truncated list.
    async fn historical_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<CoverageEvent>, EventSourceError>;

    /// Latest block number known to the source.
    async fn tip_block_number(&self) -> Result<u64, EventSourceError>;

    /// Open a cursor that yields events emitted at or after `from_block`.
    async fn watch(&self, from_block: u64) -> Result<Box<dyn EventCursor>, EventSourceError>;
}

/// Stateful "new since last call" view over an [`EventSource`].
#[async_trait]
pub trait EventCursor: Send {
    /// Returns events emitted since the previous successful call.
    ///
    /// A failed call must not advance the cursor, so the next call returns
    /// the events the failed one would have. A call may stop short of the
    /// tip; the events it did not return come with the next call.
    async fn next_events(&mut self) -> Result<Vec<CoverageEvent>, EventSourceError>;
}

/// Error type for event source operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventSourceError {
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("Too many results for blocks [{from_block}, {to_block}): {message}")]
    TooManyResults {
        from_block: u64,
        to_block: u64,
        message: String,
    },
    #[error("Failed to decode event: {0}")]
    Decode(String),
    #[error("Event source unavailable: {0}")]
    Unavailable(String),
}

/// [`EventCursor`] over any [`EventSource`], reading `[next_block, tip]` with
/// [`EventSource::historical_events`] in spans of at most `max_span` blocks.
///
/// A span refused with [`EventSourceError::TooManyResults`] is halved until it
/// fits and grows back after each successful read. If a span fails after earlier spans of the same call succeeded, the
/// events read so far are returned and the cursor stays at the failed span.
#[derive(Debug)]
pub struct SpanningCursor<S> {
    source: S,
    next_block: u64,
    max_span: u64,
}

impl<S: EventSource> SpanningCursor<S> {
    pub fn new(source: S, from_block: u64, max_span: u64) -> Self {
        Self {
            source,
            next_block: from_block,
            max_span: max_span.max(1),
        }
    }

    /// First block the next call will read.
    pub fn next_block(&self) -> u64 {
        self.next_block
    }
}

#[async_trait]
impl<S: EventSource> EventCursor for SpanningCursor<S> {
    async fn next_events(&mut self) -> Result<Vec<CoverageEvent>, EventSourceError> {
        let tip = self.source.tip_block_number().await?;
        let end = tip.saturating_add(1);
        let mut span = self.max_span;
        let mut events = Vec::new();

        while self.next_block < end {
            let from_block = self.next_block;
            let to_block = from_block.saturating_add(span).min(end);

            match self.source.historical_events(from_block, to_block).await {
                Ok(batch) => {
                    debug!(
                        target = "coverage_monitor::cursor",
                        from_block,
                        to_block,
                        events = batch.len(),
                        "Read cursor span"
                    );
                    events.extend(batch);
                    self.next_block = to_block;
                    span = span.saturating_mul(2).min(self.max_span);
                }
                Err(EventSourceError::TooManyResults { .. }) if to_block - from_block > 1 => {
                    span = (to_block - from_block) / 2;
                    warn!(
                        target = "coverage_monitor::cursor",
                        from_block,
                        to_block,
                        span,
                        "Too many results, shrinking cursor span"
                    );
                }
                Err(err) if events.is_empty() => return Err(err),
                Err(err) => {
                    warn!(
                        target = "coverage_monitor::cursor",
                        error = %err,
                        next_block = from_block,
                        "Cursor span failed, returning events read so far"
                    );
                    break;
                }
            }
        }

        Ok(events)
    }
}
