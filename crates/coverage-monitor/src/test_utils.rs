//! In-memory event source and recording sink shared by the unit tests.

use crate::{
    coverage::CoverageEvent,
    event_source::{
        EventCursor,
        EventSource,
        EventSourceError,
    },
    monitor::{
        SyncStatus,
        Transition,
    },
    observer::{
        Observation,
        ObservationSink,
    },
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// This gets invoked before any tests, when the cargo test framework loads the test library.
/// Set `TEST_TRACE` to a level to see the monitor's logs.
#[ctor::ctor]
fn init_tests() {
    use tracing_subscriber::{
        filter::filter_fn,
        prelude::*,
    };
    if let Ok(v) = std::env::var("TEST_TRACE") {
        let level = match v.as_str() {
            "false" | "off" => return,
            "true" | "debug" | "on" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            "info" => tracing::Level::INFO,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => return,
        };

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(filter_fn(move |metadata| metadata.level() <= &level))
            .init();
    }
}

#[derive(Debug, Default)]
struct MockState {
    tip: u64,
    /// `(emitted_at, event)` pairs.
    events: Vec<(u64, CoverageEvent)>,
    max_results: Option<usize>,
    fail_historical_from: Option<u64>,
    fail_next_pulls: usize,
    fail_next_tip_reads: usize,
    historical_requests: Vec<(u64, u64)>,
}

impl MockState {
    /// Events emitted in the inclusive block span `[from, to]`.
    fn emitted_between(&self, from: u64, to: u64) -> Vec<CoverageEvent> {
        self.events
            .iter()
            .filter(|(block, _)| (from..=to).contains(block))
            .map(|(_, event)| *event)
            .collect()
    }
}

/// Chain double: events are emitted at a block and become visible to
/// historical queries and cursors by that block number.
#[derive(Debug, Clone)]
pub struct MockEventSource {
    state: Arc<Mutex<MockState>>,
}

impl MockEventSource {
    pub fn new(tip: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                tip,
                ..MockState::default()
            })),
        }
    }

    pub fn emit(&self, block: u64, event: CoverageEvent) {
        self.state.lock().events.push((block, event.emitted_at(block)));
    }

    pub fn set_tip(&self, tip: u64) {
        self.state.lock().tip = tip;
    }

    /// Historical queries returning more events than `max` fail with
    /// [`EventSourceError::TooManyResults`].
    pub fn set_max_results(&self, max: Option<usize>) {
        self.state.lock().max_results = max;
    }

    /// Historical queries starting at or after `block` fail.
    pub fn fail_historical_from(&self, block: u64) {
        self.state.lock().fail_historical_from = Some(block);
    }

    /// Stops injecting historical query failures.
    pub fn clear_failures(&self) {
        self.state.lock().fail_historical_from = None;
    }

    pub fn fail_next_pulls(&self, count: usize) {
        self.state.lock().fail_next_pulls = count;
    }

    pub fn fail_next_tip_reads(&self, count: usize) {
        self.state.lock().fail_next_tip_reads = count;
    }

    pub fn historical_requests(&self) -> Vec<(u64, u64)> {
        self.state.lock().historical_requests.clone()
    }
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn historical_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<CoverageEvent>, EventSourceError> {
        let mut state = self.state.lock();
        state.historical_requests.push((from_block, to_block));

        if state
            .fail_historical_from
            .is_some_and(|block| from_block >= block)
        {
            return Err(EventSourceError::RequestFailed(format!(
                "injected failure for blocks [{from_block}, {to_block})"
            )));
        }

        if to_block <= from_block {
            return Ok(Vec::new());
        }
        let events = state.emitted_between(from_block, to_block - 1);
        if let Some(max) = state.max_results
            && events.len() > max
        {
            return Err(EventSourceError::TooManyResults {
                from_block,
                to_block,
                message: format!("{} results, limit is {max}", events.len()),
            });
        }
        Ok(events)
    }

    async fn tip_block_number(&self) -> Result<u64, EventSourceError> {
        let mut state = self.state.lock();
        if state.fail_next_tip_reads > 0 {
            state.fail_next_tip_reads -= 1;
            return Err(EventSourceError::Unavailable("injected tip failure".into()));
        }
        Ok(state.tip)
    }

    async fn watch(&self, from_block: u64) -> Result<Box<dyn EventCursor>, EventSourceError> {
        Ok(Box::new(MockCursor {
            state: self.state.clone(),
            next_block: from_block,
        }))
    }
}

struct MockCursor {
    state: Arc<Mutex<MockState>>,
    next_block: u64,
}

#[async_trait]
impl EventCursor for MockCursor {
    async fn next_events(&mut self) -> Result<Vec<CoverageEvent>, EventSourceError> {
        let mut state = self.state.lock();
        if state.fail_next_pulls > 0 {
            state.fail_next_pulls -= 1;
            return Err(EventSourceError::RequestFailed("injected pull failure".into()));
        }

        if state.tip < self.next_block {
            return Ok(Vec::new());
        }
        let events = state.emitted_between(self.next_block, state.tip);
        self.next_block = state.tip + 1;
        Ok(events)
    }
}

/// Sink that keeps every observation, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    observations: Arc<Mutex<Vec<Observation>>>,
}

impl RecordingSink {
    pub fn observations(&self) -> Vec<Observation> {
        self.observations.lock().clone()
    }

    pub fn statuses(&self) -> Vec<SyncStatus> {
        self.observations()
            .into_iter()
            .filter_map(|observation| {
                match observation {
                    Observation::Status(status) => Some(status),
                    _ => None,
                }
            })
            .collect()
    }

    /// Transitions paired with the 1-based cycle that produced them.
    pub fn transitions(&self) -> Vec<(usize, Transition)> {
        let mut cycle = 0;
        let mut transitions = Vec::new();
        for observation in self.observations() {
            match observation {
                Observation::Status(_) => cycle += 1,
                Observation::Transition { transition, .. } => {
                    transitions.push((cycle + 1, transition));
                }
                Observation::TransientError { .. } => {}
            }
        }
        transitions
    }

    pub fn errors(&self) -> Vec<String> {
        self.observations()
            .into_iter()
            .filter_map(|observation| {
                match observation {
                    Observation::TransientError { message } => Some(message),
                    _ => None,
                }
            })
            .collect()
    }
}

impl ObservationSink for RecordingSink {
    fn observe(&mut self, observation: &Observation) {
        self.observations.lock().push(observation.clone());
    }
}
