//! JSON-RPC backed [`EventSource`] reading `HistoricalRootUpdated` logs with
//! `eth_getLogs`.

use crate::{
    config::DEFAULT_CHUNK_SIZE,
    coverage::CoverageEvent,
    event_source::{
        EventCursor,
        EventSource,
        EventSourceError,
        SpanningCursor,
    },
};
use alloy_primitives::Address;
use alloy_provider::{
    Provider,
    ProviderBuilder,
    RootProvider,
};
use alloy_rpc_types::{
    Filter,
    Log,
};
use alloy_sol_types::{
    SolEvent,
    sol,
};
use alloy_transport::TransportError;
use async_trait::async_trait;
use tracing::{
    debug,
    info,
    trace,
};
use url::Url;

sol! {
    /// Emitted by the coverage contract when `numFinal` blocks starting at
    /// `startBlockNumber` have their historical root committed.
    #[derive(Debug)]
    event HistoricalRootUpdated(
        uint32 indexed startBlockNumber,
        bytes32 indexed prevHash,
        bytes32 indexed root,
        uint32 numFinal
    );
}

/// Substrings providers use in `eth_getLogs` errors when the response would
/// hold too many logs or span too many blocks. Rate limiting shares error codes
/// with these (Infura uses -32005 for both), so only the message is trusted.
const TOO_MANY_RESULTS_HINTS: &[&str] = &[
    "query returned more than",
    "too many results",
    "too many logs",
    "response size exceeded",
    "exceed maximum block range",
];

/// Reads coverage events of one contract from an Ethereum JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct RpcEventSource {
    provider: RootProvider,
    address: Address,
    cursor_span: u64,
}

impl RpcEventSource {
    /// Build a source over HTTP.
    pub fn connect_http(rpc_url: Url, address: Address) -> Self {
        info!(%rpc_url, %address, "Connecting to JSON-RPC endpoint");
        let provider = ProviderBuilder::new().connect_http(rpc_url);
        Self::new(provider.root().clone(), address)
    }

    pub fn new(provider: RootProvider, address: Address) -> Self {
        Self {
            provider,
            address,
            cursor_span: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Largest block span a live cursor requests in one `eth_getLogs` call.
    #[must_use]
    pub fn with_cursor_span(mut self, cursor_span: u64) -> Self {
        self.cursor_span = cursor_span.max(1);
        self
    }

    /// `eth_getLogs` over the inclusive span `[from_block, to_block]`.
    async fn logs_between(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<CoverageEvent>, EventSourceError> {
        let filter = Filter::new()
            .address(self.address)
            .event_signature(HistoricalRootUpdated::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|err| classify_logs_error(&err, from_block, to_block.saturating_add(1)))?;

        trace!(from_block, to_block, logs = logs.len(), "Fetched logs");
        logs.iter().map(decode_coverage_log).collect()
    }
}

#[async_trait]
impl EventSource for RpcEventSource {
    async fn historical_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<CoverageEvent>, EventSourceError> {
        if to_block <= from_block {
            return Ok(Vec::new());
        }
        self.logs_between(from_block, to_block - 1).await
    }

    async fn tip_block_number(&self) -> Result<u64, EventSourceError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|err| transport_error(&err))
    }

    async fn watch(&self, from_block: u64) -> Result<Box<dyn EventCursor>, EventSourceError> {
        debug!(from_block, span = self.cursor_span, "Opening log cursor");
        Ok(Box::new(SpanningCursor::new(
            self.clone(),
            from_block,
            self.cursor_span,
        )))
    }
}

fn decode_coverage_log(log: &Log) -> Result<CoverageEvent, EventSourceError> {
    let decoded = HistoricalRootUpdated::decode_log(&log.inner)
        .map_err(|err| EventSourceError::Decode(err.to_string()))?;

    let event = CoverageEvent::new(
        u64::from(decoded.data.startBlockNumber),
        decoded.data.numFinal,
    );
    Ok(match log.block_number {
        Some(block_number) => event.emitted_at(block_number),
        None => event,
    })
}

fn classify_logs_error(err: &TransportError, from_block: u64, to_block: u64) -> EventSourceError {
    match err.as_error_resp() {
        Some(payload) if is_too_many_results(&payload.message) => {
            EventSourceError::TooManyResults {
                from_block,
                to_block,
                message: payload.message.to_string(),
            }
        }
        _ => transport_error(err),
    }
}

fn transport_error(err: &TransportError) -> EventSourceError {
    if err.is_transport_error() {
        EventSourceError::Unavailable(err.to_string())
    } else {
        EventSourceError::RequestFailed(err.to_string())
    }
}

fn is_too_many_results(message: &str) -> bool {
    let message = message.to_lowercase();
    TOO_MANY_RESULTS_HINTS
        .iter()
        .any(|hint| message.contains(hint))
}
