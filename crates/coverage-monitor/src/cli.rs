//! Command-line configuration for the coverage monitor.

use crate::config::{
    Checkpoint,
    ConfigError,
    DEFAULT_CHUNK_SIZE,
    DEFAULT_HISTORICAL_SCAN_END,
    DEFAULT_SYNC_THRESHOLD,
    MonitorConfig,
};
use alloy_primitives::Address;
use clap::Parser;
use std::time::Duration;
use url::Url;

/// Coverage contract watched when no address is given.
pub const DEFAULT_CONTRACT_ADDRESS: &str = "0x69963768F8407dE501029680dE46945F838Fc98B";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// HTTP JSON-RPC endpoint of an execution node
    #[arg(long, env = "COVERAGE_MONITOR_RPC_URL")]
    pub rpc_url: Url,

    /// Address of the contract emitting `HistoricalRootUpdated`
    #[arg(long, env = "COVERAGE_MONITOR_ADDRESS", default_value = DEFAULT_CONTRACT_ADDRESS)]
    pub address: Address,

    /// Poll interval in seconds
    #[arg(long, env = "COVERAGE_MONITOR_INTERVAL", default_value_t = 10)]
    pub interval: u64,

    /// Maximum distance in blocks between the tip and the oldest uncovered block
    #[arg(long, env = "COVERAGE_MONITOR_SYNC_THRESHOLD", default_value_t = DEFAULT_SYNC_THRESHOLD)]
    pub sync_threshold: u64,

    /// Blocks requested per backfill window
    #[arg(long, env = "COVERAGE_MONITOR_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u64,

    /// Smallest window a backfill request is split down to
    #[arg(long, env = "COVERAGE_MONITOR_MIN_CHUNK_SIZE", default_value_t = 1)]
    pub min_chunk_size: u64,

    /// Backfill windows fetched concurrently
    #[arg(long, env = "COVERAGE_MONITOR_FETCH_CONCURRENCY", default_value_t = 1)]
    pub fetch_concurrency: usize,

    /// End of the one-shot historical scan on a cold start
    #[arg(
        long,
        env = "COVERAGE_MONITOR_HISTORICAL_SCAN_END",
        default_value_t = DEFAULT_HISTORICAL_SCAN_END
    )]
    pub historical_scan_end: u64,

    /// Resume the backfill from this block instead of scanning history.
    /// Requires `--resume-coverage-end`.
    #[arg(long, env = "COVERAGE_MONITOR_RESUME_FROM")]
    pub resume_from: Option<u64>,

    /// Blocks `[0, resume-coverage-end)` are known to be covered.
    /// Requires `--resume-from`.
    #[arg(long, env = "COVERAGE_MONITOR_RESUME_COVERAGE_END")]
    pub resume_coverage_end: Option<u64>,
}

impl Args {
    pub fn monitor_config(&self) -> Result<MonitorConfig, ConfigError> {
        MonitorConfig {
            poll_interval: Duration::from_secs(self.interval),
            sync_threshold: self.sync_threshold,
            chunk_size: self.chunk_size,
            min_chunk_size: self.min_chunk_size,
            fetch_concurrency: self.fetch_concurrency,
            historical_scan_end: self.historical_scan_end,
            checkpoint: Checkpoint::from_parts(self.resume_from, self.resume_coverage_end)?,
        }
        .validate()
    }
}
