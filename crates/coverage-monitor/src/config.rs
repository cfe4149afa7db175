//! Runtime configuration for the coverage monitor.

use serde::{
    Deserialize,
    Serialize,
};
use std::time::Duration;

/// Default distance, in blocks, the oldest uncovered block may trail the tip
/// while still being considered in sync.
pub const DEFAULT_SYNC_THRESHOLD: u64 = 224;
/// Default number of blocks requested per backfill window.
pub const DEFAULT_CHUNK_SIZE: u64 = 1000;
/// Default upper bound of the one-shot historical scan on a cold start.
pub const DEFAULT_HISTORICAL_SCAN_END: u64 = 19_000_000;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// A previously recorded resume point.
///
/// Blocks `[0, resume_coverage_end)` are known to be covered, and every event
/// emitted before `resume_from` has already been accounted for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub resume_from: u64,
    pub resume_coverage_end: u64,
}

impl Checkpoint {
    /// Builds a checkpoint from the two optional halves supplied by the
    /// operator. Both or neither must be present.
    pub fn from_parts(
        resume_from: Option<u64>,
        resume_coverage_end: Option<u64>,
    ) -> Result<Option<Self>, ConfigError> {
        match (resume_from, resume_coverage_end) {
            (Some(resume_from), Some(resume_coverage_end)) => {
                Ok(Some(Self {
                    resume_from,
                    resume_coverage_end,
                }))
            }
            (None, None) => Ok(None),
            (Some(_), None) => Err(ConfigError::PartialCheckpoint("resume_coverage_end")),
            (None, Some(_)) => Err(ConfigError::PartialCheckpoint("resume_from")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("checkpoint is incomplete: {0} is missing")]
    PartialCheckpoint(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables for backfill and steady-state polling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Time between two poll cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Maximum allowed distance between the tip and the oldest uncovered block.
    #[serde(default = "default_sync_threshold")]
    pub sync_threshold: u64,
    /// Blocks requested per backfill window.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Smallest window the backfiller will split down to when the source
    /// reports too many results.
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    /// Number of backfill windows fetched concurrently.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    /// End of the one-shot historical scan performed on a cold start.
    #[serde(default = "default_historical_scan_end")]
    pub historical_scan_end: u64,
    /// Skip the historical scan and resume from here.
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_sync_threshold() -> u64 {
    DEFAULT_SYNC_THRESHOLD
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_min_chunk_size() -> u64 {
    1
}

fn default_fetch_concurrency() -> usize {
    1
}

fn default_historical_scan_end() -> u64 {
    DEFAULT_HISTORICAL_SCAN_END
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            sync_threshold: default_sync_threshold(),
            chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            fetch_concurrency: default_fetch_concurrency(),
            historical_scan_end: default_historical_scan_end(),
            checkpoint: None,
        }
    }
}

impl MonitorConfig {
    /// Validates a configuration loaded from CLI flags or disk.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.min_chunk_size == 0 || self.min_chunk_size > self.chunk_size {
            return Err(ConfigError::Invalid(format!(
                "min_chunk_size must be in 1..={}, got {}",
                self.chunk_size, self.min_chunk_size
            )));
        }
        if self.fetch_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "fetch_concurrency must be greater than zero".to_string(),
            ));
        }
        if let Some(checkpoint) = self.checkpoint
            && checkpoint.resume_coverage_end == 0
        {
            return Err(ConfigError::Invalid(
                "checkpoint resume_coverage_end must be greater than zero".to_string(),
            ));
        }

        Ok(self)
    }
}
