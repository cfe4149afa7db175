//! Interval bookkeeping for finalized block coverage.
//!
//! Every `HistoricalRootUpdated` event reports that a contiguous span of blocks
//! is covered. [`CoverageSet`] keeps the union of all reported spans as a sorted
//! list of disjoint, non-touching half-open ranges so that the first range tells
//! us how far coverage extends contiguously from genesis.

use serde::{
    Deserialize,
    Serialize,
};
use std::fmt;

/// Lowest block of the covered domain. Coverage is only meaningful when the
/// first range starts here.
pub const GENESIS_BLOCK: u64 = 0;

/// Half-open interval `[start, end)` of block numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawBlockRange")]
pub struct BlockRange {
    start: u64,
    end: u64,
}

/// Wire form of [`BlockRange`], checked before it becomes one.
#[derive(Deserialize)]
struct RawBlockRange {
    start: u64,
    end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed block range: start {start} is past end {end}")]
pub struct MalformedRange {
    pub start: u64,
    pub end: u64,
}

impl TryFrom<RawBlockRange> for BlockRange {
    type Error = MalformedRange;

    fn try_from(raw: RawBlockRange) -> Result<Self, Self::Error> {
        Self::try_new(raw.start, raw.end)
    }
}

impl BlockRange {
    /// Creates the range `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics if `start > end`. A reversed range can only come from a bug in
    /// the caller and must never be folded into the coverage set.
    pub fn new(start: u64, end: u64) -> Self {
        assert!(
            start <= end,
            "malformed block range: start {start} is past end {end}"
        );
        Self { start, end }
    }

    /// Creates the range `[start, end)`, rejecting `start > end`.
    pub fn try_new(start: u64, end: u64) -> Result<Self, MalformedRange> {
        if start > end {
            return Err(MalformedRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of blocks in the range.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, block: u64) -> bool {
        self.start <= block && block < self.end
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A decoded coverage notification: `num_final` blocks starting at
/// `start_block` are finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageEvent {
    /// First covered block.
    pub start_block: u64,
    /// Number of covered blocks.
    pub num_final: u32,
    /// Block in which the event was emitted, when the source knows it.
    pub block_number: Option<u64>,
}

impl CoverageEvent {
    pub fn new(start_block: u64, num_final: u32) -> Self {
        Self {
            start_block,
            num_final,
            block_number: None,
        }
    }

    #[must_use]
    pub fn emitted_at(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }

    /// The covered range `[start_block, start_block + num_final)`.
    ///
    /// # Panics
    ///
    /// Panics if the end of the range does not fit in a `u64`.
    #[allow(clippy::panic)]
    pub fn range(&self) -> BlockRange {
        let Some(end) = self.start_block.checked_add(u64::from(self.num_final)) else {
            panic!(
                "malformed coverage event: start {} + length {} overflows",
                self.start_block, self.num_final
            );
        };
        BlockRange::new(self.start_block, end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CoverageError {
    #[error("no coverage ranges are known")]
    Empty,
    #[error("coverage is not anchored at genesis, first range starts at block {first_start}")]
    NotAnchored { first_start: u64 },
}

/// Sorted, disjoint, non-touching set of covered block ranges.
///
/// Deserialized sets are re-merged, so arbitrary input still upholds the
/// ordering invariant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawCoverageSet")]
pub struct CoverageSet {
    ranges: Vec<BlockRange>,
}

#[derive(Deserialize)]
struct RawCoverageSet {
    ranges: Vec<BlockRange>,
}

impl From<RawCoverageSet> for CoverageSet {
    fn from(raw: RawCoverageSet) -> Self {
        let mut set = Self::default();
        set.extend_and_merge(raw.ranges.into_iter());
        set
    }
}

impl CoverageSet {
    /// A set holding the single range `[GENESIS_BLOCK, coverage_end)`, used to
    /// resume from a checkpoint without rescanning history.
    pub fn seeded(coverage_end: u64) -> Self {
        let mut set = Self::default();
        set.add_range(BlockRange::new(GENESIS_BLOCK, coverage_end));
        set
    }

    /// Inserts `range` and re-merges the whole set.
    pub fn add_range(&mut self, range: BlockRange) {
        self.extend_and_merge(std::iter::once(range));
    }

    /// Inserts the ranges of all `events` and re-merges once.
    pub fn add_ranges<'a, I>(&mut self, events: I)
    where
        I: IntoIterator<Item = &'a CoverageEvent>,
    {
        self.extend_and_merge(events.into_iter().map(CoverageEvent::range));
    }

    fn extend_and_merge(&mut self, ranges: impl Iterator<Item = BlockRange>) {
        let before = self.ranges.len();
        self.ranges.extend(ranges.filter(|range| !range.is_empty()));
        if self.ranges.len() == before {
            return;
        }

        self.ranges.sort_unstable_by_key(BlockRange::start);

        let mut merged: Vec<BlockRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                // Overlapping or touching: extend the previous range.
                Some(last) if last.end >= range.start => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    /// End of the first range, i.e. the first block not known to be covered
    /// contiguously from genesis.
    pub fn oldest_uncovered_boundary(&self) -> Result<u64, CoverageError> {
        let first = self.ranges.first().ok_or(CoverageError::Empty)?;
        if first.start != GENESIS_BLOCK {
            return Err(CoverageError::NotAnchored {
                first_start: first.start,
            });
        }
        Ok(first.end)
    }

    /// Whether the first range starts at [`GENESIS_BLOCK`].
    pub fn is_anchored(&self) -> bool {
        self.ranges
            .first()
            .is_some_and(|first| first.start == GENESIS_BLOCK)
    }

    pub fn covers(&self, block: u64) -> bool {
        let idx = self.ranges.partition_point(|range| range.end <= block);
        self.ranges.get(idx).is_some_and(|range| range.contains(block))
    }

    pub fn ranges(&self) -> &[BlockRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
