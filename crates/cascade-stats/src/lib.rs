#![forbid(unsafe_code)]
//! Statistics counters for Cascade.
//!
//! Counters are the sole externally observable proxy for routing decisions:
//! every correctness assertion in the test suites is expressed over counter
//! deltas. Three role-scoped block counters (`cache`, `core`, `exported
//! object`) track cumulative read/write bytes; request counters track
//! serviced and pass-through request counts.
//!
//! # Invariants
//!
//! - Counters are monotone until [`BlockCounters::reset`] /
//!   [`RequestCounters::reset`], which exchange each counter to zero
//!   atomically: a concurrent increment lands fully before or fully after
//!   the reset, never split across it.
//! - Snapshots subtract component-wise for delta-based assertions.

use cascade_types::BLOCK_4K;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Sub;
use std::sync::atomic::{AtomicU64, Ordering};

/// Device role a block counter is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Cache,
    Core,
    ExportedObject,
}

/// I/O direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Sections of a statistics snapshot to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsFilter {
    Blocks,
    Requests,
    Usage,
    All,
}

#[derive(Debug, Default)]
struct DirectionPair {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl DirectionPair {
    fn add(&self, direction: Direction, amount: u64) {
        match direction {
            Direction::Read => self.reads.fetch_add(amount, Ordering::Relaxed),
            Direction::Write => self.writes.fetch_add(amount, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> RoleSnapshot {
        RoleSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) -> RoleSnapshot {
        RoleSnapshot {
            reads: self.reads.swap(0, Ordering::Relaxed),
            writes: self.writes.swap(0, Ordering::Relaxed),
        }
    }
}

/// Cumulative read/write bytes for one device role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSnapshot {
    pub reads: u64,
    pub writes: u64,
}

impl RoleSnapshot {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.reads.saturating_add(self.writes)
    }

    /// Reads expressed in 4 KiB blocks (truncating).
    #[must_use]
    pub fn reads_4k(&self) -> u64 {
        self.reads / BLOCK_4K
    }

    /// Writes expressed in 4 KiB blocks (truncating).
    #[must_use]
    pub fn writes_4k(&self) -> u64 {
        self.writes / BLOCK_4K
    }
}

impl Sub for RoleSnapshot {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            reads: self.reads.saturating_sub(rhs.reads),
            writes: self.writes.saturating_sub(rhs.writes),
        }
    }
}

impl fmt::Display for RoleSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Reads: {} [4KiB blocks]\nWrites: {} [4KiB blocks]\nTotal: {} [4KiB blocks]",
            self.reads_4k(),
            self.writes_4k(),
            self.total() / BLOCK_4K
        )
    }
}

/// Role-scoped block counters (bytes).
#[derive(Debug, Default)]
pub struct BlockCounters {
    cache: DirectionPair,
    core: DirectionPair,
    exported: DirectionPair,
}

impl BlockCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` bytes to the counter for `(role, direction)`.
    pub fn increment(&self, role: Role, direction: Direction, amount: u64) {
        let pair = match role {
            Role::Cache => &self.cache,
            Role::Core => &self.core,
            Role::ExportedObject => &self.exported,
        };
        pair.add(direction, amount);
    }

    #[must_use]
    pub fn snapshot(&self) -> BlockStatsSnapshot {
        BlockStatsSnapshot {
            cache: self.cache.snapshot(),
            core: self.core.snapshot(),
            exp_obj: self.exported.snapshot(),
        }
    }

    /// Exchange every counter to zero, returning the drained values.
    ///
    /// An increment concurrent with a reset lands fully in the drained
    /// snapshot or fully in the zeroed counters, never in neither.
    pub fn reset(&self) -> BlockStatsSnapshot {
        BlockStatsSnapshot {
            cache: self.cache.reset(),
            core: self.core.reset(),
            exp_obj: self.exported.reset(),
        }
    }

}

/// Point-in-time copy of [`BlockCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatsSnapshot {
    pub cache: RoleSnapshot,
    pub core: RoleSnapshot,
    pub exp_obj: RoleSnapshot,
}

impl Sub for BlockStatsSnapshot {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            cache: self.cache - rhs.cache,
            core: self.core - rhs.core,
            exp_obj: self.exp_obj - rhs.exp_obj,
        }
    }
}

impl fmt::Display for BlockStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block stats:\nCache:\n{}\nCore(s):\n{}\nExported object(s):\n{}",
            self.cache, self.core, self.exp_obj
        )
    }
}

/// Request counters (request counts, not bytes).
#[derive(Debug, Default)]
pub struct RequestCounters {
    serviced_reads: AtomicU64,
    serviced_writes: AtomicU64,
    pass_through_reads: AtomicU64,
    pass_through_writes: AtomicU64,
}

impl RequestCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request routed through the cache engine.
    pub fn record(&self, direction: Direction, pass_through: bool) {
        let counter = match (direction, pass_through) {
            (Direction::Read, false) => &self.serviced_reads,
            (Direction::Write, false) => &self.serviced_writes,
            (Direction::Read, true) => &self.pass_through_reads,
            (Direction::Write, true) => &self.pass_through_writes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> RequestStatsSnapshot {
        RequestStatsSnapshot {
            serviced_reads: self.serviced_reads.load(Ordering::Relaxed),
            serviced_writes: self.serviced_writes.load(Ordering::Relaxed),
            pass_through_reads: self.pass_through_reads.load(Ordering::Relaxed),
            pass_through_writes: self.pass_through_writes.load(Ordering::Relaxed),
        }
    }

    /// Exchange every counter to zero, returning the drained values.
    pub fn reset(&self) -> RequestStatsSnapshot {
        RequestStatsSnapshot {
            serviced_reads: self.serviced_reads.swap(0, Ordering::Relaxed),
            serviced_writes: self.serviced_writes.swap(0, Ordering::Relaxed),
            pass_through_reads: self.pass_through_reads.swap(0, Ordering::Relaxed),
            pass_through_writes: self.pass_through_writes.swap(0, Ordering::Relaxed),
        }
    }

}

/// Point-in-time copy of [`RequestCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStatsSnapshot {
    pub serviced_reads: u64,
    pub serviced_writes: u64,
    pub pass_through_reads: u64,
    pub pass_through_writes: u64,
}

impl RequestStatsSnapshot {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.serviced_reads
            .saturating_add(self.serviced_writes)
            .saturating_add(self.pass_through_reads)
            .saturating_add(self.pass_through_writes)
    }
}

impl Sub for RequestStatsSnapshot {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            serviced_reads: self.serviced_reads.saturating_sub(rhs.serviced_reads),
            serviced_writes: self.serviced_writes.saturating_sub(rhs.serviced_writes),
            pass_through_reads: self.pass_through_reads.saturating_sub(rhs.pass_through_reads),
            pass_through_writes: self
                .pass_through_writes
                .saturating_sub(rhs.pass_through_writes),
        }
    }
}

impl fmt::Display for RequestStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Request stats:\nServiced reads: {}\nServiced writes: {}\n\
             Pass-Through reads: {}\nPass-Through writes: {}\nTotal requests: {}",
            self.serviced_reads,
            self.serviced_writes,
            self.pass_through_reads,
            self.pass_through_writes,
            self.total()
        )
    }
}

/// Cache line occupancy snapshot (line counts).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub occupancy: u64,
    pub free: u64,
    pub clean: u64,
    pub dirty: u64,
}

impl fmt::Display for UsageSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Usage stats:\nOccupancy: {}\nFree: {}\nClean: {}\nDirty: {}",
            self.occupancy, self.free, self.clean, self.dirty
        )
    }
}

/// Full statistics snapshot returned by `get_statistics`.
///
/// All sections are always populated; `filters` records which sections the
/// caller asked for and limits what `Display` renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub block_stats: BlockStatsSnapshot,
    pub request_stats: RequestStatsSnapshot,
    pub usage_stats: UsageSnapshot,
    #[serde(skip)]
    rendered: RenderSections,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct RenderSections {
    blocks: bool,
    requests: bool,
    usage: bool,
}

impl Statistics {
    #[must_use]
    pub fn new(
        block_stats: BlockStatsSnapshot,
        request_stats: RequestStatsSnapshot,
        usage_stats: UsageSnapshot,
        filters: &[StatsFilter],
    ) -> Self {
        let all = filters.is_empty() || filters.contains(&StatsFilter::All);
        let rendered = RenderSections {
            blocks: all || filters.contains(&StatsFilter::Blocks),
            requests: all || filters.contains(&StatsFilter::Requests),
            usage: all || filters.contains(&StatsFilter::Usage),
        };
        Self {
            block_stats,
            request_stats,
            usage_stats,
            rendered,
        }
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sections = Vec::new();
        if self.rendered.blocks {
            sections.push(self.block_stats.to_string());
        }
        if self.rendered.requests {
            sections.push(self.request_stats.to_string());
        }
        if self.rendered.usage {
            sections.push(self.usage_stats.to_string());
        }
        f.write_str(&sections.join("\n"))
    }
}
