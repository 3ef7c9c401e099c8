//! Cache-mode policy engine.
//!
//! Pure decision function mapping `(direction, mode, lookup, seq_bypass)` to
//! the device actions a request performs and the counters those actions
//! increment. This table is the behavioral contract of the engine; the
//! instance layer applies it mechanically, per 4 KiB block.
//!
//! Counter policy notes:
//!
//! - A write that reaches the core while a stale copy is resident refreshes
//!   the cached copy in place. The refresh is a coherence action, not cache
//!   traffic: it does not count toward `cache.writes` (Write-Around and
//!   Pass-Through keep their zero-cache-write contracts) and it clears the
//!   covered dirty bits, since the core holds the same data afterwards.
//! - A dirty resident block always serves reads from cache, whatever the
//!   active mode: it is the only copy of that data. Under modes that do not
//!   record cache activity (Pass-Through, Write-Only) the serve is silent.

use cascade_types::CacheMode;

/// Mapping-table lookup result for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    HitClean,
    HitDirty,
    Miss,
}

impl Lookup {
    #[must_use]
    pub fn is_hit(self) -> bool {
        !matches!(self, Self::Miss)
    }
}

/// I/O direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    Read,
    Write,
}

/// Device actions for one block of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteDecision {
    /// Read path: serve the block from the cache device.
    pub serve_from_cache: bool,
    /// Increment `cache.reads` for the served block.
    pub count_cache_read: bool,
    /// Write path: store the block on the cache device.
    pub write_cache: bool,
    /// Increment `cache.writes` for the stored block.
    pub count_cache_write: bool,
    /// Mark the stored block dirty (lazy write).
    pub mark_dirty: bool,
    /// Clear the stored block's dirty bit (core holds the same data).
    pub clean_written: bool,
    /// Read path: fetch the block from the core device.
    pub read_core: bool,
    /// Write path: store the block on the core device.
    pub write_core: bool,
    /// Allocate a mapping for the block if it misses.
    pub insert_on_miss: bool,
    /// Read path: insert the fetched block into the cache, counting the
    /// insert as a cache write.
    pub insert_read: bool,
    /// Request-stats classification: the data path bypassed the cache.
    pub pass_through: bool,
}

/// Decide the device actions for one block.
///
/// `seq_bypass` is the sequential-cutoff verdict; when set, the request is
/// routed as Pass-Through regardless of `mode`.
#[must_use]
pub fn route(direction: IoDir, mode: CacheMode, lookup: Lookup, seq_bypass: bool) -> RouteDecision {
    let mode = if seq_bypass {
        CacheMode::PassThrough
    } else {
        mode
    };

    match direction {
        IoDir::Write => route_write(mode, lookup),
        IoDir::Read => route_read(mode, lookup),
    }
}

fn route_write(mode: CacheMode, lookup: Lookup) -> RouteDecision {
    match mode {
        CacheMode::WriteThrough => RouteDecision {
            write_cache: true,
            count_cache_write: true,
            clean_written: true,
            write_core: true,
            insert_on_miss: true,
            ..RouteDecision::default()
        },
        CacheMode::WriteBack | CacheMode::WriteOnly => RouteDecision {
            write_cache: true,
            count_cache_write: true,
            mark_dirty: true,
            insert_on_miss: true,
            ..RouteDecision::default()
        },
        CacheMode::WriteAround => RouteDecision {
            write_core: true,
            // Refresh resident copies without counting cache traffic.
            write_cache: lookup.is_hit(),
            clean_written: lookup.is_hit(),
            pass_through: lookup == Lookup::Miss,
            ..RouteDecision::default()
        },
        CacheMode::PassThrough => RouteDecision {
            write_core: true,
            write_cache: lookup.is_hit(),
            clean_written: lookup.is_hit(),
            pass_through: true,
            ..RouteDecision::default()
        },
    }
}

fn route_read(mode: CacheMode, lookup: Lookup) -> RouteDecision {
    match mode {
        CacheMode::WriteThrough | CacheMode::WriteBack | CacheMode::WriteAround => match lookup {
            Lookup::HitClean | Lookup::HitDirty => RouteDecision {
                serve_from_cache: true,
                count_cache_read: true,
                ..RouteDecision::default()
            },
            Lookup::Miss => RouteDecision {
                read_core: true,
                insert_on_miss: true,
                insert_read: true,
                ..RouteDecision::default()
            },
        },
        CacheMode::WriteOnly => match lookup {
            // Resident data serves from cache without recorded cache
            // activity; reads never populate the cache in Write-Only.
            Lookup::HitClean | Lookup::HitDirty => RouteDecision {
                serve_from_cache: true,
                ..RouteDecision::default()
            },
            Lookup::Miss => RouteDecision {
                read_core: true,
                pass_through: true,
                ..RouteDecision::default()
            },
        },
        CacheMode::PassThrough => match lookup {
            Lookup::HitDirty => RouteDecision {
                serve_from_cache: true,
                pass_through: true,
                ..RouteDecision::default()
            },
            Lookup::HitClean | Lookup::Miss => RouteDecision {
                read_core: true,
                pass_through: true,
                ..RouteDecision::default()
            },
        },
    }
}
