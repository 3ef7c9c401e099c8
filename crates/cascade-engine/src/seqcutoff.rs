//! Sequential cutoff classifier.
//!
//! Per-stream detector that forces large sequential write streams to bypass
//! the cache. A stream is the lineage of writes joined by strict offset
//! contiguity: a write continues the stream whose last end-offset equals the
//! write's start offset. Stream state is in-memory only; restarting the
//! cache instance resets it. The configuration (policy, threshold,
//! promotion count) persists with the core registration.
//!
//! Verdict for a write of `len` bytes on a stream with `run_bytes`
//! accumulated and `req_count` sequential requests seen:
//!
//! ```text
//! bypass = policy engaged
//!       && req_count >= promotion_count
//!       && run_bytes + len >= threshold
//! ```
//!
//! The threshold is exclusive: a run of threshold minus one block stays
//! cached, and the next request on the stream is the first one forced to
//! pass through.

use cascade_error::{CascadeError, Result};
use cascade_types::{SeqCutOffConfig, SeqCutOffPolicy};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Upper bound on tracked streams per core. The oldest stream is dropped
/// once the table is full; a dropped stream restarts cold on its next write.
const MAX_STREAMS: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct StreamState {
    run_bytes: u64,
    req_count: u32,
}

#[derive(Debug, Default)]
struct StreamTable {
    /// Keyed by the offset the stream's next sequential write must start at.
    streams: HashMap<u64, StreamState>,
    /// Insertion order for eviction; entries may be stale after a stream
    /// advances its key.
    order: VecDeque<u64>,
}

/// Per-core sequential cutoff classifier.
#[derive(Debug)]
pub struct SeqCutOffClassifier {
    config: RwLock<SeqCutOffConfig>,
    table: Mutex<StreamTable>,
}

impl SeqCutOffClassifier {
    #[must_use]
    pub fn new(config: SeqCutOffConfig) -> Self {
        Self {
            config: RwLock::new(config),
            table: Mutex::new(StreamTable::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> SeqCutOffConfig {
        *self.config.read()
    }

    pub fn set_policy(&self, policy: SeqCutOffPolicy) {
        self.config.write().policy = policy;
    }

    pub fn set_threshold(&self, threshold_bytes: u64) -> Result<()> {
        if threshold_bytes == 0 {
            return Err(CascadeError::InvalidConfiguration(
                "sequential cutoff threshold must be greater than zero".to_owned(),
            ));
        }
        self.config.write().threshold_bytes = threshold_bytes;
        Ok(())
    }

    pub fn set_promotion_count(&self, promotion_count: u32) -> Result<()> {
        if promotion_count == 0 {
            return Err(CascadeError::InvalidConfiguration(
                "sequential cutoff promotion count must be greater than zero".to_owned(),
            ));
        }
        self.config.write().promotion_count = promotion_count;
        Ok(())
    }

    /// Classify a write of `len` bytes at `offset` and advance the stream it
    /// belongs to. Returns `true` when the write must bypass the cache.
    ///
    /// `cache_full` feeds the `Full` policy: with free cache lines available
    /// the cutoff stays disengaged under that policy.
    pub fn classify_write(&self, offset: u64, len: u64, cache_full: bool) -> bool {
        let config = *self.config.read();
        let engaged = match config.policy {
            SeqCutOffPolicy::Always => true,
            SeqCutOffPolicy::Full => cache_full,
            SeqCutOffPolicy::Never => false,
        };

        let mut table = self.table.lock();
        let state = table.streams.remove(&offset);
        let (run_bytes, req_count) = match state {
            Some(state) => (state.run_bytes, state.req_count),
            None => (0, 0),
        };

        let bypass = engaged
            && req_count >= config.promotion_count
            && run_bytes.saturating_add(len) >= config.threshold_bytes;

        let next_key = offset.saturating_add(len);
        table.streams.insert(
            next_key,
            StreamState {
                run_bytes: run_bytes.saturating_add(len),
                req_count: req_count.saturating_add(1),
            },
        );
        // Continuations leave their old key slot in `order` stale; trimming
        // tolerates stale keys by removing whatever the front points at.
        table.order.push_back(next_key);

        while table.streams.len() > MAX_STREAMS || table.order.len() > 2 * MAX_STREAMS {
            let Some(old) = table.order.pop_front() else {
                break;
            };
            table.streams.remove(&old);
        }
        drop(table);

        if bypass {
            debug!(
                target: "cascade::seqcutoff",
                offset,
                len,
                run_bytes,
                "seq_cutoff_bypass"
            );
        }
        bypass
    }

    /// Drop all per-stream runtime state.
    pub fn reset_streams(&self) {
        let mut table = self.table.lock();
        table.streams.clear();
        table.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_types::BLOCK_4K;

    fn always(threshold_bytes: u64, promotion_count: u32) -> SeqCutOffClassifier {
        SeqCutOffClassifier::new(SeqCutOffConfig {
            policy: SeqCutOffPolicy::Always,
            threshold_bytes,
            promotion_count,
        })
    }

    #[test]
    fn run_below_threshold_stays_cached() {
        let classifier = always(1024 * 1024, 1);
        let blocks = 1024 * 1024 / BLOCK_4K - 1;
        for i in 0..blocks {
            assert!(
                !classifier.classify_write(i * BLOCK_4K, BLOCK_4K, false),
                "block {i} of a below-threshold run must stay cached"
            );
        }
    }

    #[test]
    fn next_write_after_threshold_minus_one_block_bypasses() {
        let classifier = always(1024 * 1024, 1);
        let blocks = 1024 * 1024 / BLOCK_4K - 1;
        for i in 0..blocks {
            assert!(!classifier.classify_write(i * BLOCK_4K, BLOCK_4K, false));
        }
        // 8 KiB more on the same stream: first forced pass-through.
        assert!(classifier.classify_write(blocks * BLOCK_4K, 2 * BLOCK_4K, false));
    }

    #[test]
    fn non_sequential_write_resets_the_run() {
        let classifier = always(64 * 1024, 1);
        for i in 0..15 {
            assert!(!classifier.classify_write(i * BLOCK_4K, BLOCK_4K, false));
        }
        // A jump starts a new stream; the old run does not carry over.
        assert!(!classifier.classify_write(10 * 1024 * 1024, BLOCK_4K, false));
        for i in 1..15 {
            assert!(!classifier.classify_write(10 * 1024 * 1024 + i * BLOCK_4K, BLOCK_4K, false));
        }
    }

    #[test]
    fn promotion_count_gates_the_cutoff() {
        let classifier = always(BLOCK_4K, 4);
        // Run passes the threshold immediately, but the stream needs four
        // sequential requests before the cutoff may engage.
        assert!(!classifier.classify_write(0, BLOCK_4K, false));
        assert!(!classifier.classify_write(BLOCK_4K, BLOCK_4K, false));
        assert!(!classifier.classify_write(2 * BLOCK_4K, BLOCK_4K, false));
        assert!(!classifier.classify_write(3 * BLOCK_4K, BLOCK_4K, false));
        assert!(classifier.classify_write(4 * BLOCK_4K, BLOCK_4K, false));
    }

    #[test]
    fn never_policy_disables_cutoff() {
        let classifier = SeqCutOffClassifier::new(SeqCutOffConfig {
            policy: SeqCutOffPolicy::Never,
            threshold_bytes: BLOCK_4K,
            promotion_count: 1,
        });
        for i in 0..64 {
            assert!(!classifier.classify_write(i * BLOCK_4K, BLOCK_4K, false));
        }
    }

    #[test]
    fn full_policy_engages_only_when_cache_is_full() {
        let classifier = SeqCutOffClassifier::new(SeqCutOffConfig {
            policy: SeqCutOffPolicy::Full,
            threshold_bytes: BLOCK_4K,
            promotion_count: 1,
        });
        assert!(!classifier.classify_write(0, BLOCK_4K, false));
        assert!(!classifier.classify_write(BLOCK_4K, BLOCK_4K, false));
        assert!(classifier.classify_write(2 * BLOCK_4K, BLOCK_4K, true));
    }

    #[test]
    fn independent_streams_track_independently() {
        let classifier = always(16 * 1024, 1);
        let stream_a = 0_u64;
        let stream_b = 512 * 1024 * 1024;
        for i in 0..3 {
            assert!(!classifier.classify_write(stream_a + i * BLOCK_4K, BLOCK_4K, false));
            assert!(!classifier.classify_write(stream_b + i * BLOCK_4K, BLOCK_4K, false));
        }
        // Both cross the threshold on their fourth request.
        assert!(classifier.classify_write(stream_a + 3 * BLOCK_4K, BLOCK_4K, false));
        assert!(classifier.classify_write(stream_b + 3 * BLOCK_4K, BLOCK_4K, false));
    }

    #[test]
    fn zero_threshold_and_promotion_are_rejected() {
        let classifier = always(1024, 1);
        assert!(matches!(
            classifier.set_threshold(0),
            Err(CascadeError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            classifier.set_promotion_count(0),
            Err(CascadeError::InvalidConfiguration(_))
        ));
        // Valid updates land.
        classifier.set_threshold(2048).expect("threshold");
        classifier.set_promotion_count(2).expect("promotion");
        assert_eq!(classifier.config().threshold_bytes, 2048);
        assert_eq!(classifier.config().promotion_count, 2);
    }

    #[test]
    fn reset_streams_forgets_runtime_state() {
        let classifier = always(2 * BLOCK_4K, 1);
        assert!(!classifier.classify_write(0, BLOCK_4K, false));
        classifier.reset_streams();
        // Same offsets again: the stream starts cold.
        assert!(!classifier.classify_write(BLOCK_4K, BLOCK_4K, false));
    }
}
