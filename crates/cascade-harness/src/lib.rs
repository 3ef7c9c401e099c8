#![forbid(unsafe_code)]
//! Functional test harness for Cascade.
//!
//! Provides the pieces the e2e suites share: a step-logging test context
//! (an explicit value threaded through tests, not a process-wide driver), a
//! registry-backed volume opener for in-memory reload scenarios, in-process
//! I/O generators standing in for external disk exercisers, and the
//! per-mode verification helpers.

pub mod iogen;

use cascade_block::{ByteDevice, MemoryByteDevice};
use cascade_engine::{Cache, Core, VolumeOpener};
use cascade_error::{CascadeError, Result};
use cascade_stats::StatsFilter;
use cascade_types::{CacheMode, BLOCK_4K};
use iogen::{FioJob, ReadWrite};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::info;

/// Per-test context with numbered step logging.
///
/// Mirrors the step structure of an administration test run while staying an
/// explicit value: every suite constructs its own context and passes it
/// where needed.
pub struct TestContext {
    name: String,
    step: AtomicU32,
}

impl TestContext {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        init_tracing();
        Self {
            name: name.into(),
            step: AtomicU32::new(0),
        }
    }

    /// Log the next numbered step of the test.
    pub fn step(&self, title: &str) {
        let step = self.step.fetch_add(1, Ordering::Relaxed) + 1;
        info!(target: "cascade::harness", test = %self.name, step, "{title}");
    }
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Volume opener backed by a registry of shared in-memory devices.
///
/// Registering a device under a uuid lets `Cache::load` resolve it again
/// after a stop, modeling a reload of the same physical device.
#[derive(Debug, Default)]
pub struct MemoryVolumeOpener {
    devices: Mutex<HashMap<String, MemoryByteDevice>>,
}

impl MemoryVolumeOpener {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a device of `len` bytes under `uuid`.
    pub fn create(&self, uuid: &str, len: usize) -> Arc<dyn ByteDevice> {
        let device = MemoryByteDevice::new(len);
        self.devices
            .lock()
            .insert(uuid.to_owned(), device.clone());
        Arc::new(device)
    }

    /// Raw (cache-bypassing) view of a registered device.
    #[must_use]
    pub fn raw(&self, uuid: &str) -> Option<MemoryByteDevice> {
        self.devices.lock().get(uuid).cloned()
    }
}

impl VolumeOpener for MemoryVolumeOpener {
    fn open(&self, uuid: &str) -> Result<Arc<dyn ByteDevice>> {
        let device = self
            .devices
            .lock()
            .get(uuid)
            .cloned()
            .ok_or_else(|| CascadeError::NotFound(format!("volume {uuid}")))?;
        Ok(Arc::new(device))
    }
}

/// Cache device sized to hold exactly `lines` 4 KiB cache lines.
///
/// Returns the concrete device so suites can clone it (clones share
/// storage) and hand a fresh `Arc` to `Cache::load` after a stop.
#[must_use]
pub fn cache_device_for_lines(lines: u64) -> MemoryByteDevice {
    let len = 4096 + lines * (BLOCK_4K + 64);
    MemoryByteDevice::new(usize::try_from(len).unwrap_or(0))
}

/// Assert equality with expected-vs-actual reporting in the panic message.
#[track_caller]
pub fn check_eq<T: PartialEq + std::fmt::Debug>(what: &str, expected: T, actual: T) {
    assert!(
        expected == actual,
        "{what} mismatch:\nexpected: {expected:?}\nactual:   {actual:?}"
    );
}

/// Drive I/O appropriate for `mode` and assert its block-counter contract.
///
/// Counters are reset before each phase; assertions are absolute within the
/// phase, mirroring a delta-based check.
pub fn verify_mode_operation(
    ctx: &TestContext,
    cache: &Cache,
    core: &Core,
    mode: CacheMode,
    io_blocks: u64,
) -> anyhow::Result<()> {
    let io_bytes = io_blocks * BLOCK_4K;
    match mode {
        CacheMode::WriteThrough => {
            ctx.step("Verify Write-Through: random writes hit cache and core equally");
            cache.reset_counters()?;
            FioJob::new(core.clone())
                .read_write(ReadWrite::RandWrite)
                .size(io_bytes)
                .run()?;
            let blk = cache.get_statistics(&[StatsFilter::Blocks]).block_stats;
            check_eq("WT cache/core counters", blk.cache, blk.core);
            check_eq("WT cache writes", io_bytes, blk.cache.writes);
        }
        CacheMode::WriteBack => {
            ctx.step("Verify Write-Back: writes land in cache only");
            cache.reset_counters()?;
            FioJob::new(core.clone())
                .read_write(ReadWrite::RandRw)
                .size(io_bytes)
                .run()?;
            let blk = cache.get_statistics(&[StatsFilter::Blocks]).block_stats;
            check_eq("WB core writes", 0, blk.core.writes);
            assert!(
                blk.exp_obj.writes > 0,
                "WB exported-object writes must be non-zero"
            );
        }
        CacheMode::PassThrough => {
            ctx.step("Verify Pass-Through: cache untouched by any I/O");
            cache.reset_counters()?;
            FioJob::new(core.clone())
                .read_write(ReadWrite::RandRw)
                .size(io_bytes)
                .run()?;
            let blk = cache.get_statistics(&[StatsFilter::Blocks]).block_stats;
            check_eq("PT cache reads", 0, blk.cache.reads);
            check_eq("PT cache writes", 0, blk.cache.writes);
        }
        CacheMode::WriteAround => {
            ctx.step("Verify Write-Around: reads populate the cache");
            cache.reset_counters()?;
            FioJob::new(core.clone())
                .read_write(ReadWrite::RandRead)
                .size(io_bytes)
                .run()?;
            let blk = cache.get_statistics(&[StatsFilter::Blocks]).block_stats;
            check_eq("WA cache writes after reads", io_bytes, blk.cache.writes);
            check_eq("WA core reads", io_bytes, blk.core.reads);

            ctx.step("Verify Write-Around: writes cause no cache writes");
            cache.reset_counters()?;
            FioJob::new(core.clone())
                .read_write(ReadWrite::RandWrite)
                .size(io_bytes)
                .run()?;
            let blk = cache.get_statistics(&[StatsFilter::Blocks]).block_stats;
            check_eq("WA cache writes after writes", 0, blk.cache.writes);
            check_eq("WA core writes", io_bytes, blk.core.writes);
        }
        CacheMode::WriteOnly => {
            ctx.step("Verify Write-Only: reads of unwritten data bypass the cache");
            cache.reset_counters()?;
            FioJob::new(core.clone())
                .read_write(ReadWrite::RandRead)
                .size(io_bytes)
                .run()?;
            let blk = cache.get_statistics(&[StatsFilter::Blocks]).block_stats;
            check_eq("WO cache reads after cold reads", 0, blk.cache.reads);
            check_eq("WO cache writes after cold reads", 0, blk.cache.writes);

            ctx.step("Verify Write-Only: writes go to cache, never core");
            cache.reset_counters()?;
            FioJob::new(core.clone())
                .read_write(ReadWrite::RandWrite)
                .size(io_bytes)
                .run()?;
            let blk = core.get_statistics(&[StatsFilter::Blocks]).block_stats;
            check_eq("WO core writes", 0, blk.core.writes);
            check_eq("WO exported-object writes", io_bytes, blk.exp_obj.writes);
        }
    }
    Ok(())
}
