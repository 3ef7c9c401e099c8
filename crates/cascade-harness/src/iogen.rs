//! In-process I/O generators.
//!
//! Stand-ins for the external disk exercisers a functional suite would
//! normally shell out to: a `dd`-like sequential writer and a `fio`-like
//! workload runner with deterministic (seeded) random access order.
//! Background runs return a handle with an explicit `wait_or_kill`
//! contract; there is no implicit cancellation.

use anyhow::{bail, Context, Result};
use cascade_engine::Core;
use cascade_types::BLOCK_4K;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Sequential writer: `count` 4 KiB blocks of a repeating pattern starting
/// `seek` blocks into the exported object.
pub fn run_dd(core: &Core, count: u64, seek: u64) -> Result<()> {
    info!(target: "cascade::harness", count, seek, "dd");
    let block = vec![0xDD_u8; BLOCK_4K as usize];
    for i in 0..count {
        let offset = (seek + i) * BLOCK_4K;
        core.write_at(offset, &block)
            .with_context(|| format!("dd write at block {}", seek + i))?;
    }
    Ok(())
}

/// Access pattern of a [`FioJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadWrite {
    Write,
    RandWrite,
    RandRead,
    RandRw,
}

/// Deterministic fio-style workload against one exported object.
///
/// Covers `size` bytes in 4 KiB requests; random patterns shuffle the block
/// order with a seeded generator so runs are reproducible.
#[derive(Clone)]
pub struct FioJob {
    core: Core,
    size: u64,
    offset: u64,
    mode: ReadWrite,
    seed: u64,
    time_based: Option<Duration>,
}

impl FioJob {
    #[must_use]
    pub fn new(core: Core) -> Self {
        Self {
            core,
            size: 1024 * 1024,
            offset: 0,
            mode: ReadWrite::RandRw,
            seed: 0x5EED,
            time_based: None,
        }
    }

    #[must_use]
    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn read_write(mut self, mode: ReadWrite) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Repeat the workload until the duration elapses (or the run is
    /// killed), like a time-based exerciser job.
    #[must_use]
    pub fn run_time(mut self, duration: Duration) -> Self {
        self.time_based = Some(duration);
        self
    }

    /// Run to completion on the calling thread.
    pub fn run(&self) -> Result<()> {
        self.run_with_stop(&AtomicBool::new(false))
    }

    fn run_with_stop(&self, stop: &AtomicBool) -> Result<()> {
        if self.size == 0 || self.size % BLOCK_4K != 0 {
            bail!("fio size must be a non-zero multiple of 4 KiB: {}", self.size);
        }
        let blocks = self.size / BLOCK_4K;
        let mut order: Vec<u64> = (0..blocks).collect();
        let mut rng = StdRng::seed_from_u64(self.seed);
        if matches!(
            self.mode,
            ReadWrite::RandWrite | ReadWrite::RandRead | ReadWrite::RandRw
        ) {
            order.shuffle(&mut rng);
        }

        let deadline = self.time_based.map(|duration| Instant::now() + duration);
        let mut write_buf = vec![0_u8; BLOCK_4K as usize];
        let mut read_buf = vec![0_u8; BLOCK_4K as usize];
        loop {
            for &block in &order {
                if stop.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let offset = self.offset + block * BLOCK_4K;
                let do_write = match self.mode {
                    ReadWrite::Write | ReadWrite::RandWrite => true,
                    ReadWrite::RandRead => false,
                    ReadWrite::RandRw => rng.gen_bool(0.5),
                };
                if do_write {
                    write_buf.fill((block % 251) as u8);
                    self.core
                        .write_at(offset, &write_buf)
                        .with_context(|| format!("fio write at block {block}"))?;
                } else {
                    self.core
                        .read_at(offset, &mut read_buf)
                        .with_context(|| format!("fio read at block {block}"))?;
                }
            }

            match deadline {
                Some(deadline) if Instant::now() < deadline => {}
                _ => return Ok(()),
            }
        }
    }

    /// Run on a background thread, returning a handle for explicit
    /// completion or termination.
    #[must_use]
    pub fn run_in_background(self) -> WorkloadHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::spawn(move || self.run_with_stop(&stop_flag));
        WorkloadHandle {
            stop,
            thread: Some(thread),
        }
    }
}

/// Outcome of [`WorkloadHandle::wait_or_kill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadOutcome {
    /// The workload ran to completion within the timeout.
    Completed,
    /// The timeout elapsed; the workload was told to stop and joined.
    Killed,
}

/// Handle to a background workload.
pub struct WorkloadHandle {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<Result<()>>>,
}

impl WorkloadHandle {
    /// Wait up to `timeout` for completion, then kill: set the stop flag
    /// and join. Propagates any I/O error the workload hit.
    pub fn wait_or_kill(mut self, timeout: Duration) -> Result<WorkloadOutcome> {
        let deadline = Instant::now() + timeout;
        let thread = match self.thread.take() {
            Some(thread) => thread,
            None => return Ok(WorkloadOutcome::Completed),
        };

        let mut outcome = WorkloadOutcome::Completed;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                self.stop.store(true, Ordering::SeqCst);
                outcome = WorkloadOutcome::Killed;
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        match thread.join() {
            Ok(result) => result?,
            Err(_) => bail!("workload thread panicked"),
        }
        Ok(outcome)
    }

    /// Kill immediately: set the stop flag and join.
    pub fn kill(self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.wait_or_kill(Duration::ZERO)?;
        Ok(())
    }
}

impl Drop for WorkloadHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
