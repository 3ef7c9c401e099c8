//! Background cleaner.
//!
//! Propagates dirty blocks to core devices in batches while the cleaning
//! policy is not `Nop`. The cleaning strategy itself stays out of the
//! engine's decision logic; this daemon only paces the propagation.

use crate::CacheInner;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Pause between cleaning sweeps.
    pub interval: Duration,
    /// Dirty blocks propagated per sweep.
    pub batch_blocks: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            batch_blocks: 128,
        }
    }
}

/// Handle to a running cleaner thread.
///
/// `shutdown` drains remaining dirty blocks (unless the cache stopped or
/// the policy is `Nop`) before joining the thread.
pub struct CleanerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CleanerHandle {
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(target: "cascade::cleaner", "cleaner thread panicked");
            }
        }
    }
}

impl Drop for CleanerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub(crate) fn spawn(inner: Arc<CacheInner>, config: CleanerConfig) -> CleanerHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let thread = std::thread::spawn(move || {
        let slice = Duration::from_millis(10);
        loop {
            if stop_flag.load(Ordering::SeqCst) || inner.is_stopped() {
                break;
            }
            match inner.clean_batch(config.batch_blocks) {
                Ok(cleaned) if cleaned > 0 => {
                    debug!(target: "cascade::cleaner", cleaned, "cleaner_sweep");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "cascade::cleaner", error = %err, "cleaner_sweep_failed");
                }
            }

            let mut waited = Duration::ZERO;
            while waited < config.interval {
                if stop_flag.load(Ordering::SeqCst) || inner.is_stopped() {
                    break;
                }
                std::thread::sleep(slice);
                waited += slice;
            }
        }

        // Drain what remains so a shutdown leaves no dirty backlog behind.
        if !inner.is_stopped() {
            loop {
                match inner.clean_batch(config.batch_blocks) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    });

    CleanerHandle {
        stop,
        thread: Some(thread),
    }
}
