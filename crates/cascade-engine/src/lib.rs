#![forbid(unsafe_code)]
//! Cascade cache engine.
//!
//! A host-side block-cache acceleration layer: a fast cache device fronts
//! one or more slower core devices, and applications issue I/O against the
//! exported object of each core. For every request the engine decides,
//! per 4 KiB block, whether to touch the cache device, the core device, or
//! both ([`policy`]), optionally forced to pass-through by the sequential
//! cutoff classifier ([`seqcutoff`]), and accounts every device action in
//! role-scoped counters (`cascade-stats`).
//!
//! # Concurrency
//!
//! The active [`CacheConfig`] sits behind a `parking_lot::RwLock`. Requests
//! hold the read lock for their full routing + accounting span; mode
//! switches, stop, and counter resets take the write lock, so every request
//! sees exactly one mode. Administrative operations additionally serialize
//! on an admin mutex; a `set_cache_mode` racing a stop or core removal
//! fails fast with `DeviceBusy` instead of queueing. Device actions and
//! counter increments of one request are performed under the line-store
//! lock, which statistics readers also take, so no observer sees a request
//! half-accounted.

pub mod cleaner;
pub mod linestore;
pub mod metadata;
pub mod policy;
pub mod seqcutoff;

use cascade_block::{ByteDevice, FileByteDevice};
use cascade_error::{CascadeError, Result};
use cascade_stats::{
    BlockCounters, Direction, RequestCounters, Role, Statistics, StatsFilter,
};
use cascade_types::{
    ByteOffset, CacheConfig, CacheLineSize, CacheMode, CleaningPolicy, CoreId, SeqCutOffConfig,
    SeqCutOffPolicy, BLOCK_4K, SUPERBLOCK_OFFSET,
};
use linestore::{block_mask, LineStore};
use metadata::{CoreMeta, Superblock};
use parking_lot::{Mutex, RwLock};
use policy::{IoDir, Lookup};
use seqcutoff::SeqCutOffClassifier;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Resolves a persisted core volume identity back to a device at load time.
pub trait VolumeOpener: Send + Sync {
    fn open(&self, uuid: &str) -> Result<Arc<dyn ByteDevice>>;
}

/// Opens core volumes whose uuid is a filesystem path.
#[derive(Debug, Default)]
pub struct FileVolumeOpener;

impl VolumeOpener for FileVolumeOpener {
    fn open(&self, uuid: &str) -> Result<Arc<dyn ByteDevice>> {
        Ok(Arc::new(FileByteDevice::open(uuid)?))
    }
}

struct CoreState {
    id: CoreId,
    uuid: String,
    device: Arc<dyn ByteDevice>,
    classifier: SeqCutOffClassifier,
    blocks: BlockCounters,
    requests: RequestCounters,
}

impl CoreState {
    fn new(
        id: CoreId,
        uuid: String,
        device: Arc<dyn ByteDevice>,
        seq_cutoff: SeqCutOffConfig,
    ) -> Self {
        Self {
            id,
            uuid,
            device,
            classifier: SeqCutOffClassifier::new(seq_cutoff),
            blocks: BlockCounters::new(),
            requests: RequestCounters::new(),
        }
    }
}

pub(crate) struct CacheInner {
    device: Arc<dyn ByteDevice>,
    config: RwLock<CacheConfig>,
    admin: Mutex<()>,
    stopped: AtomicBool,
    store: Mutex<LineStore>,
    cores: RwLock<BTreeMap<CoreId, Arc<CoreState>>>,
    next_core_id: AtomicU32,
    blocks: BlockCounters,
    requests: RequestCounters,
}

/// Handle to a running cache instance.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").finish_non_exhaustive()
    }
}

/// Handle to a core attached to a cache instance. Exported-object I/O is
/// issued through this handle.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CacheInner>,
    state: Arc<CoreState>,
}

impl Cache {
    /// Start a new cache instance on `device` in `mode`.
    ///
    /// With `force` unset, a device already carrying a plausible cache
    /// superblock is refused; the operator must load it instead (or force
    /// the start to discard the old instance).
    pub fn start(device: Arc<dyn ByteDevice>, mode: CacheMode, force: bool) -> Result<Self> {
        Self::start_with_config(device, CacheConfig::new(mode), force)
    }

    pub fn start_with_config(
        device: Arc<dyn ByteDevice>,
        config: CacheConfig,
        force: bool,
    ) -> Result<Self> {
        if !force && metadata_present(device.as_ref())? {
            return Err(CascadeError::MetadataExists(
                "device carries a cache superblock; load it or start with force".to_owned(),
            ));
        }

        let store = LineStore::new(device.len_bytes(), config.cache_line_size)?;
        let inner = Arc::new(CacheInner {
            device,
            config: RwLock::new(config),
            admin: Mutex::new(()),
            stopped: AtomicBool::new(false),
            store: Mutex::new(store),
            cores: RwLock::new(BTreeMap::new()),
            next_core_id: AtomicU32::new(1),
            blocks: BlockCounters::new(),
            requests: RequestCounters::new(),
        });
        {
            let store = inner.store.lock();
            inner.persist_superblock(&store, config)?;
        }
        info!(
            target: "cascade::engine",
            mode = %config.cache_mode,
            line_size = %config.cache_line_size,
            "cache_started"
        );
        Ok(Self { inner })
    }

    /// Load a previously stopped cache instance from its device.
    ///
    /// Restores the persisted configuration bit-identically, re-registers
    /// cores by resolving their stored uuids through `opener`, and restores
    /// the line mapping so previously cached data serves hits. Statistics
    /// counters start at zero; per-stream sequential state starts empty.
    pub fn load(device: Arc<dyn ByteDevice>, opener: &dyn VolumeOpener) -> Result<Self> {
        let line_size = peek_line_size(device.as_ref())?;
        let mut store = LineStore::new(device.len_bytes(), line_size)?;

        let meta_len = usize::try_from(store.metadata_len())
            .map_err(|_| CascadeError::CorruptSuperblock("metadata region overflow".to_owned()))?;
        let mut bytes = vec![0_u8; meta_len];
        device.read_exact_at(ByteOffset(SUPERBLOCK_OFFSET), &mut bytes)?;
        let sb = Superblock::decode(&bytes)?;

        for ((core, line), _) in &sb.mappings {
            if !sb.cores.iter().any(|meta| meta.id == *core) {
                return Err(CascadeError::CorruptSuperblock(format!(
                    "mapping for unknown core {} (line {line})",
                    core.0
                )));
            }
        }
        store.restore(sb.mappings)?;

        let mut cores = BTreeMap::new();
        for meta in &sb.cores {
            let core_device = opener.open(&meta.uuid)?;
            cores.insert(
                meta.id,
                Arc::new(CoreState::new(
                    meta.id,
                    meta.uuid.clone(),
                    core_device,
                    meta.seq_cutoff,
                )),
            );
        }

        let inner = Arc::new(CacheInner {
            device,
            config: RwLock::new(sb.config),
            admin: Mutex::new(()),
            stopped: AtomicBool::new(false),
            store: Mutex::new(store),
            cores: RwLock::new(cores),
            next_core_id: AtomicU32::new(sb.next_core_id),
            blocks: BlockCounters::new(),
            requests: RequestCounters::new(),
        });
        info!(
            target: "cascade::engine",
            mode = %sb.config.cache_mode,
            cores = sb.cores.len(),
            "cache_loaded"
        );
        Ok(Self { inner })
    }

    /// Attach a core device. The uuid is the identity `load` resolves later.
    pub fn add_core(
        &self,
        uuid: impl Into<String>,
        device: Arc<dyn ByteDevice>,
    ) -> Result<Core> {
        let _admin = self.inner.admin.lock();
        self.inner.ensure_running()?;

        let uuid = uuid.into();
        let id = CoreId(self.inner.next_core_id.fetch_add(1, Ordering::SeqCst));
        let seq_cutoff = SeqCutOffConfig::default();
        let state = Arc::new(CoreState::new(id, uuid.clone(), device, seq_cutoff));
        self.inner.cores.write().insert(id, Arc::clone(&state));

        let config = *self.inner.config.read();
        let store = self.inner.store.lock();
        self.inner.persist_superblock(&store, config)?;
        drop(store);

        info!(target: "cascade::engine", core = %id, uuid = %uuid, "core_added");
        Ok(Core {
            inner: Arc::clone(&self.inner),
            state,
        })
    }

    /// Detach a core: its dirty data is propagated, its mappings dropped.
    pub fn remove_core(&self, id: CoreId) -> Result<()> {
        let _admin = self.inner.admin.lock();
        self.inner.ensure_running()?;

        let config = self.inner.config.write();
        let mut store = self.inner.store.lock();
        self.inner.clean_blocks(&mut store, None, Some(id))?;
        store.purge_core(id);

        let removed = self.inner.cores.write().remove(&id);
        if removed.is_none() {
            return Err(CascadeError::NotFound(format!("core {}", id.0)));
        }
        self.inner.persist_superblock(&store, *config)?;
        drop(store);
        drop(config);

        info!(target: "cascade::engine", core = %id, "core_removed");
        Ok(())
    }

    /// Look up an attached core by id (after `load`).
    pub fn core(&self, id: CoreId) -> Result<Core> {
        let state = self
            .inner
            .cores
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| CascadeError::NotFound(format!("core {}", id.0)))?;
        Ok(Core {
            inner: Arc::clone(&self.inner),
            state,
        })
    }

    /// Ids of all attached cores.
    #[must_use]
    pub fn core_ids(&self) -> Vec<CoreId> {
        self.inner.cores.read().keys().copied().collect()
    }

    /// Switch the cache mode.
    ///
    /// With `flush` set and the outgoing mode holding lazy writes, all dirty
    /// cache content is propagated to the core devices before the switch
    /// completes; the call blocks until the flush finishes. With `flush`
    /// unset, dirty blocks are retained and keep serving reads from cache
    /// under the new mode until cleaned or invalidated.
    pub fn set_cache_mode(&self, mode: CacheMode, flush: bool) -> Result<()> {
        let Some(_admin) = self.inner.admin.try_lock() else {
            return Err(CascadeError::DeviceBusy(
                "mode change raced another administrative operation".to_owned(),
            ));
        };
        self.inner.set_cache_mode_locked(mode, flush)
    }

    /// Bounded-wait variant of [`Cache::set_cache_mode`].
    pub fn set_cache_mode_timeout(
        &self,
        mode: CacheMode,
        flush: bool,
        timeout: Duration,
    ) -> Result<()> {
        let Some(_admin) = self.inner.admin.try_lock_for(timeout) else {
            return Err(CascadeError::DeviceBusy(format!(
                "mode change did not acquire the admin lock within {timeout:?}"
            )));
        };
        self.inner.set_cache_mode_locked(mode, flush)
    }

    /// Switch the cache mode by its administration name.
    ///
    /// Unlike the typed variant this can be handed an unrecognized mode,
    /// which fails with `InvalidModeTransition`.
    pub fn set_cache_mode_by_name(&self, name: &str, flush: bool) -> Result<()> {
        let mode: CacheMode = name
            .parse()
            .map_err(|_| CascadeError::InvalidModeTransition(format!("unknown mode {name:?}")))?;
        self.set_cache_mode(mode, flush)
    }

    #[must_use]
    pub fn get_cache_mode(&self) -> CacheMode {
        self.inner.config.read().cache_mode
    }

    #[must_use]
    pub fn get_cache_config(&self) -> CacheConfig {
        *self.inner.config.read()
    }

    pub fn set_cleaning_policy(&self, policy: CleaningPolicy) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.config.write().cleaning_policy = policy;
        Ok(())
    }

    #[must_use]
    pub fn get_cleaning_policy(&self) -> CleaningPolicy {
        self.inner.config.read().cleaning_policy
    }

    #[must_use]
    pub fn get_cache_line_size(&self) -> CacheLineSize {
        self.inner.config.read().cache_line_size
    }

    /// Invalidate all cached data without touching core data. Dirty blocks
    /// are discarded.
    pub fn purge_cache(&self) -> Result<()> {
        let _admin = self.inner.admin.lock();
        self.inner.ensure_running()?;
        let _config = self.inner.config.write();
        self.inner.store.lock().purge();
        for core in self.inner.cores.read().values() {
            core.classifier.reset_streams();
        }
        info!(target: "cascade::engine", "cache_purged");
        Ok(())
    }

    /// Propagate all dirty cache content to the core devices, blocking until
    /// complete.
    pub fn flush_cache(&self) -> Result<usize> {
        self.inner.ensure_running()?;
        let _config = self.inner.config.read();
        let mut store = self.inner.store.lock();
        self.inner.clean_blocks(&mut store, None, None)
    }

    /// Zero the cache-level and every core-level counter.
    pub fn reset_counters(&self) -> Result<()> {
        self.inner.ensure_running()?;
        let _config = self.inner.config.write();
        let _store = self.inner.store.lock();
        self.inner.blocks.reset();
        self.inner.requests.reset();
        for core in self.inner.cores.read().values() {
            core.blocks.reset();
            core.requests.reset();
        }
        Ok(())
    }

    #[must_use]
    pub fn get_statistics(&self, filters: &[StatsFilter]) -> Statistics {
        let store = self.inner.store.lock();
        Statistics::new(
            self.inner.blocks.snapshot(),
            self.inner.requests.snapshot(),
            store.usage(),
            filters,
        )
    }

    /// Stop the instance: quiesce I/O, propagate dirty data, persist the
    /// metadata region, and release the exported objects.
    pub fn stop(&self) -> Result<()> {
        self.inner.stop_internal(true)
    }

    /// Stop without flushing. Dirty blocks stay in cache and are persisted
    /// as dirty; after a load they keep serving reads until cleaned.
    pub fn stop_no_flush(&self) -> Result<()> {
        self.inner.stop_internal(false)
    }

    /// Start a background cleaner propagating dirty blocks in batches.
    #[must_use]
    pub fn start_cleaner(&self, config: cleaner::CleanerConfig) -> cleaner::CleanerHandle {
        cleaner::spawn(Arc::clone(&self.inner), config)
    }
}

impl Core {
    #[must_use]
    pub fn id(&self) -> CoreId {
        self.state.id
    }

    /// Volume identity, also usable as the exported object path.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.state.uuid
    }

    /// Exported-object read. `offset` and `buf.len()` must be 4 KiB aligned.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_request(&self.state, offset, buf)
    }

    /// Exported-object write. `offset` and `data.len()` must be 4 KiB
    /// aligned.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.write_request(&self.state, offset, data)
    }

    /// Exported object length in bytes (the core device size).
    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.state.device.len_bytes()
    }

    pub fn set_seq_cutoff_policy(&self, policy: SeqCutOffPolicy) -> Result<()> {
        self.inner.ensure_running()?;
        self.state.classifier.set_policy(policy);
        Ok(())
    }

    pub fn set_seq_cutoff_threshold(&self, threshold_bytes: u64) -> Result<()> {
        self.inner.ensure_running()?;
        self.state.classifier.set_threshold(threshold_bytes)
    }

    pub fn set_seq_cutoff_promotion_count(&self, promotion_count: u32) -> Result<()> {
        self.inner.ensure_running()?;
        self.state.classifier.set_promotion_count(promotion_count)
    }

    #[must_use]
    pub fn get_seq_cutoff_config(&self) -> SeqCutOffConfig {
        self.state.classifier.config()
    }

    /// Zero this core's counters.
    pub fn reset_counters(&self) -> Result<()> {
        self.inner.ensure_running()?;
        let _config = self.inner.config.write();
        let _store = self.inner.store.lock();
        self.state.blocks.reset();
        self.state.requests.reset();
        Ok(())
    }

    #[must_use]
    pub fn get_statistics(&self, filters: &[StatsFilter]) -> Statistics {
        let store = self.inner.store.lock();
        Statistics::new(
            self.state.blocks.snapshot(),
            self.state.requests.snapshot(),
            store.usage_for(self.state.id),
            filters,
        )
    }
}

impl CacheInner {
    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CascadeError::NotFound("cache instance is stopped".to_owned()));
        }
        Ok(())
    }

    fn set_cache_mode_locked(&self, mode: CacheMode, flush: bool) -> Result<()> {
        self.ensure_running()?;
        let mut config = self.config.write();
        if flush && config.cache_mode.traits().lazy_writes {
            let mut store = self.store.lock();
            let flushed = self.clean_blocks(&mut store, None, None)?;
            debug!(target: "cascade::engine", flushed, "dirty_blocks_flushed_for_switch");
        }
        let from = config.cache_mode;
        config.cache_mode = mode;
        drop(config);
        info!(target: "cascade::engine", from = %from, to = %mode, flush, "cache_mode_switched");
        Ok(())
    }

    fn stop_internal(&self, flush: bool) -> Result<()> {
        let _admin = self.admin.lock();
        self.ensure_running()?;

        let config = self.config.write();
        let mut store = self.store.lock();
        if flush && config.cache_mode.traits().lazy_writes {
            self.clean_blocks(&mut store, None, None)?;
        }
        self.persist_superblock(&store, *config)?;
        self.device.sync()?;
        self.stopped.store(true, Ordering::SeqCst);
        drop(store);
        drop(config);
        info!(target: "cascade::engine", flush, "cache_stopped");
        Ok(())
    }

    /// Encode and write the metadata region. Caller holds the store lock and
    /// passes the config value to keep this reentrancy-free under a held
    /// config write lock.
    fn persist_superblock(&self, store: &LineStore, config: CacheConfig) -> Result<()> {
        let cores = self.cores.read();
        let sb = Superblock {
            config,
            next_core_id: self.next_core_id.load(Ordering::SeqCst),
            cores: cores
                .values()
                .map(|core| CoreMeta {
                    id: core.id,
                    uuid: core.uuid.clone(),
                    seq_cutoff: core.classifier.config(),
                })
                .collect(),
            mappings: store.entries().collect(),
        };
        drop(cores);

        let bytes = sb.encode();
        let meta_len = usize::try_from(store.metadata_len()).unwrap_or(usize::MAX);
        if bytes.len() > meta_len {
            return Err(CascadeError::OutOfRange(format!(
                "superblock encoding ({} bytes) exceeds metadata region ({meta_len} bytes)",
                bytes.len()
            )));
        }
        self.device.write_all_at(ByteOffset(SUPERBLOCK_OFFSET), &bytes)
    }

    /// Propagate dirty blocks to their core devices. Caller holds the store
    /// lock (and a config lock for request ordering).
    ///
    /// `max_blocks` bounds the batch; `only_core` restricts the sweep.
    fn clean_blocks(
        &self,
        store: &mut LineStore,
        max_blocks: Option<usize>,
        only_core: Option<CoreId>,
    ) -> Result<usize> {
        let dirty = match only_core {
            Some(core) => store.dirty_entries_for(core),
            None => store.dirty_entries(),
        };

        let cores = self.cores.read();
        let mut cleaned = 0_usize;
        let mut block = vec![0_u8; BLOCK_4K as usize];

        'outer: for ((core_id, core_line), mut entry) in dirty {
            let Some(core) = cores.get(&core_id) else {
                continue;
            };
            for bit in 0..32_u32 {
                if entry.dirty & (1 << bit) == 0 {
                    continue;
                }
                if let Some(max) = max_blocks {
                    if cleaned >= max {
                        store.update((core_id, core_line), entry);
                        break 'outer;
                    }
                }

                let cache_off = store.block_offset(&entry, bit);
                self.device.read_exact_at(cache_off, &mut block)?;
                let core_off = core_line * store.line_size() + u64::from(bit) * BLOCK_4K;
                core.device.write_all_at(ByteOffset(core_off), &block)?;

                self.blocks.increment(Role::Core, Direction::Write, BLOCK_4K);
                core.blocks.increment(Role::Core, Direction::Write, BLOCK_4K);

                entry.dirty &= !(1 << bit);
                cleaned += 1;
            }
            store.update((core_id, core_line), entry);
        }
        drop(cores);

        if cleaned > 0 {
            debug!(target: "cascade::engine", cleaned, "dirty_blocks_cleaned");
        }
        Ok(cleaned)
    }

    /// Clean up to `max_blocks` dirty blocks (background cleaner tick).
    pub(crate) fn clean_batch(&self, max_blocks: usize) -> Result<usize> {
        self.ensure_running()?;
        let config = self.config.read();
        if config.cleaning_policy == CleaningPolicy::Nop {
            return Ok(0);
        }
        let mut store = self.store.lock();
        self.clean_blocks(&mut store, Some(max_blocks), None)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn check_request(&self, core: &CoreState, offset: u64, len: usize) -> Result<u64> {
        let len = u64::try_from(len)
            .map_err(|_| CascadeError::OutOfRange("request length overflows u64".to_owned()))?;
        if len == 0 || offset % BLOCK_4K != 0 || len % BLOCK_4K != 0 {
            return Err(CascadeError::OutOfRange(format!(
                "request must be 4 KiB aligned and non-empty: offset={offset} len={len}"
            )));
        }
        let end = offset
            .checked_add(len)
            .ok_or_else(|| CascadeError::OutOfRange("request range overflows u64".to_owned()))?;
        if end > core.device.len_bytes() {
            return Err(CascadeError::OutOfRange(format!(
                "request beyond exported object: end={end} len_bytes={}",
                core.device.len_bytes()
            )));
        }
        Ok(len)
    }

    fn write_request(&self, core: &CoreState, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_running()?;
        let len = self.check_request(core, offset, data.len())?;

        let config = self.config.read();
        let mode = config.cache_mode;

        let mut store = self.store.lock();
        let seq_bypass = core
            .classifier
            .classify_write(offset, len, store.is_full());

        self.blocks
            .increment(Role::ExportedObject, Direction::Write, len);
        core.blocks
            .increment(Role::ExportedObject, Direction::Write, len);

        let mut all_pass_through = true;
        let line_size = store.line_size();
        let blocks = len / BLOCK_4K;
        for i in 0..blocks {
            let abs = offset + i * BLOCK_4K;
            let core_line = abs / line_size;
            let block_in_line = u32::try_from((abs % line_size) / BLOCK_4K).unwrap_or(0);
            let bit = block_mask(block_in_line, 1);
            let key = (core.id, core_line);
            let chunk_start = usize::try_from(i * BLOCK_4K).unwrap_or(0);
            let chunk = &data[chunk_start..chunk_start + BLOCK_4K as usize];

            let resident = store.lookup(key);
            let lookup = match resident {
                Some(entry) if entry.dirty & bit != 0 => Lookup::HitDirty,
                Some(_) => Lookup::HitClean,
                None => Lookup::Miss,
            };
            let decision = policy::route(IoDir::Write, mode, lookup, seq_bypass);
            let mut pass_through = decision.pass_through;

            if decision.write_core {
                core.device.write_all_at(ByteOffset(abs), chunk)?;
                self.blocks.increment(Role::Core, Direction::Write, BLOCK_4K);
                core.blocks.increment(Role::Core, Direction::Write, BLOCK_4K);
            }

            if decision.write_cache {
                let target = match resident {
                    Some(entry) => Some(entry),
                    None if decision.insert_on_miss => store.alloc(key),
                    None => None,
                };
                match target {
                    Some(mut entry) => {
                        let cache_off = store.block_offset(&entry, block_in_line);
                        self.device.write_all_at(cache_off, chunk)?;
                        if decision.count_cache_write {
                            self.blocks.increment(Role::Cache, Direction::Write, BLOCK_4K);
                            core.blocks.increment(Role::Cache, Direction::Write, BLOCK_4K);
                        }
                        entry.valid |= bit;
                        if decision.mark_dirty {
                            entry.dirty |= bit;
                        }
                        if decision.clean_written {
                            entry.dirty &= !bit;
                        }
                        store.update(key, entry);
                        store.touch(key);
                    }
                    None => {
                        // No free or clean-evictable line: degrade to
                        // pass-through for this block.
                        if !decision.write_core {
                            core.device.write_all_at(ByteOffset(abs), chunk)?;
                            self.blocks.increment(Role::Core, Direction::Write, BLOCK_4K);
                            core.blocks.increment(Role::Core, Direction::Write, BLOCK_4K);
                        }
                        pass_through = true;
                    }
                }
            }

            if !pass_through {
                all_pass_through = false;
            }
        }

        self.requests.record(Direction::Write, all_pass_through);
        core.requests.record(Direction::Write, all_pass_through);
        drop(store);
        drop(config);
        Ok(())
    }

    fn read_request(&self, core: &CoreState, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_running()?;
        let len = self.check_request(core, offset, buf.len())?;

        let config = self.config.read();
        let mode = config.cache_mode;

        let mut store = self.store.lock();

        self.blocks
            .increment(Role::ExportedObject, Direction::Read, len);
        core.blocks
            .increment(Role::ExportedObject, Direction::Read, len);

        let mut all_pass_through = true;
        let line_size = store.line_size();
        let blocks = len / BLOCK_4K;
        for i in 0..blocks {
            let abs = offset + i * BLOCK_4K;
            let core_line = abs / line_size;
            let block_in_line = u32::try_from((abs % line_size) / BLOCK_4K).unwrap_or(0);
            let bit = block_mask(block_in_line, 1);
            let key = (core.id, core_line);
            let chunk_start = usize::try_from(i * BLOCK_4K).unwrap_or(0);
            let dst = &mut buf[chunk_start..chunk_start + BLOCK_4K as usize];

            let resident = store.lookup(key);
            let lookup = match resident {
                Some(entry) if entry.valid & bit != 0 => {
                    if entry.dirty & bit != 0 {
                        Lookup::HitDirty
                    } else {
                        Lookup::HitClean
                    }
                }
                _ => Lookup::Miss,
            };
            let decision = policy::route(IoDir::Read, mode, lookup, false);
            let pass_through = decision.pass_through;

            if decision.serve_from_cache {
                if let Some(entry) = resident {
                    let cache_off = store.block_offset(&entry, block_in_line);
                    self.device.read_exact_at(cache_off, dst)?;
                    if decision.count_cache_read {
                        self.blocks.increment(Role::Cache, Direction::Read, BLOCK_4K);
                        core.blocks.increment(Role::Cache, Direction::Read, BLOCK_4K);
                    }
                    store.touch(key);
                }
            } else if decision.read_core {
                core.device.read_exact_at(ByteOffset(abs), dst)?;
                self.blocks.increment(Role::Core, Direction::Read, BLOCK_4K);
                core.blocks.increment(Role::Core, Direction::Read, BLOCK_4K);

                if decision.insert_read {
                    let target = match resident {
                        Some(entry) => Some(entry),
                        None => store.alloc(key),
                    };
                    // A full cache with no clean victim skips the insert.
                    if let Some(mut entry) = target {
                        let cache_off = store.block_offset(&entry, block_in_line);
                        self.device.write_all_at(cache_off, dst)?;
                        self.blocks.increment(Role::Cache, Direction::Write, BLOCK_4K);
                        core.blocks.increment(Role::Cache, Direction::Write, BLOCK_4K);
                        entry.valid |= bit;
                        store.update(key, entry);
                        store.touch(key);
                    }
                }
            }

            if !pass_through {
                all_pass_through = false;
            }
        }

        self.requests.record(Direction::Read, all_pass_through);
        core.requests.record(Direction::Read, all_pass_through);
        drop(store);
        drop(config);
        Ok(())
    }
}

/// Read the fixed superblock head and extract the cache line size, which
/// determines the metadata region geometry.
fn peek_line_size(device: &dyn ByteDevice) -> Result<CacheLineSize> {
    let probe_len = usize::try_from(device.len_bytes().min(64)).unwrap_or(64);
    if probe_len < 16 {
        return Err(CascadeError::CorruptSuperblock(
            "device too small for a superblock".to_owned(),
        ));
    }
    let mut probe = vec![0_u8; probe_len];
    device.read_exact_at(ByteOffset(SUPERBLOCK_OFFSET), &mut probe)?;
    metadata::peek_line_size(&probe)
}

/// Whether the device's head looks like a cache superblock.
fn metadata_present(device: &dyn ByteDevice) -> Result<bool> {
    match peek_line_size(device) {
        Ok(_) => Ok(true),
        Err(CascadeError::CorruptSuperblock(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_block::MemoryByteDevice;

    const KIB_4: usize = BLOCK_4K as usize;

    /// Cache device sized to hold exactly `lines` 4 KiB lines.
    fn cache_device(lines: u64) -> Arc<dyn ByteDevice> {
        Arc::new(MemoryByteDevice::new((4096 + lines * (4096 + 64)) as usize))
    }

    fn core_device(bytes: usize) -> Arc<dyn ByteDevice> {
        Arc::new(MemoryByteDevice::new(bytes))
    }

    fn start(mode: CacheMode, lines: u64) -> (Cache, Core) {
        let cache = Cache::start(cache_device(lines), mode, true).expect("start cache");
        let core = cache
            .add_core("mem-core", core_device(1024 * 1024))
            .expect("add core");
        (cache, core)
    }

    fn payload(salt: u8, blocks: usize) -> Vec<u8> {
        vec![salt; blocks * KIB_4]
    }

    #[test]
    fn write_through_writes_cache_and_core_equally() {
        let (cache, core) = start(CacheMode::WriteThrough, 64);
        let data = payload(0xA5, 8);
        core.write_at(0, &data).expect("write");

        let stats = cache.get_statistics(&[StatsFilter::Blocks]).block_stats;
        assert_eq!(stats.cache.writes, data.len() as u64);
        assert_eq!(stats.core.writes, data.len() as u64);
        assert_eq!(stats.exp_obj.writes, data.len() as u64);

        // Read back: all hits, no core traffic.
        let mut buf = vec![0_u8; data.len()];
        core.read_at(0, &mut buf).expect("read");
        assert_eq!(buf, data);
        let stats = cache.get_statistics(&[StatsFilter::Blocks]).block_stats;
        assert_eq!(stats.cache.reads, data.len() as u64);
        assert_eq!(stats.core.reads, 0);
    }

    #[test]
    fn write_back_keeps_core_untouched_until_flush() {
        let backing = MemoryByteDevice::new(1024 * 1024);
        let cache = Cache::start(cache_device(64), CacheMode::WriteBack, true).expect("start");
        let core = cache
            .add_core("mem-core", Arc::new(backing.clone()))
            .expect("add core");

        let data = payload(0x2A, 16);
        core.write_at(0, &data).expect("write");

        let stats = cache.get_statistics(&[]);
        assert_eq!(stats.block_stats.core.writes, 0);
        assert_eq!(stats.block_stats.cache.writes, data.len() as u64);
        assert_eq!(stats.usage_stats.dirty, 16);

        // The core device itself has seen nothing yet.
        let mut raw = vec![0_u8; data.len()];
        backing.read_exact_at(ByteOffset(0), &mut raw).expect("raw read");
        assert_eq!(raw, vec![0_u8; data.len()]);

        let flushed = cache.flush_cache().expect("flush");
        assert_eq!(flushed, 16);
        let stats = cache.get_statistics(&[]);
        assert_eq!(stats.block_stats.core.writes, data.len() as u64);
        assert_eq!(stats.usage_stats.dirty, 0);

        backing.read_exact_at(ByteOffset(0), &mut raw).expect("raw read");
        assert_eq!(raw, data);
    }

    #[test]
    fn pass_through_records_zero_cache_activity() {
        let (cache, core) = start(CacheMode::PassThrough, 64);
        let data = payload(0x77, 4);
        core.write_at(0, &data).expect("write");
        let mut buf = vec![0_u8; data.len()];
        core.read_at(0, &mut buf).expect("read");
        assert_eq!(buf, data);

        let stats = cache.get_statistics(&[]);
        assert_eq!(stats.block_stats.cache.reads, 0);
        assert_eq!(stats.block_stats.cache.writes, 0);
        assert_eq!(stats.block_stats.core.writes, data.len() as u64);
        assert_eq!(stats.block_stats.core.reads, data.len() as u64);
        assert_eq!(stats.request_stats.pass_through_writes, 1);
        assert_eq!(stats.request_stats.pass_through_reads, 1);
    }

    #[test]
    fn write_around_reads_populate_writes_do_not() {
        let (cache, core) = start(CacheMode::WriteAround, 64);

        // Seed the core directly through pass-through-free means: write in
        // WA goes to core, so a plain write serves as seeding.
        let seeded = payload(0x11, 8);
        core.write_at(0, &seeded).expect("seed write");
        cache.reset_counters().expect("reset");

        // Read of unwritten (non-resident) data inserts into cache.
        let mut buf = vec![0_u8; seeded.len()];
        core.read_at(0, &mut buf).expect("read");
        assert_eq!(buf, seeded);
        let stats = cache.get_statistics(&[StatsFilter::Blocks]).block_stats;
        assert_eq!(stats.cache.writes, seeded.len() as u64);
        assert_eq!(stats.core.reads, seeded.len() as u64);

        // A same-size write leaves cache.writes unchanged.
        let update = payload(0x22, 8);
        core.write_at(0, &update).expect("write");
        let stats = cache.get_statistics(&[StatsFilter::Blocks]).block_stats;
        assert_eq!(stats.cache.writes, seeded.len() as u64);
        assert_eq!(stats.core.writes, update.len() as u64);

        // The resident copy stays coherent with the new data.
        let before = cache.get_statistics(&[StatsFilter::Blocks]).block_stats;
        core.read_at(0, &mut buf).expect("read back");
        assert_eq!(buf, update);
        let delta = cache.get_statistics(&[StatsFilter::Blocks]).block_stats - before;
        assert_eq!(delta.core.reads, 0, "read must hit the refreshed cache copy");
    }

    #[test]
    fn write_only_never_touches_core_and_serves_repeat_reads_silently() {
        let (cache, core) = start(CacheMode::WriteOnly, 64);
        let data = payload(0x4D, 8);
        core.write_at(0, &data).expect("write");

        let stats = cache.get_statistics(&[StatsFilter::Blocks]).block_stats;
        assert_eq!(stats.exp_obj.writes, data.len() as u64);
        assert_eq!(stats.core.writes, 0);
        assert_eq!(stats.cache.writes, data.len() as u64);

        cache.reset_counters().expect("reset");
        let mut buf = vec![0_u8; data.len()];
        core.read_at(0, &mut buf).expect("repeat read");
        assert_eq!(buf, data);

        let stats = cache.get_statistics(&[StatsFilter::Blocks]).block_stats;
        assert_eq!(stats.cache.reads, 0, "resident reads record no cache activity");
        assert_eq!(stats.cache.writes, 0);
        assert_eq!(stats.core.reads, 0, "no core traffic for resident data");
        assert_eq!(stats.exp_obj.reads, data.len() as u64);
    }

    #[test]
    fn write_only_reads_of_unwritten_data_bypass_the_cache() {
        let (cache, core) = start(CacheMode::WriteOnly, 64);
        let mut buf = vec![0_u8; 4 * KIB_4];
        core.read_at(0, &mut buf).expect("cold read");

        let stats = cache.get_statistics(&[]);
        assert_eq!(stats.block_stats.cache.reads, 0);
        assert_eq!(stats.block_stats.cache.writes, 0);
        assert_eq!(stats.block_stats.core.reads, buf.len() as u64);
        assert_eq!(stats.request_stats.pass_through_reads, 1);
    }

    #[test]
    fn unknown_mode_name_is_an_invalid_transition() {
        let (cache, _core) = start(CacheMode::WriteThrough, 8);
        let err = cache
            .set_cache_mode_by_name("wx", false)
            .expect_err("unknown mode");
        assert!(matches!(err, CascadeError::InvalidModeTransition(_)));
        assert_eq!(cache.get_cache_mode(), CacheMode::WriteThrough);
    }

    #[test]
    fn switch_with_flush_propagates_dirty_data() {
        let (cache, core) = start(CacheMode::WriteBack, 64);
        let data = payload(0x5E, 8);
        core.write_at(0, &data).expect("write");
        assert_eq!(cache.get_statistics(&[]).usage_stats.dirty, 8);

        cache
            .set_cache_mode(CacheMode::WriteThrough, true)
            .expect("switch");
        assert_eq!(cache.get_cache_mode(), CacheMode::WriteThrough);
        assert_eq!(cache.get_statistics(&[]).usage_stats.dirty, 0);
    }

    #[test]
    fn switch_without_flush_retains_dirty_blocks_serving_reads() {
        let (cache, core) = start(CacheMode::WriteBack, 64);
        let data = payload(0x5F, 4);
        core.write_at(0, &data).expect("write");

        cache
            .set_cache_mode(CacheMode::PassThrough, false)
            .expect("switch");
        assert_eq!(cache.get_statistics(&[]).usage_stats.dirty, 4);

        // The dirty copy is the only copy; reads must return it.
        let mut buf = vec![0_u8; data.len()];
        core.read_at(0, &mut buf).expect("read under PT");
        assert_eq!(buf, data);
    }

    #[test]
    fn purge_discards_cached_data_without_core_writes() {
        let (cache, core) = start(CacheMode::WriteBack, 64);
        let data = payload(0x3C, 4);
        core.write_at(0, &data).expect("write");
        cache.purge_cache().expect("purge");

        let stats = cache.get_statistics(&[]);
        assert_eq!(stats.usage_stats.occupancy, 0);
        assert_eq!(stats.block_stats.core.writes, 0, "purge must not touch core");

        // The dirty data is gone; reads now come from the (stale) core.
        cache.reset_counters().expect("reset");
        let mut buf = vec![0_u8; data.len()];
        core.read_at(0, &mut buf).expect("read after purge");
        assert_eq!(buf, vec![0_u8; data.len()]);
    }

    #[test]
    fn start_without_force_refuses_used_device() {
        let device: Arc<dyn ByteDevice> =
            Arc::new(MemoryByteDevice::new((4096 + 16 * 4160) as usize));
        let cache = Cache::start(Arc::clone(&device), CacheMode::WriteBack, true).expect("start");
        cache.stop().expect("stop");

        let err = Cache::start(Arc::clone(&device), CacheMode::WriteBack, false)
            .expect_err("metadata present");
        assert!(matches!(err, CascadeError::MetadataExists(_)));

        // Forced start discards the old instance.
        let cache = Cache::start(device, CacheMode::WriteThrough, true).expect("forced start");
        assert_eq!(cache.get_cache_mode(), CacheMode::WriteThrough);
    }

    #[test]
    fn stopped_instance_rejects_io_and_admin() {
        let (cache, core) = start(CacheMode::WriteThrough, 8);
        cache.stop().expect("stop");

        let err = core.write_at(0, &payload(1, 1)).expect_err("io after stop");
        assert!(matches!(err, CascadeError::NotFound(_)));
        let err = cache
            .set_cache_mode(CacheMode::WriteBack, false)
            .expect_err("admin after stop");
        assert!(matches!(err, CascadeError::NotFound(_)));
        let err = cache.stop().expect_err("double stop");
        assert!(matches!(err, CascadeError::NotFound(_)));
    }

    #[test]
    fn unaligned_requests_are_rejected() {
        let (_cache, core) = start(CacheMode::WriteThrough, 8);
        let err = core.write_at(17, &payload(0, 1)).expect_err("bad offset");
        assert!(matches!(err, CascadeError::OutOfRange(_)));
        let mut buf = vec![0_u8; 100];
        let err = core.read_at(0, &mut buf).expect_err("bad length");
        assert!(matches!(err, CascadeError::OutOfRange(_)));
        let err = core
            .write_at(core.len_bytes(), &payload(0, 1))
            .expect_err("past end");
        assert!(matches!(err, CascadeError::OutOfRange(_)));
    }

    #[test]
    fn remove_core_flushes_and_forgets_its_lines() {
        let (cache, core) = start(CacheMode::WriteBack, 64);
        let data = payload(0x66, 8);
        core.write_at(0, &data).expect("write");
        let id = core.id();

        cache.remove_core(id).expect("remove core");
        assert!(cache.core_ids().is_empty());
        assert_eq!(cache.get_statistics(&[]).usage_stats.occupancy, 0);
        assert!(matches!(
            cache.remove_core(id),
            Err(CascadeError::NotFound(_))
        ));
    }

    #[test]
    fn cleaner_drains_dirty_blocks_in_background() {
        let (cache, core) = start(CacheMode::WriteBack, 64);
        cache
            .set_cleaning_policy(CleaningPolicy::Alru)
            .expect("policy");
        let data = payload(0x18, 16);
        core.write_at(0, &data).expect("write");
        assert_eq!(cache.get_statistics(&[]).usage_stats.dirty, 16);

        let cleaner = cache.start_cleaner(cleaner::CleanerConfig {
            interval: Duration::from_millis(10),
            batch_blocks: 4,
        });
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while cache.get_statistics(&[]).usage_stats.dirty > 0
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        cleaner.shutdown();
        assert_eq!(cache.get_statistics(&[]).usage_stats.dirty, 0);
    }

    #[test]
    fn nop_cleaning_policy_leaves_dirty_data_alone() {
        let (cache, core) = start(CacheMode::WriteBack, 64);
        cache
            .set_cleaning_policy(CleaningPolicy::Nop)
            .expect("policy");
        core.write_at(0, &payload(0x19, 8)).expect("write");

        let cleaner = cache.start_cleaner(cleaner::CleanerConfig {
            interval: Duration::from_millis(5),
            batch_blocks: 64,
        });
        std::thread::sleep(Duration::from_millis(50));
        cleaner.shutdown();
        assert_eq!(cache.get_statistics(&[]).usage_stats.dirty, 8);
    }

    #[test]
    fn file_backed_stop_and_load_restores_config_and_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache_path = dir.path().join("cache.img");
        let core_path = dir.path().join("core.img");
        std::fs::File::create(&cache_path)
            .and_then(|f| f.set_len(4096 + 128 * 4160))
            .expect("cache image");
        std::fs::File::create(&core_path)
            .and_then(|f| f.set_len(1024 * 1024))
            .expect("core image");

        let core_uuid = core_path.to_string_lossy().into_owned();
        let data = payload(0x99, 8);
        let captured;
        {
            let device: Arc<dyn ByteDevice> =
                Arc::new(FileByteDevice::open(&cache_path).expect("open cache"));
            let cache = Cache::start(device, CacheMode::WriteBack, true).expect("start");
            let core_dev: Arc<dyn ByteDevice> =
                Arc::new(FileByteDevice::open(&core_path).expect("open core"));
            let core = cache.add_core(core_uuid.clone(), core_dev).expect("add core");

            core.write_at(0, &data).expect("write");
            cache
                .set_cache_mode(CacheMode::WriteThrough, true)
                .expect("switch");
            core.set_seq_cutoff_policy(SeqCutOffPolicy::Always).expect("policy");
            core.set_seq_cutoff_threshold(512 * 1024).expect("threshold");
            captured = cache.get_cache_config();
            cache.stop().expect("stop");
        }

        let device: Arc<dyn ByteDevice> =
            Arc::new(FileByteDevice::open(&cache_path).expect("reopen cache"));
        let cache = Cache::load(device, &FileVolumeOpener).expect("load");
        assert_eq!(cache.get_cache_config(), captured);

        let ids = cache.core_ids();
        assert_eq!(ids.len(), 1);
        let core = cache.core(ids[0]).expect("core handle");
        assert_eq!(core.uuid(), core_uuid);
        let seq = core.get_seq_cutoff_config();
        assert_eq!(seq.policy, SeqCutOffPolicy::Always);
        assert_eq!(seq.threshold_bytes, 512 * 1024);

        // Previously cached data serves hits after reload.
        let mut buf = vec![0_u8; data.len()];
        core.read_at(0, &mut buf).expect("read after load");
        assert_eq!(buf, data);
        let stats = cache.get_statistics(&[StatsFilter::Blocks]).block_stats;
        assert_eq!(stats.cache.reads, data.len() as u64);
        assert_eq!(stats.core.reads, 0);
    }

    #[test]
    fn load_rejects_a_corrupted_superblock() {
        let device = MemoryByteDevice::new((4096 + 16 * 4160) as usize);
        let shared: Arc<dyn ByteDevice> = Arc::new(device.clone());
        let cache = Cache::start(shared, CacheMode::WriteBack, true).expect("start");
        cache.stop().expect("stop");

        // Flip a byte inside the encoded region.
        let mut head = vec![0_u8; 64];
        device.read_exact_at(ByteOffset(0), &mut head).expect("read head");
        head[20] ^= 0xFF;
        device.write_all_at(ByteOffset(0), &head).expect("corrupt");

        let shared: Arc<dyn ByteDevice> = Arc::new(device);
        let err = Cache::load(shared, &FileVolumeOpener).expect_err("corrupt load");
        assert!(matches!(err, CascadeError::CorruptSuperblock(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn full_cache_degrades_writes_to_pass_through() {
        // Two lines of cache, Write-Back: fill both, keep them dirty, then
        // write elsewhere. No evictable line exists, so the third write goes
        // to the core and counts as pass-through.
        let (cache, core) = start(CacheMode::WriteBack, 2);
        core.write_at(0, &payload(0xB0, 1)).expect("write 0");
        core.write_at(BLOCK_4K, &payload(0xB1, 1)).expect("write 1");

        let before = cache.get_statistics(&[]);
        core.write_at(16 * BLOCK_4K, &payload(0xB2, 1)).expect("write 2");
        let after = cache.get_statistics(&[]);

        assert_eq!(
            after.block_stats.cache.writes - before.block_stats.cache.writes,
            0
        );
        assert_eq!(
            after.block_stats.core.writes - before.block_stats.core.writes,
            BLOCK_4K
        );
        assert_eq!(
            after.request_stats.pass_through_writes
                - before.request_stats.pass_through_writes,
            1
        );
    }
}
