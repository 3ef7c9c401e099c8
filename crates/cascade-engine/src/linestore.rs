//! Cache-line mapping and allocation.
//!
//! The cache device is split into a metadata region (superblock + mapping
//! table) followed by the line region. The store maps `(core, core-side
//! line number)` to a cache line and tracks per-4KiB-block validity and
//! dirtiness within each line.
//!
//! Allocation is a free list plus an LRU of resident lines. Dirty lines are
//! never evicted, only cleaned; when neither a free nor a clean evictable
//! line exists, the caller degrades the request to pass-through. The
//! replacement mechanism is intentionally minimal and is not part of the
//! validated mode contract.

use cascade_error::{CascadeError, Result};
use cascade_types::{ByteOffset, CacheLineSize, CoreId, LineIndex, BLOCK_4K};
use cascade_stats::UsageSnapshot;
use std::collections::{HashMap, VecDeque};

/// Fixed head of the metadata region reserved for the superblock proper.
const SUPERBLOCK_BASE: u64 = 4096;

/// Metadata bytes budgeted per cache line (mapping record plus margin for
/// core registrations).
const META_PER_LINE: u64 = 64;

pub type LineKey = (CoreId, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub line: LineIndex,
    /// Bit per 4 KiB block within the line: block holds data.
    pub valid: u32,
    /// Bit per 4 KiB block within the line: data not yet on core.
    pub dirty: u32,
}

/// Bit mask covering `count` blocks starting at `first` within a line.
#[must_use]
pub fn block_mask(first: u32, count: u32) -> u32 {
    debug_assert!(first + count <= 32);
    if count == 0 {
        return 0;
    }
    let width = if count >= 32 { u32::MAX } else { (1 << count) - 1 };
    width << first
}

#[derive(Debug)]
pub struct LineStore {
    line_size: u64,
    capacity: u64,
    /// Byte offset of line 0 on the cache device (end of metadata region).
    data_offset: u64,
    free: Vec<LineIndex>,
    map: HashMap<LineKey, LineEntry>,
    lru: VecDeque<LineKey>,
}

impl LineStore {
    /// Partition a cache device of `device_len` bytes into metadata and line
    /// regions.
    pub fn new(device_len: u64, line_size: CacheLineSize) -> Result<Self> {
        let line_bytes = u64::from(line_size.bytes());
        let usable = device_len.saturating_sub(SUPERBLOCK_BASE);
        let capacity = usable / (line_bytes + META_PER_LINE);
        if capacity == 0 {
            return Err(CascadeError::NoCapacity(format!(
                "cache device too small: device_len={device_len} line_size={line_bytes}"
            )));
        }
        let data_offset = device_len - capacity * line_bytes;

        let mut free: Vec<LineIndex> = (0..capacity).map(LineIndex).collect();
        free.reverse();
        Ok(Self {
            line_size: line_bytes,
            capacity,
            data_offset,
            free,
            map: HashMap::new(),
            lru: VecDeque::new(),
        })
    }

    #[must_use]
    pub fn line_size(&self) -> u64 {
        self.line_size
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Metadata region length (superblock encoding must fit here).
    #[must_use]
    pub fn metadata_len(&self) -> u64 {
        self.data_offset
    }

    /// Byte offset of a block within a mapped line on the cache device.
    #[must_use]
    pub fn block_offset(&self, entry: &LineEntry, block_in_line: u32) -> ByteOffset {
        ByteOffset(
            self.data_offset
                + entry.line.0 * self.line_size
                + u64::from(block_in_line) * BLOCK_4K,
        )
    }

    #[must_use]
    pub fn lookup(&self, key: LineKey) -> Option<LineEntry> {
        self.map.get(&key).copied()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    fn remove_from_lru(lru: &mut VecDeque<LineKey>, key: LineKey) {
        if let Some(pos) = lru.iter().position(|k| *k == key) {
            let _ = lru.remove(pos);
        }
    }

    /// Move a resident line to the MRU position.
    pub fn touch(&mut self, key: LineKey) {
        if self.map.contains_key(&key) {
            Self::remove_from_lru(&mut self.lru, key);
            self.lru.push_back(key);
        }
    }

    /// Allocate a line for `key`, evicting the least recently used clean
    /// line if the free list is empty. Returns `None` when every resident
    /// line is dirty (caller degrades to pass-through).
    pub fn alloc(&mut self, key: LineKey) -> Option<LineEntry> {
        debug_assert!(!self.map.contains_key(&key));

        let line = match self.free.pop() {
            Some(line) => line,
            None => {
                let victim_key = self
                    .lru
                    .iter()
                    .copied()
                    .find(|candidate| {
                        self.map
                            .get(candidate)
                            .is_some_and(|entry| entry.dirty == 0)
                    })?;
                Self::remove_from_lru(&mut self.lru, victim_key);
                let victim = self.map.remove(&victim_key)?;
                victim.line
            }
        };

        let entry = LineEntry {
            line,
            valid: 0,
            dirty: 0,
        };
        self.map.insert(key, entry);
        self.lru.push_back(key);
        Some(entry)
    }

    /// Replace the stored entry for `key` (mask updates).
    pub fn update(&mut self, key: LineKey, entry: LineEntry) {
        self.map.insert(key, entry);
    }

    /// Drop every mapping (cached data is discarded, core data untouched).
    pub fn purge(&mut self) {
        for entry in self.map.values() {
            self.free.push(entry.line);
        }
        self.map.clear();
        self.lru.clear();
    }

    /// Drop every mapping owned by `core`.
    pub fn purge_core(&mut self, core: CoreId) {
        let doomed: Vec<LineKey> = self
            .map
            .keys()
            .copied()
            .filter(|(owner, _)| *owner == core)
            .collect();
        for key in doomed {
            if let Some(entry) = self.map.remove(&key) {
                self.free.push(entry.line);
            }
            Self::remove_from_lru(&mut self.lru, key);
        }
    }

    /// All entries holding dirty blocks, ordered by key for deterministic
    /// flushing.
    #[must_use]
    pub fn dirty_entries(&self) -> Vec<(LineKey, LineEntry)> {
        let mut dirty: Vec<(LineKey, LineEntry)> = self
            .map
            .iter()
            .filter(|(_, entry)| entry.dirty != 0)
            .map(|(key, entry)| (*key, *entry))
            .collect();
        dirty.sort_unstable_by_key(|(key, _)| *key);
        dirty
    }

    /// Dirty blocks for `core` only, ordered.
    #[must_use]
    pub fn dirty_entries_for(&self, core: CoreId) -> Vec<(LineKey, LineEntry)> {
        self.dirty_entries()
            .into_iter()
            .filter(|((owner, _), _)| *owner == core)
            .collect()
    }

    /// Iterate every mapping for persistence.
    pub fn entries(&self) -> impl Iterator<Item = (LineKey, LineEntry)> + '_ {
        self.map.iter().map(|(key, entry)| (*key, *entry))
    }

    /// Rebuild the resident set from persisted mapping records.
    pub fn restore(&mut self, records: impl IntoIterator<Item = (LineKey, LineEntry)>) -> Result<()> {
        for (key, entry) in records {
            if entry.line.0 >= self.capacity {
                return Err(CascadeError::CorruptSuperblock(format!(
                    "mapping references line {} beyond capacity {}",
                    entry.line.0, self.capacity
                )));
            }
            if self.map.insert(key, entry).is_some() {
                return Err(CascadeError::CorruptSuperblock(format!(
                    "duplicate mapping for core {} line {}",
                    key.0, key.1
                )));
            }
            self.lru.push_back(key);
        }

        let used: std::collections::HashSet<u64> =
            self.map.values().map(|entry| entry.line.0).collect();
        if used.len() != self.map.len() {
            return Err(CascadeError::CorruptSuperblock(
                "two mappings share one cache line".to_owned(),
            ));
        }
        self.free = (0..self.capacity)
            .rev()
            .filter(|line| !used.contains(line))
            .map(LineIndex)
            .collect();
        Ok(())
    }

    #[must_use]
    pub fn usage(&self) -> UsageSnapshot {
        let occupancy = self.map.len() as u64;
        let dirty = self.map.values().filter(|entry| entry.dirty != 0).count() as u64;
        UsageSnapshot {
            occupancy,
            free: self.capacity - occupancy,
            clean: occupancy - dirty,
            dirty,
        }
    }

    /// Usage restricted to lines owned by `core`.
    #[must_use]
    pub fn usage_for(&self, core: CoreId) -> UsageSnapshot {
        let owned = self.map.iter().filter(|((owner, _), _)| *owner == core);
        let occupancy = owned.clone().count() as u64;
        let dirty = owned.filter(|(_, entry)| entry.dirty != 0).count() as u64;
        UsageSnapshot {
            occupancy,
            free: self.capacity - self.map.len() as u64,
            clean: occupancy - dirty,
            dirty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(lines: u64) -> LineStore {
        // Size a device so exactly `lines` 4 KiB lines fit.
        let line_size = CacheLineSize::default();
        let device_len = SUPERBLOCK_BASE + lines * (u64::from(line_size.bytes()) + META_PER_LINE);
        let store = LineStore::new(device_len, line_size).expect("line store");
        assert_eq!(store.capacity(), lines);
        store
    }

    #[test]
    fn too_small_device_is_rejected() {
        let err = LineStore::new(2048, CacheLineSize::default()).expect_err("tiny device");
        assert!(matches!(err, CascadeError::NoCapacity(_)));
    }

    #[test]
    fn alloc_until_full_then_evict_clean_lru() {
        let mut store = store(2);
        let core = CoreId(0);
        assert!(store.alloc((core, 0)).is_some());
        assert!(store.alloc((core, 1)).is_some());
        assert!(store.is_full());

        // Touch line 0 so line 1 becomes the LRU victim.
        store.touch((core, 0));
        assert!(store.alloc((core, 2)).is_some());
        assert!(store.lookup((core, 1)).is_none(), "LRU clean line evicted");
        assert!(store.lookup((core, 0)).is_some());
    }

    #[test]
    fn dirty_lines_are_never_evicted() {
        let mut store = store(1);
        let core = CoreId(0);
        let mut entry = store.alloc((core, 0)).expect("alloc");
        entry.valid = 1;
        entry.dirty = 1;
        store.update((core, 0), entry);

        assert!(store.alloc((core, 1)).is_none(), "only line is dirty");
        assert!(store.lookup((core, 0)).is_some());
    }

    #[test]
    fn purge_releases_every_line() {
        let mut store = store(4);
        let core = CoreId(7);
        for i in 0..4 {
            assert!(store.alloc((core, i)).is_some());
        }
        store.purge();
        assert_eq!(store.usage().occupancy, 0);
        assert_eq!(store.usage().free, 4);
        for i in 0..4 {
            assert!(store.alloc((core, 10 + i)).is_some());
        }
    }

    #[test]
    fn restore_rejects_out_of_range_and_duplicate_lines() {
        let mut store = store(2);
        let err = store
            .restore([((CoreId(0), 0), LineEntry { line: LineIndex(9), valid: 1, dirty: 0 })])
            .expect_err("line beyond capacity");
        assert!(matches!(err, CascadeError::CorruptSuperblock(_)));

        let mut store = self::store(2);
        let err = store
            .restore([
                ((CoreId(0), 0), LineEntry { line: LineIndex(0), valid: 1, dirty: 0 }),
                ((CoreId(0), 1), LineEntry { line: LineIndex(0), valid: 1, dirty: 0 }),
            ])
            .expect_err("shared cache line");
        assert!(matches!(err, CascadeError::CorruptSuperblock(_)));
    }

    #[test]
    fn restore_rebuilds_free_list() {
        let mut store = store(3);
        store
            .restore([((CoreId(1), 5), LineEntry { line: LineIndex(1), valid: 3, dirty: 2 })])
            .expect("restore");
        assert_eq!(store.usage().occupancy, 1);
        assert_eq!(store.usage().free, 2);
        assert_eq!(store.usage().dirty, 1);

        // Lines 0 and 2 are allocatable; line 1 is not.
        let a = store.alloc((CoreId(1), 6)).expect("alloc a");
        let b = store.alloc((CoreId(1), 7)).expect("alloc b");
        assert_ne!(a.line, LineIndex(1));
        assert_ne!(b.line, LineIndex(1));
        assert_ne!(a.line, b.line);
    }

    #[test]
    fn block_mask_covers_requested_range() {
        assert_eq!(block_mask(0, 1), 0b1);
        assert_eq!(block_mask(1, 2), 0b110);
        assert_eq!(block_mask(0, 32), u32::MAX);
        assert_eq!(block_mask(0, 0), 0);
    }
}
