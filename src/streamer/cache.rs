//! Block Caches
//!
//! Block-aligned LRU caches keyed by (file, block index). The same
//! [`BlockCache`] type backs the shared global cache and every per-file
//! dedicated cache; they differ only in block size and capacity.
//!
//! # Design
//!
//! - Whole blocks only: a read straddling a block boundary fetches every
//!   block it touches, so cached content is always block aligned
//! - The last block of a file may be shorter than the block size
//! - Entries are pinned while a request copies out of them and are never
//!   evicted while pinned
//! - Inserting into a full cache whose entries are all pinned is a no-op
//! - Owned by the processing thread; no internal locking

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, error, trace};

use super::device::{Device, Span};
use super::stats::StreamerStats;
use crate::error::{Error, Result};

/// Cache key: file plus block index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    path: PathBuf,
    block: u64,
}

impl BlockKey {
    pub fn new(path: impl Into<PathBuf>, block: u64) -> Self {
        Self {
            path: path.into(),
            block,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block(&self) -> u64 {
        self.block
    }
}

/// A cached block.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    data: Bytes,
    last_access: u64,
    pins: u32,
}

impl CacheEntry {
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }
}

/// Result of looking a byte range up in a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Every block of the range is cached
    Hit,
    /// Some blocks are cached; `missing` lists block-aligned byte ranges that are not
    Partial { missing: Vec<Range<u64>> },
    /// Nothing is cached
    Miss,
}

/// Outcome of [`BlockCache::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored without evicting anything
    Inserted,
    /// Stored after evicting the least recently used entry
    Evicted,
    /// An entry for the block already existed and was replaced
    Replaced,
    /// Cache is full of pinned entries; nothing was stored
    Passthrough,
}

/// Block-aligned LRU cache.
#[derive(Debug)]
pub struct BlockCache {
    name: String,
    block_size: u64,
    capacity: usize,
    entries: HashMap<BlockKey, CacheEntry>,
    /// Access sequence -> key, oldest first
    lru: BTreeMap<u64, BlockKey>,
    clock: u64,
}

impl BlockCache {
    /// Create a cache holding up to `capacity` blocks of `block_size` bytes
    pub fn new(name: impl Into<String>, block_size: u64, capacity: usize) -> Self {
        Self {
            name: name.into(),
            block_size: block_size.max(1),
            capacity,
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            clock: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Capacity in blocks
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of pinned entries
    pub fn pinned(&self) -> usize {
        self.entries.values().filter(|e| e.is_pinned()).count()
    }

    /// Block indices touched by a byte range. Empty for zero-length ranges.
    pub fn block_range(&self, offset: u64, size: u64) -> Range<u64> {
        if size == 0 {
            return 0..0;
        }
        let first = offset / self.block_size;
        let last = (offset + size - 1) / self.block_size;
        first..last + 1
    }

    pub fn contains(&self, path: &Path, block: u64) -> bool {
        self.entries.contains_key(&BlockKey::new(path, block))
    }

    /// Check which parts of a byte range are cached, without touching LRU order.
    pub fn lookup(&self, path: &Path, offset: u64, size: u64) -> CacheLookup {
        let blocks = self.block_range(offset, size);
        let total = blocks.end - blocks.start;
        let mut missing: Vec<Range<u64>> = Vec::new();
        let mut missing_blocks = 0;

        for block in blocks {
            if self.contains(path, block) {
                continue;
            }
            missing_blocks += 1;
            let start = block * self.block_size;
            let end = start + self.block_size;
            match missing.last_mut() {
                Some(prev) if prev.end == start => prev.end = end,
                _ => missing.push(start..end),
            }
        }

        if missing_blocks == 0 {
            CacheLookup::Hit
        } else if missing_blocks == total {
            CacheLookup::Miss
        } else {
            CacheLookup::Partial { missing }
        }
    }

    fn touch(&mut self, key: &BlockKey) -> Option<&mut CacheEntry> {
        self.clock += 1;
        let now = self.clock;
        let entry = self.entries.get_mut(key)?;
        self.lru.remove(&entry.last_access);
        entry.last_access = now;
        self.lru.insert(now, key.clone());
        Some(entry)
    }

    /// Fetch a block, marking it most recently used.
    pub fn get(&mut self, path: &Path, block: u64) -> Option<Bytes> {
        let key = BlockKey::new(path, block);
        self.touch(&key).map(|e| e.data.clone())
    }

    /// Pin a block against eviction. Returns false if it is not cached.
    pub fn pin(&mut self, path: &Path, block: u64) -> bool {
        let key = BlockKey::new(path, block);
        match self.touch(&key) {
            Some(entry) => {
                entry.pins += 1;
                true
            }
            None => false,
        }
    }

    /// Release a pin taken with [`pin`](Self::pin).
    pub fn unpin(&mut self, path: &Path, block: u64) {
        let key = BlockKey::new(path, block);
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    fn evict_one(&mut self) -> bool {
        let victim = self
            .lru
            .iter()
            .find(|(_, key)| self.entries.get(*key).map_or(false, |e| !e.is_pinned()))
            .map(|(seq, key)| (*seq, key.clone()));

        match victim {
            Some((seq, key)) => {
                self.lru.remove(&seq);
                self.entries.remove(&key);
                trace!(
                    cache = %self.name,
                    path = %key.path.display(),
                    block = key.block,
                    "Evicted block"
                );
                true
            }
            None => false,
        }
    }

    /// Store a block, evicting the least recently used unpinned entry if full.
    pub fn insert(&mut self, path: &Path, block: u64, data: Bytes) -> InsertOutcome {
        let key = BlockKey::new(path, block);
        if let Some(entry) = self.touch(&key) {
            entry.data = data;
            return InsertOutcome::Replaced;
        }
        if self.capacity == 0 {
            return InsertOutcome::Passthrough;
        }

        let mut outcome = InsertOutcome::Inserted;
        if self.entries.len() >= self.capacity {
            if !self.evict_one() {
                return InsertOutcome::Passthrough;
            }
            outcome = InsertOutcome::Evicted;
        }

        self.clock += 1;
        let now = self.clock;
        self.lru.insert(now, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                data,
                last_access: now,
                pins: 0,
            },
        );
        outcome
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&BlockKey) -> bool) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|key, entry| entry.is_pinned() || !pred(key));
        let entries = &self.entries;
        self.lru.retain(|_, key| entries.contains_key(key));
        before - self.entries.len()
    }

    /// Remove a single block if it is not pinned.
    pub fn remove(&mut self, path: &Path, block: u64) -> bool {
        let key = BlockKey::new(path, block);
        match self.entries.get(&key) {
            Some(entry) if !entry.is_pinned() => {
                self.lru.remove(&entry.last_access);
                self.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Remove every unpinned entry. Returns the number removed.
    pub fn flush(&mut self) -> usize {
        self.remove_where(|_| true)
    }

    /// Remove every unpinned entry of one file. Returns the number removed.
    pub fn flush_file(&mut self, path: &Path) -> usize {
        self.remove_where(|key| key.path == path)
    }
}

// =============================================================================
// Dedicated Caches
// =============================================================================

/// Registry of per-file dedicated caches.
#[derive(Debug)]
pub struct DedicatedCaches {
    block_size: u64,
    capacity: usize,
    caches: HashMap<PathBuf, BlockCache>,
}

impl DedicatedCaches {
    pub fn new(block_size: u64, capacity: usize) -> Self {
        Self {
            block_size,
            capacity,
            caches: HashMap::new(),
        }
    }

    /// Create a cache for `path`. Returns false if one already exists.
    pub fn create(&mut self, path: &Path) -> bool {
        if self.caches.contains_key(path) {
            return false;
        }
        let name = format!("dedicated:{}", path.display());
        self.caches.insert(
            path.to_path_buf(),
            BlockCache::new(name, self.block_size, self.capacity),
        );
        debug!(path = %path.display(), "Created dedicated cache");
        true
    }

    /// Destroy the cache for `path`. Returns false if there was none.
    pub fn destroy(&mut self, path: &Path) -> bool {
        let removed = self.caches.remove(path).is_some();
        if removed {
            debug!(path = %path.display(), "Destroyed dedicated cache");
        }
        removed
    }

    pub fn get_mut(&mut self, path: &Path) -> Option<&mut BlockCache> {
        self.caches.get_mut(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.caches.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Flush every dedicated cache's evictable entries.
    pub fn flush_all(&mut self) -> usize {
        self.caches.values_mut().map(BlockCache::flush).sum()
    }
}

// =============================================================================
// Read-Through
// =============================================================================

/// Read `out.len()` bytes at `offset` through `cache`, fetching missing
/// blocks from the device and inserting them.
///
/// `canceled` is polled after the device read; when it returns true the
/// fetched data is discarded and [`Error::Canceled`] is returned.
pub fn read_through(
    cache: &mut BlockCache,
    dedicated: bool,
    device: &mut Device,
    stats: &StreamerStats,
    path: &Path,
    offset: u64,
    out: &mut [u8],
    canceled: &dyn Fn() -> bool,
) -> Result<()> {
    let size = out.len() as u64;
    // Even an empty read must name an existing file and an in-range offset
    let file_size = device.file_size(path)?;
    if offset.checked_add(size).map_or(true, |end| end > file_size) {
        return Err(Error::ShortRead {
            path: path.to_path_buf(),
            offset,
            requested: size,
            file_size,
        });
    }
    if size == 0 {
        return Ok(());
    }

    let block_size = cache.block_size();
    let block_len = |block: u64| -> u64 {
        let start = block * block_size;
        block_size.min(file_size - start)
    };

    let mut pinned = Vec::new();
    let mut missing = Vec::new();
    for block in cache.block_range(offset, size) {
        let usable = cache
            .get(path, block)
            .map_or(false, |data| data.len() as u64 >= block_len(block));
        if usable && cache.pin(path, block) {
            pinned.push(block);
        } else {
            // A short block was cached while the file was smaller
            if cache.contains(path, block) {
                cache.remove(path, block);
            }
            missing.push(block);
        }
    }
    stats.record_cache_lookup(dedicated, pinned.len() as u64, missing.len() as u64);
    trace!(
        cache = %cache.name(),
        path = %path.display(),
        hits = pinned.len(),
        misses = missing.len(),
        "Cache lookup"
    );

    let result = fill(
        cache, device, stats, path, offset, out, &pinned, &missing, &block_len, canceled,
    );
    for block in &pinned {
        cache.unpin(path, *block);
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn fill(
    cache: &mut BlockCache,
    device: &mut Device,
    stats: &StreamerStats,
    path: &Path,
    offset: u64,
    out: &mut [u8],
    pinned: &[u64],
    missing: &[u64],
    block_len: &dyn Fn(u64) -> u64,
    canceled: &dyn Fn() -> bool,
) -> Result<()> {
    let block_size = cache.block_size();
    let spans: Vec<Span> = missing
        .iter()
        .map(|&block| Span::new(block * block_size, block_len(block)))
        .collect();
    let fetched = if spans.is_empty() {
        Vec::new()
    } else {
        device.read_batch(path, &spans)?
    };
    if canceled() {
        return Err(Error::Canceled);
    }

    let mut blocks: HashMap<u64, Bytes> = missing.iter().copied().zip(fetched).collect();
    for (&block, data) in &blocks {
        match cache.insert(path, block, data.clone()) {
            InsertOutcome::Evicted => stats.record_eviction(),
            InsertOutcome::Passthrough => stats.record_insert_passthrough(),
            InsertOutcome::Inserted | InsertOutcome::Replaced => {}
        }
    }
    for &block in pinned {
        let data = cache.get(path, block).ok_or_else(|| {
            error!(cache = %cache.name(), path = %path.display(), block, "Pinned block vanished");
            Error::CacheConsistency(format!(
                "pinned block {} of {} missing from {}",
                block,
                path.display(),
                cache.name()
            ))
        })?;
        blocks.insert(block, data);
    }

    let end = offset + out.len() as u64;
    for block in cache.block_range(offset, out.len() as u64) {
        let data = blocks.get(&block).ok_or_else(|| {
            Error::CacheConsistency(format!("block {} of {} not assembled", block, path.display()))
        })?;
        let block_start = block * block_size;
        let copy_start = offset.max(block_start);
        let copy_end = end.min(block_start + data.len() as u64);
        if copy_end <= copy_start {
            return Err(Error::CacheConsistency(format!(
                "block {} of {} shorter than expected",
                block,
                path.display()
            )));
        }
        let src = &data[(copy_start - block_start) as usize..(copy_end - block_start) as usize];
        let dst_start = (copy_start - offset) as usize;
        out[dst_start..dst_start + src.len()].copy_from_slice(src);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamerConfig;
    use crate::streamer::device::MemoryFileIo;
    use std::sync::Arc;

    fn bytes(n: u8, len: usize) -> Bytes {
        Bytes::from(vec![n; len])
    }

    fn sequential(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_block_range() {
        let cache = BlockCache::new("t", 100, 4);
        assert_eq!(cache.block_range(0, 100), 0..1);
        assert_eq!(cache.block_range(50, 100), 0..2);
        assert_eq!(cache.block_range(199, 2), 1..3);
        assert_eq!(cache.block_range(10, 0), 0..0);
    }

    #[test]
    fn test_lookup_hit_partial_miss() {
        let mut cache = BlockCache::new("t", 100, 8);
        let path = Path::new("a");
        assert_eq!(cache.lookup(path, 0, 300), CacheLookup::Miss);

        cache.insert(path, 0, bytes(1, 100));
        cache.insert(path, 2, bytes(1, 100));
        assert_eq!(cache.lookup(path, 0, 100), CacheLookup::Hit);
        assert_eq!(
            cache.lookup(path, 0, 400),
            CacheLookup::Partial {
                missing: vec![100..200, 300..400]
            }
        );
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = BlockCache::new("t", 10, 2);
        let path = Path::new("a");
        assert_eq!(cache.insert(path, 0, bytes(0, 10)), InsertOutcome::Inserted);
        assert_eq!(cache.insert(path, 1, bytes(1, 10)), InsertOutcome::Inserted);

        // Touch block 0 so block 1 becomes the LRU victim
        cache.get(path, 0);
        assert_eq!(cache.insert(path, 2, bytes(2, 10)), InsertOutcome::Evicted);
        assert!(cache.contains(path, 0));
        assert!(!cache.contains(path, 1));
        assert!(cache.contains(path, 2));
    }

    #[test]
    fn test_pinned_entries_survive_eviction() {
        let mut cache = BlockCache::new("t", 10, 2);
        let path = Path::new("a");
        cache.insert(path, 0, bytes(0, 10));
        cache.insert(path, 1, bytes(1, 10));
        assert!(cache.pin(path, 0));
        cache.get(path, 1);

        // Block 0 is older but pinned, so block 1 goes
        assert_eq!(cache.insert(path, 2, bytes(2, 10)), InsertOutcome::Evicted);
        assert!(cache.contains(path, 0));
        assert!(!cache.contains(path, 1));
    }

    #[test]
    fn test_all_pinned_is_passthrough() {
        let mut cache = BlockCache::new("t", 10, 1);
        let path = Path::new("a");
        cache.insert(path, 0, bytes(0, 10));
        cache.pin(path, 0);
        assert_eq!(cache.insert(path, 1, bytes(1, 10)), InsertOutcome::Passthrough);
        assert_eq!(cache.len(), 1);

        cache.unpin(path, 0);
        assert_eq!(cache.insert(path, 1, bytes(1, 10)), InsertOutcome::Evicted);
    }

    #[test]
    fn test_flush_keeps_pinned() {
        let mut cache = BlockCache::new("t", 10, 4);
        let a = Path::new("a");
        let b = Path::new("b");
        cache.insert(a, 0, bytes(0, 10));
        cache.insert(a, 1, bytes(0, 10));
        cache.insert(b, 0, bytes(0, 10));
        cache.pin(a, 1);

        assert_eq!(cache.flush_file(b), 1);
        assert_eq!(cache.flush(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.pinned(), 1);
    }

    #[test]
    fn test_dedicated_registry() {
        let mut caches = DedicatedCaches::new(64, 4);
        let path = Path::new("archive.pak");
        assert!(caches.create(path));
        assert!(!caches.create(path));
        assert!(caches.contains(path));

        caches.get_mut(path).unwrap().insert(path, 0, bytes(0, 64));
        assert_eq!(caches.flush_all(), 1);

        assert!(caches.destroy(path));
        assert!(!caches.destroy(path));
        assert!(caches.is_empty());
    }

    #[test]
    fn test_read_through_mixes_hits_and_device_reads() {
        let io = MemoryFileIo::new();
        let source = sequential(1050);
        io.write_file("a", source.clone());
        let stats = StreamerStats::new();
        let mut device = Device::new(
            Arc::new(io.clone()),
            &StreamerConfig::default(),
            Arc::new(StreamerStats::new()),
        );
        let mut cache = BlockCache::new("global", 100, 32);
        let path = Path::new("a");
        let never = || false;

        // Warm block 1 only
        let mut out = vec![0u8; 10];
        read_through(&mut cache, false, &mut device, &stats, path, 120, &mut out, &never).unwrap();
        assert_eq!(out, source[120..130].to_vec());
        assert_eq!(io.read_count(), 1);

        // Spans blocks 0..=10; block 1 is a hit, block 10 is the short tail
        let mut out = vec![0u8; 1040];
        read_through(&mut cache, false, &mut device, &stats, path, 10, &mut out, &never).unwrap();
        assert_eq!(out, source[10..1050].to_vec());
        // Two device runs: block 0 and blocks 2..=10
        assert_eq!(io.read_count(), 3);
        assert_eq!(cache.pinned(), 0);

        let snap = stats.snapshot();
        assert_eq!(snap.global_hits, 1);
        assert_eq!(snap.global_misses, 11);
    }

    #[test]
    fn test_read_through_past_end_fails() {
        let io = MemoryFileIo::new();
        io.write_file("a", sequential(100));
        let stats = StreamerStats::new();
        let mut device =
            Device::new(Arc::new(io), &StreamerConfig::default(), Arc::new(StreamerStats::new()));
        let mut cache = BlockCache::new("global", 64, 8);

        let mut out = vec![0u8; 50];
        let path = Path::new("a");
        let err = read_through(
            &mut cache, false, &mut device, &stats, path, 60, &mut out, &|| false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ShortRead { .. }));
    }

    #[test]
    fn test_read_through_cancel_discards_result() {
        let io = MemoryFileIo::new();
        io.write_file("a", sequential(100));
        let stats = StreamerStats::new();
        let mut device =
            Device::new(Arc::new(io), &StreamerConfig::default(), Arc::new(StreamerStats::new()));
        let mut cache = BlockCache::new("global", 64, 8);

        let mut out = vec![0u8; 50];
        let path = Path::new("a");
        let err = read_through(
            &mut cache, false, &mut device, &stats, path, 0, &mut out, &|| true,
        )
        .unwrap_err();
        assert!(err.is_canceled());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_empty_read_still_checks_file() {
        let io = MemoryFileIo::new();
        io.write_file("a", sequential(100));
        let stats = StreamerStats::new();
        let mut device =
            Device::new(Arc::new(io), &StreamerConfig::default(), Arc::new(StreamerStats::new()));
        let mut cache = BlockCache::new("global", 64, 8);
        let mut out: Vec<u8> = Vec::new();

        let missing = Path::new("missing");
        let err = read_through(
            &mut cache, false, &mut device, &stats, missing, 0, &mut out, &|| false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::FileNotFound { .. }), "{:?}", err);

        let path = Path::new("a");
        let err = read_through(
            &mut cache, false, &mut device, &stats, path, 101, &mut out, &|| false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ShortRead { .. }));

        read_through(

            &mut cache, false, &mut device, &stats, path, 100, &mut out, &|| false,

        )

        .unwrap();
        assert_eq!(stats.snapshot().global_hits + stats.snapshot().global_misses, 0);
    }
}
