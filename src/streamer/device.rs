//! Device Layer
//!
//! Blocking reads against one storage backend. The backend itself is
//! abstracted by [`FileIo`] so the engine can run against the local
//! filesystem ([`LocalFileIo`]) or an in-memory store ([`MemoryFileIo`]).
//!
//! # Design
//!
//! - Bounded LRU cache of open file handles, so files read repeatedly
//!   (archives in particular) are not reopened for every request
//! - Bounded cache of file sizes, used to validate ranges before reading
//! - Adjacent spans in a batch are merged into a single read call, and reads
//!   longer than `max_read_size` are split
//! - Owned by the processing thread; no internal locking

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use tracing::{debug, trace};

use super::stats::StreamerStats;
use crate::config::StreamerConfig;
use crate::error::{Error, Result};

// =============================================================================
// Backend Traits
// =============================================================================

/// An open file. Dropping the handle closes it.
pub trait FileHandle: Send {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes read.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Current size of the file in bytes.
    fn size(&self) -> io::Result<u64>;
}

/// File primitives the device layer is built on.
pub trait FileIo: Send + Sync {
    /// Open a file for reading.
    fn open(&self, path: &Path) -> io::Result<Box<dyn FileHandle>>;

    /// Whether a file exists.
    fn exists(&self, path: &Path) -> bool;

    /// Size of a file without opening it.
    fn file_size(&self, path: &Path) -> io::Result<u64>;
}

// =============================================================================
// Local Filesystem Backend
// =============================================================================

/// [`FileIo`] backed by `std::fs` with positional reads.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileIo;

impl LocalFileIo {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
struct LocalFile(std::fs::File);

#[cfg(unix)]
impl FileHandle for LocalFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.0.read_at(buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.0.metadata()?.len())
    }
}

#[cfg(not(unix))]
struct LocalFile(parking_lot::Mutex<std::fs::File>);

#[cfg(not(unix))]
impl FileHandle for LocalFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.0.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.0.lock().metadata()?.len())
    }
}

impl FileIo for LocalFileIo {
    fn open(&self, path: &Path) -> io::Result<Box<dyn FileHandle>> {
        let file = std::fs::File::open(path)?;
        #[cfg(unix)]
        let handle = LocalFile(file);
        #[cfg(not(unix))]
        let handle = LocalFile(parking_lot::Mutex::new(file));
        Ok(Box::new(handle))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }
}

// =============================================================================
// In-Memory Backend
// =============================================================================

#[derive(Debug, Default)]
struct MemoryCounters {
    reads: AtomicU64,
    bytes: AtomicU64,
    opens: AtomicU64,
}

/// In-memory [`FileIo`] for testing.
///
/// Counts reads and opens so tests can tell whether data came from a cache,
/// and can make reads of chosen files fail.
#[derive(Debug, Default, Clone)]
pub struct MemoryFileIo {
    files: Arc<DashMap<PathBuf, Bytes>>,
    failing: Arc<DashSet<PathBuf>>,
    counters: Arc<MemoryCounters>,
}

impl MemoryFileIo {
    /// Create an empty in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a file
    pub fn write_file(&self, path: impl Into<PathBuf>, data: impl Into<Bytes>) {
        self.files.insert(path.into(), data.into());
    }

    /// Remove a file
    pub fn remove_file(&self, path: impl AsRef<Path>) -> bool {
        self.files.remove(path.as_ref()).is_some()
    }

    /// Make every read of `path` fail with an I/O error
    pub fn fail_reads(&self, path: impl Into<PathBuf>) {
        self.failing.insert(path.into());
    }

    /// Number of `read_at` calls served
    pub fn read_count(&self) -> u64 {
        self.counters.reads.load(Ordering::Relaxed)
    }

    /// Number of bytes served by `read_at`
    pub fn bytes_read(&self) -> u64 {
        self.counters.bytes.load(Ordering::Relaxed)
    }

    /// Number of successful `open` calls
    pub fn open_count(&self) -> u64 {
        self.counters.opens.load(Ordering::Relaxed)
    }
}

struct MemoryFile {
    path: PathBuf,
    io: MemoryFileIo,
}

impl FileHandle for MemoryFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if self.io.failing.contains(&self.path) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure"));
        }
        let data = self
            .io
            .files
            .get(&self.path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file removed"))?;

        self.io.counters.reads.fetch_add(1, Ordering::Relaxed);
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(buf.len()).min(data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&data[start..end]);
        self.io.counters.bytes.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn size(&self) -> io::Result<u64> {
        self.io.file_size(&self.path)
    }
}

impl FileIo for MemoryFileIo {
    fn open(&self, path: &Path) -> io::Result<Box<dyn FileHandle>> {
        if !self.files.contains_key(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        }
        self.counters.opens.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryFile {
            path: path.to_path_buf(),
            io: self.clone(),
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        self.files
            .get(path)
            .map(|entry| entry.value().len() as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
    }
}

// =============================================================================
// Device
// =============================================================================

/// One read within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: u64,
    pub len: u64,
}

impl Span {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

struct OpenFile {
    path: PathBuf,
    handle: Box<dyn FileHandle>,
    last_used: u64,
}

struct SizeEntry {
    size: u64,
    last_used: u64,
}

/// The device layer.
pub struct Device {
    io: Arc<dyn FileIo>,
    handles: Vec<OpenFile>,
    max_handles: usize,
    sizes: HashMap<PathBuf, SizeEntry>,
    max_sizes: usize,
    max_read_size: u64,
    clock: u64,
    stats: Arc<StreamerStats>,
}

impl Device {
    /// Create a device over a backend
    pub fn new(io: Arc<dyn FileIo>, config: &StreamerConfig, stats: Arc<StreamerStats>) -> Self {
        Self {
            io,
            handles: Vec::with_capacity(config.max_file_handles),
            max_handles: config.max_file_handles.max(1),
            sizes: HashMap::new(),
            max_sizes: config.max_metadata_entries,
            max_read_size: config.max_read_size.max(1),
            clock: 0,
            stats,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Index of an open handle for `path`, opening (and possibly closing the
    /// least recently used handle) as needed.
    fn handle_index(&mut self, path: &Path) -> Result<usize> {
        let now = self.tick();
        if let Some(index) = self.handles.iter().position(|f| f.path == path) {
            self.handles[index].last_used = now;
            return Ok(index);
        }

        let handle = self.io.open(path).map_err(|e| Error::device(path, &e))?;
        self.stats.record_file_opened();
        debug!(path = %path.display(), "Opened file");

        let entry = OpenFile {
            path: path.to_path_buf(),
            handle,
            last_used: now,
        };
        if self.handles.len() < self.max_handles {
            self.handles.push(entry);
            return Ok(self.handles.len() - 1);
        }

        let victim = self
            .handles
            .iter()
            .enumerate()
            .min_by_key(|(_, f)| f.last_used)
            .map(|(i, _)| i)
            .unwrap_or(0);
        trace!(path = %self.handles[victim].path.display(), "Closing least recently used handle");
        self.handles[victim] = entry;
        Ok(victim)
    }

    fn remember_size(&mut self, path: &Path, size: u64) {
        if self.max_sizes == 0 {
            return;
        }
        let now = self.tick();
        if !self.sizes.contains_key(path) && self.sizes.len() >= self.max_sizes {
            let oldest = self
                .sizes
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(p, _)| p.clone());
            if let Some(oldest) = oldest {
                self.sizes.remove(&oldest);
            }
        }
        self.sizes.insert(
            path.to_path_buf(),
            SizeEntry {
                size,
                last_used: now,
            },
        );
    }

    /// Size of a file, served from the metadata cache when possible.
    pub fn file_size(&mut self, path: &Path) -> Result<u64> {
        let now = self.tick();
        if let Some(entry) = self.sizes.get_mut(path) {
            entry.last_used = now;
            return Ok(entry.size);
        }

        let size = match self.handles.iter().find(|f| f.path == path) {
            Some(open) => open.handle.size(),
            None => self.io.file_size(path),
        }
        .map_err(|e| Error::device(path, &e))?;

        self.remember_size(path, size);
        Ok(size)
    }

    /// Whether a file exists.
    pub fn exists(&mut self, path: &Path) -> bool {
        if self.sizes.contains_key(path) || self.handles.iter().any(|f| f.path == path) {
            return true;
        }
        self.io.exists(path)
    }

    /// Read exactly `out.len()` bytes at `offset`.
    pub fn read_exact(&mut self, path: &Path, offset: u64, out: &mut [u8]) -> Result<()> {
        let len = out.len() as u64;
        let file_size = self.file_size(path)?;
        if offset.checked_add(len).map_or(true, |end| end > file_size) {
            return Err(Error::ShortRead {
                path: path.to_path_buf(),
                offset,
                requested: len,
                file_size,
            });
        }

        let index = self.handle_index(path)?;
        let max_read = self.max_read_size as usize;
        let mut done = 0usize;
        while done < out.len() {
            let chunk_end = (done + max_read).min(out.len());
            let n = self.handles[index]
                .handle
                .read_at(offset + done as u64, &mut out[done..chunk_end])
                .map_err(|e| Error::device(path, &e))?;
            if n == 0 {
                return Err(Error::ShortRead {
                    path: path.to_path_buf(),
                    offset,
                    requested: len,
                    file_size: offset + done as u64,
                });
            }
            self.stats.record_device_read(n as u64);
            done += n;
        }
        Ok(())
    }

    /// Read a batch of spans, merging adjacent ones into single reads.
    ///
    /// Spans must be sorted by offset and non-overlapping. The returned
    /// buffers are in the same order as `spans`.
    pub fn read_batch(&mut self, path: &Path, spans: &[Span]) -> Result<Vec<Bytes>> {
        let mut results = Vec::with_capacity(spans.len());
        let mut start = 0;
        while start < spans.len() {
            let mut end = start + 1;
            while end < spans.len() && spans[end].offset == spans[end - 1].end() {
                end += 1;
            }

            let run_offset = spans[start].offset;
            let run_len = spans[end - 1].end() - run_offset;
            let mut buffer = vec![0u8; run_len as usize];
            self.read_exact(path, run_offset, &mut buffer)?;
            trace!(
                path = %path.display(),
                offset = run_offset,
                len = run_len,
                spans = end - start,
                "Device read"
            );

            let buffer = Bytes::from(buffer);
            for span in &spans[start..end] {
                let rel = (span.offset - run_offset) as usize;
                results.push(buffer.slice(rel..rel + span.len as usize));
            }
            start = end;
        }
        Ok(results)
    }

    /// Close the handle and forget the size of one file.
    pub fn flush_file(&mut self, path: &Path) {
        self.handles.retain(|f| f.path != path);
        self.sizes.remove(path);
    }

    /// Close every handle and clear the metadata cache.
    pub fn flush_all(&mut self) {
        self.handles.clear();
        self.sizes.clear();
    }

    /// Paths of files currently held open.
    pub fn open_files(&self) -> Vec<PathBuf> {
        self.handles.iter().map(|f| f.path.clone()).collect()
    }
}
