//! Layer Stack
//!
//! The fixed chain every request runs through on the processing thread:
//!
//! ```text
//! request ──► Decompression ──► Dedicated Cache (file has one)
//!                           └─► Global Cache   (otherwise)
//!                                     │
//!                                     ▼
//!                                   Device
//! ```
//!
//! The stack is owned by the processing thread and never shared, so none of
//! the layers take locks.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, instrument, trace};

use super::cache::{read_through, BlockCache, DedicatedCaches};
use super::compression::{read_compressed, CompressionRegistry};
use super::device::{Device, FileIo};
use super::request::{QueryAnswer, ReadCommand, RequestCommand, RequestHandle};
use super::stats::StreamerStats;
use crate::config::StreamerConfig;
use crate::error::{Error, Result};

/// The layers below the scheduler.
pub struct StreamStack {
    device: Device,
    global: BlockCache,
    dedicated: DedicatedCaches,
    compression: CompressionRegistry,
    stats: Arc<StreamerStats>,
}

impl StreamStack {
    pub fn new(
        config: &StreamerConfig,
        io: Arc<dyn FileIo>,
        compression: CompressionRegistry,
        stats: Arc<StreamerStats>,
    ) -> Self {
        Self {
            device: Device::new(io, config, Arc::clone(&stats)),
            global: BlockCache::new(
                "global",
                config.global_block_size,
                config.global_cache_blocks(),
            ),
            dedicated: DedicatedCaches::new(
                config.dedicated_block_size,
                config.dedicated_cache_blocks(),
            ),
            compression,
            stats,
        }
    }

    /// Run one request to completion.
    ///
    /// Returns [`Error::Canceled`] when the request was canceled while its
    /// device read was in flight.
    pub fn execute(&mut self, request: &RequestHandle) -> Result<()> {
        match request.command() {
            RequestCommand::Read(read) => self.read(request, read),
            RequestCommand::FlushCaches => {
                self.flush_all();
                Ok(())
            }
            RequestCommand::FlushFile(path) => {
                self.flush_file(path);
                Ok(())
            }
            RequestCommand::CreateDedicatedCache(path) => {
                self.dedicated.create(path);
                self.stats.set_dedicated_caches(self.dedicated.len() as u64);
                Ok(())
            }
            RequestCommand::DestroyDedicatedCache(path) => {
                self.dedicated.destroy(path);
                self.stats.set_dedicated_caches(self.dedicated.len() as u64);
                Ok(())
            }
            RequestCommand::FileExists(path) => {
                let exists = self.compression.resolve(path).is_some() || self.device.exists(path);
                request.set_answer(QueryAnswer::Exists(exists));
                Ok(())
            }
            RequestCommand::FileSize(path) => {
                let size = match self.compression.resolve(path) {
                    Some(info) => info.uncompressed_size,
                    None => self.device.file_size(path)?,
                };
                request.set_answer(QueryAnswer::Size(size));
                Ok(())
            }
        }
    }

    fn read(&mut self, request: &RequestHandle, read: &ReadCommand) -> Result<()> {
        let mut buffer = request.take_buffer_for_processing().ok_or_else(|| {
            Error::Internal(format!("request {} has no output buffer", request.id()))
        })?;
        let size = read.size as usize;
        let canceled = || request.is_cancel_requested();

        let result = match buffer.get_mut(..size) {
            Some(out) => self.read_range(&read.path, read.offset, out, &canceled),
            None => Err(Error::Internal(format!(
                "output buffer of request {} shrank below {} bytes",
                request.id(),
                size
            ))),
        };

        let bytes_read = if result.is_ok() { read.size } else { 0 };
        request.restore_buffer(buffer, bytes_read);
        result
    }

    /// Read a range of a logical file, decompressing when a provider knows it.
    #[instrument(level = "debug", skip(self, out, canceled), fields(size = out.len()))]
    pub fn read_range(
        &mut self,
        path: &Path,
        offset: u64,
        out: &mut [u8],
        canceled: &dyn Fn() -> bool,
    ) -> Result<()> {
        match self.compression.resolve(path) {
            Some(info) => {
                trace!(
                    archive = %info.archive.display(),
                    tag = %info.tag,
                    "Reading compressed file"
                );
                let stats = Arc::clone(&self.stats);
                let mut read_raw = |archive: &Path, at: u64, buf: &mut [u8]| {
                    self.read_cached(archive, at, buf, canceled)
                };
                read_compressed(&info, path, offset, out, &stats, &mut read_raw)
            }
            None => self.read_cached(path, offset, out, canceled),
        }
    }

    /// Read raw bytes through the file's dedicated cache, or the global cache.
    fn read_cached(
        &mut self,
        path: &Path,
        offset: u64,
        out: &mut [u8],
        canceled: &dyn Fn() -> bool,
    ) -> Result<()> {
        let Self {
            device,
            global,
            dedicated,
            stats,
            ..
        } = self;
        match dedicated.get_mut(path) {
            Some(cache) => read_through(cache, true, device, stats, path, offset, out, canceled),
            None => read_through(global, false, device, stats, path, offset, out, canceled),
        }
    }

    fn flush_all(&mut self) {
        let global = self.global.flush();
        let dedicated = self.dedicated.flush_all();
        self.device.flush_all();
        self.stats.record_flush();
        debug!(global, dedicated, "Flushed caches");
    }

    fn flush_file(&mut self, path: &Path) {
        let global = self.global.flush_file(path);
        let dedicated = self.dedicated.get_mut(path).map_or(0, BlockCache::flush);
        self.device.flush_file(path);
        self.stats.record_flush();
        debug!(path = %path.display(), global, dedicated, "Flushed file");
    }

    pub fn global_cache(&self) -> &BlockCache {
        &self.global
    }

    pub fn has_dedicated_cache(&self, path: &Path) -> bool {
        self.dedicated.contains(path)
    }
}
