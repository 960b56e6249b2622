//! Decompression Layer
//!
//! Files that live compressed inside an archive are described by a
//! [`CompressionInfo`] supplied by a registered [`CompressionProvider`].
//! Providers are asked in registration order and the first match wins.
//!
//! A compressed region may be split into independently decompressible
//! frames. A read only fetches and expands the frames that overlap the
//! requested uncompressed range; frames fully covered by the request are
//! decompressed straight into the caller's buffer.
//!
//! # Example
//!
//! ```
//! use couchestream::streamer::compression::{compress_lz4_frames, CompressionInfo};
//!
//! let data = vec![7u8; 10_000];
//! let (packed, frames) = compress_lz4_frames(&data, 4096).unwrap();
//! let info = CompressionInfo::lz4("game.pak", 0, packed.len() as u64, data.len() as u64)
//!     .with_frames(frames);
//! assert_eq!(info.frames().len(), 3);
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{trace, warn};

use super::stats::StreamerStats;
use crate::error::{Error, Result};

// =============================================================================
// Compression Info
// =============================================================================

/// Opaque tag naming a compression format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompressionTag(pub u32);

impl CompressionTag {
    /// Raw LZ4 blocks
    pub const LZ4: CompressionTag = CompressionTag(u32::from_be_bytes(*b"LZ4B"));
}

impl fmt::Display for CompressionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic()) {
            write!(f, "{}", String::from_utf8_lossy(&bytes))
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

/// One independently decompressible piece of a compressed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedFrame {
    /// Offset within the compressed region
    pub compressed_offset: u64,
    pub compressed_size: u64,
    /// Offset within the uncompressed file
    pub uncompressed_offset: u64,
    pub uncompressed_size: u64,
}

impl CompressedFrame {
    pub fn uncompressed_end(&self) -> u64 {
        self.uncompressed_offset + self.uncompressed_size
    }

    pub fn compressed_end(&self) -> u64 {
        self.compressed_offset + self.compressed_size
    }
}

/// Expands compressed bytes.
pub trait Decompressor: Send + Sync {
    /// Decompress `compressed` into `out`, returning the number of bytes written.
    fn decompress(
        &self,
        info: &CompressionInfo,
        compressed: &[u8],
        out: &mut [u8],
    ) -> Result<usize>;
}

/// Where a logical file lives inside an archive and how to expand it.
#[derive(Clone)]
pub struct CompressionInfo {
    /// Archive holding the compressed bytes
    pub archive: PathBuf,
    /// Offset of the compressed region within the archive
    pub offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub tag: CompressionTag,
    pub decompressor: Arc<dyn Decompressor>,
    /// Frame table; empty means one frame covering the whole region
    pub frames: Vec<CompressedFrame>,
}

impl fmt::Debug for CompressionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionInfo")
            .field("archive", &self.archive)
            .field("offset", &self.offset)
            .field("compressed_size", &self.compressed_size)
            .field("uncompressed_size", &self.uncompressed_size)
            .field("tag", &self.tag)
            .field("frames", &self.frames.len())
            .finish()
    }
}

impl CompressionInfo {
    pub fn new(
        archive: impl Into<PathBuf>,
        offset: u64,
        compressed_size: u64,
        uncompressed_size: u64,
        tag: CompressionTag,
        decompressor: Arc<dyn Decompressor>,
    ) -> Self {
        Self {
            archive: archive.into(),
            offset,
            compressed_size,
            uncompressed_size,
            tag,
            decompressor,
            frames: Vec::new(),
        }
    }

    /// Info for a region of raw LZ4 blocks
    pub fn lz4(
        archive: impl Into<PathBuf>,
        offset: u64,
        compressed_size: u64,
        uncompressed_size: u64,
    ) -> Self {
        Self::new(
            archive,
            offset,
            compressed_size,
            uncompressed_size,
            CompressionTag::LZ4,
            Arc::new(Lz4Decompressor),
        )
    }

    /// Attach a frame table
    pub fn with_frames(mut self, frames: Vec<CompressedFrame>) -> Self {
        self.frames = frames;
        self
    }

    /// The frame table, with the implicit single frame filled in.
    pub fn frames(&self) -> Vec<CompressedFrame> {
        if self.frames.is_empty() {
            vec![CompressedFrame {
                compressed_offset: 0,
                compressed_size: self.compressed_size,
                uncompressed_offset: 0,
                uncompressed_size: self.uncompressed_size,
            }]
        } else {
            self.frames.clone()
        }
    }

    /// Frames overlapping `[offset, offset + size)` of the uncompressed file.
    pub fn frames_for(&self, offset: u64, size: u64) -> Vec<CompressedFrame> {
        let end = offset + size;
        self.frames()
            .into_iter()
            .filter(|f| f.uncompressed_offset < end && f.uncompressed_end() > offset)
            .collect()
    }
}

// =============================================================================
// LZ4
// =============================================================================

/// Decompressor for raw LZ4 blocks (no size prefix).
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Decompressor;

impl Decompressor for Lz4Decompressor {
    fn decompress(
        &self,
        _info: &CompressionInfo,
        compressed: &[u8],
        out: &mut [u8],
    ) -> Result<usize> {
        let expected = i32::try_from(out.len()).map_err(|_| Error::Decompression {
            algorithm: "LZ4".into(),
            reason: format!("frame of {} bytes is too large", out.len()),
        })?;
        lz4::block::decompress_to_buffer(compressed, Some(expected), out).map_err(|e| {
            Error::Decompression {
                algorithm: "LZ4".into(),
                reason: e.to_string(),
            }
        })
    }
}

/// Compress `data` into LZ4 frames of at most `frame_size` uncompressed bytes.
///
/// Returns the concatenated frames and their frame table.
pub fn compress_lz4_frames(
    data: &[u8],
    frame_size: usize,
) -> Result<(Vec<u8>, Vec<CompressedFrame>)> {
    let frame_size = frame_size.max(1);
    let mut packed = Vec::new();
    let mut frames = Vec::with_capacity(data.len() / frame_size + 1);

    for (i, chunk) in data.chunks(frame_size).enumerate() {
        let compressed = lz4::block::compress(chunk, None, false).map_err(|e| {
            Error::Decompression {
                algorithm: "LZ4".into(),
                reason: format!("compression failed: {}", e),
            }
        })?;
        frames.push(CompressedFrame {
            compressed_offset: packed.len() as u64,
            compressed_size: compressed.len() as u64,
            uncompressed_offset: (i * frame_size) as u64,
            uncompressed_size: chunk.len() as u64,
        });
        packed.extend_from_slice(&compressed);
    }
    Ok((packed, frames))
}

// =============================================================================
// Providers
// =============================================================================

/// Maps a logical file to its compressed layout.
pub trait CompressionProvider: Send + Sync {
    /// Compression info for `path`, or `None` if this provider does not know the file.
    fn compression_info(&self, path: &Path) -> Option<CompressionInfo>;
}

/// Providers queried in registration order.
#[derive(Default, Clone)]
pub struct CompressionRegistry {
    providers: Vec<Arc<dyn CompressionProvider>>,
}

impl CompressionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn CompressionProvider>) {
        self.providers.push(provider);
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// First provider match for `path`.
    pub fn resolve(&self, path: &Path) -> Option<CompressionInfo> {
        self.providers.iter().find_map(|p| p.compression_info(path))
    }
}

/// In-memory provider mapping logical paths to compression info.
///
/// Clones share the same index, so entries can be added after the
/// provider has been registered.
#[derive(Default, Clone)]
pub struct ArchiveIndex {
    entries: Arc<DashMap<PathBuf, CompressionInfo>>,
}

impl ArchiveIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, info: CompressionInfo) {
        self.entries.insert(path.into(), info);
    }

    pub fn remove(&self, path: impl AsRef<Path>) -> Option<CompressionInfo> {
        self.entries.remove(path.as_ref()).map(|(_, info)| info)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CompressionProvider for ArchiveIndex {
    fn compression_info(&self, path: &Path) -> Option<CompressionInfo> {
        self.entries.get(path).map(|entry| entry.value().clone())
    }
}

// =============================================================================
// Read Path
// =============================================================================

/// Read `out.len()` uncompressed bytes at `offset` of the logical file `path`.
///
/// `read_raw` fetches bytes of the archive (through the caches below this
/// layer); it is called once with the minimal compressed span covering
/// every frame the request overlaps.
pub fn read_compressed(
    info: &CompressionInfo,
    path: &Path,
    offset: u64,
    out: &mut [u8],
    stats: &StreamerStats,
    read_raw: &mut dyn FnMut(&Path, u64, &mut [u8]) -> Result<()>,
) -> Result<()> {
    let size = out.len() as u64;
    if size == 0 {
        return Ok(());
    }
    if offset.checked_add(size).map_or(true, |end| end > info.uncompressed_size) {
        return Err(Error::ShortRead {
            path: path.to_path_buf(),
            offset,
            requested: size,
            file_size: info.uncompressed_size,
        });
    }

    let frames = info.frames_for(offset, size);
    let (first, last) = match (frames.first(), frames.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => {
            return Err(Error::Decompression {
                algorithm: info.tag.to_string(),
                reason: format!("no frame covers offset {} of {}", offset, path.display()),
            })
        }
    };
    if last.compressed_end() > info.compressed_size {
        return Err(Error::Decompression {
            algorithm: info.tag.to_string(),
            reason: format!("frame table of {} exceeds compressed size", path.display()),
        });
    }
    check_frame_coverage(info, path, offset, offset + size, &frames)?;

    let base = first.compressed_offset;
    let mut scratch = vec![0u8; (last.compressed_end() - base) as usize];
    read_raw(&info.archive, info.offset + base, &mut scratch)?;
    trace!(
        path = %path.display(),
        archive = %info.archive.display(),
        frames = frames.len(),
        compressed = scratch.len(),
        "Read compressed span"
    );

    let end = offset + size;
    let mut frame_buffer = Vec::new();
    for frame in &frames {
        let rel = (frame.compressed_offset - base) as usize;
        let compressed = &scratch[rel..rel + frame.compressed_size as usize];
        let frame_len = frame.uncompressed_size as usize;

        let covered = frame.uncompressed_offset >= offset && frame.uncompressed_end() <= end;
        let written = if covered {
            let dst = (frame.uncompressed_offset - offset) as usize;
            info.decompressor
                .decompress(info, compressed, &mut out[dst..dst + frame_len])?
        } else {
            frame_buffer.resize(frame_len, 0);
            info.decompressor.decompress(info, compressed, &mut frame_buffer)?
        };

        if written != frame_len {
            warn!(
                path = %path.display(),
                expected = frame_len,
                actual = written,
                "Decompressed size mismatch"
            );
            return Err(Error::Decompression {
                algorithm: info.tag.to_string(),
                reason: format!(
                    "expected {} bytes from frame at {}, got {}",
                    frame_len, frame.uncompressed_offset, written
                ),
            });
        }
        stats.record_decompressed(written as u64);

        if !covered {
            let copy_start = offset.max(frame.uncompressed_offset);
            let copy_end = end.min(frame.uncompressed_end());
            let src = (copy_start - frame.uncompressed_offset) as usize;
            let dst = (copy_start - offset) as usize;
            let len = (copy_end - copy_start) as usize;
            out[dst..dst + len].copy_from_slice(&frame_buffer[src..src + len]);
        }
    }
    Ok(())
}

/// The selected frames must tile `[offset, end)` with no gap and appear in
/// both uncompressed and compressed order.
fn check_frame_coverage(
    info: &CompressionInfo,
    path: &Path,
    offset: u64,
    end: u64,
    frames: &[CompressedFrame],
) -> Result<()> {
    let invalid = |reason: String| Error::Decompression {
        algorithm: info.tag.to_string(),
        reason: format!("frame table of {}: {}", path.display(), reason),
    };

    let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
        return Err(invalid(format!("no frame covers offset {}", offset)));
    };
    if first.uncompressed_offset > offset {
        return Err(invalid(format!(
            "gap before offset {} (first frame starts at {})",
            offset, first.uncompressed_offset
        )));
    }
    for pair in frames.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if prev.uncompressed_end() != next.uncompressed_offset {
            return Err(invalid(format!(
                "frames at {} and {} are not contiguous",
                prev.uncompressed_offset, next.uncompressed_offset
            )));
        }
        if next.compressed_offset < prev.compressed_end() {
            return Err(invalid(format!(
                "compressed frame at {} overlaps or precedes its predecessor",
                next.compressed_offset
            )));
        }
    }
    if last.uncompressed_end() < end {
        return Err(invalid(format!(
            "gap after {} (last frame ends at {})",
            end,
            last.uncompressed_end()
        )));
    }
    Ok(())
}
