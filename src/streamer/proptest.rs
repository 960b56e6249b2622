//! Property-Based Tests for the Read Path
//!
//! # Test Properties
//!
//! 1. **Read-through fidelity**: any in-range read returns the source bytes,
//!    whatever the block size and cache state
//! 2. **Bounded cache**: a cache never exceeds its capacity and never loses
//!    a pinned block
//! 3. **Partial decompression**: any in-range read of a framed compressed
//!    file returns the uncompressed bytes

#![cfg(test)]

use std::path::Path;
use std::sync::Arc;

use proptest::prelude::*;

use super::cache::{read_through, BlockCache};
use super::compression::{compress_lz4_frames, read_compressed, CompressionInfo};
use super::device::{Device, MemoryFileIo};
use super::stats::StreamerStats;
use crate::config::StreamerConfig;
use crate::error::Result;

// =============================================================================
// Property Strategies
// =============================================================================

/// File contents plus a list of (offset, size) reads inside the file.
fn file_and_reads() -> impl Strategy<Value = (Vec<u8>, Vec<(u64, u64)>)> {
    prop::collection::vec(any::<u8>(), 1..8000).prop_flat_map(|data| {
        let len = data.len() as u64;
        let read = (0..len).prop_flat_map(move |offset| (Just(offset), 1..=len - offset));
        (Just(data), prop::collection::vec(read, 1..8))
    })
}

// =============================================================================
// Read-Through Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_read_through_returns_source(
        (data, reads) in file_and_reads(),
        block_size in 1u64..2048,
        capacity in 1usize..16,
        max_read_size in 64u64..4096,
    ) {
        let io = MemoryFileIo::new();
        io.write_file("f", data.clone());
        let config = StreamerConfig { max_read_size, ..Default::default() };
        let stats = StreamerStats::new();
        let mut device = Device::new(Arc::new(io), &config, Arc::new(StreamerStats::new()));
        let mut cache = BlockCache::new("prop", block_size, capacity);

        for (offset, size) in reads {
            let mut out = vec![0u8; size as usize];
            let path = Path::new("f");
            read_through(&mut cache, false, &mut device, &stats, path, offset, &mut out, &|| false)
                .unwrap();
            prop_assert_eq!(&out[..], &data[offset as usize..(offset + size) as usize]);
            prop_assert_eq!(cache.pinned(), 0);
            prop_assert!(cache.len() <= capacity);
        }
    }

    #[test]
    fn prop_cache_bounded_and_pins_respected(
        ops in prop::collection::vec((0u64..32, any::<bool>()), 1..200),
        capacity in 1usize..8,
    ) {
        let mut cache = BlockCache::new("prop", 16, capacity);
        let path = Path::new("f");
        let mut pinned: Vec<u64> = Vec::new();

        for (block, pin) in ops {
            cache.insert(path, block, bytes::Bytes::from(vec![block as u8; 16]));
            if pin && pinned.len() + 1 < capacity && cache.pin(path, block) {
                pinned.push(block);
            }
            prop_assert!(cache.len() <= capacity);
            for held in &pinned {
                prop_assert!(cache.contains(path, *held));
            }
        }
    }
}

// =============================================================================
// Decompression Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_partial_decompression(
        (data, reads) in file_and_reads(),
        frame_size in 16usize..3000,
    ) {
        let (packed, frames) = compress_lz4_frames(&data, frame_size).unwrap();
        let info = CompressionInfo::lz4("a.pak", 0, packed.len() as u64, data.len() as u64)
            .with_frames(frames);
        let stats = StreamerStats::new();
        let mut read_raw = |_: &Path, offset: u64, out: &mut [u8]| -> Result<()> {
            let start = offset as usize;
            out.copy_from_slice(&packed[start..start + out.len()]);
            Ok(())
        };

        for (offset, size) in reads {
            let mut out = vec![0u8; size as usize];
            read_compressed(&info, Path::new("f"), offset, &mut out, &stats, &mut read_raw)
                .unwrap();
            prop_assert_eq!(&out[..], &data[offset as usize..(offset + size) as usize]);
        }
    }
}
