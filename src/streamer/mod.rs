//! Streaming Engine
//!
//! Schedules, caches and completes file reads against priorities and
//! deadlines, with transparent decompression of archive-packed files.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  callers: create_read / queue / cancel / suspend / flush        │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │ crossbeam channel
//! ┌───────────────────────────────▼─────────────────────────────────┐
//! │  Scheduler (processing thread, priority/deadline heap)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Decompression Layer   (CompressionProvider registry)           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Dedicated Caches      │  Global Cache                          │
//! │  (per file, opt-in)    │  (shared, LRU)                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Device Layer          (FileIo, handle + size caches)           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use couchestream::streamer::{Deadline, Priority, RequestStatus, Streamer};
//! use couchestream::StreamerConfig;
//!
//! let streamer = Streamer::new(StreamerConfig::default())?;
//! let request = streamer.create_read(
//!     "assets/level1.bin",
//!     vec![0u8; 4096],
//!     4096,
//!     Deadline::Immediate,
//!     Priority::High,
//!     0,
//! )?;
//! request.set_completion_callback(|r| println!("done: {}", r.status()));
//! streamer.queue(&request);
//! assert_eq!(request.wait(), RequestStatus::Completed);
//! # Ok::<(), couchestream::Error>(())
//! ```

pub mod cache;
pub mod compression;
pub mod device;
pub mod request;
pub mod scheduler;
pub mod stack;
pub mod stats;

#[cfg(test)]
mod proptest;

pub use cache::{BlockCache, CacheLookup, DedicatedCaches, InsertOutcome};
pub use compression::{
    ArchiveIndex, CompressedFrame, CompressionInfo, CompressionProvider, CompressionRegistry,
    CompressionTag, Decompressor, Lz4Decompressor,
};
pub use device::{FileHandle, FileIo, LocalFileIo, MemoryFileIo};
pub use request::{
    CompletionCallback, Deadline, Priority, ReadCommand, RequestBatch, RequestCommand,
    RequestHandle, RequestStatus,
};
pub use scheduler::{Streamer, StreamerBuilder};
pub use stats::{StreamerStats, StreamerStatsSnapshot};
