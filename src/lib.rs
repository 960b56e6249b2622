//! Couchestream - Asynchronous File Streaming Engine
//!
//! Schedules file reads by priority and deadline, serves them through a
//! two-level block cache and transparently decompresses files that live
//! inside archives.
//!
//! # Architecture
//!
//! ```text
//! Request → Scheduler → Decompression → Dedicated/Global Cache → Device
//! ```
//!
//! # Modules
//!
//! - [`config`] - Engine configuration (YAML loadable)
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus export of engine statistics
//! - [`streamer`] - Requests, scheduler and the layer stack

pub mod config;
pub mod error;
pub mod metrics;
pub mod streamer;

// Re-export commonly used types
pub use config::StreamerConfig;
pub use error::{Error, Result};
pub use metrics::StreamerMetrics;
pub use streamer::{
    Deadline, Priority, RequestBatch, RequestHandle, RequestStatus, Streamer, StreamerBuilder,
    StreamerStatsSnapshot,
};
