//! Streamer Statistics
//!
//! Lock-free counters updated by the processing thread and readable from
//! any thread. Read and query costs are tracked as exponential moving
//! averages and feed the completion estimates of waiting requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::request::{RequestCommand, RequestStatus};

/// EMA smoothing factor
const EMA_ALPHA: f64 = 0.1;

/// Counters for the whole engine.
#[derive(Debug, Default)]
pub struct StreamerStats {
    // Requests
    requests_queued: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    requests_canceled: AtomicU64,
    deadlines_missed: AtomicU64,

    // Caches
    global_hits: AtomicU64,
    global_misses: AtomicU64,
    dedicated_hits: AtomicU64,
    dedicated_misses: AtomicU64,
    evictions: AtomicU64,
    insert_passthroughs: AtomicU64,
    flushes: AtomicU64,
    dedicated_caches: AtomicU64,

    // Device
    device_reads: AtomicU64,
    device_bytes: AtomicU64,
    files_opened: AtomicU64,

    // Decompression
    decompressed_frames: AtomicU64,
    decompressed_bytes: AtomicU64,

    // Costs (exponential moving averages)
    read_nanos_per_kib: AtomicU64,
    query_latency_us: AtomicU64,
}

impl StreamerStats {
    /// Create a new statistics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_queued(&self, count: u64) {
        self.requests_queued.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a request reaching a terminal status.
    pub fn record_finished(&self, status: RequestStatus) {
        let counter = match status {
            RequestStatus::Completed => &self.requests_completed,
            RequestStatus::Failed => &self.requests_failed,
            RequestStatus::Canceled => &self.requests_canceled,
            RequestStatus::Pending => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// A request finished after its deadline had passed.
    pub fn record_deadline_missed(&self) {
        self.deadlines_missed.fetch_add(1, Ordering::Relaxed);
    }

    /// Feed the read cost average with one finished read.
    pub fn record_read_time(&self, bytes: u64, elapsed: Duration) {
        if bytes == 0 {
            return;
        }
        let per_kib = elapsed.as_nanos().saturating_mul(1024) / u128::from(bytes);
        update_ema(&self.read_nanos_per_kib, u64::try_from(per_kib).unwrap_or(u64::MAX));
    }

    /// Feed the metadata query average with one finished query.
    pub fn record_query_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        update_ema(&self.query_latency_us, micros.max(1));
    }

    /// Expected time to execute `command`, from the averages seen so far.
    ///
    /// Zero until the first read or query of that kind has been measured.
    pub fn estimate(&self, command: &RequestCommand) -> Duration {
        match command {
            RequestCommand::Read(read) => {
                let per_kib = self.read_nanos_per_kib.load(Ordering::Relaxed);
                let nanos = u128::from(read.size) * u128::from(per_kib) / 1024;
                Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
            }
            RequestCommand::FileExists(_) | RequestCommand::FileSize(_) => {
                Duration::from_micros(self.query_latency_us.load(Ordering::Relaxed))
            }
            _ => Duration::ZERO,
        }
    }

    pub fn record_cache_lookup(&self, dedicated: bool, hits: u64, misses: u64) {
        if dedicated {
            self.dedicated_hits.fetch_add(hits, Ordering::Relaxed);
            self.dedicated_misses.fetch_add(misses, Ordering::Relaxed);
        } else {
            self.global_hits.fetch_add(hits, Ordering::Relaxed);
            self.global_misses.fetch_add(misses, Ordering::Relaxed);
        }
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert_passthrough(&self) {
        self.insert_passthroughs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_dedicated_caches(&self, count: u64) {
        self.dedicated_caches.store(count, Ordering::Relaxed);
    }

    pub fn record_device_read(&self, bytes: u64) {
        self.device_reads.fetch_add(1, Ordering::Relaxed);
        self.device_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_file_opened(&self) {
        self.files_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decompressed(&self, bytes: u64) {
        self.decompressed_frames.fetch_add(1, Ordering::Relaxed);
        self.decompressed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get a snapshot of current statistics.
    pub fn snapshot(&self) -> StreamerStatsSnapshot {
        StreamerStatsSnapshot {
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_canceled: self.requests_canceled.load(Ordering::Relaxed),
            deadlines_missed: self.deadlines_missed.load(Ordering::Relaxed),
            global_hits: self.global_hits.load(Ordering::Relaxed),
            global_misses: self.global_misses.load(Ordering::Relaxed),
            dedicated_hits: self.dedicated_hits.load(Ordering::Relaxed),
            dedicated_misses: self.dedicated_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            insert_passthroughs: self.insert_passthroughs.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            dedicated_caches: self.dedicated_caches.load(Ordering::Relaxed),
            device_reads: self.device_reads.load(Ordering::Relaxed),
            device_bytes: self.device_bytes.load(Ordering::Relaxed),
            files_opened: self.files_opened.load(Ordering::Relaxed),
            decompressed_frames: self.decompressed_frames.load(Ordering::Relaxed),
            decompressed_bytes: self.decompressed_bytes.load(Ordering::Relaxed),
            read_nanos_per_kib: self.read_nanos_per_kib.load(Ordering::Relaxed),
            query_latency_us: self.query_latency_us.load(Ordering::Relaxed),
        }
    }
}

fn update_ema(target: &AtomicU64, sample: u64) {
    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            sample
        } else {
            ((1.0 - EMA_ALPHA) * current as f64 + EMA_ALPHA * sample as f64) as u64
        };
        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

/// Point-in-time copy of [`StreamerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamerStatsSnapshot {
    pub requests_queued: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub requests_canceled: u64,
    pub deadlines_missed: u64,
    pub global_hits: u64,
    pub global_misses: u64,
    pub dedicated_hits: u64,
    pub dedicated_misses: u64,
    pub evictions: u64,
    pub insert_passthroughs: u64,
    pub flushes: u64,
    pub dedicated_caches: u64,
    pub device_reads: u64,
    pub device_bytes: u64,
    pub files_opened: u64,
    pub decompressed_frames: u64,
    pub decompressed_bytes: u64,
    pub read_nanos_per_kib: u64,
    pub query_latency_us: u64,
}

impl StreamerStatsSnapshot {
    /// Hit ratio across both cache kinds (0.0 when nothing was looked up).
    pub fn cache_hit_ratio(&self) -> f64 {
        let hits = (self.global_hits + self.dedicated_hits) as f64;
        let total = hits + (self.global_misses + self.dedicated_misses) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}
