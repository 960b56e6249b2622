//! Prometheus Export
//!
//! Publishes a [`StreamerStatsSnapshot`] as gauges in a private
//! `prometheus` registry and renders the text exposition format.

use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};
use crate::streamer::StreamerStatsSnapshot;

/// Metric name prefix
pub const NAMESPACE: &str = "couchestream";

/// Engine statistics as Prometheus gauges.
pub struct StreamerMetrics {
    registry: Registry,
    gauges: Vec<(&'static str, IntGauge)>,
}

const METRICS: &[(&str, &str)] = &[
    ("requests_queued", "Requests submitted to the engine"),
    ("requests_completed", "Requests that completed"),
    ("requests_failed", "Requests that failed"),
    ("requests_canceled", "Requests that were canceled"),
    ("deadlines_missed", "Requests that finished after their deadline"),
    ("global_cache_hits", "Block hits in the global cache"),
    ("global_cache_misses", "Block misses in the global cache"),
    ("dedicated_cache_hits", "Block hits in dedicated caches"),
    ("dedicated_cache_misses", "Block misses in dedicated caches"),
    ("cache_evictions", "Blocks evicted from any cache"),
    ("cache_insert_passthroughs", "Blocks not cached because every entry was pinned"),
    ("cache_flushes", "Flush requests executed"),
    ("dedicated_caches", "Dedicated caches currently alive"),
    ("device_reads", "Read calls issued to the device"),
    ("device_bytes", "Bytes read from the device"),
    ("files_opened", "Files opened by the device"),
    ("decompressed_frames", "Compressed frames expanded"),
    ("decompressed_bytes", "Bytes produced by decompression"),
    ("read_nanos_per_kib", "Moving average of read time per KiB in nanoseconds"),
    ("query_latency_us", "Moving average of metadata query time in microseconds"),
];

impl StreamerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let mut gauges = Vec::with_capacity(METRICS.len());
        for (name, help) in METRICS {
            let gauge = IntGauge::with_opts(Opts::new(*name, *help).namespace(NAMESPACE))
                .map_err(|e| Error::Internal(format!("Failed to create metric {}: {}", name, e)))?;
            registry.register(Box::new(gauge.clone())).map_err(|e| {
                Error::Internal(format!("Failed to register metric {}: {}", name, e))
            })?;
            gauges.push((*name, gauge));
        }
        Ok(Self { registry, gauges })
    }

    /// Copy a snapshot into the gauges.
    pub fn update(&self, snapshot: &StreamerStatsSnapshot) {
        for (name, gauge) in &self.gauges {
            let value = match *name {
                "requests_queued" => snapshot.requests_queued,
                "requests_completed" => snapshot.requests_completed,
                "requests_failed" => snapshot.requests_failed,
                "requests_canceled" => snapshot.requests_canceled,
                "deadlines_missed" => snapshot.deadlines_missed,
                "global_cache_hits" => snapshot.global_hits,
                "global_cache_misses" => snapshot.global_misses,
                "dedicated_cache_hits" => snapshot.dedicated_hits,
                "dedicated_cache_misses" => snapshot.dedicated_misses,
                "cache_evictions" => snapshot.evictions,
                "cache_insert_passthroughs" => snapshot.insert_passthroughs,
                "cache_flushes" => snapshot.flushes,
                "dedicated_caches" => snapshot.dedicated_caches,
                "device_reads" => snapshot.device_reads,
                "device_bytes" => snapshot.device_bytes,
                "files_opened" => snapshot.files_opened,
                "decompressed_frames" => snapshot.decompressed_frames,
                "decompressed_bytes" => snapshot.decompressed_bytes,
                "read_nanos_per_kib" => snapshot.read_nanos_per_kib,
                "query_latency_us" => snapshot.query_latency_us,
                _ => continue,
            };
            gauge.set(i64::try_from(value).unwrap_or(i64::MAX));
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every gauge in the text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("Metrics are not UTF-8: {}", e)))
    }
}
