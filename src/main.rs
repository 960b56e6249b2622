//! couchestream - stream files through the engine and report statistics
//!
//! ```text
//! couchestream [OPTIONS] <PATHS>...
//!
//!   paths ──► Streamer ──► wait_async (all) ──► JSON report
//!                                           └─► Prometheus text (--prometheus)
//! ```

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use futures::future::join_all;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use couchestream::{
    Deadline, Priority, RequestHandle, RequestStatus, Streamer, StreamerConfig, StreamerMetrics,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Read files through the couchestream engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files to read
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Byte offset to start reading at
    #[arg(long, default_value = "0")]
    offset: u64,

    /// Bytes to read per file (default: to the end of the file)
    #[arg(long)]
    size: Option<u64>,

    /// Request priority (lowest, low, medium, high, highest)
    #[arg(long, default_value = "medium")]
    priority: Priority,

    /// Deadline in milliseconds (0 = immediate, omitted = none)
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Give every file its own dedicated cache
    #[arg(long)]
    dedicated: bool,

    /// Number of passes over the file list
    #[arg(long, default_value = "1")]
    repeat: u32,

    /// Flush all caches between passes
    #[arg(long)]
    flush_between: bool,

    /// YAML configuration file
    #[arg(long, env = "COUCHESTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Global cache capacity in bytes (overrides the config file)
    #[arg(long, env = "COUCHESTREAM_GLOBAL_CACHE")]
    global_cache_capacity: Option<u64>,

    /// Global cache block size in bytes (overrides the config file)
    #[arg(long, env = "COUCHESTREAM_BLOCK_SIZE")]
    global_block_size: Option<u64>,

    /// Print Prometheus metrics after the report
    #[arg(long)]
    prometheus: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn deadline(&self) -> Deadline {
        match self.deadline_ms {
            Some(0) => Deadline::Immediate,
            Some(ms) => Deadline::Within(Duration::from_millis(ms)),
            None => Deadline::None,
        }
    }

    fn streamer_config(&self) -> anyhow::Result<StreamerConfig> {
        let mut config = match &self.config {
            Some(path) => StreamerConfig::from_yaml_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => StreamerConfig::default(),
        };
        if let Some(capacity) = self.global_cache_capacity {
            config.global_cache_capacity = capacity;
        }
        if let Some(block_size) = self.global_block_size {
            config.global_block_size = block_size;
        }
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    if args.repeat == 0 {
        bail!("--repeat must be at least 1");
    }

    let config = args.streamer_config()?;
    info!("Starting couchestream");
    info!("  Files: {}", args.paths.len());
    info!("  Global cache: {} bytes", config.global_cache_capacity);
    info!("  Block size: {} bytes", config.global_block_size);
    info!("  Priority: {}", args.priority);

    let streamer = Streamer::new(config)?;

    if args.dedicated {
        let created: Vec<RequestHandle> = args
            .paths
            .iter()
            .map(|path| streamer.create_dedicated_cache(path.clone()))
            .collect();
        join_all(created.iter().map(|r| r.wait_async())).await;
    }

    let started = Instant::now();
    let mut completed = 0u64;
    let mut failed = 0u64;
    let mut bytes = 0u64;

    for pass in 0..args.repeat {
        if pass > 0 && args.flush_between {
            streamer.flush_caches(Priority::Highest).wait_async().await;
        }

        let mut requests = Vec::with_capacity(args.paths.len());
        for path in &args.paths {
            let Some(size) = read_size(&streamer, &args, path).await else {
                failed += 1;
                continue;
            };
            let request = streamer.create_read(
                path.clone(),
                vec![0u8; size as usize],
                size,
                args.deadline(),
                args.priority,
                args.offset,
            )?;
            streamer.queue(&request);
            requests.push(request);
        }

        let statuses = join_all(requests.iter().map(|r| r.wait_async())).await;
        for (request, status) in requests.iter().zip(statuses) {
            match status {
                RequestStatus::Completed => {
                    completed += 1;
                    bytes += request.bytes_read();
                }
                other => {
                    failed += 1;
                    warn!(request_id = request.id(), status = %other, "Read did not complete");
                }
            }
        }
        info!(pass, requests = requests.len(), "Pass finished");
    }

    let elapsed = started.elapsed();
    let stats = streamer.stats();
    let report = serde_json::json!({
        "passes": args.repeat,
        "completed": completed,
        "failed": failed,
        "bytes": bytes,
        "elapsed_ms": elapsed.as_millis() as u64,
        "cache_hit_ratio": stats.cache_hit_ratio(),
        "stats": stats,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if args.prometheus {
        let metrics = StreamerMetrics::new()?;
        metrics.update(&stats);
        print!("{}", metrics.render()?);
    }

    streamer.shutdown();
    if failed > 0 {
        bail!("{} read(s) failed", failed);
    }
    Ok(())
}

/// Bytes to read from `path`, querying the engine when no size was given.
async fn read_size(streamer: &Streamer, args: &Args, path: &Path) -> Option<u64> {
    if let Some(size) = args.size {
        return Some(size);
    }
    let query = streamer.file_size(path, Priority::Highest);
    if query.wait_async().await != RequestStatus::Completed {
        warn!(path = %path.display(), "Could not determine file size");
        return None;
    }
    let size = query.file_size()?;
    if args.offset > size {
        warn!(path = %path.display(), offset = args.offset, size, "Offset past end of file");
        return None;
    }
    Some(size - args.offset)
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so the JSON report on stdout stays parseable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
