//! Scheduler
//!
//! Public entry point of the engine. Callers submit requests through a
//! channel; a single processing thread orders them and runs each through
//! the [`StreamStack`].
//!
//! # Ordering
//!
//! 1. Priority, highest first
//! 2. Deadline: `Immediate`, then earliest due time, then no deadline
//! 3. Submission order
//!
//! Cache control requests (flushes, dedicated cache changes) are queued as
//! `Immediate`, so at equal priority they keep their place relative to the
//! reads submitted around them.
//!
//! # Processing Loop
//!
//! ```text
//!   queue() ──► channel ──► ingest ──► ready heap ──► StreamStack ──► finish
//!                              ▲                                    │
//!                              └── suspended / idle: recv_timeout ◄─┘
//! ```
//!
//! Suspension is checked between requests. While suspended or idle the
//! thread blocks on the channel for at most `idle_wait`, so arrivals and
//! cancellations are still ingested.
//!
//! Whenever the ready set changes, every waiting request gets an estimated
//! completion time: the requests ahead of it in dispatch order, costed from
//! the moving averages in [`StreamerStats`].

use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::compression::{CompressionProvider, CompressionRegistry};
use super::device::{FileIo, LocalFileIo};
use super::request::{
    Deadline, DeadlineKey, Priority, RequestBatch, RequestCommand, RequestHandle, RequestStatus,
};
use super::stack::StreamStack;
use super::stats::{StreamerStats, StreamerStatsSnapshot};
use crate::config::StreamerConfig;
use crate::error::{Error, Result};

// =============================================================================
// Messages / Ready Set
// =============================================================================

enum Message {
    Queue(Vec<(RequestHandle, DeadlineKey)>),
    Cancel(RequestHandle),
    Wake,
}

struct Ready {
    priority: Priority,
    deadline: DeadlineKey,
    seq: u64,
    request: RequestHandle,
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    // Max-heap: the greatest entry runs next
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.deadline.cmp(&self.deadline))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared {
    suspended: AtomicBool,
    shutdown: AtomicBool,
    /// Held shared by senders and exclusively while raising `shutdown`, so
    /// no message can enter the channel after the final drain.
    gate: RwLock<()>,
    stats: Arc<StreamerStats>,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Streamer`].
pub struct StreamerBuilder {
    config: StreamerConfig,
    file_io: Option<Arc<dyn FileIo>>,
    compression: CompressionRegistry,
}

impl Default for StreamerBuilder {
    fn default() -> Self {
        Self {
            config: StreamerConfig::default(),
            file_io: None,
            compression: CompressionRegistry::new(),
        }
    }
}

impl StreamerBuilder {
    pub fn config(mut self, config: StreamerConfig) -> Self {
        self.config = config;
        self
    }

    /// Backend used by the device layer. Defaults to [`LocalFileIo`].
    pub fn file_io(mut self, io: Arc<dyn FileIo>) -> Self {
        self.file_io = Some(io);
        self
    }

    /// Register a compression provider. Providers are consulted in the
    /// order they are registered.
    pub fn compression_provider(mut self, provider: Arc<dyn CompressionProvider>) -> Self {
        self.compression.register(provider);
        self
    }

    /// Validate the configuration and start the processing thread.
    pub fn build(self) -> Result<Streamer> {
        self.config.validate()?;
        let io = self.file_io.unwrap_or_else(|| Arc::new(LocalFileIo::new()));
        let stats = Arc::new(StreamerStats::new());
        let shared = Arc::new(Shared {
            suspended: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            gate: RwLock::new(()),
            stats: Arc::clone(&stats),
        });

        let (sender, receiver) = channel::unbounded();
        let processor = Processor {
            receiver,
            shared: Arc::clone(&shared),
            stack: StreamStack::new(&self.config, io, self.compression, stats),
            ready: BinaryHeap::new(),
            next_seq: 0,
            idle_wait: self.config.idle_wait,
            estimates_stale: false,
        };

        let thread = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || processor.run())?;

        info!(
            thread = %self.config.thread_name,
            global_blocks = self.config.global_cache_blocks(),
            global_block_size = self.config.global_block_size,
            "Streamer started"
        );

        Ok(Streamer {
            sender,
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }
}

// =============================================================================
// Streamer
// =============================================================================

/// The streaming engine.
///
/// All methods are callable from any thread and never block on I/O.
pub struct Streamer {
    sender: Sender<Message>,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Streamer {
    /// Start an engine over the local filesystem.
    pub fn new(config: StreamerConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> StreamerBuilder {
        StreamerBuilder::default()
    }

    /// Create a read request. Nothing is queued until [`queue`](Self::queue).
    pub fn create_read(
        &self,
        path: impl Into<PathBuf>,
        output: Vec<u8>,
        size: u64,
        deadline: Deadline,
        priority: Priority,
        offset: u64,
    ) -> Result<RequestHandle> {
        RequestHandle::read(path, output, size, deadline, priority, offset)
    }

    pub fn create_batch(&self) -> RequestBatch {
        RequestBatch::new()
    }

    /// Submit one request.
    pub fn queue(&self, request: &RequestHandle) {
        self.submit(std::iter::once(request.clone()).collect());
    }

    /// Submit every request of a batch in one message.
    pub fn queue_batch(&self, batch: &RequestBatch) {
        self.submit(batch.iter().cloned().collect());
    }

    fn submit(&self, requests: Vec<RequestHandle>) {
        let now = Instant::now();
        let mut accepted = Vec::with_capacity(requests.len());
        for request in requests {
            if !request.mark_queued() {
                warn!(request_id = request.id(), "Request queued twice, ignoring");
                continue;
            }
            let key = request.deadline().resolve(now);
            accepted.push((request, key));
        }
        if accepted.is_empty() {
            return;
        }
        let count = accepted.len() as u64;

        // Callbacks of rejected requests run after the gate is released
        let rejected = {
            let _gate = self.shared.gate.read();
            if self.shared.shutdown.load(Ordering::Acquire) {
                Some(accepted)
            } else {
                match self.sender.send(Message::Queue(accepted)) {
                    Ok(()) => {
                        self.shared.stats.record_queued(count);
                        None
                    }
                    Err(channel::SendError(Message::Queue(rejected))) => Some(rejected),
                    Err(_) => None,
                }
            }
        };
        if let Some(rejected) = rejected {
            Self::reject(rejected);
        }
    }

    fn reject(requests: Vec<(RequestHandle, DeadlineKey)>) {
        warn!(count = requests.len(), "Streamer is shut down, canceling requests");
        for (request, _) in requests {
            request.finish(RequestStatus::Canceled);
        }
    }

    /// Cancel a request.
    ///
    /// A request that has not started is canceled by the processing thread.
    /// A request whose device read is in flight is canceled once the read
    /// returns. A finished request is left alone.
    pub fn cancel(&self, request: &RequestHandle) {
        if request.status().is_terminal() {
            return;
        }
        request.request_cancel();

        let delivered = {
            let _gate = self.shared.gate.read();
            if self.shared.shutdown.load(Ordering::Acquire) {
                // A queued request is canceled by the final drain
                request.is_queued()
            } else {
                self.sender.send(Message::Cancel(request.clone())).is_ok()
            }
        };
        if !delivered {
            request.finish(RequestStatus::Canceled);
        }
    }

    /// Stop dispatching requests. Queued requests stay pending.
    pub fn suspend_processing(&self) {
        if !self.shared.suspended.swap(true, Ordering::AcqRel) {
            info!("Processing suspended");
        }
    }

    /// Resume dispatching after [`suspend_processing`](Self::suspend_processing).
    pub fn resume_processing(&self) {
        if self.shared.suspended.swap(false, Ordering::AcqRel) {
            info!("Processing resumed");
            let _ = self.sender.send(Message::Wake);
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Acquire)
    }

    fn queue_control(
        &self,
        command: RequestCommand,
        priority: Priority,
        deadline: Deadline,
    ) -> RequestHandle {
        let request = RequestHandle::control(command, priority, deadline);
        self.queue(&request);
        request
    }

    /// Give `path` its own cache. Creating one that exists succeeds without effect.
    pub fn create_dedicated_cache(&self, path: impl Into<PathBuf>) -> RequestHandle {
        self.queue_control(
            RequestCommand::CreateDedicatedCache(path.into()),
            Priority::Highest,
            Deadline::Immediate,
        )
    }

    /// Drop the cache of `path`. Destroying a missing cache succeeds without effect.
    pub fn destroy_dedicated_cache(&self, path: impl Into<PathBuf>) -> RequestHandle {
        self.queue_control(
            RequestCommand::DestroyDedicatedCache(path.into()),
            Priority::Highest,
            Deadline::Immediate,
        )
    }

    /// Empty every cache, the handle cache and the metadata cache.
    ///
    /// Runs after requests of the same priority queued before it and ahead
    /// of those queued after it.
    pub fn flush_caches(&self, priority: Priority) -> RequestHandle {
        self.queue_control(RequestCommand::FlushCaches, priority, Deadline::Immediate)
    }

    /// Drop cached blocks, the open handle and the cached size of one file.
    pub fn flush_file(&self, path: impl Into<PathBuf>, priority: Priority) -> RequestHandle {
        self.queue_control(RequestCommand::FlushFile(path.into()), priority, Deadline::Immediate)
    }

    /// Ask whether a file exists. The answer is on [`RequestHandle::file_exists`].
    pub fn file_exists(&self, path: impl Into<PathBuf>, priority: Priority) -> RequestHandle {
        self.queue_control(RequestCommand::FileExists(path.into()), priority, Deadline::None)
    }

    /// Ask for a file's size. The answer is on [`RequestHandle::file_size`].
    pub fn file_size(&self, path: impl Into<PathBuf>, priority: Priority) -> RequestHandle {
        self.queue_control(RequestCommand::FileSize(path.into()), priority, Deadline::None)
    }

    pub fn stats(&self) -> StreamerStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Stop the processing thread. Requests still queued are canceled.
    pub fn shutdown(&self) {
        {
            let _gate = self.shared.gate.write();
            if self.shared.shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        let _ = self.sender.send(Message::Wake);

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        // A completion callback dropping the last reference runs on the
        // processing thread itself
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("Processing thread panicked");
        }
        info!("Streamer stopped");
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Processing Thread
// =============================================================================

struct Processor {
    receiver: Receiver<Message>,
    shared: Arc<Shared>,
    stack: StreamStack,
    ready: BinaryHeap<Ready>,
    next_seq: u64,
    idle_wait: Duration,
    estimates_stale: bool,
}

impl Processor {
    fn run(mut self) {
        debug!("Processing thread running");
        loop {
            if !self.drain() || self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            if self.estimates_stale {
                self.update_estimates();
            }

            if self.shared.suspended.load(Ordering::Acquire) || self.ready.is_empty() {
                match self.receiver.recv_timeout(self.idle_wait) {
                    Ok(message) => self.handle(message),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            }

            if let Some(next) = self.ready.pop() {
                self.process(next);
                self.estimates_stale = true;
            }
        }
        self.cancel_remaining();
        debug!("Processing thread exiting");
    }

    /// Ingest everything waiting on the channel. Returns false once every
    /// sender is gone.
    fn drain(&mut self) -> bool {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => self.handle(message),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Queue(requests) => {
                for (request, deadline) in requests {
                    if request.is_cancel_requested() {
                        self.finish(&request, RequestStatus::Canceled);
                        continue;
                    }
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.ready.push(Ready {
                        priority: request.priority(),
                        deadline,
                        seq,
                        request,
                    });
                    self.estimates_stale = true;
                }
            }
            Message::Cancel(request) => {
                let before = self.ready.len();
                self.ready.retain(|entry| !entry.request.ptr_eq(&request));
                if self.ready.len() != before {
                    debug!(request_id = request.id(), "Canceled queued request");
                    self.estimates_stale = true;
                }
                self.finish(&request, RequestStatus::Canceled);
            }
            Message::Wake => {}
        }
    }

    /// Walk the ready set in dispatch order and stamp each request with
    /// the time it is expected to finish.
    fn update_estimates(&mut self) {
        self.estimates_stale = false;
        let mut pending: Vec<&Ready> = self.ready.iter().collect();
        pending.sort_unstable_by(|a, b| b.cmp(a));

        let stats = &self.shared.stats;
        let mut at = Instant::now();
        for entry in pending {
            at += stats.estimate(entry.request.command());
            entry.request.set_estimated_completion(at);
        }
    }

    fn process(&mut self, entry: Ready) {
        let Ready {
            request, deadline, ..
        } = entry;
        if request.status().is_terminal() {
            return;
        }
        if request.is_cancel_requested() {
            self.finish(&request, RequestStatus::Canceled);
            return;
        }

        let started = Instant::now();
        let stats = &self.shared.stats;
        request.set_estimated_completion(started + stats.estimate(request.command()));

        let stack = &mut self.stack;
        let status = match panic::catch_unwind(AssertUnwindSafe(|| stack.execute(&request))) {
            Ok(Ok(())) => RequestStatus::Completed,
            Ok(Err(e)) if e.is_canceled() => {
                debug!(request_id = request.id(), "Request canceled in flight");
                RequestStatus::Canceled
            }
            Ok(Err(e)) => {
                log_failure(&request, &e);
                RequestStatus::Failed
            }
            Err(payload) => {
                error!(
                    request_id = request.id(),
                    command = request.command().name(),
                    panic = %panic_message(payload.as_ref()),
                    "Request panicked"
                );
                RequestStatus::Failed
            }
        };

        let finished = Instant::now();
        if status == RequestStatus::Completed {
            match request.command() {
                RequestCommand::Read(_) => {
                    stats.record_read_time(request.bytes_read(), finished - started)
                }
                RequestCommand::FileExists(_) | RequestCommand::FileSize(_) => {
                    stats.record_query_time(finished - started)
                }
                _ => {}
            }
        }
        if let DeadlineKey::At(due) = deadline {
            if finished > due && status != RequestStatus::Canceled {
                debug!(
                    request_id = request.id(),
                    late_ms = (finished - due).as_millis() as u64,
                    "Request finished past its deadline"
                );
                stats.record_deadline_missed();
            }
        }
        self.finish(&request, status);
    }

    fn finish(&self, request: &RequestHandle, status: RequestStatus) {
        if request.finish(status) {
            self.shared.stats.record_finished(status);
        }
    }

    fn cancel_remaining(&mut self) {
        while let Ok(message) = self.receiver.try_recv() {
            self.handle(message);
        }
        let remaining = self.ready.len();
        for entry in self.ready.drain() {
            if entry.request.finish(RequestStatus::Canceled) {
                self.shared.stats.record_finished(RequestStatus::Canceled);
            }
        }
        if remaining > 0 {
            info!(remaining, "Canceled queued requests on shutdown");
        }
    }
}

fn log_failure(request: &RequestHandle, err: &Error) {
    let id = request.id();
    let command = request.command().name();
    let path = request
        .command()
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    match err {
        Error::CacheConsistency(_) | Error::Internal(_) => {
            error!(request_id = id, command, %path, error = %err, "Request failed")
        }
        _ => warn!(request_id = id, command, %path, error = %err, "Request failed"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streamer::device::MemoryFileIo;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(5);

    fn streamer(io: &MemoryFileIo) -> Streamer {
        let config = StreamerConfig {
            global_block_size: 1024,
            global_cache_capacity: 256 * 1024,
            idle_wait: Duration::from_millis(2),
            ..Default::default()
        };
        Streamer::builder()
            .config(config)
            .file_io(Arc::new(io.clone()))
            .build()
            .unwrap()
    }

    fn ready(priority: Priority, deadline: DeadlineKey, seq: u64) -> Ready {
        let request = RequestHandle::control(RequestCommand::FlushCaches, priority, Deadline::None);
        Ready {
            priority,
            deadline,
            seq,
            request,
        }
    }

    #[test]
    fn test_ready_ordering() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(ready(Priority::Low, DeadlineKey::Immediate, 0));
        heap.push(ready(Priority::High, DeadlineKey::Never, 1));
        heap.push(ready(Priority::High, DeadlineKey::At(now), 2));
        heap.push(ready(Priority::High, DeadlineKey::Immediate, 3));
        heap.push(ready(Priority::High, DeadlineKey::Immediate, 4));
        heap.push(ready(Priority::High, DeadlineKey::At(now + Duration::from_secs(1)), 5));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|r| r.seq)).collect();
        assert_eq!(order, vec![3, 4, 2, 5, 1, 0]);
    }

    #[test]
    fn test_read_completes() {
        let io = MemoryFileIo::new();
        io.write_file("a", vec![9u8; 3000]);
        let streamer = streamer(&io);

        let request = streamer
            .create_read("a", vec![0u8; 3000], 3000, Deadline::Immediate, Priority::Medium, 0)
            .unwrap();
        streamer.queue(&request);
        assert_eq!(request.wait_timeout(WAIT), RequestStatus::Completed);
        assert_eq!(request.take_output().unwrap(), vec![9u8; 3000]);
        assert_eq!(streamer.stats().requests_completed, 1);
    }

    #[test]
    fn test_missing_file_fails_without_affecting_others() {
        let io = MemoryFileIo::new();
        io.write_file("ok", vec![1u8; 10]);
        let streamer = streamer(&io);

        let bad = streamer
            .create_read("missing", vec![0u8; 10], 10, Deadline::None, Priority::High, 0)
            .unwrap();
        let good = streamer
            .create_read("ok", vec![0u8; 10], 10, Deadline::None, Priority::Low, 0)
            .unwrap();
        streamer.queue(&bad);
        streamer.queue(&good);
        assert_eq!(bad.wait_timeout(WAIT), RequestStatus::Failed);
        assert_eq!(good.wait_timeout(WAIT), RequestStatus::Completed);
    }

    #[test]
    fn test_priority_order_while_suspended() {
        let io = MemoryFileIo::new();
        io.write_file("a", vec![0u8; 100]);
        let streamer = streamer(&io);
        streamer.suspend_processing();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut batch = streamer.create_batch();
        let priorities = [Priority::Low, Priority::Highest, Priority::Medium];
        for (i, priority) in priorities.into_iter().enumerate() {
            let request = streamer
                .create_read("a", vec![0u8; 10], 10, Deadline::None, priority, 0)
                .unwrap();
            let order = Arc::clone(&order);
            request.set_completion_callback(move |_| order.lock().push(i));
            batch.push(request);
        }
        streamer.queue_batch(&batch);
        thread::sleep(Duration::from_millis(50));
        assert!(batch.iter().all(|r| r.status() == RequestStatus::Pending));

        streamer.resume_processing();
        for request in batch.iter() {
            assert_eq!(request.wait_timeout(WAIT), RequestStatus::Completed);
        }
        assert_eq!(*order.lock(), vec![1, 2, 0]);
    }

    #[test]
    fn test_cancel_queued_request() {
        let io = MemoryFileIo::new();
        io.write_file("a", vec![0u8; 100]);
        let streamer = streamer(&io);
        streamer.suspend_processing();

        let request = streamer
            .create_read("a", vec![0u8; 10], 10, Deadline::None, Priority::Medium, 0)
            .unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        request.set_completion_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        streamer.queue(&request);
        streamer.cancel(&request);

        assert_eq!(request.wait_timeout(WAIT), RequestStatus::Canceled);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(io.read_count(), 0);
    }

    #[test]
    fn test_shutdown_cancels_queued() {
        let io = MemoryFileIo::new();
        io.write_file("a", vec![0u8; 100]);
        let streamer = streamer(&io);
        streamer.suspend_processing();

        let request = streamer
            .create_read("a", vec![0u8; 10], 10, Deadline::None, Priority::Medium, 0)
            .unwrap();
        streamer.queue(&request);
        streamer.shutdown();
        assert_eq!(request.status(), RequestStatus::Canceled);

        // Queueing after shutdown cancels immediately
        let late = streamer
            .create_read("a", vec![0u8; 10], 10, Deadline::None, Priority::Medium, 0)
            .unwrap();
        streamer.queue(&late);
        assert_eq!(late.status(), RequestStatus::Canceled);
    }

    #[test]
    fn test_queue_twice_is_ignored() {
        let io = MemoryFileIo::new();
        io.write_file("a", vec![0u8; 100]);
        let streamer = streamer(&io);

        let request = streamer
            .create_read("a", vec![0u8; 10], 10, Deadline::None, Priority::Medium, 0)
            .unwrap();
        streamer.queue(&request);
        streamer.queue(&request);
        assert_eq!(request.wait_timeout(WAIT), RequestStatus::Completed);
        assert_eq!(streamer.stats().requests_queued, 1);
    }

    #[test]
    fn test_panic_in_callback_keeps_thread_alive() {
        let io = MemoryFileIo::new();
        io.write_file("a", vec![0u8; 100]);
        let streamer = streamer(&io);

        let first = streamer
            .create_read("a", vec![0u8; 10], 10, Deadline::None, Priority::Medium, 0)
            .unwrap();
        first.set_completion_callback(|_| panic!("callback failure"));
        streamer.queue(&first);
        assert_eq!(first.wait_timeout(WAIT), RequestStatus::Completed);

        let second = streamer
            .create_read("a", vec![0u8; 10], 10, Deadline::None, Priority::Medium, 0)
            .unwrap();
        streamer.queue(&second);
        assert_eq!(second.wait_timeout(WAIT), RequestStatus::Completed);
    }

    #[test]
    fn test_metadata_queries() {
        let io = MemoryFileIo::new();
        io.write_file("a", vec![0u8; 1234]);
        let streamer = streamer(&io);

        let exists = streamer.file_exists("a", Priority::Medium);
        let missing = streamer.file_exists("b", Priority::Medium);
        let size = streamer.file_size("a", Priority::Medium);
        let bad_size = streamer.file_size("b", Priority::Medium);

        assert_eq!(exists.wait_timeout(WAIT), RequestStatus::Completed);
        assert_eq!(exists.file_exists(), Some(true));
        assert_eq!(missing.wait_timeout(WAIT), RequestStatus::Completed);
        assert_eq!(missing.file_exists(), Some(false));
        assert_eq!(size.wait_timeout(WAIT), RequestStatus::Completed);
        assert_eq!(size.file_size(), Some(1234));
        assert_eq!(bad_size.wait_timeout(WAIT), RequestStatus::Failed);
    }

    #[test]
    fn test_queue_racing_shutdown_leaves_nothing_pending() {
        for _ in 0..20 {
            let io = MemoryFileIo::new();
            io.write_file("a", vec![0u8; 100]);
            let streamer = Arc::new(streamer(&io));
            let barrier = Arc::new(std::sync::Barrier::new(5));

            let submitters: Vec<_> = (0..4)
                .map(|_| {
                    let streamer = Arc::clone(&streamer);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        (0..50)
                            .map(|_| {
                                let request = streamer
                                    .create_read(
                                        "a",
                                        vec![0u8; 10],
                                        10,
                                        Deadline::None,
                                        Priority::Medium,
                                        0,
                                    )
                                    .unwrap();
                                streamer.queue(&request);
                                streamer.cancel(&request);
                                request
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            barrier.wait();
            streamer.shutdown();
            for submitter in submitters {
                for request in submitter.join().unwrap() {
                    assert!(request.status().is_terminal(), "request {} pending", request.id());
                }
            }
        }
    }

    #[test]
    fn test_estimates_follow_dispatch_order() {
        let io = MemoryFileIo::new();
        io.write_file("a", vec![0u8; 64 * 1024]);
        let streamer = streamer(&io);

        // Give the read cost average a sample
        let warm = streamer
            .create_read("a", vec![0u8; 8192], 8192, Deadline::None, Priority::Medium, 0)
            .unwrap();
        streamer.queue(&warm);
        assert_eq!(warm.wait_timeout(WAIT), RequestStatus::Completed);
        assert!(streamer.stats().read_nanos_per_kib > 0);

        streamer.suspend_processing();
        let low = streamer
            .create_read("a", vec![0u8; 32768], 32768, Deadline::None, Priority::Low, 0)
            .unwrap();
        let high = streamer
            .create_read("a", vec![0u8; 32768], 32768, Deadline::None, Priority::High, 0)
            .unwrap();
        assert!(low.estimated_completion().is_none());
        streamer.queue(&low);
        streamer.queue(&high);

        let started = Instant::now();
        while low.estimated_completion().is_none() || high.estimated_completion().is_none() {
            assert!(started.elapsed() < WAIT, "estimates never set");
            thread::sleep(Duration::from_millis(1));
        }
        // Both estimates come from the same pass once both are ingested
        thread::sleep(Duration::from_millis(20));
        let (low_at, high_at) = (low.estimated_completion(), high.estimated_completion());
        assert!(high_at < low_at);

        streamer.resume_processing();
        assert_eq!(high.wait_timeout(WAIT), RequestStatus::Completed);
        assert_eq!(low.wait_timeout(WAIT), RequestStatus::Completed);
    }

    #[test]
    fn test_missed_deadlines_are_counted() {
        let io = MemoryFileIo::new();
        io.write_file("a", vec![0u8; 100]);
        let streamer = streamer(&io);

        let on_time = streamer
            .create_read("a", vec![0u8; 10], 10, Deadline::Immediate, Priority::Medium, 0)
            .unwrap();
        streamer.queue(&on_time);
        assert_eq!(on_time.wait_timeout(WAIT), RequestStatus::Completed);
        assert_eq!(streamer.stats().deadlines_missed, 0);

        let due_now = Deadline::Within(Duration::ZERO);
        let late = streamer
            .create_read("a", vec![0u8; 10], 10, due_now, Priority::Medium, 0)
            .unwrap();
        streamer.queue(&late);
        assert_eq!(late.wait_timeout(WAIT), RequestStatus::Completed);
        assert_eq!(streamer.stats().deadlines_missed, 1);
    }
}
