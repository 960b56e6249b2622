//! Request and Handle Model
//!
//! A [`RequestHandle`] is a cheap, clonable reference to one streaming
//! operation. The caller keeps a clone to poll status, attach a completion
//! callback or wait; the engine keeps its own clone while the request is
//! queued or running. The request is dropped once both sides let go.
//!
//! # Lifecycle
//!
//! ```text
//! create ──► Pending ──► queue ──► processing thread ──► Completed
//!                                                     ├─► Failed
//!                                                     └─► Canceled
//! ```
//!
//! The status leaves `Pending` exactly once. The completion callback runs
//! after the terminal status is visible and waiters are released after the
//! callback has returned.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::error;

use crate::error::{Error, Result};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Priority / Deadline / Status
// =============================================================================

/// Scheduling priority. Higher priorities are dispatched first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Medium,
    High,
    Highest,
}

impl Priority {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Priority::Lowest => "lowest",
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Highest => "highest",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lowest" => Ok(Priority::Lowest),
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "highest" => Ok(Priority::Highest),
            other => Err(Error::Validation(format!("unknown priority '{}'", other))),
        }
    }
}

/// How soon a request should complete.
///
/// Deadlines only influence dispatch order; a request that misses its
/// deadline still runs to completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Deadline {
    /// Ahead of any time-based deadline
    Immediate,
    /// Due this long after the request is queued
    Within(Duration),
    /// No deadline; ordered after every other deadline
    #[default]
    None,
}

impl Deadline {
    /// Resolve to an absolute ordering key relative to `queued_at`.
    pub(crate) fn resolve(self, queued_at: Instant) -> DeadlineKey {
        match self {
            Deadline::Immediate => DeadlineKey::Immediate,
            Deadline::Within(d) => DeadlineKey::At(queued_at + d),
            Deadline::None => DeadlineKey::Never,
        }
    }
}

/// Absolute deadline used for ordering. Variant order is the sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum DeadlineKey {
    Immediate,
    At(Instant),
    Never,
}

/// Status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestStatus {
    Pending = 0,
    Completed = 1,
    Failed = 2,
    Canceled = 3,
}

impl RequestStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RequestStatus::Completed,
            2 => RequestStatus::Failed,
            3 => RequestStatus::Canceled,
            _ => RequestStatus::Pending,
        }
    }

    /// Whether the status can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Parameters of a read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCommand {
    /// File to read
    pub path: PathBuf,
    /// Byte offset within the (uncompressed) file
    pub offset: u64,
    /// Number of bytes requested
    pub size: u64,
}

/// What a request asks the engine to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestCommand {
    /// Read a byte range into the request's output buffer
    Read(ReadCommand),
    /// Drop every evictable cached block, open handle and cached file size
    FlushCaches,
    /// Drop cached state for one file
    FlushFile(PathBuf),
    /// Start caching a file in its own dedicated cache
    CreateDedicatedCache(PathBuf),
    /// Tear down a file's dedicated cache
    DestroyDedicatedCache(PathBuf),
    /// Check whether a file exists
    FileExists(PathBuf),
    /// Retrieve a file's size
    FileSize(PathBuf),
}

impl RequestCommand {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            RequestCommand::Read(_) => "read",
            RequestCommand::FlushCaches => "flush_caches",
            RequestCommand::FlushFile(_) => "flush_file",
            RequestCommand::CreateDedicatedCache(_) => "create_dedicated_cache",
            RequestCommand::DestroyDedicatedCache(_) => "destroy_dedicated_cache",
            RequestCommand::FileExists(_) => "file_exists",
            RequestCommand::FileSize(_) => "file_size",
        }
    }

    /// The file this command targets, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            RequestCommand::Read(read) => Some(&read.path),
            RequestCommand::FlushCaches => None,
            RequestCommand::FlushFile(path)
            | RequestCommand::CreateDedicatedCache(path)
            | RequestCommand::DestroyDedicatedCache(path)
            | RequestCommand::FileExists(path)
            | RequestCommand::FileSize(path) => Some(path),
        }
    }
}

/// Answer to a metadata query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryAnswer {
    Exists(bool),
    Size(u64),
}

// =============================================================================
// Handle
// =============================================================================

/// Completion callback signature.
pub type CompletionCallback = Box<dyn FnOnce(&RequestHandle) + Send + 'static>;

enum CallbackSlot {
    Empty,
    Armed(CompletionCallback),
    Delivered,
}

struct RequestShared {
    id: u64,
    command: RequestCommand,
    priority: Priority,
    deadline: Deadline,
    status: AtomicU8,
    cancel_requested: AtomicBool,
    queued: AtomicBool,
    output: Mutex<Option<Vec<u8>>>,
    bytes_read: AtomicU64,
    answer: Mutex<Option<QueryAnswer>>,
    estimated_completion: Mutex<Option<Instant>>,
    callback: Mutex<CallbackSlot>,
    settled: Mutex<bool>,
    settled_cv: Condvar,
    settled_flag: AtomicBool,
    notify: Notify,
}

/// Reference-counted handle to a streaming request.
#[derive(Clone)]
pub struct RequestHandle {
    shared: Arc<RequestShared>,
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.shared.id)
            .field("command", &self.shared.command.name())
            .field("priority", &self.shared.priority)
            .field("status", &self.status())
            .finish()
    }
}

impl RequestHandle {
    fn new(
        command: RequestCommand,
        output: Option<Vec<u8>>,
        priority: Priority,
        deadline: Deadline,
    ) -> Self {
        Self {
            shared: Arc::new(RequestShared {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                command,
                priority,
                deadline,
                status: AtomicU8::new(RequestStatus::Pending as u8),
                cancel_requested: AtomicBool::new(false),
                queued: AtomicBool::new(false),
                output: Mutex::new(output),
                bytes_read: AtomicU64::new(0),
                answer: Mutex::new(None),
                estimated_completion: Mutex::new(None),
                callback: Mutex::new(CallbackSlot::Empty),
                settled: Mutex::new(false),
                settled_cv: Condvar::new(),
                settled_flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Create a read request.
    ///
    /// `output.len()` is the buffer capacity and must be at least `size`.
    /// The range is not checked against the file size here; that happens
    /// when the device opens the file.
    pub fn read(
        path: impl Into<PathBuf>,
        output: Vec<u8>,
        size: u64,
        deadline: Deadline,
        priority: Priority,
        offset: u64,
    ) -> Result<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(Error::Validation("read path must not be empty".into()));
        }
        let capacity = output.len() as u64;
        if capacity < size {
            return Err(Error::Validation(format!(
                "buffer capacity {} is smaller than requested size {}",
                capacity, size
            )));
        }
        if offset.checked_add(size).is_none() {
            return Err(Error::Validation(format!(
                "read range {}+{} overflows",
                offset, size
            )));
        }
        let command = RequestCommand::Read(ReadCommand { path, offset, size });
        Ok(Self::new(command, Some(output), priority, deadline))
    }

    /// Create a non-read request.
    pub(crate) fn control(command: RequestCommand, priority: Priority, deadline: Deadline) -> Self {
        debug_assert!(!matches!(command, RequestCommand::Read(_)));
        Self::new(command, None, priority, deadline)
    }

    /// Unique request id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The command this request carries.
    pub fn command(&self) -> &RequestCommand {
        &self.shared.command
    }

    /// Scheduling priority.
    pub fn priority(&self) -> Priority {
        self.shared.priority
    }

    /// Scheduling deadline.
    pub fn deadline(&self) -> Deadline {
        self.shared.deadline
    }

    /// Current status.
    pub fn status(&self) -> RequestStatus {
        RequestStatus::from_u8(self.shared.status.load(Ordering::Acquire))
    }

    /// Number of bytes delivered into the output buffer.
    pub fn bytes_read(&self) -> u64 {
        self.shared.bytes_read.load(Ordering::Acquire)
    }

    /// Result of a completed `FileExists` request.
    pub fn file_exists(&self) -> Option<bool> {
        match *self.shared.answer.lock() {
            Some(QueryAnswer::Exists(exists)) => Some(exists),
            _ => None,
        }
    }

    /// Result of a completed `FileSize` request.
    pub fn file_size(&self) -> Option<u64> {
        match *self.shared.answer.lock() {
            Some(QueryAnswer::Size(size)) => Some(size),
            _ => None,
        }
    }

    /// Take the output buffer back once the request has finished.
    ///
    /// Returns `None` while the request is still pending, for requests
    /// without a buffer, and on every call after the first.
    pub fn take_output(&self) -> Option<Vec<u8>> {
        if !self.status().is_terminal() {
            return None;
        }
        self.shared.output.lock().take()
    }

    /// Attach the completion callback.
    ///
    /// The callback runs once on the processing thread after the terminal
    /// status is set. If the request has already finished it runs right
    /// away on the calling thread. A callback attached before completion
    /// replaces any earlier one.
    pub fn set_completion_callback<F>(&self, callback: F)
    where
        F: FnOnce(&RequestHandle) + Send + 'static,
    {
        let mut slot = self.shared.callback.lock();
        if matches!(*slot, CallbackSlot::Delivered) {
            drop(slot);
            callback(self);
            return;
        }
        *slot = CallbackSlot::Armed(Box::new(callback));
    }

    /// Block until the request finishes and its callback has run.
    pub fn wait(&self) -> RequestStatus {
        let mut settled = self.shared.settled.lock();
        while !*settled {
            self.shared.settled_cv.wait(&mut settled);
        }
        self.status()
    }

    /// Block until the request finishes or `timeout` elapses.
    ///
    /// Returns the status observed at return, which is `Pending` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> RequestStatus {
        let deadline = Instant::now() + timeout;
        let mut settled = self.shared.settled.lock();
        while !*settled {
            if self
                .shared
                .settled_cv
                .wait_until(&mut settled, deadline)
                .timed_out()
            {
                break;
            }
        }
        self.status()
    }

    /// Wait asynchronously until the request finishes and its callback has run.
    pub async fn wait_async(&self) -> RequestStatus {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.settled_flag.load(Ordering::Acquire) {
                return self.status();
            }
            notified.await;
        }
    }

    // -------------------------------------------------------------------------
    // Engine side
    /// When the engine expects this request to finish.
    ///
    /// Refreshed by the processing thread while the request waits, from the
    /// measured cost of the requests ahead of it. `None` until the request
    /// has been queued and seen by the engine.
    pub fn estimated_completion(&self) -> Option<Instant> {
        *self.shared.estimated_completion.lock()
    }

    // -------------------------------------------------------------------------

    /// Whether two handles refer to the same request.
    pub fn ptr_eq(&self, other: &RequestHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Mark as queued. Returns false if it was queued before.
    pub(crate) fn mark_queued(&self) -> bool {
        !self.shared.queued.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.shared.queued.load(Ordering::Acquire)
    }

    pub(crate) fn set_estimated_completion(&self, at: Instant) {
        *self.shared.estimated_completion.lock() = Some(at);
    }

    pub(crate) fn request_cancel(&self) {
        self.shared.cancel_requested.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.shared.cancel_requested.load(Ordering::Acquire)
    }

    /// Borrow the output buffer out of the request for processing.
    pub(crate) fn take_buffer_for_processing(&self) -> Option<Vec<u8>> {
        self.shared.output.lock().take()
    }

    /// Return the output buffer after processing.
    pub(crate) fn restore_buffer(&self, buffer: Vec<u8>, bytes_read: u64) {
        self.shared.bytes_read.store(bytes_read, Ordering::Release);
        *self.shared.output.lock() = Some(buffer);
    }

    pub(crate) fn set_answer(&self, answer: QueryAnswer) {
        *self.shared.answer.lock() = Some(answer);
    }

    /// Move to a terminal status, run the callback and release waiters.
    ///
    /// Returns false if the request had already finished, in which case
    /// nothing happens.
    pub(crate) fn finish(&self, status: RequestStatus) -> bool {
        debug_assert!(status.is_terminal());
        if self
            .shared
            .status
            .compare_exchange(
                RequestStatus::Pending as u8,
                status as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        let callback = {
            let mut slot = self.shared.callback.lock();
            match std::mem::replace(&mut *slot, CallbackSlot::Delivered) {
                CallbackSlot::Armed(callback) => Some(callback),
                _ => None,
            }
        };
        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(self))).is_err() {
                error!(request_id = self.shared.id, "Completion callback panicked");
            }
        }

        *self.shared.settled.lock() = true;
        self.shared.settled_flag.store(true, Ordering::Release);
        self.shared.settled_cv.notify_all();
        self.shared.notify.notify_waiters();
        true
    }
}

// =============================================================================
// Batch
// =============================================================================

/// An ordered group of requests queued together.
///
/// Batching only saves submission overhead; ordering is still decided by
/// each request's priority and deadline.
#[derive(Debug, Default, Clone)]
pub struct RequestBatch {
    requests: Vec<RequestHandle>,
}

impl RequestBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty batch with room for `capacity` requests
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            requests: Vec::with_capacity(capacity),
        }
    }

    /// Append a request
    pub fn push(&mut self, request: RequestHandle) {
        self.requests.push(request);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RequestHandle> {
        self.requests.iter()
    }
}

impl IntoIterator for RequestBatch {
    type Item = RequestHandle;
    type IntoIter = std::vec::IntoIter<RequestHandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.requests.into_iter()
    }
}

impl FromIterator<RequestHandle> for RequestBatch {
    fn from_iter<I: IntoIterator<Item = RequestHandle>>(iter: I) -> Self {
        Self {
            requests: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn read_handle() -> RequestHandle {
        RequestHandle::read("data.bin", vec![0u8; 16], 16, Deadline::Immediate, Priority::Medium, 0)
            .unwrap()
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Highest > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Low > Priority::Lowest);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_deadline_key_ordering() {
        let now = Instant::now();
        let immediate = Deadline::Immediate.resolve(now);
        let soon = Deadline::Within(Duration::from_millis(5)).resolve(now);
        let later = Deadline::Within(Duration::from_secs(5)).resolve(now);
        let never = Deadline::None.resolve(now);
        assert!(immediate < soon);
        assert!(soon < later);
        assert!(later < never);
    }

    #[test]
    fn test_capacity_smaller_than_size_rejected() {
        let err = RequestHandle::read("a.bin", vec![0u8; 8], 16, Deadline::None, Priority::Low, 0)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_capacity_may_exceed_size() {
        let handle =
            RequestHandle::read("a.bin", vec![0u8; 32], 16, Deadline::None, Priority::Low, 0)
                .unwrap();
        assert_eq!(handle.status(), RequestStatus::Pending);
        assert!(handle.take_output().is_none());
    }

    #[test]
    fn test_overflowing_range_rejected() {
        let err =
            RequestHandle::read("a.bin", vec![0u8; 4], 4, Deadline::None, Priority::Low, u64::MAX)
                .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_status_is_monotonic() {
        let handle = read_handle();
        assert!(handle.finish(RequestStatus::Completed));
        assert!(!handle.finish(RequestStatus::Failed));
        assert!(!handle.finish(RequestStatus::Canceled));
        assert_eq!(handle.status(), RequestStatus::Completed);
    }

    #[test]
    fn test_callback_fires_once_after_status() {
        let handle = read_handle();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));

        let c = Arc::clone(&calls);
        let s = Arc::clone(&seen);
        handle.set_completion_callback(move |h| {
            c.fetch_add(1, Ordering::SeqCst);
            *s.lock() = Some(h.status());
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handle.finish(RequestStatus::Failed);
        handle.finish(RequestStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), Some(RequestStatus::Failed));
    }

    #[test]
    fn test_late_callback_fires_immediately() {
        let handle = read_handle();
        handle.finish(RequestStatus::Completed);

        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        handle.set_completion_callback(move |h| {
            assert_eq!(h.status(), RequestStatus::Completed);
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_replaced_callback_only_latest_runs() {
        let handle = read_handle();
        let calls = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&calls);
        handle.set_completion_callback(move |_| {
            first.fetch_add(100, Ordering::SeqCst);
        });
        let second = Arc::clone(&calls);
        handle.set_completion_callback(move |_| {
            second.fetch_add(1, Ordering::SeqCst);
        });
        handle.finish(RequestStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_timeout_on_pending() {
        let handle = read_handle();
        let status = handle.wait_timeout(Duration::from_millis(20));
        assert_eq!(status, RequestStatus::Pending);
    }

    #[test]
    fn test_wait_across_threads() {
        let handle = read_handle();
        let worker = handle.clone();
        let join = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            worker.finish(RequestStatus::Completed);
        });
        assert_eq!(handle.wait(), RequestStatus::Completed);
        join.join().unwrap();
    }

    #[test]
    fn test_wait_async_after_finish() {
        let handle = read_handle();
        handle.finish(RequestStatus::Canceled);
        let status = tokio_test::block_on(handle.wait_async());
        assert_eq!(status, RequestStatus::Canceled);
    }

    #[test]
    fn test_buffer_roundtrip_through_processing() {
        let handle = read_handle();
        let mut buffer = handle.take_buffer_for_processing().unwrap();
        buffer[0] = 42;
        handle.restore_buffer(buffer, 16);
        handle.finish(RequestStatus::Completed);

        assert_eq!(handle.bytes_read(), 16);
        let output = handle.take_output().unwrap();
        assert_eq!(output[0], 42);
        assert!(handle.take_output().is_none());
    }

    #[test]
    fn test_mark_queued_once() {
        let handle = read_handle();
        assert!(handle.mark_queued());
        assert!(!handle.clone().mark_queued());
    }

    #[test]
    fn test_batch_preserves_order() {
        let a = read_handle();
        let b = read_handle();
        let batch: RequestBatch = vec![a.clone(), b.clone()].into_iter().collect();
        assert_eq!(batch.len(), 2);
        let ids: Vec<u64> = batch.into_iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec![a.id(), b.id()]);
    }
}
