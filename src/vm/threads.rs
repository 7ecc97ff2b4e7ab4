/// Thread support for the VM.
///
/// This module provides:
/// - The per-thread state other threads may touch (async flags, the
///   stack-overflow watermark, published GC roots)
/// - The registry of attached threads
/// - Join handles for threads started with `JavaVM::spawn`
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use super::exception::ThrowableKind;
use super::value::{JValue, Word};
use crate::error::{VmError, VmResult};

/// Thread ID counter for generating unique IDs.
static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// Generate a new unique thread ID.
    pub(crate) fn next() -> Self {
        ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// =============================================================================
// Async flags
// =============================================================================

/// A stop was requested; throw the recorded throwable.
pub const ASYNC_STOP: u32 = 1 << 0;
/// The thread was interrupted.
pub const ASYNC_INTERRUPT: u32 = 1 << 1;
/// Another thread wants exclusive VM access.
pub const ASYNC_HALT_FOR_SAFEPOINT: u32 = 1 << 2;
/// A debugger asked to pop the top frame.
pub const ASYNC_POP_FRAMES: u32 = 1 << 3;

/// Watermark value that fails every overflow comparison, forcing method
/// entry onto the slow path where async flags are examined.
pub const OVERFLOW_MARK_ASYNC: usize = usize::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopRequest {
    pub kind: ThrowableKind,
    pub message: Option<String>,
}

/// State of one thread shared with the rest of the VM.
#[derive(Debug)]
pub struct ThreadShared {
    pub id: ThreadId,
    pub name: String,
    async_flags: AtomicU32,
    overflow_mark: AtomicUsize,
    interrupted: AtomicBool,
    stop_request: Mutex<Option<StopRequest>>,
    roots: Mutex<Vec<Word>>,
}

impl ThreadShared {
    pub fn new(name: impl Into<String>) -> Self {
        ThreadShared {
            id: ThreadId::next(),
            name: name.into(),
            async_flags: AtomicU32::new(0),
            overflow_mark: AtomicUsize::new(0),
            interrupted: AtomicBool::new(false),
            stop_request: Mutex::new(None),
            roots: Mutex::new(Vec::new()),
        }
    }

    /// Post async `flag` and force the next method entry onto the slow path.
    pub fn raise(&self, flag: u32) {
        self.async_flags.fetch_or(flag, Ordering::AcqRel);
        self.overflow_mark.store(OVERFLOW_MARK_ASYNC, Ordering::Release);
    }

    #[inline]
    pub fn async_flags(&self) -> u32 {
        self.async_flags.load(Ordering::Acquire)
    }

    /// Clear and return the pending flags in `mask`.
    pub fn take_flags(&self, mask: u32) -> u32 {
        self.async_flags.fetch_and(!mask, Ordering::AcqRel) & mask
    }

    #[inline]
    pub fn overflow_mark(&self) -> usize {
        self.overflow_mark.load(Ordering::Acquire)
    }

    /// Install the real watermark. If a flag was raised concurrently the
    /// sentinel is put back so the event is not lost.
    pub fn set_overflow_mark(&self, mark: usize) {
        self.overflow_mark.store(mark, Ordering::Release);
        if self.async_flags() != 0 {
            self.overflow_mark.store(OVERFLOW_MARK_ASYNC, Ordering::Release);
        }
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.raise(ASYNC_INTERRUPT);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Read and clear the interrupt status.
    pub fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    pub fn request_stop(&self, request: StopRequest) {
        *self.stop_request.lock() = Some(request);
        self.raise(ASYNC_STOP);
    }

    pub fn take_stop_request(&self) -> Option<StopRequest> {
        self.stop_request.lock().take()
    }

    /// Publish the words a collection must treat as roots for this thread.
    pub fn publish_roots(&self, roots: Vec<Word>) {
        *self.roots.lock() = roots;
    }

    pub fn roots(&self) -> Vec<Word> {
        self.roots.lock().clone()
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<ThreadShared>>>,
}

impl ThreadRegistry {
    pub fn register(&self, thread: Arc<ThreadShared>) {
        self.threads.lock().push(thread);
    }

    pub fn unregister(&self, id: ThreadId) {
        self.threads.lock().retain(|t| t.id != id);
    }

    pub fn find(&self, id: ThreadId) -> Option<Arc<ThreadShared>> {
        self.threads.lock().iter().find(|t| t.id == id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<ThreadShared>> {
        self.threads.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raise `flag` on every thread except `except`.
    pub fn raise_all(&self, flag: u32, except: Option<ThreadId>) {
        for thread in self.threads.lock().iter() {
            if Some(thread.id) != except {
                thread.raise(flag);
            }
        }
    }
}

// =============================================================================
// Spawned threads
// =============================================================================

/// A handle to a spawned thread.
pub struct ThreadHandle {
    pub id: ThreadId,
    shared: Arc<ThreadShared>,
    handle: Option<JoinHandle<VmResult<JValue>>>,
}

impl ThreadHandle {
    pub(crate) fn new(shared: Arc<ThreadShared>, handle: JoinHandle<VmResult<JValue>>) -> Self {
        ThreadHandle {
            id: shared.id,
            shared,
            handle: Some(handle),
        }
    }

    /// Wait for the thread to complete and return its result.
    pub fn join(mut self) -> VmResult<JValue> {
        match self.handle.take() {
            Some(h) => h
                .join()
                .map_err(|e| VmError::ThreadPanicked(format!("{:?}", e)))?,
            None => Err(VmError::ThreadPanicked("thread already joined".to_string())),
        }
    }

    pub fn interrupt(&self) {
        self.shared.interrupt();
    }

    /// Ask the thread to throw `kind` at its next checkpoint.
    pub fn stop(&self, kind: ThrowableKind, message: Option<String>) {
        self.shared.request_stop(StopRequest { kind, message });
    }

    pub fn shared(&self) -> &Arc<ThreadShared> {
        &self.shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_forces_slow_path() {
        let thread = ThreadShared::new("t");
        thread.set_overflow_mark(100);
        assert_eq!(thread.overflow_mark(), 100);
        thread.raise(ASYNC_HALT_FOR_SAFEPOINT);
        assert_eq!(thread.overflow_mark(), OVERFLOW_MARK_ASYNC);
        assert_eq!(thread.take_flags(ASYNC_HALT_FOR_SAFEPOINT), ASYNC_HALT_FOR_SAFEPOINT);
        thread.set_overflow_mark(100);
        assert_eq!(thread.overflow_mark(), 100);
    }

    #[test]
    fn test_pending_flag_keeps_sentinel() {
        let thread = ThreadShared::new("t");
        thread.raise(ASYNC_STOP);
        thread.take_flags(ASYNC_INTERRUPT);
        thread.set_overflow_mark(64);
        assert_eq!(thread.overflow_mark(), OVERFLOW_MARK_ASYNC);
    }

    #[test]
    fn test_interrupt_status() {
        let thread = ThreadShared::new("t");
        thread.interrupt();
        assert!(thread.is_interrupted());
        assert_ne!(thread.async_flags() & ASYNC_INTERRUPT, 0);
        assert!(thread.take_interrupted());
        assert!(!thread.is_interrupted());
    }

    #[test]
    fn test_registry_raise_all_skips_caller() {
        let registry = ThreadRegistry::default();
        let a = Arc::new(ThreadShared::new("a"));
        let b = Arc::new(ThreadShared::new("b"));
        registry.register(Arc::clone(&a));
        registry.register(Arc::clone(&b));
        registry.raise_all(ASYNC_HALT_FOR_SAFEPOINT, Some(a.id));
        assert_eq!(a.async_flags(), 0);
        assert_eq!(b.async_flags(), ASYNC_HALT_FOR_SAFEPOINT);
        registry.unregister(b.id);
        assert_eq!(registry.len(), 1);
    }
}
