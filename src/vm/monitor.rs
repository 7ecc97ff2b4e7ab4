//! Object monitors: recursive locks with a wait set.
//!
//! Monitors are inflated on first use and kept in a table keyed by object
//! handle. Entering is split into a non-blocking attempt and a blocking
//! wait so callers can release VM access before they park.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::threads::ThreadId;
use super::value::ObjectRef;

/// How often a waiting thread re-checks its interrupt status.
const WAIT_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorError {
    /// Monitor metadata could not be allocated.
    OutOfMemory,
    /// The current thread does not own the monitor.
    IllegalState,
    /// The object has no identity and cannot be locked.
    Identity,
    /// `wait` was interrupted.
    Interrupted,
}

#[derive(Debug, Default)]
struct MonitorState {
    owner: Option<ThreadId>,
    count: u32,
    /// Threads parked in `enter_blocking`.
    entering: usize,
    waiters: VecDeque<u64>,
    notified: Vec<u64>,
    next_ticket: u64,
}

#[derive(Debug, Default)]
pub struct Monitor {
    state: Mutex<MonitorState>,
    available: Condvar,
    wakeup: Condvar,
}

impl Monitor {
    /// Enter without blocking. Succeeds when free or already owned by
    /// `thread`.
    pub fn try_enter(&self, thread: ThreadId) -> bool {
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(thread);
                state.count = 1;
                true
            }
            Some(owner) if owner == thread => {
                state.count += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Enter, parking until the monitor is free.
    pub fn enter_blocking(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        if state.owner == Some(thread) {
            state.count += 1;
            return;
        }
        state.entering += 1;
        while state.owner.is_some() {
            self.available.wait(&mut state);
        }
        state.entering -= 1;
        state.owner = Some(thread);
        state.count = 1;
    }

    pub fn exit(&self, thread: ThreadId) -> Result<(), MonitorError> {
        let mut state = self.state.lock();
        if state.owner != Some(thread) {
            return Err(MonitorError::IllegalState);
        }
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            self.available.notify_one();
        }
        Ok(())
    }

    /// Release the monitor fully and wait for a notification, the timeout
    /// or an interrupt, then re-enter with the same recursion count.
    pub fn wait(
        &self,
        thread: ThreadId,
        timeout: Option<Duration>,
        interrupted: impl Fn() -> bool,
    ) -> Result<(), MonitorError> {
        let mut state = self.state.lock();
        if state.owner != Some(thread) {
            return Err(MonitorError::IllegalState);
        }
        if interrupted() {
            return Err(MonitorError::Interrupted);
        }
        let saved_count = state.count;
        state.owner = None;
        state.count = 0;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);
        self.available.notify_one();

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut result = Ok(());
        loop {
            if let Some(pos) = state.notified.iter().position(|&t| t == ticket) {
                state.notified.swap_remove(pos);
                break;
            }
            if interrupted() {
                result = Err(MonitorError::Interrupted);
                break;
            }
            let now = Instant::now();
            let slice = match deadline {
                Some(d) if d <= now => break,
                Some(d) => (d - now).min(WAIT_POLL),
                None => WAIT_POLL,
            };
            self.wakeup.wait_for(&mut state, slice);
        }
        state.waiters.retain(|&t| t != ticket);

        while state.owner.is_some() {
            self.available.wait(&mut state);
        }
        state.owner = Some(thread);
        state.count = saved_count;
        result
    }

    pub fn notify(&self, thread: ThreadId) -> Result<(), MonitorError> {
        let mut state = self.state.lock();
        if state.owner != Some(thread) {
            return Err(MonitorError::IllegalState);
        }
        if let Some(ticket) = state.waiters.pop_front() {
            state.notified.push(ticket);
            self.wakeup.notify_all();
        }
        Ok(())
    }

    pub fn notify_all(&self, thread: ThreadId) -> Result<(), MonitorError> {
        let mut state = self.state.lock();
        if state.owner != Some(thread) {
            return Err(MonitorError::IllegalState);
        }
        let woken: Vec<u64> = state.waiters.drain(..).collect();
        state.notified.extend(woken);
        self.wakeup.notify_all();
        Ok(())
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }

    /// Recursion count held by `thread` (0 when not the owner).
    pub fn entry_count(&self, thread: ThreadId) -> u32 {
        let state = self.state.lock();
        if state.owner == Some(thread) {
            state.count
        } else {
            0
        }
    }

    pub fn entering_count(&self) -> usize {
        self.state.lock().entering
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// Inflated monitors by object.
#[derive(Debug)]
pub struct MonitorTable {
    monitors: Mutex<HashMap<ObjectRef, Arc<Monitor>>>,
    limit: Option<usize>,
}

impl MonitorTable {
    pub fn new(limit: Option<usize>) -> Self {
        MonitorTable {
            monitors: Mutex::new(HashMap::new()),
            limit,
        }
    }

    /// The monitor of `object`, inflating it if needed.
    pub fn monitor(&self, object: ObjectRef) -> Result<Arc<Monitor>, MonitorError> {
        let mut monitors = self.monitors.lock();
        if let Some(m) = monitors.get(&object) {
            return Ok(Arc::clone(m));
        }
        if self.limit.is_some_and(|limit| monitors.len() >= limit) {
            return Err(MonitorError::OutOfMemory);
        }
        trace!(?object, "inflating monitor");
        let monitor = Arc::new(Monitor::default());
        monitors.insert(object, Arc::clone(&monitor));
        Ok(monitor)
    }

    /// The monitor of `object` if it was ever inflated.
    pub fn existing(&self, object: ObjectRef) -> Option<Arc<Monitor>> {
        self.monitors.lock().get(&object).cloned()
    }

    /// Drop monitors of objects that died, unless still owned.
    pub fn retain_live(&self, is_live: impl Fn(ObjectRef) -> bool) {
        self.monitors
            .lock()
            .retain(|&r, m| is_live(r) || m.owner().is_some());
    }

    pub fn len(&self) -> usize {
        self.monitors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[test]
    fn test_recursive_enter_exit() {
        let m = Monitor::default();
        let t = ThreadId(1);
        assert!(m.try_enter(t));
        assert!(m.try_enter(t));
        assert_eq!(m.entry_count(t), 2);
        assert!(!m.try_enter(ThreadId(2)));
        m.exit(t).unwrap();
        m.exit(t).unwrap();
        assert_eq!(m.owner(), None);
        assert_eq!(m.exit(t), Err(MonitorError::IllegalState));
    }

    #[test]
    fn test_limit_yields_out_of_memory() {
        let table = MonitorTable::new(Some(1));
        table.monitor(ObjectRef::from_word(1)).unwrap();
        table.monitor(ObjectRef::from_word(1)).unwrap();
        assert_eq!(
            table.monitor(ObjectRef::from_word(2)).unwrap_err(),
            MonitorError::OutOfMemory
        );
    }

    #[test]
    fn test_wait_notify_restores_count() {
        let m = Arc::new(Monitor::default());
        let waiter = ThreadId(1);
        let notifier = ThreadId(2);
        assert!(m.try_enter(waiter));
        assert!(m.try_enter(waiter));

        let handle = {
            let m = Arc::clone(&m);
            std::thread::spawn(move || {
                while m.waiter_count() == 0 {
                    std::thread::yield_now();
                }
                m.enter_blocking(notifier);
                m.notify(notifier).unwrap();
                m.exit(notifier).unwrap();
            })
        };
        m.wait(waiter, None, || false).unwrap();
        assert_eq!(m.entry_count(waiter), 2);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_interrupted() {
        let m = Monitor::default();
        let t = ThreadId(1);
        m.enter_blocking(t);
        let flag = AtomicBool::new(false);
        let polls = AtomicU32::new(0);
        let result = m.wait(t, None, || {
            if polls.fetch_add(1, Ordering::SeqCst) > 2 {
                flag.store(true, Ordering::SeqCst);
            }
            flag.load(Ordering::SeqCst)
        });
        assert_eq!(result, Err(MonitorError::Interrupted));
        assert_eq!(m.entry_count(t), 1);
    }

    #[test]
    fn test_timed_wait_returns() {
        let m = Monitor::default();
        let t = ThreadId(1);
        m.enter_blocking(t);
        m.wait(t, Some(Duration::from_millis(10)), || false).unwrap();
        assert_eq!(m.owner(), Some(t));
    }

    #[test]
    fn test_notify_requires_ownership() {
        let m = Monitor::default();
        assert_eq!(m.notify(ThreadId(1)), Err(MonitorError::IllegalState));
        assert_eq!(m.notify_all(ThreadId(1)), Err(MonitorError::IllegalState));
    }
}
