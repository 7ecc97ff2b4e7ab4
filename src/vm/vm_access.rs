//! The cooperative VM access token.
//!
//! Threads running Java code hold shared access. A thread that needs the
//! world stopped (a collection) asks for exclusive access: new shared
//! acquisitions block, running threads are asked to halt at their next
//! checkpoint, and the requester proceeds once every shared holder has
//! released. Threads release around natives and blocking operations so
//! they never hold up an exclusive request while parked.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct AccessState {
    shared: usize,
    exclusive_requested: bool,
    exclusive_held: bool,
}

#[derive(Debug, Default)]
pub struct VmAccess {
    state: Mutex<AccessState>,
    changed: Condvar,
}

impl VmAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_shared(&self) {
        let mut state = self.state.lock();
        while state.exclusive_requested || state.exclusive_held {
            self.changed.wait(&mut state);
        }
        state.shared += 1;
    }

    pub fn release_shared(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.shared > 0);
        state.shared -= 1;
        self.changed.notify_all();
    }

    /// Take exclusive access. The caller must not hold shared access.
    /// `request_halt` is called once the request is registered, to ask the
    /// running threads to reach a checkpoint.
    pub fn acquire_exclusive(&self, request_halt: impl FnOnce()) {
        let mut state = self.state.lock();
        while state.exclusive_requested || state.exclusive_held {
            self.changed.wait(&mut state);
        }
        state.exclusive_requested = true;
        drop(state);
        request_halt();
        let mut state = self.state.lock();
        while state.shared > 0 {
            self.changed.wait(&mut state);
        }
        state.exclusive_requested = false;
        state.exclusive_held = true;
    }

    pub fn release_exclusive(&self) {
        let mut state = self.state.lock();
        state.exclusive_held = false;
        self.changed.notify_all();
    }

    pub fn shared_holders(&self) -> usize {
        self.state.lock().shared
    }

    /// Whether an exclusive request is waiting or active.
    pub fn exclusive_pending(&self) -> bool {
        let state = self.state.lock();
        state.exclusive_requested || state.exclusive_held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_exclusive_waits_for_shared_release() {
        let access = Arc::new(VmAccess::new());
        access.acquire_shared();
        let acquired = Arc::new(AtomicBool::new(false));

        let handle = {
            let access = Arc::clone(&access);
            let acquired = Arc::clone(&acquired);
            std::thread::spawn(move || {
                access.acquire_exclusive(|| {});
                acquired.store(true, Ordering::SeqCst);
                access.release_exclusive();
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst));
        assert!(access.exclusive_pending());
        access.release_shared();
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(access.shared_holders(), 0);
    }

    #[test]
    fn test_shared_blocks_during_exclusive() {
        let access = Arc::new(VmAccess::new());
        access.acquire_exclusive(|| {});
        let entered = Arc::new(AtomicBool::new(false));
        let handle = {
            let access = Arc::clone(&access);
            let entered = Arc::clone(&entered);
            std::thread::spawn(move || {
                access.acquire_shared();
                entered.store(true, Ordering::SeqCst);
                access.release_shared();
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!entered.load(Ordering::SeqCst));
        access.release_exclusive();
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}
