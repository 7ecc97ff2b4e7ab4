//! Checkpoints: the stack-overflow check at method entry and the async
//! event poll at backward branches, after monitor enters, allocations and
//! native calls.
//!
//! Both share one watermark. Raising an async flag replaces a thread's
//! overflow mark with a sentinel no stack pointer can satisfy, so the next
//! method entry takes the slow path and polls; the other checkpoints poll
//! the flags directly.

use tracing::{debug, error, warn};

use super::action::BytecodeAction;
use super::frame::{
    A0_INVISIBLE_TAG, build_special_frame, frame_tags, method_frame_bp, restore_method_frame,
    restore_special_frame, sync_object,
};
use super::exception::ThrowableKind;
use super::threads::{
    ASYNC_HALT_FOR_SAFEPOINT, ASYNC_INTERRUPT, ASYNC_POP_FRAMES, ASYNC_STOP,
};
use super::vm_thread::VmThread;
use crate::config::GrowthPolicy;

impl VmThread {
    /// Watermark the stack pointer must stay at or above. The reserved
    /// area becomes usable while a stack overflow is being thrown.
    fn real_overflow_mark(&self) -> usize {
        let reserved = if self.handling_overflow {
            0
        } else {
            self.vm.config.stack.reserved_words
        };
        self.ctx.stack.base() + reserved
    }

    pub(crate) fn reset_overflow_mark(&self) {
        self.shared.set_overflow_mark(self.real_overflow_mark());
    }

    /// Make room for `words` more stack slots. Returns the action to take
    /// instead of proceeding, if any.
    #[inline]
    pub(crate) fn check_stack(&mut self, words: usize) -> Option<BytecodeAction> {
        if self.ctx.sp.saturating_sub(words) >= self.shared.overflow_mark() {
            return None;
        }
        self.check_stack_slow(words)
    }

    fn check_stack_slow(&mut self, words: usize) -> Option<BytecodeAction> {
        if self.shared.async_flags() != 0 {
            match self.process_async_events(false) {
                BytecodeAction::ExecuteBytecode => {}
                action => return Some(action),
            }
        }
        if self.ctx.sp.saturating_sub(words) >= self.real_overflow_mark() {
            self.reset_overflow_mark();
            return None;
        }
        if self.grow_stack(words) {
            self.reset_overflow_mark();
            return None;
        }
        if self.handling_overflow {
            error!(
                thread = %self.shared.name,
                capacity = self.ctx.stack.capacity(),
                "stack overflow while handling a stack overflow"
            );
            std::process::abort();
        }
        debug!(
            thread = %self.shared.name,
            depth = self.ctx.depth(),
            "stack overflow"
        );
        self.handling_overflow = true;
        self.reset_overflow_mark();
        Some(BytecodeAction::ThrowStackOverflow)
    }

    fn grow_stack(&mut self, words: usize) -> bool {
        let config = &self.vm.config.stack;
        if config.growth == GrowthPolicy::FailFast {
            return false;
        }
        let capacity = self.ctx.stack.capacity();
        let needed = self.ctx.stack.used(self.ctx.sp) + words + config.reserved_words + 1;
        let new_capacity = (capacity + config.increment_words).max(needed).min(config.max_words);
        if new_capacity <= capacity || new_capacity < needed {
            return false;
        }
        match self.vm.stack_provider.grow(&mut self.ctx.stack, new_capacity) {
            Ok(()) => {
                debug!(
                    thread = %self.shared.name,
                    from = capacity,
                    to = self.ctx.stack.capacity(),
                    "stack grown"
                );
                self.ctx.stack.capacity() >= needed
            }
            Err(e) => {
                warn!(thread = %self.shared.name, error = %e, "stack growth failed");
                false
            }
        }
    }

    /// The overflow has been caught; the reserved area is free again.
    pub(crate) fn end_overflow_handling(&mut self) {
        if self.handling_overflow {
            self.handling_overflow = false;
            self.reset_overflow_mark();
        }
    }

    /// Act on pending async flags. Frame pops are honored only where the
    /// caller allows them and the VM runs with `debug_interpreter`.
    pub(crate) fn process_async_events(&mut self, allow_pop_frames: bool) -> BytecodeAction {
        let bp = build_special_frame(&mut self.ctx, 0);
        let flags = self.shared.take_flags(
            ASYNC_HALT_FOR_SAFEPOINT | ASYNC_STOP | ASYNC_INTERRUPT | ASYNC_POP_FRAMES,
        );
        let mut action = BytecodeAction::ExecuteBytecode;

        if flags & ASYNC_HALT_FOR_SAFEPOINT != 0 {
            self.safepoint();
        }
        if flags & ASYNC_STOP != 0 {
            if let Some(request) = self.shared.take_stop_request() {
                debug!(thread = %self.shared.name, kind = ?request.kind, "stop request");
                self.exception = self.create_exception(request.kind, request.message);
                action = BytecodeAction::ThrowCurrentException;
            }
        }
        if flags & ASYNC_POP_FRAMES != 0 && action == BytecodeAction::ExecuteBytecode {
            if allow_pop_frames && self.vm.config.debug_interpreter {
                action = BytecodeAction::PopFrames;
            } else {
                debug!(thread = %self.shared.name, "frame pop request ignored");
            }
        }

        restore_special_frame(&mut self.ctx, bp);
        self.reset_overflow_mark();
        action
    }

    /// Pop the current interpreted frame and re-execute the invoke that
    /// called it. A frame called from a special frame is left alone.
    pub(crate) fn pop_frames(&mut self) -> BytecodeAction {
        let Some(method) = self.current_method() else {
            return BytecodeAction::ExecuteBytecode;
        };
        let a0 = self.ctx.a0;
        let bp = method_frame_bp(&method, a0);
        let (_, caller_pc, _) = super::frame::saved_registers(&self.ctx, bp);
        if caller_pc < super::frame::PC_BIAS {
            debug!(method = %method.full_name(), "cannot pop a frame called from native code");
            return BytecodeAction::ExecuteBytecode;
        }
        if method.is_synchronized() && frame_tags(&self.ctx, bp) & A0_INVISIBLE_TAG == 0 {
            let object = sync_object(&self.ctx, &method, a0);
            if let Err(action) = self.monitor_exit(object) {
                return action;
            }
        }
        restore_method_frame(&mut self.ctx, &method, a0);
        debug!(method = %method.full_name(), "frame popped");
        BytecodeAction::ExecuteBytecode
    }

    /// Ask this thread to throw `kind` at its next checkpoint.
    pub fn request_stop(&self, kind: ThrowableKind, message: Option<String>) {
        self.shared
            .request_stop(super::threads::StopRequest { kind, message });
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{GrowthPolicy, RuntimeConfig};
    use crate::vm::action::BytecodeAction;
    use crate::vm::stack::{JavaStack, StackGrowError, StackSegmentProvider};
    use crate::vm::threads::{ASYNC_INTERRUPT, OVERFLOW_MARK_ASYNC};
    use crate::vm::vm::JavaVM;

    struct RefusingProvider;

    impl StackSegmentProvider for RefusingProvider {
        fn grow(&self, _: &mut JavaStack, words: usize) -> Result<(), StackGrowError> {
            Err(StackGrowError::AllocationFailed { words })
        }
    }

    fn config() -> RuntimeConfig {
        let mut config = RuntimeConfig::for_testing();
        config.stack.initial_words = 1024;
        config.stack.max_words = 4096;
        config.stack.increment_words = 1024;
        config.stack.reserved_words = 64;
        config
    }

    #[test]
    fn test_crossing_grows_the_stack() {
        let vm = JavaVM::new(config()).unwrap();
        let mut thread = vm.attach_thread("t");
        thread.ctx.sp -= 900;
        assert_eq!(thread.check_stack(100), None);
        assert!(thread.ctx.stack.capacity() >= 2048);
        assert!(!thread.handling_overflow);
        thread.ctx.sp += 900;
    }

    #[test]
    fn test_fail_fast_throws_once_then_uses_reserve() {
        let mut config = config();
        config.stack.growth = GrowthPolicy::FailFast;
        let vm = JavaVM::new(config).unwrap();
        let mut thread = vm.attach_thread("t");
        thread.ctx.sp -= 900;
        assert_eq!(thread.check_stack(100), Some(BytecodeAction::ThrowStackOverflow));
        assert!(thread.handling_overflow);
        // The reserved area is now usable.
        assert_eq!(thread.check_stack(100), None);
        thread.end_overflow_handling();
        assert_eq!(thread.check_stack(100), Some(BytecodeAction::ThrowStackOverflow));
        thread.end_overflow_handling();
        thread.ctx.sp += 900;
    }

    #[test]
    fn test_failed_growth_throws() {
        let vm = JavaVM::new_with(config(), None, Box::new(RefusingProvider)).unwrap();
        let mut thread = vm.attach_thread("t");
        thread.ctx.sp -= 1000;
        assert_eq!(thread.check_stack(10), Some(BytecodeAction::ThrowStackOverflow));
        assert_eq!(thread.ctx.stack.capacity(), 1024);
        thread.end_overflow_handling();
        thread.ctx.sp += 1000;
    }

    #[test]
    fn test_interrupt_flag_does_not_pin_the_sentinel() {
        let vm = JavaVM::new(config()).unwrap();
        let mut thread = vm.attach_thread("t");
        thread.shared.interrupt();
        assert_eq!(thread.shared.overflow_mark(), OVERFLOW_MARK_ASYNC);
        assert_eq!(thread.check_stack(4), None);
        assert_ne!(thread.shared.overflow_mark(), OVERFLOW_MARK_ASYNC);
        assert_eq!(thread.shared.async_flags() & ASYNC_INTERRUPT, 0);
        assert!(thread.shared.is_interrupted());
    }

    #[test]
    fn test_stop_request_becomes_pending_exception() {
        let vm = JavaVM::new(config()).unwrap();
        let mut thread = vm.attach_thread("t");
        thread.request_stop(crate::vm::exception::ThrowableKind::ThreadDeath, None);
        let start = thread.ctx.sp;
        assert_eq!(thread.check_stack(4), Some(BytecodeAction::ThrowCurrentException));
        assert_eq!(thread.ctx.sp, start);
        let thrown = thread.describe_exception(thread.exception);
        assert_eq!(thrown.class_name, "java/lang/ThreadDeath");
    }
}
