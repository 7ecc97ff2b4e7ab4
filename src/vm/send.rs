//! `RunMethod`: entering the method staged by an invoke.
//!
//! The staged method's run target decides how: interpreted methods get a
//! frame, compiled ones go through the i2j bridge, natives are bound and
//! called with VM access released, and unusable targets throw from a
//! describing frame so the trace names the method that failed.

use std::sync::Arc;

use tracing::{debug, trace};

use super::action::BytecodeAction;
use super::exception::ThrowableKind;
use super::frame::{
    A0_INVISIBLE_TAG, FrameType, METHOD_FRAME_WORDS, build_method_frame,
    build_method_special_frame, method_frame_bp, restore_method_frame,
    restore_method_special_frame, set_frame_tags,
};
use super::method::Method;
use super::run_target::{CountOutcome, RunState, SendTarget};
use super::native::NativeEnv;
use super::value::{JValue, ObjectRef};
use super::vm_thread::VmThread;

impl VmThread {
    pub(crate) fn run_method(&mut self) -> BytecodeAction {
        let Some(method) = self.send_method.take() else {
            return BytecodeAction::linkage(ThrowableKind::InternalError, "no method staged");
        };
        let outcome = if std::mem::take(&mut self.send_precounted) {
            match method.run_target.load() {
                RunState::Compiled(entry) => CountOutcome::Compiled(entry),
                RunState::Send(SendTarget::Interpreted | SendTarget::Compiling)
                | RunState::Counting(_) => CountOutcome::Interpret,
                RunState::Send(target) => CountOutcome::Send(target),
            }
        } else {
            method.run_target.count_invocation()
        };

        match outcome {
            CountOutcome::Interpret => self.enter_interpreted(&method),
            CountOutcome::TriggerCompile => match self.compile_method(&method) {
                Some(_) => {
                    self.send_method = Some(method);
                    BytecodeAction::I2JTransition
                }
                None => self.enter_interpreted(&method),
            },
            CountOutcome::Compiled(_) => {
                self.send_method = Some(method);
                BytecodeAction::I2JTransition
            }
            CountOutcome::Send(target) => self.send(&method, target),
        }
    }

    fn send(&mut self, method: &Arc<Method>, target: SendTarget) -> BytecodeAction {
        match target {
            SendTarget::Interpreted | SendTarget::Compiling => self.enter_interpreted(method),
            SendTarget::BindNative => self.bind_native(method),
            SendTarget::RunNative => self.run_native(method),
            SendTarget::UnsatisfiedOrAbstract => self.throw_describing(
                method,
                ThrowableKind::AbstractMethodError,
                format!("{}.{}{}", method.class_name.replace('/', "."), method.name, method.descriptor),
            ),
            SendTarget::DefaultConflict => self.throw_describing(
                method,
                ThrowableKind::IncompatibleClassChangeError,
                format!(
                    "Conflicting default methods: {}.{}",
                    method.class_name.replace('/', "."),
                    method.name
                ),
            ),
            SendTarget::InvokeHandle => self.throw_describing(
                method,
                ThrowableKind::UnsupportedOperationException,
                "cannot reflectively invoke MethodHandle".to_string(),
            ),
        }
    }

    /// Throw from a frame naming `method`, its arguments still on the
    /// caller's operand stack.
    fn throw_describing(&mut self, method: &Method, kind: ThrowableKind, message: String) -> BytecodeAction {
        let bp = build_method_special_frame(&mut self.ctx, FrameType::Method, method.id, 0, 0);
        self.exception = self.create_exception(kind, Some(message));
        restore_method_special_frame(&mut self.ctx, bp);
        BytecodeAction::ThrowCurrentException
    }

    /// Push an interpreter frame for `method`, whose arguments are on the
    /// operand stack. Synchronized methods hold the frame invisible until
    /// their monitor is entered.
    pub(crate) fn enter_interpreted(&mut self, method: &Arc<Method>) -> BytecodeAction {
        if let Some(action) = self.check_stack(method.stack_use()) {
            return action;
        }
        if !method.is_synchronized() {
            build_method_frame(&mut self.ctx, method, ObjectRef::NULL, 0);
            trace!(method = %method.full_name(), "enter");
            return BytecodeAction::ExecuteBytecode;
        }

        let object = match self.sync_target(method) {
            Ok(object) => object,
            Err(action) => return action,
        };
        let a0 = build_method_frame(&mut self.ctx, method, object, A0_INVISIBLE_TAG);
        if let Err(action) = self.monitor_enter(object) {
            restore_method_frame(&mut self.ctx, method, a0);
            return action;
        }
        set_frame_tags(&mut self.ctx, method_frame_bp(method, a0), 0);
        trace!(method = %method.full_name(), "enter synchronized");
        BytecodeAction::CheckAsync
    }

    /// Monitor object of a synchronized call: the receiver, or the class
    /// mirror for static methods.
    fn sync_target(&mut self, method: &Method) -> Result<ObjectRef, BytecodeAction> {
        if method.is_static() {
            let class = self.vm.class(method.class_id).ok_or_else(|| {
                BytecodeAction::linkage(ThrowableKind::NoClassDefFoundError, &method.class_name)
            })?;
            self.class_mirror(&class)
        } else {
            Ok(self.ctx.peek_ref(method.arg_slots - 1))
        }
    }

    // =========================================================================
    // Natives
    // =========================================================================

    fn bind_native(&mut self, method: &Arc<Method>) -> BytecodeAction {
        let Some(native) = self.vm.natives.lookup(method) else {
            return self.throw_describing(
                method,
                ThrowableKind::UnsatisfiedLinkError,
                format!("'{}'", method.full_name().replace('/', ".")),
            );
        };
        let _ = method.native.set(native);
        let _ = method.run_target.compare_exchange(
            RunState::Send(SendTarget::BindNative),
            RunState::Send(SendTarget::RunNative),
        );
        debug!(method = %method.full_name(), "native bound");
        self.run_native(method)
    }

    /// Arguments of a native call, read from the operand stack without
    /// popping them.
    fn native_arguments(&self, method: &Method) -> Vec<JValue> {
        let a0 = self.ctx.sp + method.arg_slots - 1;
        let mut args = Vec::with_capacity(method.signature.args.len() + 1);
        let mut slot = 0;
        if !method.is_static() {
            args.push(JValue::Ref(ObjectRef::from_word(self.ctx.stack.read(a0))));
            slot = 1;
        }
        for ty in &method.signature.args {
            let ret = ty.return_type();
            let width = ret.slots();
            let word = self.ctx.stack.read(a0 - slot - (width - 1));
            args.push(JValue::from_word(ret, word));
            slot += width;
        }
        args
    }

    fn run_native(&mut self, method: &Arc<Method>) -> BytecodeAction {
        let Some(native) = method.native.get().cloned() else {
            return self.bind_native(method);
        };
        if let Some(action) = self.check_stack(METHOD_FRAME_WORDS) {
            return action;
        }
        let args = self.native_arguments(method);
        let monitor = if method.is_synchronized() {
            let object = match self.sync_target(method) {
                Ok(object) => object,
                Err(action) => return action,
            };
            if let Err(action) = self.monitor_enter(object) {
                return action;
            }
            Some(object)
        } else {
            None
        };

        let bp = build_method_special_frame(&mut self.ctx, FrameType::NativeMethod, method.id, 0, 0);
        let local_refs = self.temp_roots.len();
        self.native_frames += 1;
        self.release_access();
        trace!(method = %method.full_name(), "native call");
        let result = {
            let mut env = NativeEnv::new(self, Arc::clone(method));
            native(&mut env, &args)
        };
        self.ensure_access();
        self.native_frames -= 1;
        self.temp_roots.truncate(local_refs);
        restore_method_special_frame(&mut self.ctx, bp);

        if let Some(object) = monitor {
            if let Err(action) = self.monitor_exit(object) {
                return action;
            }
        }
        if !self.exception.is_null() {
            return BytecodeAction::ThrowCurrentException;
        }
        self.ctx.sp += method.arg_slots;
        let ret = method.return_type();
        if ret.slots() > 0 {
            let (words, _) = result.to_slots();
            if ret.slots() == 2 {
                self.ctx.push_wide(words[0]);
            } else {
                self.ctx.push(words[0]);
            }
        }
        match self.resume_caller() {
            BytecodeAction::ExecuteBytecode => BytecodeAction::CheckAsync,
            other => other,
        }
    }
}
