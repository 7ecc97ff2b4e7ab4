//! Throwables the engine raises on its own, exception objects and the
//! unwinder.
//!
//! Unwinding walks the Java stack from the top. Interpreted frames are
//! searched for a covering handler and popped otherwise; special frames
//! that need no processing are popped; a call-in boundary, a J2I frame or
//! a compiled frame stops the walk and hands the pending exception to
//! whoever owns that boundary.

use std::sync::Arc;

use tracing::{debug, trace};

use super::action::BytecodeAction;
use super::class::Class;
use super::constant_pool::CpEntry;
use super::frame::{
    A0_REPORT_FRAME_POP_TAG, FrameType, operand_stack_base, restore_any_special_frame,
    restore_method_frame, sync_object,
};
use super::heap::HeapObject;
use super::method::Method;
use super::value::ObjectRef;
use super::vm_thread::VmThread;
use crate::error::ThrownException;

/// Throwable classes known to the engine. Each is a bootstrap class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrowableKind {
    Throwable,
    Exception,
    RuntimeException,
    Error,
    NullPointerException,
    ArithmeticException,
    IndexOutOfBoundsException,
    ArrayIndexOutOfBoundsException,
    ArrayStoreException,
    ClassCastException,
    NegativeArraySizeException,
    IllegalArgumentException,
    IllegalMonitorStateException,
    IdentityException,
    WrongMethodTypeException,
    UnsupportedOperationException,
    InterruptedException,
    LinkageError,
    IncompatibleClassChangeError,
    AbstractMethodError,
    IllegalAccessError,
    NoSuchFieldError,
    NoSuchMethodError,
    InstantiationError,
    UnsatisfiedLinkError,
    NoClassDefFoundError,
    ExceptionInInitializerError,
    VirtualMachineError,
    StackOverflowError,
    OutOfMemoryError,
    InternalError,
    ThreadDeath,
}

impl ThrowableKind {
    /// Every kind, supertypes before subtypes.
    pub const ALL: [ThrowableKind; 32] = [
        ThrowableKind::Throwable,
        ThrowableKind::Exception,
        ThrowableKind::RuntimeException,
        ThrowableKind::Error,
        ThrowableKind::NullPointerException,
        ThrowableKind::ArithmeticException,
        ThrowableKind::IndexOutOfBoundsException,
        ThrowableKind::ArrayIndexOutOfBoundsException,
        ThrowableKind::ArrayStoreException,
        ThrowableKind::ClassCastException,
        ThrowableKind::NegativeArraySizeException,
        ThrowableKind::IllegalArgumentException,
        ThrowableKind::IllegalMonitorStateException,
        ThrowableKind::IdentityException,
        ThrowableKind::WrongMethodTypeException,
        ThrowableKind::UnsupportedOperationException,
        ThrowableKind::InterruptedException,
        ThrowableKind::LinkageError,
        ThrowableKind::IncompatibleClassChangeError,
        ThrowableKind::AbstractMethodError,
        ThrowableKind::IllegalAccessError,
        ThrowableKind::NoSuchFieldError,
        ThrowableKind::NoSuchMethodError,
        ThrowableKind::InstantiationError,
        ThrowableKind::UnsatisfiedLinkError,
        ThrowableKind::NoClassDefFoundError,
        ThrowableKind::ExceptionInInitializerError,
        ThrowableKind::VirtualMachineError,
        ThrowableKind::StackOverflowError,
        ThrowableKind::OutOfMemoryError,
        ThrowableKind::InternalError,
        ThrowableKind::ThreadDeath,
    ];

    pub fn class_name(self) -> &'static str {
        match self {
            ThrowableKind::Throwable => "java/lang/Throwable",
            ThrowableKind::Exception => "java/lang/Exception",
            ThrowableKind::RuntimeException => "java/lang/RuntimeException",
            ThrowableKind::Error => "java/lang/Error",
            ThrowableKind::NullPointerException => "java/lang/NullPointerException",
            ThrowableKind::ArithmeticException => "java/lang/ArithmeticException",
            ThrowableKind::IndexOutOfBoundsException => "java/lang/IndexOutOfBoundsException",
            ThrowableKind::ArrayIndexOutOfBoundsException => {
                "java/lang/ArrayIndexOutOfBoundsException"
            }
            ThrowableKind::ArrayStoreException => "java/lang/ArrayStoreException",
            ThrowableKind::ClassCastException => "java/lang/ClassCastException",
            ThrowableKind::NegativeArraySizeException => "java/lang/NegativeArraySizeException",
            ThrowableKind::IllegalArgumentException => "java/lang/IllegalArgumentException",
            ThrowableKind::IllegalMonitorStateException => {
                "java/lang/IllegalMonitorStateException"
            }
            ThrowableKind::IdentityException => "java/lang/IdentityException",
            ThrowableKind::WrongMethodTypeException => {
                "java/lang/invoke/WrongMethodTypeException"
            }
            ThrowableKind::UnsupportedOperationException => {
                "java/lang/UnsupportedOperationException"
            }
            ThrowableKind::InterruptedException => "java/lang/InterruptedException",
            ThrowableKind::LinkageError => "java/lang/LinkageError",
            ThrowableKind::IncompatibleClassChangeError => {
                "java/lang/IncompatibleClassChangeError"
            }
            ThrowableKind::AbstractMethodError => "java/lang/AbstractMethodError",
            ThrowableKind::IllegalAccessError => "java/lang/IllegalAccessError",
            ThrowableKind::NoSuchFieldError => "java/lang/NoSuchFieldError",
            ThrowableKind::NoSuchMethodError => "java/lang/NoSuchMethodError",
            ThrowableKind::InstantiationError => "java/lang/InstantiationError",
            ThrowableKind::UnsatisfiedLinkError => "java/lang/UnsatisfiedLinkError",
            ThrowableKind::NoClassDefFoundError => "java/lang/NoClassDefFoundError",
            ThrowableKind::ExceptionInInitializerError => "java/lang/ExceptionInInitializerError",
            ThrowableKind::VirtualMachineError => "java/lang/VirtualMachineError",
            ThrowableKind::StackOverflowError => "java/lang/StackOverflowError",
            ThrowableKind::OutOfMemoryError => "java/lang/OutOfMemoryError",
            ThrowableKind::InternalError => "java/lang/InternalError",
            ThrowableKind::ThreadDeath => "java/lang/ThreadDeath",
        }
    }

    /// Direct superclass kind; `None` for `Throwable` (whose superclass is
    /// `java/lang/Object`).
    pub fn super_kind(self) -> Option<ThrowableKind> {
        use ThrowableKind::*;
        Some(match self {
            Throwable => return None,
            Exception | Error => Throwable,
            RuntimeException | InterruptedException => Exception,
            NullPointerException
            | ArithmeticException
            | IndexOutOfBoundsException
            | ArrayStoreException
            | ClassCastException
            | NegativeArraySizeException
            | IllegalArgumentException
            | IllegalMonitorStateException
            | IdentityException
            | WrongMethodTypeException
            | UnsupportedOperationException => RuntimeException,
            ArrayIndexOutOfBoundsException => IndexOutOfBoundsException,
            LinkageError | VirtualMachineError | ThreadDeath => Error,
            IncompatibleClassChangeError
            | UnsatisfiedLinkError
            | NoClassDefFoundError
            | ExceptionInInitializerError => LinkageError,
            AbstractMethodError
            | IllegalAccessError
            | NoSuchFieldError
            | NoSuchMethodError
            | InstantiationError => IncompatibleClassChangeError,
            StackOverflowError | OutOfMemoryError | InternalError => VirtualMachineError,
        })
    }

    pub fn from_class_name(name: &str) -> Option<ThrowableKind> {
        Self::ALL.iter().copied().find(|k| k.class_name() == name)
    }
}

/// Where an unwind stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindTarget {
    /// An interpreted handler; execution continues at `handler_pc`.
    Handler { handler_pc: usize },
    /// A call-in boundary. The embedder (or native caller) gets the
    /// exception.
    CallIn,
    /// A compiled frame or the J2I frame below one. Compiled code pops its
    /// own frames.
    Compiled,
}

impl VmThread {
    // =========================================================================
    // Creation
    // =========================================================================

    /// A new exception of `kind` with its stack trace captured.
    pub(crate) fn create_exception(
        &mut self,
        kind: ThrowableKind,
        message: Option<String>,
    ) -> ObjectRef {
        let class = self.vm.throwable_class(kind);
        self.create_throwable(&class, message, ObjectRef::NULL)
    }

    /// Instantiate throwable `class` without running a constructor. Never
    /// fails for lack of heap: exceptions bypass the allocation limit so
    /// that `OutOfMemoryError` itself can be raised.
    pub(crate) fn create_throwable(
        &mut self,
        class: &Arc<Class>,
        message: Option<String>,
        cause: ObjectRef,
    ) -> ObjectRef {
        let message = match message {
            Some(text) => self.allocate_unchecked(self.vm.string_object(text)),
            None => ObjectRef::NULL,
        };
        let object = HeapObject::instance(Arc::clone(class));
        let layout = self.vm.throwable_layout();
        object.set_field(layout.message_slot, message.to_word());
        object.set_field(layout.cause_slot, cause.to_word());
        let _ = object.stack_trace.set(self.capture_stack_trace());
        self.allocate_unchecked(object)
    }

    /// Exception class and message of `exception`, for reporting.
    pub fn describe_exception(&self, exception: ObjectRef) -> ThrownException {
        let Some(object) = self.vm.heap.get(exception) else {
            return ThrownException {
                class_name: "<collected>".to_string(),
                message: None,
                stack_trace: Vec::new(),
            };
        };
        let layout = self.vm.throwable_layout();
        let message = self
            .vm
            .heap
            .get(ObjectRef::from_word(object.field(layout.message_slot)))
            .and_then(|m| m.as_str().map(str::to_string));
        ThrownException {
            class_name: object.class.name.clone(),
            message,
            stack_trace: object
                .stack_trace()
                .unwrap_or_default()
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// Take the pending exception, leaving none.
    pub(crate) fn take_exception(&mut self) -> ObjectRef {
        std::mem::replace(&mut self.exception, ObjectRef::NULL)
    }

    // =========================================================================
    // Throw
    // =========================================================================

    /// Run a throw action: create the exception it names, if any, then
    /// unwind. Continues at a handler or leaves the run loop.
    pub(crate) fn throw(&mut self, action: BytecodeAction) -> BytecodeAction {
        if let Some((kind, message)) = action.exception_to_create() {
            self.exception = self.create_exception(kind, message);
        }
        if self.exception.is_null() {
            self.exception = self.create_exception(
                ThrowableKind::InternalError,
                Some("throw without a pending exception".to_string()),
            );
        }
        match self.unwind() {
            UnwindTarget::Handler { .. } => BytecodeAction::ExecuteBytecode,
            UnwindTarget::CallIn | UnwindTarget::Compiled => BytecodeAction::ExitInterpreter,
        }
    }

    /// Pop frames until a handler for the pending exception is found or a
    /// boundary frame is on top.
    pub(crate) fn unwind(&mut self) -> UnwindTarget {
        let mut exception_class = self.vm.heap.get(self.exception).map(|o| Arc::clone(&o.class));
        loop {
            if self.ctx.in_special_frame() {
                match FrameType::from_pc(self.ctx.pc) {
                    Some(FrameType::CallIn) | Some(FrameType::EndOfStack) | None => {
                        debug!(exception = ?self.exception, "exception reached call-in boundary");
                        return UnwindTarget::CallIn;
                    }
                    Some(FrameType::J2I) | Some(FrameType::Compiled) => {
                        return UnwindTarget::Compiled;
                    }
                    Some(_) => {
                        restore_any_special_frame(&mut self.ctx);
                        continue;
                    }
                }
            }
            let Some(method) = self.current_method() else {
                return UnwindTarget::CallIn;
            };
            let a0 = self.ctx.a0;
            self.ctx.sp = operand_stack_base(&method, a0);

            if let Some(handler_pc) = self.find_handler(&method, exception_class.as_deref()) {
                trace!(
                    method = %method.full_name(),
                    pc = self.ctx.bytecode_pc(),
                    handler_pc,
                    "exception caught"
                );
                let exception = self.take_exception();
                self.ctx.push_ref(exception);
                self.ctx.set_bytecode_pc(handler_pc);
                self.end_overflow_handling();
                return UnwindTarget::Handler { handler_pc };
            }

            if method.is_synchronized() {
                let object = sync_object(&self.ctx, &method, a0);
                // A failed exit replaces the exception being propagated.
                if let Err(action) = self.monitor_exit(object) {
                    if let Some((kind, message)) = action.exception_to_create() {
                        debug!(method = %method.full_name(), ?kind, "monitor exit failed during unwind");
                        self.exception = self.create_exception(kind, message);
                        exception_class =
                            self.vm.heap.get(self.exception).map(|o| Arc::clone(&o.class));
                    }
                }
            }
            let tags = restore_method_frame(&mut self.ctx, &method, a0);
            if tags & A0_REPORT_FRAME_POP_TAG != 0 {
                self.record_frame_pop(&method, true);
            }
        }
    }

    /// Handler in `method` covering the current pc that accepts
    /// `exception_class`. Catch types that were never loaded cannot match
    /// and are not resolved here.
    fn find_handler(&self, method: &Method, exception_class: Option<&Class>) -> Option<usize> {
        let pc = self.ctx.bytecode_pc();
        let class = self.vm.class(method.class_id)?;
        method
            .exception_table
            .iter()
            .filter(|h| h.covers(pc))
            .find(|h| {
                if h.catch_type == 0 {
                    return true;
                }
                let catch_class = match class.constant_pool.get(h.catch_type) {
                    Some(CpEntry::Class { name, resolved }) => resolved
                        .get()
                        .cloned()
                        .or_else(|| self.vm.class_by_name(name)),
                    _ => None,
                };
                match (exception_class, catch_class) {
                    (Some(thrown), Some(catch)) => thrown.is_subtype_of(&catch),
                    _ => false,
                }
            })
            .map(|h| h.handler_pc as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_reaches_throwable() {
        for kind in ThrowableKind::ALL {
            let mut current = kind;
            let mut steps = 0;
            while let Some(parent) = current.super_kind() {
                current = parent;
                steps += 1;
                assert!(steps < 8, "cycle above {:?}", kind);
            }
            assert_eq!(current, ThrowableKind::Throwable);
        }
    }

    #[test]
    fn test_supertypes_listed_first() {
        for (i, kind) in ThrowableKind::ALL.iter().enumerate() {
            if let Some(parent) = kind.super_kind() {
                let parent_pos = ThrowableKind::ALL.iter().position(|k| *k == parent).unwrap();
                assert!(parent_pos < i, "{:?} listed before its superclass", kind);
            }
        }
    }

    #[test]
    fn test_class_name_lookup() {
        assert_eq!(
            ThrowableKind::from_class_name("java/lang/StackOverflowError"),
            Some(ThrowableKind::StackOverflowError)
        );
        assert_eq!(
            ThrowableKind::WrongMethodTypeException.class_name(),
            "java/lang/invoke/WrongMethodTypeException"
        );
        assert_eq!(ThrowableKind::from_class_name("demo/Missing"), None);
    }
}
