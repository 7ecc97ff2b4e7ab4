//! The closed set of macro-steps a handler can ask the run loop for.
//!
//! Handlers never jump to each other's continuations: they return one of
//! these and [`VmThread::run`](super::vm_thread::VmThread::run) dispatches
//! on it.

use super::exception::ThrowableKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BytecodeAction {
    /// Fetch and execute the next instruction.
    ExecuteBytecode,
    /// A backward branch was taken: poll for async events, then continue.
    BranchWithAsyncCheck,
    /// Poll for async events at a checkpoint.
    CheckAsync,
    /// Invoke the method staged in the interpreter's send slot.
    RunMethod,
    /// The staged method has compiled code; transfer via the i2j bridge.
    I2JTransition,
    /// Pop the top frame and re-execute the invoke in the caller.
    PopFrames,
    /// An exception object is pending on the thread; unwind.
    ThrowCurrentException,
    ThrowNullPointer,
    ThrowArrayIndexOutOfBounds { index: i32, length: i32 },
    ThrowArrayStore,
    ThrowArithmetic,
    ThrowNegativeArraySize { size: i32 },
    ThrowClassCast { from: String, to: String },
    ThrowIllegalMonitorState,
    /// Synchronization on an identity-less (value type) object.
    ThrowIdentityMonitor,
    ThrowOutOfMemory,
    ThrowStackOverflow,
    ThrowWrongMethodType { expected: String, actual: String },
    /// Linkage or resolution failure of the given kind.
    ThrowLinkage { kind: ThrowableKind, message: String },
    /// Leave the run loop: a call-in or j2i boundary frame is on top.
    ExitInterpreter,
}

impl BytecodeAction {
    /// Whether this action routes to the exception path.
    pub fn is_throw(&self) -> bool {
        matches!(
            self,
            BytecodeAction::ThrowCurrentException
                | BytecodeAction::ThrowNullPointer
                | BytecodeAction::ThrowArrayIndexOutOfBounds { .. }
                | BytecodeAction::ThrowArrayStore
                | BytecodeAction::ThrowArithmetic
                | BytecodeAction::ThrowNegativeArraySize { .. }
                | BytecodeAction::ThrowClassCast { .. }
                | BytecodeAction::ThrowIllegalMonitorState
                | BytecodeAction::ThrowIdentityMonitor
                | BytecodeAction::ThrowOutOfMemory
                | BytecodeAction::ThrowStackOverflow
                | BytecodeAction::ThrowWrongMethodType { .. }
                | BytecodeAction::ThrowLinkage { .. }
        )
    }

    pub(crate) fn linkage(kind: ThrowableKind, message: impl Into<String>) -> Self {
        BytecodeAction::ThrowLinkage {
            kind,
            message: message.into(),
        }
    }

    /// Exception class and detail message for a throw action that still needs
    /// its exception object created.
    pub(crate) fn exception_to_create(&self) -> Option<(ThrowableKind, Option<String>)> {
        Some(match self {
            BytecodeAction::ThrowNullPointer => (ThrowableKind::NullPointerException, None),
            BytecodeAction::ThrowArrayIndexOutOfBounds { index, length } => (
                ThrowableKind::ArrayIndexOutOfBoundsException,
                Some(format!("Index {} out of bounds for length {}", index, length)),
            ),
            BytecodeAction::ThrowArrayStore => (ThrowableKind::ArrayStoreException, None),
            BytecodeAction::ThrowArithmetic => {
                (ThrowableKind::ArithmeticException, Some("/ by zero".to_string()))
            }
            BytecodeAction::ThrowNegativeArraySize { size } => (
                ThrowableKind::NegativeArraySizeException,
                Some(size.to_string()),
            ),
            BytecodeAction::ThrowClassCast { from, to } => (
                ThrowableKind::ClassCastException,
                Some(format!(
                    "class {} cannot be cast to class {}",
                    from.replace('/', "."),
                    to.replace('/', ".")
                )),
            ),
            BytecodeAction::ThrowIllegalMonitorState => {
                (ThrowableKind::IllegalMonitorStateException, None)
            }
            BytecodeAction::ThrowIdentityMonitor => (
                ThrowableKind::IdentityException,
                Some("cannot synchronize on a value object".to_string()),
            ),
            BytecodeAction::ThrowOutOfMemory => (
                ThrowableKind::OutOfMemoryError,
                Some("Java heap space".to_string()),
            ),
            BytecodeAction::ThrowStackOverflow => (ThrowableKind::StackOverflowError, None),
            BytecodeAction::ThrowWrongMethodType { expected, actual } => (
                ThrowableKind::WrongMethodTypeException,
                Some(format!("expected {} but found {}", expected, actual)),
            ),
            BytecodeAction::ThrowLinkage { kind, message } => (*kind, Some(message.clone())),
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throw_classification() {
        assert!(BytecodeAction::ThrowNullPointer.is_throw());
        assert!(BytecodeAction::ThrowCurrentException.is_throw());
        assert!(!BytecodeAction::ExecuteBytecode.is_throw());
        assert!(!BytecodeAction::ExitInterpreter.is_throw());
        assert_eq!(BytecodeAction::ThrowCurrentException.exception_to_create(), None);
    }

    #[test]
    fn test_bounds_message() {
        let (kind, msg) = BytecodeAction::ThrowArrayIndexOutOfBounds {
            index: -1,
            length: 3,
        }
        .exception_to_create()
        .unwrap();
        assert_eq!(kind, ThrowableKind::ArrayIndexOutOfBoundsException);
        assert_eq!(msg.unwrap(), "Index -1 out of bounds for length 3");
    }
}
