//! The bytecode execution engine.
//!
//! A [`JavaVM`] holds everything threads share: loaded classes, the heap,
//! monitors, natives and the JIT configuration. Each attached
//! [`VmThread`] owns a Java stack and runs the dispatch loop over it.

pub mod action;
pub mod asm;
pub(crate) mod async_events;
pub(crate) mod bootstrap;
pub mod bytecode;
pub mod class;
pub mod classfile;
pub mod constant_pool;
pub mod context;
pub mod debug;
pub mod exception;
pub mod frame;
pub mod heap;
pub(crate) mod interpreter;
pub mod method;
pub mod method_handle;
pub mod monitor;
pub mod native;
pub(crate) mod registry;
pub(crate) mod resolve;
pub mod run_target;
pub(crate) mod send;
pub mod stack;
pub(crate) mod stackwalk;
pub mod threads;
pub mod value;
#[allow(clippy::module_inception)]
pub mod vm;
pub mod vm_access;
pub mod vm_thread;

pub use action::BytecodeAction;
pub use asm::{ClassBuilder, assemble};
pub use class::{Class, ClassId};
pub use classfile::{ClassDef, FieldDef, MethodDef};
pub use debug::{FramePopEvent, StackTraceElement};
pub use exception::ThrowableKind;
pub use frame::FrameType;
pub use method::{Method, MethodId};
pub use native::NativeEnv;
pub use run_target::{RunState, SendTarget};
pub use threads::ThreadHandle;
pub use value::{JValue, JavaType, ObjectRef, ReturnType, Word};
pub use vm::{JavaVM, VmStats};
pub use vm_thread::VmThread;
