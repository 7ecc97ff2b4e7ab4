//! jexec - a JVM-style bytecode execution engine
//!
//! This library provides the interpreter, the invocation machinery and the
//! bridge to compiled code. The `jexec` binary runs TOML program images on
//! top of it.

pub mod config;
pub mod error;
pub mod image;
pub mod jit;
pub mod vm;

// Re-export commonly used types
pub use config::{GrowthPolicy, JitMode, RuntimeConfig, StackConfig};
pub use error::{ThrownException, VmError, VmResult};
pub use jit::TransitionStats;
pub use vm::{ClassBuilder, JValue, JavaVM, ObjectRef, VmThread};
