//! The JIT collaborator and the bridge between interpreted and compiled
//! code.
//!
//! The engine only sees the compiler through [`JitConfig`]: an entry point
//! that turns a method into a [`CompiledCode`] body, the table of return
//! trampolines the i2j bridge finishes with, and the code cache bodies are
//! installed into. The reference [`template::TemplateCompiler`] is built
//! with the `jit` feature.
//!
//! Compiled bodies run on the thread's Java stack against a simulated
//! register file: arguments arrive in registers, results leave in the
//! return register of their class, and compiled frames keep the interpreter
//! layout for their locals so one can be turned into an interpreter frame
//! in place when its assumptions stop holding.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;

use crate::vm::context::ExecutionContext;
use crate::vm::method::Method;
use crate::vm::value::{JValue, ReturnType};
use crate::vm::vm::JavaVM;

pub mod bridge;
pub mod code;
pub mod code_cache;
pub mod executor;
pub mod marshal;
pub mod registers;
#[cfg(feature = "jit")]
pub mod template;

pub use code::{CompiledCode, Cond, Op};
pub use code_cache::{CodeCache, CompiledBody};
pub use registers::JitRegisterFile;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JitError {
    #[error("unsupported bytecode 0x{opcode:02x} at pc {pc}")]
    UnsupportedBytecode { opcode: u8, pc: usize },

    #[error("methods with exception handlers are not compiled")]
    HasExceptionHandlers,

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("code cache full ({capacity} bodies)")]
    CacheFull { capacity: usize },

    #[error("invalid bytecode at pc {pc}")]
    InvalidBytecode { pc: usize },
}

pub type JitResult<T> = Result<T, JitError>;

/// A compiler the engine can call synchronously on the invoking thread.
pub trait JitCompiler: Send + Sync {
    fn name(&self) -> &str;

    fn compile(&self, vm: &JavaVM, method: &Arc<Method>) -> JitResult<CompiledCode>;
}

// =============================================================================
// Return trampolines
// =============================================================================

/// Moves a compiled callee's result from its return register onto the
/// interpreter's operand stack.
pub type ReturnTrampoline = fn(&mut ExecutionContext, &JitRegisterFile);

fn return_void(_: &mut ExecutionContext, _: &JitRegisterFile) {}

fn return_int(ctx: &mut ExecutionContext, regs: &JitRegisterFile) {
    ctx.push(regs.return_value(ReturnType::Int));
}

fn return_long(ctx: &mut ExecutionContext, regs: &JitRegisterFile) {
    ctx.push_wide(regs.return_value(ReturnType::Long));
}

fn return_float(ctx: &mut ExecutionContext, regs: &JitRegisterFile) {
    ctx.push(regs.return_value(ReturnType::Float));
}

fn return_double(ctx: &mut ExecutionContext, regs: &JitRegisterFile) {
    ctx.push_wide(regs.return_value(ReturnType::Double));
}

fn return_object(ctx: &mut ExecutionContext, regs: &JitRegisterFile) {
    ctx.push(regs.return_value(ReturnType::Object));
}

/// One trampoline per return category, indexed by `ReturnType as usize`.
pub struct ReturnTrampolines([ReturnTrampoline; ReturnType::COUNT]);

impl ReturnTrampolines {
    pub fn get(&self, ret: ReturnType) -> ReturnTrampoline {
        self.0[ret as usize]
    }
}

impl Default for ReturnTrampolines {
    fn default() -> Self {
        ReturnTrampolines([
            return_void,
            return_int,
            return_long,
            return_float,
            return_double,
            return_object,
        ])
    }
}

// =============================================================================
// Transition counters
// =============================================================================

/// Bridge traffic, reported by `--stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransitionStats {
    pub i2j: u64,
    pub j2i: u64,
    pub j2j: u64,
    pub j2i_redirects: u64,
    pub compiles: u64,
    pub compile_failures: u64,
    pub deoptimizations: u64,
    pub invalidations: u64,
}

#[derive(Debug, Default)]
pub struct TransitionCounters {
    pub i2j: AtomicU64,
    pub j2i: AtomicU64,
    pub j2j: AtomicU64,
    pub j2i_redirects: AtomicU64,
    pub compiles: AtomicU64,
    pub compile_failures: AtomicU64,
    pub deoptimizations: AtomicU64,
    pub invalidations: AtomicU64,
}

impl TransitionCounters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransitionStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TransitionStats {
            i2j: get(&self.i2j),
            j2i: get(&self.j2i),
            j2j: get(&self.j2j),
            j2i_redirects: get(&self.j2i_redirects),
            compiles: get(&self.compiles),
            compile_failures: get(&self.compile_failures),
            deoptimizations: get(&self.deoptimizations),
            invalidations: get(&self.invalidations),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Everything the engine needs from the JIT.
pub struct JitConfig {
    pub compiler: Option<Box<dyn JitCompiler>>,
    pub trampolines: ReturnTrampolines,
    pub code_cache: CodeCache,
    pub counters: TransitionCounters,
    /// Log every transition at `debug`.
    pub trace: bool,
}

impl JitConfig {
    pub fn new(compiler: Option<Box<dyn JitCompiler>>, trace: bool) -> Self {
        JitConfig {
            compiler,
            trampolines: ReturnTrampolines::default(),
            code_cache: CodeCache::default(),
            counters: TransitionCounters::default(),
            trace,
        }
    }

    pub fn compiler_name(&self) -> Option<&str> {
        self.compiler.as_deref().map(JitCompiler::name)
    }
}

impl std::fmt::Debug for JitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitConfig")
            .field("compiler", &self.compiler_name())
            .field("bodies", &self.code_cache.len())
            .finish()
    }
}

/// The compiler a VM gets unless the embedder supplies one.
pub fn default_compiler() -> Option<Box<dyn JitCompiler>> {
    #[cfg(feature = "jit")]
    {
        Some(Box::new(template::TemplateCompiler::new()))
    }
    #[cfg(not(feature = "jit"))]
    {
        None
    }
}

/// Read a return register back as a value; used when compiled code hands a
/// result to Rust rather than to the interpreter.
pub fn return_register_value(regs: &JitRegisterFile, ret: ReturnType) -> JValue {
    JValue::from_word(ret, regs.return_value(ret))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::int_to_word;

    #[test]
    fn test_trampolines_push_by_category() {
        let trampolines = ReturnTrampolines::default();
        let mut regs = JitRegisterFile::default();
        regs.gpr[registers::RETURN_GPR] = int_to_word(-4);
        regs.fpr[registers::RETURN_FPR] = 2.5f64.to_bits();

        let mut ctx = ExecutionContext::new(16);
        let start = ctx.sp;
        trampolines.get(ReturnType::Void)(&mut ctx, &regs);
        assert_eq!(ctx.sp, start);
        trampolines.get(ReturnType::Int)(&mut ctx, &regs);
        assert_eq!(ctx.pop_int(), -4);
        trampolines.get(ReturnType::Double)(&mut ctx, &regs);
        assert_eq!(ctx.sp, start - 2);
        assert_eq!(ctx.pop_double(), 2.5);
    }

    #[test]
    fn test_counter_snapshot() {
        let counters = TransitionCounters::default();
        TransitionCounters::bump(&counters.i2j);
        TransitionCounters::bump(&counters.i2j);
        TransitionCounters::bump(&counters.deoptimizations);
        let stats = counters.snapshot();
        assert_eq!(stats.i2j, 2);
        assert_eq!(stats.deoptimizations, 1);
        assert_eq!(stats.j2i, 0);
    }
}
