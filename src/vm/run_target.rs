//! The per-method run target.
//!
//! A single atomic word encodes how the next call of a method is dispatched:
//!
//! ```text
//!   count << 2 | 0b01    counting interpreted, compile when count reaches 0
//!   id    << 2 | 0b10    symbolic send target (bind native, abstract, ...)
//!   entry << 2 | 0b00    compiled, `entry` is a non-zero code cache address
//! ```
//!
//! Every transition is a single compare-and-swap. Losing a race is never
//! retried: the loser re-reads the word and dispatches on whatever it finds.

use std::sync::atomic::{AtomicUsize, Ordering};

const TAG_MASK: usize = 0b11;
const TAG_COUNTING: usize = 0b01;
const TAG_SEND_TARGET: usize = 0b10;
const TAG_COMPILED: usize = 0b00;

/// Symbolic dispatch targets for slow paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SendTarget {
    /// Interpret without counting (JIT off, or compilation failed).
    Interpreted = 1,
    /// Another thread won the compile race; interpret until it publishes.
    Compiling = 2,
    /// Native method not yet bound to an implementation.
    BindNative = 3,
    /// Bound native method.
    RunNative = 4,
    /// Abstract method or unsatisfied interface slot.
    UnsatisfiedOrAbstract = 5,
    /// Conflicting default methods from unrelated interfaces.
    DefaultConflict = 6,
    /// Signature-polymorphic `MethodHandle.invoke`/`invokeExact`.
    InvokeHandle = 7,
}

impl SendTarget {
    fn from_id(id: usize) -> Option<Self> {
        Some(match id {
            1 => SendTarget::Interpreted,
            2 => SendTarget::Compiling,
            3 => SendTarget::BindNative,
            4 => SendTarget::RunNative,
            5 => SendTarget::UnsatisfiedOrAbstract,
            6 => SendTarget::DefaultConflict,
            7 => SendTarget::InvokeHandle,
            _ => return None,
        })
    }
}

/// Decoded run target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Counting(u32),
    Compiled(usize),
    Send(SendTarget),
}

impl RunState {
    fn encode(self) -> usize {
        match self {
            RunState::Counting(count) => ((count as usize) << 2) | TAG_COUNTING,
            RunState::Send(target) => ((target as usize) << 2) | TAG_SEND_TARGET,
            RunState::Compiled(entry) => {
                debug_assert!(entry != 0, "compiled entry address must be non-zero");
                (entry << 2) | TAG_COMPILED
            }
        }
    }

    fn decode(raw: usize) -> Self {
        match raw & TAG_MASK {
            TAG_COUNTING => RunState::Counting((raw >> 2) as u32),
            TAG_SEND_TARGET => {
                RunState::Send(SendTarget::from_id(raw >> 2).unwrap_or(SendTarget::Interpreted))
            }
            _ => RunState::Compiled(raw >> 2),
        }
    }
}

/// What an invocation should do after counting itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountOutcome {
    /// Interpret this invocation.
    Interpret,
    /// This thread won the race and must compile now.
    TriggerCompile,
    /// Compiled code is available.
    Compiled(usize),
    /// A symbolic slow path applies.
    Send(SendTarget),
}

pub struct RunTarget(AtomicUsize);

impl RunTarget {
    pub fn new(state: RunState) -> Self {
        RunTarget(AtomicUsize::new(state.encode()))
    }

    #[inline]
    pub fn load(&self) -> RunState {
        RunState::decode(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: RunState) {
        self.0.store(state.encode(), Ordering::Release);
    }

    /// Atomically replace `current` with `new`. Returns false when another
    /// thread changed the word first.
    pub fn compare_exchange(&self, current: RunState, new: RunState) -> bool {
        self.0
            .compare_exchange(
                current.encode(),
                new.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Count one invocation.
    ///
    /// A non-zero count is decremented with a single CAS; a lost decrement is
    /// simply dropped. A zero count is moved to `Compiling` and exactly one
    /// caller sees `TriggerCompile`.
    pub fn count_invocation(&self) -> CountOutcome {
        let raw = self.0.load(Ordering::Acquire);
        match RunState::decode(raw) {
            RunState::Counting(0) => {
                let compiling = RunState::Send(SendTarget::Compiling).encode();
                match self
                    .0
                    .compare_exchange(raw, compiling, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => CountOutcome::TriggerCompile,
                    Err(now) => match RunState::decode(now) {
                        RunState::Compiled(entry) => CountOutcome::Compiled(entry),
                        _ => CountOutcome::Interpret,
                    },
                }
            }
            RunState::Counting(n) => {
                let _ = self.0.compare_exchange(
                    raw,
                    RunState::Counting(n - 1).encode(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
                CountOutcome::Interpret
            }
            RunState::Compiled(entry) => CountOutcome::Compiled(entry),
            RunState::Send(SendTarget::Compiling | SendTarget::Interpreted) => {
                CountOutcome::Interpret
            }
            RunState::Send(target) => CountOutcome::Send(target),
        }
    }

    /// Publish a finished compilation.
    pub fn publish_compiled(&self, entry: usize) {
        self.store(RunState::Compiled(entry));
    }

    /// Drop compiled code for `entry` and start counting again. No-op if the
    /// method has since moved on to another entry.
    pub fn invalidate(&self, entry: usize, recount: u32) -> bool {
        self.compare_exchange(RunState::Compiled(entry), RunState::Counting(recount))
    }
}

impl std::fmt::Debug for RunTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RunTarget({:?})", self.load())
    }
}
