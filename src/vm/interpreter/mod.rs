//! The bytecode interpreter.
//!
//! [`step`] executes the instruction at the current pc and returns the
//! [`BytecodeAction`] the run loop should perform next; [`execute`] keeps
//! stepping while the answer is "fetch the next instruction". Handlers never
//! call into each other: an invoke stages its target and returns
//! `RunMethod`, a failure returns the throw action naming it.
//!
//! Handlers are split by instruction group:
//!
//! - `stack_ops`: constants, locals and operand stack shuffles
//! - `arith`: arithmetic, conversions and comparisons
//! - `control`: branches, switches, returns and `athrow`
//! - `objects`: fields, allocation, arrays, type checks and monitors
//! - `invoke`: the four invoke instructions

use std::sync::Arc;

use tracing::trace;

use super::action::BytecodeAction;
use super::bytecode::*;
use super::class::Class;
use super::exception::ThrowableKind;
use super::method::Method;
use super::vm_thread::VmThread;

mod arith;
mod control;
mod invoke;
mod objects;
mod stack_ops;

pub(crate) use arith::{int_div, int_rem, long_div, long_rem};

/// Result of one handler. `Err` carries a throw (or any other action that
/// ends the instruction early); both sides are returned to the run loop.
type Step = Result<BytecodeAction, BytecodeAction>;

/// Run interpreted frames until an instruction asks for something other
/// than the next instruction.
pub(crate) fn execute(thread: &mut VmThread) -> BytecodeAction {
    loop {
        if thread.ctx.in_special_frame() {
            return BytecodeAction::ExitInterpreter;
        }
        let Some(method) = thread.current_method() else {
            return BytecodeAction::ExitInterpreter;
        };
        let Some(class) = thread.vm.class(method.class_id) else {
            return BytecodeAction::linkage(ThrowableKind::NoClassDefFoundError, &method.class_name);
        };
        let literals = thread.ctx.literals;
        loop {
            match step(thread, &method, &class) {
                BytecodeAction::ExecuteBytecode => {}
                BytecodeAction::BranchWithAsyncCheck | BytecodeAction::CheckAsync
                    if thread.shared.async_flags() == 0 => {}
                action => return action,
            }
            if thread.ctx.literals != literals || thread.ctx.in_special_frame() {
                break;
            }
        }
    }
}

/// Execute the instruction at the current pc of `method`'s frame.
pub(crate) fn step(thread: &mut VmThread, method: &Arc<Method>, class: &Arc<Class>) -> BytecodeAction {
    let pc = thread.ctx.bytecode_pc();
    let Some(&op) = method.code.get(pc) else {
        return BytecodeAction::linkage(
            ThrowableKind::InternalError,
            format!("pc {} outside the code of {}", pc, method.full_name()),
        );
    };
    if thread.vm.config.debug_interpreter {
        trace!(
            method = %method.full_name(),
            pc,
            op = mnemonic(op).unwrap_or("?"),
            depth = thread.ctx.depth(),
            "step"
        );
    }

    let result = match op {
        LDC | LDC_W | LDC2_W => stack_ops::ldc(thread, method, class, op, pc),
        NOP..=ALOAD_3 | ISTORE..=ASTORE_3 | POP..=SWAP | IINC | WIDE => {
            stack_ops::execute(thread, method, op, pc)
        }
        IALOAD..=SALOAD => objects::array_load(thread, op),
        IASTORE..=SASTORE => objects::array_store(thread, op),
        IADD..=LXOR | I2L..=DCMPG => arith::execute(&mut thread.ctx, op),
        IFEQ..=RETURN | ATHROW | IFNULL..=JSR_W => control::execute(thread, method, op, pc),
        GETSTATIC..=PUTFIELD | NEW..=ARRAYLENGTH | CHECKCAST..=MONITOREXIT | MULTIANEWARRAY => {
            objects::execute(thread, method, class, op, pc)
        }
        INVOKEVIRTUAL..=INVOKEDYNAMIC => invoke::execute(thread, method, class, op, pc),
        _ => Err(BytecodeAction::linkage(
            ThrowableKind::InternalError,
            format!("undefined opcode 0x{:02x} at pc {} in {}", op, pc, method.full_name()),
        )),
    };
    result.unwrap_or_else(|action| action)
}

// =============================================================================
// Operand decoding
// =============================================================================

fn truncated(method: &Method, at: usize) -> BytecodeAction {
    BytecodeAction::linkage(
        ThrowableKind::InternalError,
        format!("truncated instruction at {} in {}", at, method.full_name()),
    )
}

fn operand_u8(method: &Method, at: usize) -> Result<u8, BytecodeAction> {
    method.code.get(at).copied().ok_or_else(|| truncated(method, at))
}

fn operand_u16(method: &Method, at: usize) -> Result<u16, BytecodeAction> {
    read_u16(&method.code, at).ok_or_else(|| truncated(method, at))
}

fn operand_i16(method: &Method, at: usize) -> Result<i16, BytecodeAction> {
    read_i16(&method.code, at).ok_or_else(|| truncated(method, at))
}

fn operand_i32(method: &Method, at: usize) -> Result<i32, BytecodeAction> {
    read_i32(&method.code, at).ok_or_else(|| truncated(method, at))
}

fn misrouted(op: u8) -> BytecodeAction {
    BytecodeAction::linkage(
        ThrowableKind::InternalError,
        format!("no handler for {}", mnemonic(op).unwrap_or("?")),
    )
}

/// Move past an instruction of fixed length.
#[inline]
fn next(thread: &mut VmThread, op: u8) -> Step {
    thread.ctx.advance(fixed_length(op).unwrap_or(1));
    Ok(BytecodeAction::ExecuteBytecode)
}
