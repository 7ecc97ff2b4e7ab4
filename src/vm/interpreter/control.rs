//! Branches, switches, returns and `athrow`.

use tracing::trace;

use super::{Step, misrouted, operand_i16, operand_i32};
use crate::vm::action::BytecodeAction;
use crate::vm::bytecode::*;
use crate::vm::exception::ThrowableKind;
use crate::vm::frame::{A0_REPORT_FRAME_POP_TAG, restore_method_frame, sync_object};
use crate::vm::method::Method;
use crate::vm::vm_thread::VmThread;

pub(super) fn execute(thread: &mut VmThread, method: &Method, op: u8, pc: usize) -> Step {
    let ctx = &mut thread.ctx;
    match op {
        IFEQ..=IFLE => {
            let v = ctx.pop_int();
            let taken = match op {
                IFEQ => v == 0,
                IFNE => v != 0,
                IFLT => v < 0,
                IFGE => v >= 0,
                IFGT => v > 0,
                _ => v <= 0,
            };
            branch(thread, method, pc, taken, 3)
        }
        IF_ICMPEQ..=IF_ICMPLE => {
            let b = ctx.pop_int();
            let a = ctx.pop_int();
            let taken = match op {
                IF_ICMPEQ => a == b,
                IF_ICMPNE => a != b,
                IF_ICMPLT => a < b,
                IF_ICMPGE => a >= b,
                IF_ICMPGT => a > b,
                _ => a <= b,
            };
            branch(thread, method, pc, taken, 3)
        }
        IF_ACMPEQ | IF_ACMPNE => {
            let b = ctx.pop_ref();
            let a = ctx.pop_ref();
            branch(thread, method, pc, (a == b) == (op == IF_ACMPEQ), 3)
        }
        IFNULL | IFNONNULL => {
            let r = ctx.pop_ref();
            branch(thread, method, pc, r.is_null() == (op == IFNULL), 3)
        }
        GOTO => branch(thread, method, pc, true, 3),
        GOTO_W => {
            let offset = operand_i32(method, pc + 1)?;
            jump(thread, method, pc, offset)
        }
        TABLESWITCH => table_switch(thread, method, pc),
        LOOKUPSWITCH => lookup_switch(thread, method, pc),
        IRETURN..=RETURN => return_from(thread, method),
        ATHROW => {
            let exception = ctx.pop_ref();
            if exception.is_null() {
                return Err(BytecodeAction::ThrowNullPointer);
            }
            thread.exception = exception;
            Ok(BytecodeAction::ThrowCurrentException)
        }
        JSR | RET | JSR_W => Err(BytecodeAction::linkage(
            ThrowableKind::InternalError,
            format!("subroutine instructions are not supported ({})", method.full_name()),
        )),
        _ => Err(misrouted(op)),
    }
}

/// Conditional branch with a 16-bit offset; falls through past `length`.
fn branch(thread: &mut VmThread, method: &Method, pc: usize, taken: bool, length: usize) -> Step {
    if !taken {
        thread.ctx.advance(length);
        return Ok(BytecodeAction::ExecuteBytecode);
    }
    let offset = operand_i16(method, pc + 1)? as i32;
    jump(thread, method, pc, offset)
}

/// Transfer to `pc + offset`. Backward (and self) branches are checkpoints.
fn jump(thread: &mut VmThread, method: &Method, pc: usize, offset: i32) -> Step {
    let target = pc as i64 + offset as i64;
    if target < 0 || target as usize >= method.code.len() {
        return Err(BytecodeAction::linkage(
            ThrowableKind::InternalError,
            format!("branch from {} to {} leaves {}", pc, target, method.full_name()),
        ));
    }
    thread.ctx.set_bytecode_pc(target as usize);
    if offset <= 0 {
        Ok(BytecodeAction::BranchWithAsyncCheck)
    } else {
        Ok(BytecodeAction::ExecuteBytecode)
    }
}

fn table_switch(thread: &mut VmThread, method: &Method, pc: usize) -> Step {
    let base = switch_operand_base(pc);
    let default = operand_i32(method, base)?;
    let low = operand_i32(method, base + 4)?;
    let high = operand_i32(method, base + 8)?;
    let index = thread.ctx.pop_int();
    let offset = if low <= index && index <= high {
        let slot = (index as i64 - low as i64) as usize;
        operand_i32(method, base + 12 + slot * 4)?
    } else {
        default
    };
    jump(thread, method, pc, offset)
}

/// Keys are sorted, so the match is found by bisection.
fn lookup_switch(thread: &mut VmThread, method: &Method, pc: usize) -> Step {
    let base = switch_operand_base(pc);
    let default = operand_i32(method, base)?;
    let pairs = operand_i32(method, base + 4)?.max(0) as usize;
    let key = thread.ctx.pop_int();
    let (mut lo, mut hi) = (0, pairs);
    let mut offset = default;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let candidate = operand_i32(method, base + 8 + mid * 8)?;
        match candidate.cmp(&key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => {
                offset = operand_i32(method, base + 12 + mid * 8)?;
                break;
            }
        }
    }
    jump(thread, method, pc, offset)
}

/// Pop the current frame and hand the result to the caller.
fn return_from(thread: &mut VmThread, method: &Method) -> Step {
    let ret = method.return_type();
    let value = thread.ctx.pop_value(ret);
    let a0 = thread.ctx.a0;
    if method.is_synchronized() {
        let object = sync_object(&thread.ctx, method, a0);
        thread.monitor_exit(object)?;
    }
    let tags = restore_method_frame(&mut thread.ctx, method, a0);
    if tags & A0_REPORT_FRAME_POP_TAG != 0 {
        thread.record_frame_pop(method, false);
    }
    thread.ctx.sp += method.arg_slots;
    thread.ctx.push_value(value);
    trace!(method = %method.full_name(), "return");
    Ok(thread.resume_caller())
}
