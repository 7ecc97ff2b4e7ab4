//! Constants, locals and operand stack shuffles.

use std::sync::Arc;

use super::{Step, misrouted, next, operand_i16, operand_u8, operand_u16};
use crate::vm::action::BytecodeAction;
use crate::vm::bytecode::*;
use crate::vm::class::Class;
use crate::vm::constant_pool::CpEntry;
use crate::vm::context::ExecutionContext;
use crate::vm::exception::ThrowableKind;
use crate::vm::method::Method;
use crate::vm::value::{ObjectRef, int_to_word, word_to_int};
use crate::vm::vm_thread::VmThread;

pub(super) fn execute(thread: &mut VmThread, method: &Method, op: u8, pc: usize) -> Step {
    if op == WIDE {
        return wide(thread, method, pc);
    }
    let ctx = &mut thread.ctx;
    match op {
        NOP => {}
        ACONST_NULL => ctx.push_ref(ObjectRef::NULL),
        ICONST_M1..=ICONST_5 => ctx.push_int(op as i32 - ICONST_0 as i32),
        LCONST_0 | LCONST_1 => ctx.push_long((op - LCONST_0) as i64),
        FCONST_0..=FCONST_2 => ctx.push_float((op - FCONST_0) as f32),
        DCONST_0 | DCONST_1 => ctx.push_double((op - DCONST_0) as f64),
        BIPUSH => ctx.push_int(operand_u8(method, pc + 1)? as i8 as i32),
        SIPUSH => ctx.push_int(operand_i16(method, pc + 1)? as i32),

        ILOAD | FLOAD | ALOAD => {
            let index = local_index(method, operand_u8(method, pc + 1)? as usize, 1)?;
            ctx.push(ctx.local(index));
        }
        LLOAD | DLOAD => {
            let index = local_index(method, operand_u8(method, pc + 1)? as usize, 2)?;
            ctx.push_wide(ctx.local_wide(index));
        }
        ILOAD_0..=ILOAD_3 => load(ctx, method, (op - ILOAD_0) as usize)?,
        FLOAD_0..=FLOAD_3 => load(ctx, method, (op - FLOAD_0) as usize)?,
        ALOAD_0..=ALOAD_3 => load(ctx, method, (op - ALOAD_0) as usize)?,
        LLOAD_0..=LLOAD_3 => load_wide(ctx, method, (op - LLOAD_0) as usize)?,
        DLOAD_0..=DLOAD_3 => load_wide(ctx, method, (op - DLOAD_0) as usize)?,

        ISTORE | FSTORE | ASTORE => {
            let index = local_index(method, operand_u8(method, pc + 1)? as usize, 1)?;
            let word = ctx.pop();
            ctx.set_local(index, word);
        }
        LSTORE | DSTORE => {
            let index = local_index(method, operand_u8(method, pc + 1)? as usize, 2)?;
            let word = ctx.pop_wide();
            ctx.set_local_wide(index, word);
        }
        ISTORE_0..=ISTORE_3 => store(ctx, method, (op - ISTORE_0) as usize)?,
        FSTORE_0..=FSTORE_3 => store(ctx, method, (op - FSTORE_0) as usize)?,
        ASTORE_0..=ASTORE_3 => store(ctx, method, (op - ASTORE_0) as usize)?,
        LSTORE_0..=LSTORE_3 => store_wide(ctx, method, (op - LSTORE_0) as usize)?,
        DSTORE_0..=DSTORE_3 => store_wide(ctx, method, (op - DSTORE_0) as usize)?,

        POP => ctx.sp += 1,
        POP2 => ctx.sp += 2,
        DUP => ctx.push(ctx.peek(0)),
        DUP_X1 => {
            let (v1, v2) = (ctx.pop(), ctx.pop());
            push_all(ctx, &[v1, v2, v1]);
        }
        DUP_X2 => {
            let (v1, v2, v3) = (ctx.pop(), ctx.pop(), ctx.pop());
            push_all(ctx, &[v1, v3, v2, v1]);
        }
        DUP2 => {
            let (v1, v2) = (ctx.peek(0), ctx.peek(1));
            push_all(ctx, &[v2, v1]);
        }
        DUP2_X1 => {
            let (v1, v2, v3) = (ctx.pop(), ctx.pop(), ctx.pop());
            push_all(ctx, &[v2, v1, v3, v2, v1]);
        }
        DUP2_X2 => {
            let (v1, v2, v3, v4) = (ctx.pop(), ctx.pop(), ctx.pop(), ctx.pop());
            push_all(ctx, &[v2, v1, v4, v3, v2, v1]);
        }
        SWAP => {
            let (v1, v2) = (ctx.pop(), ctx.pop());
            push_all(ctx, &[v1, v2]);
        }
        IINC => {
            let index = local_index(method, operand_u8(method, pc + 1)? as usize, 1)?;
            let delta = operand_u8(method, pc + 2)? as i8 as i32;
            increment(ctx, index, delta);
        }
        _ => return Err(misrouted(op)),
    }
    next(thread, op)
}

/// `wide` prefix: the inner load, store or `iinc` with a 16-bit index.
fn wide(thread: &mut VmThread, method: &Method, pc: usize) -> Step {
    let inner = operand_u8(method, pc + 1)?;
    let raw = operand_u16(method, pc + 2)? as usize;
    let ctx = &mut thread.ctx;
    let length = match inner {
        ILOAD | FLOAD | ALOAD => {
            let index = local_index(method, raw, 1)?;
            ctx.push(ctx.local(index));
            4
        }
        LLOAD | DLOAD => {
            let index = local_index(method, raw, 2)?;
            ctx.push_wide(ctx.local_wide(index));
            4
        }
        ISTORE | FSTORE | ASTORE => {
            let index = local_index(method, raw, 1)?;
            let word = ctx.pop();
            ctx.set_local(index, word);
            4
        }
        LSTORE | DSTORE => {
            let index = local_index(method, raw, 2)?;
            let word = ctx.pop_wide();
            ctx.set_local_wide(index, word);
            4
        }
        IINC => {
            let index = local_index(method, raw, 1)?;
            let delta = operand_i16(method, pc + 4)? as i32;
            increment(ctx, index, delta);
            6
        }
        other => {
            return Err(BytecodeAction::linkage(
                ThrowableKind::InternalError,
                format!(
                    "wide {} at {} in {}",
                    mnemonic(other).unwrap_or("?"),
                    pc,
                    method.full_name()
                ),
            ));
        }
    };
    ctx.advance(length);
    Ok(BytecodeAction::ExecuteBytecode)
}

/// `ldc`, `ldc_w` and `ldc2_w`. Strings, classes, method types and method
/// handles resolve through the constant pool cache.
pub(super) fn ldc(thread: &mut VmThread, method: &Method, class: &Arc<Class>, op: u8, pc: usize) -> Step {
    let index = if op == LDC {
        operand_u8(method, pc + 1)? as u16
    } else {
        operand_u16(method, pc + 1)?
    };
    match class.constant_pool.get(index) {
        Some(CpEntry::Int(v)) => thread.ctx.push_int(*v),
        Some(CpEntry::Float(v)) => thread.ctx.push_float(*v),
        Some(CpEntry::Long(v)) => thread.ctx.push_long(*v),
        Some(CpEntry::Double(v)) => thread.ctx.push_double(*v),
        Some(CpEntry::String { .. }) => {
            let string = thread.resolve_string(class, index)?;
            thread.ctx.push_ref(string);
        }
        Some(CpEntry::Class { .. }) => {
            let target = thread.resolve_class(class, index)?;
            let mirror = thread.class_mirror(&target)?;
            thread.ctx.push_ref(mirror);
        }
        Some(CpEntry::MethodType { .. }) => {
            let method_type = thread.resolve_method_type(class, index)?;
            thread.ctx.push_ref(method_type);
        }
        Some(CpEntry::MethodHandle { .. }) => {
            let handle = thread.resolve_method_handle(class, index)?;
            thread.ctx.push_ref(handle);
        }
        _ => {
            return Err(BytecodeAction::linkage(
                ThrowableKind::InternalError,
                format!("constant #{} of {} is not loadable", index, class.name),
            ));
        }
    }
    next(thread, op)
}

// =============================================================================
// Helpers
// =============================================================================

/// Check that local `index` (and its upper half for wide values) lies in the
/// frame.
#[inline]
fn local_index(method: &Method, index: usize, width: usize) -> Result<usize, BytecodeAction> {
    if index + width <= method.max_locals {
        Ok(index)
    } else {
        Err(BytecodeAction::linkage(
            ThrowableKind::InternalError,
            format!("local {} out of range in {}", index, method.full_name()),
        ))
    }
}

#[inline]
fn load(ctx: &mut ExecutionContext, method: &Method, index: usize) -> Result<(), BytecodeAction> {
    let index = local_index(method, index, 1)?;
    ctx.push(ctx.local(index));
    Ok(())
}

#[inline]
fn load_wide(ctx: &mut ExecutionContext, method: &Method, index: usize) -> Result<(), BytecodeAction> {
    let index = local_index(method, index, 2)?;
    ctx.push_wide(ctx.local_wide(index));
    Ok(())
}

#[inline]
fn store(ctx: &mut ExecutionContext, method: &Method, index: usize) -> Result<(), BytecodeAction> {
    let index = local_index(method, index, 1)?;
    let word = ctx.pop();
    ctx.set_local(index, word);
    Ok(())
}

#[inline]
fn store_wide(ctx: &mut ExecutionContext, method: &Method, index: usize) -> Result<(), BytecodeAction> {
    let index = local_index(method, index, 2)?;
    let word = ctx.pop_wide();
    ctx.set_local_wide(index, word);
    Ok(())
}

fn increment(ctx: &mut ExecutionContext, index: usize, delta: i32) {
    let value = word_to_int(ctx.local(index)).wrapping_add(delta);
    ctx.set_local(index, int_to_word(value));
}

/// Push `words` in order; the last one ends up on top.
fn push_all(ctx: &mut ExecutionContext, words: &[u64]) {
    for &word in words {
        ctx.push(word);
    }
}
