//! Fields, allocation, arrays, type checks and monitors.

use std::sync::Arc;

use super::{Step, misrouted, next, operand_u8, operand_u16};
use crate::vm::action::BytecodeAction;
use crate::vm::bytecode::*;
use crate::vm::class::{Class, ElementType};
use crate::vm::exception::ThrowableKind;
use crate::vm::heap::HeapObject;
use crate::vm::method::Method;
use crate::vm::value::{JavaType, ObjectRef, Word, int_to_word, word_to_int};
use crate::vm::vm_thread::VmThread;

pub(super) fn execute(
    thread: &mut VmThread,
    method: &Method,
    class: &Arc<Class>,
    op: u8,
    pc: usize,
) -> Step {
    match op {
        GETSTATIC => {
            let index = operand_u16(method, pc + 1)?;
            let resolved = thread.resolve_field(class, index, true)?;
            let word = resolved.class.static_value(resolved.field.slot);
            push_typed(thread, resolved.field.ty, word);
        }
        PUTSTATIC => {
            let index = operand_u16(method, pc + 1)?;
            let resolved = thread.resolve_field(class, index, true)?;
            let word = pop_typed(thread, resolved.field.ty);
            resolved.class.set_static_value(resolved.field.slot, word);
        }
        GETFIELD => {
            let index = operand_u16(method, pc + 1)?;
            let resolved = thread.resolve_field(class, index, false)?;
            let object = thread.ctx.pop_ref();
            let object = thread.vm.heap.get(object).ok_or(BytecodeAction::ThrowNullPointer)?;
            push_typed(thread, resolved.field.ty, object.field(resolved.field.slot));
        }
        PUTFIELD => {
            let index = operand_u16(method, pc + 1)?;
            let resolved = thread.resolve_field(class, index, false)?;
            let word = pop_typed(thread, resolved.field.ty);
            let object = thread.ctx.pop_ref();
            let object = thread.vm.heap.get(object).ok_or(BytecodeAction::ThrowNullPointer)?;
            object.set_field(resolved.field.slot, word);
        }

        NEW => {
            let index = operand_u16(method, pc + 1)?;
            let target = thread.resolve_class(class, index)?;
            let object = new_instance(thread, &target)?;
            thread.ctx.push_ref(object);
            return next_checked(thread, op);
        }
        NEWARRAY => {
            let name = match operand_u8(method, pc + 1)? {
                T_BOOLEAN => "[Z",
                T_CHAR => "[C",
                T_FLOAT => "[F",
                T_DOUBLE => "[D",
                T_BYTE => "[B",
                T_SHORT => "[S",
                T_INT => "[I",
                T_LONG => "[J",
                other => {
                    return Err(BytecodeAction::linkage(
                        ThrowableKind::InternalError,
                        format!("bad newarray type {} in {}", other, method.full_name()),
                    ));
                }
            };
            let length = thread.ctx.pop_int();
            let array = thread.new_array_of(name, length)?;
            thread.ctx.push_ref(array);
            return next_checked(thread, op);
        }
        ANEWARRAY => {
            let index = operand_u16(method, pc + 1)?;
            let element = thread.resolve_class(class, index)?;
            let length = thread.ctx.pop_int();
            let array = thread.new_array_of(&array_name_of(&element.name), length)?;
            thread.ctx.push_ref(array);
            return next_checked(thread, op);
        }
        ARRAYLENGTH => {
            let array = thread.ctx.pop_ref();
            let object = thread.vm.heap.get(array).ok_or(BytecodeAction::ThrowNullPointer)?;
            let length = object.array_length().ok_or_else(|| not_an_array(&object))?;
            thread.ctx.push_int(length as i32);
        }
        MULTIANEWARRAY => {
            let index = operand_u16(method, pc + 1)?;
            let dimensions = operand_u8(method, pc + 3)? as usize;
            if dimensions == 0 {
                return Err(BytecodeAction::linkage(
                    ThrowableKind::InternalError,
                    format!("multianewarray with no dimensions in {}", method.full_name()),
                ));
            }
            let array_class = thread.resolve_class(class, index)?;
            let mut lengths: Vec<i32> = (0..dimensions).map(|_| thread.ctx.pop_int()).collect();
            lengths.reverse();
            if let Some(&size) = lengths.iter().find(|&&n| n < 0) {
                return Err(BytecodeAction::ThrowNegativeArraySize { size });
            }
            let roots = thread.temp_roots.len();
            let result = new_multi_array(thread, &array_class.name, &lengths);
            thread.temp_roots.truncate(roots);
            thread.ctx.push_ref(result?);
            return next_checked(thread, op);
        }

        CHECKCAST => {
            let index = operand_u16(method, pc + 1)?;
            let target = thread.resolve_class(class, index)?;
            let object = thread.ctx.peek_ref(0);
            if let Some(object) = thread.vm.heap.get(object) {
                if !object.class.is_assignable_to(&target) {
                    return Err(BytecodeAction::ThrowClassCast {
                        from: object.class.name.clone(),
                        to: target.name.clone(),
                    });
                }
            }
        }
        INSTANCEOF => {
            let index = operand_u16(method, pc + 1)?;
            let target = thread.resolve_class(class, index)?;
            let object = thread.ctx.pop_ref();
            let result = thread
                .vm
                .heap
                .get(object)
                .is_some_and(|o| o.class.is_assignable_to(&target));
            thread.ctx.push_int(i32::from(result));
        }
        MONITORENTER => {
            let object = thread.ctx.pop_ref();
            thread.monitor_enter(object)?;
            return next_checked(thread, op);
        }
        MONITOREXIT => {
            let object = thread.ctx.pop_ref();
            thread.monitor_exit(object)?;
        }
        _ => return Err(misrouted(op)),
    }
    next(thread, op)
}

/// Advance past `op`, which may have blocked or allocated, and poll for
/// async events before the next instruction.
fn next_checked(thread: &mut VmThread, op: u8) -> Step {
    next(thread, op)?;
    Ok(BytecodeAction::CheckAsync)
}

/// `new`: an uninitialized instance of `target`. Throwables capture their
/// stack trace here, at the allocation site.
fn new_instance(thread: &mut VmThread, target: &Arc<Class>) -> Result<ObjectRef, BytecodeAction> {
    if target.is_interface() || target.is_abstract() || target.is_array() {
        return Err(BytecodeAction::linkage(
            ThrowableKind::InstantiationError,
            target.name.replace('/', "."),
        ));
    }
    thread.initialize_class(target)?;
    let object = HeapObject::instance(Arc::clone(target));
    let throwable = thread.vm.throwable_class(ThrowableKind::Throwable);
    if target.is_subtype_of(&throwable) {
        let _ = object.stack_trace.set(thread.capture_stack_trace());
    }
    thread.allocate(object)
}

/// Array class whose elements are `element_name` instances.
fn array_name_of(element_name: &str) -> String {
    if element_name.starts_with('[') {
        format!("[{}", element_name)
    } else {
        format!("[L{};", element_name)
    }
}

/// Allocate `name` with the given dimension lengths, outermost first. Outer
/// arrays are kept in the temporary roots while their elements allocate.
fn new_multi_array(thread: &mut VmThread, name: &str, lengths: &[i32]) -> Result<ObjectRef, BytecodeAction> {
    let Some((&outer, rest)) = lengths.split_first() else {
        return Err(BytecodeAction::linkage(
            ThrowableKind::InternalError,
            format!("no dimensions for {}", name),
        ));
    };
    let array = thread.new_array_of(name, outer)?;
    if rest.is_empty() {
        return Ok(array);
    }
    thread.temp_roots.push(array);
    let inner = &name[1..];
    for i in 0..outer {
        let element = new_multi_array(thread, inner, rest)?;
        if let Some(object) = thread.vm.heap.get(array) {
            let _ = object.set_element(i, element.to_word());
        }
    }
    Ok(array)
}

fn not_an_array(object: &HeapObject) -> BytecodeAction {
    BytecodeAction::ThrowClassCast {
        from: object.class.name.clone(),
        to: "[Ljava/lang/Object;".to_string(),
    }
}

fn push_typed(thread: &mut VmThread, ty: JavaType, word: Word) {
    if ty.is_wide() {
        thread.ctx.push_wide(word);
    } else {
        thread.ctx.push(word);
    }
}

/// Pop a value headed for a field or array of type `ty`, narrowing sub-int
/// values.
fn pop_typed(thread: &mut VmThread, ty: JavaType) -> Word {
    match ty {
        JavaType::Long | JavaType::Double => thread.ctx.pop_wide(),
        JavaType::Boolean | JavaType::Byte | JavaType::Char | JavaType::Short => {
            int_to_word(ty.narrow(thread.ctx.pop_int()))
        }
        _ => thread.ctx.pop(),
    }
}

// =============================================================================
// Array elements
// =============================================================================

fn bounds(index: i32) -> impl FnOnce(i32) -> BytecodeAction {
    move |length| BytecodeAction::ThrowArrayIndexOutOfBounds { index, length }
}

pub(super) fn array_load(thread: &mut VmThread, op: u8) -> Step {
    let index = thread.ctx.pop_int();
    let array = thread.ctx.pop_ref();
    let object = thread.vm.heap.get(array).ok_or(BytecodeAction::ThrowNullPointer)?;
    if object.array_length().is_none() {
        return Err(not_an_array(&object));
    }
    let word = object.element(index).map_err(bounds(index))?;
    match op {
        LALOAD | DALOAD => thread.ctx.push_wide(word),
        _ => thread.ctx.push(word),
    }
    next(thread, op)
}

pub(super) fn array_store(thread: &mut VmThread, op: u8) -> Step {
    let value = match op {
        LASTORE | DASTORE => thread.ctx.pop_wide(),
        _ => thread.ctx.pop(),
    };
    let index = thread.ctx.pop_int();
    let array = thread.ctx.pop_ref();
    let object = thread.vm.heap.get(array).ok_or(BytecodeAction::ThrowNullPointer)?;
    let Some(length) = object.array_length() else {
        return Err(not_an_array(&object));
    };
    if index as u32 as usize >= length {
        return Err(BytecodeAction::ThrowArrayIndexOutOfBounds {
            index,
            length: length as i32,
        });
    }

    let word = match op {
        AASTORE => {
            let stored = ObjectRef::from_word(value);
            if let (Some(ElementType::Reference(element)), Some(stored)) =
                (&object.class.element, thread.vm.heap.get(stored))
            {
                if !stored.class.is_assignable_to(element) {
                    return Err(BytecodeAction::ThrowArrayStore);
                }
            }
            value
        }
        // Shared by byte[] and boolean[].
        BASTORE => {
            let ty = object
                .class
                .element
                .as_ref()
                .map_or(JavaType::Byte, ElementType::java_type);
            int_to_word(ty.narrow(word_to_int(value)))
        }
        CASTORE => int_to_word(JavaType::Char.narrow(word_to_int(value))),
        SASTORE => int_to_word(JavaType::Short.narrow(word_to_int(value))),
        _ => value,
    };
    object.set_element(index, word).map_err(bounds(index))?;
    next(thread, op)
}
