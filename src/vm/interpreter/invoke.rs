//! The invoke instructions.
//!
//! An invoke resolves its call site, selects the target for the receiver
//! and stages it in the send slot; the run loop's `RunMethod` does the rest.
//! The pc stays on the invoke until the callee returns, so the caller frame
//! always describes the call in progress.

use std::sync::Arc;

use super::{Step, misrouted, operand_u16};
use crate::vm::action::BytecodeAction;
use crate::vm::bytecode::*;
use crate::vm::class::Class;
use crate::vm::constant_pool::{CpEntry, InterfaceDispatch, VirtualDispatch};
use crate::vm::exception::ThrowableKind;
use crate::vm::heap::HeapObject;
use crate::vm::method::Method;
use crate::vm::vm_thread::VmThread;

pub(super) fn execute(
    thread: &mut VmThread,
    method: &Method,
    class: &Arc<Class>,
    op: u8,
    pc: usize,
) -> Step {
    let index = operand_u16(method, pc + 1)?;
    match op {
        INVOKESTATIC => {
            let target = thread.resolve_static_method(class, index)?;
            Ok(stage(thread, target))
        }
        INVOKESPECIAL => {
            let target = thread.resolve_special_method(class, index)?;
            receiver(thread, &target)?;
            Ok(stage(thread, target))
        }
        INVOKEVIRTUAL => invoke_virtual(thread, class, index),
        INVOKEINTERFACE => invoke_interface(thread, index, class),
        INVOKEDYNAMIC => Err(BytecodeAction::linkage(
            ThrowableKind::InternalError,
            format!("invokedynamic is not supported ({})", method.full_name()),
        )),
        _ => Err(misrouted(op)),
    }
}

fn stage(thread: &mut VmThread, target: Arc<Method>) -> BytecodeAction {
    thread.send_method = Some(target);
    thread.send_precounted = false;
    BytecodeAction::RunMethod
}

/// The receiver of a call to `target`, which sits below its arguments.
/// Null receivers throw before any table is consulted.
fn receiver(thread: &VmThread, target: &Method) -> Result<Arc<HeapObject>, BytecodeAction> {
    let receiver = thread.ctx.peek_ref(target.arg_slots - 1);
    thread.vm.heap.get(receiver).ok_or(BytecodeAction::ThrowNullPointer)
}

fn invoke_virtual(thread: &mut VmThread, class: &Arc<Class>, index: u16) -> Step {
    let resolved = thread.resolve_virtual_method(class, index)?;
    let target = match resolved.dispatch {
        VirtualDispatch::Handle { exact } => {
            let Some(CpEntry::Method { member, .. }) = class.constant_pool.get(index) else {
                return Err(misrouted(INVOKEVIRTUAL));
            };
            return Ok(thread.invoke_method_handle(&member.descriptor, exact));
        }
        VirtualDispatch::Direct => {
            receiver(thread, &resolved.method)?;
            resolved.method
        }
        VirtualDispatch::VTable(slot) => {
            let object = receiver(thread, &resolved.method)?;
            object
                .class
                .vtable
                .get(slot)
                .cloned()
                .unwrap_or(resolved.method)
        }
    };
    Ok(stage(thread, target))
}

fn invoke_interface(thread: &mut VmThread, index: u16, class: &Arc<Class>) -> Step {
    let resolved = thread.resolve_interface_method(class, index)?;
    let object = receiver(thread, &resolved.method)?;
    let target = match resolved.dispatch {
        InterfaceDispatch::ITable(slot) => object
            .class
            .lookup_itable(resolved.interface.id, slot)
            .ok_or_else(|| {
                BytecodeAction::linkage(
                    ThrowableKind::IncompatibleClassChangeError,
                    format!(
                        "Class {} does not implement the requested interface {}",
                        object.class.name.replace('/', "."),
                        resolved.interface.name.replace('/', ".")
                    ),
                )
            })?,
        InterfaceDispatch::VTable(slot) => object
            .class
            .vtable
            .get(slot)
            .cloned()
            .unwrap_or(resolved.method),
        InterfaceDispatch::Direct => resolved.method,
    };
    Ok(stage(thread, target))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::{JitMode, RuntimeConfig};
    use crate::vm::asm::ClassBuilder;
    use crate::vm::classfile::{ACC_ABSTRACT, ACC_INTERFACE, ACC_PUBLIC, ACC_STATIC};
    use crate::vm::value::JValue;
    use crate::vm::vm::JavaVM;

    fn vm() -> Arc<JavaVM> {
        let mut config = RuntimeConfig::for_testing();
        config.jit_mode = JitMode::Off;
        JavaVM::new(config).unwrap()
    }

    fn define_shapes(vm: &JavaVM) {
        let shape = ClassBuilder::new("demo/Shape")
            .flags(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
            .abstract_method("area", "()I")
            .build();
        let square = ClassBuilder::new("demo/Square")
            .interface("demo/Shape")
            .field("side", "I", ACC_PUBLIC)
            .method(
                "area",
                "()I",
                ACC_PUBLIC,
                "aload_0\n getfield demo/Square.side I\n dup\n imul\n ireturn",
            )
            .unwrap()
            .build();
        let base = ClassBuilder::new("demo/Base")
            .method("name", "()I", ACC_PUBLIC, "iconst_1\n ireturn")
            .unwrap()
            .build();
        let derived = ClassBuilder::new("demo/Derived")
            .super_class("demo/Base")
            .method("name", "()I", ACC_PUBLIC, "iconst_2\n ireturn")
            .unwrap()
            .build();
        let user = ClassBuilder::new("demo/User")
            .method(
                "area",
                "(Ldemo/Shape;)I",
                ACC_PUBLIC | ACC_STATIC,
                "aload_0\n invokeinterface demo/Shape.area()I\n ireturn",
            )
            .unwrap()
            .method(
                "name",
                "(Ldemo/Base;)I",
                ACC_PUBLIC | ACC_STATIC,
                "aload_0\n invokevirtual demo/Base.name()I\n ireturn",
            )
            .unwrap()
            .method(
                "square",
                "(I)I",
                ACC_PUBLIC | ACC_STATIC,
                "
                new demo/Square
                dup
                iload_0
                putfield demo/Square.side I
                invokestatic demo/User.area(Ldemo/Shape;)I
                ireturn
                ",
            )
            .unwrap()
            .build();
        for class in [shape, square, base, derived, user] {
            vm.define_class(class).unwrap();
        }
    }

    #[test]
    fn test_virtual_dispatch_selects_override() {
        let vm = vm();
        define_shapes(&vm);
        let mut thread = vm.attach_thread("main");
        let derived = thread.new_instance("demo/Derived").unwrap();
        let base = thread.new_instance("demo/Base").unwrap();
        let call = |thread: &mut crate::vm::vm_thread::VmThread, r| {
            thread
                .call_static("demo/User", "name", "(Ldemo/Base;)I", &[JValue::Ref(r)])
                .unwrap()
        };
        assert_eq!(call(&mut thread, derived), JValue::Int(2));
        assert_eq!(call(&mut thread, base), JValue::Int(1));
    }

    #[test]
    fn test_interface_dispatch_through_itable() {
        let vm = vm();
        define_shapes(&vm);
        let mut thread = vm.attach_thread("main");
        let area = thread
            .call_static("demo/User", "square", "(I)I", &[JValue::Int(7)])
            .unwrap();
        assert_eq!(area, JValue::Int(49));
        let square = vm.find_class("demo/Square").unwrap();
        let shape = vm.find_class("demo/Shape").unwrap();
        assert_eq!(square.last_itable_interface(), Some(shape.id));
    }

    #[test]
    fn test_receiver_without_interface_is_icce() {
        let vm = vm();
        define_shapes(&vm);
        let mut thread = vm.attach_thread("main");
        let base = thread.new_instance("demo/Base").unwrap();
        let error = thread
            .call_static("demo/User", "area", "(Ldemo/Shape;)I", &[JValue::Ref(base)])
            .unwrap_err();
        let thrown = error.exception().unwrap();
        assert_eq!(thrown.class_name, "java/lang/IncompatibleClassChangeError");
        assert_eq!(
            thrown.message.as_deref(),
            Some("Class demo.Base does not implement the requested interface demo.Shape")
        );
    }
}
