//! Constant pool resolution.
//!
//! Each resolver caches its result in the entry's cell for that kind of
//! use. A static member is cached only once its class is initialized, so
//! a reference seen during the class's own initializer is resolved again
//! later.

use std::sync::Arc;

use tracing::trace;

use super::action::BytecodeAction;
use super::class::{Class, private_access_allowed};
use super::classfile::ACC_FINAL;
use super::constant_pool::{
    CpEntry, InterfaceDispatch, MemberRef, ResolvedField, ResolvedInterface, ResolvedVirtual,
    VirtualDispatch,
};
use super::exception::ThrowableKind;
use super::heap::{HeapObject, ObjectBody};
use super::method::Method;
use super::method_handle::{HandleKind, MethodHandleData, MethodTypeDesc};
use super::registry::METHOD_HANDLE_CLASS;
use super::value::ObjectRef;
use super::vm_thread::VmThread;

fn bad_entry(class: &Class, index: u16, expected: &str) -> BytecodeAction {
    BytecodeAction::linkage(
        ThrowableKind::InternalError,
        format!(
            "constant pool entry {} of {} is not a {}",
            index, class.name, expected
        ),
    )
}

fn dotted(name: &str) -> String {
    name.replace('/', ".")
}

fn no_such_method(member: &MemberRef) -> BytecodeAction {
    BytecodeAction::linkage(
        ThrowableKind::NoSuchMethodError,
        format!(
            "'{}.{}{}'",
            dotted(&member.class),
            member.name,
            member.descriptor
        ),
    )
}

fn illegal_access(method: &Method, accessor: &Class) -> BytecodeAction {
    BytecodeAction::linkage(
        ThrowableKind::IllegalAccessError,
        format!(
            "tried to access method {}.{}{} from class {}",
            dotted(&method.class_name),
            method.name,
            method.descriptor,
            dotted(&accessor.name)
        ),
    )
}

fn expected_static(member: &MemberRef, want_static: bool, what: &str) -> BytecodeAction {
    BytecodeAction::linkage(
        ThrowableKind::IncompatibleClassChangeError,
        format!(
            "Expected {}{} {}.{}",
            if want_static { "static " } else { "non-static " },
            what,
            dotted(&member.class),
            member.name
        ),
    )
}

impl VmThread {
    fn cp_entry<'c>(class: &'c Class, index: u16) -> Result<&'c CpEntry, BytecodeAction> {
        class.constant_pool.get(index).ok_or_else(|| {
            BytecodeAction::linkage(
                ThrowableKind::InternalError,
                format!("bad constant pool index {} in {}", index, class.name),
            )
        })
    }

    fn load_class(&self, name: &str) -> Result<Arc<Class>, BytecodeAction> {
        self.vm
            .find_class(name)
            .ok_or_else(|| BytecodeAction::linkage(ThrowableKind::NoClassDefFoundError, name))
    }

    fn declaring_class(&self, method: &Method) -> Result<Arc<Class>, BytecodeAction> {
        self.vm
            .class(method.class_id)
            .ok_or_else(|| BytecodeAction::linkage(ThrowableKind::NoClassDefFoundError, &method.class_name))
    }

    pub(crate) fn resolve_class(&mut self, class: &Arc<Class>, index: u16) -> Result<Arc<Class>, BytecodeAction> {
        match Self::cp_entry(class, index)? {
            CpEntry::Class { name, resolved } => {
                if let Some(c) = resolved.get() {
                    return Ok(Arc::clone(c));
                }
                let target = self.load_class(name)?;
                trace!(class = %class.name, target = %target.name, "class resolved");
                Ok(Arc::clone(resolved.get_or_init(|| target)))
            }
            _ => Err(bad_entry(class, index, "class")),
        }
    }

    /// Resolve a field reference for a static (`want_static`) or instance
    /// access. Static accesses initialize the declaring class.
    pub(crate) fn resolve_field(
        &mut self,
        class: &Arc<Class>,
        index: u16,
        want_static: bool,
    ) -> Result<ResolvedField, BytecodeAction> {
        let CpEntry::Field { member, resolved } = Self::cp_entry(class, index)? else {
            return Err(bad_entry(class, index, "field reference"));
        };
        if let Some(field) = resolved.get() {
            if field.field.is_static() != want_static {
                return Err(expected_static(member, want_static, "field"));
            }
            return Ok(field.clone());
        }

        let owner = self.load_class(&member.class)?;
        let (declaring, field) = owner
            .lookup_field(&member.name, &member.descriptor)
            .ok_or_else(|| BytecodeAction::linkage(ThrowableKind::NoSuchFieldError, member.name.clone()))?;
        if field.is_static() != want_static {
            return Err(expected_static(member, want_static, "field"));
        }
        if !private_access_allowed(&declaring, class, field.flags) {
            return Err(BytecodeAction::linkage(
                ThrowableKind::IllegalAccessError,
                format!(
                    "tried to access field {}.{} from class {}",
                    dotted(&declaring.name),
                    field.name,
                    dotted(&class.name)
                ),
            ));
        }
        if want_static {
            self.initialize_class(&declaring)?;
        }
        let result = ResolvedField {
            class: Arc::clone(&declaring),
            field,
        };
        if !want_static || declaring.is_initialized() {
            let _ = resolved.set(result.clone());
        }
        Ok(result)
    }

    fn method_entry<'c>(class: &'c Class, index: u16) -> Result<(&'c MemberRef, bool, &'c CpEntry), BytecodeAction> {
        let entry = Self::cp_entry(class, index)?;
        match entry {
            CpEntry::Method {
                member,
                is_interface,
                ..
            } => Ok((member, *is_interface, entry)),
            _ => Err(bad_entry(class, index, "method reference")),
        }
    }

    fn lookup_member(&self, owner: &Class, member: &MemberRef, is_interface: bool) -> Result<Arc<Method>, BytecodeAction> {
        let found = if is_interface {
            owner.lookup_interface_method(&member.name, &member.descriptor)
        } else {
            owner.lookup_method(&member.name, &member.descriptor)
        };
        found.ok_or_else(|| no_such_method(member))
    }

    /// `invokestatic`: initializes the declaring class.
    pub(crate) fn resolve_static_method(&mut self, class: &Arc<Class>, index: u16) -> Result<Arc<Method>, BytecodeAction> {
        let (member, is_interface, entry) = Self::method_entry(class, index)?;
        let CpEntry::Method { static_ref, .. } = entry else {
            return Err(bad_entry(class, index, "method reference"));
        };
        if let Some(method) = static_ref.get() {
            return Ok(Arc::clone(method));
        }
        let owner = self.load_class(&member.class)?;
        let method = self.lookup_member(&owner, member, is_interface)?;
        if !method.is_static() {
            return Err(expected_static(member, true, "method"));
        }
        let declaring = self.declaring_class(&method)?;
        if !private_access_allowed(&declaring, class, method.flags) {
            return Err(illegal_access(&method, class));
        }
        self.initialize_class(&declaring)?;
        if declaring.is_initialized() {
            let _ = static_ref.set(Arc::clone(&method));
        }
        Ok(method)
    }

    /// `invokespecial`: constructors, private methods and superclass
    /// calls. A superclass method is selected starting from the caller's
    /// direct superclass.
    pub(crate) fn resolve_special_method(&mut self, class: &Arc<Class>, index: u16) -> Result<Arc<Method>, BytecodeAction> {
        let (member, is_interface, entry) = Self::method_entry(class, index)?;
        let CpEntry::Method { special_ref, .. } = entry else {
            return Err(bad_entry(class, index, "method reference"));
        };
        if let Some(method) = special_ref.get() {
            return Ok(Arc::clone(method));
        }
        let owner = self.load_class(&member.class)?;
        let mut method = self.lookup_member(&owner, member, is_interface)?;
        if method.is_static() {
            return Err(expected_static(member, false, "method"));
        }
        let declaring = self.declaring_class(&method)?;
        if !private_access_allowed(&declaring, class, method.flags) {
            return Err(illegal_access(&method, class));
        }
        let super_call = !method.is_private()
            && !method.is_initializer()
            && !owner.is_interface()
            && owner.id != class.id
            && class.is_subtype_of(&owner);
        if super_call {
            if let Some(selected) = class
                .super_class
                .as_ref()
                .and_then(|s| s.lookup_method(&member.name, &member.descriptor))
            {
                method = selected;
            }
        }
        if method.is_abstract() {
            return Err(BytecodeAction::linkage(
                ThrowableKind::AbstractMethodError,
                format!("{}.{}{}", dotted(&method.class_name), method.name, method.descriptor),
            ));
        }
        Ok(Arc::clone(special_ref.get_or_init(|| method)))
    }

    /// `invokevirtual`. References to `MethodHandle.invoke`/`invokeExact`
    /// resolve to handle dispatch whatever their descriptor.
    pub(crate) fn resolve_virtual_method(&mut self, class: &Arc<Class>, index: u16) -> Result<ResolvedVirtual, BytecodeAction> {
        let (member, is_interface, entry) = Self::method_entry(class, index)?;
        let CpEntry::Method { virtual_ref, .. } = entry else {
            return Err(bad_entry(class, index, "method reference"));
        };
        if let Some(resolved) = virtual_ref.get() {
            return Ok(resolved.clone());
        }

        if member.class == METHOD_HANDLE_CLASS
            && (member.name == "invoke" || member.name == "invokeExact")
        {
            let owner = self.load_class(&member.class)?;
            let method = owner
                .methods
                .iter()
                .find(|m| m.name == member.name)
                .cloned()
                .ok_or_else(|| no_such_method(member))?;
            let exact = member.name == "invokeExact";
            let resolved = ResolvedVirtual {
                method,
                dispatch: VirtualDispatch::Handle { exact },
            };
            return Ok(virtual_ref.get_or_init(|| resolved).clone());
        }

        if is_interface {
            return Err(BytecodeAction::linkage(
                ThrowableKind::IncompatibleClassChangeError,
                format!("Found interface {}, but class was expected", dotted(&member.class)),
            ));
        }
        let owner = self.load_class(&member.class)?;
        let method = self.lookup_member(&owner, member, false)?;
        if method.is_static() {
            return Err(expected_static(member, false, "method"));
        }
        let declaring = self.declaring_class(&method)?;
        if !private_access_allowed(&declaring, class, method.flags) {
            return Err(illegal_access(&method, class));
        }
        let dispatch = if method.is_private() || method.flags & ACC_FINAL != 0 {
            VirtualDispatch::Direct
        } else {
            match owner.vtable_index(&member.name, &member.descriptor) {
                Some(i) => VirtualDispatch::VTable(i),
                None => VirtualDispatch::Direct,
            }
        };
        let resolved = ResolvedVirtual { method, dispatch };
        Ok(virtual_ref.get_or_init(|| resolved).clone())
    }

    /// `invokeinterface`. Public `Object` methods named through an
    /// interface dispatch through the vtable.
    pub(crate) fn resolve_interface_method(&mut self, class: &Arc<Class>, index: u16) -> Result<ResolvedInterface, BytecodeAction> {
        let (member, is_interface, entry) = Self::method_entry(class, index)?;
        let CpEntry::Method { interface_ref, .. } = entry else {
            return Err(bad_entry(class, index, "method reference"));
        };
        if let Some(resolved) = interface_ref.get() {
            return Ok(resolved.clone());
        }
        let owner = self.load_class(&member.class)?;
        if !is_interface || !owner.is_interface() {
            return Err(BytecodeAction::linkage(
                ThrowableKind::IncompatibleClassChangeError,
                format!("Found class {}, but interface was expected", dotted(&member.class)),
            ));
        }

        let resolved = if let Some(method) = owner.lookup_interface_method(&member.name, &member.descriptor) {
            let interface = self.declaring_class(&method)?;
            let dispatch = match method.itable_index() {
                Some(i) if !method.is_private() => InterfaceDispatch::ITable(i),
                _ => InterfaceDispatch::Direct,
            };
            ResolvedInterface {
                interface,
                method,
                dispatch,
            }
        } else {
            let object = Arc::clone(self.vm.object_class());
            let method = object
                .lookup_method(&member.name, &member.descriptor)
                .filter(|m| !m.is_static() && !m.is_private())
                .ok_or_else(|| no_such_method(member))?;
            let index = object
                .vtable_index(&member.name, &member.descriptor)
                .ok_or_else(|| no_such_method(member))?;
            ResolvedInterface {
                interface: owner,
                method,
                dispatch: InterfaceDispatch::VTable(index),
            }
        };
        Ok(interface_ref.get_or_init(|| resolved).clone())
    }

    // =========================================================================
    // Loadable constants
    // =========================================================================

    pub(crate) fn resolve_string(&mut self, class: &Arc<Class>, index: u16) -> Result<ObjectRef, BytecodeAction> {
        let CpEntry::String { value, resolved } = Self::cp_entry(class, index)? else {
            return Err(bad_entry(class, index, "string"));
        };
        if let Some(r) = resolved.get() {
            return Ok(*r);
        }
        let object = self.allocate(self.vm.string_object(value.clone()))?;
        Ok(*resolved.get_or_init(|| object))
    }

    pub(crate) fn resolve_method_type(&mut self, class: &Arc<Class>, index: u16) -> Result<ObjectRef, BytecodeAction> {
        let CpEntry::MethodType { descriptor, resolved } = Self::cp_entry(class, index)? else {
            return Err(bad_entry(class, index, "method type"));
        };
        if let Some(r) = resolved.get() {
            return Ok(*r);
        }
        let desc = MethodTypeDesc::parse(descriptor).ok_or_else(|| {
            BytecodeAction::linkage(
                ThrowableKind::LinkageError,
                format!("malformed method type {}", descriptor),
            )
        })?;
        let object = self.allocate(HeapObject::new(
            Arc::clone(self.vm.method_type_class()),
            ObjectBody::MethodType(desc),
        ))?;
        Ok(*resolved.get_or_init(|| object))
    }

    pub(crate) fn resolve_method_handle(&mut self, class: &Arc<Class>, index: u16) -> Result<ObjectRef, BytecodeAction> {
        let CpEntry::MethodHandle {
            member,
            is_static,
            resolved,
        } = Self::cp_entry(class, index)?
        else {
            return Err(bad_entry(class, index, "method handle"));
        };
        if let Some(r) = resolved.get() {
            return Ok(*r);
        }
        let owner = self.load_class(&member.class)?;
        let target = owner
            .lookup_method(&member.name, &member.descriptor)
            .or_else(|| owner.lookup_interface_method(&member.name, &member.descriptor))
            .ok_or_else(|| no_such_method(member))?;
        if target.is_static() != *is_static {
            return Err(expected_static(member, *is_static, "method"));
        }
        let declaring = self.declaring_class(&target)?;
        if !private_access_allowed(&declaring, class, target.flags) {
            return Err(illegal_access(&target, class));
        }
        let kind = if target.is_static() {
            HandleKind::Static
        } else if target.is_private() {
            HandleKind::Special
        } else {
            HandleKind::Virtual
        };
        let object = self.allocate(HeapObject::new(
            Arc::clone(self.vm.method_handle_class()),
            ObjectBody::MethodHandle(MethodHandleData::new(target, kind)),
        ))?;
        Ok(*resolved.get_or_init(|| object))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::RuntimeConfig;
    use crate::vm::action::BytecodeAction;
    use crate::vm::asm::ClassBuilder;
    use crate::vm::classfile::{ACC_PUBLIC, ACC_STATIC};
    use crate::vm::exception::ThrowableKind;
    use crate::vm::value::JValue;
    use crate::vm::vm::JavaVM;

    fn vm() -> Arc<JavaVM> {
        JavaVM::new(RuntimeConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_static_resolution_is_cached_and_initializes_once() {
        let vm = vm();
        let target = ClassBuilder::new("demo/Counter")
            .field("count", "I", ACC_STATIC)
            .method(
                "<clinit>",
                "()V",
                ACC_STATIC,
                "getstatic demo/Counter.count I\n iconst_1\n iadd\n putstatic demo/Counter.count I\n return",
            )
            .unwrap()
            .method("get", "()I", ACC_PUBLIC | ACC_STATIC, "getstatic demo/Counter.count I\n ireturn")
            .unwrap()
            .build();
        vm.define_class(target).unwrap();
        let caller = ClassBuilder::new("demo/Caller")
            .method(
                "run",
                "()I",
                ACC_PUBLIC | ACC_STATIC,
                "invokestatic demo/Counter.get()I\n invokestatic demo/Counter.get()I\n iadd\n ireturn",
            )
            .unwrap()
            .build();
        let caller = vm.define_class(caller).unwrap();

        let mut thread = vm.attach_thread("main");
        let first = thread.resolve_static_method(&caller, 1).unwrap();
        let second = thread.resolve_static_method(&caller, 1).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let result = thread.call_static("demo/Caller", "run", "()I", &[]).unwrap();
        assert_eq!(result, JValue::Int(2));
    }

    #[test]
    fn test_missing_member_is_a_linkage_error() {
        let vm = vm();
        let caller = ClassBuilder::new("demo/Broken")
            .method(
                "run",
                "()V",
                ACC_PUBLIC | ACC_STATIC,
                "invokestatic java/lang/Object.missing()V\n return",
            )
            .unwrap()
            .build();
        let caller = vm.define_class(caller).unwrap();
        let mut thread = vm.attach_thread("main");
        let error = thread.resolve_static_method(&caller, 1).unwrap_err();
        assert!(matches!(
            error,
            BytecodeAction::ThrowLinkage { kind: ThrowableKind::NoSuchMethodError, .. }
        ));
    }

    #[test]
    fn test_instance_field_through_static_access_is_icce() {
        let vm = vm();
        let class = ClassBuilder::new("demo/Point")
            .field("x", "I", ACC_PUBLIC)
            .method(
                "bad",
                "()I",
                ACC_PUBLIC | ACC_STATIC,
                "getstatic demo/Point.x I\n ireturn",
            )
            .unwrap()
            .build();
        let class = vm.define_class(class).unwrap();
        let mut thread = vm.attach_thread("main");
        let error = thread.resolve_field(&class, 1, true).unwrap_err();
        assert!(matches!(
            error,
            BytecodeAction::ThrowLinkage { kind: ThrowableKind::IncompatibleClassChangeError, .. }
        ));
    }
}
