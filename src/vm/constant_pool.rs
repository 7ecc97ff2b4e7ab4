//! Runtime constant pool. Symbolic references resolve at most once: each
//! kind of use has its own `OnceCell`, so a second resolution of the same
//! entry returns the cached result without re-running side effects such as
//! class initialization.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use super::class::{Class, FieldInfo};
use super::classfile::Constant;
use super::method::Method;
use super::value::ObjectRef;

#[derive(Debug, Clone)]
pub struct ResolvedField {
    pub class: Arc<Class>,
    pub field: FieldInfo,
}

/// How an `invokevirtual` site dispatches once resolved.
#[derive(Debug, Clone)]
pub enum VirtualDispatch {
    /// Index into the receiver class's vtable.
    VTable(usize),
    /// Private or non-overridable target; no table lookup.
    Direct,
    /// `MethodHandle.invoke` (`exact == false`) or `invokeExact`.
    Handle { exact: bool },
}

#[derive(Debug, Clone)]
pub struct ResolvedVirtual {
    pub method: Arc<Method>,
    pub dispatch: VirtualDispatch,
}

/// How an `invokeinterface` site dispatches once resolved.
#[derive(Debug, Clone)]
pub enum InterfaceDispatch {
    /// Slot in the receiver's iTable for `interface`.
    ITable(usize),
    /// A public `java/lang/Object` method, through the vtable.
    VTable(usize),
    /// Private interface method.
    Direct,
}

#[derive(Debug, Clone)]
pub struct ResolvedInterface {
    pub interface: Arc<Class>,
    pub method: Arc<Method>,
    pub dispatch: InterfaceDispatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

pub enum CpEntry {
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String {
        value: String,
        resolved: OnceCell<ObjectRef>,
    },
    Class {
        name: String,
        resolved: OnceCell<Arc<Class>>,
    },
    Field {
        member: MemberRef,
        resolved: OnceCell<ResolvedField>,
    },
    Method {
        member: MemberRef,
        is_interface: bool,
        static_ref: OnceCell<Arc<Method>>,
        special_ref: OnceCell<Arc<Method>>,
        virtual_ref: OnceCell<ResolvedVirtual>,
        interface_ref: OnceCell<ResolvedInterface>,
    },
    MethodType {
        descriptor: String,
        resolved: OnceCell<ObjectRef>,
    },
    MethodHandle {
        member: MemberRef,
        is_static: bool,
        resolved: OnceCell<ObjectRef>,
    },
}

impl CpEntry {
    fn from_constant(constant: &Constant) -> Self {
        let member = |class: &String, name: &String, descriptor: &String| MemberRef {
            class: class.clone(),
            name: name.clone(),
            descriptor: descriptor.clone(),
        };
        match constant {
            Constant::Int(v) => CpEntry::Int(*v),
            Constant::Float(v) => CpEntry::Float(*v),
            Constant::Long(v) => CpEntry::Long(*v),
            Constant::Double(v) => CpEntry::Double(*v),
            Constant::String(value) => CpEntry::String {
                value: value.clone(),
                resolved: OnceCell::new(),
            },
            Constant::Class(name) => CpEntry::Class {
                name: name.clone(),
                resolved: OnceCell::new(),
            },
            Constant::Field {
                class,
                name,
                descriptor,
            } => CpEntry::Field {
                member: member(class, name, descriptor),
                resolved: OnceCell::new(),
            },
            Constant::Method {
                class,
                name,
                descriptor,
            } => CpEntry::method(member(class, name, descriptor), false),
            Constant::InterfaceMethod {
                class,
                name,
                descriptor,
            } => CpEntry::method(member(class, name, descriptor), true),
            Constant::MethodType(descriptor) => CpEntry::MethodType {
                descriptor: descriptor.clone(),
                resolved: OnceCell::new(),
            },
            Constant::MethodHandle {
                class,
                name,
                descriptor,
                is_static,
            } => CpEntry::MethodHandle {
                member: member(class, name, descriptor),
                is_static: *is_static,
                resolved: OnceCell::new(),
            },
        }
    }

    fn method(member: MemberRef, is_interface: bool) -> Self {
        CpEntry::Method {
            member,
            is_interface,
            static_ref: OnceCell::new(),
            special_ref: OnceCell::new(),
            virtual_ref: OnceCell::new(),
            interface_ref: OnceCell::new(),
        }
    }
}

#[derive(Default)]
pub struct ConstantPool {
    entries: Vec<CpEntry>,
}

impl ConstantPool {
    pub fn from_constants(constants: &[Constant]) -> Self {
        ConstantPool {
            entries: constants.iter().map(CpEntry::from_constant).collect(),
        }
    }

    /// Entry at 1-based `index`.
    #[inline]
    pub fn get(&self, index: u16) -> Option<&CpEntry> {
        self.entries.get((index as usize).checked_sub(1)?)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Strings already turned into heap objects. They are GC roots.
    pub fn resolved_strings(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.entries.iter().filter_map(|e| match e {
            CpEntry::String { resolved, .. }
            | CpEntry::MethodType { resolved, .. }
            | CpEntry::MethodHandle { resolved, .. } => resolved.get().copied(),
            _ => None,
        })
    }
}

impl std::fmt::Debug for ConstantPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstantPool")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_one_based() {
        let pool = ConstantPool::from_constants(&[
            Constant::Int(5),
            Constant::Class("A".into()),
        ]);
        assert!(pool.get(0).is_none());
        assert!(matches!(pool.get(1), Some(CpEntry::Int(5))));
        assert!(matches!(pool.get(2), Some(CpEntry::Class { name, .. }) if name == "A"));
        assert!(pool.get(3).is_none());
    }

    #[test]
    fn test_interface_flag_survives() {
        let pool = ConstantPool::from_constants(&[Constant::InterfaceMethod {
            class: "I".into(),
            name: "m".into(),
            descriptor: "()V".into(),
        }]);
        assert!(matches!(
            pool.get(1),
            Some(CpEntry::Method { is_interface: true, .. })
        ));
    }
}
