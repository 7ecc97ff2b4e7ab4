//! Linked classes: field layout, virtual tables and interface tables.
//!
//! Everything here is immutable once [`Class::link`] returns, apart from the
//! initialization state, static field values, the lazily created class
//! mirror and the `lastITable` cache. Dispatch tables can therefore be read
//! from any thread without synchronization.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};

use super::classfile::{ACC_ABSTRACT, ACC_INTERFACE, ACC_PRIVATE, ACC_STATIC, ACC_VALUE, ClassDef};
use super::constant_pool::ConstantPool;
use super::method::{Method, parse_field_descriptor};
use super::threads::ThreadId;
use super::value::{JavaType, ObjectRef};

/// Index of a class in the VM's class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub descriptor: String,
    pub ty: JavaType,
    pub flags: u16,
    /// Index into the instance slots or the class's static slots.
    pub slot: usize,
    pub class_id: ClassId,
}

impl FieldInfo {
    pub fn is_static(&self) -> bool {
        self.flags & ACC_STATIC != 0
    }
}

/// Element type of an array class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementType {
    Primitive(JavaType),
    Reference(Arc<Class>),
}

impl ElementType {
    pub fn java_type(&self) -> JavaType {
        match self {
            ElementType::Primitive(ty) => *ty,
            ElementType::Reference(_) => JavaType::Reference,
        }
    }

    pub fn descriptor(&self) -> String {
        match self {
            ElementType::Primitive(ty) => primitive_descriptor(*ty).to_string(),
            ElementType::Reference(class) if class.is_array() => class.name.clone(),
            ElementType::Reference(class) => format!("L{};", class.name),
        }
    }
}

pub fn primitive_descriptor(ty: JavaType) -> &'static str {
    match ty {
        JavaType::Boolean => "Z",
        JavaType::Byte => "B",
        JavaType::Char => "C",
        JavaType::Short => "S",
        JavaType::Int => "I",
        JavaType::Long => "J",
        JavaType::Float => "F",
        JavaType::Double => "D",
        JavaType::Void => "V",
        JavaType::Reference => "Ljava/lang/Object;",
    }
}

/// Interface dispatch table: the implementations of one interface's methods,
/// indexed by the interface method's position.
pub struct ITable {
    pub interface: Arc<Class>,
    pub methods: Vec<Arc<Method>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Initializing(ThreadId),
    Initialized,
    Failed,
}

pub struct Class {
    pub id: ClassId,
    pub name: String,
    pub flags: u16,
    pub super_class: Option<Arc<Class>>,
    /// Directly implemented interfaces.
    pub interfaces: Vec<Arc<Class>>,
    /// Instance fields including inherited ones.
    pub instance_fields: Vec<FieldInfo>,
    pub instance_slots: usize,
    pub static_fields: Vec<FieldInfo>,
    pub statics: Box<[AtomicU64]>,
    /// Declared methods.
    pub methods: Vec<Arc<Method>>,
    pub vtable: Vec<Arc<Method>>,
    pub itables: Vec<ITable>,
    /// 1-based index of the last iTable hit; 0 when empty.
    last_itable: AtomicUsize,
    pub constant_pool: ConstantPool,
    supertypes: HashSet<ClassId>,
    /// Element type for array classes.
    pub element: Option<ElementType>,
    pub(crate) init_state: Mutex<InitState>,
    pub(crate) init_done: Condvar,
    pub(crate) mirror: OnceCell<ObjectRef>,
}

/// Inputs resolved by the VM before linking.
pub(crate) struct LinkRequest<'a> {
    pub id: ClassId,
    pub def: &'a ClassDef,
    pub super_class: Option<Arc<Class>>,
    pub interfaces: Vec<Arc<Class>>,
    pub methods: Vec<Arc<Method>>,
}

impl Class {
    /// Lay out fields and build dispatch tables. `conflict` creates the
    /// stand-in method installed where unrelated interfaces supply competing
    /// default methods.
    pub(crate) fn link(
        request: LinkRequest<'_>,
        conflict: &mut dyn FnMut(&Arc<Method>) -> Arc<Method>,
    ) -> Result<Class, String> {
        let LinkRequest {
            id,
            def,
            super_class,
            interfaces,
            methods,
        } = request;
        let is_interface = def.flags & ACC_INTERFACE != 0;

        let mut instance_fields = super_class
            .as_ref()
            .map(|s| s.instance_fields.clone())
            .unwrap_or_default();
        let mut static_fields = Vec::new();
        for field in &def.fields {
            let ty = parse_field_descriptor(&field.descriptor)
                .ok_or_else(|| format!("bad field descriptor {}", field.descriptor))?;
            let is_static = field.flags & ACC_STATIC != 0;
            let info = FieldInfo {
                name: field.name.clone(),
                descriptor: field.descriptor.clone(),
                ty,
                flags: field.flags,
                slot: if is_static {
                    static_fields.len()
                } else {
                    instance_fields.len()
                },
                class_id: id,
            };
            if is_static {
                static_fields.push(info);
            } else if is_interface {
                return Err(format!("interface field {} must be static", field.name));
            } else {
                instance_fields.push(info);
            }
        }
        let statics = (0..static_fields.len()).map(|_| AtomicU64::new(0)).collect();

        let mut supertypes = HashSet::new();
        supertypes.insert(id);
        if let Some(s) = &super_class {
            supertypes.extend(s.supertypes.iter().copied());
        }
        for i in &interfaces {
            supertypes.extend(i.supertypes.iter().copied());
        }

        if is_interface {
            let mut index = 0;
            for m in methods.iter().filter(|m| m.is_virtual()) {
                let _ = m.itable_index.set(index);
                index += 1;
            }
        }

        let all_interfaces = collect_interfaces(super_class.as_deref(), &interfaces);
        let vtable = if is_interface {
            Vec::new()
        } else {
            build_vtable(super_class.as_deref(), &methods, &all_interfaces, conflict)
        };
        let itables = if is_interface {
            Vec::new()
        } else {
            build_itables(&vtable, &all_interfaces)?
        };

        Ok(Class {
            id,
            name: def.name.clone(),
            flags: def.flags,
            super_class,
            interfaces,
            instance_slots: instance_fields.len(),
            instance_fields,
            static_fields,
            statics,
            methods,
            vtable,
            itables,
            last_itable: AtomicUsize::new(0),
            constant_pool: ConstantPool::from_constants(&def.constants),
            supertypes,
            element: None,
            init_state: Mutex::new(InitState::Uninitialized),
            init_done: Condvar::new(),
            mirror: OnceCell::new(),
        })
    }

    /// An array class. Arrays are initialized on creation and inherit
    /// `java/lang/Object`'s virtual table.
    pub(crate) fn new_array(id: ClassId, element: ElementType, object: &Arc<Class>) -> Class {
        let name = format!("[{}", element.descriptor());
        let mut supertypes = object.supertypes.clone();
        supertypes.insert(id);
        Class {
            id,
            name,
            flags: ACC_ABSTRACT,
            super_class: Some(Arc::clone(object)),
            interfaces: Vec::new(),
            instance_fields: Vec::new(),
            instance_slots: 0,
            static_fields: Vec::new(),
            statics: Box::new([]),
            methods: Vec::new(),
            vtable: object.vtable.clone(),
            itables: Vec::new(),
            last_itable: AtomicUsize::new(0),
            constant_pool: ConstantPool::default(),
            supertypes,
            element: Some(element),
            init_state: Mutex::new(InitState::Initialized),
            init_done: Condvar::new(),
            mirror: OnceCell::new(),
        }
    }

    #[inline]
    pub fn is_interface(&self) -> bool {
        self.flags & ACC_INTERFACE != 0
    }

    #[inline]
    pub fn is_abstract(&self) -> bool {
        self.flags & ACC_ABSTRACT != 0
    }

    /// Instances have no identity: no monitors, no reference equality
    /// guarantees.
    #[inline]
    pub fn is_value_type(&self) -> bool {
        self.flags & ACC_VALUE != 0 && !self.is_interface()
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        self.element.is_some()
    }

    pub fn init_state(&self) -> InitState {
        *self.init_state.lock()
    }

    pub fn is_initialized(&self) -> bool {
        self.init_state() == InitState::Initialized
    }

    /// Declared method by name and descriptor.
    pub fn declared_method(&self, name: &str, descriptor: &str) -> Option<&Arc<Method>> {
        self.methods.iter().find(|m| m.matches(name, descriptor))
    }

    /// Method resolution for class method references: this class and its
    /// superclasses, then defaults and abstract methods reachable through
    /// the virtual table.
    pub fn lookup_method(&self, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        let mut current = Some(self);
        while let Some(class) = current {
            if let Some(m) = class.declared_method(name, descriptor) {
                return Some(Arc::clone(m));
            }
            current = class.super_class.as_deref();
        }
        self.vtable
            .iter()
            .find(|m| m.matches(name, descriptor))
            .cloned()
    }

    /// Method resolution for interface method references.
    pub fn lookup_interface_method(&self, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        if let Some(m) = self.declared_method(name, descriptor) {
            return Some(Arc::clone(m));
        }
        for iface in &self.interfaces {
            if let Some(m) = iface.lookup_interface_method(name, descriptor) {
                return Some(m);
            }
        }
        None
    }

    /// Position of `name`/`descriptor` in the virtual table.
    pub fn vtable_index(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.vtable.iter().position(|m| m.matches(name, descriptor))
    }

    /// Field lookup: declared fields, then superinterfaces, then the
    /// superclass chain. Returns the declaring class with the field.
    pub fn lookup_field(
        self: &Arc<Self>,
        name: &str,
        descriptor: &str,
    ) -> Option<(Arc<Class>, FieldInfo)> {
        let declared = self
            .static_fields
            .iter()
            .chain(self.instance_fields.iter().filter(|f| f.class_id == self.id))
            .find(|f| f.name == name && f.descriptor == descriptor);
        if let Some(field) = declared {
            return Some((Arc::clone(self), field.clone()));
        }
        for iface in &self.interfaces {
            if let Some(found) = iface.lookup_field(name, descriptor) {
                return Some(found);
            }
        }
        self.super_class
            .as_ref()
            .and_then(|s| s.lookup_field(name, descriptor))
    }

    /// Interface dispatch. Checks the one-entry `lastITable` cache before
    /// walking the iTable list, and refreshes the cache on a hit.
    pub fn lookup_itable(&self, interface: ClassId, index: usize) -> Option<Arc<Method>> {
        let cached = self.last_itable.load(Ordering::Relaxed);
        if cached != 0 {
            let table = &self.itables[cached - 1];
            if table.interface.id == interface {
                return table.methods.get(index).cloned();
            }
        }
        for (i, table) in self.itables.iter().enumerate() {
            if table.interface.id == interface {
                self.last_itable.store(i + 1, Ordering::Relaxed);
                return table.methods.get(index).cloned();
            }
        }
        None
    }

    /// The interface of the last successful iTable lookup.
    pub fn last_itable_interface(&self) -> Option<ClassId> {
        match self.last_itable.load(Ordering::Relaxed) {
            0 => None,
            i => Some(self.itables[i - 1].interface.id),
        }
    }

    /// `self` is `other` or one of its subclasses/implementors.
    #[inline]
    pub fn is_subtype_of(&self, other: &Class) -> bool {
        self.supertypes.contains(&other.id)
    }

    /// Assignment compatibility including array covariance.
    pub fn is_assignable_to(&self, target: &Class) -> bool {
        if self.is_subtype_of(target) {
            return true;
        }
        match (&self.element, &target.element) {
            (Some(ElementType::Reference(from)), Some(ElementType::Reference(to))) => {
                from.is_assignable_to(to)
            }
            _ => false,
        }
    }

    pub fn static_value(&self, slot: usize) -> u64 {
        self.statics[slot].load(Ordering::Acquire)
    }

    pub fn set_static_value(&self, slot: usize, value: u64) {
        self.statics[slot].store(value, Ordering::Release);
    }

    /// `<clinit>`, if declared.
    pub fn class_initializer(&self) -> Option<&Arc<Method>> {
        self.declared_method("<clinit>", "()V")
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Class {}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("vtable", &self.vtable.len())
            .field("itables", &self.itables.len())
            .finish()
    }
}

/// All interfaces implemented by a class, its superclasses and
/// superinterfaces, without duplicates. Own interfaces come first.
fn collect_interfaces(super_class: Option<&Class>, direct: &[Arc<Class>]) -> Vec<Arc<Class>> {
    fn visit(iface: &Arc<Class>, out: &mut Vec<Arc<Class>>) {
        if out.iter().any(|i| i.id == iface.id) {
            return;
        }
        out.push(Arc::clone(iface));
        for sup in &iface.interfaces {
            visit(sup, out);
        }
    }
    let mut out = Vec::new();
    for iface in direct {
        visit(iface, &mut out);
    }
    if let Some(sup) = super_class {
        for table in &sup.itables {
            visit(&table.interface, &mut out);
        }
    }
    out
}

fn build_vtable(
    super_class: Option<&Class>,
    methods: &[Arc<Method>],
    interfaces: &[Arc<Class>],
    conflict: &mut dyn FnMut(&Arc<Method>) -> Arc<Method>,
) -> Vec<Arc<Method>> {
    let mut vtable: Vec<Arc<Method>> = super_class.map(|s| s.vtable.clone()).unwrap_or_default();
    for m in methods.iter().filter(|m| m.is_virtual()) {
        match vtable
            .iter()
            .position(|v| v.matches(&m.name, &m.descriptor))
        {
            Some(i) => vtable[i] = Arc::clone(m),
            None => vtable.push(Arc::clone(m)),
        }
    }

    // Interface methods with no class implementation get the maximally
    // specific default, an abstract stand-in, or a conflict marker.
    let is_interface_method =
        |m: &Arc<Method>| interfaces.iter().any(|i| i.id == m.class_id);
    for iface in interfaces {
        for im in iface.methods.iter().filter(|m| m.is_virtual()) {
            let existing = vtable
                .iter()
                .position(|v| v.matches(&im.name, &im.descriptor));
            if let Some(i) = existing {
                if !is_interface_method(&vtable[i]) {
                    continue;
                }
            }
            let candidates = maximally_specific(interfaces, &im.name, &im.descriptor);
            let defaults: Vec<&Arc<Method>> =
                candidates.iter().filter(|m| !m.is_abstract()).collect();
            let chosen = match defaults.len() {
                0 => Arc::clone(candidates.first().unwrap_or(im)),
                1 => Arc::clone(defaults[0]),
                _ => conflict(defaults[0]),
            };
            match existing {
                Some(i) => vtable[i] = chosen,
                None => vtable.push(chosen),
            }
        }
    }
    vtable
}

/// Interface methods named `name`/`descriptor` not overridden by a
/// subinterface that also declares them.
fn maximally_specific(interfaces: &[Arc<Class>], name: &str, descriptor: &str) -> Vec<Arc<Method>> {
    let declaring: Vec<&Arc<Class>> = interfaces
        .iter()
        .filter(|i| i.declared_method(name, descriptor).is_some())
        .collect();
    declaring
        .iter()
        .filter(|i| {
            !declaring
                .iter()
                .any(|other| other.id != i.id && other.is_subtype_of(i))
        })
        .filter_map(|i| i.declared_method(name, descriptor).cloned())
        .collect()
}

fn build_itables(vtable: &[Arc<Method>], interfaces: &[Arc<Class>]) -> Result<Vec<ITable>, String> {
    interfaces
        .iter()
        .map(|iface| {
            let methods = iface
                .methods
                .iter()
                .filter(|m| m.is_virtual())
                .map(|im| {
                    vtable
                        .iter()
                        .find(|v| v.matches(&im.name, &im.descriptor))
                        .cloned()
                        .ok_or_else(|| format!("no vtable slot for {}", im.full_name()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ITable {
                interface: Arc::clone(iface),
                methods,
            })
        })
        .collect()
}

/// Whether a private member of `owner` is accessible from `accessor`.
pub fn private_access_allowed(owner: &Class, accessor: &Class, flags: u16) -> bool {
    flags & ACC_PRIVATE == 0 || owner.id == accessor.id
}
