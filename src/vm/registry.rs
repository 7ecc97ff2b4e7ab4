//! The class and method tables.
//!
//! Classes and methods are numbered densely in definition order; a
//! [`MethodId`] is an index into the method table and a [`ClassId`] an
//! index into the class table. Entries are never removed.

use std::collections::HashMap;
use std::sync::Arc;

use super::class::{Class, ClassId, ElementType, LinkRequest};
use super::classfile::ClassDef;
use super::method::{Method, MethodId, parse_field_descriptor};
use super::run_target::SendTarget;
use crate::error::{VmError, VmResult};

pub(crate) const OBJECT_CLASS: &str = "java/lang/Object";
pub(crate) const METHOD_HANDLE_CLASS: &str = "java/lang/invoke/MethodHandle";

/// Result of defining one class.
pub(crate) struct Defined {
    pub class: Arc<Class>,
    /// Superclass methods the new class overrides. Compiled code that
    /// assumed any of them has no overriders is now stale.
    pub overridden: Vec<MethodId>,
}

#[derive(Default)]
pub(crate) struct ClassRegistry {
    classes: Vec<Arc<Class>>,
    by_name: HashMap<String, ClassId>,
    methods: Vec<Arc<Method>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link `def` and add it. Nothing is added when linking fails.
    pub fn define(&mut self, def: &ClassDef, initial_count: Option<u32>) -> VmResult<Defined> {
        let format_error = |message: String| VmError::ClassFormat {
            class: def.name.clone(),
            message,
        };
        if self.by_name.contains_key(&def.name) {
            return Err(format_error("duplicate class definition".to_string()));
        }
        if def.name.starts_with('[') {
            return Err(format_error("array classes cannot be defined".to_string()));
        }

        let super_class = match &def.super_name {
            Some(name) => {
                let class = self
                    .class_by_name(name)
                    .ok_or_else(|| VmError::ClassNotFound(name.clone()))?;
                if class.is_interface() {
                    return Err(format_error(format!("superclass {} is an interface", name)));
                }
                Some(class)
            }
            None if def.name == OBJECT_CLASS => None,
            None => return Err(format_error("missing superclass".to_string())),
        };
        let mut interfaces = Vec::with_capacity(def.interfaces.len());
        for name in &def.interfaces {
            let iface = self
                .class_by_name(name)
                .ok_or_else(|| VmError::ClassNotFound(name.clone()))?;
            if !iface.is_interface() {
                return Err(format_error(format!("{} is not an interface", name)));
            }
            interfaces.push(iface);
        }

        let id = ClassId(self.classes.len() as u32);
        let first_method = self.methods.len() as u32;
        let mut declared = Vec::with_capacity(def.methods.len());
        for (i, method_def) in def.methods.iter().enumerate() {
            let method = Method::from_def(
                method_def,
                MethodId(first_method + i as u32),
                id,
                &def.name,
                initial_count,
            )
            .map_err(format_error)?;
            let method = if def.name == METHOD_HANDLE_CLASS
                && method.is_native()
                && matches!(method.name.as_str(), "invoke" | "invokeExact")
            {
                method.with_send_target(SendTarget::InvokeHandle)
            } else {
                method
            };
            declared.push(Arc::new(method));
        }

        let next_id = first_method + declared.len() as u32;
        let mut stand_ins: Vec<Arc<Method>> = Vec::new();
        let class = Class::link(
            LinkRequest {
                id,
                def,
                super_class: super_class.clone(),
                interfaces,
                methods: declared.clone(),
            },
            &mut |template| {
                let id = MethodId(next_id + stand_ins.len() as u32);
                let stand_in = Arc::new(Method::stand_in(template, id, SendTarget::DefaultConflict));
                stand_ins.push(Arc::clone(&stand_in));
                stand_in
            },
        )
        .map_err(format_error)?;

        let overridden = super_class
            .as_ref()
            .map(|parent| {
                parent
                    .vtable
                    .iter()
                    .zip(&class.vtable)
                    .filter(|(inherited, own)| inherited.id != own.id)
                    .map(|(inherited, _)| inherited.id)
                    .collect()
            })
            .unwrap_or_default();

        self.methods.extend(declared);
        self.methods.extend(stand_ins);
        let class = Arc::new(class);
        self.by_name.insert(def.name.clone(), id);
        self.classes.push(Arc::clone(&class));
        Ok(Defined { class, overridden })
    }

    /// The array class `name` (`[I`, `[[Ljava/lang/String;`, ...), created
    /// on first use. `None` when an element class is not loaded.
    pub fn array_class(&mut self, name: &str) -> Option<Arc<Class>> {
        if let Some(existing) = self.class_by_name(name) {
            return Some(existing);
        }
        let element_desc = name.strip_prefix('[')?;
        let element = match element_desc.as_bytes().first()? {
            b'[' => ElementType::Reference(self.array_class(element_desc)?),
            b'L' => {
                let inner = element_desc.strip_prefix('L')?.strip_suffix(';')?;
                ElementType::Reference(self.class_by_name(inner)?)
            }
            _ if element_desc.len() == 1 => {
                ElementType::Primitive(parse_field_descriptor(element_desc)?)
            }
            _ => return None,
        };
        let object = self.class_by_name(OBJECT_CLASS)?;
        let id = ClassId(self.classes.len() as u32);
        let class = Arc::new(Class::new_array(id, element, &object));
        self.by_name.insert(class.name.clone(), id);
        self.classes.push(Arc::clone(&class));
        Some(class)
    }

    pub fn class(&self, id: ClassId) -> Option<Arc<Class>> {
        self.classes.get(id.0 as usize).cloned()
    }

    pub fn class_by_name(&self, name: &str) -> Option<Arc<Class>> {
        self.by_name.get(name).and_then(|id| self.class(*id))
    }

    pub fn method(&self, id: MethodId) -> Option<Arc<Method>> {
        self.methods.get(id.0 as usize).cloned()
    }

    pub fn classes(&self) -> &[Arc<Class>] {
        &self.classes
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::asm::ClassBuilder;
    use crate::vm::classfile::{ACC_PUBLIC, ACC_STATIC};

    fn registry_with_object() -> ClassRegistry {
        let mut registry = ClassRegistry::new();
        let object = ClassBuilder::new(OBJECT_CLASS)
            .no_super()
            .method("<init>", "()V", ACC_PUBLIC, "return")
            .unwrap()
            .method("toString", "()Ljava/lang/String;", ACC_PUBLIC, "aconst_null\nareturn")
            .unwrap()
            .build();
        registry.define(&object, None).unwrap();
        registry
    }

    #[test]
    fn test_method_ids_index_the_table() {
        let mut registry = registry_with_object();
        let def = ClassBuilder::new("demo/A")
            .method("f", "()V", ACC_PUBLIC | ACC_STATIC, "return")
            .unwrap()
            .build();
        let defined = registry.define(&def, None).unwrap();
        for m in &defined.class.methods {
            assert_eq!(registry.method(m.id).unwrap().full_name(), m.full_name());
        }
    }

    #[test]
    fn test_duplicate_and_missing_super_rejected() {
        let mut registry = registry_with_object();
        let def = ClassBuilder::new("demo/A").build();
        registry.define(&def, None).unwrap();
        assert!(matches!(
            registry.define(&def, None),
            Err(VmError::ClassFormat { .. })
        ));
        let orphan = ClassBuilder::new("demo/B").super_class("demo/Missing").build();
        assert!(matches!(
            registry.define(&orphan, None),
            Err(VmError::ClassNotFound(name)) if name == "demo/Missing"
        ));
        assert!(registry.class_by_name("demo/B").is_none());
    }

    #[test]
    fn test_override_is_reported() {
        let mut registry = registry_with_object();
        let object_to_string = registry
            .class_by_name(OBJECT_CLASS)
            .unwrap()
            .lookup_method("toString", "()Ljava/lang/String;")
            .unwrap();
        let def = ClassBuilder::new("demo/A")
            .method("toString", "()Ljava/lang/String;", ACC_PUBLIC, "aconst_null\nareturn")
            .unwrap()
            .build();
        let defined = registry.define(&def, None).unwrap();
        assert_eq!(defined.overridden, vec![object_to_string.id]);
    }

    #[test]
    fn test_nested_array_classes() {
        let mut registry = registry_with_object();
        let nested = registry.array_class("[[I").unwrap();
        assert_eq!(nested.name, "[[I");
        assert!(registry.class_by_name("[I").is_some());
        let objects = registry.array_class("[Ljava/lang/Object;").unwrap();
        assert!(objects.is_array());
        assert!(registry.array_class("[Ldemo/Missing;").is_none());
        assert!(registry.array_class("[Q").is_none());
    }
}
