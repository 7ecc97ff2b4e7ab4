//! Bootstrap classes every VM starts with.
//!
//! `java/lang/Object`, `String`, `Class`, the throwable hierarchy the engine
//! raises on its own, and the few library classes whose natives are built
//! in. Bodies are written in assembler text.

use std::sync::Arc;

use super::asm::ClassBuilder;
use super::class::Class;
use super::classfile::{ACC_ABSTRACT, ACC_FINAL, ACC_PUBLIC, ACC_STATIC, ClassDef};
use super::exception::ThrowableKind;
use super::registry::{ClassRegistry, METHOD_HANDLE_CLASS, OBJECT_CLASS};
use crate::error::{VmError, VmResult};

pub(crate) const STRING_CLASS: &str = "java/lang/String";
pub(crate) const CLASS_CLASS: &str = "java/lang/Class";
pub(crate) const METHOD_TYPE_CLASS: &str = "java/lang/invoke/MethodType";

const THROWABLE: &str = "java/lang/Throwable";

/// Instance slots of `Throwable`'s fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ThrowableLayout {
    pub message_slot: usize,
    pub cause_slot: usize,
}

pub(crate) struct WellKnown {
    pub object: Arc<Class>,
    pub string: Arc<Class>,
    pub class: Arc<Class>,
    pub method_type: Arc<Class>,
    pub method_handle: Arc<Class>,
    /// Indexed by `ThrowableKind as usize`.
    pub throwables: Vec<Arc<Class>>,
    pub layout: ThrowableLayout,
}

fn object_def() -> VmResult<ClassDef> {
    Ok(ClassBuilder::new(OBJECT_CLASS)
        .no_super()
        .flags(ACC_PUBLIC)
        .method("<init>", "()V", ACC_PUBLIC, "return")?
        .method(
            "equals",
            "(Ljava/lang/Object;)Z",
            ACC_PUBLIC,
            "
                aload_0
                aload_1
                if_acmpne different
                iconst_1
                ireturn
            different:
                iconst_0
                ireturn
            ",
        )?
        .native_method("hashCode", "()I", ACC_PUBLIC)
        .native_method("getClass", "()Ljava/lang/Class;", ACC_PUBLIC | ACC_FINAL)
        .native_method("wait", "()V", ACC_PUBLIC | ACC_FINAL)
        .native_method("wait", "(J)V", ACC_PUBLIC | ACC_FINAL)
        .native_method("notify", "()V", ACC_PUBLIC | ACC_FINAL)
        .native_method("notifyAll", "()V", ACC_PUBLIC | ACC_FINAL)
        .build())
}

fn throwable_def() -> VmResult<ClassDef> {
    Ok(ClassBuilder::new(THROWABLE)
        .flags(ACC_PUBLIC)
        .field("message", "Ljava/lang/String;", 0)
        .field("cause", "Ljava/lang/Throwable;", 0)
        .method(
            "<init>",
            "()V",
            ACC_PUBLIC,
            "
                aload_0
                invokespecial java/lang/Object.<init>()V
                return
            ",
        )?
        .method(
            "<init>",
            "(Ljava/lang/String;)V",
            ACC_PUBLIC,
            "
                aload_0
                invokespecial java/lang/Object.<init>()V
                aload_0
                aload_1
                putfield java/lang/Throwable.message Ljava/lang/String;
                return
            ",
        )?
        .method(
            "<init>",
            "(Ljava/lang/String;Ljava/lang/Throwable;)V",
            ACC_PUBLIC,
            "
                aload_0
                invokespecial java/lang/Object.<init>()V
                aload_0
                aload_1
                putfield java/lang/Throwable.message Ljava/lang/String;
                aload_0
                aload_2
                putfield java/lang/Throwable.cause Ljava/lang/Throwable;
                return
            ",
        )?
        .method(
            "getMessage",
            "()Ljava/lang/String;",
            ACC_PUBLIC,
            "
                aload_0
                getfield java/lang/Throwable.message Ljava/lang/String;
                areturn
            ",
        )?
        .method(
            "getCause",
            "()Ljava/lang/Throwable;",
            ACC_PUBLIC,
            "
                aload_0
                getfield java/lang/Throwable.cause Ljava/lang/Throwable;
                areturn
            ",
        )?
        .build())
}

/// A throwable subclass with the two usual constructors delegating to its
/// superclass.
fn throwable_subclass_def(kind: ThrowableKind, parent: ThrowableKind) -> VmResult<ClassDef> {
    let parent = parent.class_name();
    Ok(ClassBuilder::new(kind.class_name())
        .super_class(parent)
        .flags(ACC_PUBLIC)
        .method(
            "<init>",
            "()V",
            ACC_PUBLIC,
            &format!("aload_0\ninvokespecial {}.<init>()V\nreturn", parent),
        )?
        .method(
            "<init>",
            "(Ljava/lang/String;)V",
            ACC_PUBLIC,
            &format!(
                "aload_0\naload_1\ninvokespecial {}.<init>(Ljava/lang/String;)V\nreturn",
                parent
            ),
        )?
        .build())
}

fn library_defs() -> Vec<ClassDef> {
    vec![
        ClassBuilder::new("java/lang/Thread")
            .flags(ACC_PUBLIC)
            .native_method("interrupted", "()Z", ACC_PUBLIC | ACC_STATIC)
            .native_method("yield", "()V", ACC_PUBLIC | ACC_STATIC)
            .build(),
        ClassBuilder::new("java/lang/System")
            .flags(ACC_PUBLIC | ACC_FINAL)
            .native_method("identityHashCode", "(Ljava/lang/Object;)I", ACC_PUBLIC | ACC_STATIC)
            .native_method(
                "arraycopy",
                "(Ljava/lang/Object;ILjava/lang/Object;II)V",
                ACC_PUBLIC | ACC_STATIC,
            )
            .build(),
        ClassBuilder::new(METHOD_TYPE_CLASS)
            .flags(ACC_PUBLIC | ACC_FINAL)
            .build(),
        ClassBuilder::new(METHOD_HANDLE_CLASS)
            .flags(ACC_PUBLIC | ACC_ABSTRACT)
            .native_method(
                "invoke",
                "([Ljava/lang/Object;)Ljava/lang/Object;",
                ACC_PUBLIC | ACC_FINAL,
            )
            .native_method(
                "invokeExact",
                "([Ljava/lang/Object;)Ljava/lang/Object;",
                ACC_PUBLIC | ACC_FINAL,
            )
            .build(),
    ]
}

/// Define the bootstrap classes into an empty registry.
pub(crate) fn bootstrap(registry: &mut ClassRegistry) -> VmResult<WellKnown> {
    let object = registry.define(&object_def()?, None)?.class;
    let string = registry
        .define(&ClassBuilder::new(STRING_CLASS).flags(ACC_PUBLIC | ACC_FINAL).build(), None)?
        .class;
    let class = registry
        .define(&ClassBuilder::new(CLASS_CLASS).flags(ACC_PUBLIC | ACC_FINAL).build(), None)?
        .class;

    let mut throwables = Vec::with_capacity(ThrowableKind::ALL.len());
    for kind in ThrowableKind::ALL {
        let def = match kind.super_kind() {
            None => throwable_def()?,
            Some(parent) => throwable_subclass_def(kind, parent)?,
        };
        throwables.push(registry.define(&def, None)?.class);
    }

    for def in library_defs() {
        registry.define(&def, None)?;
    }
    let lookup = |name: &str| {
        registry.class_by_name(name).ok_or_else(|| VmError::ClassNotFound(name.to_string()))
    };
    let method_type = lookup(METHOD_TYPE_CLASS)?;
    let method_handle = lookup(METHOD_HANDLE_CLASS)?;

    let throwable = &throwables[ThrowableKind::Throwable as usize];
    let slot = |name: &str| {
        throwable
            .instance_fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.slot)
            .ok_or_else(|| VmError::ClassFormat {
                class: THROWABLE.to_string(),
                message: format!("missing field {}", name),
            })
    };
    let layout = ThrowableLayout {
        message_slot: slot("message")?,
        cause_slot: slot("cause")?,
    };

    Ok(WellKnown {
        object,
        string,
        class,
        method_type,
        method_handle,
        throwables,
        layout,
    })
}
