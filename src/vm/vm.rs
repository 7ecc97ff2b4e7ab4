//! The shared half of the engine: classes, heap, monitors, natives, the JIT
//! and the thread registry. Per-thread execution state lives in
//! [`VmThread`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use super::bootstrap::{ThrowableLayout, WellKnown, bootstrap};
use super::class::{Class, ClassId};
use super::classfile::ClassDef;
use super::exception::ThrowableKind;
use super::heap::{Heap, HeapObject, ObjectBody};
use super::method::{Method, MethodId};
use super::monitor::MonitorTable;
use super::native::{NativeEnv, NativeRegistry, builtin_natives};
use super::registry::ClassRegistry;
use super::stack::{HeapSegmentProvider, StackSegmentProvider};
use super::threads::{ThreadHandle, ThreadRegistry};
use super::value::{JValue, ObjectRef, Word};
use super::vm_access::VmAccess;
use super::vm_thread::VmThread;
use crate::config::RuntimeConfig;
use crate::error::{VmError, VmResult};
use crate::jit::{JitCompiler, JitConfig, TransitionStats, default_compiler};

/// Counters reported by `--stats`.
#[derive(Debug, Clone, Serialize)]
pub struct VmStats {
    pub classes: usize,
    pub methods: usize,
    pub heap_objects: usize,
    pub heap_bytes: usize,
    pub collections: usize,
    pub monitors: usize,
    pub threads: usize,
    pub compiled_methods: usize,
    pub transitions: TransitionStats,
}

/// The virtual machine.
pub struct JavaVM {
    pub(crate) config: RuntimeConfig,
    /// Loaded classes and every method they declare.
    registry: RwLock<ClassRegistry>,
    pub(crate) heap: Heap,
    pub(crate) monitors: MonitorTable,
    pub(crate) natives: NativeRegistry,
    /// Shared while executing bytecode, exclusive for collections.
    pub(crate) access: VmAccess,
    pub(crate) threads: ThreadRegistry,
    pub(crate) stack_provider: Box<dyn StackSegmentProvider>,
    pub(crate) jit: JitConfig,
    /// Bumped by every class definition, under the registry write lock.
    hierarchy_epoch: AtomicU64,
    well_known: WellKnown,
}

impl JavaVM {
    /// A VM with the default compiler (when the `jit` feature is built) and
    /// heap-backed stack growth.
    pub fn new(config: RuntimeConfig) -> VmResult<Arc<Self>> {
        Self::new_with(config, default_compiler(), Box::new(HeapSegmentProvider))
    }

    /// A VM with an explicit compiler and stack segment provider.
    pub fn new_with(
        config: RuntimeConfig,
        compiler: Option<Box<dyn JitCompiler>>,
        stack_provider: Box<dyn StackSegmentProvider>,
    ) -> VmResult<Arc<Self>> {
        let mut registry = ClassRegistry::new();
        let well_known = bootstrap(&mut registry)?;
        let compiler = if config.jit_mode.is_enabled() {
            compiler
        } else {
            None
        };
        let vm = JavaVM {
            heap: Heap::new(config.heap_limit),
            monitors: MonitorTable::new(config.monitor_limit),
            natives: NativeRegistry::default(),
            access: VmAccess::new(),
            threads: ThreadRegistry::default(),
            stack_provider,
            jit: JitConfig::new(compiler, config.trace_jit),
            registry: RwLock::new(registry),
            hierarchy_epoch: AtomicU64::new(0),
            well_known,
            config,
        };
        for (class, name, descriptor, f) in builtin_natives() {
            vm.natives.register(class, name, descriptor, f);
        }
        info!(
            jit = vm.jit.compiler_name().unwrap_or("off"),
            threshold = vm.config.jit_threshold,
            stack_words = vm.config.stack.initial_words,
            "VM started"
        );
        Ok(Arc::new(vm))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Invocation count new methods start with, or `None` when nothing
    /// would compile them.
    fn initial_count(&self) -> Option<u32> {
        self.jit.compiler.as_ref().map(|_| self.config.jit_threshold)
    }

    // =========================================================================
    // Classes and methods
    // =========================================================================

    /// Link and add a class. Compiled code that assumed a method the new
    /// class overrides is invalidated.
    pub fn define_class(&self, def: ClassDef) -> VmResult<Arc<Class>> {
        let defined = {
            let mut registry = self.registry.write();
            let defined = registry.define(&def, self.initial_count())?;
            self.hierarchy_epoch.fetch_add(1, Ordering::AcqRel);
            defined
        };
        let mut invalidated = 0;
        for id in &defined.overridden {
            invalidated += self
                .jit
                .code_cache
                .invalidate_assumption(*id, self.config.jit_threshold, &self.jit.counters);
        }
        debug!(
            class = %defined.class.name,
            methods = defined.class.methods.len(),
            invalidated,
            "defined class"
        );
        Ok(defined.class)
    }

    /// Changes whenever a class is defined.
    pub fn hierarchy_epoch(&self) -> u64 {
        self.hierarchy_epoch.load(Ordering::Acquire)
    }

    /// Whether some loaded class overrides the virtual method `id`.
    pub fn has_overrider(&self, id: MethodId) -> bool {
        let registry = self.registry.read();
        let Some(method) = registry.method(id) else {
            return false;
        };
        let Some(owner) = registry.class(method.class_id) else {
            return false;
        };
        let Some(index) = owner.vtable_index(&method.name, &method.descriptor) else {
            return false;
        };
        registry.classes().iter().any(|class| {
            class.is_subtype_of(&owner) && class.vtable.get(index).is_some_and(|m| m.id != id)
        })
    }

    pub fn class(&self, id: ClassId) -> Option<Arc<Class>> {
        self.registry.read().class(id)
    }

    /// A loaded class by internal name. Array classes only once created.
    pub fn class_by_name(&self, name: &str) -> Option<Arc<Class>> {
        self.registry.read().class_by_name(name)
    }

    /// Like [`class_by_name`](Self::class_by_name), creating array classes
    /// on demand.
    pub fn find_class(&self, name: &str) -> Option<Arc<Class>> {
        if let Some(class) = self.class_by_name(name) {
            return Some(class);
        }
        if name.starts_with('[') {
            return self.registry.write().array_class(name);
        }
        None
    }

    pub fn method(&self, id: MethodId) -> Option<Arc<Method>> {
        self.registry.read().method(id)
    }

    /// Resolve `class.name descriptor` the way a method reference would.
    pub fn find_method(&self, class: &str, name: &str, descriptor: &str) -> VmResult<Arc<Method>> {
        let owner = self
            .class_by_name(class)
            .ok_or_else(|| VmError::ClassNotFound(class.to_string()))?;
        owner
            .lookup_method(name, descriptor)
            .ok_or_else(|| VmError::MethodNotFound {
                class: class.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            })
    }

    /// Snapshot of every loaded class.
    pub fn classes(&self) -> Vec<Arc<Class>> {
        self.registry.read().classes().to_vec()
    }

    // =========================================================================
    // Natives and threads
    // =========================================================================

    /// Bind a native implementation. Takes effect for calls that have not
    /// bound the method yet.
    pub fn register_native(
        &self,
        class: &str,
        name: &str,
        descriptor: &str,
        f: impl Fn(&mut NativeEnv<'_>, &[JValue]) -> JValue + Send + Sync + 'static,
    ) {
        self.natives.register(class, name, descriptor, Arc::new(f));
    }

    /// Attach the calling OS thread.
    pub fn attach_thread(self: &Arc<Self>, name: &str) -> VmThread {
        VmThread::new(Arc::clone(self), name)
    }

    /// Run a static method on a new thread.
    pub fn spawn(
        self: &Arc<Self>,
        class: &str,
        name: &str,
        descriptor: &str,
        args: Vec<JValue>,
    ) -> VmResult<ThreadHandle> {
        let method = self.find_method(class, name, descriptor)?;
        let thread_name = format!("{}.{}", class.rsplit('/').next().unwrap_or(class), name);
        let mut thread = self.attach_thread(&thread_name);
        let shared = Arc::clone(&thread.shared);
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || thread.call_method(&method, &args))
            .map_err(|e| VmError::Io {
                path: thread_name,
                source: e,
            })?;
        Ok(ThreadHandle::new(shared, handle))
    }

    pub fn stats(&self) -> VmStats {
        let registry = self.registry.read();
        VmStats {
            classes: registry.classes().len(),
            methods: registry.method_count(),
            heap_objects: self.heap.object_count(),
            heap_bytes: self.heap.bytes_allocated(),
            collections: self.heap.collections(),
            monitors: self.monitors.len(),
            threads: self.threads.len(),
            compiled_methods: self.jit.code_cache.len(),
            transitions: self.jit.counters.snapshot(),
        }
    }

    // =========================================================================
    // Engine helpers
    // =========================================================================

    pub(crate) fn throwable_class(&self, kind: ThrowableKind) -> Arc<Class> {
        Arc::clone(&self.well_known.throwables[kind as usize])
    }

    pub(crate) fn throwable_layout(&self) -> ThrowableLayout {
        self.well_known.layout
    }

    pub(crate) fn object_class(&self) -> &Arc<Class> {
        &self.well_known.object
    }

    pub(crate) fn string_object(&self, value: String) -> HeapObject {
        HeapObject::new(Arc::clone(&self.well_known.string), ObjectBody::String(value))
    }

    pub(crate) fn mirror_object(&self, class: &Class) -> HeapObject {
        HeapObject::new(Arc::clone(&self.well_known.class), ObjectBody::Mirror(class.id))
    }

    pub(crate) fn method_type_class(&self) -> &Arc<Class> {
        &self.well_known.method_type
    }

    pub(crate) fn method_handle_class(&self) -> &Arc<Class> {
        &self.well_known.method_handle
    }

    /// Every root outside thread stacks plus each thread's published
    /// roots. Called with exclusive access held.
    pub(crate) fn gc_roots(&self) -> Vec<Word> {
        let mut roots = Vec::new();
        for thread in self.threads.all() {
            roots.extend(thread.roots());
        }
        for class in self.registry.read().classes() {
            if let Some(mirror) = class.mirror.get() {
                roots.push(mirror.to_word());
            }
            roots.extend(class.constant_pool.resolved_strings().map(ObjectRef::to_word));
            roots.extend(
                class
                    .static_fields
                    .iter()
                    .filter(|f| f.ty.is_reference())
                    .map(|f| class.static_value(f.slot)),
            );
        }
        roots
    }
}

impl std::fmt::Debug for JavaVM {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JavaVM")
            .field("heap", &self.heap)
            .field("threads", &self.threads.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::asm::ClassBuilder;
    use crate::vm::classfile::{ACC_PUBLIC, ACC_STATIC};

    #[test]
    fn test_bootstrap_classes_present() {
        let vm = JavaVM::new(RuntimeConfig::for_testing()).unwrap();
        for name in ["java/lang/Object", "java/lang/String", "java/lang/Throwable"] {
            assert!(vm.class_by_name(name).is_some(), "missing {}", name);
        }
        assert!(vm.find_class("[Ljava/lang/String;").is_some());
    }

    #[test]
    fn test_find_method_errors() {
        let vm = JavaVM::new(RuntimeConfig::for_testing()).unwrap();
        assert!(matches!(
            vm.find_method("demo/Missing", "f", "()V"),
            Err(VmError::ClassNotFound(_))
        ));
        assert!(matches!(
            vm.find_method("java/lang/Object", "nope", "()V"),
            Err(VmError::MethodNotFound { .. })
        ));
    }

    #[test]
    fn test_methods_count_only_with_a_compiler() {
        let mut config = RuntimeConfig::for_testing();
        config.jit_mode = crate::config::JitMode::Off;
        let vm = JavaVM::new(config).unwrap();
        let class = vm
            .define_class(
                ClassBuilder::new("demo/A")
                    .method("f", "()V", ACC_PUBLIC | ACC_STATIC, "return")
                    .unwrap()
                    .build(),
            )
            .unwrap();
        assert_eq!(
            class.methods[0].run_target.load(),
            crate::vm::run_target::RunState::Send(crate::vm::run_target::SendTarget::Interpreted)
        );
    }
}
