//! Native methods: the registry embedders bind implementations into, the
//! environment a native runs against, and the built-in natives of the
//! bootstrap classes.
//!
//! A native runs with VM access released. Any [`NativeEnv`] call that
//! touches the heap or calls back into Java reacquires it first, so a
//! native that only computes on its arguments never holds up a collection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::class::Class;
use super::exception::ThrowableKind;
use super::method::Method;
use super::monitor::MonitorError;
use super::threads::ThreadId;
use super::value::{JValue, ObjectRef, Word};
use super::vm::JavaVM;
use super::vm_thread::VmThread;

/// A native method implementation. Returning with an exception pending
/// (see [`NativeEnv::throw_new`]) makes the call throw; the return value
/// is then ignored.
pub type NativeFn = Arc<dyn Fn(&mut NativeEnv<'_>, &[JValue]) -> JValue + Send + Sync>;

/// Registry key: `class.name(descriptor)`.
pub fn native_key(class: &str, name: &str, descriptor: &str) -> String {
    format!("{}.{}{}", class, name, descriptor)
}

#[derive(Default)]
pub struct NativeRegistry {
    entries: RwLock<HashMap<String, NativeFn>>,
}

impl NativeRegistry {
    pub fn register(&self, class: &str, name: &str, descriptor: &str, f: NativeFn) {
        self.entries
            .write()
            .insert(native_key(class, name, descriptor), f);
    }

    pub fn lookup(&self, method: &Method) -> Option<NativeFn> {
        self.entries
            .read()
            .get(&native_key(&method.class_name, &method.name, &method.descriptor))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

// =============================================================================
// Environment
// =============================================================================

/// What a native method can do to the VM.
pub struct NativeEnv<'t> {
    thread: &'t mut VmThread,
    method: Arc<Method>,
}

impl<'t> NativeEnv<'t> {
    pub(crate) fn new(thread: &'t mut VmThread, method: Arc<Method>) -> Self {
        NativeEnv { thread, method }
    }

    fn attach(&mut self) -> &mut VmThread {
        self.thread.ensure_access();
        self.thread
    }

    pub fn vm(&self) -> &Arc<JavaVM> {
        &self.thread.vm
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread.id()
    }

    /// Shared state of the calling thread; natives use it to raise async
    /// requests against themselves.
    pub fn thread_shared(&self) -> &Arc<super::threads::ThreadShared> {
        &self.thread.shared
    }

    /// The native method being run.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Record the pop of the Java frame `depth` frames below this native
    /// (0 is its caller). False if there is no such frame.
    pub fn notify_frame_pop(&mut self, depth: usize) -> bool {
        self.thread.request_frame_pop_report(depth)
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    pub fn exception_pending(&self) -> bool {
        !self.thread.exception.is_null()
    }

    /// Raise a new exception of `kind`. It is thrown when the native returns.
    pub fn throw_new(&mut self, kind: ThrowableKind, message: Option<&str>) {
        let thread = self.attach();
        thread.exception = thread.create_exception(kind, message.map(str::to_string));
    }

    /// Raise a new exception of the throwable class named `class_name`.
    pub fn throw_by_name(&mut self, class_name: &str, message: Option<&str>) {
        let thread = self.attach();
        match thread.vm.class_by_name(class_name) {
            Some(class) if class.is_subtype_of(&thread.vm.throwable_class(ThrowableKind::Throwable)) => {
                thread.exception =
                    thread.create_throwable(&class, message.map(str::to_string), ObjectRef::NULL);
            }
            _ => {
                thread.exception = thread.create_exception(
                    ThrowableKind::NoClassDefFoundError,
                    Some(class_name.to_string()),
                );
            }
        }
    }

    /// Make `exception` pending.
    pub fn throw(&mut self, exception: ObjectRef) {
        self.thread.exception = exception;
    }

    /// Clear and return the pending exception.
    pub fn exception_clear(&mut self) -> ObjectRef {
        self.thread.take_exception()
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// A new `java/lang/String`, or null with `OutOfMemoryError` pending.
    pub fn new_string(&mut self, value: &str) -> ObjectRef {
        let thread = self.attach();
        let object = thread.vm.string_object(value.to_string());
        thread.allocate(object).unwrap_or_else(|action| {
            thread.raise(action);
            ObjectRef::NULL
        })
    }

    pub fn string_value(&mut self, string: ObjectRef) -> Option<String> {
        let thread = self.attach();
        thread.vm.heap.get(string)?.as_str().map(str::to_string)
    }

    /// A new `int[]`, or null with an exception pending.
    pub fn new_int_array(&mut self, length: i32) -> ObjectRef {
        let thread = self.attach();
        thread
            .new_array_of("[I", length)
            .unwrap_or_else(|action| {
                thread.raise(action);
                ObjectRef::NULL
            })
    }

    pub fn array_length(&mut self, array: ObjectRef) -> Option<usize> {
        self.attach().vm.heap.get(array)?.array_length()
    }

    /// Element `index` of an `int[]`; `None` (with an exception pending)
    /// on a null array or a bad index.
    pub fn int_element(&mut self, array: ObjectRef, index: i32) -> Option<i32> {
        let thread = self.attach();
        let Some(object) = thread.vm.heap.get(array) else {
            thread.raise(super::action::BytecodeAction::ThrowNullPointer);
            return None;
        };
        match object.element(index) {
            Ok(word) => Some(super::value::word_to_int(word)),
            Err(length) => {
                thread.raise(super::action::BytecodeAction::ThrowArrayIndexOutOfBounds {
                    index,
                    length,
                });
                None
            }
        }
    }

    pub fn set_int_element(&mut self, array: ObjectRef, index: i32, value: i32) -> bool {
        let thread = self.attach();
        let Some(object) = thread.vm.heap.get(array) else {
            thread.raise(super::action::BytecodeAction::ThrowNullPointer);
            return false;
        };
        match object.set_element(index, super::value::int_to_word(value)) {
            Ok(()) => true,
            Err(length) => {
                thread.raise(super::action::BytecodeAction::ThrowArrayIndexOutOfBounds {
                    index,
                    length,
                });
                false
            }
        }
    }

    pub fn class_of(&mut self, object: ObjectRef) -> Option<Arc<Class>> {
        self.attach().vm.heap.get(object).map(|o| Arc::clone(&o.class))
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call a static method. `None` means an exception is pending.
    pub fn call_static(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
        args: &[JValue],
    ) -> Option<JValue> {
        let thread = self.attach();
        let method = match thread.vm.find_method(class, name, descriptor) {
            Ok(m) => m,
            Err(_) => {
                thread.exception = thread.create_exception(
                    ThrowableKind::NoSuchMethodError,
                    Some(format!("{}.{}{}", class, name, descriptor)),
                );
                return None;
            }
        };
        thread.call_in(&method, args).map_err(|e| thread.exception = e).ok()
    }

    /// Call a virtual method on `receiver`. `None` means an exception is
    /// pending.
    pub fn call_virtual(
        &mut self,
        receiver: ObjectRef,
        name: &str,
        descriptor: &str,
        args: &[JValue],
    ) -> Option<JValue> {
        let thread = self.attach();
        let Some(object) = thread.vm.heap.get(receiver) else {
            thread.raise(super::action::BytecodeAction::ThrowNullPointer);
            return None;
        };
        let Some(method) = object.class.lookup_method(name, descriptor) else {
            thread.exception = thread.create_exception(
                ThrowableKind::NoSuchMethodError,
                Some(format!("{}.{}{}", object.class.name, name, descriptor)),
            );
            return None;
        };
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(JValue::Ref(receiver));
        full.extend_from_slice(args);
        thread.call_in(&method, &full).map_err(|e| thread.exception = e).ok()
    }
}

// =============================================================================
// Built-in natives
// =============================================================================

fn native(f: impl Fn(&mut NativeEnv<'_>, &[JValue]) -> JValue + Send + Sync + 'static) -> NativeFn {
    Arc::new(f)
}

fn monitor_failure(env: &mut NativeEnv<'_>, error: MonitorError) {
    match error {
        MonitorError::IllegalState => env.throw_new(
            ThrowableKind::IllegalMonitorStateException,
            Some("current thread is not owner"),
        ),
        MonitorError::Interrupted => env.throw_new(ThrowableKind::InterruptedException, None),
        MonitorError::OutOfMemory => env.throw_new(
            ThrowableKind::OutOfMemoryError,
            Some("could not allocate monitor"),
        ),
        MonitorError::Identity => env.throw_new(ThrowableKind::IdentityException, None),
    }
}

fn object_wait(env: &mut NativeEnv<'_>, receiver: ObjectRef, timeout: Option<Duration>) -> JValue {
    let thread = env.attach();
    let Some(monitor) = thread.vm.monitors.existing(receiver) else {
        monitor_failure(env, MonitorError::IllegalState);
        return JValue::Void;
    };
    let id = thread.id();
    let shared = Arc::clone(&thread.shared);
    thread.release_access();
    let result = monitor.wait(id, timeout, || shared.is_interrupted());
    if let Err(MonitorError::Interrupted) = result {
        shared.take_interrupted();
    }
    match result {
        Ok(()) => JValue::Void,
        Err(error) => {
            monitor_failure(env, error);
            JValue::Void
        }
    }
}

fn receiver_of(args: &[JValue]) -> ObjectRef {
    args.first().and_then(JValue::as_ref).unwrap_or(ObjectRef::NULL)
}

/// Natives every VM starts with.
pub(crate) fn builtin_natives() -> Vec<(&'static str, &'static str, &'static str, NativeFn)> {
    vec![
        (
            "java/lang/Object",
            "hashCode",
            "()I",
            native(|_, args| JValue::Int(identity_hash(receiver_of(args)))),
        ),
        (
            "java/lang/System",
            "identityHashCode",
            "(Ljava/lang/Object;)I",
            native(|_, args| JValue::Int(identity_hash(receiver_of(args)))),
        ),
        (
            "java/lang/Object",
            "getClass",
            "()Ljava/lang/Class;",
            native(|env, args| {
                let thread = env.attach();
                let Some(object) = thread.vm.heap.get(receiver_of(args)) else {
                    return JValue::Ref(ObjectRef::NULL);
                };
                let class = Arc::clone(&object.class);
                match thread.class_mirror(&class) {
                    Ok(mirror) => JValue::Ref(mirror),
                    Err(action) => {
                        thread.raise(action);
                        JValue::Ref(ObjectRef::NULL)
                    }
                }
            }),
        ),
        (
            "java/lang/Object",
            "wait",
            "()V",
            native(|env, args| object_wait(env, receiver_of(args), None)),
        ),
        (
            "java/lang/Object",
            "wait",
            "(J)V",
            native(|env, args| {
                let millis = args.get(1).and_then(JValue::as_long).unwrap_or(0);
                if millis < 0 {
                    env.throw_new(
                        ThrowableKind::IllegalArgumentException,
                        Some("timeout value is negative"),
                    );
                    return JValue::Void;
                }
                let timeout = (millis > 0).then(|| Duration::from_millis(millis as u64));
                object_wait(env, receiver_of(args), timeout)
            }),
        ),
        (
            "java/lang/Object",
            "notify",
            "()V",
            native(|env, args| {
                let thread = env.attach();
                let id = thread.id();
                let result = match thread.vm.monitors.existing(receiver_of(args)) {
                    Some(monitor) => monitor.notify(id),
                    None => Err(MonitorError::IllegalState),
                };
                if let Err(error) = result {
                    monitor_failure(env, error);
                }
                JValue::Void
            }),
        ),
        (
            "java/lang/Object",
            "notifyAll",
            "()V",
            native(|env, args| {
                let thread = env.attach();
                let id = thread.id();
                let result = match thread.vm.monitors.existing(receiver_of(args)) {
                    Some(monitor) => monitor.notify_all(id),
                    None => Err(MonitorError::IllegalState),
                };
                if let Err(error) = result {
                    monitor_failure(env, error);
                }
                JValue::Void
            }),
        ),
        (
            "java/lang/Thread",
            "interrupted",
            "()Z",
            native(|env, _| JValue::Int(i32::from(env.thread.shared.take_interrupted()))),
        ),
        (
            "java/lang/Thread",
            "yield",
            "()V",
            native(|_, _| {
                std::thread::yield_now();
                JValue::Void
            }),
        ),
        (
            "java/lang/System",
            "arraycopy",
            "(Ljava/lang/Object;ILjava/lang/Object;II)V",
            native(array_copy),
        ),
    ]
}

/// Identity hash: stable for the object's lifetime.
fn identity_hash(object: ObjectRef) -> i32 {
    let word = object.to_word();
    (word.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 33) as i32
}

fn array_copy(env: &mut NativeEnv<'_>, args: &[JValue]) -> JValue {
    let int_arg = |i: usize| args.get(i).and_then(JValue::as_int).unwrap_or(0);
    let ref_arg = |i: usize| args.get(i).and_then(JValue::as_ref).unwrap_or(ObjectRef::NULL);
    let (src, src_pos, dst, dst_pos, length) =
        (ref_arg(0), int_arg(1), ref_arg(2), int_arg(3), int_arg(4));

    let thread = env.attach();
    let (Some(from), Some(to)) = (thread.vm.heap.get(src), thread.vm.heap.get(dst)) else {
        thread.raise(super::action::BytecodeAction::ThrowNullPointer);
        return JValue::Void;
    };
    let (Some(from_words), Some(to_words)) = (from.elements(), to.elements()) else {
        env.throw_new(ThrowableKind::ArrayStoreException, Some("arraycopy: not an array"));
        return JValue::Void;
    };
    let compatible = match (&from.class.element, &to.class.element) {
        (Some(a), Some(b)) => a.java_type() == b.java_type(),
        _ => false,
    };
    if !compatible {
        env.throw_new(ThrowableKind::ArrayStoreException, Some("arraycopy: type mismatch"));
        return JValue::Void;
    }
    let in_bounds = |pos: i32, len: usize| {
        pos >= 0 && length >= 0 && (pos as i64 + length as i64) <= len as i64
    };
    if !in_bounds(src_pos, from_words.len()) || !in_bounds(dst_pos, to_words.len()) {
        env.throw_new(
            ThrowableKind::ArrayIndexOutOfBoundsException,
            Some("arraycopy: last source index out of bounds"),
        );
        return JValue::Void;
    }
    let values: Vec<Word> = from_words[src_pos as usize..(src_pos + length) as usize]
        .iter()
        .map(|w| w.load(std::sync::atomic::Ordering::Acquire))
        .collect();
    for (i, value) in values.into_iter().enumerate() {
        to_words[dst_pos as usize + i].store(value, std::sync::atomic::Ordering::Release);
    }
    JValue::Void
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_key_format() {
        assert_eq!(
            native_key("demo/Math", "add", "(II)I"),
            "demo/Math.add(II)I"
        );
    }

    #[test]
    fn test_identity_hash_is_stable() {
        let r = ObjectRef::from_word(42);
        assert_eq!(identity_hash(r), identity_hash(r));
        assert_ne!(identity_hash(r), identity_hash(ObjectRef::from_word(43)));
    }

    #[test]
    fn test_builtins_cover_object_monitor_methods() {
        let names: Vec<String> = builtin_natives()
            .iter()
            .map(|(c, n, d, _)| native_key(c, n, d))
            .collect();
        for expected in [
            "java/lang/Object.wait()V",
            "java/lang/Object.notify()V",
            "java/lang/Object.notifyAll()V",
            "java/lang/System.arraycopy(Ljava/lang/Object;ILjava/lang/Object;II)V",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
    }
}
