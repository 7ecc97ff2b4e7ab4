//! A thread attached to the VM.
//!
//! [`VmThread`] owns the Java stack and the interpreter registers of one OS
//! thread and drives the dispatch loop: the interpreter and every other
//! component communicate with it by returning a [`BytecodeAction`], and
//! [`VmThread::run`] performs the action until control leaves the
//! interpreter.
//!
//! The embedding API (call-in, object creation, single stepping) lives here
//! as well. Everything that touches the heap holds shared VM access; it is
//! released whenever the thread may block and around native calls.

use std::sync::Arc;

use tracing::{debug, trace};

use super::action::BytecodeAction;
use super::class::{Class, InitState};
use super::context::ExecutionContext;
use super::exception::ThrowableKind;
use super::frame::{FrameType, build_call_in_frame, restore_call_in_frame};
use super::heap::{CollectionStats, HeapObject, ObjectBody};
use super::interpreter;
use super::method::Method;
use super::method_handle::{HandleKind, MethodHandleData};
use super::monitor::MonitorError;
use super::threads::{ASYNC_HALT_FOR_SAFEPOINT, ThreadId, ThreadShared};
use super::value::{JValue, ObjectRef, Word, word_to_int};
use super::vm::JavaVM;
use crate::error::{VmError, VmResult};
use crate::jit::JitRegisterFile;
use crate::vm::bytecode::fixed_length;
use crate::vm::debug::{FramePopEvent, StackTraceElement};
use crate::vm::frame::I2JState;

/// Outermost call-in frame opened by [`VmThread::enter_method`].
struct SteppingState {
    frame_base: usize,
    method: Arc<Method>,
    release: bool,
}

pub struct VmThread {
    pub(crate) vm: Arc<JavaVM>,
    pub(crate) shared: Arc<ThreadShared>,
    pub(crate) ctx: ExecutionContext,
    /// Method staged for the next `RunMethod`.
    pub(crate) send_method: Option<Arc<Method>>,
    /// The staged method's run target was already consulted by the caller.
    pub(crate) send_precounted: bool,
    /// Pending exception, `NULL` if none.
    pub(crate) exception: ObjectRef,
    /// A stack overflow is being thrown; the reserved area is in use.
    pub(crate) handling_overflow: bool,
    alloc_budget: usize,
    /// Objects held by Rust code rather than the Java stack.
    pub(crate) temp_roots: Vec<ObjectRef>,
    pub(crate) native_frames: usize,
    pub(crate) regs: JitRegisterFile,
    /// Interpreter state of the innermost i2j transition.
    pub(crate) i2j: Option<I2JState>,
    /// Frame base of the innermost J2I frame, zero if none.
    pub(crate) j2i_top: usize,
    has_access: bool,
    stepping: Option<SteppingState>,
    /// Pops of frames tagged with the report-frame-pop bit.
    pub(crate) frame_pops: Vec<FramePopEvent>,
}

impl VmThread {
    pub(crate) fn new(vm: Arc<JavaVM>, name: &str) -> Self {
        let shared = Arc::new(ThreadShared::new(name));
        vm.threads.register(Arc::clone(&shared));
        let ctx = ExecutionContext::new(vm.config.stack.initial_words);
        let thread = VmThread {
            vm,
            shared,
            ctx,
            send_method: None,
            send_precounted: false,
            exception: ObjectRef::NULL,
            handling_overflow: false,
            alloc_budget: 0,
            temp_roots: Vec::new(),
            native_frames: 0,
            regs: JitRegisterFile::default(),
            i2j: None,
            j2i_top: 0,
            has_access: false,
            stepping: None,
            frame_pops: Vec::new(),
        };
        thread.reset_overflow_mark();
        debug!(thread = %thread.shared.name, id = thread.shared.id.0, "thread attached");
        thread
    }

    pub fn id(&self) -> ThreadId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn vm(&self) -> &Arc<JavaVM> {
        &self.vm
    }

    pub fn shared(&self) -> &Arc<ThreadShared> {
        &self.shared
    }

    // =========================================================================
    // Dispatch loop
    // =========================================================================

    /// Perform `action` and every action it leads to, until one asks to
    /// leave the interpreter.
    pub(crate) fn run(&mut self, mut action: BytecodeAction) {
        loop {
            action = match action {
                BytecodeAction::ExecuteBytecode => interpreter::execute(self),
                BytecodeAction::BranchWithAsyncCheck | BytecodeAction::CheckAsync => {
                    if self.shared.async_flags() != 0 {
                        self.process_async_events(true)
                    } else {
                        BytecodeAction::ExecuteBytecode
                    }
                }
                BytecodeAction::RunMethod => self.run_method(),
                BytecodeAction::I2JTransition => self.i2j_transition(),
                BytecodeAction::PopFrames => self.pop_frames(),
                BytecodeAction::ExitInterpreter => return,
                throw => self.throw(throw),
            };
        }
    }

    /// Continue in the caller after a method returned to it, skipping the
    /// invoke that made the call. A special caller ends the interpreter run.
    pub(crate) fn resume_caller(&mut self) -> BytecodeAction {
        if self.ctx.in_special_frame() {
            return BytecodeAction::ExitInterpreter;
        }
        let Some(method) = self.current_method() else {
            return BytecodeAction::ExitInterpreter;
        };
        let pc = self.ctx.bytecode_pc();
        let length = method.code.get(pc).and_then(|&op| fixed_length(op)).unwrap_or(3);
        self.ctx.advance(length);
        BytecodeAction::ExecuteBytecode
    }

    // =========================================================================
    // VM access and roots
    // =========================================================================

    pub(crate) fn ensure_access(&mut self) {
        if !self.has_access {
            self.vm.access.acquire_shared();
            self.has_access = true;
        }
    }

    /// Give up VM access, publishing this thread's roots for collections
    /// that run meanwhile.
    pub(crate) fn release_access(&mut self) {
        if self.has_access {
            self.publish_roots();
            self.vm.access.release_shared();
            self.has_access = false;
        }
    }

    fn publish_roots(&self) {
        let mut roots: Vec<Word> = self.ctx.stack.slice(self.ctx.sp, self.ctx.stack.end()).to_vec();
        roots.push(self.exception.to_word());
        roots.extend(self.temp_roots.iter().map(|r| r.to_word()));
        roots.extend_from_slice(&self.regs.gpr);
        self.shared.publish_roots(roots);
    }

    /// Let a pending exclusive request through.
    pub(crate) fn safepoint(&mut self) {
        if self.has_access {
            trace!(thread = %self.shared.name, "safepoint");
            self.release_access();
            self.ensure_access();
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate from the thread's budget, refilling it and collecting when
    /// the heap limit is reached.
    pub(crate) fn allocate(&mut self, object: HeapObject) -> Result<ObjectRef, BytecodeAction> {
        let size = object.size_bytes();
        if self.alloc_budget < size {
            self.refill_budget(size)?;
        }
        self.alloc_budget -= size;
        let r = self.vm.heap.insert(object);
        if self.native_frames > 0 {
            self.temp_roots.push(r);
        }
        Ok(r)
    }

    fn refill_budget(&mut self, size: usize) -> Result<(), BytecodeAction> {
        if let Some(granted) = self.vm.heap.refill_budget(size) {
            self.alloc_budget = granted;
            return Ok(());
        }
        self.collect_garbage();
        match self.vm.heap.refill_budget(size) {
            Some(granted) => {
                self.alloc_budget = granted;
                Ok(())
            }
            None => Err(BytecodeAction::ThrowOutOfMemory),
        }
    }

    /// Allocate without budget or limit checks; used for exception objects.
    pub(crate) fn allocate_unchecked(&mut self, object: HeapObject) -> ObjectRef {
        let r = self.vm.heap.insert(object);
        if self.native_frames > 0 {
            self.temp_roots.push(r);
        }
        r
    }

    /// Stop every other thread at a checkpoint and collect.
    pub fn collect_garbage(&mut self) -> CollectionStats {
        let had_access = self.has_access;
        self.release_access();
        let vm = Arc::clone(&self.vm);
        let me = self.shared.id;
        vm.access
            .acquire_exclusive(|| vm.threads.raise_all(ASYNC_HALT_FOR_SAFEPOINT, Some(me)));
        let stats = vm.heap.collect(vm.gc_roots());
        vm.monitors.retain_live(|r| vm.heap.is_live(r));
        vm.access.release_exclusive();
        if had_access {
            self.ensure_access();
        }
        self.alloc_budget = 0;
        debug!(
            live = stats.live_objects,
            freed = stats.freed_objects,
            live_bytes = stats.live_bytes,
            "collection finished"
        );
        stats
    }

    // =========================================================================
    // Monitors
    // =========================================================================

    pub(crate) fn monitor_enter(&mut self, object: ObjectRef) -> Result<(), BytecodeAction> {
        let Some(heap_object) = self.vm.heap.get(object) else {
            return Err(BytecodeAction::ThrowNullPointer);
        };
        if heap_object.class.is_value_type() {
            return Err(BytecodeAction::ThrowIdentityMonitor);
        }
        let monitor = self.vm.monitors.monitor(object).map_err(monitor_action)?;
        let id = self.shared.id;
        if monitor.try_enter(id) {
            return Ok(());
        }
        let held = self.has_access;
        self.release_access();
        monitor.enter_blocking(id);
        if held {
            self.ensure_access();
        }
        Ok(())
    }

    pub(crate) fn monitor_exit(&mut self, object: ObjectRef) -> Result<(), BytecodeAction> {
        if object.is_null() {
            return Err(BytecodeAction::ThrowNullPointer);
        }
        let Some(monitor) = self.vm.monitors.existing(object) else {
            return Err(BytecodeAction::ThrowIllegalMonitorState);
        };
        monitor.exit(self.shared.id).map_err(monitor_action)
    }

    // =========================================================================
    // Classes
    // =========================================================================

    /// Run the class's static initializer unless it already ran. A class
    /// being initialized by this thread counts as initialized; one being
    /// initialized elsewhere is waited for.
    pub(crate) fn initialize_class(&mut self, class: &Arc<Class>) -> Result<(), BytecodeAction> {
        let me = self.shared.id;
        loop {
            let mut state = class.init_state.lock();
            match *state {
                InitState::Initialized => return Ok(()),
                InitState::Failed => {
                    return Err(BytecodeAction::linkage(
                        ThrowableKind::NoClassDefFoundError,
                        format!("Could not initialize class {}", class.name.replace('/', ".")),
                    ));
                }
                InitState::Initializing(owner) if owner == me => return Ok(()),
                InitState::Initializing(_) => {
                    drop(state);
                    let held = self.has_access;
                    self.release_access();
                    {
                        let mut state = class.init_state.lock();
                        while matches!(*state, InitState::Initializing(_)) {
                            class.init_done.wait(&mut state);
                        }
                    }
                    if held {
                        self.ensure_access();
                    }
                }
                InitState::Uninitialized => {
                    *state = InitState::Initializing(me);
                    break;
                }
            }
        }

        let result = self.run_initializers(class);
        *class.init_state.lock() = if result.is_ok() {
            InitState::Initialized
        } else {
            InitState::Failed
        };
        class.init_done.notify_all();
        result
    }

    fn run_initializers(&mut self, class: &Arc<Class>) -> Result<(), BytecodeAction> {
        if let Some(super_class) = &class.super_class {
            self.initialize_class(super_class)?;
        }
        let Some(clinit) = class.class_initializer().cloned() else {
            return Ok(());
        };
        debug!(class = %class.name, "running static initializer");
        match self.call_in(&clinit, &[]) {
            Ok(_) => Ok(()),
            Err(exception) => {
                let error_class = self.vm.throwable_class(ThrowableKind::Error);
                let is_error = self
                    .vm
                    .heap
                    .get(exception)
                    .is_some_and(|o| o.class.is_subtype_of(&error_class));
                self.exception = if is_error {
                    exception
                } else {
                    let wrapper = self.vm.throwable_class(ThrowableKind::ExceptionInInitializerError);
                    self.create_throwable(&wrapper, None, exception)
                };
                Err(BytecodeAction::ThrowCurrentException)
            }
        }
    }

    /// The `java/lang/Class` object for `class`, created on first use.
    pub(crate) fn class_mirror(&mut self, class: &Arc<Class>) -> Result<ObjectRef, BytecodeAction> {
        if let Some(mirror) = class.mirror.get() {
            return Ok(*mirror);
        }
        let object = self.allocate(self.vm.mirror_object(class))?;
        Ok(*class.mirror.get_or_init(|| object))
    }

    /// Allocate an array of the array class named `name`.
    pub(crate) fn new_array_of(&mut self, name: &str, length: i32) -> Result<ObjectRef, BytecodeAction> {
        if length < 0 {
            return Err(BytecodeAction::ThrowNegativeArraySize { size: length });
        }
        let class = self
            .vm
            .find_class(name)
            .ok_or_else(|| BytecodeAction::linkage(ThrowableKind::NoClassDefFoundError, name))?;
        self.allocate(HeapObject::array(class, length as usize))
    }

    // =========================================================================
    // Call-in
    // =========================================================================

    /// Run `method` to completion on top of the current stack. An exception
    /// escaping it is returned instead of being thrown further.
    pub(crate) fn call_in(&mut self, method: &Arc<Method>, args: &[JValue]) -> Result<JValue, ObjectRef> {
        self.ensure_access();
        if !self.exception.is_null() {
            return Err(self.take_exception());
        }
        if !method.is_static() && args.first().and_then(JValue::as_ref).is_none_or(|r| r.is_null()) {
            return Err(self.create_exception(ThrowableKind::NullPointerException, None));
        }
        if let Some(action) = self.check_stack(method.arg_slots + super::frame::CALL_IN_FRAME_WORDS) {
            self.raise(action);
            let exception = self.take_exception();
            self.end_overflow_handling();
            return Err(exception);
        }

        let bp = build_call_in_frame(&mut self.ctx, 0, 0);
        for arg in args {
            self.ctx.push_value(*arg);
        }
        self.send_method = Some(Arc::clone(method));
        self.send_precounted = false;
        self.run(BytecodeAction::RunMethod);

        let result = if self.exception.is_null() {
            Ok(self.ctx.pop_value(method.return_type()))
        } else {
            Err(self.take_exception())
        };
        restore_call_in_frame(&mut self.ctx, bp);
        if result.is_err() {
            self.end_overflow_handling();
        }
        result
    }

    /// Turn a bytecode action into a pending exception.
    pub(crate) fn raise(&mut self, action: BytecodeAction) {
        if let Some((kind, message)) = action.exception_to_create() {
            self.exception = self.create_exception(kind, message);
        }
    }

    fn uncaught(&mut self, exception: ObjectRef) -> VmError {
        let thrown = self.describe_exception(exception);
        debug!(thread = %self.shared.name, exception = %thrown, "uncaught exception");
        VmError::UncaughtException(thrown)
    }

    fn action_error(&mut self, action: BytecodeAction) -> VmError {
        self.raise(action);
        let exception = self.take_exception();
        self.uncaught(exception)
    }

    /// Run `f` holding VM access, releasing it again if this is the
    /// outermost entry.
    fn with_access<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let outermost = !self.has_access;
        self.ensure_access();
        let result = f(self);
        if outermost && self.stepping.is_none() {
            self.release_access();
        }
        result
    }

    // =========================================================================
    // Embedding API
    // =========================================================================

    /// Call `method` with `args`, the receiver first for instance methods.
    pub fn call_method(&mut self, method: &Arc<Method>, args: &[JValue]) -> VmResult<JValue> {
        check_arguments(method, args)?;
        self.with_access(|thread| {
            if method.is_static() {
                if let Some(class) = thread.vm.class(method.class_id) {
                    if let Err(action) = thread.initialize_class(&class) {
                        return Err(thread.action_error(action));
                    }
                }
            }
            match thread.call_in(method, args) {
                Ok(value) => {
                    if let Some(r) = value.as_ref() {
                        thread.temp_roots.push(r);
                    }
                    Ok(value)
                }
                Err(exception) => Err(thread.uncaught(exception)),
            }
        })
    }

    pub fn call_static(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
        args: &[JValue],
    ) -> VmResult<JValue> {
        let method = self.vm.find_method(class, name, descriptor)?;
        if !method.is_static() {
            return Err(VmError::ArgumentMismatch {
                method: method.full_name(),
                message: "not a static method".to_string(),
            });
        }
        self.call_method(&method, args)
    }

    /// Call the override of `name` selected by `receiver`'s class.
    pub fn call_virtual(
        &mut self,
        receiver: ObjectRef,
        name: &str,
        descriptor: &str,
        args: &[JValue],
    ) -> VmResult<JValue> {
        let Some(object) = self.vm.heap.get(receiver) else {
            let exception = self.with_access(|t| t.create_exception(ThrowableKind::NullPointerException, None));
            return Err(self.uncaught(exception));
        };
        let method = object
            .class
            .lookup_method(name, descriptor)
            .ok_or_else(|| VmError::MethodNotFound {
                class: object.class.name.clone(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            })?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(JValue::Ref(receiver));
        full.extend_from_slice(args);
        self.call_method(&method, &full)
    }

    /// Allocate a string. It stays reachable until
    /// [`clear_local_refs`](Self::clear_local_refs).
    pub fn new_string(&mut self, value: &str) -> VmResult<ObjectRef> {
        let object = self.vm.string_object(value.to_string());
        self.allocate_local(object)
    }

    pub fn string_value(&self, string: ObjectRef) -> Option<String> {
        self.vm.heap.get(string)?.as_str().map(str::to_string)
    }

    /// Allocate a zeroed array of the array class `name`, e.g. `[I`.
    pub fn new_array(&mut self, name: &str, length: i32) -> VmResult<ObjectRef> {
        let result = self.with_access(|t| t.new_array_of(name, length));
        match result {
            Ok(array) => {
                self.temp_roots.push(array);
                Ok(array)
            }
            Err(action) => Err(self.with_access(|t| t.action_error(action))),
        }
    }

    /// Elements of an `int[]`.
    pub fn int_array(&self, array: ObjectRef) -> Option<Vec<i32>> {
        let object = self.vm.heap.get(array)?;
        let length = object.array_length()?;
        (0..length as i32)
            .map(|i| object.element(i).ok().map(word_to_int))
            .collect()
    }

    /// Allocate an instance of `class` without running a constructor.
    pub fn new_instance(&mut self, class: &str) -> VmResult<ObjectRef> {
        let class = self
            .vm
            .find_class(class)
            .ok_or_else(|| VmError::ClassNotFound(class.to_string()))?;
        let result = self.with_access(|t| {
            t.initialize_class(&class)?;
            t.allocate(HeapObject::instance(Arc::clone(&class)))
        });
        match result {
            Ok(object) => {
                self.temp_roots.push(object);
                Ok(object)
            }
            Err(action) => Err(self.with_access(|t| t.action_error(action))),
        }
    }

    /// A handle on `class.name(descriptor)`: static methods are invoked
    /// directly, instance methods dispatch on the receiver argument.
    pub fn new_method_handle(&mut self, class: &str, name: &str, descriptor: &str) -> VmResult<ObjectRef> {
        let target = self.vm.find_method(class, name, descriptor)?;
        let kind = if target.is_static() {
            HandleKind::Static
        } else {
            HandleKind::Virtual
        };
        let handle_class = Arc::clone(self.vm.method_handle_class());
        let object = HeapObject::new(
            handle_class,
            ObjectBody::MethodHandle(MethodHandleData::new(target, kind)),
        );
        self.allocate_local(object)
    }

    fn allocate_local(&mut self, object: HeapObject) -> VmResult<ObjectRef> {
        let result = self.with_access(|t| t.allocate(object));
        match result {
            Ok(r) => {
                self.temp_roots.push(r);
                Ok(r)
            }
            Err(action) => Err(self.with_access(|t| t.action_error(action))),
        }
    }

    /// Drop the references the embedding API kept alive.
    pub fn clear_local_refs(&mut self) {
        self.temp_roots.clear();
    }

    /// Java stack trace of the current position, innermost frame first.
    pub fn stack_trace(&self) -> Vec<StackTraceElement> {
        self.capture_stack_trace()
    }

    /// Drain the frame-pop events recorded since the last call.
    pub fn take_frame_pop_events(&mut self) -> Vec<FramePopEvent> {
        std::mem::take(&mut self.frame_pops)
    }

    pub(crate) fn record_frame_pop(&mut self, method: &Method, exceptional: bool) {
        debug!(method = %method.full_name(), exceptional, "frame popped");
        self.frame_pops.push(FramePopEvent {
            class_name: method.class_name.clone(),
            method_name: method.name.clone(),
            exceptional,
        });
    }

    // =========================================================================
    // Single stepping
    // =========================================================================

    /// Enter `method` without running it, so it can be single stepped.
    pub fn enter_method(&mut self, method: &Arc<Method>, args: &[JValue]) -> VmResult<()> {
        check_arguments(method, args)?;
        if method.is_native() || method.is_abstract() {
            return Err(VmError::ArgumentMismatch {
                method: method.full_name(),
                message: "method has no bytecode".to_string(),
            });
        }
        let release = !self.has_access;
        self.ensure_access();
        let frame_base = build_call_in_frame(&mut self.ctx, 0, 0);
        for arg in args {
            self.ctx.push_value(*arg);
        }
        self.stepping = Some(SteppingState {
            frame_base,
            method: Arc::clone(method),
            release,
        });
        match self.enter_interpreted(method) {
            BytecodeAction::ExecuteBytecode | BytecodeAction::CheckAsync => Ok(()),
            action => {
                self.raise(action);
                let exception = self.take_exception();
                self.leave_stepping();
                Err(self.uncaught(exception))
            }
        }
    }

    /// Execute the instruction at the current pc and return its action
    /// without performing it.
    pub fn execute_instruction(&mut self) -> BytecodeAction {
        if self.ctx.in_special_frame() {
            return BytecodeAction::ExitInterpreter;
        }
        let Some(method) = self.current_method() else {
            return BytecodeAction::ExitInterpreter;
        };
        let Some(class) = self.vm.class(method.class_id) else {
            return BytecodeAction::ExitInterpreter;
        };
        interpreter::step(self, &method, &class)
    }

    /// Perform `action` and run the entered method to completion.
    pub fn finish(&mut self, action: BytecodeAction) -> VmResult<JValue> {
        let Some(stepping) = self.stepping.as_ref() else {
            return Err(VmError::ArgumentMismatch {
                method: String::new(),
                message: "no method entered".to_string(),
            });
        };
        let ret = stepping.method.return_type();
        self.run(action);
        let result = if self.exception.is_null() {
            Ok(self.ctx.pop_value(ret))
        } else {
            let exception = self.take_exception();
            Err(self.uncaught(exception))
        };
        self.leave_stepping();
        result
    }

    fn leave_stepping(&mut self) {
        if let Some(stepping) = self.stepping.take() {
            restore_call_in_frame(&mut self.ctx, stepping.frame_base);
            self.end_overflow_handling();
            if stepping.release {
                self.release_access();
            }
        }
    }

    /// Words on the current frame's operand stack, bottom first.
    pub fn operand_stack(&self) -> Vec<Word> {
        let Some(method) = self.current_method() else {
            return Vec::new();
        };
        let base = super::frame::operand_stack_base(&method, self.ctx.a0);
        let mut words = self.ctx.stack.slice(self.ctx.sp, base).to_vec();
        words.reverse();
        words
    }

    /// Bytecode offset of the current frame.
    pub fn bytecode_pc(&self) -> usize {
        self.ctx.bytecode_pc()
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        if self.ctx.in_special_frame() {
            FrameType::from_pc(self.ctx.pc)
        } else {
            None
        }
    }

    /// Post async `flag` against this thread.
    pub fn raise_async(&self, flag: u32) {
        self.shared.raise(flag);
    }

    pub fn stack_capacity(&self) -> usize {
        self.ctx.stack.capacity()
    }

    /// Pending exception, if any.
    pub fn pending_exception(&self) -> Option<ObjectRef> {
        (!self.exception.is_null()).then_some(self.exception)
    }
}

impl Drop for VmThread {
    fn drop(&mut self) {
        self.stepping = None;
        self.temp_roots.clear();
        self.exception = ObjectRef::NULL;
        self.ctx.sp = self.ctx.stack.end();
        self.release_access();
        self.shared.publish_roots(Vec::new());
        self.vm.threads.unregister(self.shared.id);
        debug!(thread = %self.shared.name, "thread detached");
    }
}

impl std::fmt::Debug for VmThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmThread")
            .field("name", &self.shared.name)
            .field("id", &self.shared.id)
            .field("depth", &self.ctx.depth())
            .finish()
    }
}

pub(crate) fn monitor_action(error: MonitorError) -> BytecodeAction {
    match error {
        MonitorError::OutOfMemory => {
            BytecodeAction::linkage(ThrowableKind::OutOfMemoryError, "could not allocate monitor")
        }
        MonitorError::IllegalState => BytecodeAction::ThrowIllegalMonitorState,
        MonitorError::Identity => BytecodeAction::ThrowIdentityMonitor,
        MonitorError::Interrupted => BytecodeAction::linkage(ThrowableKind::InterruptedException, ""),
    }
}

/// Arguments must match the method's parameters, receiver first.
fn check_arguments(method: &Method, args: &[JValue]) -> VmResult<()> {
    let receiver = usize::from(!method.is_static());
    let expected = method.signature.args.len() + receiver;
    if args.len() != expected {
        return Err(VmError::ArgumentMismatch {
            method: method.full_name(),
            message: format!("expected {} arguments, got {}", expected, args.len()),
        });
    }
    if receiver == 1 && args[0].as_ref().is_none() {
        return Err(VmError::ArgumentMismatch {
            method: method.full_name(),
            message: "receiver must be a reference".to_string(),
        });
    }
    for (i, (arg, ty)) in args[receiver..].iter().zip(&method.signature.args).enumerate() {
        if !arg.matches(*ty) {
            return Err(VmError::ArgumentMismatch {
                method: method.full_name(),
                message: format!("argument {} is {:?}, expected {:?}", i, arg, ty),
            });
        }
    }
    Ok(())
}
