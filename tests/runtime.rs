//! Natives, monitors, threads, method handles and async requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use jexec::vm::classfile::{ACC_PUBLIC, ACC_STATIC, ACC_SYNCHRONIZED};
use jexec::vm::threads::ASYNC_POP_FRAMES;
use jexec::vm::{FramePopEvent, ThrowableKind};
use jexec::{ClassBuilder, JValue, JavaVM, JitMode, RuntimeConfig};

const PUBLIC_STATIC: u16 = ACC_PUBLIC | ACC_STATIC;

fn vm_with(configure: impl FnOnce(&mut RuntimeConfig)) -> Arc<JavaVM> {
    let mut config = RuntimeConfig::for_testing();
    config.jit_mode = JitMode::Off;
    configure(&mut config);
    JavaVM::new(config).unwrap()
}

// =============================================================================
// Natives
// =============================================================================

fn define_natives(vm: &JavaVM) {
    let class = ClassBuilder::new("demo/Native")
        .native_method("add", "(II)I", PUBLIC_STATIC)
        .native_method("fail", "()V", PUBLIC_STATIC)
        .native_method("twice", "(I)I", PUBLIC_STATIC)
        .native_method("missing", "()I", PUBLIC_STATIC)
        .method("square", "(I)I", PUBLIC_STATIC, "iload_0\n iload_0\n imul\n ireturn")
        .unwrap()
        .method(
            "sum3",
            "(III)I",
            PUBLIC_STATIC,
            "iload_0\n iload_1\n invokestatic demo/Native.add(II)I\n iload_2\n iadd\n ireturn",
        )
        .unwrap()
        .build();
    vm.define_class(class).unwrap();

    vm.register_native("demo/Native", "add", "(II)I", |_env, args| {
        match (args[0], args[1]) {
            (JValue::Int(a), JValue::Int(b)) => JValue::Int(a.wrapping_add(b)),
            _ => JValue::Int(0),
        }
    });
    vm.register_native("demo/Native", "fail", "()V", |env, _args| {
        env.throw_new(ThrowableKind::IllegalArgumentException, Some("bad input"));
        JValue::Void
    });
    vm.register_native("demo/Native", "twice", "(I)I", |env, args| {
        match env.call_static("demo/Native", "square", "(I)I", &args[..1]) {
            Some(JValue::Int(v)) => JValue::Int(v * 2),
            _ => JValue::Int(0),
        }
    });
}

#[test]
fn test_native_called_from_bytecode() {
    let vm = vm_with(|_| {});
    define_natives(&vm);
    let mut thread = vm.attach_thread("main");
    let result = thread
        .call_static(
            "demo/Native",
            "sum3",
            "(III)I",
            &[JValue::Int(1), JValue::Int(2), JValue::Int(3)],
        )
        .unwrap();
    assert_eq!(result, JValue::Int(6));
}

#[test]
fn test_native_exception_propagates() {
    let vm = vm_with(|_| {});
    define_natives(&vm);
    let mut thread = vm.attach_thread("main");
    let error = thread.call_static("demo/Native", "fail", "()V", &[]).unwrap_err();
    let thrown = error.exception().unwrap();
    assert_eq!(thrown.class_name, "java/lang/IllegalArgumentException");
    assert_eq!(thrown.message.as_deref(), Some("bad input"));
}

#[test]
fn test_native_calls_back_into_java() {
    let vm = vm_with(|_| {});
    define_natives(&vm);
    let mut thread = vm.attach_thread("main");
    let result = thread
        .call_static("demo/Native", "twice", "(I)I", &[JValue::Int(7)])
        .unwrap();
    assert_eq!(result, JValue::Int(98));
}

#[test]
fn test_unbound_native_is_unsatisfied_link() {
    let vm = vm_with(|_| {});
    define_natives(&vm);
    let mut thread = vm.attach_thread("main");
    let error = thread.call_static("demo/Native", "missing", "()I", &[]).unwrap_err();
    assert_eq!(
        error.exception().unwrap().class_name,
        "java/lang/UnsatisfiedLinkError"
    );
}

// =============================================================================
// Monitors and threads
// =============================================================================

fn define_counter(vm: &JavaVM) {
    let class = ClassBuilder::new("demo/Counter")
        .field("count", "I", ACC_STATIC)
        .method(
            "bump",
            "()V",
            PUBLIC_STATIC | ACC_SYNCHRONIZED,
            "
            getstatic demo/Counter.count I
            iconst_1
            iadd
            putstatic demo/Counter.count I
            return
            ",
        )
        .unwrap()
        .method(
            "run",
            "(I)V",
            PUBLIC_STATIC,
            "
        loop:
            iload_0
            ifle done
            invokestatic demo/Counter.bump()V
            iinc 0 -1
            goto loop
        done:
            return
            ",
        )
        .unwrap()
        .method("get", "()I", PUBLIC_STATIC, "getstatic demo/Counter.count I\n ireturn")
        .unwrap()
        .method("spin", "()V", PUBLIC_STATIC, "loop:\n goto loop")
        .unwrap()
        .build();
    vm.define_class(class).unwrap();
}

#[test]
fn test_synchronized_static_method_serializes_threads() {
    let vm = vm_with(|_| {});
    define_counter(&vm);
    let handles: Vec<_> = (0..4)
        .map(|_| vm.spawn("demo/Counter", "run", "(I)V", vec![JValue::Int(500)]).unwrap())
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), JValue::Void);
    }
    let mut thread = vm.attach_thread("main");
    let count = thread.call_static("demo/Counter", "get", "()I", &[]).unwrap();
    assert_eq!(count, JValue::Int(2000));
}

#[test]
fn test_stop_request_ends_a_spinning_thread() {
    let vm = vm_with(|_| {});
    define_counter(&vm);
    let handle = vm.spawn("demo/Counter", "spin", "()V", Vec::new()).unwrap();
    handle.stop(ThrowableKind::ThreadDeath, Some("stopped".to_string()));
    let error = handle.join().unwrap_err();
    let thrown = error.exception().unwrap();
    assert_eq!(thrown.class_name, "java/lang/ThreadDeath");
    assert_eq!(thrown.message.as_deref(), Some("stopped"));
}

#[test]
fn test_unbalanced_monitor_exit_is_illegal_state() {
    let vm = vm_with(|_| {});
    let class = ClassBuilder::new("demo/Lock")
        .method(
            "exitOnly",
            "()V",
            PUBLIC_STATIC,
            "new java/lang/Object\n monitorexit\n return",
        )
        .unwrap()
        .build();
    vm.define_class(class).unwrap();
    let mut thread = vm.attach_thread("main");
    let error = thread.call_static("demo/Lock", "exitOnly", "()V", &[]).unwrap_err();
    assert_eq!(
        error.exception().unwrap().class_name,
        "java/lang/IllegalMonitorStateException"
    );
}

#[test]
fn test_failed_synchronized_exit_replaces_the_pending_exception() {
    let vm = vm_with(|_| {});
    let synchronized = ACC_PUBLIC | ACC_SYNCHRONIZED;
    let class = ClassBuilder::new("demo/Released")
        .method("ret", "()V", synchronized, "aload_0\n monitorexit\n return")
        .unwrap()
        .method(
            "thr",
            "()V",
            synchronized,
            "aload_0\n monitorexit\n aconst_null\n athrow",
        )
        .unwrap()
        .build();
    vm.define_class(class).unwrap();
    let mut thread = vm.attach_thread("main");
    let receiver = thread.new_instance("demo/Released").unwrap();

    // Both ways out of the frame report the unbalanced exit.
    for name in ["ret", "thr"] {
        let error = thread.call_virtual(receiver, name, "()V", &[]).unwrap_err();
        assert_eq!(
            error.exception().unwrap().class_name,
            "java/lang/IllegalMonitorStateException",
            "leaving {} through a failed exit",
            name
        );
    }
}

#[test]
fn test_tagged_frames_report_their_pop() {
    let vm = vm_with(|_| {});
    let class = ClassBuilder::new("demo/Watch")
        .native_method("mark", "()V", PUBLIC_STATIC)
        .method(
            "inner",
            "()I",
            PUBLIC_STATIC,
            "invokestatic demo/Watch.mark()V\n iconst_3\n ireturn",
        )
        .unwrap()
        .method(
            "outer",
            "()I",
            PUBLIC_STATIC,
            "invokestatic demo/Watch.inner()I\n iconst_1\n iadd\n ireturn",
        )
        .unwrap()
        .method(
            "innerThrow",
            "()V",
            PUBLIC_STATIC,
            "invokestatic demo/Watch.mark()V\n aconst_null\n athrow",
        )
        .unwrap()
        .method(
            "outerThrow",
            "()V",
            PUBLIC_STATIC,
            "invokestatic demo/Watch.innerThrow()V\n return",
        )
        .unwrap()
        .build();
    vm.define_class(class).unwrap();
    vm.register_native("demo/Watch", "mark", "()V", |env, _args| {
        assert!(env.notify_frame_pop(0));
        assert!(env.notify_frame_pop(1));
        assert!(!env.notify_frame_pop(2));
        JValue::Void
    });
    let event = |method: &str, exceptional| FramePopEvent {
        class_name: "demo/Watch".to_string(),
        method_name: method.to_string(),
        exceptional,
    };
    let mut thread = vm.attach_thread("main");

    let result = thread.call_static("demo/Watch", "outer", "()I", &[]).unwrap();
    assert_eq!(result, JValue::Int(4));
    assert_eq!(
        thread.take_frame_pop_events(),
        vec![event("inner", false), event("outer", false)]
    );

    let error = thread.call_static("demo/Watch", "outerThrow", "()V", &[]).unwrap_err();
    assert_eq!(
        error.exception().unwrap().class_name,
        "java/lang/NullPointerException"
    );
    assert_eq!(
        thread.take_frame_pop_events(),
        vec![event("innerThrow", true), event("outerThrow", true)]
    );
    assert!(thread.take_frame_pop_events().is_empty());
}

// =============================================================================
// Method handles
// =============================================================================

fn define_handles(vm: &JavaVM) {
    let class = ClassBuilder::new("demo/Handles")
        .method("square", "(I)I", PUBLIC_STATIC, "iload_0\n iload_0\n imul\n ireturn")
        .unwrap()
        .method(
            "exact",
            "(Ljava/lang/invoke/MethodHandle;I)I",
            PUBLIC_STATIC,
            "aload_0\n iload_1\n invokevirtual java/lang/invoke/MethodHandle.invokeExact(I)I\n ireturn",
        )
        .unwrap()
        .method(
            "exactLong",
            "(Ljava/lang/invoke/MethodHandle;I)J",
            PUBLIC_STATIC,
            "aload_0\n iload_1\n invokevirtual java/lang/invoke/MethodHandle.invokeExact(I)J\n lreturn",
        )
        .unwrap()
        .method(
            "widened",
            "(Ljava/lang/invoke/MethodHandle;I)J",
            PUBLIC_STATIC,
            "aload_0\n iload_1\n invokevirtual java/lang/invoke/MethodHandle.invoke(I)J\n lreturn",
        )
        .unwrap()
        .build();
    vm.define_class(class).unwrap();
}

#[test]
fn test_method_handle_invocation() {
    let vm = vm_with(|_| {});
    define_handles(&vm);
    let mut thread = vm.attach_thread("main");
    let handle = thread.new_method_handle("demo/Handles", "square", "(I)I").unwrap();
    let args = [JValue::Ref(handle), JValue::Int(6)];

    let exact = thread
        .call_static("demo/Handles", "exact", "(Ljava/lang/invoke/MethodHandle;I)I", &args)
        .unwrap();
    assert_eq!(exact, JValue::Int(36));

    let widened = thread
        .call_static("demo/Handles", "widened", "(Ljava/lang/invoke/MethodHandle;I)J", &args)
        .unwrap();
    assert_eq!(widened, JValue::Long(36));

    let error = thread
        .call_static("demo/Handles", "exactLong", "(Ljava/lang/invoke/MethodHandle;I)J", &args)
        .unwrap_err();
    assert_eq!(
        error.exception().unwrap().class_name,
        "java/lang/invoke/WrongMethodTypeException"
    );
}

// =============================================================================
// Frame pops
// =============================================================================

fn define_pop(vm: &JavaVM) {
    let class = ClassBuilder::new("demo/Pop")
        .native_method("hook", "()V", PUBLIC_STATIC)
        .method("outer", "()I", PUBLIC_STATIC, "invokestatic demo/Pop.inner()I\n ireturn")
        .unwrap()
        .method(
            "inner",
            "()I",
            PUBLIC_STATIC,
            "
            invokestatic demo/Pop.hook()V
            iconst_0
            istore_0
        loop:
            iload_0
            ifne done
            iinc 0 1
            goto loop
        done:
            bipush 7
            ireturn
            ",
        )
        .unwrap()
        .build();
    vm.define_class(class).unwrap();
}

fn register_hook(vm: &JavaVM) -> Arc<AtomicU32> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    vm.register_native("demo/Pop", "hook", "()V", move |env, _args| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            env.thread_shared().raise(ASYNC_POP_FRAMES);
        }
        JValue::Void
    });
    calls
}

#[test]
fn test_pop_frames_reexecutes_the_invoke() {
    let vm = vm_with(|config| config.debug_interpreter = true);
    define_pop(&vm);
    let calls = register_hook(&vm);
    let mut thread = vm.attach_thread("main");
    let result = thread.call_static("demo/Pop", "outer", "()I", &[]).unwrap();
    assert_eq!(result, JValue::Int(7));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_pop_frames_ignored_without_debug_interpreter() {
    let vm = vm_with(|_| {});
    define_pop(&vm);
    let calls = register_hook(&vm);
    let mut thread = vm.attach_thread("main");
    let result = thread.call_static("demo/Pop", "outer", "()I", &[]).unwrap();
    assert_eq!(result, JValue::Int(7));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
