//! Interpreter/compiled-code transitions observed through the public API.

#![cfg(feature = "jit")]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use jexec::jit::template::TemplateCompiler;
use jexec::jit::{CompiledCode, JitCompiler, JitError, JitResult};
use jexec::vm::classfile::{ACC_PUBLIC, ACC_STATIC};
use jexec::vm::stack::HeapSegmentProvider;
use jexec::vm::{Method, RunState, SendTarget};
use jexec::{ClassBuilder, JValue, JavaVM, JitMode, RuntimeConfig};

const PUBLIC_STATIC: u16 = ACC_PUBLIC | ACC_STATIC;

fn jit_vm(threshold: u32) -> Arc<JavaVM> {
    let mut config = RuntimeConfig::for_testing();
    config.jit_mode = JitMode::On;
    config.jit_threshold = threshold;
    JavaVM::new(config).unwrap()
}

fn define_math(vm: &JavaVM) {
    let math = ClassBuilder::new("demo/Math")
        .method("square", "(I)I", PUBLIC_STATIC, "iload_0\n iload_0\n imul\n ireturn")
        .unwrap()
        .method(
            "sumSquares",
            "(I)I",
            PUBLIC_STATIC,
            "
            iconst_0
            istore_1
        loop:
            iload_0
            ifle done
            iload_1
            iload_0
            invokestatic demo/Math.square(I)I
            iadd
            istore_1
            iinc 0 -1
            goto loop
        done:
            iload_1
            ireturn
            ",
        )
        .unwrap()
        .method(
            "outer",
            "(I)I",
            PUBLIC_STATIC,
            "
            iload_0
            ifeq skip
            iload_0
            invokestatic demo/Math.inner(I)I
            ireturn
        skip:
            iconst_0
            ireturn
            ",
        )
        .unwrap()
        .method("inner", "(I)I", PUBLIC_STATIC, "iload_0\n bipush 10\n iadd\n ireturn")
        .unwrap()
        .method("div", "(II)I", PUBLIC_STATIC, "iload_0\n iload_1\n idiv\n ireturn")
        .unwrap()
        .method(
            "guarded",
            "(II)I",
            PUBLIC_STATIC,
            "
        start:
            iload_0
            iload_1
            invokestatic demo/Math.div(II)I
            ireturn
        end:
        handler:
            pop
            iconst_m1
            ireturn
            .catch java/lang/ArithmeticException from start to end using handler
            ",
        )
        .unwrap()
        .build();
    vm.define_class(math).unwrap();
}

#[test]
fn test_compiled_caller_redirects_to_freshly_compiled_callee() {
    let vm = jit_vm(3);
    define_math(&vm);
    let mut thread = vm.attach_thread("main");

    // Make `outer` hot without ever calling `inner`.
    for _ in 0..4 {
        assert_eq!(
            thread.call_static("demo/Math", "outer", "(I)I", &[JValue::Int(0)]).unwrap(),
            JValue::Int(0)
        );
    }
    let outer = vm.find_method("demo/Math", "outer", "(I)I").unwrap();
    assert!(matches!(outer.run_target.load(), RunState::Compiled(_)));

    for n in 1..=5 {
        assert_eq!(
            thread.call_static("demo/Math", "outer", "(I)I", &[JValue::Int(n)]).unwrap(),
            JValue::Int(n + 10)
        );
    }
    let inner = vm.find_method("demo/Math", "inner", "(I)I").unwrap();
    assert!(matches!(inner.run_target.load(), RunState::Compiled(_)));
    let stats = vm.stats().transitions;
    assert_eq!(stats.j2i_redirects, 1);
    assert_eq!(stats.j2i, 3);
    assert!(stats.j2j >= 1);
}

#[test]
fn test_racing_threads_compile_each_method_once() {
    let vm = jit_vm(2);
    define_math(&vm);
    // Link and initialize the class before the threads race on it.
    let mut main = vm.attach_thread("main");
    main.call_static("demo/Math", "square", "(I)I", &[JValue::Int(1)]).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            vm.spawn("demo/Math", "sumSquares", "(I)I", vec![JValue::Int(50)])
                .unwrap()
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), JValue::Int(42925));
    }

    let stats = vm.stats();
    assert_eq!(stats.transitions.compile_failures, 0);
    assert!(stats.transitions.compiles <= 2);
    assert_eq!(stats.compiled_methods as u64, stats.transitions.compiles);
    let square = vm.find_method("demo/Math", "square", "(I)I").unwrap();
    assert!(matches!(square.run_target.load(), RunState::Compiled(_)));
}

#[test]
fn test_exception_from_compiled_code_reaches_interpreted_handler() {
    let vm = jit_vm(2);
    define_math(&vm);
    let mut thread = vm.attach_thread("main");
    for _ in 0..4 {
        assert_eq!(
            thread
                .call_static("demo/Math", "guarded", "(II)I", &[JValue::Int(9), JValue::Int(3)])
                .unwrap(),
            JValue::Int(3)
        );
    }
    let div = vm.find_method("demo/Math", "div", "(II)I").unwrap();
    assert!(matches!(div.run_target.load(), RunState::Compiled(_)));

    let caught = thread
        .call_static("demo/Math", "guarded", "(II)I", &[JValue::Int(9), JValue::Int(0)])
        .unwrap();
    assert_eq!(caught, JValue::Int(-1));

    let error = thread
        .call_static("demo/Math", "div", "(II)I", &[JValue::Int(9), JValue::Int(0)])
        .unwrap_err();
    assert_eq!(
        error.exception().unwrap().class_name,
        "java/lang/ArithmeticException"
    );
}

#[test]
fn test_method_with_handlers_stays_interpreted() {
    let vm = jit_vm(1);
    define_math(&vm);
    let mut thread = vm.attach_thread("main");
    for _ in 0..4 {
        thread
            .call_static("demo/Math", "guarded", "(II)I", &[JValue::Int(4), JValue::Int(2)])
            .unwrap();
    }
    let guarded = vm.find_method("demo/Math", "guarded", "(II)I").unwrap();
    assert_eq!(guarded.run_target.load(), RunState::Send(SendTarget::Interpreted));
    assert!(vm.stats().transitions.compile_failures >= 1);
}

#[test]
fn test_jit_off_never_leaves_the_interpreter() {
    let mut config = RuntimeConfig::for_testing();
    config.jit_mode = JitMode::Off;
    let vm = JavaVM::new(config).unwrap();
    define_math(&vm);
    let mut thread = vm.attach_thread("main");
    for _ in 0..5 {
        assert_eq!(
            thread.call_static("demo/Math", "sumSquares", "(I)I", &[JValue::Int(4)]).unwrap(),
            JValue::Int(30)
        );
    }
    let stats = vm.stats();
    assert_eq!(stats.compiled_methods, 0);
    assert_eq!(stats.transitions.i2j, 0);
    assert_eq!(stats.transitions.compiles, 0);
}

// =============================================================================
// Deoptimization
// =============================================================================

fn define_hierarchy(vm: &Arc<JavaVM>, armed: Arc<AtomicBool>) {
    let base = ClassBuilder::new("demo/Base")
        .method("value", "()I", ACC_PUBLIC, "iconst_1\n ireturn")
        .unwrap()
        .build();
    let hook = ClassBuilder::new("demo/Hook")
        .native_method("define", "()V", PUBLIC_STATIC)
        .build();
    let caller = ClassBuilder::new("demo/Caller")
        .method(
            "run",
            "(Ldemo/Base;)I",
            PUBLIC_STATIC,
            "
            aload_0
            invokevirtual demo/Base.value()I
            invokestatic demo/Hook.define()V
            aload_0
            invokevirtual demo/Base.value()I
            iadd
            ireturn
            ",
        )
        .unwrap()
        .build();
    for class in [base, hook, caller] {
        vm.define_class(class).unwrap();
    }

    vm.register_native("demo/Hook", "define", "()V", move |env, _args| {
        if armed.swap(false, Ordering::SeqCst) {
            let derived = ClassBuilder::new("demo/Derived")
                .super_class("demo/Base")
                .method("value", "()I", ACC_PUBLIC, "iconst_5\n ireturn")
                .unwrap()
                .build();
            env.vm().define_class(derived).unwrap();
        }
        JValue::Void
    });
}

#[test]
fn test_class_defined_mid_call_deoptimizes_the_active_frame() {
    let vm = jit_vm(2);
    let armed = Arc::new(AtomicBool::new(false));
    define_hierarchy(&vm, Arc::clone(&armed));
    let mut thread = vm.attach_thread("main");
    let base = thread.new_instance("demo/Base").unwrap();
    let call = |thread: &mut jexec::VmThread, receiver| {
        thread
            .call_static("demo/Caller", "run", "(Ldemo/Base;)I", &[JValue::Ref(receiver)])
            .unwrap()
    };

    for _ in 0..4 {
        assert_eq!(call(&mut thread, base), JValue::Int(2));
    }
    let run = vm.find_method("demo/Caller", "run", "(Ldemo/Base;)I").unwrap();
    assert!(matches!(run.run_target.load(), RunState::Compiled(_)));

    armed.store(true, Ordering::SeqCst);
    assert_eq!(call(&mut thread, base), JValue::Int(2));
    let stats = vm.stats().transitions;
    assert_eq!(stats.deoptimizations, 1);
    assert!(stats.invalidations >= 1);
    assert!(!matches!(run.run_target.load(), RunState::Compiled(_)));

    // The override is dispatched to once the frame runs interpreted.
    let derived = thread.new_instance("demo/Derived").unwrap();
    assert_eq!(call(&mut thread, derived), JValue::Int(10));
    assert_eq!(call(&mut thread, base), JValue::Int(2));
}

/// Defines `demo/Derived` right after compiling `demo/User.call`, before the
/// body is installed.
struct DefiningCompiler {
    inner: TemplateCompiler,
    armed: AtomicBool,
}

impl JitCompiler for DefiningCompiler {
    fn name(&self) -> &str {
        "defining"
    }

    fn compile(&self, vm: &JavaVM, method: &Arc<Method>) -> JitResult<CompiledCode> {
        let code = self.inner.compile(vm, method)?;
        if method.name == "call" && self.armed.swap(false, Ordering::SeqCst) {
            let derived = ClassBuilder::new("demo/Derived")
                .super_class("demo/Base")
                .method("name", "()I", ACC_PUBLIC, "iconst_2\n ireturn")
                .unwrap()
                .build();
            vm.define_class(derived)
                .map_err(|e| JitError::UnsupportedMethod(e.to_string()))?;
        }
        Ok(code)
    }
}

#[test]
fn test_class_defined_during_compile_discards_the_new_body() {
    let mut config = RuntimeConfig::for_testing();
    config.jit_mode = JitMode::On;
    config.jit_threshold = 2;
    let compiler = DefiningCompiler {
        inner: TemplateCompiler::new(),
        armed: AtomicBool::new(true),
    };
    let vm = JavaVM::new_with(config, Some(Box::new(compiler)), Box::new(HeapSegmentProvider))
        .unwrap();
    let base = ClassBuilder::new("demo/Base")
        .method("name", "()I", ACC_PUBLIC, "iconst_1\n ireturn")
        .unwrap()
        .build();
    let user = ClassBuilder::new("demo/User")
        .method(
            "call",
            "(Ldemo/Base;)I",
            PUBLIC_STATIC,
            "aload_0\n invokevirtual demo/Base.name()I\n ireturn",
        )
        .unwrap()
        .build();
    vm.define_class(base).unwrap();
    vm.define_class(user).unwrap();

    let mut thread = vm.attach_thread("main");
    let base = thread.new_instance("demo/Base").unwrap();
    for _ in 0..4 {
        assert_eq!(
            thread
                .call_static("demo/User", "call", "(Ldemo/Base;)I", &[JValue::Ref(base)])
                .unwrap(),
            JValue::Int(1)
        );
    }
    let call = vm.find_method("demo/User", "call", "(Ldemo/Base;)I").unwrap();
    assert!(!matches!(call.run_target.load(), RunState::Compiled(_)));
    assert!(vm.stats().transitions.invalidations >= 1);

    let derived = thread.new_instance("demo/Derived").unwrap();
    for _ in 0..4 {
        assert_eq!(
            thread
                .call_static("demo/User", "call", "(Ldemo/Base;)I", &[JValue::Ref(derived)])
                .unwrap(),
            JValue::Int(2)
        );
    }
}
